//! Fresh residency queries against the offload engine.

use crate::engine::{OffloadEngine, ParamHandle, Residency};

/// Parameters in the module's own scope whose storage is not currently
/// available, in the engine's stable iteration order.
///
/// Recomputed on every boundary crossing and never cached: a hook nested
/// inside one bridge call can materialize or release storage that a later
/// bridge call in the same pass must observe.
pub fn missing_params<E: OffloadEngine>(engine: &E, module: &E::Module) -> Vec<E::Param> {
    engine
        .iterate_parameters(module)
        .into_iter()
        .filter(|param| param.residency() == Residency::NotAvailable)
        .collect()
}
