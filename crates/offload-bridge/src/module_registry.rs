//! Out-of-band registry mapping opaque handles to live modules.
//!
//! Boundary nodes must reference the module they belong to so shape
//! inference can consult live residency state at graph-construction time.
//! Instead of smuggling a pointer through node attributes, the bridge
//! assigns each (engine, module) pair a stable integer handle here and the
//! inference callback looks the module up by that handle.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::engine::OffloadEngine;

/// Opaque module reference embedded in boundary node attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

struct Registered<E: OffloadEngine> {
    engine: Arc<E>,
    module: E::Module,
}

#[derive(Default)]
struct RegistryInner {
    by_key: HashMap<(TypeId, u64), ModuleHandle>,
    entries: HashMap<u64, Box<dyn Any + Send + Sync>>,
    next: u64,
}

static MODULES: OnceLock<Mutex<RegistryInner>> = OnceLock::new();

fn registry() -> &'static Mutex<RegistryInner> {
    MODULES.get_or_init(|| Mutex::new(RegistryInner::default()))
}

/// Assigns (or reuses) the handle for `module`, keyed by the engine's stable
/// module identity.
pub fn register_module<E: OffloadEngine>(engine: &Arc<E>, module: &E::Module) -> ModuleHandle {
    let key = (TypeId::of::<E>(), engine.module_key(module));
    let mut inner = registry().lock().expect("module registry poisoned");
    if let Some(existing) = inner.by_key.get(&key) {
        return *existing;
    }
    let handle = ModuleHandle(inner.next);
    inner.next += 1;
    inner.entries.insert(
        handle.0,
        Box::new(Registered::<E> {
            engine: Arc::clone(engine),
            module: module.clone(),
        }),
    );
    inner.by_key.insert(key, handle);
    handle
}

/// Resolves a handle back to its engine and module.
///
/// Returns `None` for handles never registered or registered by a different
/// engine type.
pub fn resolve_module<E: OffloadEngine>(handle: ModuleHandle) -> Option<(Arc<E>, E::Module)> {
    let inner = registry().lock().expect("module registry poisoned");
    let entry = inner.entries.get(&handle.0)?;
    let registered = entry.downcast_ref::<Registered<E>>()?;
    Some((Arc::clone(&registered.engine), registered.module.clone()))
}
