//! Trait seams for the external parameter-offload engine.
//!
//! The bridge never owns device placement or parameter storage; it talks to
//! the offload engine through the traits below, the same way the rest of the
//! stack talks to compute backends through a portable backend trait. The
//! engine decides which parameters are resident, the bridge only reads that
//! state — freshly on every boundary crossing.

use std::fmt;

/// Logical dtype identifier shared between boundary tensors and parameter handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 16-bit floating point with full mantissa (fp16).
    F16,
    /// 16-bit bfloat16 precision as used by many accelerators.
    BF16,
    /// 32-bit signed integer, primarily for index buffers and token ids.
    I32,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I32 => 4,
        }
    }
}

/// Whether a parameter's backing storage is currently materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Resident,
    NotAvailable,
}

/// Tensor handle crossing the bridge boundary.
///
/// Handles are expected to be cheap to clone (reference-counted); the bridge
/// clones them freely while flattening and re-flattening nested structures.
pub trait TensorValue: Clone + fmt::Debug + Send + Sync + 'static {
    fn shape(&self) -> &[usize];

    fn dtype(&self) -> DType;

    fn requires_grad(&self) -> bool;

    /// Returns a handle detached from any recorded history, with gradient
    /// tracking re-marked to `requires_grad`.
    fn detached(&self, requires_grad: bool) -> Self;

    /// Constructs a zero-filled tensor, used to fabricate gradients for
    /// synthetic parameter operands.
    fn zeros(shape: &[usize], dtype: DType) -> Self;
}

/// Handle to a parameter owned by the offload engine.
///
/// `tensor()` reflects the live backing storage: a placeholder while the
/// parameter is offloaded, the full-size tensor once the engine has
/// materialized it. Residency is mutated exclusively by the engine's own
/// hooks; the bridge re-reads it instead of caching.
pub trait ParamHandle: Clone + fmt::Debug + Send + Sync + 'static {
    type Tensor: TensorValue;

    fn name(&self) -> String;

    fn residency(&self) -> Residency;

    fn shape(&self) -> Vec<usize>;

    fn dtype(&self) -> DType;

    fn requires_grad(&self) -> bool;

    /// Current backing tensor for the parameter.
    fn tensor(&self) -> Self::Tensor;
}

/// External parameter-offload engine.
pub trait OffloadEngine: Send + Sync + 'static {
    type Tensor: TensorValue;
    type Param: ParamHandle<Tensor = Self::Tensor>;
    type Module: Clone + fmt::Debug + Send + Sync + 'static;

    /// Parameters in the module's own declared scope, in the engine's stable
    /// iteration order. Submodules report their own parameters separately.
    fn iterate_parameters(&self, module: &Self::Module) -> Vec<Self::Param>;

    /// Human-readable module identity used in diagnostics.
    fn module_name(&self, module: &Self::Module) -> String;

    /// Stable identity key for the module, used when assigning opaque
    /// handles at bridge-construction time. Must not change while the
    /// module is alive.
    fn module_key(&self, module: &Self::Module) -> u64;
}
