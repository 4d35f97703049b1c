//! Graph-compiler-facing declarations for the boundary node types.
//!
//! The graph-compiled runtime sees the bridge as two opaque differentiable
//! nodes with tensor-in/tensor-out semantics. Node attributes are limited to
//! simple primitives so they stay easy to serialize, hash, and validate.

use std::collections::BTreeMap;

use anyhow::{anyhow, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::engine::{DType, OffloadEngine};

/// Target name of the pre-forward boundary node.
pub const PRE_FORWARD_TARGET: &str = "offload_bridge.pre_forward";
/// Target name of the post-forward boundary node.
pub const POST_FORWARD_TARGET: &str = "offload_bridge.post_forward";

/// Attribute carrying the opaque module handle, resolved through the module
/// registry during shape inference.
pub const ATTR_MODULE_HANDLE: &str = "module_handle";
/// Attribute recording the number of flattened positional-argument tensors.
pub const ATTR_ARGS_TENSOR_COUNT: &str = "args_tensor_count";
/// Attribute recording the number of flattened keyword-argument tensors.
pub const ATTR_KWARGS_TENSOR_COUNT: &str = "kwargs_tensor_count";
/// Attribute recording how many trailing operands are synthetic
/// residency-forcing parameter slots.
pub const ATTR_FORCED_PARAM_COUNT: &str = "forced_param_count";

/// Scalar element types in the graph compiler's representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphDType {
    F32,
    F16,
    Bf16,
    Si32,
}

/// Maps a boundary tensor dtype into the graph compiler's representation.
pub fn graph_dtype(dtype: DType) -> GraphDType {
    match dtype {
        DType::F32 => GraphDType::F32,
        DType::F16 => GraphDType::F16,
        DType::BF16 => GraphDType::Bf16,
        DType::I32 => GraphDType::Si32,
    }
}

/// Single axis extent in a graph-level shape, possibly symbolic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Static(usize),
    Sym(String),
}

/// Shape slot in an inference list; `None` when the compiler has no shape
/// information for the operand yet.
pub type ShapeSlot = Option<Vec<Dim>>;

/// Converts concrete dimensions into graph-level static dims.
pub fn static_shape(dims: &[usize]) -> Vec<Dim> {
    dims.iter().copied().map(Dim::Static).collect()
}

/// Attribute payload for boundary nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum AttrValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
    I64Array(Vec<i64>),
    StrArray(Vec<String>),
}

/// Declarative payload of a boundary node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryNodeSpec {
    pub target: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

impl BoundaryNodeSpec {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: AttrValue) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    /// Reads an integer attribute, failing when absent or of another kind.
    pub fn attr_i64(&self, name: &str) -> Result<i64> {
        match self.attrs.get(name) {
            Some(AttrValue::I64(value)) => Ok(*value),
            Some(other) => Err(anyhow!(
                "attribute `{name}` on `{}` holds {other:?}, expected an i64",
                self.target
            )),
            None => Err(anyhow!("attribute `{name}` missing on `{}`", self.target)),
        }
    }
}

/// Shape/dtype inference callback invoked by the compiler at
/// graph-construction time, not execution time.
pub type InferShapeFn =
    fn(&BoundaryNodeSpec, Vec<ShapeSlot>, Vec<GraphDType>) -> Result<(Vec<ShapeSlot>, Vec<GraphDType>)>;

/// Declaration of a differentiable boundary node type.
pub struct BoundaryNodeDecl {
    pub target: &'static str,
    /// Whether output arity is only known at inference time using live state.
    pub dynamic_outputs: bool,
    pub infer: InferShapeFn,
}

/// Registration surface the external graph compiler exposes to the bridge.
pub trait GraphCompiler {
    fn register_boundary_node(&self, decl: BoundaryNodeDecl) -> Result<()>;
}

/// Differentiable boundary operation executed as an opaque graph node.
///
/// Non-tensor context (module handle, hook references, schemas, counts)
/// lives in the node attributes and the op instance itself, so the backward
/// procedure returns exactly one gradient per tensor operand.
pub trait BoundaryOp<E: OffloadEngine>: Send + Sync {
    fn node(&self) -> BoundaryNodeSpec;

    fn forward(&self, tensors: &[E::Tensor]) -> Result<Vec<E::Tensor>>;

    fn backward(&self, grads: &[E::Tensor]) -> Result<Vec<E::Tensor>>;
}

/// Registers the two bridge node types with the compiler.
pub fn register_bridge_nodes<E: OffloadEngine>(compiler: &dyn GraphCompiler) -> Result<()> {
    compiler.register_boundary_node(BoundaryNodeDecl {
        target: PRE_FORWARD_TARGET,
        dynamic_outputs: true,
        infer: crate::infer::infer_pre_forward_shapes::<E>,
    })?;
    compiler.register_boundary_node(BoundaryNodeDecl {
        target: POST_FORWARD_TARGET,
        dynamic_outputs: false,
        infer: crate::infer::infer_post_forward_shapes,
    })?;
    Ok(())
}

/// Validates that shape and dtype inference lists stay paired.
pub(crate) fn check_inference_lists(shapes: &[ShapeSlot], dtypes: &[GraphDType]) -> Result<()> {
    ensure!(
        shapes.len() == dtypes.len(),
        "inference lists diverged: {} shapes vs {} dtypes",
        shapes.len(),
        dtypes.len()
    );
    Ok(())
}
