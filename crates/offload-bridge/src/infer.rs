//! Graph-compile-time shape and dtype inference for the boundary nodes.

use anyhow::{anyhow, ensure, Result};

use crate::engine::{OffloadEngine, ParamHandle};
use crate::graph::{
    check_inference_lists, graph_dtype, static_shape, BoundaryNodeSpec, GraphDType, ShapeSlot,
    ATTR_FORCED_PARAM_COUNT, ATTR_MODULE_HANDLE,
};
use crate::module_registry::{resolve_module, ModuleHandle};
use crate::resolver;

/// Inference callback for the pre-forward node.
///
/// Resolves the live module through the handle registry, recomputes its
/// offloaded parameters, and overwrites the trailing synthetic output slots
/// with each parameter's true shape and dtype. Residency may have changed
/// since the node was created, but the synthetic operand count must still
/// match what the node was built with; divergence means the graph can no
/// longer be trusted.
pub fn infer_pre_forward_shapes<E: OffloadEngine>(
    node: &BoundaryNodeSpec,
    shapes: Vec<ShapeSlot>,
    dtypes: Vec<GraphDType>,
) -> Result<(Vec<ShapeSlot>, Vec<GraphDType>)> {
    check_inference_lists(&shapes, &dtypes)?;

    let handle = ModuleHandle(node.attr_i64(ATTR_MODULE_HANDLE)? as u64);
    let forced = node.attr_i64(ATTR_FORCED_PARAM_COUNT)? as usize;
    let (engine, module) = resolve_module::<E>(handle)
        .ok_or_else(|| anyhow!("module handle {} is not registered", handle.0))?;

    let missing = resolver::missing_params(&*engine, &module);
    ensure!(
        missing.len() == forced,
        "module `{}` now reports {} offloaded parameters but the boundary node was built with {} synthetic operands",
        engine.module_name(&module),
        missing.len(),
        forced,
    );
    ensure!(
        shapes.len() >= missing.len(),
        "boundary node for module `{}` has {} output slots, fewer than {} synthetic operands",
        engine.module_name(&module),
        shapes.len(),
        missing.len(),
    );

    let mut out_shapes = shapes;
    let mut out_dtypes = dtypes;
    let start = out_shapes.len() - missing.len();
    for (offset, param) in missing.iter().enumerate() {
        out_shapes[start + offset] = Some(static_shape(&param.shape()));
        out_dtypes[start + offset] = graph_dtype(param.dtype());
    }
    Ok((out_shapes, out_dtypes))
}

/// Inference callback for the post-forward node: shapes and dtypes pass
/// through unchanged.
pub fn infer_post_forward_shapes(
    _node: &BoundaryNodeSpec,
    shapes: Vec<ShapeSlot>,
    dtypes: Vec<GraphDType>,
) -> Result<(Vec<ShapeSlot>, Vec<GraphDType>)> {
    check_inference_lists(&shapes, &dtypes)?;
    Ok((shapes, dtypes))
}
