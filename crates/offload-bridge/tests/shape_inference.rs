use std::sync::{Arc, Mutex};

use anyhow::Result;
use offload_bridge::graph::{
    register_bridge_nodes, BoundaryNodeDecl, Dim, GraphCompiler, GraphDType, ShapeSlot,
    POST_FORWARD_TARGET, PRE_FORWARD_TARGET,
};
use offload_bridge::infer::{infer_post_forward_shapes, infer_pre_forward_shapes};
use offload_bridge::schema::{flatten, Value};
use offload_bridge::{BoundaryOp, PreForwardBridge};
use offload_bridge_engine_ref::{RefEngine, RefModule, RefParam, RefTensor};

fn tensor(shape: &[usize], fill: f32) -> RefTensor {
    let len = shape.iter().product();
    RefTensor::from_vec(shape.to_vec(), vec![fill; len]).expect("tensor construction")
}

fn args_schemas(
    count: usize,
) -> Result<(offload_bridge::Schema, offload_bridge::Schema)> {
    let args: Value<RefTensor> =
        Value::seq((0..count).map(|_| Value::Tensor(tensor(&[2], 0.0))).collect::<Vec<_>>());
    let kwargs: Value<RefTensor> = Value::map(Vec::new());
    Ok((flatten(&args)?.1, flatten(&kwargs)?.1))
}

#[test]
fn trailing_synthetic_slots_get_true_shapes() -> Result<()> {
    let engine = Arc::new(RefEngine::new());
    let p1 = RefParam::offloaded("attn.weight", vec![4, 4], vec![0.0; 16])?;
    let p2 = RefParam::offloaded("attn.bias", vec![8], vec![0.0; 8])?;
    let resident = RefParam::resident("attn.scale", vec![2], vec![1.0; 2])?;
    let module = RefModule::new("attn", vec![p1, p2, resident]);

    let (args_schema, kwargs_schema) = args_schemas(3)?;
    let op = PreForwardBridge::new(
        Arc::clone(&engine),
        module,
        None,
        None,
        args_schema,
        kwargs_schema,
        2,
    );

    let shapes: Vec<ShapeSlot> = vec![
        Some(vec![Dim::Static(2)]),
        Some(vec![Dim::Sym("B".to_string())]),
        Some(vec![Dim::Static(2)]),
        None,
        None,
    ];
    let dtypes = vec![GraphDType::F32; 5];
    let (out_shapes, out_dtypes) = infer_pre_forward_shapes::<RefEngine>(&op.node(), shapes.clone(), dtypes)?;

    // Leading slots untouched.
    assert_eq!(out_shapes[..3], shapes[..3]);
    assert_eq!(
        out_shapes[3],
        Some(vec![Dim::Static(4), Dim::Static(4)])
    );
    assert_eq!(out_shapes[4], Some(vec![Dim::Static(8)]));
    assert_eq!(out_dtypes, vec![GraphDType::F32; 5]);
    Ok(())
}

#[test]
fn residency_divergence_fails_inference() -> Result<()> {
    let engine = Arc::new(RefEngine::new());
    let p1 = RefParam::offloaded("ff.w1", vec![4], vec![0.0; 4])?;
    let p2 = RefParam::offloaded("ff.w2", vec![4], vec![0.0; 4])?;
    let module = RefModule::new("ff", vec![p1.clone(), p2]);

    let (args_schema, kwargs_schema) = args_schemas(1)?;
    let op = PreForwardBridge::new(
        Arc::clone(&engine),
        module,
        None,
        None,
        args_schema,
        kwargs_schema,
        2,
    );

    // The offload engine materialized one parameter after the node was
    // built; the operand layout no longer matches live state.
    p1.fetch();

    let shapes: Vec<ShapeSlot> = vec![Some(vec![Dim::Static(2)]), None, None];
    let dtypes = vec![GraphDType::F32; 3];
    let err = infer_pre_forward_shapes::<RefEngine>(&op.node(), shapes, dtypes).unwrap_err();
    assert!(err.to_string().contains("synthetic operands"));
    Ok(())
}

#[test]
fn post_forward_inference_passes_through() -> Result<()> {
    let node = offload_bridge::BoundaryNodeSpec::new(POST_FORWARD_TARGET);
    let shapes: Vec<ShapeSlot> = vec![Some(vec![Dim::Static(3)]), None];
    let dtypes = vec![GraphDType::F32, GraphDType::Si32];
    let (out_shapes, out_dtypes) = infer_post_forward_shapes(&node, shapes.clone(), dtypes.clone())?;
    assert_eq!(out_shapes, shapes);
    assert_eq!(out_dtypes, dtypes);
    Ok(())
}

#[test]
fn bridge_registers_both_node_types() -> Result<()> {
    #[derive(Default)]
    struct RecordingCompiler {
        decls: Mutex<Vec<(&'static str, bool)>>,
    }

    impl GraphCompiler for RecordingCompiler {
        fn register_boundary_node(&self, decl: BoundaryNodeDecl) -> Result<()> {
            self.decls
                .lock()
                .expect("compiler mutex poisoned")
                .push((decl.target, decl.dynamic_outputs));
            Ok(())
        }
    }

    let compiler = RecordingCompiler::default();
    register_bridge_nodes::<RefEngine>(&compiler)?;

    let decls = compiler.decls.lock().expect("compiler mutex poisoned").clone();
    assert_eq!(decls.len(), 2);
    // Only the pre-forward node has output arity resolved from live state.
    assert!(decls.contains(&(PRE_FORWARD_TARGET, true)));
    assert!(decls.contains(&(POST_FORWARD_TARGET, false)));
    Ok(())
}
