use std::sync::Arc;

use anyhow::Result;
use offload_bridge::engine::{ParamHandle, Residency, TensorValue};
use offload_bridge::graph::BoundaryOp;
use offload_bridge::hooks::{collect_hook_functions, BoundHooks, HookKind};
use offload_bridge::schema::{flatten, Value};
use offload_bridge::{OffloadSubscriber, PreForwardBridge, RunState};
use offload_bridge_engine_ref::{RefController, RefEngine, RefHookProvider, RefModule, RefParam, RefTensor};

fn tensor(shape: &[usize], fill: f32) -> RefTensor {
    let len = shape.iter().product();
    RefTensor::from_vec(shape.to_vec(), vec![fill; len]).expect("tensor construction")
}

fn setup() -> (Arc<RefEngine>, Arc<RefController>) {
    collect_hook_functions::<RefEngine, _>(&RefHookProvider);
    (Arc::new(RefEngine::new()), Arc::new(RefController::new()))
}

#[test]
fn pre_forward_bridge_forces_offloaded_param() -> Result<()> {
    let (engine, controller) = setup();
    let param = RefParam::offloaded("block.weight", vec![5], vec![0.5; 5])?;
    let module = RefModule::new("block", vec![param.clone()]);

    let hooks = BoundHooks::<RefEngine>::bind(Arc::clone(&controller))?;

    let args: Value<RefTensor> = Value::seq(vec![
        Value::Tensor(tensor(&[2, 3], 1.0)),
        Value::Tensor(tensor(&[2, 3], 2.0)),
    ]);
    let kwargs: Value<RefTensor> = Value::map(Vec::new());
    let (args_tensors, args_schema) = flatten(&args)?;
    let (kwargs_tensors, kwargs_schema) = flatten(&kwargs)?;

    let op = PreForwardBridge::new(
        Arc::clone(&engine),
        module.clone(),
        Some(hooks.get(HookKind::PreForwardModule)?),
        Some(hooks.get(HookKind::PostBackwardModule)?),
        args_schema,
        kwargs_schema,
        1,
    );

    let mut operands = args_tensors;
    operands.extend(kwargs_tensors);
    operands.push(param.tensor());
    assert!(operands[2].is_placeholder());

    let rets = op.forward(&operands)?;

    // Two reconstructed args plus one detached parameter placeholder slot,
    // now full-sized because the hook materialized the parameter.
    assert_eq!(rets.len(), 3);
    assert_eq!(rets[2].shape(), &[5]);
    assert_eq!(rets[2].values(), &[0.5; 5]);
    assert!(rets[2].requires_grad());
    assert_eq!(param.residency(), Residency::Resident);
    assert!(controller
        .events()
        .contains(&"fetch:block.weight".to_string()));

    // Backward: two pass-through gradients, one zero tensor of the
    // parameter's shape regardless of the upstream gradient supplied.
    let grads = vec![
        tensor(&[2, 3], 0.1),
        tensor(&[2, 3], 0.2),
        tensor(&[5], 9.0),
    ];
    let out = op.backward(&grads)?;
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].values(), grads[0].values());
    assert_eq!(out[1].values(), grads[1].values());
    assert_eq!(out[2].shape(), &[5]);
    assert_eq!(out[2].values(), &[0.0; 5]);
    Ok(())
}

#[test]
fn pre_forward_bridge_rejects_empty_output() -> Result<()> {
    let (engine, controller) = setup();
    let module = RefModule::new("stateless", Vec::new());
    let hooks = BoundHooks::<RefEngine>::bind(Arc::clone(&controller))?;

    let args: Value<RefTensor> = Value::seq(Vec::new());
    let kwargs: Value<RefTensor> = Value::map(Vec::new());
    let (_, args_schema) = flatten(&args)?;
    let (_, kwargs_schema) = flatten(&kwargs)?;

    let op = PreForwardBridge::new(
        engine,
        module,
        Some(hooks.get(HookKind::PreForwardModule)?),
        None,
        args_schema,
        kwargs_schema,
        0,
    );

    let err = op.forward(&[]).unwrap_err();
    assert!(err.to_string().contains("empty tensor output"));
    Ok(())
}

#[test]
fn subscriber_roundtrip_with_nested_modules() -> Result<()> {
    let (engine, controller) = setup();
    let param = RefParam::offloaded("inner.weight", vec![5], vec![1.0; 5])?;
    let inner = RefModule::new("inner", vec![param.clone()]);
    let outer = RefModule::new("outer", Vec::new());

    let subscriber = OffloadSubscriber::new(Arc::clone(&engine), Arc::clone(&controller))?;
    let mut run_state = RunState::<RefEngine>::new();
    run_state.begin_step();

    let args: Value<RefTensor> = Value::seq(vec![Value::Tensor(tensor(&[2, 3], 1.0))]);
    let kwargs: Value<RefTensor> = Value::map(Vec::new());

    let (updated_args, _updated_kwargs) =
        subscriber.pre_forward_module_apply(&mut run_state, &inner, args, kwargs)?;
    assert_eq!(updated_args.tensor_leaf_count(), 1);
    assert_eq!(run_state.depth, 1);
    assert_eq!(param.residency(), Residency::Resident);

    // Stand-in for the module body.
    let outputs: Value<RefTensor> = Value::seq(vec![Value::Tensor(tensor(&[2, 3], 3.0))]);
    let (_, updated_outputs) =
        subscriber.post_forward_module_apply(&mut run_state, &inner, Value::seq(Vec::new()), outputs)?;
    // The post-forward hook released the managed parameter.
    assert_eq!(param.residency(), Residency::NotAvailable);

    let (_, final_outputs) = subscriber.post_forward_outermost_module_apply(
        &mut run_state,
        &outer,
        Value::seq(Vec::new()),
        updated_outputs,
    )?;
    assert_eq!(final_outputs.tensor_leaf_count(), 1);
    assert!(controller.events().contains(&"end-of-forward:outer".to_string()));

    // Standard reverse-order traversal: outermost post-forward bridge runs
    // first on the backward pass.
    let recorded = run_state.recorded_ops().to_vec();
    assert_eq!(recorded.len(), 3);

    let outermost_grads = recorded[2].backward(&[tensor(&[2, 3], 0.5)])?;
    assert_eq!(outermost_grads.len(), 1);
    let post_grads = recorded[1].backward(&outermost_grads)?;
    assert_eq!(post_grads.len(), 1);

    // The pre-backward hook re-materialized the parameter for the backward
    // pass of the module body.
    assert!(controller
        .events()
        .contains(&"backward-fetch:inner.weight".to_string()));

    // The forced-param output of the pre-forward bridge receives whatever
    // gradient the module body produced for it; the bridge discards it.
    let mut pre_grads_in = post_grads;
    pre_grads_in.push(tensor(&[5], 7.0));
    let pre_grads = recorded[0].backward(&pre_grads_in)?;

    // The post-backward hook released the parameter once every expected
    // gradient had arrived.
    assert_eq!(param.residency(), Residency::NotAvailable);

    // Pre-forward bridge output had 1 arg tensor + 1 forced param, so its
    // backward returns the pass-through grad plus one zero grad.
    assert_eq!(pre_grads.len(), 2);
    assert_eq!(pre_grads[0].values(), &[0.5; 6]);
    assert_eq!(pre_grads[1].shape(), &[5]);
    assert_eq!(pre_grads[1].values(), &[0.0; 5]);
    Ok(())
}

#[test]
fn debug_checks_name_the_module_and_leaf_type() -> Result<()> {
    let (engine, controller) = setup();
    let module = RefModule::new("checked", Vec::new());
    let subscriber =
        OffloadSubscriber::new(Arc::clone(&engine), Arc::clone(&controller))?.with_debug_checks(true);
    let mut run_state = RunState::<RefEngine>::new();

    struct Opaque;
    let args: Value<RefTensor> = Value::seq(vec![Value::foreign(Opaque)]);
    let err = subscriber
        .pre_forward_module_apply(&mut run_state, &module, args, Value::map(Vec::new()))
        .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("checked"));
    assert!(message.contains("Opaque"));
    Ok(())
}

#[test]
fn stats_counters_advance_across_bridge_calls() -> Result<()> {
    let (engine, controller) = setup();
    let before = offload_bridge::stats::snapshot();

    let param = RefParam::offloaded("counted.weight", vec![2], vec![0.0; 2])?;
    let module = RefModule::new("counted", vec![param]);
    let subscriber = OffloadSubscriber::new(Arc::clone(&engine), Arc::clone(&controller))?;
    let mut run_state = RunState::<RefEngine>::new();

    let args: Value<RefTensor> = Value::seq(vec![Value::Tensor(tensor(&[2], 1.0))]);
    subscriber.pre_forward_module_apply(&mut run_state, &module, args, Value::map(Vec::new()))?;

    let after = offload_bridge::stats::snapshot();
    assert!(after.pre_forward_calls > before.pre_forward_calls);
    assert!(after.forced_params > before.forced_params);
    Ok(())
}
