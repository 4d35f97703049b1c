//! Subscriber entry points invoked around real module forward calls.
//!
//! One subscriber per controller; the orchestration layer that intercepts
//! module calls invokes `pre_forward_module_apply` before each module body,
//! `post_forward_module_apply` after it, and the outermost variant once per
//! top-level invocation.

use std::sync::Arc;

use anyhow::{ensure, Context, Result};

use crate::engine::{OffloadEngine, ParamHandle};
use crate::graph::BoundaryOp;
use crate::hooks::{BoundHooks, HookError, HookKind};
use crate::schema::{ensure_supported, flatten, unflatten, Value};
use crate::{env, resolver};

use super::post_forward::PostForwardBridge;
use super::pre_forward::PreForwardBridge;

/// Per-pass bookkeeping threaded through the subscriber entry points.
///
/// Boundary ops are recorded in forward order; the runtime driving the
/// backward pass replays them in reverse, which is how the pre-backward
/// hooks end up running when gradients return.
pub struct RunState<E: OffloadEngine> {
    pub step: u64,
    pub depth: usize,
    recorded: Vec<Arc<dyn BoundaryOp<E>>>,
}

impl<E: OffloadEngine> RunState<E> {
    pub fn new() -> Self {
        Self {
            step: 0,
            depth: 0,
            recorded: Vec::new(),
        }
    }

    /// Clears per-pass state and advances the step counter.
    pub fn begin_step(&mut self) {
        self.step += 1;
        self.depth = 0;
        self.recorded.clear();
    }

    pub fn record(&mut self, op: Arc<dyn BoundaryOp<E>>) {
        self.recorded.push(op);
    }

    /// Boundary ops recorded this pass, in forward order.
    pub fn recorded_ops(&self) -> &[Arc<dyn BoundaryOp<E>>] {
        &self.recorded
    }
}

impl<E: OffloadEngine> Default for RunState<E> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OffloadSubscriber<E: OffloadEngine> {
    engine: Arc<E>,
    hooks: BoundHooks<E>,
    debug_checks: bool,
}

impl<E: OffloadEngine> OffloadSubscriber<E> {
    /// Binds the collected hooks for `controller` and returns a subscriber.
    ///
    /// Fails eagerly with [`HookError::DependencyMissing`] when hook
    /// collection never ran; the bridge must not partially configure itself.
    pub fn new<C>(engine: Arc<E>, controller: Arc<C>) -> Result<Self, HookError>
    where
        C: Send + Sync + 'static,
    {
        let hooks = BoundHooks::bind(controller)?;
        Ok(Self {
            engine,
            hooks,
            debug_checks: env::debug_checks_enabled(),
        })
    }

    /// Overrides the env-driven debug-check toggle.
    pub fn with_debug_checks(mut self, enabled: bool) -> Self {
        self.debug_checks = enabled;
        self
    }

    /// Intercepts a module's inputs before its body runs.
    pub fn pre_forward_module_apply(
        &self,
        run_state: &mut RunState<E>,
        module: &E::Module,
        args: Value<E::Tensor>,
        kwargs: Value<E::Tensor>,
    ) -> Result<(Value<E::Tensor>, Value<E::Tensor>)> {
        self.debug_check(&args, module, "pre-forward args")?;
        self.debug_check(&kwargs, module, "pre-forward kwargs")?;

        let (args_tensors, args_schema) = flatten(&args)?;
        let (kwargs_tensors, kwargs_schema) = flatten(&kwargs)?;

        let missing = resolver::missing_params(&*self.engine, module);

        let op = Arc::new(PreForwardBridge::new(
            Arc::clone(&self.engine),
            module.clone(),
            Some(self.hooks.get(HookKind::PreForwardModule)?),
            Some(self.hooks.get(HookKind::PostBackwardModule)?),
            args_schema.clone(),
            kwargs_schema.clone(),
            missing.len(),
        ));

        // Operand layout: args tensors, kwargs tensors, then one placeholder
        // per offloaded parameter to force its materialization.
        let mut operands = args_tensors;
        operands.extend(kwargs_tensors);
        for param in &missing {
            operands.push(param.tensor());
        }

        let rets = op.forward(&operands)?;

        let args_count = op.args_tensor_count();
        let kwargs_count = op.kwargs_tensor_count();
        ensure!(
            rets.len() >= args_count + kwargs_count,
            "pre-forward bridge for module `{}` returned {} tensors, fewer than the {} recorded in the schemas",
            self.engine.module_name(module),
            rets.len(),
            args_count + kwargs_count,
        );
        let updated_args = unflatten(&rets[..args_count], &args_schema)?;
        let updated_kwargs = unflatten(&rets[args_count..args_count + kwargs_count], &kwargs_schema)?;

        run_state.depth += 1;
        run_state.record(op);

        Ok((updated_args, updated_kwargs))
    }

    /// Intercepts a submodule's outputs after its body runs.
    pub fn post_forward_module_apply(
        &self,
        run_state: &mut RunState<E>,
        module: &E::Module,
        args: Value<E::Tensor>,
        outputs: Value<E::Tensor>,
    ) -> Result<(Value<E::Tensor>, Value<E::Tensor>)> {
        self.debug_check(&outputs, module, "post-forward outputs")?;

        let (output_tensors, output_schema) = flatten(&outputs)?;
        let op = Arc::new(PostForwardBridge::new(
            Arc::clone(&self.engine),
            module.clone(),
            Some(self.hooks.get(HookKind::PostForwardModule)?),
            Some(self.hooks.get(HookKind::PreBackwardModule)?),
            output_schema.clone(),
        ));

        let rets = op.forward(&output_tensors)?;
        let updated_outputs = unflatten(&rets, &output_schema)?;

        run_state.depth = run_state.depth.saturating_sub(1);
        run_state.record(op);

        Ok((args, updated_outputs))
    }

    /// Outermost-module variant, applied once per top-level invocation after
    /// the whole module tree has run.
    pub fn post_forward_outermost_module_apply(
        &self,
        run_state: &mut RunState<E>,
        module: &E::Module,
        args: Value<E::Tensor>,
        outputs: Value<E::Tensor>,
    ) -> Result<(Value<E::Tensor>, Value<E::Tensor>)> {
        self.debug_check(&outputs, module, "outermost post-forward outputs")?;

        let (output_tensors, output_schema) = flatten(&outputs)?;
        let op = Arc::new(PostForwardBridge::outermost(
            Arc::clone(&self.engine),
            module.clone(),
            Some(self.hooks.get(HookKind::EndOfForward)?),
            output_schema.clone(),
        ));

        let rets = op.forward(&output_tensors)?;
        let updated_outputs = unflatten(&rets, &output_schema)?;

        run_state.depth = run_state.depth.saturating_sub(1);
        run_state.record(op);

        Ok((args, updated_outputs))
    }

    fn debug_check(
        &self,
        value: &Value<E::Tensor>,
        module: &E::Module,
        stage: &str,
    ) -> Result<()> {
        if !self.debug_checks {
            return Ok(());
        }
        ensure_supported(value).with_context(|| {
            format!(
                "{stage} check failed for module `{}`",
                self.engine.module_name(module)
            )
        })
    }
}
