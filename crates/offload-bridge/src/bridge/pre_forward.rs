//! Pre-forward boundary operation.
//!
//! Crosses from graph-compiled execution into the pre-forward hook, then
//! back, appending one detached operand per offloaded parameter so the graph
//! carries a data dependency that forces materialization.

use std::sync::{Arc, Mutex};

use anyhow::{bail, ensure, Result};

use crate::engine::{OffloadEngine, ParamHandle, TensorValue};
use crate::graph::{
    AttrValue, BoundaryNodeSpec, BoundaryOp, ATTR_ARGS_TENSOR_COUNT, ATTR_FORCED_PARAM_COUNT,
    ATTR_KWARGS_TENSOR_COUNT, ATTR_MODULE_HANDLE, PRE_FORWARD_TARGET,
};
use crate::hooks::{BoundHookFn, HookPayload};
use crate::module_registry::{self, ModuleHandle};
use crate::schema::{flatten, unflatten, Schema};
use crate::{resolver, stats};

pub struct PreForwardBridge<E: OffloadEngine> {
    engine: Arc<E>,
    module: E::Module,
    module_handle: ModuleHandle,
    pre_forward_hook: Option<BoundHookFn<E>>,
    post_backward_hook: Option<BoundHookFn<E>>,
    args_schema: Schema,
    kwargs_schema: Schema,
    args_tensor_count: usize,
    kwargs_tensor_count: usize,
    /// Synthetic trailing operand count recorded when the node was built.
    forced_param_count: usize,
    /// Offloaded parameters observed by the forward procedure, consumed by
    /// the matching backward call.
    saved_params: Mutex<Vec<E::Param>>,
}

impl<E: OffloadEngine> PreForwardBridge<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<E>,
        module: E::Module,
        pre_forward_hook: Option<BoundHookFn<E>>,
        post_backward_hook: Option<BoundHookFn<E>>,
        args_schema: Schema,
        kwargs_schema: Schema,
        forced_param_count: usize,
    ) -> Self {
        let module_handle = module_registry::register_module(&engine, &module);
        let args_tensor_count = args_schema.tensor_count();
        let kwargs_tensor_count = kwargs_schema.tensor_count();
        Self {
            engine,
            module,
            module_handle,
            pre_forward_hook,
            post_backward_hook,
            args_schema,
            kwargs_schema,
            args_tensor_count,
            kwargs_tensor_count,
            forced_param_count,
            saved_params: Mutex::new(Vec::new()),
        }
    }

    pub fn module_handle(&self) -> ModuleHandle {
        self.module_handle
    }

    pub fn args_tensor_count(&self) -> usize {
        self.args_tensor_count
    }

    pub fn kwargs_tensor_count(&self) -> usize {
        self.kwargs_tensor_count
    }

    fn module_name(&self) -> String {
        self.engine.module_name(&self.module)
    }
}

impl<E: OffloadEngine> BoundaryOp<E> for PreForwardBridge<E> {
    fn node(&self) -> BoundaryNodeSpec {
        BoundaryNodeSpec::new(PRE_FORWARD_TARGET)
            .with_attr(ATTR_MODULE_HANDLE, AttrValue::I64(self.module_handle.0 as i64))
            .with_attr(
                ATTR_ARGS_TENSOR_COUNT,
                AttrValue::I64(self.args_tensor_count as i64),
            )
            .with_attr(
                ATTR_KWARGS_TENSOR_COUNT,
                AttrValue::I64(self.kwargs_tensor_count as i64),
            )
            .with_attr(
                ATTR_FORCED_PARAM_COUNT,
                AttrValue::I64(self.forced_param_count as i64),
            )
    }

    fn forward(&self, tensors: &[E::Tensor]) -> Result<Vec<E::Tensor>> {
        ensure!(
            tensors.len() == self.args_tensor_count + self.kwargs_tensor_count + self.forced_param_count,
            "pre-forward bridge for module `{}` received {} operands, expected {} args + {} kwargs + {} forced params",
            self.module_name(),
            tensors.len(),
            self.args_tensor_count,
            self.kwargs_tensor_count,
            self.forced_param_count,
        );

        let args_tensors = &tensors[..self.args_tensor_count];
        let kwargs_tensors =
            &tensors[self.args_tensor_count..self.args_tensor_count + self.kwargs_tensor_count];
        let args = unflatten(args_tensors, &self.args_schema)?;
        let kwargs = unflatten(kwargs_tensors, &self.kwargs_schema)?;

        // Residency may have changed since the node was built; query fresh.
        let missing = resolver::missing_params(&*self.engine, &self.module);

        let (updated_args, updated_kwargs) = match &self.pre_forward_hook {
            Some(hook) => match hook(
                &self.module,
                HookPayload::ArgsKwargs {
                    args: args.clone(),
                    kwargs: kwargs.clone(),
                },
            )? {
                Some(HookPayload::ArgsKwargs { args, kwargs }) => {
                    stats::record_hook_replacement();
                    (args, kwargs)
                }
                Some(_) => bail!(
                    "pre-forward hook for module `{}` returned a payload of the wrong kind",
                    self.module_name()
                ),
                None => (args, kwargs),
            },
            None => (args, kwargs),
        };

        let (updated_args_tensors, _) = flatten(&updated_args)?;
        let (updated_kwargs_tensors, _) = flatten(&updated_kwargs)?;

        let mut rets = updated_args_tensors;
        rets.extend(updated_kwargs_tensors);

        // The placeholder operands passed for offloaded parameters stay
        // placeholder-sized inside the graph, so re-read each parameter's
        // backing tensor now that the hook has materialized it.
        for param in &missing {
            rets.push(param.tensor().detached(param.requires_grad()));
        }

        ensure!(
            !rets.is_empty(),
            "pre-forward bridge for module `{}` produced an empty tensor output",
            self.module_name()
        );

        stats::record_pre_forward(missing.len());
        *self
            .saved_params
            .lock()
            .expect("pre-forward bridge state poisoned") = missing;

        Ok(rets)
    }

    fn backward(&self, grads: &[E::Tensor]) -> Result<Vec<E::Tensor>> {
        let saved = self
            .saved_params
            .lock()
            .expect("pre-forward bridge state poisoned")
            .clone();

        let mut updated: Vec<E::Tensor> = grads.to_vec();
        if let Some(hook) = &self.post_backward_hook {
            match hook(&self.module, HookPayload::Gradients(updated.clone()))? {
                Some(HookPayload::Gradients(replaced)) => {
                    stats::record_hook_replacement();
                    updated = replaced;
                }
                Some(_) => bail!(
                    "post-backward hook for module `{}` returned a payload of the wrong kind",
                    self.module_name()
                ),
                None => {}
            }
        }

        ensure!(
            updated.len() >= saved.len(),
            "pre-forward bridge backward for module `{}` received {} gradients for {} forced params",
            self.module_name(),
            updated.len(),
            saved.len(),
        );

        // Pass through gradients for the real inputs; the synthetic operands
        // existed only to force materialization, so their upstream gradients
        // are discarded and replaced with zeros of the parameter's shape.
        let input_count = updated.len() - saved.len();
        let mut out: Vec<E::Tensor> = updated[..input_count].to_vec();
        for param in &saved {
            out.push(E::Tensor::zeros(&param.shape(), param.dtype()));
        }

        stats::record_backward();
        Ok(out)
    }
}
