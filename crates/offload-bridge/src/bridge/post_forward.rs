//! Post-forward boundary operation.
//!
//! Runs the post-forward (or, for the outermost module, end-of-forward) hook
//! over reconstructed outputs, and routes returning gradients through the
//! pre-backward hook.

use std::sync::Arc;

use anyhow::{bail, ensure, Result};

use crate::engine::{OffloadEngine, TensorValue};
use crate::graph::{
    AttrValue, BoundaryNodeSpec, BoundaryOp, ATTR_MODULE_HANDLE, POST_FORWARD_TARGET,
};
use crate::hooks::{BoundHookFn, HookPayload};
use crate::module_registry::{self, ModuleHandle};
use crate::schema::{flatten, unflatten, Schema};
use crate::stats;

pub struct PostForwardBridge<E: OffloadEngine> {
    engine: Arc<E>,
    module: E::Module,
    module_handle: ModuleHandle,
    forward_hook: Option<BoundHookFn<E>>,
    pre_backward_hook: Option<BoundHookFn<E>>,
    output_schema: Schema,
}

impl<E: OffloadEngine> PostForwardBridge<E> {
    /// Per-submodule variant: post-forward hook forward, pre-backward hook
    /// backward.
    pub fn new(
        engine: Arc<E>,
        module: E::Module,
        post_forward_hook: Option<BoundHookFn<E>>,
        pre_backward_hook: Option<BoundHookFn<E>>,
        output_schema: Schema,
    ) -> Self {
        let module_handle = module_registry::register_module(&engine, &module);
        Self {
            engine,
            module,
            module_handle,
            forward_hook: post_forward_hook,
            pre_backward_hook,
            output_schema,
        }
    }

    /// Outermost variant, used once per top-level module invocation:
    /// end-of-forward hook forward, no-op backward.
    pub fn outermost(
        engine: Arc<E>,
        module: E::Module,
        end_of_forward_hook: Option<BoundHookFn<E>>,
        output_schema: Schema,
    ) -> Self {
        let module_handle = module_registry::register_module(&engine, &module);
        Self {
            engine,
            module,
            module_handle,
            forward_hook: end_of_forward_hook,
            pre_backward_hook: None,
            output_schema,
        }
    }

    pub fn module_handle(&self) -> ModuleHandle {
        self.module_handle
    }

    fn module_name(&self) -> String {
        self.engine.module_name(&self.module)
    }
}

impl<E: OffloadEngine> BoundaryOp<E> for PostForwardBridge<E> {
    fn node(&self) -> BoundaryNodeSpec {
        BoundaryNodeSpec::new(POST_FORWARD_TARGET)
            .with_attr(ATTR_MODULE_HANDLE, AttrValue::I64(self.module_handle.0 as i64))
    }

    fn forward(&self, tensors: &[E::Tensor]) -> Result<Vec<E::Tensor>> {
        let outputs = unflatten(tensors, &self.output_schema)?;

        let updated_tensors = match &self.forward_hook {
            Some(hook) => match hook(
                &self.module,
                HookPayload::Outputs {
                    inputs: None,
                    outputs: outputs.clone(),
                },
            )? {
                Some(HookPayload::Outputs { outputs, .. }) => {
                    stats::record_hook_replacement();
                    flatten(&outputs)?.0
                }
                Some(_) => bail!(
                    "post-forward hook for module `{}` returned a payload of the wrong kind",
                    self.module_name()
                ),
                None => tensors.to_vec(),
            },
            None => tensors.to_vec(),
        };

        // The hook may transform tensor contents but never add or remove
        // tensors at this boundary.
        ensure!(
            updated_tensors.len() == tensors.len(),
            "post-forward hook for module `{}` changed the boundary tensor count from {} to {}",
            self.module_name(),
            tensors.len(),
            updated_tensors.len(),
        );

        stats::record_post_forward();
        Ok(updated_tensors
            .iter()
            .map(|tensor| tensor.detached(tensor.requires_grad()))
            .collect())
    }

    fn backward(&self, grads: &[E::Tensor]) -> Result<Vec<E::Tensor>> {
        if let Some(hook) = &self.pre_backward_hook {
            match hook(&self.module, HookPayload::Gradients(grads.to_vec()))? {
                Some(HookPayload::Gradients(replaced)) if !replaced.is_empty() => {
                    stats::record_hook_replacement();
                    stats::record_backward();
                    return Ok(replaced);
                }
                Some(HookPayload::Gradients(_)) | None => {}
                Some(_) => bail!(
                    "pre-backward hook for module `{}` returned a payload of the wrong kind",
                    self.module_name()
                ),
            }
        }
        stats::record_backward();
        Ok(grads.to_vec())
    }
}
