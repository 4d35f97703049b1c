//! Hook bodies and controller state for the reference engine.
//!
//! The bodies reproduce the offload engine's lifecycle: materialize managed
//! parameters before a module runs, release them after, re-materialize for
//! the backward pass, and release again once every expected gradient has
//! arrived. All payloads pass through unchanged.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use offload_bridge::engine::{ParamHandle, Residency};
use offload_bridge::hooks::{HookBody, HookKind, HookPayload, HookProvider};

use crate::engine::{RefEngine, RefModule};

fn body<F>(f: F) -> HookBody<RefEngine, RefController>
where
    F: Fn(
            &RefController,
            &RefModule,
            HookPayload<RefEngine>,
        ) -> Result<Option<HookPayload<RefEngine>>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Per-subscriber mutable state the hook bodies close over.
#[derive(Debug, Default)]
pub struct RefController {
    grads_remaining: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl RefController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grads_remaining(&self) -> usize {
        self.grads_remaining.load(Ordering::SeqCst)
    }

    pub fn set_grads_remaining(&self, count: usize) {
        self.grads_remaining.store(count, Ordering::SeqCst);
    }

    /// Decrements towards zero, returning the remaining count.
    pub fn grad_arrived(&self) -> usize {
        let mut current = self.grads_remaining.load(Ordering::SeqCst);
        while current > 0 {
            match self.grads_remaining.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(observed) => current = observed,
            }
        }
        0
    }

    pub fn log(&self, event: impl Into<String>) {
        self.events
            .lock()
            .expect("controller event log poisoned")
            .push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("controller event log poisoned")
            .clone()
    }
}

/// Hook provider exposing the reference engine's lifecycle bodies.
pub struct RefHookProvider;

impl HookProvider<RefEngine> for RefHookProvider {
    type Controller = RefController;

    fn hook_bodies(&self) -> Vec<(HookKind, HookBody<RefEngine, RefController>)> {
        vec![
            (
                HookKind::PreForwardModule,
                body(|controller, module, _payload| {
                    for param in module.params() {
                        if param.residency() == Residency::NotAvailable {
                            param.fetch();
                            controller.log(format!("fetch:{}", param.name()));
                        }
                    }
                    controller.set_grads_remaining(module.params().len());
                    controller.log(format!("pre-forward:{}", module.name()));
                    Ok(None)
                }),
            ),
            (
                HookKind::PostForwardModule,
                body(|controller, module, _payload| {
                    for param in module.params() {
                        if param.is_offloadable() {
                            param.release();
                            controller.log(format!("release:{}", param.name()));
                        }
                    }
                    controller.log(format!("post-forward:{}", module.name()));
                    Ok(None)
                }),
            ),
            (
                HookKind::PreBackwardModule,
                body(|controller, module, _payload| {
                    for param in module.params() {
                        if param.residency() == Residency::NotAvailable {
                            param.fetch();
                            controller.log(format!("backward-fetch:{}", param.name()));
                        }
                    }
                    controller.log(format!("pre-backward:{}", module.name()));
                    Ok(None)
                }),
            ),
            (
                HookKind::PostBackwardModule,
                body(|controller, module, _payload| {
                    if controller.grad_arrived() == 0 {
                        for param in module.params() {
                            param.release();
                        }
                    }
                    controller.log(format!("post-backward:{}", module.name()));
                    Ok(None)
                }),
            ),
            (
                HookKind::EndOfForward,
                body(|controller, module, _payload| {
                    controller.log(format!("end-of-forward:{}", module.name()));
                    Ok(None)
                }),
            ),
        ]
    }
}
