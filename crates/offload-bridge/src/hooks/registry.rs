//! Process-wide store of hook function bodies.
//!
//! Hook bodies are authored by the offload engine integration and collected
//! exactly once per process, no matter how many controllers subscribe. The
//! store is written on first successful collection and read-only afterwards;
//! `OnceLock` gives the happens-before edge between the one-time
//! initialization and every later bridge invocation.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::engine::OffloadEngine;
use crate::schema::Value;

/// Fixed set of hook points in a module's forward/backward lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    PreForwardModule,
    PostForwardModule,
    PreBackwardModule,
    PostBackwardModule,
    EndOfForward,
}

impl HookKind {
    pub fn name(self) -> &'static str {
        match self {
            HookKind::PreForwardModule => "pre_forward_module_hook",
            HookKind::PostForwardModule => "post_forward_module_hook",
            HookKind::PreBackwardModule => "pre_backward_module_hook",
            HookKind::PostBackwardModule => "post_backward_module_hook",
            HookKind::EndOfForward => "end_of_forward_hook",
        }
    }
}

/// Payload handed to a hook body at one of the lifecycle points.
pub enum HookPayload<E: OffloadEngine> {
    /// Pre-forward: the module's reconstructed positional and keyword
    /// arguments.
    ArgsKwargs {
        args: Value<E::Tensor>,
        kwargs: Value<E::Tensor>,
    },
    /// Post-forward and end-of-forward: reconstructed outputs. The unused
    /// `inputs` slot preserves the provider's original calling convention.
    Outputs {
        inputs: Option<Value<E::Tensor>>,
        outputs: Value<E::Tensor>,
    },
    /// Pre/post-backward: one gradient per boundary tensor.
    Gradients(Vec<E::Tensor>),
}

/// Captured hook body, abstracted over the injected controller.
///
/// Returning `Ok(None)` keeps the caller's payload; returning a payload
/// replaces it.
pub type HookBody<E, C> = Arc<
    dyn Fn(
            &C,
            &<E as OffloadEngine>::Module,
            HookPayload<E>,
        ) -> anyhow::Result<Option<HookPayload<E>>>
        + Send
        + Sync,
>;

/// Source of hook bodies, implemented by the offload engine integration.
pub trait HookProvider<E: OffloadEngine> {
    type Controller: Send + Sync + 'static;

    /// The full ordered set of hook bodies to capture.
    fn hook_bodies(&self) -> Vec<(HookKind, HookBody<E, Self::Controller>)>;
}

/// Failures in hook collection and binding.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("offload hook provider is unavailable; hooks were never collected for this engine")]
    DependencyMissing,
    #[error("hook `{0}` was never collected")]
    UnknownHook(&'static str),
}

pub(crate) struct HookStore<E: OffloadEngine, C> {
    pub(crate) entries: Vec<(HookKind, HookBody<E, C>)>,
}

static HOOK_STORE: OnceLock<Box<dyn Any + Send + Sync>> = OnceLock::new();

/// Captures the provider's hook bodies into the process-wide store.
///
/// Only the first call performs the collection; later calls are no-ops and
/// return `false`. Collection must happen before any bridge operation
/// executes.
pub fn collect_hook_functions<E, P>(provider: &P) -> bool
where
    E: OffloadEngine,
    P: HookProvider<E>,
{
    let mut collected = false;
    HOOK_STORE.get_or_init(|| {
        collected = true;
        Box::new(HookStore::<E, P::Controller> {
            entries: provider.hook_bodies(),
        })
    });
    collected
}

/// Whether a collection has happened in this process.
pub fn hooks_collected() -> bool {
    HOOK_STORE.get().is_some()
}

/// Typed view into the collected store. Fails with `DependencyMissing` when
/// collection never ran, or ran for a different engine/controller pairing.
pub(crate) fn collected<E, C>() -> Result<&'static HookStore<E, C>, HookError>
where
    E: OffloadEngine,
    C: Send + Sync + 'static,
{
    HOOK_STORE
        .get()
        .and_then(|store| store.downcast_ref::<HookStore<E, C>>())
        .ok_or(HookError::DependencyMissing)
}
