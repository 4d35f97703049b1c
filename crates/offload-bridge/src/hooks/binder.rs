//! Binds collected hook bodies to a subscribing controller.

use std::sync::Arc;

use crate::engine::OffloadEngine;

use super::registry::{self, HookError, HookKind, HookPayload};

/// Hook callable closed over one controller's private state.
pub type BoundHookFn<E> = Arc<
    dyn Fn(
            &<E as OffloadEngine>::Module,
            HookPayload<E>,
        ) -> anyhow::Result<Option<HookPayload<E>>>
        + Send
        + Sync,
>;

/// One bound set per subscribing controller.
///
/// Binding reuses the exact captured bodies (the stored `Arc`s are cloned,
/// never re-created); only the controller binding is substituted, so every
/// controller runs the same logic against its own state.
pub struct BoundHooks<E: OffloadEngine> {
    entries: Vec<(HookKind, BoundHookFn<E>)>,
}

impl<E: OffloadEngine> BoundHooks<E> {
    /// Wraps each collected body as a callable closed over `controller`.
    pub fn bind<C>(controller: Arc<C>) -> Result<Self, HookError>
    where
        C: Send + Sync + 'static,
    {
        let store = registry::collected::<E, C>()?;
        let entries = store
            .entries
            .iter()
            .map(|(kind, body)| {
                let body = Arc::clone(body);
                let controller = Arc::clone(&controller);
                let bound: BoundHookFn<E> =
                    Arc::new(move |module, payload| body(&controller, module, payload));
                (*kind, bound)
            })
            .collect();
        Ok(Self { entries })
    }

    /// Looks up the bound callable for a hook point.
    pub fn get(&self, kind: HookKind) -> Result<BoundHookFn<E>, HookError> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, hook)| Arc::clone(hook))
            .ok_or(HookError::UnknownHook(kind.name()))
    }
}
