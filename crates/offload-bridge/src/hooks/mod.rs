//! Hook capture and rebinding: a process-wide registry of hook bodies plus a
//! per-controller binder.

mod binder;
mod registry;

pub use binder::{BoundHookFn, BoundHooks};
pub use registry::{
    collect_hook_functions, hooks_collected, HookBody, HookError, HookKind, HookPayload,
    HookProvider,
};
