pub mod bridge;
pub mod engine;
mod env;
pub mod graph;
pub mod hooks;
pub mod infer;
pub mod module_registry;
pub mod resolver;
pub mod schema;
pub mod stats;

pub use bridge::{OffloadSubscriber, PostForwardBridge, PreForwardBridge, RunState};
pub use engine::{DType, OffloadEngine, ParamHandle, Residency, TensorValue};
pub use graph::{BoundaryNodeSpec, BoundaryOp, GraphCompiler};
pub use hooks::{collect_hook_functions, BoundHooks, HookKind, HookPayload, HookProvider};
pub use module_registry::ModuleHandle;
pub use schema::{flatten, unflatten, Schema, SchemaError, Value};
