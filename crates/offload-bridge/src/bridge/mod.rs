//! The forward/backward bridge: two differentiable boundary operations plus
//! the subscriber entry points that wire them around module calls.

mod post_forward;
mod pre_forward;
mod subscriber;

pub use post_forward::PostForwardBridge;
pub use pre_forward::PreForwardBridge;
pub use subscriber::{OffloadSubscriber, RunState};
