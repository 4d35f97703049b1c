//! Runs in its own process: nothing here may collect hook functions.

use std::sync::Arc;

use offload_bridge::hooks::{hooks_collected, BoundHooks, HookError};
use offload_bridge::OffloadSubscriber;
use offload_bridge_engine_ref::{RefController, RefEngine};

#[test]
fn subscribing_without_a_provider_fails_eagerly() {
    assert!(!hooks_collected());

    let engine = Arc::new(RefEngine::new());
    let controller = Arc::new(RefController::new());

    let err = OffloadSubscriber::new(Arc::clone(&engine), Arc::clone(&controller)).err().unwrap();
    assert!(matches!(err, HookError::DependencyMissing));

    let err = BoundHooks::<RefEngine>::bind(controller).err().unwrap();
    assert!(matches!(err, HookError::DependencyMissing));
}
