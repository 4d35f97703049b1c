//! Process-wide bridge counters.
//!
//! Counters are advisory observability, not control flow: the bridge bumps
//! them on every boundary crossing and callers read consistent snapshots for
//! logging or test assertions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct Counters {
    pre_forward_calls: AtomicU64,
    post_forward_calls: AtomicU64,
    backward_calls: AtomicU64,
    hook_replacements: AtomicU64,
    forced_params: AtomicU64,
}

static COUNTERS: OnceLock<Counters> = OnceLock::new();

fn counters() -> &'static Counters {
    COUNTERS.get_or_init(Counters::default)
}

pub(crate) fn record_pre_forward(forced: usize) {
    let counters = counters();
    counters.pre_forward_calls.fetch_add(1, Ordering::Relaxed);
    counters
        .forced_params
        .fetch_add(forced as u64, Ordering::Relaxed);
}

pub(crate) fn record_post_forward() {
    counters().post_forward_calls.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_backward() {
    counters().backward_calls.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_hook_replacement() {
    counters().hook_replacements.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time view of the bridge counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub pre_forward_calls: u64,
    pub post_forward_calls: u64,
    pub backward_calls: u64,
    pub hook_replacements: u64,
    /// Total parameter materializations forced through synthetic operands.
    pub forced_params: u64,
}

pub fn snapshot() -> BridgeStats {
    let counters = counters();
    BridgeStats {
        pre_forward_calls: counters.pre_forward_calls.load(Ordering::Relaxed),
        post_forward_calls: counters.post_forward_calls.load(Ordering::Relaxed),
        backward_calls: counters.backward_calls.load(Ordering::Relaxed),
        hook_replacements: counters.hook_replacements.load(Ordering::Relaxed),
        forced_params: counters.forced_params.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    let counters = counters();
    counters.pre_forward_calls.store(0, Ordering::Relaxed);
    counters.post_forward_calls.store(0, Ordering::Relaxed);
    counters.backward_calls.store(0, Ordering::Relaxed);
    counters.hook_replacements.store(0, Ordering::Relaxed);
    counters.forced_params.store(0, Ordering::Relaxed);
}
