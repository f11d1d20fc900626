//! Timing and sequencing assertions shared by the suites.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tdm::Display;

/// Drive the display until `done` holds or `timeout` passes; returns
/// whether the condition was met.
pub fn drive_until(display: &Display, timeout: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let budget = (deadline - now).as_millis().max(1) as i32;
        if display.poll_events(budget.min(50)).is_err() {
            return false;
        }
    }
    true
}

/// Shared counter for completion callbacks.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU32>);

impl Counter {
    pub fn new() -> Counter {
        Counter::default()
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn at_least(&self, n: u32) -> impl Fn() -> bool {
        let counter = self.clone();
        move || counter.get() >= n
    }
}

/// Assert `actual` is within `tolerance` of `expected` (all in µs).
pub fn assert_near_us(actual: u64, expected: u64, tolerance: u64) {
    let delta = actual.abs_diff(expected);
    assert!(
        delta <= tolerance,
        "expected {expected}us ±{tolerance}us, got {actual}us (off by {delta}us)"
    );
}

/// Assert a sequence of values is strictly increasing.
pub fn assert_strictly_increasing(values: &[u32]) {
    for pair in values.windows(2) {
        assert!(
            pair[1] > pair[0],
            "sequence not strictly increasing: {values:?}"
        );
    }
}
