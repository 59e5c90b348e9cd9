//! Relay Metrics - hook dispatch accounting
//!
//! Counts dispatch outcomes and tracks hook latency for the script bridge.
//! Everything here vanishes in lean builds via feature flags.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable metrics collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use relay_metrics::{Counter, HookTimer};
//!
//! let mut timer = HookTimer::new(128); // Track last 128 hook calls
//! let started = std::time::Instant::now();
//! // ... call the hook ...
//! timer.record(started.elapsed());
//! let (fastest, slowest) = timer.range_ms();
//! ```
//!
//! Without the `metrics` feature the same API compiles to no-op stubs.

#[cfg(feature = "metrics")]
mod counter;
#[cfg(feature = "metrics")]
mod hook_timer;
#[cfg(feature = "metrics")]
mod ring_buffer;

#[cfg(feature = "metrics")]
pub use counter::Counter;
#[cfg(feature = "metrics")]
pub use hook_timer::HookTimer;
#[cfg(feature = "metrics")]
pub use ring_buffer::RingBuffer;

/// Whether this build records anything at all.
pub const ENABLED: bool = cfg!(feature = "metrics");

// ============================================================================
// No-op stubs when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Default)]
pub struct HookTimer;

#[cfg(not(feature = "metrics"))]
impl HookTimer {
    pub fn new(_capacity: usize) -> Self { Self }
    pub fn record(&mut self, _elapsed: std::time::Duration) {}
    pub fn samples(&self) -> usize { 0 }
    pub fn average_ms(&self) -> f64 { 0.0 }
    pub fn range_ms(&self) -> (f64, f64) { (0.0, 0.0) }
}

#[cfg(not(feature = "metrics"))]
#[derive(Debug)]
pub struct RingBuffer<T>(std::marker::PhantomData<T>);

#[cfg(not(feature = "metrics"))]
impl<T> RingBuffer<T> {
    pub fn new(_capacity: usize) -> Self { Self(std::marker::PhantomData) }
    pub fn push(&mut self, _value: T) {}
    pub fn len(&self) -> usize { 0 }
    pub fn is_empty(&self) -> bool { true }
    pub fn average(&self) -> T where T: Default { T::default() }
}

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Default)]
pub struct Counter;

#[cfg(not(feature = "metrics"))]
impl Counter {
    pub fn new() -> Self { Self }
    pub fn increment(&mut self, _name: &str, _value: usize) {}
    pub fn get(&self, _name: &str) -> usize { 0 }
}
