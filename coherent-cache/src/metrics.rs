//! Optional metrics, enabled via the `metrics` feature.
//!
//! Grounded on `hitbox::metrics`'s pattern: metric name constants declared
//! once via `lazy_static!`, registered with `metrics::describe_counter!`/
//! `describe_gauge!` at startup, and recorded from call sites with
//! `metrics::counter!`/`gauge!`.

use lazy_static::lazy_static;

lazy_static! {
    static ref FRONT_HIT: String = "coherent_cache_front_hit_total".to_string();
    static ref FRONT_MISS: String = "coherent_cache_front_miss_total".to_string();
    static ref INVALIDATION: String = "coherent_cache_invalidation_total".to_string();
    static ref DISPATCHER_QUEUE_DEPTH: String = "coherent_cache_dispatcher_queue_depth".to_string();
}

/// Registers every metric this crate emits with descriptive help text.
/// Call once at process startup, after installing a `metrics` recorder.
pub fn describe() {
    metrics::describe_counter!(FRONT_HIT.clone(), "front cache hits served without a back cache call");
    metrics::describe_counter!(FRONT_MISS.clone(), "front cache misses that fell through to the back cache");
    metrics::describe_counter!(INVALIDATION.clone(), "front entries invalidated by a back cache event");
    metrics::describe_gauge!(DISPATCHER_QUEUE_DEPTH.clone(), "events queued for background listener dispatch");
}

/// Records a front cache hit.
pub fn record_front_hit() {
    metrics::counter!(FRONT_HIT.clone()).increment(1);
}

/// Records a front cache miss.
pub fn record_front_miss() {
    metrics::counter!(FRONT_MISS.clone()).increment(1);
}

/// Records a front entry invalidation.
pub fn record_invalidation() {
    metrics::counter!(INVALIDATION.clone()).increment(1);
}

/// Updates the dispatcher queue depth gauge.
pub fn record_dispatcher_queue_depth(depth: f64) {
    metrics::gauge!(DISPATCHER_QUEUE_DEPTH.clone()).set(depth);
}
