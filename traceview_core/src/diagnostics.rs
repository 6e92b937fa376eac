//! Numerical-failure diagnostics.
//!
//! The estimation engine never propagates NaN/Inf into a solver; it
//! substitutes a large-but-finite sentinel cost and records the event here.
//! Emission is rate-limited so a degenerate covariance in a tight loop does
//! not flood the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Minimum spacing between emitted warnings per counter.
const EMIT_INTERVAL: Duration = Duration::from_secs(1);

static CHOLESKY_FALLBACKS: AtomicU64 = AtomicU64::new(0);
static SENTINEL_COSTS: AtomicU64 = AtomicU64::new(0);

/// Record a Cholesky failure that fell back to the SVD pseudo-inverse.
pub fn record_cholesky_fallback(context: &str) {
    let total = CHOLESKY_FALLBACKS.fetch_add(1, Ordering::Relaxed) + 1;
    rate_limited(|| warn!(context, total, "cholesky solve failed; using SVD pseudo-inverse"));
}

/// Record a non-finite cost replaced by the finite sentinel.
pub fn record_sentinel_cost(context: &str) {
    let total = SENTINEL_COSTS.fetch_add(1, Ordering::Relaxed) + 1;
    rate_limited(|| warn!(context, total, "non-finite cost clamped to finite sentinel"));
}

/// Counters since process start: (cholesky fallbacks, sentinel substitutions).
pub fn counters() -> (u64, u64) {
    (
        CHOLESKY_FALLBACKS.load(Ordering::Relaxed),
        SENTINEL_COSTS.load(Ordering::Relaxed),
    )
}

fn rate_limited(emit: impl FnOnce()) {
    use std::sync::Mutex;
    static LAST_EMIT: Mutex<Option<Instant>> = Mutex::new(None);

    let mut last = match LAST_EMIT.lock() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    let now = Instant::now();
    let due = last.map_or(true, |t| now.duration_since(t) >= EMIT_INTERVAL);
    if due {
        *last = Some(now);
        emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let (chol_before, sent_before) = counters();
        record_cholesky_fallback("test");
        record_sentinel_cost("test");
        record_sentinel_cost("test");
        let (chol_after, sent_after) = counters();
        assert!(chol_after >= chol_before + 1);
        assert!(sent_after >= sent_before + 2);
    }
}
