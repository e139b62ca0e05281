//! Metrics emitted by limiters.
//!
//! Handles are registered once per limiter, so emitting on the request path neither looks up
//! nor allocates. Emission is best-effort and never fails: without an installed recorder every
//! handle is a no-op.

use std::fmt;

use metrics::{counter, gauge, Counter, Gauge};

pub(crate) const ADMITTED: &str = "limits.concurrency.admitted";
pub(crate) const SERVICE_UNAVAILABLE: &str = "limits.concurrency.service_unavailable";
pub(crate) const SUCCESS: &str = "limits.concurrency.success";
pub(crate) const DROPPED: &str = "limits.concurrency.dropped";
pub(crate) const IGNORED: &str = "limits.concurrency.ignored";
pub(crate) const LIMIT: &str = "limits.concurrency.limit";

pub(crate) struct LimiterEvents {
    limiter: &'static str,

    admitted: Counter,
    service_unavailable: Counter,
    success: Counter,
    dropped: Counter,
    ignored: Counter,
    limit: Gauge,
}

impl LimiterEvents {
    pub(crate) fn register(limiter: &'static str) -> Self {
        Self {
            limiter,

            admitted: counter!(ADMITTED, "limiter" => limiter),
            service_unavailable: counter!(SERVICE_UNAVAILABLE, "limiter" => limiter),
            success: counter!(SUCCESS, "limiter" => limiter),
            dropped: counter!(DROPPED, "limiter" => limiter),
            ignored: counter!(IGNORED, "limiter" => limiter),
            limit: gauge!(LIMIT, "limiter" => limiter),
        }
    }

    pub(crate) fn admitted(&self) {
        self.admitted.increment(1);
    }

    pub(crate) fn service_unavailable(&self) {
        self.service_unavailable.increment(1);
    }

    pub(crate) fn success(&self) {
        self.success.increment(1);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.increment(1);
    }

    pub(crate) fn ignored(&self) {
        self.ignored.increment(1);
    }

    pub(crate) fn limit(&self, limit: usize) {
        self.limit.set(limit as f64);
    }
}

impl fmt::Debug for LimiterEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterEvents")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}
