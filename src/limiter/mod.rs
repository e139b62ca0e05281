use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use tracing::{debug_span, error, trace, Span};

pub use listener::Listener;

use crate::{
    internal_events::LimiterEvents,
    limits::{Gradient2, LimitAlgorithm, Sample},
};

use self::listener::Admission;

mod listener;

/// Limits the number of concurrent requests.
///
/// Concurrency is limited through the use of [Listener]s. Acquire one to run a request and
/// report its outcome once the request is finished.
///
/// Acquisition never waits: if no capacity is available the caller is expected to shed the
/// request immediately.
///
/// The limit is controlled by a [LimitAlgorithm], [Gradient2] by default. Lowering the limit
/// never revokes tokens already handed out, it only prevents new admissions until enough are
/// released.
#[derive(Debug)]
pub struct RequestLimiter<L = Gradient2> {
    name: &'static str,
    limit_algo: L,

    in_flight: AtomicUsize,
    admissions: AtomicU64,

    events: LimiterEvents,
    span: Span,
}

/// A snapshot of the state of a [RequestLimiter].
///
/// Not guaranteed to be consistent under high concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    limit: usize,
    in_flight: usize,
}

/// How a request that held a token ended.
///
/// Requests which end without a meaningful latency, e.g. because of an early client error, are
/// reported with no outcome at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The request completed normally.
    Success,
    /// The request failed because of a server-side error. Treated as a sign of distress.
    Dropped,
}

/// Returns a token to the limiter which issued it.
pub(crate) trait Release: Send + Sync {
    fn release(&self, admission: &Admission, outcome: Option<Outcome>);
}

impl<L> RequestLimiter<L>
where
    L: LimitAlgorithm + 'static,
{
    /// Create a limiter with a given limit control algorithm.
    ///
    /// The name labels logs and metrics.
    pub fn new(name: &'static str, limit_algo: L) -> Self {
        let initial_limit = limit_algo.limit();
        assert!(initial_limit >= 1);

        let events = LimiterEvents::register(name);
        events.limit(initial_limit);

        Self {
            name,
            limit_algo,

            in_flight: AtomicUsize::new(0),
            admissions: AtomicU64::new(0),

            events,
            span: debug_span!("request_limiter", limiter = name),
        }
    }

    /// Try to immediately acquire a concurrency token.
    ///
    /// Returns `None` if there are none available.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Listener> {
        let acquired = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |in_flight| {
                (in_flight < self.limit_algo.limit()).then_some(in_flight + 1)
            });

        match acquired {
            Ok(previous) => {
                let admissions = self.admissions.fetch_add(1, Ordering::Relaxed) + 1;
                self.events.admitted();

                let limiter: Arc<dyn Release> = self.clone();
                Some(Listener::new(limiter, previous + 1, admissions))
            }
            Err(in_flight) => {
                self.events.service_unavailable();
                trace!(
                    message = "Rejected request, no concurrency available.",
                    limiter = self.name,
                    in_flight,
                );
                None
            }
        }
    }

    /// The name labelling this limiter's logs and metrics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The current concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit_algo.limit()
    }

    /// The number of requests in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The limit control algorithm.
    pub fn algorithm(&self) -> &L {
        &self.limit_algo
    }

    /// The current state of the limiter.
    pub fn state(&self) -> LimiterState {
        LimiterState {
            limit: self.limit(),
            in_flight: self.in_flight(),
        }
    }
}

impl<L> Release for RequestLimiter<L>
where
    L: LimitAlgorithm,
{
    fn release(&self, admission: &Admission, outcome: Option<Outcome>) {
        let latency = admission.start.elapsed();

        if self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |in_flight| {
                in_flight.checked_sub(1)
            })
            .is_err()
        {
            error!(
                message = "Released more tokens than were acquired.",
                limiter = self.name,
            );
        }

        match outcome {
            Some(outcome) => {
                let _entered = self.span.enter();

                let limit = self.limit_algo.update(Sample {
                    latency,
                    in_flight: admission.in_flight,
                    admissions: admission.admissions,
                    outcome,
                });
                self.events.limit(limit);

                match outcome {
                    Outcome::Success => self.events.success(),
                    Outcome::Dropped => self.events.dropped(),
                }
            }
            None => self.events.ignored(),
        }
    }
}

impl LimiterState {
    /// The current concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
    /// The amount of concurrency available to use.
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_flight)
    }
    /// The number of requests in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}
