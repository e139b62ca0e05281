use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::time::Instant;

use super::{Outcome, Release};

/// A concurrency token held for the duration of one request.
///
/// Report how the request ended with exactly one of [success](Listener::success),
/// [dropped](Listener::dropped) or [ignored](Listener::ignored). The first call releases the
/// token; any later call is a no-op.
///
/// Dropping a listener without reporting is equivalent to calling `ignored`, so the token is
/// returned on every exit path, including a panic unwinding through the request handler.
///
/// Listeners handed out for disabled or bypassed requests hold no token and ignore every call.
#[must_use = "dropping a listener immediately releases it as ignored"]
pub struct Listener {
    inner: Option<Admission>,
}

pub(crate) struct Admission {
    limiter: Arc<dyn Release>,
    pub(crate) start: Instant,
    /// Jobs in flight when admitted, including this one.
    pub(crate) in_flight: usize,
    /// Total admissions when admitted, including this one.
    pub(crate) admissions: u64,
    released: AtomicBool,
}

impl Listener {
    pub(crate) fn new(limiter: Arc<dyn Release>, in_flight: usize, admissions: u64) -> Self {
        Self {
            inner: Some(Admission {
                limiter,
                start: Instant::now(),
                in_flight,
                admissions,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// A listener which holds no token.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Whether this listener holds a token.
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Whether the token has been released. Always true for listeners without one.
    pub fn is_released(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |admission| admission.released.load(Ordering::Acquire))
    }

    /// The request completed normally. Its latency updates the limit.
    pub fn success(&self) {
        self.release(Some(Outcome::Success));
    }

    /// The request failed because of a server-side error. Its latency updates the limit, with
    /// a penalty.
    pub fn dropped(&self) {
        self.release(Some(Outcome::Dropped));
    }

    /// Release the token without a latency measurement, e.g. after an early error.
    pub fn ignored(&self) {
        self.release(None);
    }

    /// Release the token with the given outcome. `None` is equivalent to
    /// [ignored](Listener::ignored).
    pub fn release(&self, outcome: Option<Outcome>) {
        if let Some(admission) = &self.inner {
            if admission
                .released
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                admission.limiter.release(admission, outcome);
            }
        }
    }

    /// Run `f` while holding the token, reporting the outcome it returns.
    ///
    /// If `f` panics the token is released as ignored and the panic resumes.
    pub fn scope<F, T>(self, f: F) -> T
    where
        F: FnOnce() -> (T, Option<Outcome>),
    {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok((value, outcome)) => {
                self.release(outcome);
                value
            }
            Err(panic) => {
                self.ignored();
                panic::resume_unwind(panic)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_latency(&mut self, latency: std::time::Duration) {
        if let Some(admission) = &mut self.inner {
            admission.start = Instant::now()
                .checked_sub(latency)
                .expect("latency shouldn't precede the clock's epoch");
        }
    }
}

impl Drop for Listener {
    /// Releases the token back to the limiter if nothing was reported.
    fn drop(&mut self) {
        self.ignored();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(admission) => f
                .debug_struct("Listener")
                .field("start", &admission.start)
                .field("in_flight", &admission.in_flight)
                .field("released", &admission.released.load(Ordering::Relaxed))
                .finish(),
            None => f.debug_tuple("Listener::Noop").finish(),
        }
    }
}
