//! Admission control for HTTP requests.

use std::{future::Future, sync::Arc};

use http::{Method, Response, StatusCode};
use thiserror::Error;

use crate::{LimiterName, LimiterRegistry, Listener, Outcome};

/// Rejection returned when a limiter has no capacity for a request.
///
/// Handlers should respond with [status_code](Overloaded::status_code) without doing any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("server temporarily overloaded")]
pub struct Overloaded {
    /// The limiter which rejected the request.
    pub limiter: LimiterName,
}

impl Overloaded {
    /// Always `503 Service Unavailable`.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    /// A `503` response carrying the error message.
    pub fn into_response<B>(self) -> Response<B>
    where
        B: From<String>,
    {
        let mut response = Response::new(B::from(self.to_string()));
        *response.status_mut() = self.status_code();
        response
    }
}

/// Request extension which turns limiting off for a request, e.g. for a listener configured to
/// bypass limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisableLimiting(pub bool);

/// What the gate needs to know about a request to classify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRequest {
    /// The HTTP method.
    pub method: Method,
    /// Whether the path has been classified as needing the `special-path` limiter.
    pub path_limited: bool,
    /// Overrides limiting for this request. `Some(true)` bypasses every limiter.
    pub disable_override: Option<bool>,
}

impl GateRequest {
    /// A request with no special path classification or override.
    pub fn new(method: Method) -> Self {
        Self {
            method,
            path_limited: false,
            disable_override: None,
        }
    }

    /// Describe an HTTP request, reading any [DisableLimiting] extension.
    pub fn from_request<B>(request: &http::Request<B>, path_limited: bool) -> Self {
        Self {
            method: request.method().clone(),
            path_limited,
            disable_override: request
                .extensions()
                .get::<DisableLimiting>()
                .map(|disable| disable.0),
        }
    }

    /// Mark the path as needing the `special-path` limiter.
    pub fn with_path_limited(self, path_limited: bool) -> Self {
        Self {
            path_limited,
            ..self
        }
    }

    /// Set the per-request override. `true` bypasses limiting.
    pub fn with_disable_override(self, disable: bool) -> Self {
        Self {
            disable_override: Some(disable),
            ..self
        }
    }
}

/// Decides which limiter, if any, a request must pass through.
///
/// In order:
///
/// 1. A disable override bypasses limiting.
/// 2. Paths classified as limited use the `special-path` limiter, whatever the method.
/// 3. `GET`, `HEAD`, `OPTIONS` and `TRACE` requests bypass limiting.
/// 4. Everything else uses the `write` limiter.
///
/// Bypassed requests get a no-op [Listener] so handlers can report outcomes unconditionally.
#[derive(Debug, Clone)]
pub struct RequestGate {
    registry: Arc<LimiterRegistry>,
}

impl RequestGate {
    /// A gate admitting requests through the limiters in `registry`.
    pub fn new(registry: Arc<LimiterRegistry>) -> Self {
        Self { registry }
    }

    /// The limiters requests are admitted through.
    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    /// The limiter a request must pass through, or `None` if it bypasses limiting.
    pub fn classify(&self, request: &GateRequest) -> Option<LimiterName> {
        if request.disable_override == Some(true) {
            return None;
        }

        if request.path_limited {
            return Some(LimiterName::SpecialPath);
        }

        if is_read_only(&request.method) {
            return None;
        }

        Some(LimiterName::Write)
    }

    /// Admit a request, or reject it if its limiter is at capacity.
    pub fn acquire(&self, request: &GateRequest) -> Result<Listener, Overloaded> {
        match self.classify(request) {
            Some(name) => self.registry.acquire(name),
            None => Ok(Listener::noop()),
        }
    }

    /// Run `handler` for an admitted request, reporting its output to the limiter.
    ///
    /// The output is classified with [Classify]. If the handler panics or the returned future is
    /// dropped before completion, the token is released as ignored.
    pub async fn run<F>(&self, request: &GateRequest, handler: F) -> Result<F::Output, Overloaded>
    where
        F: Future,
        F::Output: Classify,
    {
        let listener = self.acquire(request)?;

        let output = handler.await;
        listener.release(output.outcome());

        Ok(output)
    }
}

fn is_read_only(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Maps a handler's output to the [Outcome] reported to the limiter.
///
/// `None` releases the token without a latency sample.
pub trait Classify {
    /// The outcome to report, or `None` to release without a sample.
    fn outcome(&self) -> Option<Outcome>;
}

impl Classify for Option<Outcome> {
    fn outcome(&self) -> Option<Outcome> {
        *self
    }
}

/// Server errors are dropped, everything else succeeded.
impl Classify for StatusCode {
    fn outcome(&self) -> Option<Outcome> {
        if self.is_server_error() {
            Some(Outcome::Dropped)
        } else {
            Some(Outcome::Success)
        }
    }
}

impl<B> Classify for Response<B> {
    fn outcome(&self) -> Option<Outcome> {
        self.status().outcome()
    }
}

impl<T, E> Classify for Result<T, E>
where
    T: Classify,
    E: Classify,
{
    fn outcome(&self) -> Option<Outcome> {
        match self {
            Ok(ok) => ok.outcome(),
            Err(err) => err.outcome(),
        }
    }
}
