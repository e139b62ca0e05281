//! Algorithms for controlling concurrency limits.

mod defaults;
mod fixed;
mod gradient2;

use std::{fmt::Debug, time::Duration};

use crate::Outcome;

pub(crate) use defaults::*;
pub use fixed::Fixed;
pub use gradient2::Gradient2;

/// An algorithm for controlling a concurrency limit.
///
/// Updates are synchronous and must not block for long: they run on the request path when a
/// [Listener](crate::Listener) is released.
pub trait LimitAlgorithm: Debug + Send + Sync {
    /// The current limit.
    fn limit(&self) -> usize;

    /// Update the concurrency limit in response to a new job completion.
    ///
    /// Returns the new limit.
    fn update(&self, sample: Sample) -> usize;
}

/// The result of a job, including the [Outcome] and latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub(crate) latency: Duration,
    /// Jobs in flight when this job was admitted, including itself.
    pub(crate) in_flight: usize,
    /// Total admissions made by the limiter when this job was admitted.
    pub(crate) admissions: u64,
    pub(crate) outcome: Outcome,
}

impl Sample {
    /// Time from admission to release.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Jobs in flight when this job was admitted, including itself.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Total admissions made by the limiter when this job was admitted.
    pub fn admissions(&self) -> u64 {
        self.admissions
    }

    /// How the job ended.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}
