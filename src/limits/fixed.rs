use super::{LimitAlgorithm, Sample};

/// A constant concurrency limit which ignores latency.
///
/// For when adaptive behaviour is unwanted, e.g. in front of a dependency with a known capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixed {
    limit: usize,
}

impl Fixed {
    /// Always allow exactly `limit` jobs in flight.
    pub fn new(limit: usize) -> Self {
        assert!(limit >= 1, "limit must admit at least one request");

        Self { limit }
    }
}

impl LimitAlgorithm for Fixed {
    fn limit(&self) -> usize {
        self.limit
    }

    fn update(&self, _sample: Sample) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::Outcome;

    use super::*;

    #[test]
    fn ignores_samples() {
        let fixed = Fixed::new(3);

        let slow = Sample {
            latency: Duration::from_secs(10),
            in_flight: 3,
            admissions: 1,
            outcome: Outcome::Dropped,
        };

        assert_eq!(fixed.update(slow), 3);
        assert_eq!(fixed.limit(), 3);
    }

    #[test]
    #[should_panic]
    fn zero_limit() {
        Fixed::new(0);
    }
}
