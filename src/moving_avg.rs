//! Moving averages.

use std::time::Duration;

/// An [exponential moving average](https://en.wikipedia.org/wiki/Exponential_smoothing) over a
/// bounded window of latency samples.
///
/// Until `window_size` samples have been seen the value is the plain mean of everything sampled
/// so far. After that each new sample carries a weight of `1 / window_size`.
///
/// Not synchronised. Callers serialise updates, e.g. behind the limit algorithm's mutex.
#[derive(Debug, Clone)]
pub(crate) struct ExpSmoothed {
    window_size: u32,
    /// Capped at `window_size`.
    count: u32,
    /// Seconds.
    value: f64,
}

impl ExpSmoothed {
    pub(crate) fn new_with_window_size(window_size: u32) -> Self {
        assert!(window_size > 0, "window size must be > 0");

        Self {
            window_size,
            count: 0,
            value: 0.0,
        }
    }

    /// Add a sample, returning the new average.
    ///
    /// Zero-length samples carry no information and are ignored.
    pub(crate) fn sample(&mut self, sample: Duration) -> Duration {
        if sample.is_zero() {
            return self.value();
        }

        let divisor = (self.count + 1).min(self.window_size);
        self.value += (sample.as_secs_f64() - self.value) / f64::from(divisor);
        self.count = divisor;

        self.value()
    }

    /// Overwrite the current estimate, keeping the sample count.
    ///
    /// An empty average is treated as having seen one sample, so the next sample is blended in
    /// rather than replacing the value outright.
    pub(crate) fn set(&mut self, value: Duration) {
        self.value = value.as_secs_f64();
        self.count = self.count.max(1);
    }

    pub(crate) fn value(&self) -> Duration {
        Duration::from_secs_f64(self.value)
    }

    pub(crate) fn secs(&self) -> f64 {
        self.value
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> u32 {
        self.count
    }
}
