//! Limiter configuration.
//!
//! Loading configuration is left to the application. Every type here deserialises with `serde`
//! and falls back to hard-coded defaults for anything left unset.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limits::{
    DEFAULT_LONG_OUTLIER_RATIO, DEFAULT_LONG_WINDOW, DEFAULT_PROBE_INTERVAL, DEFAULT_SHORT_WINDOW,
    DEFAULT_SMOOTHING,
};

/// An invalid limiter configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The minimum limit must allow at least one request.
    #[error("min_limit must be at least 1")]
    ZeroMinLimit,

    /// The maximum limit is lower than the minimum.
    #[error("max_limit ({max}) must be >= min_limit ({min})")]
    MaxBelowMin {
        /// The configured minimum.
        min: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The initial limit falls outside the bounds.
    #[error("initial_limit ({initial}) must be within [{min}, {max}]")]
    InitialOutOfRange {
        /// The configured initial limit.
        initial: usize,
        /// The configured minimum.
        min: usize,
        /// The configured maximum.
        max: usize,
    },

    /// Smoothing must move the limit at least a little, and no further than its target.
    #[error("smoothing ({0}) must be in (0, 1]")]
    InvalidSmoothing(f64),

    /// An averaging window holds no samples.
    #[error("{name} must be at least 1")]
    ZeroWindow {
        /// Which window.
        name: &'static str,
    },

    /// Outliers must be at least as slow as the long-term average.
    #[error("long_outlier_ratio ({0}) must be >= 1")]
    InvalidOutlierRatio(f64),

    /// Probing must happen after some number of admissions.
    #[error("probe_interval must be at least 1")]
    ZeroProbeInterval,

    /// Wraps an error for one of the named limiters.
    #[error("invalid configuration for limiter `{name}`: {source}")]
    Limiter {
        /// The limiter with the invalid configuration.
        name: &'static str,
        /// What's wrong with it.
        source: Box<ConfigError>,
    },
}

/// Configuration for a single adaptive limiter.
///
/// The defaults match the `write` limiter.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitConfig {
    /// The limit never drops below this.
    pub min_limit: usize,

    /// The limit never grows above this.
    pub max_limit: usize,

    /// The limit before any latency has been observed.
    pub initial_limit: usize,

    /// How far each sample moves the limit towards its target, in (0, 1].
    pub smoothing: f64,

    /// Number of samples in the long-term latency baseline.
    pub long_window: u32,

    /// Number of samples in the recent latency average.
    pub short_window: u32,

    /// Samples slower than this multiple of the long-term baseline are left out of it.
    pub long_outlier_ratio: f64,

    /// Admissions between attempts to re-baseline the long-term latency.
    pub probe_interval: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self::write()
    }
}

impl LimitConfig {
    /// Defaults for limiting write requests.
    pub const fn write() -> Self {
        Self::with_limits(100, 5000, 100)
    }

    /// Defaults for limiting requests to specially-classified paths.
    pub const fn special_path() -> Self {
        Self::with_limits(5, 5000, 5)
    }

    /// Default tuning with the given bounds.
    pub const fn with_limits(min_limit: usize, max_limit: usize, initial_limit: usize) -> Self {
        Self {
            min_limit,
            max_limit,
            initial_limit,
            smoothing: DEFAULT_SMOOTHING,
            long_window: DEFAULT_LONG_WINDOW,
            short_window: DEFAULT_SHORT_WINDOW,
            long_outlier_ratio: DEFAULT_LONG_OUTLIER_RATIO,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    /// Check the bounds and tuning parameters are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_limit == 0 {
            return Err(ConfigError::ZeroMinLimit);
        }
        if self.max_limit < self.min_limit {
            return Err(ConfigError::MaxBelowMin {
                min: self.min_limit,
                max: self.max_limit,
            });
        }
        if !(self.min_limit..=self.max_limit).contains(&self.initial_limit) {
            return Err(ConfigError::InitialOutOfRange {
                initial: self.initial_limit,
                min: self.min_limit,
                max: self.max_limit,
            });
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(ConfigError::InvalidSmoothing(self.smoothing));
        }
        if self.long_window == 0 {
            return Err(ConfigError::ZeroWindow {
                name: "long_window",
            });
        }
        if self.short_window == 0 {
            return Err(ConfigError::ZeroWindow {
                name: "short_window",
            });
        }
        if !(self.long_outlier_ratio >= 1.0) {
            return Err(ConfigError::InvalidOutlierRatio(self.long_outlier_ratio));
        }
        if self.probe_interval == 0 {
            return Err(ConfigError::ZeroProbeInterval);
        }
        Ok(())
    }
}

/// Configuration for the whole [LimiterRegistry](crate::LimiterRegistry).
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Start with every limiter disabled.
    pub disabled: bool,

    /// The limiter for requests which may modify state.
    pub write: LimitConfig,

    /// The limiter for specially classified paths.
    #[serde(rename = "special-path")]
    pub special_path: LimitConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            write: LimitConfig::write(),
            special_path: LimitConfig::special_path(),
        }
    }
}

impl RegistryConfig {
    /// Check every limiter's configuration, naming the limiter on error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [("write", &self.write), ("special-path", &self.special_path)];
        for (name, config) in named {
            config.validate().map_err(|source| ConfigError::Limiter {
                name,
                source: Box::new(source),
            })?;
        }
        Ok(())
    }
}
