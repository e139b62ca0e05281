//! Named limiters, shared by every request handler.

use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::info;

use crate::{
    config::{ConfigError, LimitConfig, RegistryConfig},
    limits::Gradient2,
    Listener, Overloaded, RequestLimiter,
};

/// The categories of request which are limited independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterName {
    /// Requests which may modify state.
    Write,
    /// Requests to paths classified as needing their own limit.
    SpecialPath,
}

/// Returned when parsing an unrecognised [LimiterName].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown limiter `{0}`")]
pub struct UnknownLimiter(String);

/// A set of named [RequestLimiter]s which can be disabled, enabled and reconfigured while
/// requests are in flight.
///
/// Reads are lock-free. Updates build a complete new set of limiters and swap it in atomically,
/// so a request sees either the old set or the new one. Requests admitted before an update keep
/// their token with the limiter which issued it.
#[derive(Debug)]
pub struct LimiterRegistry {
    limiters: ArcSwap<Limiters>,
    /// Serialises updates.
    config: Mutex<RegistryConfig>,
}

#[derive(Debug, Default)]
struct Limiters {
    write: Option<Arc<RequestLimiter>>,
    special_path: Option<Arc<RequestLimiter>>,
}

impl LimiterName {
    /// Every limiter name.
    pub const ALL: [LimiterName; 2] = [LimiterName::Write, LimiterName::SpecialPath];

    /// The name used in configuration, logs and metric labels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            LimiterName::Write => "write",
            LimiterName::SpecialPath => "special-path",
        }
    }
}

impl fmt::Display for LimiterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimiterName {
    type Err = UnknownLimiter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LimiterName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownLimiter(s.to_owned()))
    }
}

impl LimiterRegistry {
    /// Create a registry, building a limiter for each name unless the configuration disables
    /// them all.
    pub fn new(config: RegistryConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let limiters = if config.disabled {
            Limiters::default()
        } else {
            Limiters::build(&config)?
        };

        info!(
            message = "Request limiters registered.",
            enabled = !config.disabled,
            write_limit = config.write.initial_limit,
            special_path_limit = config.special_path.initial_limit,
        );

        Ok(Self {
            limiters: ArcSwap::from_pointee(limiters),
            config: Mutex::new(config),
        })
    }

    /// The limiter for `name`, or `None` if limiting is disabled.
    pub fn get(&self, name: LimiterName) -> Option<Arc<RequestLimiter>> {
        self.limiters.load().get(name).cloned()
    }

    /// Try to acquire a token from the named limiter.
    ///
    /// Always succeeds with a no-op [Listener] while limiting is disabled.
    pub fn acquire(&self, name: LimiterName) -> Result<Listener, Overloaded> {
        match self.get(name) {
            Some(limiter) => limiter.try_acquire().ok_or(Overloaded { limiter: name }),
            None => Ok(Listener::noop()),
        }
    }

    /// Whether requests are currently being limited.
    pub fn is_enabled(&self) -> bool {
        self.limiters.load().is_enabled()
    }

    /// The current configuration.
    pub fn config(&self) -> RegistryConfig {
        *self.lock_config()
    }

    /// Stop limiting requests.
    ///
    /// Tokens already handed out are still returned to the limiters which issued them.
    pub fn disable(&self) {
        let mut config = self.lock_config();
        if config.disabled {
            return;
        }

        config.disabled = true;
        self.limiters.store(Arc::new(Limiters::default()));

        info!(message = "Request limiters disabled.");
    }

    /// Start limiting requests again, with freshly initialised limiters.
    pub fn enable(&self) {
        let mut config = self.lock_config();
        if !config.disabled {
            return;
        }

        config.disabled = false;
        let limiters = Limiters::build(&config).expect("configuration was validated when stored");
        self.limiters.store(Arc::new(limiters));

        info!(message = "Request limiters enabled.");
    }

    /// Replace the configuration.
    ///
    /// Limiters are rebuilt from scratch, discarding learned latency and limits. On error the
    /// current configuration stays in place.
    pub fn reconfigure(&self, new_config: RegistryConfig) -> Result<(), ConfigError> {
        new_config.validate()?;

        let mut config = self.lock_config();

        let limiters = if new_config.disabled {
            Limiters::default()
        } else {
            Limiters::build(&new_config)?
        };
        self.limiters.store(Arc::new(limiters));
        *config = new_config;

        info!(
            message = "Request limiters reconfigured.",
            enabled = !new_config.disabled,
            write_limit = new_config.write.initial_limit,
            special_path_limit = new_config.special_path.initial_limit,
        );

        Ok(())
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, RegistryConfig> {
        self.config.lock().expect("registry mutex is poisoned")
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default()).expect("default configuration is valid")
    }
}

impl Limiters {
    fn build(config: &RegistryConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            write: Some(new_limiter(LimiterName::Write, &config.write)?),
            special_path: Some(new_limiter(
                LimiterName::SpecialPath,
                &config.special_path,
            )?),
        })
    }

    fn get(&self, name: LimiterName) -> Option<&Arc<RequestLimiter>> {
        match name {
            LimiterName::Write => self.write.as_ref(),
            LimiterName::SpecialPath => self.special_path.as_ref(),
        }
    }

    fn is_enabled(&self) -> bool {
        self.write.is_some() || self.special_path.is_some()
    }
}

fn new_limiter(
    name: LimiterName,
    config: &LimitConfig,
) -> Result<Arc<RequestLimiter>, ConfigError> {
    let limit_algo = Gradient2::from_config(config).map_err(|source| ConfigError::Limiter {
        name: name.as_str(),
        source: Box::new(source),
    })?;

    Ok(Arc::new(RequestLimiter::new(name.as_str(), limit_algo)))
}
