pub(crate) const DEFAULT_MIN_LIMIT: usize = 1;
pub(crate) const DEFAULT_MAX_LIMIT: usize = 1000;

pub(crate) const DEFAULT_SMOOTHING: f64 = 0.1;

pub(crate) const DEFAULT_SHORT_WINDOW: u32 = 10;
pub(crate) const DEFAULT_LONG_WINDOW: u32 = 1000;

/// Samples more than this multiple of the long window average don't contribute to it.
pub(crate) const DEFAULT_LONG_OUTLIER_RATIO: f64 = 2.0;

pub(crate) const DEFAULT_PROBE_INTERVAL: u64 = 1000;
