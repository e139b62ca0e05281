use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use conv::ConvUtil;
use tracing::{debug, trace};

use crate::{
    config::{ConfigError, LimitConfig},
    limits::Sample,
    moving_avg::ExpSmoothed,
    Outcome,
};

use super::{defaults::*, LimitAlgorithm};

/// Delay-based congestion avoidance.
///
/// Compares the average latency over a short window of samples with the average over a long
/// window. When recent latency rises above the long-term baseline the limit is reduced in
/// proportion; while the two agree the limit grows by a queueing allowance of `√limit`.
///
/// Growth only applies while at least half the limit is in use, plus one probing step every
/// [`probe_interval`](crate::LimitConfig::probe_interval) admissions. A lightly loaded limiter
/// holds its limit rather than inflating it.
///
/// For each sample:
///
/// ```text
/// gradient  = clamp(long / short, 0.5, 1.0)       (halved again for dropped jobs)
/// new_limit = limit * gradient + max(1, √limit)     (growth term only when not app-limited)
/// limit     = limit * (1 - smoothing) + new_limit * smoothing
/// ```
///
/// Samples far above the long-term baseline (see
/// [`LimitConfig::long_outlier_ratio`](crate::LimitConfig)) only contribute to the short window,
/// so a burst of slow requests can't drag the baseline up with it.
///
/// Inspired by TCP congestion control algorithms using delay gradients.
///
/// - [Revisiting TCP Congestion Control Using Delay Gradients](https://hal.science/hal-01597987/)
#[derive(Debug)]
pub struct Gradient2 {
    min_limit: usize,
    max_limit: usize,
    smoothing: f64,
    long_window: u32,
    long_outlier_ratio: f64,
    probe_interval: u64,

    limit: AtomicUsize,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    short_rtt: ExpSmoothed,
    long_rtt: ExpSmoothed,
    /// Smoothed lower bound of observed latency, in seconds.
    rtt_noise: f64,
    limit: f64,
    /// Admission count at the last probe.
    last_probe: u64,
}

impl Gradient2 {
    const MIN_GRADIENT: f64 = 0.5;
    const MAX_GRADIENT: f64 = 1.0;

    const DROPPED_PENALTY: f64 = 0.5;

    /// When the long window average exceeds the short by this factor, decay it.
    const LONG_RTT_RECOVERY_RATIO: f64 = 2.0;
    const LONG_RTT_DECAY: f64 = 0.95;

    /// Default bounds and tuning, starting from `initial_limit`.
    pub fn new_with_initial_limit(initial_limit: usize) -> Self {
        assert!(initial_limit > 0);

        Self {
            min_limit: DEFAULT_MIN_LIMIT,
            max_limit: DEFAULT_MAX_LIMIT.max(initial_limit),
            smoothing: DEFAULT_SMOOTHING,
            long_window: DEFAULT_LONG_WINDOW,
            long_outlier_ratio: DEFAULT_LONG_OUTLIER_RATIO,
            probe_interval: DEFAULT_PROBE_INTERVAL,

            limit: AtomicUsize::new(initial_limit),
            inner: Mutex::new(Inner::new(
                DEFAULT_SHORT_WINDOW,
                DEFAULT_LONG_WINDOW,
                initial_limit,
            )),
        }
    }

    /// Build from a validated configuration.
    pub fn from_config(config: &LimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            min_limit: config.min_limit,
            max_limit: config.max_limit,
            smoothing: config.smoothing,
            long_window: config.long_window,
            long_outlier_ratio: config.long_outlier_ratio,
            probe_interval: config.probe_interval,

            limit: AtomicUsize::new(config.initial_limit),
            inner: Mutex::new(Inner::new(
                config.short_window,
                config.long_window,
                config.initial_limit,
            )),
        })
    }

    /// The limit never drops below `min`.
    pub fn with_min_limit(self, min: usize) -> Self {
        assert!(min > 0);
        assert!(min <= self.limit(), "initial limit must be >= min limit");
        Self {
            min_limit: min,
            ..self
        }
    }

    /// The limit never grows above `max`.
    pub fn with_max_limit(self, max: usize) -> Self {
        assert!(max >= self.limit(), "initial limit must be <= max limit");
        Self {
            max_limit: max,
            ..self
        }
    }

    /// How far each update moves the limit towards its target. `1.0` applies the target directly.
    pub fn with_smoothing(self, smoothing: f64) -> Self {
        assert!(smoothing > 0.0 && smoothing <= 1.0);
        Self { smoothing, ..self }
    }

    /// Seed the long-term latency baseline, e.g. from a previous run.
    pub fn with_initial_rtt(mut self, rtt: Duration) -> Self {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        inner.long_rtt.set(rtt);
        self
    }

    /// The lower bound on the limit.
    pub fn min_limit(&self) -> usize {
        self.min_limit
    }

    /// The upper bound on the limit.
    pub fn max_limit(&self) -> usize {
        self.max_limit
    }

    /// Average latency over the short window.
    pub fn short_rtt(&self) -> Duration {
        self.lock().short_rtt.value()
    }

    /// Average latency over the long window, i.e. the baseline.
    pub fn long_rtt(&self) -> Duration {
        self.lock().long_rtt.value()
    }

    /// Smoothed lower bound of observed latency.
    pub fn rtt_noise(&self) -> Duration {
        Duration::from_secs_f64(self.lock().rtt_noise)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("gradient mutex is poisoned")
    }

    /// Allowance for growth per update.
    fn queue_size(limit: f64) -> f64 {
        limit.sqrt().max(1.0)
    }

    fn round(&self, limit: f64) -> usize {
        limit
            .round()
            .approx_as::<usize>()
            .expect("limit is clamped within usize bounds")
            .clamp(self.min_limit, self.max_limit)
    }
}

impl LimitAlgorithm for Gradient2 {
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    fn update(&self, sample: Sample) -> usize {
        if sample.latency.is_zero() {
            return self.limit();
        }

        let mut inner = self.lock();

        inner.observe_noise(sample.latency, self.long_window);

        let short = inner.short_rtt.sample(sample.latency).as_secs_f64();

        // Nothing to compare against yet.
        if inner.long_rtt.is_empty() {
            inner.long_rtt.sample(sample.latency);
            return self.limit();
        }

        if sample.latency.as_secs_f64() <= inner.long_rtt.secs() * self.long_outlier_ratio {
            inner.long_rtt.sample(sample.latency);
        }

        // Less than half the limit in use: latency says nothing about whether more concurrency
        // would be tolerated.
        let app_limited = (sample.in_flight as f64) < inner.limit / 2.0;

        // Periodically probe upwards, allowing one growth step even while app-limited. Latency
        // may also have settled on a new plateau which the outlier band keeps out of the long
        // window, so re-baseline while there's demand.
        let mut probing = false;
        if sample.admissions.saturating_sub(inner.last_probe) >= self.probe_interval {
            inner.last_probe = sample.admissions;
            probing = true;

            if !app_limited && short > inner.long_rtt.secs() {
                trace!(
                    message = "Probing: resetting long window latency.",
                    short_rtt = ?inner.short_rtt.value(),
                    long_rtt = ?inner.long_rtt.value(),
                );
                let short_rtt = inner.short_rtt.value();
                inner.long_rtt.set(short_rtt);
            }
        }

        let long = inner.long_rtt.secs();

        let divisor = short.max(inner.rtt_noise);
        let mut gradient = if short > 0.0 && divisor > 0.0 {
            // Don't allow the limit to be reduced by more than half for a single sample, to
            // avoid aggressive load shedding due to outliers.
            (long / divisor).clamp(Self::MIN_GRADIENT, Self::MAX_GRADIENT)
        } else {
            Self::MAX_GRADIENT
        };

        if sample.outcome == Outcome::Dropped {
            gradient *= Self::DROPPED_PENALTY;
        }

        // Speed up return to baseline after a long period of increased load.
        if short > 0.0 && long / short > Self::LONG_RTT_RECOVERY_RATIO {
            inner.long_rtt.set(Duration::from_secs_f64(long * Self::LONG_RTT_DECAY));
        }

        let old_limit = inner.limit;

        // Apply gradient, and allow a queueing allowance for growth.
        let growth = if app_limited && !probing {
            0.0
        } else {
            Self::queue_size(old_limit)
        };
        let mut new_limit = old_limit * gradient + growth;
        new_limit = old_limit * (1.0 - self.smoothing) + new_limit * self.smoothing;

        new_limit = new_limit.clamp(self.min_limit as f64, self.max_limit as f64);

        inner.limit = new_limit;
        let rounded_limit = self.round(new_limit);
        let previous = self.limit.swap(rounded_limit, Ordering::AcqRel);

        if previous != rounded_limit {
            debug!(
                message = "Concurrency limit changed.",
                limit = rounded_limit,
                previous,
                gradient,
                app_limited,
                short_rtt = ?inner.short_rtt.value(),
                long_rtt = ?inner.long_rtt.value(),
            );
        }

        rounded_limit
    }
}

impl Inner {
    fn new(short_window: u32, long_window: u32, initial_limit: usize) -> Self {
        Self {
            short_rtt: ExpSmoothed::new_with_window_size(short_window),
            long_rtt: ExpSmoothed::new_with_window_size(long_window),
            rtt_noise: 0.0,
            limit: initial_limit as f64,
            last_probe: 0,
        }
    }

    /// Drops straight to any lower latency, drifts slowly upwards otherwise.
    fn observe_noise(&mut self, latency: Duration, long_window: u32) {
        let latency = latency.as_secs_f64();
        if self.rtt_noise == 0.0 || latency < self.rtt_noise {
            self.rtt_noise = latency;
        } else {
            self.rtt_noise += (latency - self.rtt_noise) / f64::from(long_window);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn sample(latency: Duration) -> Sample {
        Sample {
            latency,
            in_flight: 1,
            admissions: 0,
            outcome: Outcome::Success,
        }
    }

    /// A sample from a job admitted with the limiter fully in use.
    fn saturated(latency: Duration, limit: usize) -> Sample {
        Sample {
            in_flight: limit,
            ..sample(latency)
        }
    }

    fn dropped(latency: Duration) -> Sample {
        Sample {
            outcome: Outcome::Dropped,
            ..sample(latency)
        }
    }

    fn config(min_limit: usize, max_limit: usize, initial_limit: usize) -> LimitConfig {
        LimitConfig {
            min_limit,
            max_limit,
            initial_limit,
            ..LimitConfig::default()
        }
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = (actual.as_secs_f64() - expected.as_secs_f64()).abs();
        assert!(diff < 1e-6, "actual = {actual:?}, expected = {expected:?}");
    }

    #[test]
    fn first_sample_only_records_history() {
        let gradient = Gradient2::new_with_initial_limit(10);

        assert_eq!(gradient.update(sample(ms(5))), 10);
        assert_close(gradient.long_rtt(), ms(5));
        assert_close(gradient.short_rtt(), ms(5));
    }

    #[test]
    fn zero_latency_is_ignored() {
        let gradient = Gradient2::new_with_initial_limit(10).with_initial_rtt(ms(1));

        assert_eq!(gradient.update(sample(Duration::ZERO)), 10);
        assert_eq!(gradient.short_rtt(), Duration::ZERO);
    }

    #[test]
    fn steady_latency_grows_by_queue_allowance() {
        let gradient = Gradient2::new_with_initial_limit(100).with_initial_rtt(ms(1));

        // 100 * 0.9 + (100 * 1.0 + √100) * 0.1
        assert_eq!(gradient.update(saturated(ms(1), 100)), 101);
    }

    #[test]
    fn app_limited_traffic_holds_the_limit() {
        let gradient = Gradient2::new_with_initial_limit(100).with_initial_rtt(ms(1));

        for _ in 0..100 {
            assert_eq!(gradient.update(sample(ms(1))), 100);
        }

        // Exactly half in use counts as demand.
        assert_eq!(gradient.update(saturated(ms(1), 50)), 101);
    }

    #[test]
    fn periodic_growth_while_app_limited() {
        let config = LimitConfig {
            probe_interval: 5,
            ..config(1, 1000, 100)
        };
        let gradient = Gradient2::from_config(&config)
            .unwrap()
            .with_initial_rtt(ms(1));

        let limits: Vec<usize> = (1..=10)
            .map(|admissions| {
                gradient.update(Sample {
                    admissions,
                    ..sample(ms(1))
                })
            })
            .collect();

        assert_eq!(limits, [100, 100, 100, 100, 101, 101, 101, 101, 101, 102]);
    }

    #[test]
    fn sequential_requests_grow_from_min() {
        let gradient = Gradient2::from_config(&config(1, 5, 1))
            .unwrap()
            .with_initial_rtt(ms(1));

        let mut previous = gradient.limit();
        for _ in 0..10 {
            let limit = gradient.update(sample(ms(1)));
            assert!(limit >= previous, "limit should grow monotonically");
            assert!(limit <= 5);
            previous = limit;
        }
        assert!(previous >= 2, "limit = {previous}");

        for _ in 0..200 {
            gradient.update(saturated(ms(1), gradient.limit()));
        }
        assert_eq!(gradient.limit(), 5);
    }

    #[test]
    fn latency_increase_reduces_limit_gradually() {
        let gradient = Gradient2::from_config(&config(5, 100, 50)).unwrap();

        for _ in 0..100 {
            let limit = gradient.update(sample(ms(1)));
            assert!(
                (45..=55).contains(&limit),
                "steady latency should hold the limit near 50, got {limit}"
            );
        }

        let after_one = gradient.update(sample(ms(100)));
        assert!(after_one < 50, "increased latency: decrease limit");
        assert!(
            after_one >= 25,
            "a single sample can't more than halve the limit, got {after_one}"
        );

        let mut limits = vec![after_one];
        for _ in 1..20 {
            let limit = gradient.update(sample(ms(100)));
            assert!(limit <= *limits.last().unwrap());
            assert!(limit >= 5);
            limits.push(limit);
        }

        // Each step moves a tenth of the way towards half the current limit.
        assert!(
            (25..=35).contains(&limits[9]),
            "limit should approach 25 after 10 slow samples, got {}",
            limits[9]
        );
        assert!(limits[19] < limits[9]);

        // Slow samples don't drag the baseline with them.
        assert!(gradient.long_rtt() < ms(2));
    }

    #[test]
    fn gradient_is_clamped_to_half() {
        let gradient = Gradient2::new_with_initial_limit(100)
            .with_smoothing(1.0)
            .with_initial_rtt(ms(1));

        // 100 * 0.5 + √100
        assert_eq!(
            gradient.update(saturated(Duration::from_secs(1), 100)),
            60
        );
    }

    #[test]
    fn dropped_samples_apply_penalty() {
        let gradient = Gradient2::new_with_initial_limit(100)
            .with_smoothing(1.0)
            .with_initial_rtt(ms(1));

        // 100 * (1.0 * 0.5) + √100
        let busy_dropped = |latency| Sample {
            in_flight: 100,
            ..dropped(latency)
        };
        assert_eq!(gradient.update(busy_dropped(ms(1))), 60);

        let gradient = Gradient2::new_with_initial_limit(100)
            .with_smoothing(1.0)
            .with_initial_rtt(ms(1));

        // 100 * (0.5 * 0.5) + √100
        assert_eq!(gradient.update(busy_dropped(Duration::from_secs(1))), 35);
    }

    #[test]
    fn never_shrinks_below_min() {
        let gradient = Gradient2::from_config(&config(10, 100, 12))
            .unwrap()
            .with_smoothing(1.0)
            .with_initial_rtt(ms(1));

        for _ in 0..10 {
            assert!(gradient.update(dropped(Duration::from_secs(1))) >= 10);
        }
        assert_eq!(gradient.limit(), 10);
    }

    #[test]
    fn long_window_ignores_outliers() {
        let gradient = Gradient2::new_with_initial_limit(10).with_initial_rtt(ms(10));

        gradient.update(sample(ms(25)));
        assert_close(gradient.long_rtt(), ms(10));

        gradient.update(sample(ms(20)));
        assert!(gradient.long_rtt() > ms(10));
    }

    #[test]
    fn long_window_recovers_after_load() {
        let gradient = Gradient2::new_with_initial_limit(10);
        let mut mirror = ExpSmoothed::new_with_window_size(DEFAULT_LONG_WINDOW);

        for latency in std::iter::repeat(ms(10))
            .take(100)
            .chain(std::iter::repeat(ms(1)).take(30))
        {
            gradient.update(sample(latency));
            mirror.sample(latency);
        }

        assert!(
            gradient.long_rtt().as_secs_f64() < mirror.secs() * 0.9,
            "long = {:?}, plain average = {:?}",
            gradient.long_rtt(),
            mirror.value(),
        );
    }

    #[test]
    fn probe_rebaselines_on_latency_plateau() {
        let config = LimitConfig {
            probe_interval: 5,
            ..config(1, 100, 10)
        };
        let gradient = Gradient2::from_config(&config)
            .unwrap()
            .with_initial_rtt(ms(1));

        for admissions in 1..5 {
            gradient.update(Sample {
                in_flight: 10,
                admissions,
                ..sample(ms(3))
            });
        }
        assert_close(gradient.long_rtt(), ms(1));

        gradient.update(Sample {
            in_flight: 10,
            admissions: 5,
            ..sample(ms(3))
        });
        assert_close(gradient.long_rtt(), gradient.short_rtt());
    }

    #[test]
    fn probe_skipped_without_demand() {
        let config = LimitConfig {
            probe_interval: 5,
            ..config(1, 100, 10)
        };
        let gradient = Gradient2::from_config(&config)
            .unwrap()
            .with_initial_rtt(ms(1));

        for admissions in 1..=10 {
            gradient.update(Sample {
                in_flight: 1,
                admissions,
                ..sample(ms(3))
            });
        }
        assert_close(gradient.long_rtt(), ms(1));
    }

    #[test]
    fn rtt_noise_tracks_lower_bound() {
        let gradient = Gradient2::new_with_initial_limit(10);

        gradient.update(sample(ms(5)));
        assert_close(gradient.rtt_noise(), ms(5));

        gradient.update(sample(ms(2)));
        assert_close(gradient.rtt_noise(), ms(2));

        gradient.update(sample(ms(4)));
        assert!(gradient.rtt_noise() > ms(2));
        assert!(gradient.rtt_noise() < Duration::from_micros(2010));
    }

    proptest! {
        #[test]
        fn limit_stays_within_bounds(
            latencies in prop::collection::vec((1u64..5_000_000, any::<bool>()), 1..300),
            min_limit in 1usize..50,
            extra in 0usize..500,
        ) {
            let max_limit = min_limit + extra;
            let gradient = Gradient2::from_config(&config(min_limit, max_limit, min_limit)).unwrap();

            for (admissions, (micros, is_dropped)) in (0u64..).zip(latencies) {
                let latency = Duration::from_micros(micros);
                let before = gradient.limit();
                let base = if is_dropped { dropped(latency) } else { sample(latency) };
                let after = gradient.update(Sample {
                    in_flight: before,
                    admissions,
                    ..base
                });

                prop_assert!(after >= min_limit && after <= max_limit);
                prop_assert_eq!(after, gradient.limit());
                if !is_dropped {
                    prop_assert!(2 * after + 2 >= before, "before = {}, after = {}", before, after);
                }
            }
        }
    }
}
