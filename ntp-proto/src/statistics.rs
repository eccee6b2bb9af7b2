//! Per-source rolling sample window and robust regression (spec §4.4).
//!
//! The estimator is a Theil–Sen-style robust linear fit: candidate starting
//! points are tried from the oldest sample forward, each yielding a
//! least-squares line `offset(t) = offset0 + freq * (t - t_ref)`. The
//! starting point is accepted once the sign sequence of its residuals looks
//! like a random walk (a "runs" test), rather than showing the long biased
//! runs a stale, systematically-wrong early segment would produce. This
//! lets the tail of the window dominate the fit without hand-picking a
//! window length.

use serde::{Deserialize, Serialize};

use crate::time::{NtpDuration, NtpTimestamp};

/// Minimum number of samples for `do_new_regression` to produce a usable
/// (`select_ok == true`) fit.
pub const MIN_SAMPLES_FOR_REGRESS: usize = 3;

/// Default maximum window length for a reference clock source (spec §3
/// invariants: "at most N_max samples... default 64 maximum filter length
/// for reference clocks").
pub const MAX_SAMPLES_REFCLOCK: usize = 64;

/// Default maximum window length for an NTP source (spec §3: "a smaller
/// effective window for NTP").
pub const MAX_SAMPLES_NTP: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: NtpTimestamp,
    pub offset: NtpDuration,
    pub peer_delay: NtpDuration,
    pub peer_dispersion: NtpDuration,
    pub root_delay: NtpDuration,
    pub root_dispersion: NtpDuration,
    pub stratum: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegressionResult {
    pub offset: NtpDuration,
    pub frequency: f64,
    pub skew: f64,
    pub variance: f64,
    pub stratum: u8,
    pub select_ok: bool,
    pub reference_time: NtpTimestamp,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectionData {
    pub stratum: u8,
    pub lo_limit: NtpDuration,
    pub hi_limit: NtpDuration,
    pub last_sample_age: NtpDuration,
    pub first_sample_age: NtpDuration,
    pub variance: f64,
    pub select_ok: bool,
    pub root_distance: NtpDuration,
}

#[derive(Debug, Clone, Copy)]
pub struct TrackingData {
    pub reference_time: NtpTimestamp,
    pub offset: NtpDuration,
    pub offset_sd: f64,
    pub frequency: f64,
    pub skew: f64,
    pub root_delay: NtpDuration,
    pub root_dispersion: NtpDuration,
}

#[derive(Debug, Clone)]
pub struct Statistics {
    samples: std::collections::VecDeque<Sample>,
    max_samples: usize,
    regression: RegressionResult,
    max_clock_error_ppm: f64,
}

impl Statistics {
    pub fn new(max_samples: usize, max_clock_error_ppm: f64) -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(max_samples),
            max_samples,
            regression: RegressionResult::default(),
            max_clock_error_ppm,
        }
    }

    pub fn for_ntp_source(max_clock_error_ppm: f64) -> Self {
        Self::new(MAX_SAMPLES_NTP, max_clock_error_ppm)
    }

    pub fn for_reference_clock(max_clock_error_ppm: f64) -> Self {
        Self::new(MAX_SAMPLES_REFCLOCK, max_clock_error_ppm)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Appends a sample, discarding the oldest one on overflow, then
    /// reruns the regression.
    #[tracing::instrument(skip(self), fields(len = self.samples.len()))]
    pub fn accumulate(&mut self, sample: Sample) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.do_new_regression();
    }

    /// Runs the robust regression over the current window. See module
    /// docs for the algorithm.
    #[tracing::instrument(skip(self), fields(len = self.samples.len()))]
    pub fn do_new_regression(&mut self) -> RegressionResult {
        let n = self.samples.len();
        if n == 0 {
            self.regression = RegressionResult::default();
            return self.regression;
        }

        let latest = self.samples.back().unwrap();
        let reference_time = latest.time;
        let stratum = latest.stratum;

        if n < MIN_SAMPLES_FOR_REGRESS {
            self.regression = RegressionResult {
                offset: latest.offset,
                frequency: 0.0,
                skew: f64::INFINITY,
                variance: 0.0,
                stratum,
                select_ok: false,
                reference_time,
            };
            return self.regression;
        }

        // try windows from the full history down to the minimum, stopping
        // at the first (largest) window whose residual signs pass the
        // runs test.
        let mut chosen = None;
        for start in 0..=(n - MIN_SAMPLES_FOR_REGRESS) {
            let window: Vec<&Sample> = self.samples.iter().skip(start).collect();
            let fit = linear_fit(&window, reference_time);
            if passes_runs_test(&fit.residuals) {
                chosen = Some(fit);
                break;
            }
            chosen = Some(fit);
        }

        let fit = chosen.expect("n >= MIN_SAMPLES_FOR_REGRESS implies at least one window");

        self.regression = RegressionResult {
            offset: NtpDuration::from_seconds(fit.intercept),
            frequency: fit.slope,
            skew: fit.skew,
            variance: fit.variance,
            stratum,
            select_ok: true,
            reference_time,
        };
        self.regression
    }

    pub fn regression(&self) -> RegressionResult {
        self.regression
    }

    pub fn get_selection_data(&self, now: NtpTimestamp) -> SelectionData {
        let r = self.regression;
        if !r.select_ok || self.samples.is_empty() {
            return SelectionData {
                stratum: r.stratum,
                lo_limit: NtpDuration::ZERO,
                hi_limit: NtpDuration::ZERO,
                last_sample_age: NtpDuration::ZERO,
                first_sample_age: NtpDuration::ZERO,
                variance: r.variance,
                select_ok: false,
                root_distance: NtpDuration::MAX_DISPERSION,
            };
        }

        let latest = self.samples.back().unwrap();
        let oldest = self.samples.front().unwrap();

        let projected = self.predict_offset(now);
        let elapsed = (now - r.reference_time).to_seconds();
        let dispersion_growth =
            NtpDuration::from_seconds((self.max_clock_error_ppm * 1e-6 * elapsed).abs());
        let root_distance =
            latest.root_dispersion + latest.root_delay.abs().divided_by(2) + dispersion_growth;

        SelectionData {
            stratum: r.stratum,
            lo_limit: projected - root_distance,
            hi_limit: projected + root_distance,
            last_sample_age: now - latest.time,
            first_sample_age: now - oldest.time,
            variance: r.variance,
            select_ok: true,
            root_distance,
        }
    }

    pub fn get_tracking_data(&self, now: NtpTimestamp) -> TrackingData {
        let r = self.regression;
        let latest = self.samples.back();
        TrackingData {
            reference_time: r.reference_time,
            offset: self.predict_offset(now),
            offset_sd: r.variance.sqrt(),
            frequency: r.frequency,
            skew: r.skew,
            root_delay: latest.map(|s| s.root_delay).unwrap_or(NtpDuration::ZERO),
            root_dispersion: latest
                .map(|s| s.root_dispersion)
                .unwrap_or(NtpDuration::MAX_DISPERSION),
        }
    }

    /// Adjusts stored sample times and offsets to stay consistent after a
    /// local clock step (`doffset`, statistics sign convention: positive
    /// means local was slow) and/or a frequency change (`dfreq`, the
    /// multiplicative correction just applied).
    pub fn slew_samples(&mut self, cooked_now: NtpTimestamp, dfreq: f64, doffset: f64) {
        for sample in self.samples.iter_mut() {
            let elapsed = (cooked_now - sample.time).to_seconds();
            sample.offset = sample.offset - NtpDuration::from_seconds(dfreq * elapsed + doffset);
            sample.time = sample.time - NtpDuration::from_seconds(doffset);
        }
        self.do_new_regression();
    }

    /// Uniformly inflates each sample's dispersion after an indeterminate
    /// time perturbation (e.g. while the source was unpolled).
    pub fn add_dispersion(&mut self, delta: NtpDuration) {
        for sample in self.samples.iter_mut() {
            sample.peer_dispersion = sample.peer_dispersion + delta;
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.regression = RegressionResult::default();
    }

    /// A snapshot suitable for persisting to a per-source dump file (spec
    /// §6). Round-tripping through `dump`/`load` reproduces the regression
    /// to within floating-point tolerance, since it carries the raw
    /// samples rather than the derived regression fields.
    pub fn dump(&self) -> StatisticsDump {
        StatisticsDump {
            max_samples: self.max_samples,
            max_clock_error_ppm: self.max_clock_error_ppm,
            samples: self.samples.iter().copied().collect(),
        }
    }

    pub fn load(&mut self, dump: &StatisticsDump) {
        self.max_samples = dump.max_samples;
        self.max_clock_error_ppm = dump.max_clock_error_ppm;
        self.samples = dump.samples.iter().copied().collect();
        self.do_new_regression();
    }

    pub fn min_round_trip_delay(&self) -> Option<NtpDuration> {
        self.samples.iter().map(|s| s.peer_delay).reduce(NtpDuration::min)
    }

    fn median_min_delay(&self) -> Option<NtpDuration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut delays: Vec<NtpDuration> = self.samples.iter().map(|s| s.peer_delay).collect();
        delays.sort();
        Some(delays[delays.len() / 2])
    }

    pub fn predict_offset(&self, when: NtpTimestamp) -> NtpDuration {
        let r = self.regression;
        let elapsed = (when - r.reference_time).to_seconds();
        r.offset + NtpDuration::from_seconds(r.frequency * elapsed)
    }

    /// Outlier predicate used by the protocol engine to reject a reply
    /// before it ever reaches the window (spec §4.4, §4.7).
    pub fn is_good_sample(
        &self,
        offset: NtpDuration,
        delay: NtpDuration,
        max_delay_dev_ratio: f64,
        max_delay_ratio: f64,
        clock_error_ppm: f64,
        when: NtpTimestamp,
    ) -> bool {
        let Some(median_delay) = self.median_min_delay() else {
            return true; // nothing to compare against yet
        };

        let elapsed = self
            .samples
            .back()
            .map(|s| (when - s.time).to_seconds().abs())
            .unwrap_or(0.0);
        let delay_ceiling = NtpDuration::from_seconds(median_delay.to_seconds() * max_delay_ratio)
            + NtpDuration::from_seconds(clock_error_ppm * 1e-6 * elapsed);
        if delay > delay_ceiling {
            return false;
        }

        if self.regression.select_ok {
            let predicted = self.predict_offset(when);
            let sample_sd = self.regression.variance.sqrt();
            if sample_sd > 0.0 {
                let deviation = (offset - predicted).to_seconds().abs();
                if deviation > max_delay_dev_ratio * sample_sd {
                    return false;
                }
            }
        }

        true
    }
}

/// Serializable snapshot of a source's sample window, written to/read
/// from the per-source dump file named after the source's dotted-quad
/// reference id (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsDump {
    pub max_samples: usize,
    pub max_clock_error_ppm: f64,
    pub samples: Vec<Sample>,
}

struct Fit {
    intercept: f64,
    slope: f64,
    skew: f64,
    variance: f64,
    residuals: Vec<f64>,
}

/// Ordinary least squares of `offset` against `time - reference_time`
/// (seconds), plus the standard error of the slope ("skew").
fn linear_fit(samples: &[&Sample], reference_time: NtpTimestamp) -> Fit {
    let n = samples.len() as f64;
    let xs: Vec<f64> = samples
        .iter()
        .map(|s| (s.time - reference_time).to_seconds())
        .collect();
    let ys: Vec<f64> = samples.iter().map(|s| s.offset.to_seconds()).collect();

    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        sxx += (x - mean_x).powi(2);
        sxy += (x - mean_x) * (y - mean_y);
    }

    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let intercept = mean_y - slope * mean_x;

    let residuals: Vec<f64> = xs
        .iter()
        .zip(ys.iter())
        .map(|(&x, &y)| y - (intercept + slope * x))
        .collect();

    let variance = if n > 2.0 {
        residuals.iter().map(|r| r * r).sum::<f64>() / (n - 2.0)
    } else {
        0.0
    };

    let skew = if sxx > 0.0 && n > 2.0 {
        (variance / sxx).sqrt()
    } else {
        f64::INFINITY
    };

    Fit {
        intercept,
        slope,
        skew,
        variance,
        residuals,
    }
}

/// A Wald–Wolfowitz runs test, relaxed to a simple threshold: too few sign
/// runs relative to sample count means the residuals still carry
/// structure (i.e. an early biased segment), so the caller should drop
/// more of the oldest samples and retry with a shorter window.
fn passes_runs_test(residuals: &[f64]) -> bool {
    if residuals.len() < 4 {
        return true;
    }

    let mut runs = 1usize;
    let mut last_positive = residuals[0] >= 0.0;
    for &r in &residuals[1..] {
        let positive = r >= 0.0;
        if positive != last_positive {
            runs += 1;
            last_positive = positive;
        }
    }

    // expected runs for a random +/- sequence of this length is roughly
    // n/2 + 1; require at least a third of that to call it random enough.
    let n = residuals.len();
    runs * 3 >= n
}
