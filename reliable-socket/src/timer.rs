//! Retransmission-timeout estimation and backoff.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! reply arrives within a bounded time.  This module provides:
//! - [`RtoEstimator`]: the long-term smoothed RTT / deviation estimate
//!   (Jacobson/Karels) and the RTO derived from it.
//! - [`Backoff`]: the timeout actually applied within one send-and-wait
//!   attempt, doubling on every consecutive timeout.
//!
//! The two are kept apart so a string of timeouts never leaks into the
//! smoothed estimate: only a completed round trip produces a sample.
//!
//! `RTO = estimated_rtt + 4 × deviation_rtt`, clamped to
//! [`TimerConfig::min_rto`]..=[`TimerConfig::max_rto`].

use std::time::Duration;

/// Smoothing factor for the mean (1/8).
pub const ALPHA: f64 = 0.125;

/// Smoothing factor for the deviation (1/4).
pub const BETA: f64 = 0.25;

/// Multiplier applied to the deviation when deriving the RTO.
pub const DEVIATION_WEIGHT: f64 = 4.0;

/// Which mean the deviation update measures the new sample against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviationBasis {
    /// `|sample − estimated_rtt|` using the mean *before* this sample
    /// (classic Jacobson/Karels order).
    #[default]
    PriorMean,
    /// `|sample − estimated_rtt|` using the mean *after* folding the sample in.
    UpdatedMean,
}

/// Adjustable timeout parameters.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Mean assumed before the first RTT sample.
    pub initial_estimated_rtt: Duration,
    /// Deviation assumed before the first RTT sample.
    pub initial_deviation_rtt: Duration,
    /// Floor for the derived RTO.
    pub min_rto: Duration,
    /// Ceiling for the derived RTO and for backoff.
    pub max_rto: Duration,
    pub deviation_basis: DeviationBasis,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_estimated_rtt: Duration::from_millis(100),
            initial_deviation_rtt: Duration::from_millis(10),
            min_rto: Duration::from_millis(10),
            max_rto: Duration::from_secs(60),
            deviation_basis: DeviationBasis::PriorMean,
        }
    }
}

/// Smoothed round-trip statistics for one connection.
///
/// Values are kept as `f64` milliseconds so repeated smoothing does not lose
/// precision to integer truncation.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    estimated_rtt: f64,
    deviation_rtt: f64,
    samples: u64,
    config: TimerConfig,
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}

impl RtoEstimator {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            estimated_rtt: as_ms(config.initial_estimated_rtt),
            deviation_rtt: as_ms(config.initial_deviation_rtt),
            samples: 0,
            config,
        }
    }

    /// Fold one measured round trip into the estimate.
    ///
    /// `estimated = (1−α)·estimated + α·R`
    /// `deviation = (1−β)·deviation + β·|R − mean|`, where `mean` is chosen by
    /// [`TimerConfig::deviation_basis`].
    pub fn record_sample(&mut self, measured: Duration) {
        let sample = as_ms(measured);
        let prior = self.estimated_rtt;

        self.estimated_rtt = (1.0 - ALPHA) * prior + ALPHA * sample;
        let mean = match self.config.deviation_basis {
            DeviationBasis::PriorMean => prior,
            DeviationBasis::UpdatedMean => self.estimated_rtt,
        };
        self.deviation_rtt = (1.0 - BETA) * self.deviation_rtt + BETA * (sample - mean).abs();
        self.samples += 1;

        log::debug!(
            "[rto] sample={sample:.1}ms est={:.1}ms dev={:.1}ms rto={:?}",
            self.estimated_rtt,
            self.deviation_rtt,
            self.current_rto()
        );
    }

    /// `estimated_rtt + 4·deviation_rtt`, clamped to the configured bounds.
    pub fn current_rto(&self) -> Duration {
        let rto = self.estimated_rtt + DEVIATION_WEIGHT * self.deviation_rtt;
        Duration::from_nanos((rto.max(0.0) * 1e6).round() as u64)
            .clamp(self.config.min_rto, self.config.max_rto)
    }

    /// Smoothed mean in milliseconds.
    pub fn estimated_rtt_ms(&self) -> f64 {
        self.estimated_rtt
    }

    /// Smoothed deviation in milliseconds.
    pub fn deviation_rtt_ms(&self) -> f64 {
        self.deviation_rtt
    }

    /// Number of round trips folded in so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// A fresh backoff sequence starting from the current RTO.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.current_rto(), self.config.max_rto)
    }
}

/// Exponential backoff for one send-and-wait attempt.
///
/// Starts at the smoothed RTO; every [`Backoff::on_timeout`] doubles the
/// applied timeout (capped at `max`).  Dropped once the round trip
/// completes, so the next attempt starts from the smoothed value again.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    timeouts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base.min(max),
            max,
            timeouts: 0,
        }
    }

    /// Timeout to apply to the next wait.
    pub fn timeout(&self) -> Duration {
        self.current
    }

    /// Register one expired wait and return the doubled timeout.
    pub fn on_timeout(&mut self) -> Duration {
        self.timeouts += 1;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current
    }

    /// Consecutive timeouts seen so far.
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
