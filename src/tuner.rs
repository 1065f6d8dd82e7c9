//! Adaptive concurrency controller.
//!
//! Additive-increase / multiplicative-decrease over fixed-size observation
//! windows of request samples. The controller is the only writer of the
//! target; the worker pool reads it through [`ConcurrencyController::target`]
//! before admitting each unit.

use anyhow::{bail, Result};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct TunerConfig {
    /// Request samples per observation window
    pub window: usize,
    /// Failure ratio above which the window counts as unhealthy
    pub failure_threshold: f64,
    /// Mean-latency ratio versus the previous window that signals saturation
    pub latency_growth: f64,
    pub increase_step: usize,
    /// Multiplier applied on decrease, in (0, 1)
    pub decrease_factor: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            failure_threshold: 0.2,
            latency_growth: 1.5,
            increase_step: 1,
            decrease_factor: 0.5,
        }
    }
}

impl TunerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            bail!("TUNE_WINDOW must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            bail!("TUNE_FAILURE_THRESHOLD must be within [0, 1]");
        }
        if self.latency_growth <= 1.0 {
            bail!("TUNE_LATENCY_GROWTH must be greater than 1");
        }
        if self.increase_step == 0 {
            bail!("TUNE_INCREASE_STEP must be at least 1");
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            bail!("TUNE_DECREASE_FACTOR must be within (0, 1)");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Success,
    Failure,
    RateLimited,
}

/// One finished request as seen by the controller.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub outcome: SampleOutcome,
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increased { from: usize, to: usize },
    Decreased { from: usize, to: usize },
    Unchanged { target: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Fixed,
    Adaptive,
}

pub struct ConcurrencyController {
    mode: Mode,
    target: usize,
    ceiling: usize,
    config: TunerConfig,
    window: Vec<Sample>,
    previous_mean: Option<Duration>,
}

impl ConcurrencyController {
    /// Pass-through controller: the target never moves.
    pub fn fixed(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            mode: Mode::Fixed,
            target: workers,
            ceiling: workers,
            config: TunerConfig::default(),
            window: Vec::new(),
            previous_mean: None,
        }
    }

    pub fn adaptive(initial: usize, ceiling: usize, config: TunerConfig) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            mode: Mode::Adaptive,
            target: initial.clamp(1, ceiling),
            ceiling,
            window: Vec::with_capacity(config.window),
            config,
            previous_mean: None,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn is_adaptive(&self) -> bool {
        self.mode == Mode::Adaptive
    }

    /// Record one request. Returns the decision taken when this sample closes
    /// an observation window, `None` otherwise.
    pub fn observe(&mut self, sample: Sample) -> Option<Adjustment> {
        if self.mode == Mode::Fixed {
            return None;
        }

        self.window.push(sample);
        if self.window.len() < self.config.window {
            return None;
        }

        let adjustment = self.evaluate_window();
        self.window.clear();
        Some(adjustment)
    }

    fn evaluate_window(&mut self) -> Adjustment {
        let total = self.window.len();
        let failures = self
            .window
            .iter()
            .filter(|s| s.outcome != SampleOutcome::Success)
            .count();
        let rate_limited = self
            .window
            .iter()
            .any(|s| s.outcome == SampleOutcome::RateLimited);
        let failure_rate = failures as f64 / total as f64;

        let successes: Vec<Duration> = self
            .window
            .iter()
            .filter(|s| s.outcome == SampleOutcome::Success)
            .map(|s| s.latency)
            .collect();
        let mean = if successes.is_empty() {
            None
        } else {
            Some(successes.iter().sum::<Duration>() / successes.len() as u32)
        };

        let latency_grew = match (self.previous_mean, mean) {
            (Some(prev), Some(now)) => now.as_secs_f64() > prev.as_secs_f64() * self.config.latency_growth,
            _ => false,
        };
        if mean.is_some() {
            self.previous_mean = mean;
        }

        debug!(
            "Tuner window: {} samples, failure rate {:.2}, rate limited {}, mean latency {:?}",
            total, failure_rate, rate_limited, mean
        );

        let from = self.target;
        if failure_rate > self.config.failure_threshold || rate_limited || latency_grew {
            let scaled = (from as f64 * self.config.decrease_factor).floor() as usize;
            let to = scaled.clamp(1, from.saturating_sub(1).max(1));
            if to == from {
                return Adjustment::Unchanged { target: from };
            }
            self.target = to;
            info!(
                "Auto-tune: lowering concurrency {} -> {} (failure rate {:.0}%, rate limited: {}, latency grew: {})",
                from,
                to,
                failure_rate * 100.0,
                rate_limited,
                latency_grew
            );
            Adjustment::Decreased { from, to }
        } else {
            let to = (from + self.config.increase_step).min(self.ceiling);
            if to == from {
                return Adjustment::Unchanged { target: from };
            }
            self.target = to;
            info!("Auto-tune: raising concurrency {} -> {}", from, to);
            Adjustment::Increased { from, to }
        }
    }
}
