//! # Running Statistics
//!
//! Incremental mean/variance/count per signal channel. This is the only place
//! the engine gets a threshold or a limit from: weight bounds, the stop
//! threshold, the cycle window, the output budget, the hierarchy margin and
//! the neighbor-examination cap are all `mean + fraction * stddev` of some
//! channel, combined with locally observable facts (degree, visits).
//!
//! While a channel has fewer than `min_samples` observations it reports a
//! [`Threshold::Placeholder`]. Callers must treat that as "no data yet" and
//! pick their neutral behavior explicitly.

use serde::{Deserialize, Serialize};

// ============================================================================
// Channels
// ============================================================================

/// A tracked signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Activation strengths produced while building activation patterns.
    Activation,
    /// Stop-confidence of the node a training sequence actually ended on.
    Confidence,
    /// Prediction error (training) and external feedback error.
    Error,
    /// Length of fed sequences in bytes.
    PathLength,
    /// Edge weight after every bounded update.
    Weight,
    /// Distinct live neighbors of nodes touched by a feed.
    Variability,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Activation,
        Channel::Confidence,
        Channel::Error,
        Channel::PathLength,
        Channel::Weight,
        Channel::Variability,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Channel::Activation => "activation",
            Channel::Confidence => "confidence",
            Channel::Error => "error",
            Channel::PathLength => "path_length",
            Channel::Weight => "weight",
            Channel::Variability => "variability",
        }
    }

    /// Value reported by a channel that has not seen enough samples.
    pub const fn neutral(self) -> f32 {
        match self {
            Channel::Activation | Channel::Confidence | Channel::Error => 0.5,
            Channel::PathLength | Channel::Weight | Channel::Variability => 0.0,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// RunningStatistic
// ============================================================================

/// Welford accumulator: O(1) update, numerically stable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStatistic {
    mean: f64,
    m2: f64,
    count: u64,
}

impl RunningStatistic {
    pub const fn new() -> Self {
        Self { mean: 0.0, m2: 0.0, count: 0 }
    }

    /// Rebuild from persisted parts.
    pub const fn from_parts(mean: f64, m2: f64, count: u64) -> Self {
        Self { mean, m2, count }
    }

    /// Non-finite values are ignored.
    pub fn record(&mut self, value: f32) {
        if !value.is_finite() {
            return;
        }
        let value = f64::from(value);
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f32 {
        self.mean as f32
    }

    pub fn m2(&self) -> f64 {
        self.m2
    }

    pub fn raw_mean(&self) -> f64 {
        self.mean
    }

    /// Population variance; zero until two samples exist.
    pub fn variance(&self) -> f32 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0) as f32
    }

    pub fn stddev(&self) -> f32 {
        self.variance().sqrt()
    }
}

// ============================================================================
// Threshold
// ============================================================================

/// A cutoff derived from a channel, or a flagged neutral stand-in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    /// `mean + fraction * stddev` over enough samples.
    Derived(f32),
    /// Not enough samples yet; carries the channel's neutral value.
    Placeholder(f32),
}

impl Threshold {
    pub fn value(self) -> f32 {
        match self {
            Threshold::Derived(v) | Threshold::Placeholder(v) => v,
        }
    }

    pub fn is_placeholder(self) -> bool {
        matches!(self, Threshold::Placeholder(_))
    }

    pub fn derived(self) -> Option<f32> {
        match self {
            Threshold::Derived(v) => Some(v),
            Threshold::Placeholder(_) => None,
        }
    }
}

// ============================================================================
// StatisticsTracker
// ============================================================================

/// One [`RunningStatistic`] per [`Channel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsTracker {
    channels: [RunningStatistic; 6],
    min_samples: u64,
}

impl StatisticsTracker {
    pub fn new(min_samples: u64) -> Self {
        Self {
            channels: [RunningStatistic::new(); 6],
            min_samples: min_samples.max(1),
        }
    }

    pub fn record(&mut self, channel: Channel, value: f32) {
        self.channels[channel.index()].record(value);
    }

    pub fn get(&self, channel: Channel) -> &RunningStatistic {
        &self.channels[channel.index()]
    }

    pub(crate) fn restore(&mut self, channel: Channel, stat: RunningStatistic) {
        self.channels[channel.index()] = stat;
    }

    pub fn min_samples(&self) -> u64 {
        self.min_samples
    }

    pub fn is_bootstrapping(&self, channel: Channel) -> bool {
        self.get(channel).count() < self.min_samples
    }

    /// `mean + base_fraction * stddev`, or a placeholder while bootstrapping.
    pub fn threshold(&self, channel: Channel, base_fraction: f32) -> Threshold {
        let stat = self.get(channel);
        if stat.count() < self.min_samples {
            return Threshold::Placeholder(channel.neutral());
        }
        Threshold::Derived(stat.mean() + base_fraction * stat.stddev())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, &RunningStatistic)> {
        Channel::ALL.iter().map(move |c| (*c, self.get(*c)))
    }
}

impl Default for StatisticsTracker {
    fn default() -> Self {
        Self::new(2)
    }
}

// ============================================================================
// Tests
// ============================================================================
