//! Graph configuration.
//!
//! Only base fractions and blend factors live here. None of them is a limit
//! on its own: every cutoff is `mean + fraction * stddev` of a running
//! statistic, so the values below only say how far from the mean to cut.

use serde::{Deserialize, Serialize};

use crate::port::PortRouting;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Samples a channel needs before its thresholds stop being placeholders.
    pub min_samples: u64,
    /// Weight floor sits this many stddevs below the mean weight.
    pub bounds_fraction: f32,
    /// Share of the gap between `mean + bounds_fraction * stddev` and 1 that
    /// the ceiling may use.
    pub ceiling_headroom: f32,
    /// Stop when stop-confidence reaches the Confidence threshold at this fraction.
    pub stop_fraction: f32,
    /// Cycle window is half the PathLength threshold at this fraction.
    pub cycle_fraction: f32,
    /// Output budget adds the PathLength threshold at this fraction.
    pub budget_fraction: f32,
    /// Hierarchy boundary margin from the Variability channel.
    pub variability_fraction: f32,
    /// Edges inside a chunk must weigh at least the Weight threshold at this fraction.
    pub recurrence_fraction: f32,
    /// Spread activation is kept from the Activation threshold at this fraction up.
    pub spread_fraction: f32,
    /// Neighbor-examination cap from the Variability channel.
    pub neighbor_fraction: f32,
    /// Weight of context similarity in decode scoring.
    pub similarity_blend: f32,
    /// Weight of the hierarchy signal in decode scoring.
    pub hierarchy_blend: f32,
    pub routing: PortRouting,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            min_samples: 2,
            bounds_fraction: 2.0,
            ceiling_headroom: 0.5,
            stop_fraction: 0.0,
            cycle_fraction: 0.0,
            budget_fraction: 2.0,
            variability_fraction: 1.0,
            recurrence_fraction: -0.5,
            spread_fraction: -1.0,
            neighbor_fraction: 1.0,
            similarity_blend: 0.5,
            hierarchy_blend: 0.5,
            routing: PortRouting::default(),
        }
    }
}

impl GraphConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_samples == 0 {
            return Err(Error::Config("min_samples must be at least 1".into()));
        }
        let fractions = [
            ("bounds_fraction", self.bounds_fraction),
            ("ceiling_headroom", self.ceiling_headroom),
            ("stop_fraction", self.stop_fraction),
            ("cycle_fraction", self.cycle_fraction),
            ("budget_fraction", self.budget_fraction),
            ("variability_fraction", self.variability_fraction),
            ("recurrence_fraction", self.recurrence_fraction),
            ("spread_fraction", self.spread_fraction),
            ("neighbor_fraction", self.neighbor_fraction),
            ("similarity_blend", self.similarity_blend),
            ("hierarchy_blend", self.hierarchy_blend),
        ];
        if let Some((name, _)) = fractions.iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::Config(format!("{name} must be finite")));
        }
        if !(0.0..=1.0).contains(&self.ceiling_headroom) {
            return Err(Error::Config("ceiling_headroom must be within [0, 1]".into()));
        }
        if self.similarity_blend < 0.0 || self.hierarchy_blend < 0.0 {
            return Err(Error::Config("blend factors must be non-negative".into()));
        }
        Ok(())
    }
}
