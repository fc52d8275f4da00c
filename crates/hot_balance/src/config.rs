//! Balancer configuration and its JSON update surface.
//!
//! The control plane exposes the scheduler's config over HTTP; the transport
//! lives there, this module only supplies the JSON shape
//! ([`BalanceConfig::to_json`] / [`BalanceConfig::apply_json`]).

use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::load::DIMENSION_COUNT;

/// Default fractional tolerance around normalized load 1.0.
pub const DEFAULT_BALANCE_RATIO: f64 = 0.1;
/// Stability gate: a cycle is skipped when hot peers explain less than this
/// fraction of any store's load on an allowed axis.
pub const LOAD_STABLE_THRESHOLD: f64 = 0.2;
/// Relaxation increment added to the balance ratio near equilibrium.
pub const ALLOWED_DEVIATION: f64 = 0.05;
/// No-progress cycles before the split fallback fires.
pub const DEFAULT_SPLIT_TRIGGER: u32 = 5;

const DEFAULT_MIN_EXP_LOADS: [f64; DIMENSION_COUNT] = [
    // Write floors: byte rate, key rate, and the ops floor mirrors keys.
    16.0 * 1024.0,
    256.0,
    256.0,
    // Read floors.
    128.0 * 1024.0,
    512.0,
    512.0,
];

/// Tunables for the hot-region balancer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BalanceConfig {
    /// Fractional tolerance around normalized load 1.0.
    pub balance_ratio: f64,
    /// Stability gate threshold for snapshot construction.
    pub load_stable_threshold: f64,
    /// Relaxation increment.
    pub allowed_deviation: f64,
    /// Consecutive no-progress cycles before split fallback fires.
    pub split_trigger: u32,
    /// Per-axis noise floors on expected (mean) load. Axes below the floor
    /// are not balanced.
    pub min_exp_loads: [f64; DIMENSION_COUNT],
    /// How long a finished operator's pending influence lingers before gc.
    pub max_zombie_millis: u64,
    /// Shortest pause between scheduling cycles.
    pub min_interval_millis: u64,
    /// Longest pause between scheduling cycles.
    pub max_interval_millis: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            balance_ratio: DEFAULT_BALANCE_RATIO,
            load_stable_threshold: LOAD_STABLE_THRESHOLD,
            allowed_deviation: ALLOWED_DEVIATION,
            split_trigger: DEFAULT_SPLIT_TRIGGER,
            min_exp_loads: DEFAULT_MIN_EXP_LOADS,
            max_zombie_millis: 300_000,
            min_interval_millis: 10_000,
            max_interval_millis: 60_000,
        }
    }
}

/// Partial update payload: absent fields keep their current value.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BalanceConfigUpdate {
    pub balance_ratio: Option<f64>,
    pub load_stable_threshold: Option<f64>,
    pub allowed_deviation: Option<f64>,
    pub split_trigger: Option<u32>,
    pub min_exp_loads: Option<[f64; DIMENSION_COUNT]>,
    pub max_zombie_millis: Option<u64>,
    pub min_interval_millis: Option<u64>,
    pub max_interval_millis: Option<u64>,
}

impl BalanceConfig {
    pub fn max_zombie(&self) -> Duration {
        Duration::from_millis(self.max_zombie_millis)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_millis)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_millis)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..1.0).contains(&self.balance_ratio) || self.balance_ratio == 0.0 {
            bail!("balance_ratio must be in (0, 1)");
        }
        if !(0.0..1.0).contains(&self.load_stable_threshold) || self.load_stable_threshold == 0.0 {
            bail!("load_stable_threshold must be in (0, 1)");
        }
        if !(0.0..1.0).contains(&self.allowed_deviation) {
            bail!("allowed_deviation must be in [0, 1)");
        }
        if self.split_trigger == 0 {
            bail!("split_trigger must be at least 1");
        }
        if self.min_exp_loads.iter().any(|floor| *floor < 0.0) {
            bail!("min_exp_loads must be non-negative");
        }
        if self.max_zombie_millis == 0 {
            bail!("max_zombie_millis must be non-zero");
        }
        if self.min_interval_millis == 0 || self.max_interval_millis < self.min_interval_millis {
            bail!("schedule intervals must satisfy 0 < min <= max");
        }
        Ok(())
    }

    /// Current config as the JSON document served by the config endpoint.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Apply a JSON update payload, validating the merged result. The config
    /// is untouched when parsing or validation fails.
    pub fn apply_json(&mut self, payload: &str) -> anyhow::Result<()> {
        let update: BalanceConfigUpdate =
            serde_json::from_str(payload).context("invalid balancer config payload")?;
        let mut next = self.clone();
        if let Some(value) = update.balance_ratio {
            next.balance_ratio = value;
        }
        if let Some(value) = update.load_stable_threshold {
            next.load_stable_threshold = value;
        }
        if let Some(value) = update.allowed_deviation {
            next.allowed_deviation = value;
        }
        if let Some(value) = update.split_trigger {
            next.split_trigger = value;
        }
        if let Some(value) = update.min_exp_loads {
            next.min_exp_loads = value;
        }
        if let Some(value) = update.max_zombie_millis {
            next.max_zombie_millis = value;
        }
        if let Some(value) = update.min_interval_millis {
            next.min_interval_millis = value;
        }
        if let Some(value) = update.max_interval_millis {
            next.max_interval_millis = value;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}
