//! Atlas configuration stored at `<data_dir>/config.toml`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

/// Atlas configuration (TOML).
///
/// Hand-editable; missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AtlasConfig {
    /// Candidates requested from the proposer per step.
    pub beam_size: usize,

    /// Default step budget for new runs.
    pub max_steps: u32,

    /// Wall-clock budget per run in seconds.
    pub time_budget_secs: u64,

    /// Top critic score below which a step re-proposes once, in `[0, 1]`.
    pub low_value_veto: f64,

    /// Stalled steps between full replans.
    pub replan_window: u32,

    /// Finished runs whose terminal event the bus replays to late subscribers.
    pub retired_run_capacity: usize,

    /// Recorded on each run for the caller's bookkeeping.
    pub mode: String,
    pub env: String,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            beam_size: 3,
            max_steps: 20,
            time_budget_secs: 600,
            low_value_veto: 0.2,
            replan_window: 3,
            retired_run_capacity: 256,
            mode: "atlas".to_string(),
            env: "local".to_string(),
        }
    }
}

impl AtlasConfig {
    pub fn validate(&self) -> Result<()> {
        if self.beam_size == 0 {
            return Err(anyhow!("beam_size must be > 0"));
        }
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.time_budget_secs == 0 {
            return Err(anyhow!("time_budget_secs must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.low_value_veto) {
            return Err(anyhow!("low_value_veto must be within [0, 1]"));
        }
        if self.replan_window == 0 {
            return Err(anyhow!("replan_window must be > 0"));
        }
        Ok(())
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AtlasConfig::default()`.
pub async fn load_config(path: &Path) -> Result<AtlasConfig> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let cfg = AtlasConfig::default();
            cfg.validate()?;
            return Ok(cfg);
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let cfg: AtlasConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub async fn write_config(path: &Path, cfg: &AtlasConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf).await
}
