//! Engine configuration.

use crate::error::{Error, Result};
use crate::metrics::Granularity;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

/// Read-only settings snapshot for the metrics engine.
///
/// Loaded from a TOML file and validated once at construction; the engine
/// holds it behind an `Arc` and never mutates it. All fields have defaults
/// suitable for a single small-to-medium website.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Grid carbon intensity in grams CO2e per kWh.
    pub carbon_intensity: f64,
    /// Energy cost of transferring one byte, in kWh.
    pub energy_per_byte: f64,
    /// Raw rows older than this many days are pruned. Zero disables pruning.
    pub retention_period_days: u32,
    /// Raw rows older than this many days are rolled up into periods.
    pub aggregation_age_days: u32,
    pub aggregation_granularity: Granularity,
    pub aggregation_enabled: bool,
    /// Only prune raw rows whose bucket already has a rollup.
    pub require_aggregation_before_pruning: bool,
    pub stats_cache_ttl_secs: u64,
    pub series_cache_ttl_secs: u64,
    /// Minimum seconds between eager recomputes of the all-pages aggregate.
    pub all_scope_refresh_secs: u64,
    pub maintenance_interval_secs: u64,
    /// Upper bound on (page, bucket) tuples enumerated per aggregation run.
    pub max_aggregation_tuples: u32,
    /// Upper bound on raw rows removed by one prune.
    pub prune_batch_limit: u32,
    /// `k` in `100 - k * log_base(ms + 1)`.
    pub performance_decay_factor: f64,
    pub performance_log_base: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("carbonmeter.db"),
            carbon_intensity: 442.0,
            energy_per_byte: 0.81e-9,
            retention_period_days: 90,
            aggregation_age_days: 30,
            aggregation_granularity: Granularity::Daily,
            aggregation_enabled: true,
            require_aggregation_before_pruning: true,
            stats_cache_ttl_secs: 86_400,
            series_cache_ttl_secs: 3_600,
            all_scope_refresh_secs: 300,
            maintenance_interval_secs: 86_400,
            max_aggregation_tuples: 10_000,
            prune_batch_limit: 100_000,
            performance_decay_factor: 15.0,
            performance_log_base: 1.5,
        }
    }
}

impl Settings {
    /// Parse and validate settings from TOML text. Missing keys take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Settings =
            toml_edit::de::from_str(text).map_err(|error| Error::Config(error.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file on disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.carbon_intensity.is_finite() || self.carbon_intensity < 0.0 {
            return Err(Error::Config(
                "carbon_intensity must be a finite, non-negative number".into(),
            ));
        }
        if !self.energy_per_byte.is_finite() || self.energy_per_byte < 0.0 {
            return Err(Error::Config(
                "energy_per_byte must be a finite, non-negative number".into(),
            ));
        }
        if !self.performance_decay_factor.is_finite() || self.performance_decay_factor < 0.0 {
            return Err(Error::Config(
                "performance_decay_factor must be a finite, non-negative number".into(),
            ));
        }
        if !self.performance_log_base.is_finite() || self.performance_log_base <= 1.0 {
            return Err(Error::Config(
                "performance_log_base must be greater than 1".into(),
            ));
        }
        if self.stats_cache_ttl_secs == 0 || self.series_cache_ttl_secs == 0 {
            return Err(Error::Config("cache TTLs must be positive".into()));
        }
        if self.maintenance_interval_secs == 0 {
            return Err(Error::Config(
                "maintenance_interval_secs must be positive".into(),
            ));
        }
        if self.max_aggregation_tuples == 0 || self.prune_batch_limit == 0 {
            return Err(Error::Config(
                "max_aggregation_tuples and prune_batch_limit must be positive".into(),
            ));
        }
        Ok(())
    }
}
