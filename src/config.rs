//! Configuration module
//!
//! Provides structured configuration for the reporting engine.
//! Configuration can be loaded from:
//! 1. Default values (hardcoded)
//! 2. warden.toml file (optional)
//! 3. Environment variables with WARDEN__ prefix
//!
//! Example environment variable override:
//! WARDEN__TRUNCATION__THRESHOLD=50
//! WARDEN__REPORTS__DIRECTORY=/var/lib/warden/reports

use chrono::Duration;
use serde::Deserialize;
use std::path::PathBuf;

use crate::models::Severity;

/// Main engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub reports: ReportsConfig,
    pub truncation: TruncationConfig,
    pub timing: TimingConfig,
}

/// Report artifact output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReportsConfig {
    /// Directory for attachment dumps (JSON/CSV)
    pub directory: PathBuf,
    /// Compress attachment dumps into zip archives
    pub compress: bool,
    /// Aggregate attachment size limit in bytes (0 = unlimited)
    pub max_attachment_size: u64,
}

/// Toplist truncation thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct TruncationConfig {
    /// Default toplist size
    pub threshold: usize,
    /// Relaxed size for bounded-cardinality categories
    pub whitelist_threshold: usize,
}

/// Per-severity reporting intervals, in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    pub low: SeverityTiming,
    pub medium: SeverityTiming,
    pub high: SeverityTiming,
    pub critical: SeverityTiming,
}

/// Reporting period, thresholding window and relapse window for one severity
#[derive(Debug, Clone, Deserialize)]
pub struct SeverityTiming {
    /// Reporting period length
    pub period_secs: u64,
    /// Thresholding window length (absolute expiry offset)
    pub threshold_secs: u64,
    /// Relapse window length (tail of the thresholding window)
    pub relapse_secs: u64,
}

impl TimingConfig {
    pub fn for_severity(&self, severity: Severity) -> &SeverityTiming {
        match severity {
            Severity::Low => &self.low,
            Severity::Medium => &self.medium,
            Severity::High => &self.high,
            Severity::Critical => &self.critical,
        }
    }
}

impl SeverityTiming {
    pub fn period(&self) -> Duration {
        Duration::seconds(self.period_secs as i64)
    }

    pub fn threshold_window(&self) -> Duration {
        Duration::seconds(self.threshold_secs as i64)
    }

    pub fn relapse_window(&self) -> Duration {
        Duration::seconds(self.relapse_secs as i64)
    }
}

impl EngineConfig {
    /// Load configuration from defaults, warden.toml, and environment variables
    pub fn new() -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            // --- Defaults ---
            // Reports
            .set_default("reports.directory", "reports")?
            .set_default("reports.compress", false)?
            .set_default("reports.max_attachment_size", 0)?
            // Truncation
            .set_default("truncation.threshold", 100)?
            .set_default("truncation.whitelist_threshold", 1000)?
            // Timing: period / thresholding window / relapse window
            .set_default("timing.low.period_secs", 86_400)?
            .set_default("timing.low.threshold_secs", 1_209_600)?
            .set_default("timing.low.relapse_secs", 604_800)?
            .set_default("timing.medium.period_secs", 7_200)?
            .set_default("timing.medium.threshold_secs", 172_800)?
            .set_default("timing.medium.relapse_secs", 43_200)?
            .set_default("timing.high.period_secs", 3_600)?
            .set_default("timing.high.threshold_secs", 86_400)?
            .set_default("timing.high.relapse_secs", 21_600)?
            .set_default("timing.critical.period_secs", 600)?
            .set_default("timing.critical.threshold_secs", 7_200)?
            .set_default("timing.critical.relapse_secs", 3_600)?
            // --- Sources ---
            .add_source(config::File::with_name("warden").required(false))
            .add_source(config::Environment::with_prefix("WARDEN").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reports: ReportsConfig {
                directory: PathBuf::from("reports"),
                compress: false,
                max_attachment_size: 0,
            },
            truncation: TruncationConfig {
                threshold: 100,
                whitelist_threshold: 1000,
            },
            timing: TimingConfig {
                low: SeverityTiming {
                    period_secs: 86_400,
                    threshold_secs: 1_209_600,
                    relapse_secs: 604_800,
                },
                medium: SeverityTiming {
                    period_secs: 7_200,
                    threshold_secs: 172_800,
                    relapse_secs: 43_200,
                },
                high: SeverityTiming {
                    period_secs: 3_600,
                    threshold_secs: 86_400,
                    relapse_secs: 21_600,
                },
                critical: SeverityTiming {
                    period_secs: 600,
                    threshold_secs: 7_200,
                    relapse_secs: 3_600,
                },
            },
        }
    }
}
