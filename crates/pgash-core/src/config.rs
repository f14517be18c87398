//! Pipeline configuration.
//!
//! Loaded from a YAML document; every section and field is optional and falls
//! back to the defaults below, except `session_sampler.datasource`.
//!
//! ```yaml
//! session_sampler:
//!   datasource: "host=localhost user=monitor dbname=postgres"
//!   collection_interval: 1s
//! adaptive_sampler:
//!   base_rate: 0.5
//!   high_session_threshold: 50
//! cost_control:
//!   enforcement_mode: drop
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    Io { path: String, message: String },
    /// YAML could not be parsed into the config model.
    Parse(String),
    /// A field has an invalid value.
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, message } => write!(f, "config {}: {}", path, message),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config: {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Root configuration object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub session_sampler: SessionSamplerConfig,
    pub adaptive_sampler: AdaptiveSamplerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub query_correlator: CorrelatorConfig,
    pub plan_extractor: PlanExtractorConfig,
    pub cost_control: CostControlConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSamplerConfig {
    /// libpq-style connection string (`host=... user=... dbname=...`).
    pub datasource: String,
    #[serde(with = "humantime_serde")]
    pub collection_interval: Duration,
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub retention_duration: Duration,
    /// Statement timeout for the session query. Defaults to half the interval.
    #[serde(with = "humantime_serde")]
    pub query_timeout: Option<Duration>,
    /// Query text longer than this (bytes) is truncated.
    pub max_query_text_len: usize,
    /// Batches that may wait for the pipeline before new ones are dropped.
    pub channel_capacity: usize,
}

impl Default for SessionSamplerConfig {
    fn default() -> Self {
        Self {
            datasource: String::new(),
            collection_interval: Duration::from_secs(1),
            buffer_size: 10_000,
            retention_duration: Duration::from_secs(60 * 60),
            query_timeout: None,
            max_query_text_len: 4096,
            channel_capacity: 16,
        }
    }
}

impl SessionSamplerConfig {
    /// Statement timeout applied to the session query.
    pub fn effective_query_timeout(&self) -> Duration {
        self.query_timeout
            .unwrap_or(self.collection_interval / 2)
            .max(Duration::from_millis(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveSamplerConfig {
    pub base_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub low_session_threshold: usize,
    pub high_session_threshold: usize,
    pub always_sample_blocked: bool,
    pub always_sample_long_running: bool,
    pub always_sample_maintenance: bool,
    pub slow_query_threshold_ms: u64,
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,
    /// Multiplier applied under high load.
    pub decrease_factor: f64,
    /// Additive increase applied under low load.
    pub increase_step: f64,
    /// Largest allowed change per evaluation, as a fraction of the current rate.
    pub max_step_fraction: f64,
    /// Datapoints per second the pipeline aims for; 0 disables the throughput signal.
    pub target_throughput: f64,
    /// Pending batches above which load counts as high.
    pub max_queue_length: usize,
    /// Memory pressure (0..=1) at or above which load counts as high.
    pub memory_pressure_threshold: f64,
}

impl Default for AdaptiveSamplerConfig {
    fn default() -> Self {
        Self {
            base_rate: 0.5,
            min_rate: 0.01,
            max_rate: 1.0,
            low_session_threshold: 10,
            high_session_threshold: 50,
            always_sample_blocked: true,
            always_sample_long_running: true,
            always_sample_maintenance: true,
            slow_query_threshold_ms: 1000,
            evaluation_interval: Duration::from_secs(10),
            decrease_factor: 0.9,
            increase_step: 0.05,
            max_step_fraction: 0.1,
            target_throughput: 0.0,
            max_queue_length: 8,
            memory_pressure_threshold: 0.85,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    pub half_open_max_requests: u32,
    /// Failures older than this no longer count toward the threshold.
    #[serde(with = "humantime_serde")]
    pub evaluation_window: Duration,
    /// Successful calls slower than this are recorded as failures.
    #[serde(with = "humantime_serde")]
    pub slow_call_threshold: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
            evaluation_window: Duration::from_secs(60),
            slow_call_threshold: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorrelatorConfig {
    #[serde(with = "humantime_serde")]
    pub correlation_window: Duration,
    pub max_correlated_queries: usize,
    pub slow_query_threshold_ms: u64,
    pub frequent_query_threshold: u64,
    /// Upper bound on tracked groups; the oldest is evicted first.
    pub max_groups: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            correlation_window: Duration::from_secs(5 * 60),
            max_correlated_queries: 10,
            slow_query_threshold_ms: 1000,
            frequent_query_threshold: 10,
            max_groups: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanExtractorConfig {
    pub enabled: bool,
    pub cache_size: usize,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub plan_timeout: Duration,
}

impl Default for PlanExtractorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_size: 500,
            cache_ttl: Duration::from_secs(10 * 60),
            plan_timeout: Duration::from_secs(5),
        }
    }
}

/// What to do with datapoints once the budget is exhausted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Discard every datapoint over budget.
    #[default]
    Drop,
    /// Keep a deterministic fraction of the overflow.
    Sample,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostControlConfig {
    pub max_datapoints_per_minute: u64,
    pub enforcement_mode: EnforcementMode,
    /// Attributes removed from every datapoint before it is counted.
    pub high_cardinality_dimensions: Vec<String>,
    /// Fraction of overflow kept in `sample` mode.
    pub overflow_sample_rate: f64,
}

impl Default for CostControlConfig {
    fn default() -> Self {
        Self {
            max_datapoints_per_minute: 10_000,
            enforcement_mode: EnforcementMode::Drop,
            high_cardinality_dimensions: vec![
                "client.address".to_string(),
                "session.id".to_string(),
                "blocking.session_id".to_string(),
            ],
            overflow_sample_rate: 0.1,
        }
    }
}

impl PipelineConfig {
    /// Parses YAML without validating.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reads and parses a YAML file without validating.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&content)
    }

    /// Checks every section. The first offending field is reported.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_sampler()?;
        self.validate_adaptive()?;
        self.validate_breaker()?;
        self.validate_correlator()?;
        self.validate_plan()?;
        self.validate_cost()
    }

    fn validate_sampler(&self) -> Result<(), ConfigError> {
        let s = &self.session_sampler;
        if s.datasource.trim().is_empty() {
            return Err(invalid("session_sampler.datasource", "must not be empty"));
        }
        if s.collection_interval.is_zero() {
            return Err(invalid(
                "session_sampler.collection_interval",
                "must be positive",
            ));
        }
        if s.buffer_size == 0 {
            return Err(invalid("session_sampler.buffer_size", "must be positive"));
        }
        if s.retention_duration.is_zero() {
            return Err(invalid(
                "session_sampler.retention_duration",
                "must be positive",
            ));
        }
        if let Some(t) = s.query_timeout
            && t.is_zero()
        {
            return Err(invalid("session_sampler.query_timeout", "must be positive"));
        }
        if s.max_query_text_len == 0 {
            return Err(invalid(
                "session_sampler.max_query_text_len",
                "must be positive",
            ));
        }
        if s.channel_capacity == 0 {
            return Err(invalid("session_sampler.channel_capacity", "must be positive"));
        }
        Ok(())
    }

    fn validate_adaptive(&self) -> Result<(), ConfigError> {
        let a = &self.adaptive_sampler;
        if !(a.min_rate > 0.0 && a.min_rate <= 1.0) {
            return Err(invalid(
                "adaptive_sampler.min_rate",
                format!("must be in (0, 1], got {}", a.min_rate),
            ));
        }
        if !(a.max_rate >= a.min_rate && a.max_rate <= 1.0) {
            return Err(invalid(
                "adaptive_sampler.max_rate",
                format!("must be in [min_rate, 1], got {}", a.max_rate),
            ));
        }
        if !(a.base_rate >= a.min_rate && a.base_rate <= a.max_rate) {
            return Err(invalid(
                "adaptive_sampler.base_rate",
                format!("must be in [min_rate, max_rate], got {}", a.base_rate),
            ));
        }
        if a.low_session_threshold >= a.high_session_threshold {
            return Err(invalid(
                "adaptive_sampler.low_session_threshold",
                format!(
                    "must be below high_session_threshold ({} >= {})",
                    a.low_session_threshold, a.high_session_threshold
                ),
            ));
        }
        if !(a.decrease_factor > 0.0 && a.decrease_factor < 1.0) {
            return Err(invalid(
                "adaptive_sampler.decrease_factor",
                format!("must be in (0, 1), got {}", a.decrease_factor),
            ));
        }
        if !(a.increase_step > 0.0) {
            return Err(invalid("adaptive_sampler.increase_step", "must be positive"));
        }
        if !(a.max_step_fraction > 0.0 && a.max_step_fraction <= 1.0) {
            return Err(invalid(
                "adaptive_sampler.max_step_fraction",
                format!("must be in (0, 1], got {}", a.max_step_fraction),
            ));
        }
        if a.evaluation_interval.is_zero() {
            return Err(invalid(
                "adaptive_sampler.evaluation_interval",
                "must be positive",
            ));
        }
        if !(a.target_throughput >= 0.0) {
            return Err(invalid(
                "adaptive_sampler.target_throughput",
                "must not be negative",
            ));
        }
        if !(a.memory_pressure_threshold > 0.0 && a.memory_pressure_threshold <= 1.0) {
            return Err(invalid(
                "adaptive_sampler.memory_pressure_threshold",
                format!("must be in (0, 1], got {}", a.memory_pressure_threshold),
            ));
        }
        Ok(())
    }

    fn validate_breaker(&self) -> Result<(), ConfigError> {
        let b = &self.circuit_breaker;
        if b.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be positive"));
        }
        if b.recovery_timeout.is_zero() {
            return Err(invalid("circuit_breaker.recovery_timeout", "must be positive"));
        }
        if b.half_open_max_requests == 0 {
            return Err(invalid(
                "circuit_breaker.half_open_max_requests",
                "must be positive",
            ));
        }
        if b.evaluation_window.is_zero() {
            return Err(invalid("circuit_breaker.evaluation_window", "must be positive"));
        }
        Ok(())
    }

    fn validate_correlator(&self) -> Result<(), ConfigError> {
        let c = &self.query_correlator;
        if c.correlation_window.is_zero() {
            return Err(invalid(
                "query_correlator.correlation_window",
                "must be positive",
            ));
        }
        if c.frequent_query_threshold == 0 {
            return Err(invalid(
                "query_correlator.frequent_query_threshold",
                "must be positive",
            ));
        }
        if c.max_groups == 0 {
            return Err(invalid("query_correlator.max_groups", "must be positive"));
        }
        Ok(())
    }

    fn validate_plan(&self) -> Result<(), ConfigError> {
        let p = &self.plan_extractor;
        if !p.enabled {
            return Ok(());
        }
        if p.cache_size == 0 {
            return Err(invalid("plan_extractor.cache_size", "must be positive"));
        }
        if p.cache_ttl.is_zero() {
            return Err(invalid("plan_extractor.cache_ttl", "must be positive"));
        }
        if p.plan_timeout.is_zero() {
            return Err(invalid("plan_extractor.plan_timeout", "must be positive"));
        }
        Ok(())
    }

    fn validate_cost(&self) -> Result<(), ConfigError> {
        let c = &self.cost_control;
        if c.max_datapoints_per_minute == 0 {
            return Err(invalid(
                "cost_control.max_datapoints_per_minute",
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&c.overflow_sample_rate) {
            return Err(invalid(
                "cost_control.overflow_sample_rate",
                format!("must be in [0, 1], got {}", c.overflow_sample_rate),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> PipelineConfig {
        let mut cfg = PipelineConfig::default();
        cfg.session_sampler.datasource = "host=localhost user=postgres".into();
        cfg
    }

    fn invalid_field(cfg: &PipelineConfig) -> &'static str {
        match cfg.validate() {
            Err(ConfigError::Invalid { field, .. }) => field,
            other => panic!("expected invalid field, got {:?}", other),
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.session_sampler.collection_interval, Duration::from_secs(1));
        assert_eq!(cfg.session_sampler.buffer_size, 10_000);
        assert_eq!(cfg.session_sampler.retention_duration, Duration::from_secs(3600));
        assert!(cfg.adaptive_sampler.always_sample_blocked);
        assert!(cfg.adaptive_sampler.always_sample_long_running);
        assert!(cfg.adaptive_sampler.always_sample_maintenance);
        assert_eq!(cfg.cost_control.enforcement_mode, EnforcementMode::Drop);
    }

    #[test]
    fn empty_datasource_names_the_field() {
        let cfg = PipelineConfig::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("session_sampler.datasource"));
    }

    #[test]
    fn default_with_datasource_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rate_bounds_are_checked() {
        let mut cfg = valid();
        cfg.adaptive_sampler.min_rate = 0.0;
        assert_eq!(invalid_field(&cfg), "adaptive_sampler.min_rate");

        let mut cfg = valid();
        cfg.adaptive_sampler.base_rate = 0.001;
        assert_eq!(invalid_field(&cfg), "adaptive_sampler.base_rate");

        let mut cfg = valid();
        cfg.adaptive_sampler.max_rate = 1.5;
        assert_eq!(invalid_field(&cfg), "adaptive_sampler.max_rate");
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let mut cfg = valid();
        cfg.adaptive_sampler.low_session_threshold = 60;
        assert_eq!(invalid_field(&cfg), "adaptive_sampler.low_session_threshold");
    }

    #[test]
    fn breaker_and_cost_fields_are_checked() {
        let mut cfg = valid();
        cfg.circuit_breaker.failure_threshold = 0;
        assert_eq!(invalid_field(&cfg), "circuit_breaker.failure_threshold");

        let mut cfg = valid();
        cfg.cost_control.max_datapoints_per_minute = 0;
        assert_eq!(invalid_field(&cfg), "cost_control.max_datapoints_per_minute");
    }

    #[test]
    fn disabled_plan_extractor_skips_its_checks() {
        let mut cfg = valid();
        cfg.plan_extractor.enabled = false;
        cfg.plan_extractor.cache_size = 0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_yaml_with_humantime_durations() {
        let yaml = r#"
session_sampler:
  datasource: "host=db user=monitor"
  collection_interval: 500ms
  retention_duration: 2h
adaptive_sampler:
  base_rate: 0.2
  high_session_threshold: 80
circuit_breaker:
  recovery_timeout: 45s
cost_control:
  enforcement_mode: sample
  high_cardinality_dimensions: [client.address]
"#;
        let cfg = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            cfg.session_sampler.collection_interval,
            Duration::from_millis(500)
        );
        assert_eq!(
            cfg.session_sampler.retention_duration,
            Duration::from_secs(7200)
        );
        assert_eq!(
            cfg.session_sampler.effective_query_timeout(),
            Duration::from_millis(250)
        );
        assert_eq!(cfg.adaptive_sampler.base_rate, 0.2);
        assert_eq!(cfg.adaptive_sampler.min_rate, 0.01);
        assert_eq!(cfg.circuit_breaker.recovery_timeout, Duration::from_secs(45));
        assert_eq!(cfg.cost_control.enforcement_mode, EnforcementMode::Sample);
        assert_eq!(
            cfg.cost_control.high_cardinality_dimensions,
            vec!["client.address".to_string()]
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = PipelineConfig::from_yaml_str("session_sampler:\n  bogus: 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "session_sampler:\n  datasource: \"host=x\"").unwrap();
        let cfg = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.session_sampler.datasource, "host=x");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = PipelineConfig::from_file("/nonexistent/pgash.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pgash.yaml"));
    }
}
