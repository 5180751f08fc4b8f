use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;

use crate::error::{ClusterError, Result};
use crate::tokenizer::{DelimiterPolicy, Tokenizer};

/// What happens to a line that matches no template of its length bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnmatchedPolicy {
    /// Re-partition the bucket from its templates plus the new line
    Repartition,
    /// Widen the closest singleton to cover the line, else open an all-literal
    /// singleton; `consolidate()` later re-partitions from aggregated counts
    SeedNew,
}

impl fmt::Display for UnmatchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnmatchedPolicy::Repartition => write!(f, "repartition"),
            UnmatchedPolicy::SeedNew => write!(f, "seed-new"),
        }
    }
}

impl FromStr for UnmatchedPolicy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "repartition" => Ok(UnmatchedPolicy::Repartition),
            "seed-new" | "seed_new" => Ok(UnmatchedPolicy::SeedNew),
            other => Err(ClusterError::invalid_config(
                "unmatched_policy",
                format!("expected \"repartition\" or \"seed-new\", got {:?}", other),
            )),
        }
    }
}

/// Clustering configuration.
///
/// Entropy thresholds apply to normalized positional entropy (entropy divided
/// by ln N), so they lie in [0, 1] whatever the group size:
/// - at or below `literal_entropy_threshold` the position is split on and
///   becomes a literal in every child
/// - above it the cluster stops splitting and the position becomes a wildcard;
///   wildcards above the literal threshold and at or below
///   `wildcard_entropy_threshold` are reported ambiguous
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub delimiter: DelimiterPolicy,
    pub literal_entropy_threshold: f64,
    pub wildcard_entropy_threshold: f64,
    pub unmatched_policy: UnmatchedPolicy,
    pub batch_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            delimiter: DelimiterPolicy::Whitespace,
            literal_entropy_threshold: 0.75,
            wildcard_entropy_threshold: 0.9,
            unmatched_policy: UnmatchedPolicy::Repartition,
            batch_size: 10_000,
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cheap per-line path: widen or seed singletons, small batches
    pub fn streaming() -> Self {
        Self {
            unmatched_policy: UnmatchedPolicy::SeedNew,
            batch_size: 1_000,
            ..Default::default()
        }
    }

    /// Maximal fidelity: re-partition on every unmatched line
    pub fn batch_processing() -> Self {
        Self {
            unmatched_policy: UnmatchedPolicy::Repartition,
            batch_size: 10_000,
            ..Default::default()
        }
    }

    pub fn with_delimiter(mut self, delimiter: DelimiterPolicy) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_literal_threshold(mut self, threshold: f64) -> Self {
        self.literal_entropy_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_wildcard_threshold(mut self, threshold: f64) -> Self {
        self.wildcard_entropy_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_unmatched_policy(mut self, policy: UnmatchedPolicy) -> Self {
        self.unmatched_policy = policy;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("literal_entropy_threshold", self.literal_entropy_threshold),
            ("wildcard_entropy_threshold", self.wildcard_entropy_threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ClusterError::invalid_config(
                    field,
                    format!("must be a finite value in [0, 1], got {}", value),
                ));
            }
        }

        if self.literal_entropy_threshold > self.wildcard_entropy_threshold {
            return Err(ClusterError::invalid_config(
                "literal_entropy_threshold",
                format!(
                    "must not exceed wildcard_entropy_threshold ({} > {})",
                    self.literal_entropy_threshold, self.wildcard_entropy_threshold
                ),
            ));
        }

        if self.batch_size == 0 {
            return Err(ClusterError::invalid_config(
                "batch_size",
                "must be greater than 0",
            ));
        }

        Tokenizer::new(&self.delimiter)?;
        Ok(())
    }

    /// Defaults overridden by `LOG_CLUSTER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("LOG_CLUSTER_DELIMITER") {
            config.delimiter = value.parse()?;
        }
        if let Some(value) = lookup("LOG_CLUSTER_LITERAL_THRESHOLD") {
            config.literal_entropy_threshold = parse_number("literal_entropy_threshold", &value)?;
        }
        if let Some(value) = lookup("LOG_CLUSTER_WILDCARD_THRESHOLD") {
            config.wildcard_entropy_threshold =
                parse_number("wildcard_entropy_threshold", &value)?;
        }
        if let Some(value) = lookup("LOG_CLUSTER_UNMATCHED_POLICY") {
            config.unmatched_policy = value.parse()?;
        }
        if let Some(value) = lookup("LOG_CLUSTER_BATCH_SIZE") {
            config.batch_size = parse_number("batch_size", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn log_config(&self) {
        tracing::info!("Clustering configuration:");
        tracing::info!("   Delimiter: {}", self.delimiter);
        tracing::info!(
            "   Literal entropy threshold: {}",
            self.literal_entropy_threshold
        );
        tracing::info!(
            "   Wildcard entropy threshold: {}",
            self.wildcard_entropy_threshold
        );
        tracing::info!("   Unmatched policy: {}", self.unmatched_policy);
        tracing::info!("   Batch size: {}", self.batch_size);
    }
}

fn parse_number<T>(field: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ClusterError::invalid_config(field, format!("{:?}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.delimiter, DelimiterPolicy::Whitespace);
        assert_eq!(config.literal_entropy_threshold, 0.75);
        assert_eq!(config.wildcard_entropy_threshold, 0.9);
        assert_eq!(config.unmatched_policy, UnmatchedPolicy::Repartition);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let streaming = ClusterConfig::streaming();
        assert_eq!(streaming.unmatched_policy, UnmatchedPolicy::SeedNew);
        assert_eq!(streaming.batch_size, 1_000);

        let batch = ClusterConfig::batch_processing();
        assert_eq!(batch.unmatched_policy, UnmatchedPolicy::Repartition);
        assert_eq!(batch.batch_size, 10_000);
    }

    #[test]
    fn test_builder() {
        let config = ClusterConfig::new()
            .with_delimiter(DelimiterPolicy::Char(','))
            .with_literal_threshold(0.5)
            .with_wildcard_threshold(1.7)
            .with_batch_size(0);

        assert_eq!(config.literal_entropy_threshold, 0.5);
        assert_eq!(config.wildcard_entropy_threshold, 1.0);
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_validation_rejects_inverted_thresholds() {
        let mut config = ClusterConfig::default();
        config.literal_entropy_threshold = 0.95;
        assert!(matches!(
            config.validate(),
            Err(ClusterError::InvalidConfig { .. })
        ));

        config.literal_entropy_threshold = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_regex() {
        let config = ClusterConfig::default().with_delimiter(DelimiterPolicy::Regex("[".into()));
        assert!(matches!(
            config.validate(),
            Err(ClusterError::InvalidDelimiter(_))
        ));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("LOG_CLUSTER_DELIMITER", "char:|"),
            ("LOG_CLUSTER_LITERAL_THRESHOLD", "0.4"),
            ("LOG_CLUSTER_WILDCARD_THRESHOLD", " 0.8 "),
            ("LOG_CLUSTER_UNMATCHED_POLICY", "seed-new"),
            ("LOG_CLUSTER_BATCH_SIZE", "250"),
        ]
        .into_iter()
        .collect();

        let config = ClusterConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.delimiter, DelimiterPolicy::Char('|'));
        assert_eq!(config.literal_entropy_threshold, 0.4);
        assert_eq!(config.wildcard_entropy_threshold, 0.8);
        assert_eq!(config.unmatched_policy, UnmatchedPolicy::SeedNew);
        assert_eq!(config.batch_size, 250);
    }

    #[test]
    fn test_from_lookup_reports_field() {
        let err = ClusterConfig::from_lookup(|key| {
            (key == "LOG_CLUSTER_LITERAL_THRESHOLD").then(|| "high".to_string())
        })
        .unwrap_err();

        match err {
            ClusterError::InvalidConfig { field, .. } => {
                assert_eq!(field, "literal_entropy_threshold")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_policy_round_trip_names() {
        for policy in [UnmatchedPolicy::Repartition, UnmatchedPolicy::SeedNew] {
            assert_eq!(policy.to_string().parse::<UnmatchedPolicy>().unwrap(), policy);
        }
        assert!("sometimes".parse::<UnmatchedPolicy>().is_err());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: ClusterConfig =
            serde_json::from_str(r#"{"unmatched_policy": "seed-new"}"#).unwrap();
        assert_eq!(config.unmatched_policy, UnmatchedPolicy::SeedNew);
        assert_eq!(config.wildcard_entropy_threshold, 0.9);
    }
}
