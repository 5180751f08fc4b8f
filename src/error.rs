use thiserror::Error;

/// Errors surfaced by the clustering core
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A line could not be decoded as text. The line is skipped; no bucket is touched.
    #[error("Malformed input line: {reason}")]
    MalformedInput { reason: String },

    /// A literal slot of a matched template received a different value.
    #[error(
        "Invariant violation in template {template_id}: position {position} is literal {expected:?} but received {actual:?}"
    )]
    InvariantViolation {
        template_id: u64,
        position: usize,
        expected: String,
        actual: String,
    },

    /// Configuration value rejected by validation or parsing
    #[error("Invalid configuration value at {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// Regex delimiter policy failed to compile
    #[error("Invalid delimiter pattern: {0}")]
    InvalidDelimiter(#[from] regex::Error),
}

impl ClusterError {
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Per-line errors leave every bucket untouched and can be skipped by the caller.
    pub fn is_per_line(&self) -> bool {
        matches!(
            self,
            ClusterError::MalformedInput { .. } | ClusterError::InvariantViolation { .. }
        )
    }
}

/// Result type for clustering operations
pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ClusterError::MalformedInput {
            reason: "invalid utf-8 at byte 3".to_string(),
        };
        assert_eq!(err.to_string(), "Malformed input line: invalid utf-8 at byte 3");
        assert!(err.is_per_line());

        let err = ClusterError::invalid_config("literal_entropy_threshold", "must be finite");
        assert!(err.to_string().contains("literal_entropy_threshold"));
        assert!(!err.is_per_line());
    }
}
