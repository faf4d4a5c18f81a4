//! Top-level error types for mipack operations.
//!
//! The pipeline's own taxonomy lives in [`crate::bundler::error`]; this
//! module wraps it together with CLI and configuration errors and adds
//! actionable recovery suggestions for the terminal.

use thiserror::Error;

/// Result type alias for mipack operations
pub type Result<T> = std::result::Result<T, MipackError>;

/// Main error type for all mipack operations
#[derive(Error, Debug)]
pub enum MipackError {
    /// Assembly pipeline errors (catalog, packaging, signing, environment)
    #[error("{0}")]
    Bundle(#[from] crate::bundler::Error),

    /// CLI argument errors
    #[error("CLI error: {0}")]
    Cli(#[from] CliError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic errors from anyhow
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    /// Invalid command line arguments
    #[error("Invalid arguments: {reason}")]
    InvalidArguments {
        /// Reason for the error
        reason: String,
    },

    /// Command execution failed
    #[error("Command execution failed: {command} - {reason}")]
    ExecutionFailed {
        /// Command that failed
        command: String,
        /// Reason for the error
        reason: String,
    },
}

impl MipackError {
    /// Get actionable recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<String> {
        use crate::bundler::Error as BundleError;
        match self {
            MipackError::Bundle(BundleError::EnvironmentMissing(_)) => vec![
                "Check the tool paths in the deployment config".to_string(),
                "Ensure collaborator tools are installed and on PATH".to_string(),
            ],
            MipackError::Bundle(BundleError::SigningFailure { .. }) => vec![
                "Check that the signing service is reachable".to_string(),
                "Raise signing.attempts or signing.timeout_secs in the config".to_string(),
                "Run without [signing] to produce unsigned test installers".to_string(),
            ],
            MipackError::Bundle(BundleError::InvalidSpec(_))
            | MipackError::Bundle(BundleError::EmptyBundle(_)) => vec![
                "Fix the named catalog record (one JSON object per line)".to_string(),
            ],
            MipackError::Bundle(BundleError::BundleTooLargeForEnterprise { .. }) => vec![
                "Enterprise MSIs wrap exactly one application".to_string(),
                "Split the bundle or drop its enterprise request".to_string(),
            ],
            MipackError::Bundle(BundleError::MalformedManifestFragment { .. }) => vec![
                "Ensure the fragment contains a complete <response>...</response> element"
                    .to_string(),
            ],
            MipackError::Toml(_) => vec![
                "Check the deployment config file syntax".to_string(),
            ],
            _ => vec!["Check the error message above for specific details".to_string()],
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        use crate::bundler::Error as BundleError;
        !matches!(
            self,
            MipackError::Bundle(BundleError::InvalidSpec(_))
                | MipackError::Bundle(BundleError::EmptyBundle(_))
                | MipackError::Bundle(BundleError::BundleTooLargeForEnterprise { .. })
                | MipackError::Bundle(BundleError::VersionCountMismatch { .. })
                | MipackError::Cli(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::Error as BundleError;

    #[test]
    fn spec_errors_are_not_recoverable() {
        let error = MipackError::from(BundleError::EmptyBundle("Widget".to_string()));
        assert!(!error.is_recoverable());
    }

    #[test]
    fn environment_errors_suggest_config_fixes() {
        let error = MipackError::from(BundleError::EnvironmentMissing(
            "tool lzma not found on PATH".to_string(),
        ));
        assert!(error.is_recoverable());
        assert!(
            error
                .recovery_suggestions()
                .iter()
                .any(|s| s.contains("deployment config"))
        );
    }
}
