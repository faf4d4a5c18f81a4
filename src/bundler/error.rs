//! Error types for packaging operations.
//!
//! Provides error handling with contextual error chaining, filesystem-specific
//! errors, and the packaging failure taxonomy.
//!
//! # Features
//!
//! - **Context trait**: Add context to errors similar to anyhow
//! - **ErrorExt trait**: Filesystem operations with automatic path context
//! - **bail! macro**: Early return with formatted error messages
//! - **Pipeline errors**: One variant per failure class so callers can match
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use mipack::bundler::error::{ErrorExt, Result};
//!
//! fn prepare_staging(path: &Path) -> Result<()> {
//!     std::fs::create_dir_all(path)
//!         .fs_context("creating staging directory", path)?;
//!     Ok(())
//! }
//! ```

use std::{
    fmt::Display,
    io,
    path::PathBuf,
};
use thiserror::Error as DeriveError;

/// Errors returned by the packaging pipeline.
///
/// This enum covers all error conditions that can occur while assembling a
/// meta-installer, including I/O errors, collaborator failures, and errors
/// from external crates.
#[derive(Debug, DeriveError)]
#[non_exhaustive]
pub enum Error {
    /// Error with context. Created by the [`Context`] trait.
    ///
    /// Allows wrapping errors with additional context strings for better debugging.
    #[error("{0}: {1}")]
    Context(String, Box<Self>),

    /// File system error with path context.
    ///
    /// Automatically includes the path that caused the error for better diagnostics.
    /// Created by the [`ErrorExt`] trait's `fs_context` method.
    #[error("{context} {path}: {error}")]
    Fs {
        /// Context describing the operation (e.g., "reading payload file")
        context: &'static str,
        /// Path that was being accessed
        path: PathBuf,
        /// The underlying I/O error
        error: io::Error,
    },

    /// Child process execution error.
    ///
    /// Used when an external collaborator cannot be spawned at all.
    #[error("failed to run command {command}: {error}")]
    CommandFailed {
        /// Command that failed to execute
        command: String,
        /// The underlying error
        error: io::Error,
    },

    /// A bundle descriptor or binary record is malformed or incomplete.
    #[error("invalid bundle spec: {0}")]
    InvalidSpec(String),

    /// A bundle descriptor carries no application binaries.
    #[error("bundle {0} contains no application binaries")]
    EmptyBundle(String),

    /// An enterprise wrap was requested for a bundle carrying more than one
    /// application. The MSI wrapper packages exactly one installer.
    #[error("bundle {bundle} packages {count} applications, too large for an enterprise MSI")]
    BundleTooLargeForEnterprise {
        /// Name of the offending bundle
        bundle: String,
        /// Number of applications in the bundle
        count: usize,
    },

    /// An archive, filter, compress, embed, or wrap stage failed.
    ///
    /// Carries the stage name and the collaborator's exit status or message.
    #[error("packaging stage {stage} failed: {detail}")]
    PackagingFailure {
        /// Pipeline stage that failed (e.g., "compress", "link")
        stage: &'static str,
        /// Exit status or failure description
        detail: String,
    },

    /// A manifest fragment has no recognizable response body span.
    #[error("malformed manifest fragment {path}: {detail}")]
    MalformedManifestFragment {
        /// Fragment file that failed the scan
        path: PathBuf,
        /// Which structural anchor was missing
        detail: String,
    },

    /// Fragment count and version count disagree for a bundle.
    #[error("got {versions} versions for {fragments} manifest fragments")]
    VersionCountMismatch {
        /// Number of manifest fragments supplied
        fragments: usize,
        /// Number of versions supplied
        versions: usize,
    },

    /// Signing gave up after the configured number of attempts.
    #[error("signing {target} failed after {attempts} attempt(s): {last_error}")]
    SigningFailure {
        /// File name of the artifact that could not be signed
        target: String,
        /// How many submissions were made before giving up
        attempts: u32,
        /// The transport error from the final attempt
        last_error: Box<Self>,
    },

    /// A required external tool or directory is not configured or not found.
    #[error("environment missing: {0}")]
    EnvironmentMissing(String),

    /// Generic I/O error.
    #[error("{0}")]
    IoError(#[from] io::Error),

    /// Handlebars template rendering error.
    #[error("{0}")]
    HandleBarsError(#[from] handlebars::RenderError),

    /// Handlebars template parsing error.
    #[error("{0}")]
    Template(#[from] handlebars::TemplateError),

    /// JSON serialization/deserialization error.
    #[error("{0}")]
    JsonError(#[from] serde_json::error::Error),

    /// Deployment configuration parsing error.
    #[error("{0}")]
    TomlError(#[from] toml::de::Error),

    /// Binary parsing error (stub and merged-output inspection).
    #[error("binary parse error: {0}")]
    BinaryParseError(#[from] goblin::error::Error),

    /// String is not valid UTF-8.
    #[error("string is not UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    /// Generic error with custom message.
    #[error("{0}")]
    GenericError(String),
}

/// Convenient type alias for Result.
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for adding context to errors.
///
/// Similar to `anyhow::Context` but integrated with the pipeline's Error type.
/// Works with both `Result<T, E>` and `Option<T>`.
///
/// # Examples
///
/// ```no_run
/// use std::path::PathBuf;
/// use mipack::bundler::error::{Context, Result};
///
/// fn stub_path(configured: Option<PathBuf>) -> Result<PathBuf> {
///     configured.context("no extraction stub configured")
/// }
/// ```
pub trait Context<T> {
    /// Add context to an error.
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static;

    /// Add context to an error using a closure (lazy evaluation).
    ///
    /// Use this when context string construction is expensive.
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T> Context<T> for Result<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
    {
        self.map_err(|e| Error::Context(context.to_string(), Box::new(e)))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|e| Error::Context(f().to_string(), Box::new(e)))
    }
}

impl<T> Context<T> for Option<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
    {
        self.ok_or_else(|| Error::GenericError(context.to_string()))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::GenericError(f().to_string()))
    }
}

/// Extension trait for filesystem operations with automatic path context.
///
/// Wraps I/O errors with the path that caused them for better diagnostics.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use mipack::bundler::error::{ErrorExt, Result};
///
/// fn read_fragment(path: &Path) -> Result<String> {
///     std::fs::read_to_string(path).fs_context("reading manifest fragment", path)
/// }
/// ```
pub trait ErrorExt<T> {
    /// Add filesystem context to an I/O error.
    ///
    /// The `context` should be a present-tense verb phrase describing the operation,
    /// e.g., "reading file", "creating directory", "copying binary".
    fn fs_context(self, context: &'static str, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> ErrorExt<T> for std::result::Result<T, std::io::Error> {
    fn fs_context(self, context: &'static str, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|error| Error::Fs {
            context,
            path: path.into(),
            error,
        })
    }
}

/// Macro for early return with error.
///
/// Converts the message into a [`Error::GenericError`] and returns immediately.
///
/// # Examples
///
/// ```ignore
/// bail!("operation failed");
/// bail!("invalid value: {}", value);
/// bail!(format!("expected {} but got {}", expected, actual));
/// ```
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::bundler::error::Error::GenericError($msg.into()))
    };
    ($err:expr $(,)?) => {
        return Err($crate::bundler::error::Error::GenericError($err.to_string()))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::bundler::error::Error::GenericError(format!($fmt, $($arg)*)))
    };
}
