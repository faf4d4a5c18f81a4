//! # mipack
//!
//! Meta-installer assembly pipeline.
//!
//! This crate packages application binaries into self-extracting
//! meta-installers: it stages payload files, archives and compresses them
//! through a fixed filter chain, embeds the result as a resource in an
//! extraction stub, generates a verifiable offline update manifest, and
//! coordinates signing plus the optional enterprise MSI wrap and per-audience
//! tag fan-out.
//!
//! ## Features
//!
//! - **Byte-exact manifests**: digests are computed from the same staged
//!   bytes that get embedded, on every build
//! - **Fixed stage order**: archive → filter → compress, enforced by typed
//!   stage artifacts
//! - **Failure isolation**: one bundle failing never stops its siblings
//! - **Fan-out without recomputation**: tagged variants derive from one
//!   signed base binary
//! - **Explicit configuration**: all tool paths and policy come from a
//!   deployment config threaded through every component
//!
//! ## Usage
//!
//! ```bash
//! mipack build bundles.catalog --config mipack.toml --official
//! mipack build bundles.catalog --prefix TEST_ --jobs 2
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Core modules
pub mod bundler;
pub mod catalog;
pub mod cli;
pub mod error;

// Re-export main types for public API
pub use bundler::{
    BuildReport, BundleArtifact, BundleOrchestrator, BundlePhase, DeployConfig, Settings,
    SettingsBuilder,
};
pub use catalog::{AppBinarySpec, BundleDescriptor, TagEntry, read_bundle_catalog};
pub use cli::Args;
pub use error::{CliError, MipackError, Result};
