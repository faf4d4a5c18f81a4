//! Meta-installer assembly pipeline.
//!
//! This module turns a bundle catalog into self-extracting installers: it
//! stages the payload binaries, generates the offline update manifest,
//! archives and compresses the payload, embeds it into the extraction stub,
//! coordinates signing, and produces the optional enterprise MSI and tagged
//! variants.
//!
//! # Pipeline
//!
//! | Stage | Module | Output |
//! |-------|--------|--------|
//! | Payload staging | [`payload`] | renamed binaries + pairing list |
//! | Manifest | [`manifest`] | `OfflineManifest.gup` |
//! | Archive/filter/compress | [`archive`], [`codec`] | compressed payload blob |
//! | Resource embedding | [`resource`] | unsigned installer |
//! | Signing | [`signing`] | published installer |
//! | Enterprise wrap / tagging | [`enterprise`], [`tagging`] | MSI, tagged variants |
//!
//! # Integration
//!
//! The [`orchestrator`] drives all stages per bundle and isolates bundle
//! failures from each other:
//!
//! ```no_run
//! use mipack::bundler::{BundleOrchestrator, DeployConfig, SettingsBuilder};
//! use mipack::catalog::read_bundle_catalog;
//!
//! # async fn example() -> mipack::bundler::Result<()> {
//! let settings = SettingsBuilder::new()
//!     .deploy_config(DeployConfig::load("mipack.toml".as_ref())?)
//!     .output_dir("installers")
//!     .fragments_dir("fragments")
//!     .build()?;
//!
//! let bundles = read_bundle_catalog("bundles.catalog".as_ref())?;
//! let report = BundleOrchestrator::from_settings(settings)?.run(bundles).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod archive;
pub mod codec;
pub mod enterprise;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod payload;
pub mod resource;
pub mod settings;
pub mod signing;
pub mod tagging;

// Public re-exports
pub use archive::{ArchiveArtifact, ArchivePipeline, CompressedArtifact, FilteredArtifact};
pub use codec::{DeflateCodec, PayloadCodec, ToolchainCodec};
pub use enterprise::{EnterpriseMsi, EnterpriseWrapper};
pub use error::{Error, Result};
pub use manifest::IntegrityRecord;
pub use orchestrator::{
    BuildReport,
    BundleFailure,
    BundleOrchestrator,
    BundlePhase,
    Collaborators,
};
pub use payload::{AssembledPayload, PayloadAssembler};
pub use resource::{EmbedToolchain, ResourceEmbedder, UnsignedInstaller};
pub use settings::{DeployConfig, Settings, SettingsBuilder};
pub use signing::{SignedInstaller, SigningCoordinator, SigningTransport};
pub use tagging::{TagFanOut, TagWriter, TaggedArtifact};

use std::path::PathBuf;

use serde::Serialize;

/// Everything one completed bundle produced.
///
/// Returned inside a [`BuildReport`] after a successful assembly and
/// serialized into the build report file.
///
/// # Fields
///
/// - `installer`: the signed (or passed-through) meta-installer
/// - `manifest`: the offline update manifest in its keyed directory
/// - `msi`, `tagged`: optional derivative artifacts
/// - `size`/`checksum`: integrity data for the published installer
#[derive(Clone, Debug, Serialize)]
pub struct BundleArtifact {
    /// Bundle name from the catalog.
    pub bundle: String,

    /// Published installer.
    pub installer: PathBuf,

    /// Offline update manifest describing the embedded binaries.
    pub manifest: PathBuf,

    /// Enterprise MSI, when the bundle requested one.
    pub msi: Option<PathBuf>,

    /// Tagged variants, in tagging catalog group order.
    pub tagged: Vec<PathBuf>,

    /// Size of the published installer in bytes.
    pub size: u64,

    /// SHA-256 checksum of the published installer.
    ///
    /// This can be published alongside the artifact for consumers to verify
    /// downloads; it is not the manifest digest, which covers the embedded
    /// binaries individually.
    pub checksum: String,
}
