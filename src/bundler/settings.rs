//! Configuration structures for meta-installer assembly.
//!
//! This module provides the deployment configuration types (parsed from a
//! TOML file) and the [`Settings`] object the pipeline runs against.
//! Settings are always passed explicitly; no component reads configuration
//! from ambient process state.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use path_absolutize::Absolutize;
use serde::Deserialize;

use crate::bundler::error::{Context, Error, ErrorExt, Result};
use crate::bundler::resource::PAYLOAD_RESOURCE_ID;

/// Default number of signing submissions before giving up.
pub const DEFAULT_SIGNING_ATTEMPTS: u32 = 3;

/// Default delay between signing submissions, in seconds.
pub const DEFAULT_SIGNING_RETRY_DELAY_SECS: u64 = 5;

/// Default overall deadline for signing one artifact, in seconds.
pub const DEFAULT_SIGNING_TIMEOUT_SECS: u64 = 600;

/// File-name prefix applied to every artifact of a non-official build.
pub const UNOFFICIAL_PREFIX: &str = "UNOFFICIAL_";

/// Output subdirectory for non-official installers.
pub const TEST_INSTALLERS_DIR: &str = "Test_Installers";

/// Output subdirectory for tagged installers.
pub const TAGGED_INSTALLERS_DIR: &str = "Tagged_Offline_Installers";

/// Payload transform implementation to use for the filter and compress stages.
///
/// # Configuration
///
/// ```toml
/// [codec]
/// kind = "toolchain"
/// filter_tool = "bcj2"
/// compress_tool = "lzma"
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// External filter and compressor executables (production deployments).
    Toolchain,

    /// Built-in deflate codec with a byte-interleave prefilter.
    ///
    /// Needs no external tools. Used by deployments without the
    /// compression toolchain and by the test suite.
    #[default]
    Deflate,
}

/// Codec configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodecSettings {
    /// Which codec to run.
    ///
    /// Default: [`CodecKind::Deflate`]
    #[serde(default)]
    pub kind: CodecKind,

    /// Executable-stream prefilter tool. Required when `kind = "toolchain"`.
    ///
    /// Bare names are resolved on `PATH`.
    #[serde(default)]
    pub filter_tool: Option<String>,

    /// Compressor tool. Required when `kind = "toolchain"`.
    #[serde(default)]
    pub compress_tool: Option<String>,

    /// Extra flags appended to every compressor invocation.
    ///
    /// Default: none
    #[serde(default)]
    pub compress_flags: Vec<String>,
}

/// One named resource declared in the generated resource script.
///
/// # Configuration
///
/// ```toml
/// [[embed.resource_entries]]
/// name = "IDR_UPDATER"
/// id = 103
/// path = "bin/updater.exe"
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceEntry {
    /// Resource identifier used in the script.
    pub name: String,

    /// Numeric resource id the extraction stub reads the entry by.
    pub id: u32,

    /// File embedded under this entry.
    pub path: PathBuf,
}

/// Resource-embedding toolchain configuration.
///
/// The compiler and linker are required to produce a real installer; they
/// are resolved when the embedder is constructed, not at config load.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbedSettings {
    /// Resource compiler (`.rc` script to compiled resource).
    #[serde(default)]
    pub resource_compiler: Option<String>,

    /// Linker used to produce the resource-only DLL.
    #[serde(default)]
    pub linker: Option<String>,

    /// Merge tool that appends the resource DLL onto the stub executable.
    ///
    /// When unset the merge is done in-process with a plain byte append,
    /// which matches what the external tool does to the stub.
    #[serde(default)]
    pub merger: Option<String>,

    /// Named resources declared after the payload entry, in list order.
    ///
    /// Default: none
    #[serde(default)]
    pub resource_entries: Vec<ResourceEntry>,
}

/// Signing policy for produced installers.
///
/// Absent entirely, installers pass through the signing stage unchanged.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningSettings {
    /// Signing tool executable.
    pub command: String,

    /// Arguments placed before the artifact path on each submission.
    #[serde(default)]
    pub args: Vec<String>,

    /// Submissions to make before giving up.
    ///
    /// Default: 3
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Fixed delay between submissions, in seconds.
    ///
    /// Default: 5
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Overall deadline for one artifact, in seconds.
    ///
    /// Default: 600
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// File names eligible for signing.
    ///
    /// When set, artifacts whose file name is not listed skip the signer
    /// and pass through unchanged. When unset, everything is signed.
    #[serde(default)]
    pub allow_list: Option<Vec<String>>,
}

fn default_attempts() -> u32 {
    DEFAULT_SIGNING_ATTEMPTS
}

fn default_retry_delay() -> u64 {
    DEFAULT_SIGNING_RETRY_DELAY_SECS
}

fn default_timeout() -> u64 {
    DEFAULT_SIGNING_TIMEOUT_SECS
}

impl SigningSettings {
    /// Delay between submissions.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Overall per-artifact deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Enterprise MSI wrap configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnterpriseSettings {
    /// MSI wrapper tool. Required for bundles that request an enterprise MSI.
    #[serde(default)]
    pub wrapper: Option<String>,
}

/// Deployment configuration file.
///
/// Describes the fixed inputs of a deployment: the extraction stub, the
/// updater core files packaged into every installer, and the external
/// collaborator tools. Per-build inputs (bundle catalog, output directory,
/// official flag) come from the command line.
///
/// # Example
///
/// ```toml
/// core_version = "1.3.23.0"
/// stub = "bin/mi_stub.exe"
/// core_files_dir = "bin/core"
/// core_files = ["updater.exe", "updaterres_en.dll"]
///
/// [codec]
/// kind = "toolchain"
/// filter_tool = "bcj2"
/// compress_tool = "lzma"
///
/// [embed]
/// resource_compiler = "rc"
/// linker = "link"
/// merger = "resmerge"
///
/// [signing]
/// command = "signtool"
/// args = ["sign", "/f", "release.pfx"]
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    /// Version string of the packaged core files, recorded in build logs.
    #[serde(default)]
    pub core_version: String,

    /// Empty extraction stub the payload is merged into.
    pub stub: PathBuf,

    /// Directory holding the updater core files.
    #[serde(default)]
    pub core_files_dir: Option<PathBuf>,

    /// Core file names packaged into every installer, in payload order.
    #[serde(default)]
    pub core_files: Vec<String>,

    /// Filter/compress codec selection.
    #[serde(default)]
    pub codec: CodecSettings,

    /// Resource-embedding toolchain.
    #[serde(default)]
    pub embed: EmbedSettings,

    /// Signing policy. Absent means installers are left unsigned.
    #[serde(default)]
    pub signing: Option<SigningSettings>,

    /// Enterprise MSI wrap policy.
    #[serde(default)]
    pub enterprise: EnterpriseSettings,

    /// Certificate-tagging tool. Required when a bundle carries tag entries.
    #[serde(default)]
    pub tag_tool: Option<String>,
}

impl DeployConfig {
    /// Loads a deployment config from a TOML file.
    ///
    /// Relative `stub` and `core_files_dir` paths are resolved against the
    /// config file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).fs_context("reading deployment config", path)?;
        let mut config: Self = toml::from_str(&text)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.stub = absolutize_from(&config.stub, base)?;
        if let Some(dir) = config.core_files_dir.take() {
            config.core_files_dir = Some(absolutize_from(&dir, base)?);
        }
        for entry in &mut config.embed.resource_entries {
            entry.path = absolutize_from(&entry.path, base)?;
        }
        Ok(config)
    }
}

/// The stub locates its payload by a fixed id; no configured entry may
/// shadow it, and entry ids must be unique.
fn validate_resource_entries(entries: &[ResourceEntry]) -> Result<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        if entry.name.is_empty() {
            return Err(Error::InvalidSpec(
                "embed resource entry has no name".to_string(),
            ));
        }
        if entry.id == PAYLOAD_RESOURCE_ID {
            return Err(Error::InvalidSpec(format!(
                "embed resource entry {} reuses the payload resource id {PAYLOAD_RESOURCE_ID}",
                entry.name
            )));
        }
        if !seen.insert(entry.id) {
            return Err(Error::InvalidSpec(format!(
                "embed resource entries share id {}",
                entry.id
            )));
        }
    }
    Ok(())
}

fn absolutize_from(path: &Path, base: &Path) -> Result<PathBuf> {
    Ok(path
        .absolutize_from(base)
        .fs_context("resolving configured path", path)?
        .into_owned())
}

/// Resolves a configured collaborator tool to an executable path.
///
/// Names containing a path separator are taken as filesystem paths; bare
/// names are looked up on `PATH`. Either way a missing tool is reported as
/// [`Error::EnvironmentMissing`] so environment gaps surface before any
/// pipeline stage runs.
pub fn resolve_tool(tool: &str) -> Result<PathBuf> {
    let path = Path::new(tool);
    if path.components().count() > 1 {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::EnvironmentMissing(format!(
            "tool not found at {}",
            path.display()
        )));
    }
    which::which(tool)
        .map_err(|_| Error::EnvironmentMissing(format!("tool {tool} not found on PATH")))
}

/// Main settings for an assembly run.
///
/// Constructed via [`SettingsBuilder`] from a [`DeployConfig`] plus
/// command-line overrides, then passed by reference through the pipeline.
///
/// # Examples
///
/// ```no_run
/// use mipack::bundler::{DeployConfig, SettingsBuilder};
///
/// # fn example(config: DeployConfig) -> mipack::bundler::Result<()> {
/// let settings = SettingsBuilder::new()
///     .deploy_config(config)
///     .output_dir("out")
///     .fragments_dir("manifests")
///     .official(true)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Settings {
    config: DeployConfig,
    output_dir: PathBuf,
    work_dir: PathBuf,
    fragments_dir: PathBuf,
    official: bool,
    prefix: String,
    jobs: usize,
}

impl Settings {
    /// Whether this is an official build.
    ///
    /// Non-official builds prefix every artifact name with
    /// [`UNOFFICIAL_PREFIX`] and divert output to [`TEST_INSTALLERS_DIR`].
    pub fn official(&self) -> bool {
        self.official
    }

    /// Optional extra file-name prefix distinguishing build flavors.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Maximum number of bundles assembled concurrently.
    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Root output directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Scratch directory for intermediate stage artifacts.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Directory holding the per-application manifest fragments
    /// (`<guid>.gup`).
    pub fn fragments_dir(&self) -> &Path {
        &self.fragments_dir
    }

    /// Path to the empty extraction stub.
    pub fn stub(&self) -> &Path {
        &self.config.stub
    }

    /// Version string of the packaged core files.
    pub fn core_version(&self) -> &str {
        &self.config.core_version
    }

    /// Directory holding the updater core files, if any are configured.
    pub fn core_files_dir(&self) -> Option<&Path> {
        self.config.core_files_dir.as_deref()
    }

    /// Core file names packaged into every installer, in payload order.
    pub fn core_files(&self) -> &[String] {
        &self.config.core_files
    }

    /// Codec configuration.
    pub fn codec(&self) -> &CodecSettings {
        &self.config.codec
    }

    /// Resource-embedding toolchain configuration.
    pub fn embed(&self) -> &EmbedSettings {
        &self.config.embed
    }

    /// Signing policy, if signing is configured.
    pub fn signing(&self) -> Option<&SigningSettings> {
        self.config.signing.as_ref()
    }

    /// Enterprise MSI wrap policy.
    pub fn enterprise(&self) -> &EnterpriseSettings {
        &self.config.enterprise
    }

    /// Certificate-tagging tool, if configured.
    pub fn tag_tool(&self) -> Option<&str> {
        self.config.tag_tool.as_deref()
    }

    /// Applies the build-flavor prefixes to an artifact base name.
    ///
    /// Official builds get `{prefix}{base}`, non-official builds
    /// `{prefix}UNOFFICIAL_{base}`.
    pub fn decorated_name(&self, base: &str) -> String {
        if self.official {
            format!("{}{base}", self.prefix)
        } else {
            format!("{}{UNOFFICIAL_PREFIX}{base}", self.prefix)
        }
    }

    /// Directory installers are written to.
    ///
    /// Non-official builds divert to a separate test-installers directory
    /// so they cannot be mistaken for release artifacts.
    pub fn installers_dir(&self) -> PathBuf {
        if self.official {
            self.output_dir.clone()
        } else {
            self.output_dir.join(TEST_INSTALLERS_DIR)
        }
    }

    /// Directory tagged installers are written to.
    pub fn tagged_dir(&self) -> PathBuf {
        self.output_dir.join(TAGGED_INSTALLERS_DIR)
    }

    /// Directory update manifests are written to, before the per-bundle key.
    pub fn manifests_dir(&self) -> PathBuf {
        self.output_dir.join("manifests")
    }
}

/// Builder for constructing [`Settings`].
///
/// # See Also
///
/// - [`Settings`] - The built settings struct
/// - [`DeployConfig`] - The deployment half of the configuration
#[derive(Default)]
pub struct SettingsBuilder {
    config: Option<DeployConfig>,
    output_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    fragments_dir: Option<PathBuf>,
    official: bool,
    prefix: String,
    jobs: Option<usize>,
}

impl SettingsBuilder {
    /// Creates a new settings builder.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the deployment configuration.
    ///
    /// # Required
    ///
    /// This field is required for building.
    pub fn deploy_config(mut self, config: DeployConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the root output directory.
    ///
    /// # Required
    ///
    /// This field is required for building.
    pub fn output_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the scratch directory for intermediate artifacts.
    ///
    /// Default: `<output_dir>/work`
    pub fn work_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.work_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the directory holding per-application manifest fragments.
    ///
    /// # Required
    ///
    /// This field is required for building.
    pub fn fragments_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.fragments_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Marks the build official.
    ///
    /// Default: false
    pub fn official(mut self, official: bool) -> Self {
        self.official = official;
        self
    }

    /// Sets an extra file-name prefix for all artifacts.
    ///
    /// Default: empty
    pub fn file_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the bundle concurrency limit.
    ///
    /// Default: number of CPUs
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Builds the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing or the deployment
    /// config is internally inconsistent (e.g. a toolchain codec without
    /// its tools).
    pub fn build(self) -> Result<Settings> {
        let config = self.config.context("deployment config is required")?;
        let output_dir = self.output_dir.context("output directory is required")?;
        let fragments_dir = self
            .fragments_dir
            .context("manifest fragments directory is required")?;

        if config.codec.kind == CodecKind::Toolchain
            && (config.codec.filter_tool.is_none() || config.codec.compress_tool.is_none())
        {
            return Err(Error::EnvironmentMissing(
                "toolchain codec selected but filter_tool/compress_tool are not configured"
                    .to_string(),
            ));
        }
        validate_resource_entries(&config.embed.resource_entries)?;

        let work_dir = self.work_dir.unwrap_or_else(|| output_dir.join("work"));
        let jobs = match self.jobs {
            Some(0) | None => num_cpus::get(),
            Some(n) => n,
        };

        Ok(Settings {
            config,
            output_dir,
            work_dir,
            fragments_dir,
            official: self.official,
            prefix: self.prefix,
            jobs,
        })
    }
}
