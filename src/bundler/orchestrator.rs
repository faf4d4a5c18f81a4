//! Bundle orchestration.
//!
//! Drives the whole pipeline for every bundle in a catalog: payload staging,
//! manifest generation, archive/filter/compress, resource embedding, signing,
//! and the optional enterprise wrap and tag fan-out. Bundles are independent
//! and run concurrently up to the configured job limit; one bundle failing
//! never stops its siblings.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::bundler::BundleArtifact;
use crate::bundler::archive::ArchivePipeline;
use crate::bundler::codec::{PayloadCodec, codec_from_settings};
use crate::bundler::enterprise::{CommandMsiWrapper, EnterpriseMsi, EnterpriseWrapper};
use crate::bundler::error::{Error, ErrorExt, Result};
use crate::bundler::manifest::{
    self, ManifestSource, OFFLINE_MANIFEST_FILE, manifest_dir_key, write_offline_manifest,
};
use crate::bundler::payload::{AssembledPayload, PayloadAssembler};
use crate::bundler::resource::{EmbedToolchain, ResourceEmbedder, ResourceToolchain};
use crate::bundler::settings::Settings;
use crate::bundler::signing::{CommandSigner, SigningCoordinator, SigningTransport};
use crate::bundler::tagging::{CommandTagWriter, TagFanOut, TagWriter};
use crate::catalog::{BundleDescriptor, group_tag_entries, read_tag_catalog};

/// Progress of one bundle through the pipeline.
///
/// Phases are ordered; a bundle only ever moves forward. A failure leaves
/// the bundle at the last phase it completed.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub enum BundlePhase {
    /// Descriptor validated, no filesystem work done yet.
    Validated,
    /// Payload files staged and the update manifest generated.
    PayloadBuilt,
    /// Payload archived, filtered and compressed.
    Archived,
    /// Compressed payload embedded into the stub.
    Embedded,
    /// Installer signed (or passed through) and published.
    Signed,
    /// Enterprise MSI written.
    EnterpriseWrapped,
    /// Tagged variants written.
    Tagged,
    /// All requested artifacts produced.
    Done,
}

/// One bundle that did not produce its artifacts.
#[derive(Clone, Debug, Serialize)]
pub struct BundleFailure {
    /// Bundle name from the catalog.
    pub bundle: String,

    /// Last phase the bundle completed before failing.
    pub phase: BundlePhase,

    /// What went wrong.
    pub error: String,
}

/// Aggregate result of one orchestrator run.
///
/// Successes and failures are reported side by side, in catalog order;
/// a failed bundle never hides its siblings' artifacts.
#[derive(Clone, Debug, Serialize)]
pub struct BuildReport {
    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run finished.
    pub finished_at: DateTime<Utc>,

    /// Artifacts of the bundles that completed.
    pub artifacts: Vec<BundleArtifact>,

    /// Bundles that failed, with the phase they reached.
    pub failures: Vec<BundleFailure>,
}

impl BuildReport {
    /// Whether every bundle completed.
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// External collaborators the pipeline runs against.
///
/// Production runs resolve these from the deployment config; tests inject
/// fakes through [`BundleOrchestrator::new`].
pub struct Collaborators {
    /// Filter/compress codec.
    pub codec: Arc<dyn PayloadCodec>,

    /// Resource compile/link/merge toolchain.
    pub toolchain: Arc<dyn EmbedToolchain>,

    /// Signing transport, absent for unsigned deployments.
    pub signer: Option<Arc<dyn SigningTransport>>,

    /// Enterprise MSI wrapper, absent when no bundle is wrapped.
    pub wrapper: Option<Arc<dyn EnterpriseWrapper>>,

    /// Certificate tag writer, absent when no bundle fans out.
    pub tag_writer: Option<Arc<dyn TagWriter>>,
}

impl Collaborators {
    /// Resolves every configured collaborator.
    ///
    /// Optional collaborators stay absent when unconfigured; bundles that
    /// need them fail at validation with `EnvironmentMissing`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let signer: Option<Arc<dyn SigningTransport>> = match settings.signing() {
            Some(policy) => Some(Arc::new(CommandSigner::from_settings(policy)?)),
            None => None,
        };
        let wrapper: Option<Arc<dyn EnterpriseWrapper>> = match settings.enterprise().wrapper {
            Some(_) => Some(Arc::new(CommandMsiWrapper::from_settings(settings.enterprise())?)),
            None => None,
        };
        let tag_writer: Option<Arc<dyn TagWriter>> = match settings.tag_tool() {
            Some(tool) => Some(Arc::new(CommandTagWriter::from_tool(tool)?)),
            None => None,
        };
        Ok(Self {
            codec: codec_from_settings(settings)?,
            toolchain: Arc::new(ResourceToolchain::from_settings(settings.embed())?),
            signer,
            wrapper,
            tag_writer,
        })
    }
}

/// Drives the assembly pipeline over a bundle catalog.
pub struct BundleOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    codec: Arc<dyn PayloadCodec>,
    toolchain: Arc<dyn EmbedToolchain>,
    signing: SigningCoordinator,
    wrapper: Option<Arc<dyn EnterpriseWrapper>>,
    tag_writer: Option<Arc<dyn TagWriter>>,
}

impl BundleOrchestrator {
    /// Creates an orchestrator with explicit collaborators.
    pub fn new(settings: Settings, collaborators: Collaborators) -> Self {
        let signing = SigningCoordinator::new(collaborators.signer, settings.signing());
        Self {
            inner: Arc::new(Inner {
                settings,
                codec: collaborators.codec,
                toolchain: collaborators.toolchain,
                signing,
                wrapper: collaborators.wrapper,
                tag_writer: collaborators.tag_writer,
            }),
        }
    }

    /// Creates an orchestrator resolving collaborators from the settings.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let collaborators = Collaborators::from_settings(&settings)?;
        Ok(Self::new(settings, collaborators))
    }

    /// Assembles every bundle, up to the configured number in parallel.
    ///
    /// Returns `Err` only when the run cannot start at all (output
    /// directories cannot be created); per-bundle failures are reported in
    /// the [`BuildReport`].
    pub async fn run(&self, bundles: Vec<BundleDescriptor>) -> Result<BuildReport> {
        let started_at = Utc::now();
        self.prepare_directories(&bundles).await?;

        // Output paths are keyed by decorated installer name; two bundles
        // that would collide cannot build in the same run.
        let mut failures = Vec::new();
        let mut seen_names = HashSet::new();
        let mut runnable = Vec::new();
        for (index, bundle) in bundles.into_iter().enumerate() {
            let name = self
                .inner
                .settings
                .decorated_name(&bundle.installer_file_name());
            if !seen_names.insert(name.clone()) {
                warn!("bundle {} collides on output name {name}", bundle.name);
                failures.push((
                    index,
                    BundleFailure {
                        bundle: bundle.name.clone(),
                        phase: BundlePhase::Validated,
                        error: Error::InvalidSpec(format!(
                            "bundle {}: output name {name} already produced by an earlier \
                             catalog entry",
                            bundle.name
                        ))
                        .to_string(),
                    },
                ));
                continue;
            }
            runnable.push((index, bundle));
        }

        let limit = Arc::new(Semaphore::new(self.inner.settings.jobs().max(1)));
        let mut tasks = JoinSet::new();
        for (index, bundle) in runnable {
            let inner = Arc::clone(&self.inner);
            let limit = Arc::clone(&limit);
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let mut phase = BundlePhase::Validated;
                let outcome = inner.assemble_bundle(&bundle, &mut phase).await;
                (index, bundle.name, phase, outcome)
            });
        }

        let mut artifacts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, name, phase, outcome) = joined
                .map_err(|e| Error::GenericError(format!("bundle task failed: {e}")))?;
            match outcome {
                Ok(artifact) => {
                    info!("bundle {name} done: {}", artifact.installer.display());
                    artifacts.push((index, artifact));
                }
                Err(error) => {
                    warn!("bundle {name} failed after {phase:?}: {error}");
                    failures.push((
                        index,
                        BundleFailure {
                            bundle: name,
                            phase,
                            error: error.to_string(),
                        },
                    ));
                }
            }
        }

        // Report in catalog order regardless of completion order.
        artifacts.sort_by_key(|(index, _)| *index);
        failures.sort_by_key(|(index, _)| *index);
        Ok(BuildReport {
            started_at,
            finished_at: Utc::now(),
            artifacts: artifacts.into_iter().map(|(_, a)| a).collect(),
            failures: failures.into_iter().map(|(_, f)| f).collect(),
        })
    }

    async fn prepare_directories(&self, bundles: &[BundleDescriptor]) -> Result<()> {
        let settings = &self.inner.settings;
        for dir in [
            settings.work_dir().to_path_buf(),
            settings.installers_dir(),
            settings.manifests_dir(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .fs_context("creating output directory", &dir)?;
        }
        if bundles.iter().any(|b| b.tag_catalog.is_some()) {
            let tagged = settings.tagged_dir();
            tokio::fs::create_dir_all(&tagged)
                .await
                .fs_context("creating tagged output directory", &tagged)?;
        }
        Ok(())
    }
}

impl Inner {
    /// Runs every pipeline stage for one bundle.
    ///
    /// `phase` records the last completed stage so a failure can be
    /// reported with the point it was reached.
    async fn assemble_bundle(
        &self,
        bundle: &BundleDescriptor,
        phase: &mut BundlePhase,
    ) -> Result<BundleArtifact> {
        bundle.validate()?;
        if bundle.enterprise.is_some() && self.wrapper.is_none() {
            return Err(Error::EnvironmentMissing(format!(
                "bundle {} requests an enterprise MSI but enterprise.wrapper is not configured",
                bundle.name
            )));
        }
        if bundle.tag_catalog.is_some() && self.tag_writer.is_none() {
            return Err(Error::EnvironmentMissing(format!(
                "bundle {} has a tagging catalog but tag_tool is not configured",
                bundle.name
            )));
        }
        // Tagging catalogs are validated before any pipeline work starts.
        let tag_groups = match &bundle.tag_catalog {
            Some(path) => Some(group_tag_entries(read_tag_catalog(path)?)),
            None => None,
        };

        let stem = self
            .settings
            .decorated_name(&bundle.installer_base_name);
        let work_dir = self.settings.work_dir().join(&stem);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .fs_context("creating bundle work directory", &work_dir)?;
        debug!("assembling bundle {} in {}", bundle.name, work_dir.display());

        // Stage the payload and generate the manifest from the exact staged
        // bytes, then let the manifest ride in the payload itself.
        let mut payload = PayloadAssembler::new(&self.settings)
            .assemble(bundle, &work_dir)
            .await?;
        let manifest_path = self.generate_manifest(&payload, &work_dir).await?;
        payload.files.push(manifest_path.clone());
        *phase = BundlePhase::PayloadBuilt;

        let compressed = ArchivePipeline::new(Arc::clone(&self.codec))
            .run(&payload.files, &work_dir, &format!("payload_{stem}"))
            .await?;
        *phase = BundlePhase::Archived;

        let unsigned = ResourceEmbedder::new(Arc::clone(&self.toolchain))
            .with_entries(self.settings.embed().resource_entries.clone())
            .embed(&compressed, self.settings.stub(), &work_dir, &stem)
            .await?;
        *phase = BundlePhase::Embedded;

        let installer = self.settings.installers_dir().join(format!("{stem}.exe"));
        let signed = self.signing.sign(unsigned, &work_dir, &installer).await?;
        *phase = BundlePhase::Signed;

        self.write_contents_log(bundle, &payload, &stem).await?;

        let mut msi = None;
        if let Some(enterprise) = &bundle.enterprise {
            // Presence of the wrapper was checked at validation.
            let wrapper = self.wrapper.as_ref().map(Arc::clone).ok_or_else(|| {
                Error::EnvironmentMissing("enterprise.wrapper is not configured".into())
            })?;
            let msi_base = self.settings.decorated_name(&enterprise.msi_base_name);
            let output_dir = self.settings.installers_dir();
            msi = Some(
                EnterpriseMsi::new(wrapper)
                    .wrap(&signed, bundle, &msi_base, &output_dir)
                    .await?,
            );
            *phase = BundlePhase::EnterpriseWrapped;
        }

        let mut tagged = Vec::new();
        if let Some(groups) = tag_groups {
            let writer = self.tag_writer.as_ref().map(Arc::clone).ok_or_else(|| {
                Error::EnvironmentMissing("tag_tool is not configured".into())
            })?;
            tagged = TagFanOut::new(writer)
                .produce(&signed, &groups, &self.settings.tagged_dir())
                .await?
                .into_iter()
                .map(|artifact| artifact.path().to_path_buf())
                .collect();
            *phase = BundlePhase::Tagged;
        }

        let (size, checksum) = file_digest(signed.path()).await?;
        *phase = BundlePhase::Done;
        Ok(BundleArtifact {
            bundle: bundle.name.clone(),
            installer: signed.path().to_path_buf(),
            manifest: self.manifest_output_path(&payload),
            msi,
            tagged,
            size,
            checksum,
        })
    }

    /// Generates the update response and writes it to the keyed manifest
    /// directory and the bundle work directory.
    async fn generate_manifest(
        &self,
        payload: &AssembledPayload,
        work_dir: &Path,
    ) -> Result<PathBuf> {
        let sources: Vec<ManifestSource> = payload
            .pairs
            .iter()
            .map(|pair| ManifestSource {
                fragment: pair.fragment.clone(),
                payload: pair.renamed.clone(),
            })
            .collect();
        let versions: Vec<String> = payload.pairs.iter().map(|p| p.version.clone()).collect();

        let work = work_dir.to_path_buf();
        let keyed = self.manifest_output_dir(payload);
        tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            let document = manifest::generate_update_response(&sources, &versions)?;
            write_offline_manifest(&keyed, &document)?;
            write_offline_manifest(&work, &document)
        })
        .await
        .map_err(|e| Error::GenericError(format!("manifest task failed: {e}")))?
    }

    fn manifest_output_dir(&self, payload: &AssembledPayload) -> PathBuf {
        let key = manifest_dir_key(
            payload
                .pairs
                .iter()
                .map(|p| (p.guid.as_str(), p.version.as_str())),
        );
        self.settings.manifests_dir().join(key)
    }

    fn manifest_output_path(&self, payload: &AssembledPayload) -> PathBuf {
        self.manifest_output_dir(payload).join(OFFLINE_MANIFEST_FILE)
    }

    /// Writes `<stem>_Contents.txt` next to the installer: core version,
    /// per-app details, then every consumed manifest fragment.
    async fn write_contents_log(
        &self,
        bundle: &BundleDescriptor,
        payload: &AssembledPayload,
        stem: &str,
    ) -> Result<()> {
        let mut text = format!(
            "Contents of {stem}.exe\nCore version: {}\nBuilt: {}\n{}",
            self.settings.core_version(),
            Utc::now().to_rfc3339(),
            payload.log_text
        );
        text.push_str("\n\n*** Update response fragments ***\n");
        for pair in &payload.pairs {
            let fragment = tokio::fs::read_to_string(&pair.fragment)
                .await
                .fs_context("reading manifest fragment", &pair.fragment)?;
            text.push_str(&format!("\n--- {} ---\n{fragment}\n", pair.fragment.display()));
        }

        let path = self
            .settings
            .installers_dir()
            .join(format!("{stem}_Contents.txt"));
        debug!("writing contents log for {} to {}", bundle.name, path.display());
        tokio::fs::write(&path, text)
            .await
            .fs_context("writing contents log", &path)?;
        Ok(())
    }
}

/// Size and SHA-256 checksum of a finished artifact, chunked.
async fn file_digest(path: &Path) -> Result<(u64, String)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(u64, String)> {
        let mut file = std::fs::File::open(&path).fs_context("opening artifact", &path)?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buffer = [0u8; 8192];
        loop {
            let read = file.read(&mut buffer).fs_context("reading artifact", &path)?;
            if read == 0 {
                break;
            }
            size += read as u64;
            hasher.update(&buffer[..read]);
        }
        Ok((size, hex::encode(hasher.finalize())))
    })
    .await
    .map_err(|e| Error::GenericError(format!("checksum task failed: {e}")))?
}
