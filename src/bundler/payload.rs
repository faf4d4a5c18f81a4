//! Payload assembly.
//!
//! Collects everything the extraction stub unpacks at install time: the
//! updater core files plus the per-application installer binaries. Each app
//! binary is staged under `<basename>.<guid>` because the stub locates the
//! installer to launch by its guid extension.

use std::path::{Path, PathBuf};

use log::debug;

use crate::bundler::error::{Error, ErrorExt, Result};
use crate::bundler::settings::Settings;
use crate::catalog::BundleDescriptor;

/// One application binary paired with its manifest fragment.
#[derive(Clone, Debug)]
pub struct PayloadPair {
    /// Application guid, as given in the catalog.
    pub guid: String,

    /// Application version.
    pub version: String,

    /// Manifest fragment for this application (`<fragments_dir>/<guid>.gup`).
    pub fragment: PathBuf,

    /// Staged binary, renamed to `<basename>.<guid>`.
    pub renamed: PathBuf,
}

/// The collected payload of one bundle.
#[derive(Clone, Debug)]
pub struct AssembledPayload {
    /// Files to archive, in payload order: core files first, then the
    /// renamed application binaries. The update manifest is appended once
    /// it has been generated.
    pub files: Vec<PathBuf>,

    /// Fragment/binary pairs, one per application, in catalog order.
    pub pairs: Vec<PayloadPair>,

    /// Human-readable description of the staged applications, appended to
    /// the per-installer contents log.
    pub log_text: String,
}

/// Stages the payload files of a bundle.
pub struct PayloadAssembler<'a> {
    settings: &'a Settings,
}

impl<'a> PayloadAssembler<'a> {
    /// Creates an assembler running against `settings`.
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// Validates and stages the payload of `bundle` into `staging_dir`.
    ///
    /// The returned pairing list has exactly one entry per application
    /// binary, in catalog order.
    pub async fn assemble(
        &self,
        bundle: &BundleDescriptor,
        staging_dir: &Path,
    ) -> Result<AssembledPayload> {
        if bundle.binaries.is_empty() {
            return Err(Error::EmptyBundle(bundle.name.clone()));
        }

        let mut files = self.core_files().await?;
        let mut pairs = Vec::with_capacity(bundle.binaries.len());
        let mut log_text = String::new();

        for binary in &bundle.binaries {
            let metadata = tokio::fs::metadata(&binary.path).await.map_err(|_| {
                Error::InvalidSpec(format!(
                    "bundle {}: installer {} does not exist",
                    bundle.name,
                    binary.path.display()
                ))
            })?;
            if !metadata.is_file() {
                return Err(Error::InvalidSpec(format!(
                    "bundle {}: installer {} is not a file",
                    bundle.name,
                    binary.path.display()
                )));
            }

            let renamed = staging_dir.join(renamed_file_name(&binary.path, &binary.guid)?);
            if pairs.iter().any(|p: &PayloadPair| p.renamed == renamed) {
                return Err(Error::InvalidSpec(format!(
                    "bundle {}: duplicate payload name {}",
                    bundle.name,
                    renamed.display()
                )));
            }
            debug!("staging {} as {}", binary.path.display(), renamed.display());
            tokio::fs::copy(&binary.path, &renamed)
                .await
                .fs_context("staging payload binary", &renamed)?;

            let fragment = self
                .settings
                .fragments_dir()
                .join(format!("{}.gup", binary.guid));

            log_text.push_str(&format!(
                "\n\n*** App: {} ***\n\nVersion:{}\n\nINSTALLER:\n{}\n",
                binary.guid,
                binary.version,
                binary.path.display()
            ));

            files.push(renamed.clone());
            pairs.push(PayloadPair {
                guid: binary.guid.clone(),
                version: binary.version.clone(),
                fragment,
                renamed,
            });
        }

        Ok(AssembledPayload {
            files,
            pairs,
            log_text,
        })
    }

    /// Resolves the configured core files, keeping their configured order.
    async fn core_files(&self) -> Result<Vec<PathBuf>> {
        let Some(dir) = self.settings.core_files_dir() else {
            if self.settings.core_files().is_empty() {
                return Ok(Vec::new());
            }
            return Err(Error::EnvironmentMissing(
                "core files listed but core_files_dir is not configured".to_string(),
            ));
        };

        let mut files = Vec::with_capacity(self.settings.core_files().len());
        for name in self.settings.core_files() {
            let path = dir.join(name);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(Error::EnvironmentMissing(format!(
                    "core file {} not found",
                    path.display()
                )));
            }
            files.push(path);
        }
        Ok(files)
    }
}

/// Payload name of an application binary: `<basename>.<guid>`.
fn renamed_file_name(source: &Path, guid: &str) -> Result<String> {
    let basename = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::InvalidSpec(format!("installer path {} has no file name", source.display()))
        })?;
    Ok(format!("{basename}.{guid}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::settings::{DeployConfig, SettingsBuilder};
    use crate::catalog::AppBinarySpec;

    const GUID_A: &str = "{8A69D345-D564-463C-AFF1-A69D9E530F96}";
    const GUID_B: &str = "{4DC8B4CA-1BDA-483E-B5FA-D3C12E15B62D}";
    const GUID_C: &str = "{283EAF47-8817-4C2B-A801-AD1FADFB7BAA}";

    fn test_settings(root: &Path) -> Settings {
        SettingsBuilder::new()
            .deploy_config(DeployConfig {
                stub: root.join("stub.exe"),
                ..Default::default()
            })
            .output_dir(root.join("out"))
            .fragments_dir(root.join("fragments"))
            .build()
            .unwrap()
    }

    fn app(root: &Path, name: &str, guid: &str, version: &str) -> AppBinarySpec {
        let path = root.join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        AppBinarySpec {
            guid: guid.to_string(),
            version: version.to_string(),
            path,
        }
    }

    fn core_settings(root: &Path, dir: Option<PathBuf>, files: &[&str]) -> Settings {
        SettingsBuilder::new()
            .deploy_config(DeployConfig {
                stub: root.join("stub.exe"),
                core_files_dir: dir,
                core_files: files.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            })
            .output_dir(root.join("out"))
            .fragments_dir(root.join("fragments"))
            .build()
            .unwrap()
    }

    fn bundle(binaries: Vec<AppBinarySpec>) -> BundleDescriptor {
        BundleDescriptor {
            name: "Widget".to_string(),
            installer_base_name: "WidgetSetup".to_string(),
            binaries,
            enterprise: None,
            tag_catalog: None,
        }
    }

    #[tokio::test]
    async fn pairing_list_has_one_entry_per_binary() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let staging = root.join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let settings = test_settings(root);

        let bundle = bundle(vec![
            app(root, "a.msi", GUID_A, "1.0.0.0"),
            app(root, "b.msi", GUID_B, "2.0.0.0"),
            app(root, "c.msi", GUID_C, "3.0.0.0"),
        ]);

        let payload = PayloadAssembler::new(&settings)
            .assemble(&bundle, &staging)
            .await
            .unwrap_or_else(|e| panic!("assemble failed: {e}"));

        assert_eq!(payload.pairs.len(), 3);
        assert_eq!(payload.files.len(), 3);
        for (pair, binary) in payload.pairs.iter().zip(&bundle.binaries) {
            assert_eq!(pair.guid, binary.guid);
            assert_eq!(
                pair.renamed.file_name().unwrap().to_str().unwrap(),
                format!(
                    "{}.{}",
                    binary.path.file_name().unwrap().to_str().unwrap(),
                    binary.guid
                )
            );
            assert!(pair.fragment.ends_with(format!("{}.gup", binary.guid)));
            assert!(pair.renamed.exists());
        }
    }

    #[tokio::test]
    async fn core_files_come_first_in_configured_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let staging = root.join("staging");
        let core = root.join("core");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(&core).unwrap();
        std::fs::write(core.join("updater.exe"), b"updater").unwrap();
        std::fs::write(core.join("updaterres_en.dll"), b"resources").unwrap();
        let settings = core_settings(
            root,
            Some(core.clone()),
            &["updater.exe", "updaterres_en.dll"],
        );

        let bundle = bundle(vec![app(root, "a.msi", GUID_A, "1.0.0.0")]);
        let payload = PayloadAssembler::new(&settings)
            .assemble(&bundle, &staging)
            .await
            .unwrap();

        assert_eq!(
            payload.files,
            vec![
                core.join("updater.exe"),
                core.join("updaterres_en.dll"),
                staging.join(format!("a.msi.{GUID_A}")),
            ]
        );
        // The pairing list only covers app binaries.
        assert_eq!(payload.pairs.len(), 1);
    }

    #[tokio::test]
    async fn missing_core_file_is_environment_missing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let staging = root.join("staging");
        let core = root.join("core");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(&core).unwrap();
        let settings = core_settings(root, Some(core), &["updater.exe"]);

        let bundle = bundle(vec![app(root, "a.msi", GUID_A, "1.0.0.0")]);
        let err = PayloadAssembler::new(&settings)
            .assemble(&bundle, &staging)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::EnvironmentMissing(_)));
        assert!(err.to_string().contains("updater.exe"));
    }

    #[tokio::test]
    async fn core_files_without_a_directory_are_environment_missing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let staging = root.join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let settings = core_settings(root, None, &["updater.exe"]);

        let bundle = bundle(vec![app(root, "a.msi", GUID_A, "1.0.0.0")]);
        let err = PayloadAssembler::new(&settings)
            .assemble(&bundle, &staging)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::EnvironmentMissing(_)));
        assert!(err.to_string().contains("core_files_dir"));
    }

    #[tokio::test]
    async fn missing_installer_is_invalid_spec() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let staging = root.join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let settings = test_settings(root);

        let bundle = bundle(vec![AppBinarySpec {
            guid: GUID_A.to_string(),
            version: "1.0.0.0".to_string(),
            path: root.join("missing.msi"),
        }]);

        let err = PayloadAssembler::new(&settings)
            .assemble(&bundle, &staging)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn duplicate_payload_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let staging = root.join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let settings = test_settings(root);

        let first = app(root, "a.msi", GUID_A, "1.0.0.0");
        let second = AppBinarySpec {
            guid: GUID_A.to_string(),
            version: "2.0.0.0".to_string(),
            path: first.path.clone(),
        };
        let bundle = bundle(vec![first, second]);

        let err = PayloadAssembler::new(&settings)
            .assemble(&bundle, &staging)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate payload name"));
    }

    #[tokio::test]
    async fn log_text_describes_each_app() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let staging = root.join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let settings = test_settings(root);

        let bundle = bundle(vec![app(root, "a.msi", GUID_A, "1.2.3.4")]);
        let payload = PayloadAssembler::new(&settings)
            .assemble(&bundle, &staging)
            .await
            .unwrap();

        assert!(payload.log_text.contains(&format!("*** App: {GUID_A} ***")));
        assert!(payload.log_text.contains("Version:1.2.3.4"));
        assert!(payload.log_text.contains("INSTALLER:"));
    }
}
