//! Enterprise MSI wrapping.
//!
//! Wraps one signed installer into an MSI that IT administrators can push
//! through group policy. The MSI carries the installer plus the metadata
//! needed to uninstall it silently; it wraps the signed binary and never
//! replaces it. Only single-application bundles can be wrapped.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use log::info;

use crate::bundler::codec::run_stage;
use crate::bundler::error::{Error, Result};
use crate::bundler::settings::{EnterpriseSettings, resolve_tool};
use crate::bundler::signing::SignedInstaller;
use crate::catalog::BundleDescriptor;

/// Product metadata stamped into the MSI.
#[derive(Debug)]
pub struct EnterpriseWrapRequest<'a> {
    /// Friendly product name.
    pub product_name: &'a str,
    /// Version of the wrapped application.
    pub product_version: &'a str,
    /// Update GUID of the wrapped application.
    pub product_guid: &'a str,
    /// Arguments that silently uninstall the application.
    pub silent_uninstall_args: &'a str,
    /// Optional tag parameters baked into the MSI.
    pub custom_tag_params: Option<&'a str>,
    /// Optional installer data forwarded at install time.
    pub installer_data: Option<&'a str>,
}

/// Builds one MSI around a signed installer.
pub trait EnterpriseWrapper: Send + Sync {
    /// Builds the MSI at `output` around the signed installer.
    fn wrap(&self, signed: &Path, request: &EnterpriseWrapRequest<'_>, output: &Path)
    -> Result<()>;
}

/// Wrapper invoking the configured MSI build tool.
pub struct CommandMsiWrapper {
    tool: PathBuf,
}

impl CommandMsiWrapper {
    /// Resolves the configured wrapper tool.
    pub fn from_settings(settings: &EnterpriseSettings) -> Result<Self> {
        let tool = settings.wrapper.as_deref().ok_or_else(|| {
            Error::EnvironmentMissing("enterprise.wrapper is not configured".into())
        })?;
        Ok(Self { tool: resolve_tool(tool)? })
    }

    fn wrap_command(
        &self,
        signed: &Path,
        request: &EnterpriseWrapRequest<'_>,
        output: &Path,
    ) -> Command {
        let mut command = Command::new(&self.tool);
        command
            .arg("--product-name")
            .arg(request.product_name)
            .arg("--product-version")
            .arg(request.product_version)
            .arg("--product-guid")
            .arg(request.product_guid)
            .arg("--uninstall-args")
            .arg(request.silent_uninstall_args);
        if let Some(params) = request.custom_tag_params {
            command.arg("--tag-params").arg(params);
        }
        if let Some(data) = request.installer_data {
            command.arg("--installer-data").arg(data);
        }
        command.arg(signed).arg(output);
        command
    }
}

impl EnterpriseWrapper for CommandMsiWrapper {
    fn wrap(
        &self,
        signed: &Path,
        request: &EnterpriseWrapRequest<'_>,
        output: &Path,
    ) -> Result<()> {
        run_stage(self.wrap_command(signed, request, output), "enterprise-wrap")
    }
}

/// Drives the MSI wrap for one bundle.
pub struct EnterpriseMsi {
    wrapper: Arc<dyn EnterpriseWrapper>,
}

impl EnterpriseMsi {
    /// Creates a driver running the given wrapper.
    pub fn new(wrapper: Arc<dyn EnterpriseWrapper>) -> Self {
        Self { wrapper }
    }

    /// Wraps the signed installer, returning the MSI path.
    ///
    /// The MSI is named `<decorated base>_<version>.msi` so catalogs that
    /// build several versions of one application never collide.
    pub async fn wrap(
        &self,
        signed: &SignedInstaller,
        bundle: &BundleDescriptor,
        decorated_msi_base: &str,
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let [binary] = bundle.binaries.as_slice() else {
            return Err(Error::BundleTooLargeForEnterprise {
                bundle: bundle.name.clone(),
                count: bundle.binaries.len(),
            });
        };
        let enterprise = bundle.enterprise.as_ref().ok_or_else(|| {
            Error::InvalidSpec(format!("bundle {} requested no enterprise MSI", bundle.name))
        })?;

        let output = output_dir.join(format!("{decorated_msi_base}_{}.msi", binary.version));
        let wrapper = Arc::clone(&self.wrapper);
        let (wrap_signed, wrap_output) = (signed.path().to_path_buf(), output.clone());
        let (name, version, guid, uninstall, params, data) = (
            bundle.name.clone(),
            binary.version.clone(),
            binary.guid.clone(),
            enterprise.silent_uninstall_args.clone(),
            enterprise.custom_tag_params.clone(),
            enterprise.installer_data.clone(),
        );
        tokio::task::spawn_blocking(move || {
            let request = EnterpriseWrapRequest {
                product_name: &name,
                product_version: &version,
                product_guid: &guid,
                silent_uninstall_args: &uninstall,
                custom_tag_params: params.as_deref(),
                installer_data: data.as_deref(),
            };
            wrapper.wrap(&wrap_signed, &request, &wrap_output)
        })
        .await
        .map_err(|e| Error::GenericError(format!("enterprise wrap task failed: {e}")))??;

        info!("wrapped {} into {}", signed.path().display(), output.display());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AppBinarySpec, EnterpriseSpec};

    struct RecordingWrapper;

    impl EnterpriseWrapper for RecordingWrapper {
        fn wrap(
            &self,
            signed: &Path,
            request: &EnterpriseWrapRequest<'_>,
            output: &Path,
        ) -> Result<()> {
            let body = format!(
                "{} {} {}\n{}",
                request.product_guid,
                request.product_version,
                request.silent_uninstall_args,
                std::fs::read_to_string(signed)?,
            );
            std::fs::write(output, body)?;
            Ok(())
        }
    }

    fn bundle(binaries: Vec<AppBinarySpec>) -> BundleDescriptor {
        BundleDescriptor {
            name: "Widget".into(),
            installer_base_name: "WidgetSetup".into(),
            binaries,
            enterprise: Some(EnterpriseSpec {
                msi_base_name: "WidgetEnterprise".into(),
                silent_uninstall_args: "/quiet /uninstall".into(),
                custom_tag_params: None,
                installer_data: None,
            }),
            tag_catalog: None,
        }
    }

    fn app(guid: &str, version: &str) -> AppBinarySpec {
        AppBinarySpec { guid: guid.into(), version: version.into(), path: PathBuf::new() }
    }

    const GUID: &str = "{D4E8C065-1ECB-4CF4-BE2B-5DDF34EC9E62}";

    #[tokio::test]
    async fn wrap_writes_a_versioned_msi_beside_the_installer() {
        let dir = tempfile::tempdir().unwrap();
        let signed_path = dir.path().join("WidgetSetup.exe");
        std::fs::write(&signed_path, "signed installer").unwrap();
        let signed = SignedInstaller::new(signed_path);

        let msi = EnterpriseMsi::new(Arc::new(RecordingWrapper))
            .wrap(&signed, &bundle(vec![app(GUID, "1.2.3.4")]), "WidgetEnterprise", dir.path())
            .await
            .unwrap();

        assert_eq!(msi, dir.path().join("WidgetEnterprise_1.2.3.4.msi"));
        let body = std::fs::read_to_string(&msi).unwrap();
        assert!(body.starts_with(&format!("{GUID} 1.2.3.4 /quiet /uninstall")));
        assert!(body.ends_with("signed installer"));
    }

    #[tokio::test]
    async fn two_applications_cannot_be_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let signed_path = dir.path().join("WidgetSetup.exe");
        std::fs::write(&signed_path, "signed installer").unwrap();

        let err = EnterpriseMsi::new(Arc::new(RecordingWrapper))
            .wrap(
                &SignedInstaller::new(signed_path),
                &bundle(vec![app(GUID, "1.0.0.0"), app(GUID, "2.0.0.0")]),
                "WidgetEnterprise",
                dir.path(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BundleTooLargeForEnterprise { count: 2, .. }));
    }

    #[test]
    fn wrap_command_carries_the_product_metadata() {
        let wrapper = CommandMsiWrapper { tool: PathBuf::from("msiwrap") };
        let request = EnterpriseWrapRequest {
            product_name: "Widget",
            product_version: "1.2.3.4",
            product_guid: GUID,
            silent_uninstall_args: "/quiet",
            custom_tag_params: Some("brand=GGLS"),
            installer_data: None,
        };
        let command =
            wrapper.wrap_command(Path::new("signed.exe"), &request, Path::new("out.msi"));
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy()).collect();
        assert_eq!(
            args,
            [
                "--product-name",
                "Widget",
                "--product-version",
                "1.2.3.4",
                "--product-guid",
                GUID,
                "--uninstall-args",
                "/quiet",
                "--tag-params",
                "brand=GGLS",
                "signed.exe",
                "out.msi",
            ]
        );
    }
}
