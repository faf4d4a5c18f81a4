//! Bundle and tagging catalogs.
//!
//! A bundle catalog lists the installers to assemble, one JSON record per
//! line. Lines starting with `#` and blank lines are ignored. Each record is
//! parsed into a typed [`BundleDescriptor`] and validated before any
//! pipeline work starts; there is no interpretation of catalog text beyond
//! JSON. Relative paths are resolved against the catalog file's directory.
//!
//! A tagging catalog is the same shape, holding [`TagEntry`] records for the
//! tag fan-out of one bundle.

use std::path::{Path, PathBuf};

use path_absolutize::Absolutize;
use serde::Deserialize;
use uuid::Uuid;

use crate::bundler::error::{Error, ErrorExt, Result};

/// One application binary packaged into a bundle.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppBinarySpec {
    /// Application GUID, braced form (`{8A69D345-...}`).
    ///
    /// Used verbatim as the payload rename extension and the manifest
    /// fragment file name.
    pub guid: String,

    /// Application version substituted into the update manifest.
    pub version: String,

    /// Source installer binary.
    pub path: PathBuf,
}

impl AppBinarySpec {
    fn validate(&self, bundle: &str) -> Result<()> {
        if self.guid.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "bundle {bundle}: application guid not specified"
            )));
        }
        if self.version.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "bundle {bundle}: application version not specified"
            )));
        }
        if self.path.as_os_str().is_empty() {
            return Err(Error::InvalidSpec(format!(
                "bundle {bundle}: application installer path not specified"
            )));
        }
        if Uuid::parse_str(&self.guid).is_err() {
            return Err(Error::InvalidSpec(format!(
                "bundle {bundle}: malformed application guid {}",
                self.guid
            )));
        }
        if !self.version.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(Error::InvalidSpec(format!(
                "bundle {bundle}: malformed application version {}",
                self.version
            )));
        }
        Ok(())
    }
}

/// Enterprise MSI wrap request for a single-application bundle.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnterpriseSpec {
    /// MSI base name, without extension. Must stay stable across versions.
    pub msi_base_name: String,

    /// Arguments that silently uninstall the wrapped application.
    pub silent_uninstall_args: String,

    /// Optional tag parameters baked into the MSI.
    #[serde(default)]
    pub custom_tag_params: Option<String>,

    /// Optional installer data passed through to the wrapped installer.
    #[serde(default)]
    pub installer_data: Option<String>,
}

/// One installer to assemble.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleDescriptor {
    /// Friendly product name, shown in logs and the enterprise MSI.
    pub name: String,

    /// Installer base name, without extension.
    pub installer_base_name: String,

    /// Applications packaged into this installer, in payload order.
    pub binaries: Vec<AppBinarySpec>,

    /// Enterprise MSI wrap request. Only valid for single-app bundles.
    #[serde(default)]
    pub enterprise: Option<EnterpriseSpec>,

    /// Tagging catalog producing tagged variants of this installer.
    #[serde(default)]
    pub tag_catalog: Option<PathBuf>,
}

impl BundleDescriptor {
    /// Checks the descriptor for completeness.
    ///
    /// Runs before any pipeline stage, so a bad record fails the bundle
    /// without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidSpec("product name not specified".to_string()));
        }
        if self.installer_base_name.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "bundle {}: installer base name not specified",
                self.name
            )));
        }
        if self.binaries.is_empty() {
            return Err(Error::EmptyBundle(self.name.clone()));
        }
        for binary in &self.binaries {
            binary.validate(&self.name)?;
        }
        self.validate_enterprise()
    }

    /// Installer file name before build-flavor decoration.
    pub fn installer_file_name(&self) -> String {
        format!("{}.exe", self.installer_base_name)
    }

    fn validate_enterprise(&self) -> Result<()> {
        let Some(enterprise) = &self.enterprise else {
            return Ok(());
        };
        if self.binaries.len() > 1 {
            return Err(Error::BundleTooLargeForEnterprise {
                bundle: self.name.clone(),
                count: self.binaries.len(),
            });
        }
        if enterprise.msi_base_name.is_empty() || enterprise.silent_uninstall_args.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "bundle {}: field required to build enterprise MSI is missing",
                self.name
            )));
        }
        Ok(())
    }
}

/// One tagged variant of an installer.
///
/// Entries sharing a `key` are stamped with the same parameter block and are
/// grouped together during fan-out.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagEntry {
    /// Distinguishes the tagged output file name.
    pub name: String,

    /// Grouping key (typically a brand or distribution channel).
    pub key: String,

    /// Parameter block written into the certificate tag.
    pub tag: String,
}

impl TagEntry {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.key.is_empty() || self.tag.is_empty() {
            return Err(Error::InvalidSpec(
                "tag entry must carry name, key and tag".to_string(),
            ));
        }
        // The extraction stub rejects tags containing a quote character.
        if self.tag.contains('"') {
            return Err(Error::InvalidSpec(format!(
                "tag for {} contains a quote character",
                self.name
            )));
        }
        Ok(())
    }
}

/// Tag entries sharing one grouping key.
#[derive(Clone, Debug)]
pub struct TagGroup {
    /// The shared grouping key.
    pub key: String,

    /// Entries stamped under this key, in catalog order.
    pub entries: Vec<TagEntry>,
}

/// Reads and validates a bundle catalog.
pub fn read_bundle_catalog(path: &Path) -> Result<Vec<BundleDescriptor>> {
    let base = catalog_base(path);
    let mut bundles = Vec::new();
    for (line_no, line) in read_records(path)? {
        let mut bundle: BundleDescriptor = serde_json::from_str(&line)
            .map_err(|e| record_error(path, line_no, &e.to_string()))?;
        for binary in &mut bundle.binaries {
            binary.path = resolve(&binary.path, &base)?;
        }
        if let Some(tag_catalog) = bundle.tag_catalog.take() {
            bundle.tag_catalog = Some(resolve(&tag_catalog, &base)?);
        }
        bundle
            .validate()
            .map_err(|e| record_error(path, line_no, &e.to_string()))?;
        bundles.push(bundle);
    }
    Ok(bundles)
}

/// Reads and validates a tagging catalog.
pub fn read_tag_catalog(path: &Path) -> Result<Vec<TagEntry>> {
    let mut entries = Vec::new();
    for (line_no, line) in read_records(path)? {
        let entry: TagEntry = serde_json::from_str(&line)
            .map_err(|e| record_error(path, line_no, &e.to_string()))?;
        entry
            .validate()
            .map_err(|e| record_error(path, line_no, &e.to_string()))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Groups tag entries by key, merging duplicate keys.
///
/// Group order follows the first appearance of each key; entry order within
/// a group follows the catalog.
pub fn group_tag_entries(entries: Vec<TagEntry>) -> Vec<TagGroup> {
    let mut groups: Vec<TagGroup> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|g| g.key == entry.key) {
            Some(group) => group.entries.push(entry),
            None => groups.push(TagGroup {
                key: entry.key.clone(),
                entries: vec![entry],
            }),
        }
    }
    groups
}

fn read_records(path: &Path) -> Result<Vec<(usize, String)>> {
    let text = std::fs::read_to_string(path).fs_context("reading catalog", path)?;
    Ok(text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(no, line)| (no, line.to_string()))
        .collect())
}

fn record_error(path: &Path, line_no: usize, detail: &str) -> Error {
    Error::InvalidSpec(format!("{}:{line_no}: {detail}", path.display()))
}

fn catalog_base(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn resolve(path: &Path, base: &Path) -> Result<PathBuf> {
    Ok(path
        .absolutize_from(base)
        .fs_context("resolving catalog path", path)?
        .into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn descriptor(json: &str) -> BundleDescriptor {
        serde_json::from_str(json).unwrap()
    }

    const APP: &str = r#"{"guid": "{8A69D345-D564-463C-AFF1-A69D9E530F96}", "version": "1.3.23.0", "path": "app.msi"}"#;

    #[test]
    fn empty_bundle_is_rejected() {
        let bundle = descriptor(
            r#"{"name": "Foo", "installer_base_name": "FooSetup", "binaries": []}"#,
        );
        assert!(matches!(bundle.validate(), Err(Error::EmptyBundle(name)) if name == "Foo"));
    }

    #[test]
    fn malformed_guid_is_rejected() {
        let bundle = descriptor(
            r#"{"name": "Foo", "installer_base_name": "FooSetup",
                "binaries": [{"guid": "not-a-guid", "version": "1.0.0.0", "path": "app.msi"}]}"#,
        );
        assert!(matches!(bundle.validate(), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn empty_application_fields_name_the_missing_field() {
        let with_binary = |binary: &str| {
            descriptor(&format!(
                r#"{{"name": "Foo", "installer_base_name": "FooSetup", "binaries": [{binary}]}}"#
            ))
        };

        let err = with_binary(r#"{"guid": "", "version": "1.0.0.0", "path": "app.msi"}"#)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("application guid not specified"));

        let err = with_binary(
            r#"{"guid": "{8A69D345-D564-463C-AFF1-A69D9E530F96}", "version": "", "path": "app.msi"}"#,
        )
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("application version not specified"));

        let err = with_binary(
            r#"{"guid": "{8A69D345-D564-463C-AFF1-A69D9E530F96}", "version": "1.0.0.0", "path": ""}"#,
        )
        .validate()
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("application installer path not specified")
        );
    }

    #[test]
    fn enterprise_bundle_with_two_apps_is_rejected() {
        let json = format!(
            r#"{{"name": "Foo", "installer_base_name": "FooSetup",
                 "binaries": [{APP}, {APP}],
                 "enterprise": {{"msi_base_name": "Foo", "silent_uninstall_args": "/quiet"}}}}"#
        );
        let err = descriptor(&json).validate().unwrap_err();
        assert!(matches!(
            err,
            Error::BundleTooLargeForEnterprise { count: 2, .. }
        ));
    }

    #[test]
    fn enterprise_bundle_missing_fields_is_rejected() {
        let json = format!(
            r#"{{"name": "Foo", "installer_base_name": "FooSetup",
                 "binaries": [{APP}],
                 "enterprise": {{"msi_base_name": "", "silent_uninstall_args": "/quiet"}}}}"#
        );
        let err = descriptor(&json).validate().unwrap_err();
        assert!(err.to_string().contains("required to build enterprise MSI"));
    }

    #[test]
    fn catalog_skips_comments_and_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("bundles.catalog");
        let mut f = std::fs::File::create(&catalog).unwrap();
        writeln!(f, "# offline installers").unwrap();
        writeln!(f).unwrap();
        writeln!(
            f,
            r#"{{"name": "Foo", "installer_base_name": "FooSetup", "binaries": [{APP}]}}"#
        )
        .unwrap();

        let bundles = read_bundle_catalog(&catalog).unwrap();
        assert_eq!(bundles.len(), 1);
        assert!(bundles[0].binaries[0].path.is_absolute());
        assert!(bundles[0].binaries[0].path.ends_with("app.msi"));
    }

    #[test]
    fn catalog_error_names_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("bundles.catalog");
        std::fs::write(&catalog, "# header\nnot json\n").unwrap();

        let err = read_bundle_catalog(&catalog).unwrap_err();
        assert!(err.to_string().contains(":2:"));
    }

    #[test]
    fn tag_with_quote_is_rejected() {
        let entry = TagEntry {
            name: "en".to_string(),
            key: "BRAND".to_string(),
            tag: "brand=\"X\"".to_string(),
        };
        assert!(entry.validate().is_err());
    }

    #[test]
    fn grouping_merges_duplicate_keys_in_first_seen_order() {
        let entry = |name: &str, key: &str| TagEntry {
            name: name.to_string(),
            key: key.to_string(),
            tag: format!("brand={key}&lang={name}"),
        };
        let groups = group_tag_entries(vec![
            entry("en", "ALPHA"),
            entry("de", "BETA"),
            entry("fr", "ALPHA"),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, "ALPHA");
        assert_eq!(groups[0].entries.len(), 2);
        assert_eq!(groups[0].entries[1].name, "fr");
        assert_eq!(groups[1].key, "BETA");
    }
}
