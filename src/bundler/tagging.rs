//! Tagged-installer fan-out.
//!
//! Tagging stamps per-audience parameters onto a finished installer. The
//! expensive pipeline work is never repeated here: every tagged variant is
//! derived from the one signed base binary with a cheap customization
//! append performed by the tag tool.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use log::{debug, info};

use crate::bundler::codec::run_stage;
use crate::bundler::error::{Error, Result};
use crate::bundler::settings::resolve_tool;
use crate::bundler::signing::SignedInstaller;
use crate::catalog::TagGroup;

/// One tagged variant of a signed installer.
#[derive(Debug)]
pub struct TaggedArtifact {
    key: String,
    name: String,
    path: PathBuf,
}

impl TaggedArtifact {
    /// Audience key the variant was grouped under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Entry name the variant was produced for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the tagged installer.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Stamps one tag onto a copy of the base installer.
pub trait TagWriter: Send + Sync {
    /// Writes a copy of `source` to `target` carrying `tag`.
    fn write_tag(&self, source: &Path, target: &Path, tag: &str) -> Result<()>;
}

/// Tag writer invoking the configured external tool.
pub struct CommandTagWriter {
    tool: PathBuf,
}

impl CommandTagWriter {
    /// Resolves the configured tag tool.
    pub fn from_tool(tool: &str) -> Result<Self> {
        Ok(Self { tool: resolve_tool(tool)? })
    }

    fn tag_command(&self, source: &Path, target: &Path, tag: &str) -> Command {
        let mut command = Command::new(&self.tool);
        command.arg(source).arg(target).arg(tag);
        command
    }
}

impl TagWriter for CommandTagWriter {
    fn write_tag(&self, source: &Path, target: &Path, tag: &str) -> Result<()> {
        run_stage(self.tag_command(source, target, tag), "tag")
    }
}

/// Produces every tagged variant of a signed base installer.
pub struct TagFanOut {
    writer: Arc<dyn TagWriter>,
}

impl TagFanOut {
    /// Creates a fan-out running the given writer.
    pub fn new(writer: Arc<dyn TagWriter>) -> Self {
        Self { writer }
    }

    /// Writes one tagged installer per (key, entry) pair.
    ///
    /// Variants are named `<base stem>_<entry name>` and land in the
    /// output directory in group order.
    pub async fn produce(
        &self,
        base: &SignedInstaller,
        groups: &[TagGroup],
        output_dir: &Path,
    ) -> Result<Vec<TaggedArtifact>> {
        let stem = base
            .path()
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                Error::GenericError(format!("installer {} has no name", base.path().display()))
            })?;
        let extension = base.path().extension().and_then(|e| e.to_str());

        let mut artifacts = Vec::new();
        let mut seen = HashSet::new();
        for group in groups {
            for entry in &group.entries {
                let file_name = match extension {
                    Some(ext) => format!("{stem}_{}.{ext}", entry.name),
                    None => format!("{stem}_{}", entry.name),
                };
                if !seen.insert(file_name.clone()) {
                    return Err(Error::InvalidSpec(format!(
                        "duplicate tagged installer name {file_name}"
                    )));
                }
                let target = output_dir.join(&file_name);
                debug!("tagging {} for {}/{}", file_name, group.key, entry.name);

                let writer = Arc::clone(&self.writer);
                let (source, tag_target, tag) =
                    (base.path().to_path_buf(), target.clone(), entry.tag.clone());
                tokio::task::spawn_blocking(move || writer.write_tag(&source, &tag_target, &tag))
                    .await
                    .map_err(|e| Error::GenericError(format!("tag task failed: {e}")))??;

                artifacts.push(TaggedArtifact {
                    key: group.key.clone(),
                    name: entry.name.clone(),
                    path: target,
                });
            }
        }

        info!(
            "tagged {} installer variant(s) from {}",
            artifacts.len(),
            base.path().display()
        );
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TagEntry;

    struct AppendingWriter;

    impl TagWriter for AppendingWriter {
        fn write_tag(&self, source: &Path, target: &Path, tag: &str) -> Result<()> {
            let mut bytes = std::fs::read(source)?;
            bytes.extend_from_slice(tag.as_bytes());
            std::fs::write(target, bytes)?;
            Ok(())
        }
    }

    fn entry(name: &str, key: &str, tag: &str) -> TagEntry {
        TagEntry { name: name.into(), key: key.into(), tag: tag.into() }
    }

    fn signed_base(dir: &Path) -> SignedInstaller {
        let path = dir.join("WidgetSetup.exe");
        std::fs::write(&path, b"signed base").unwrap();
        SignedInstaller::new(path)
    }

    #[tokio::test]
    async fn three_locales_yield_three_variants_of_the_same_base() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![TagGroup {
            key: "locale".into(),
            entries: vec![
                entry("en", "locale", "lang=en"),
                entry("de", "locale", "lang=de"),
                entry("fr", "locale", "lang=fr"),
            ],
        }];

        let artifacts = TagFanOut::new(Arc::new(AppendingWriter))
            .produce(&signed_base(dir.path()), &groups, dir.path())
            .await
            .unwrap();

        assert_eq!(artifacts.len(), 3);
        for (artifact, lang) in artifacts.iter().zip(["en", "de", "fr"]) {
            assert_eq!(
                artifact.path(),
                dir.path().join(format!("WidgetSetup_{lang}.exe"))
            );
            let bytes = std::fs::read(artifact.path()).unwrap();
            assert!(bytes.starts_with(b"signed base"));
            assert!(bytes.ends_with(format!("lang={lang}").as_bytes()));
        }
    }

    #[tokio::test]
    async fn duplicate_variant_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![
            TagGroup { key: "locale".into(), entries: vec![entry("en", "locale", "lang=en")] },
            TagGroup { key: "brand".into(), entries: vec![entry("en", "brand", "brand=x")] },
        ];

        let err = TagFanOut::new(Arc::new(AppendingWriter))
            .produce(&signed_base(dir.path()), &groups, dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate tagged installer name"));
    }

    #[tokio::test]
    async fn no_groups_produce_no_variants() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = TagFanOut::new(Arc::new(AppendingWriter))
            .produce(&signed_base(dir.path()), &[], dir.path())
            .await
            .unwrap();
        assert!(artifacts.is_empty());
    }

    #[test]
    fn tag_command_orders_source_target_tag() {
        let writer = CommandTagWriter { tool: PathBuf::from("applytag") };
        let command =
            writer.tag_command(Path::new("base.exe"), Path::new("tagged.exe"), "lang=en");
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy()).collect();
        assert_eq!(args, ["base.exe", "tagged.exe", "lang=en"]);
    }
}
