//! Resource embedding: wraps the compressed payload into the stub.
//!
//! The payload blob is declared in a generated resource script, compiled,
//! linked into a DLL that has no entry point, and merged onto the prebuilt
//! extraction stub. The merge is a byte-level append, not a relink; the
//! stub locates its payload resources in the appended section.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use handlebars::Handlebars;
use log::{debug, info};
use serde::Serialize;

use crate::bundler::archive::CompressedArtifact;
use crate::bundler::codec::run_stage;
use crate::bundler::error::{Error, ErrorExt, Result};
use crate::bundler::settings::{EmbedSettings, ResourceEntry, resolve_tool};

/// Resource identifier the extraction stub reads the payload from.
pub const PAYLOAD_RESOURCE_ID: u32 = 102;

const RESOURCE_SCRIPT_TEMPLATE: &str = "\
// Payload resources for the extraction stub.
#define IDR_PAYLOAD {{resource_id}}
{{#each entries}}
#define {{name}} {{id}}
{{/each}}

IDR_PAYLOAD B \"{{payload_path}}\"
{{#each entries}}
{{name}} B \"{{path}}\"
{{/each}}
";

/// The merged meta-installer, not yet signed.
#[derive(Debug)]
pub struct UnsignedInstaller {
    path: PathBuf,
}

impl UnsignedInstaller {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the unsigned installer.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// External resource-compile, link, and merge steps.
///
/// The pipeline calls these off the async runtime; implementations block.
pub trait EmbedToolchain: Send + Sync {
    /// Compiles a resource script into a resource object.
    fn compile_resource(&self, script: &Path, object: &Path) -> Result<()>;

    /// Links the resource object into a DLL with no entry point.
    fn link_library(&self, object: &Path, def_file: &Path, library: &Path) -> Result<()>;

    /// Appends the library's resource section onto the stub executable.
    fn merge(&self, stub: &Path, library: &Path, output: &Path) -> Result<()>;
}

/// Toolchain backed by the configured resource compiler and linker.
pub struct ResourceToolchain {
    resource_compiler: PathBuf,
    linker: PathBuf,
    merger: Option<PathBuf>,
}

impl ResourceToolchain {
    /// Resolves the configured tools.
    ///
    /// The compiler and linker are required; the merge tool is optional
    /// and falls back to [`copy_append`].
    pub fn from_settings(settings: &EmbedSettings) -> Result<Self> {
        let resource_compiler = settings.resource_compiler.as_deref().ok_or_else(|| {
            Error::EnvironmentMissing("embed.resource_compiler is not configured".into())
        })?;
        let linker = settings
            .linker
            .as_deref()
            .ok_or_else(|| Error::EnvironmentMissing("embed.linker is not configured".into()))?;
        Ok(Self {
            resource_compiler: resolve_tool(resource_compiler)?,
            linker: resolve_tool(linker)?,
            merger: settings.merger.as_deref().map(resolve_tool).transpose()?,
        })
    }

    fn compile_command(&self, script: &Path, object: &Path) -> Command {
        let mut command = Command::new(&self.resource_compiler);
        command.arg("/fo").arg(object).arg(script);
        command
    }

    fn link_command(&self, object: &Path, def_file: &Path, library: &Path) -> Command {
        let mut command = Command::new(&self.linker);
        command.arg("/DLL").arg("/NOENTRY").arg("/NODEFAULTLIB");
        command.arg(format!("/DEF:{}", def_file.display()));
        command.arg(format!("/OUT:{}", library.display()));
        command.arg(object);
        command
    }

    fn merge_command(&self, merger: &Path, stub: &Path, library: &Path, output: &Path) -> Command {
        let mut command = Command::new(merger);
        command.arg("--copyappend").arg(stub).arg(library).arg(output);
        command
    }
}

impl EmbedToolchain for ResourceToolchain {
    fn compile_resource(&self, script: &Path, object: &Path) -> Result<()> {
        run_stage(self.compile_command(script, object), "compile-resource")
    }

    fn link_library(&self, object: &Path, def_file: &Path, library: &Path) -> Result<()> {
        run_stage(self.link_command(object, def_file, library), "link-library")
    }

    fn merge(&self, stub: &Path, library: &Path, output: &Path) -> Result<()> {
        match &self.merger {
            Some(merger) => run_stage(self.merge_command(merger, stub, library, output), "merge"),
            None => copy_append(stub, library, output),
        }
    }
}

/// Appends the resource library onto the stub, byte for byte.
///
/// The stub must look like a PE executable. Its own resource directory is
/// left untouched; the extraction stub reads the appended section.
pub fn copy_append(stub: &Path, library: &Path, output: &Path) -> Result<()> {
    let mut merged = std::fs::read(stub).fs_context("reading stub executable", stub)?;
    let hint_bytes: &[u8; 16] = merged
        .get(0..16)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| Error::PackagingFailure {
            stage: "merge",
            detail: format!("stub {} is too small to be an executable", stub.display()),
        })?;
    match goblin::peek_bytes(hint_bytes) {
        Ok(goblin::Hint::PE) => {}
        Ok(_) => {
            return Err(Error::PackagingFailure {
                stage: "merge",
                detail: format!("stub {} is not a PE executable", stub.display()),
            });
        }
        Err(e) => {
            return Err(Error::PackagingFailure {
                stage: "merge",
                detail: format!("stub {} format detection failed: {e}", stub.display()),
            });
        }
    }

    let resources = std::fs::read(library).fs_context("reading resource library", library)?;
    if resources.is_empty() {
        return Err(Error::PackagingFailure {
            stage: "merge",
            detail: format!("resource library {} is empty", library.display()),
        });
    }
    merged.extend_from_slice(&resources);
    std::fs::write(output, merged).fs_context("writing merged installer", output)?;
    Ok(())
}

/// Drives script generation, compile, link, and merge.
pub struct ResourceEmbedder {
    toolchain: Arc<dyn EmbedToolchain>,
    entries: Vec<ResourceEntry>,
}

impl ResourceEmbedder {
    /// Creates an embedder running the given toolchain.
    pub fn new(toolchain: Arc<dyn EmbedToolchain>) -> Self {
        Self {
            toolchain,
            entries: Vec::new(),
        }
    }

    /// Adds named resources declared after the payload entry, in order.
    pub fn with_entries(mut self, entries: Vec<ResourceEntry>) -> Self {
        self.entries = entries;
        self
    }

    /// Wraps the compressed payload into the stub executable.
    ///
    /// Writes `unsigned_<stem>.exe` plus the intermediate script, object
    /// and library files into the work directory.
    pub async fn embed(
        &self,
        payload: &CompressedArtifact,
        stub: &Path,
        work_dir: &Path,
        stem: &str,
    ) -> Result<UnsignedInstaller> {
        match tokio::fs::metadata(stub).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(Error::PackagingFailure {
                    stage: "embed",
                    detail: format!("stub executable {} is missing", stub.display()),
                });
            }
        }

        let script = work_dir.join(format!("{stem}_payload.rc"));
        let def_file = work_dir.join(format!("{stem}_payload.def"));
        let object = work_dir.join(format!("{stem}_payload.res"));
        let library = work_dir.join(format!("{stem}_payload.dll"));
        let output = work_dir.join(format!("unsigned_{stem}.exe"));

        tokio::fs::write(&script, resource_script(payload.path(), &self.entries)?)
            .await
            .fs_context("writing resource script", &script)?;
        tokio::fs::write(&def_file, library_definition(stem))
            .await
            .fs_context("writing module definition", &def_file)?;

        debug!("compiling payload resources into {}", object.display());
        let toolchain = Arc::clone(&self.toolchain);
        let (compile_script, compile_object) = (script.clone(), object.clone());
        tokio::task::spawn_blocking(move || {
            toolchain.compile_resource(&compile_script, &compile_object)
        })
        .await
        .map_err(|e| Error::GenericError(format!("compile task failed: {e}")))??;

        debug!("linking payload resources into {}", library.display());
        let toolchain = Arc::clone(&self.toolchain);
        let (link_object, link_def, link_library) =
            (object.clone(), def_file.clone(), library.clone());
        tokio::task::spawn_blocking(move || {
            toolchain.link_library(&link_object, &link_def, &link_library)
        })
        .await
        .map_err(|e| Error::GenericError(format!("link task failed: {e}")))??;

        debug!("merging {} onto {}", library.display(), stub.display());
        let toolchain = Arc::clone(&self.toolchain);
        let (merge_stub, merge_library, merge_output) =
            (stub.to_path_buf(), library.clone(), output.clone());
        tokio::task::spawn_blocking(move || {
            toolchain.merge(&merge_stub, &merge_library, &merge_output)
        })
        .await
        .map_err(|e| Error::GenericError(format!("merge task failed: {e}")))??;

        info!("embedded payload into {}", output.display());
        Ok(UnsignedInstaller::new(output))
    }
}

#[derive(Serialize)]
struct ScriptEntry {
    name: String,
    id: u32,
    path: String,
}

#[derive(Serialize)]
struct ScriptData {
    resource_id: u32,
    payload_path: String,
    entries: Vec<ScriptEntry>,
}

fn resource_script(payload: &Path, entries: &[ResourceEntry]) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars.register_template_string("payload.rc", RESOURCE_SCRIPT_TEMPLATE)?;

    let data = ScriptData {
        resource_id: PAYLOAD_RESOURCE_ID,
        payload_path: rc_path(payload),
        entries: entries
            .iter()
            .map(|entry| ScriptEntry {
                name: entry.name.clone(),
                id: entry.id,
                path: rc_path(&entry.path),
            })
            .collect(),
    };
    Ok(handlebars.render("payload.rc", &data)?)
}

/// RC string literals treat backslashes as escapes.
fn rc_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "\\\\")
}

fn library_definition(stem: &str) -> String {
    format!("LIBRARY \"{stem}_payload.dll\"\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::archive::ArchivePipeline;
    use crate::bundler::codec::DeflateCodec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn resource_script_declares_the_payload() {
        let script = resource_script(Path::new("/work/payload_X.tar.gz"), &[]).unwrap();
        assert!(script.contains("#define IDR_PAYLOAD 102"));
        assert!(script.contains("IDR_PAYLOAD B \"/work/payload_X.tar.gz\""));
    }

    #[test]
    fn resource_script_escapes_backslashes() {
        let script = resource_script(Path::new(r"C:\work\payload.tar.gz"), &[]).unwrap();
        assert!(script.contains(r#"B "C:\\work\\payload.tar.gz""#));
    }

    #[test]
    fn resource_script_declares_extra_entries_after_the_payload() {
        let entries = vec![
            ResourceEntry {
                name: "IDR_UPDATER".to_string(),
                id: 103,
                path: PathBuf::from("/work/updater.exe"),
            },
            ResourceEntry {
                name: "IDR_RES_EN".to_string(),
                id: 104,
                path: PathBuf::from("/work/resources_en.dll"),
            },
        ];
        let script = resource_script(Path::new("/work/payload_X.tar.gz"), &entries).unwrap();

        assert!(script.contains("#define IDR_UPDATER 103"));
        assert!(script.contains("#define IDR_RES_EN 104"));
        assert!(script.contains("IDR_UPDATER B \"/work/updater.exe\""));
        assert!(script.contains("IDR_RES_EN B \"/work/resources_en.dll\""));

        let payload = script.find("IDR_PAYLOAD B \"/work/payload_X.tar.gz\"").unwrap();
        let updater = script.find("IDR_UPDATER B \"/work/updater.exe\"").unwrap();
        let resources = script.find("IDR_RES_EN B \"/work/resources_en.dll\"").unwrap();
        assert!(payload < updater);
        assert!(updater < resources);
    }

    #[test]
    fn commands_are_shaped_for_the_toolchain() {
        let toolchain = ResourceToolchain {
            resource_compiler: PathBuf::from("rc"),
            linker: PathBuf::from("link"),
            merger: Some(PathBuf::from("resmerge")),
        };

        let compile = toolchain.compile_command(Path::new("a.rc"), Path::new("a.res"));
        let args: Vec<_> = compile.get_args().map(|a| a.to_string_lossy()).collect();
        assert_eq!(args, ["/fo", "a.res", "a.rc"]);

        let link =
            toolchain.link_command(Path::new("a.res"), Path::new("a.def"), Path::new("a.dll"));
        let args: Vec<_> = link.get_args().map(|a| a.to_string_lossy()).collect();
        assert_eq!(
            args,
            ["/DLL", "/NOENTRY", "/NODEFAULTLIB", "/DEF:a.def", "/OUT:a.dll", "a.res"]
        );

        let merge = toolchain.merge_command(
            Path::new("resmerge"),
            Path::new("stub.exe"),
            Path::new("a.dll"),
            Path::new("out.exe"),
        );
        let args: Vec<_> = merge.get_args().map(|a| a.to_string_lossy()).collect();
        assert_eq!(args, ["--copyappend", "stub.exe", "a.dll", "out.exe"]);
    }

    #[test]
    fn copy_append_concatenates_stub_and_library() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("stub.exe");
        let library = dir.path().join("payload.dll");
        let output = dir.path().join("unsigned.exe");
        let stub_bytes = b"MZ stub bytes padded well past sixteen".to_vec();
        std::fs::write(&stub, &stub_bytes).unwrap();
        std::fs::write(&library, b"resources").unwrap();

        copy_append(&stub, &library, &output).unwrap();

        let merged = std::fs::read(&output).unwrap();
        assert_eq!(&merged[..stub_bytes.len()], &stub_bytes[..]);
        assert_eq!(&merged[stub_bytes.len()..], b"resources");
    }

    #[test]
    fn copy_append_rejects_a_non_pe_stub() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("stub.exe");
        let library = dir.path().join("payload.dll");
        std::fs::write(&stub, b"definitely not an executable image").unwrap();
        std::fs::write(&library, b"resources").unwrap();

        let err = copy_append(&stub, &library, dir.path().join("out.exe").as_path()).unwrap_err();
        assert!(matches!(err, Error::PackagingFailure { stage: "merge", .. }));
    }

    struct FakeToolchain {
        calls: AtomicUsize,
    }

    impl EmbedToolchain for FakeToolchain {
        fn compile_resource(&self, script: &Path, object: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::copy(script, object)?;
            Ok(())
        }

        fn link_library(&self, _object: &Path, _def_file: &Path, library: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(library, b"linked resources")?;
            Ok(())
        }

        fn merge(&self, stub: &Path, library: &Path, output: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            copy_append(stub, library, output)
        }
    }

    #[tokio::test]
    async fn embed_produces_the_unsigned_installer() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("stub.exe");
        std::fs::write(&stub, b"MZ this is the extraction stub").unwrap();
        let source = dir.path().join("app.bin");
        std::fs::write(&source, b"payload bytes").unwrap();
        let payload = ArchivePipeline::new(Arc::new(DeflateCodec))
            .run(&[source], dir.path(), "payload_test")
            .await
            .unwrap();

        let toolchain = Arc::new(FakeToolchain { calls: AtomicUsize::new(0) });
        let unsigned = ResourceEmbedder::new(toolchain.clone())
            .embed(&payload, &stub, dir.path(), "TestSetup")
            .await
            .unwrap();

        assert_eq!(unsigned.path(), dir.path().join("unsigned_TestSetup.exe"));
        assert_eq!(toolchain.calls.load(Ordering::SeqCst), 3);
        let merged = std::fs::read(unsigned.path()).unwrap();
        assert!(merged.starts_with(b"MZ this is the extraction stub"));
        assert!(merged.ends_with(b"linked resources"));
        assert!(dir.path().join("TestSetup_payload.rc").exists());
        assert!(dir.path().join("TestSetup_payload.def").exists());
    }

    #[tokio::test]
    async fn missing_stub_fails_before_any_tool_runs() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("app.bin");
        std::fs::write(&source, b"payload bytes").unwrap();
        let payload = ArchivePipeline::new(Arc::new(DeflateCodec))
            .run(&[source], dir.path(), "payload_test")
            .await
            .unwrap();

        let toolchain = Arc::new(FakeToolchain { calls: AtomicUsize::new(0) });
        let err = ResourceEmbedder::new(toolchain.clone())
            .embed(&payload, &dir.path().join("no_stub.exe"), dir.path(), "TestSetup")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PackagingFailure { stage: "embed", .. }));
        assert_eq!(toolchain.calls.load(Ordering::SeqCst), 0);
    }
}
