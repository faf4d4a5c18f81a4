//! Archive pipeline: tar, filter, compress.
//!
//! The payload travels through three fixed stages. Each stage consumes the
//! typed artifact of the previous one, so running them out of order does
//! not typecheck. Stage outputs are named after the tarball: `<stem>.tar`,
//! then `<stem>.tar.<filter ext>`, then `<stem>.tar.<compress ext>`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use tar::HeaderMode;

use crate::bundler::codec::PayloadCodec;
use crate::bundler::error::{Error, ErrorExt, Result};

/// The deterministic tarball of the payload files.
#[derive(Debug)]
pub struct ArchiveArtifact {
    path: PathBuf,
}

impl ArchiveArtifact {
    /// Path of the tarball.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The tarball after the compressibility prefilter.
#[derive(Debug)]
pub struct FilteredArtifact {
    path: PathBuf,
    archive: PathBuf,
}

impl FilteredArtifact {
    /// Path of the filtered stream.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The compressed payload, ready for embedding.
#[derive(Debug)]
pub struct CompressedArtifact {
    path: PathBuf,
}

impl CompressedArtifact {
    /// Path of the compressed payload.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Runs the archive, filter and compress stages.
pub struct ArchivePipeline {
    codec: Arc<dyn PayloadCodec>,
}

impl ArchivePipeline {
    /// Creates a pipeline running the given codec.
    pub fn new(codec: Arc<dyn PayloadCodec>) -> Self {
        Self { codec }
    }

    /// Runs all three stages, returning the compressed payload.
    pub async fn run(
        &self,
        files: &[PathBuf],
        work_dir: &Path,
        stem: &str,
    ) -> Result<CompressedArtifact> {
        let archive = self.archive(files, work_dir, stem).await?;
        let filtered = self.filter(&archive).await?;
        self.compress(filtered).await
    }

    /// Archives the payload files, flat, in list order.
    ///
    /// Headers are written in deterministic mode so identical inputs
    /// produce byte-identical tarballs.
    pub async fn archive(
        &self,
        files: &[PathBuf],
        work_dir: &Path,
        stem: &str,
    ) -> Result<ArchiveArtifact> {
        let path = work_dir.join(format!("{stem}.tar"));
        debug!("archiving {} payload files into {}", files.len(), path.display());

        let mut names = Vec::with_capacity(files.len());
        for file in files {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::InvalidSpec(format!("payload file {} has no name", file.display()))
                })?;
            if names.contains(&name) {
                return Err(Error::InvalidSpec(format!(
                    "duplicate payload entry {name}"
                )));
            }
            names.push(name);
        }

        let tar_file = tokio::fs::File::create(&path)
            .await
            .fs_context("creating payload archive", &path)?;
        let std_file = tar_file.into_std().await;

        let sources: Vec<PathBuf> = files.to_vec();
        let archive_path = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tar = tar::Builder::new(std_file);
            for (source, name) in sources.iter().zip(&names) {
                let metadata = std::fs::metadata(source)
                    .map_err(|e| stage_error("archive", &e))?;
                let mut header = tar::Header::new_gnu();
                header.set_metadata_in_mode(&metadata, HeaderMode::Deterministic);
                let mut file =
                    std::fs::File::open(source).map_err(|e| stage_error("archive", &e))?;
                tar.append_data(&mut header, name, &mut file)
                    .map_err(|e| stage_error("archive", &e))?;
            }
            tar.into_inner()
                .and_then(|mut f| io::Write::flush(&mut f))
                .map_err(|e| stage_error("archive", &e))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::GenericError(format!("archive task failed: {e}")))??;

        Ok(ArchiveArtifact { path: archive_path })
    }

    /// Runs the compressibility prefilter over the tarball.
    pub async fn filter(&self, archive: &ArchiveArtifact) -> Result<FilteredArtifact> {
        let target = appended(&archive.path, self.codec.filter_extension());
        debug!("filtering {} into {}", archive.path.display(), target.display());

        let codec = Arc::clone(&self.codec);
        let source = archive.path.clone();
        let filter_target = target.clone();
        tokio::task::spawn_blocking(move || codec.filter(&source, &filter_target))
            .await
            .map_err(|e| Error::GenericError(format!("filter task failed: {e}")))??;

        Ok(FilteredArtifact {
            path: target,
            archive: archive.path.clone(),
        })
    }

    /// Compresses the filtered stream.
    pub async fn compress(&self, filtered: FilteredArtifact) -> Result<CompressedArtifact> {
        let target = appended(&filtered.archive, self.codec.compress_extension());
        debug!(
            "compressing {} into {}",
            filtered.path.display(),
            target.display()
        );

        let codec = Arc::clone(&self.codec);
        let source = filtered.path.clone();
        let compress_target = target.clone();
        tokio::task::spawn_blocking(move || codec.compress(&source, &compress_target))
            .await
            .map_err(|e| Error::GenericError(format!("compress task failed: {e}")))??;

        Ok(CompressedArtifact { path: target })
    }
}

fn appended(path: &Path, extension: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".{extension}"));
    PathBuf::from(os)
}

fn stage_error(stage: &'static str, error: &io::Error) -> Error {
    Error::PackagingFailure {
        stage,
        detail: error.to_string(),
    }
}
