//! Payload transform codecs.
//!
//! The archive pipeline hands its tarball to a codec for the filter and
//! compress stages. Production deployments run the external toolchain (an
//! executable-stream prefilter plus an LZMA compressor); deployments without
//! the toolchain use the built-in deflate codec. The extraction stub inverts
//! whichever transform was applied, so the codec choice is baked into the
//! stub shipped by the deployment.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

use crate::bundler::error::{Error, ErrorExt, Result};
use crate::bundler::settings::{CodecKind, Settings, resolve_tool};

/// File transforms applied between archiving and embedding.
///
/// `filter` and `compress` are the forward pipeline stages. The inverse
/// operations exist so transforms can be verified end to end; the external
/// filter tool has no decode mode (decoding lives in the extraction stub),
/// so [`ToolchainCodec::unfilter`] is unavailable.
pub trait PayloadCodec: Send + Sync {
    /// File extension appended to the tar name by the filter stage.
    fn filter_extension(&self) -> &'static str;

    /// File extension appended to the tar name by the compress stage.
    fn compress_extension(&self) -> &'static str;

    /// Rewrites `source` into `target` to improve compressibility.
    fn filter(&self, source: &Path, target: &Path) -> Result<()>;

    /// Inverts [`PayloadCodec::filter`].
    fn unfilter(&self, source: &Path, target: &Path) -> Result<()>;

    /// Compresses `source` into `target`.
    fn compress(&self, source: &Path, target: &Path) -> Result<()>;

    /// Inverts [`PayloadCodec::compress`].
    fn decompress(&self, source: &Path, target: &Path) -> Result<()>;
}

/// Builds the codec selected by the deployment config.
pub fn codec_from_settings(settings: &Settings) -> Result<Arc<dyn PayloadCodec>> {
    match settings.codec().kind {
        CodecKind::Deflate => Ok(Arc::new(DeflateCodec)),
        CodecKind::Toolchain => Ok(Arc::new(ToolchainCodec::from_settings(settings)?)),
    }
}

/// External filter + compressor executables.
///
/// Command shapes follow the tools' CLIs: the filter takes `SOURCE TARGET`,
/// the compressor takes `e SOURCE TARGET [flags...]` to encode and
/// `d SOURCE TARGET` to decode.
pub struct ToolchainCodec {
    filter_tool: PathBuf,
    compress_tool: PathBuf,
    compress_flags: Vec<String>,
}

impl ToolchainCodec {
    /// Resolves the configured tools.
    ///
    /// Bare names are looked up on `PATH`; a missing tool is reported as
    /// [`Error::EnvironmentMissing`] before any stage runs.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let codec = settings.codec();
        let filter = codec
            .filter_tool
            .as_deref()
            .ok_or_else(|| Error::EnvironmentMissing("filter tool not configured".to_string()))?;
        let compress = codec.compress_tool.as_deref().ok_or_else(|| {
            Error::EnvironmentMissing("compress tool not configured".to_string())
        })?;
        Ok(Self {
            filter_tool: resolve_tool(filter)?,
            compress_tool: resolve_tool(compress)?,
            compress_flags: codec.compress_flags.clone(),
        })
    }

    fn filter_command(&self, source: &Path, target: &Path) -> Command {
        let mut command = Command::new(&self.filter_tool);
        command.arg(source).arg(target);
        command
    }

    fn compress_command(&self, source: &Path, target: &Path) -> Command {
        let mut command = Command::new(&self.compress_tool);
        command.arg("e").arg(source).arg(target);
        command.args(&self.compress_flags);
        command
    }

    fn decompress_command(&self, source: &Path, target: &Path) -> Command {
        let mut command = Command::new(&self.compress_tool);
        command.arg("d").arg(source).arg(target);
        command
    }
}

impl PayloadCodec for ToolchainCodec {
    fn filter_extension(&self) -> &'static str {
        "bcj"
    }

    fn compress_extension(&self) -> &'static str {
        "lzma"
    }

    fn filter(&self, source: &Path, target: &Path) -> Result<()> {
        run_stage(self.filter_command(source, target), "filter")
    }

    fn unfilter(&self, _source: &Path, _target: &Path) -> Result<()> {
        Err(Error::PackagingFailure {
            stage: "unfilter",
            detail: "the external filter tool has no decode mode".to_string(),
        })
    }

    fn compress(&self, source: &Path, target: &Path) -> Result<()> {
        run_stage(self.compress_command(source, target), "compress")
    }

    fn decompress(&self, source: &Path, target: &Path) -> Result<()> {
        run_stage(self.decompress_command(source, target), "decompress")
    }
}

/// Built-in codec: byte-interleave prefilter plus gzip.
///
/// The prefilter mirrors the shape of the executable filter by splitting the
/// stream into two sub-streams, which keeps the stage structure (and its
/// tests) identical to toolchain deployments without external tools.
pub struct DeflateCodec;

impl PayloadCodec for DeflateCodec {
    fn filter_extension(&self) -> &'static str {
        "flt"
    }

    fn compress_extension(&self) -> &'static str {
        "gz"
    }

    fn filter(&self, source: &Path, target: &Path) -> Result<()> {
        let data = std::fs::read(source).fs_context("reading filter input", source)?;
        std::fs::write(target, interleave_split(&data))
            .fs_context("writing filter output", target)?;
        Ok(())
    }

    fn unfilter(&self, source: &Path, target: &Path) -> Result<()> {
        let data = std::fs::read(source).fs_context("reading filtered input", source)?;
        std::fs::write(target, interleave_join(&data))
            .fs_context("writing unfiltered output", target)?;
        Ok(())
    }

    fn compress(&self, source: &Path, target: &Path) -> Result<()> {
        let data = std::fs::read(source).fs_context("reading compress input", source)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&data)
            .and_then(|_| encoder.finish())
            .map_err(|e| Error::PackagingFailure {
                stage: "compress",
                detail: e.to_string(),
            })
            .and_then(|compressed| {
                std::fs::write(target, compressed).fs_context("writing compressed output", target)
            })?;
        Ok(())
    }

    fn decompress(&self, source: &Path, target: &Path) -> Result<()> {
        let data = std::fs::read(source).fs_context("reading compressed input", source)?;
        let mut decoder = GzDecoder::new(&data[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::PackagingFailure {
                stage: "decompress",
                detail: e.to_string(),
            })?;
        std::fs::write(target, out).fs_context("writing decompressed output", target)?;
        Ok(())
    }
}

/// Splits a stream into its even-offset bytes followed by its odd-offset
/// bytes.
///
/// Inverted by [`interleave_join`]; the original length is recoverable from
/// the output length alone, so no header is needed.
pub fn interleave_split(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    out.extend(data.iter().step_by(2));
    out.extend(data.iter().skip(1).step_by(2));
    out
}

/// Inverts [`interleave_split`].
pub fn interleave_join(data: &[u8]) -> Vec<u8> {
    let evens = data.len().div_ceil(2);
    let mut out = Vec::with_capacity(data.len());
    let (front, back) = data.split_at(evens);
    let mut odd = back.iter();
    for even in front {
        out.push(*even);
        if let Some(b) = odd.next() {
            out.push(*b);
        }
    }
    out
}

pub(crate) fn run_stage(mut command: Command, stage: &'static str) -> Result<()> {
    let rendered = format!("{command:?}");
    let output = command.output().map_err(|error| Error::CommandFailed {
        command: rendered.clone(),
        error,
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::PackagingFailure {
            stage,
            detail: format!("{rendered} exited with {}: {}", output.status, stderr.trim()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn interleave_round_trips_odd_and_even_lengths() {
        for len in [0usize, 1, 2, 3, 16, 255] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            assert_eq!(interleave_join(&interleave_split(&data)), data, "len {len}");
        }
    }

    #[test]
    fn deflate_codec_round_trips_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("payload.tar");
        let filtered = dir.path().join("payload.tar.flt");
        let compressed = dir.path().join("payload.tar.gz");
        let restored_flt = dir.path().join("restored.flt");
        let restored = dir.path().join("restored.tar");

        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&input, &data).unwrap();

        let codec = DeflateCodec;
        codec.filter(&input, &filtered).unwrap();
        codec.compress(&filtered, &compressed).unwrap();
        codec.decompress(&compressed, &restored_flt).unwrap();
        codec.unfilter(&restored_flt, &restored).unwrap();

        assert_eq!(std::fs::read(&restored).unwrap(), data);
    }

    #[test]
    fn toolchain_commands_match_the_tool_clis() {
        let codec = ToolchainCodec {
            filter_tool: PathBuf::from("/opt/bcj2"),
            compress_tool: PathBuf::from("/opt/lzma"),
            compress_flags: vec!["-d22".to_string()],
        };

        let args: Vec<OsString> = codec
            .filter_command(Path::new("in.tar"), Path::new("out.bcj"))
            .get_args()
            .map(OsString::from)
            .collect();
        assert_eq!(args, ["in.tar", "out.bcj"]);

        let args: Vec<OsString> = codec
            .compress_command(Path::new("in.bcj"), Path::new("out.lzma"))
            .get_args()
            .map(OsString::from)
            .collect();
        assert_eq!(args, ["e", "in.bcj", "out.lzma", "-d22"]);

        let args: Vec<OsString> = codec
            .decompress_command(Path::new("in.lzma"), Path::new("out.bcj"))
            .get_args()
            .map(OsString::from)
            .collect();
        assert_eq!(args, ["d", "in.lzma", "out.bcj"]);
    }
}
