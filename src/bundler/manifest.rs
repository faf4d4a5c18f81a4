//! Offline update manifest generation.
//!
//! Each application ships a manifest fragment: a complete update response
//! for that app, with placeholders where the installer size, digest and
//! version belong. The generator splices the fragment bodies into one
//! response document, substituting the placeholders with values computed
//! from the exact staged payload bytes. The digest is recomputed on every
//! build; nothing is cached across builds.

use std::io::Read;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};

use crate::bundler::error::{Error, ErrorExt, Result};

/// File name of the generated manifest, inside its keyed directory and the
/// payload.
pub const OFFLINE_MANIFEST_FILE: &str = "OfflineManifest.gup";

/// Placeholder replaced with the installer size in bytes.
pub const SIZE_PLACEHOLDER: &str = "${INSTALLER_SIZE}";

/// Placeholder replaced with the base64 SHA-1 digest of the installer.
pub const HASH_PLACEHOLDER: &str = "${INSTALLER_HASH}";

/// Placeholder replaced with the application version.
pub const VERSION_PLACEHOLDER: &str = "${INSTALLER_VERSION}";

const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";
const RESPONSE_HEADER: &str = "<response protocol=\"3.0\">";
const RESPONSE_FOOTER: &str = "</response>";

/// Size and digest of one staged installer.
///
/// The digest format (base64-encoded SHA-1) is fixed by the update
/// protocol the extraction stub and update client speak.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IntegrityRecord {
    /// File size in bytes.
    pub size: u64,

    /// Base64-encoded SHA-1 digest of the file contents.
    pub hash: String,
}

impl IntegrityRecord {
    /// Computes the record for a file, reading it in chunks.
    pub fn for_file(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path).fs_context("opening payload file", path)?;
        let mut hasher = Sha1::new();
        let mut size = 0u64;
        let mut buffer = [0u8; 8192];
        loop {
            let read = file
                .read(&mut buffer)
                .fs_context("reading payload file", path)?;
            if read == 0 {
                break;
            }
            size += read as u64;
            hasher.update(&buffer[..read]);
        }
        Ok(Self {
            size,
            hash: BASE64.encode(hasher.finalize()),
        })
    }

    /// Computes the record for an in-memory buffer.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self {
            size: data.len() as u64,
            hash: BASE64.encode(Sha1::digest(data)),
        }
    }
}

/// One fragment/installer pair consumed by the generator.
#[derive(Clone, Debug)]
pub struct ManifestSource {
    /// Manifest fragment for the application.
    pub fragment: PathBuf,

    /// Staged installer the fragment describes.
    pub payload: PathBuf,
}

/// Generates the offline update response document.
///
/// `sources` and `versions` are parallel; a length mismatch fails before
/// any fragment is read. Fragment bodies are spliced in order, each with
/// its placeholders substituted inside the response body span only.
pub fn generate_update_response(
    sources: &[ManifestSource],
    versions: &[String],
) -> Result<String> {
    if sources.len() != versions.len() {
        return Err(Error::VersionCountMismatch {
            fragments: sources.len(),
            versions: versions.len(),
        });
    }
    if versions.is_empty() {
        return Err(Error::InvalidSpec(
            "manifest generation requires at least one application".to_string(),
        ));
    }

    let mut document = String::from(XML_HEADER);
    document.push_str(RESPONSE_HEADER);
    for (source, version) in sources.iter().zip(versions) {
        let record = IntegrityRecord::for_file(&source.payload)?;
        document.push_str(&substituted_body(&source.fragment, &record, version)?);
    }
    document.push_str(RESPONSE_FOOTER);
    Ok(document)
}

/// Writes the generated document as `OfflineManifest.gup` under `dir`.
pub fn write_offline_manifest(dir: &Path, document: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).fs_context("creating manifest directory", dir)?;
    let path = dir.join(OFFLINE_MANIFEST_FILE);
    std::fs::write(&path, document).fs_context("writing offline manifest", &path)?;
    Ok(path)
}

/// Derives the manifest output directory key for a bundle.
///
/// One build can produce installers for several versions of the same app,
/// so each bundle's manifest lands in its own directory. The key hashes
/// every (guid, version) pair, in payload order, and is collision-free
/// where truncated guid+version concatenation is not.
pub fn manifest_dir_key<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut hasher = Sha1::new();
    for (guid, version) in pairs {
        hasher.update(guid.as_bytes());
        hasher.update([0u8]);
        hasher.update(version.as_bytes());
        hasher.update([0u8]);
    }
    let mut key = hex::encode(hasher.finalize());
    key.truncate(16);
    key
}

fn substituted_body(
    fragment: &Path,
    record: &IntegrityRecord,
    version: &str,
) -> Result<String> {
    let bytes = std::fs::read(fragment).fs_context("reading manifest fragment", fragment)?;
    let content = String::from_utf8(bytes).map_err(|_| Error::MalformedManifestFragment {
        path: fragment.to_path_buf(),
        detail: "fragment is not valid UTF-8".to_string(),
    })?;

    let (start, end) =
        response_body_span(&content).map_err(|detail| Error::MalformedManifestFragment {
            path: fragment.to_path_buf(),
            detail: detail.to_string(),
        })?;

    Ok(content[start..end]
        .replace(SIZE_PLACEHOLDER, &record.size.to_string())
        .replace(HASH_PLACEHOLDER, &record.hash)
        .replace(VERSION_PLACEHOLDER, version))
}

/// Locates the response body of a fragment structurally.
///
/// The body runs from just past the `>` closing the `<response ...>` open
/// tag to the start of `</response>`. No other part of the fragment is
/// inspected or modified.
fn response_body_span(content: &str) -> std::result::Result<(usize, usize), &'static str> {
    let open = content
        .find("<response")
        .ok_or("fragment has no response element")?;
    let close = content[open..]
        .find('>')
        .map(|i| open + i + 1)
        .ok_or("response open tag is unterminated")?;
    let end = content[close..]
        .find(RESPONSE_FOOTER)
        .map(|i| close + i)
        .ok_or("fragment has no response close tag")?;
    Ok((close, end))
}
