// SPDX-License-Identifier: MIT OR Apache-2.0

//! Payload file entities and integrity verification.
//!
//! A [`FileEntity`] is the engine-side view of one payload: the manifest
//! file record joined with the download URL the deployment supplied.
//! [`verify_file`] re-reads the bytes on disk and checks size plus every
//! declared hash; a single mismatch fails the file.

use crate::manifest::{DownloadHandlerRef, ManifestFile, RelatedManifestFile};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// One payload file as the engine and handlers see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntity {
    /// Manifest file id.
    pub file_id: String,
    /// Name the payload takes inside the sandbox.
    pub target_filename: String,
    /// Exact size in bytes.
    pub size_in_bytes: u64,
    /// Hash algorithm name → base64 digest.
    pub hashes: BTreeMap<String, String>,
    /// Download URL, when the deployment supplied one for this file id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Handler-specific argument string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Related files a download handler may consult.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<RelatedFile>,
    /// Download handler to consult before the generic download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_handler: Option<DownloadHandlerRef>,
}

impl FileEntity {
    /// Join a manifest file record with its deployment-supplied URL.
    #[must_use]
    pub fn from_manifest(file_id: &str, file: &ManifestFile, url: Option<String>) -> Self {
        Self {
            file_id: file_id.to_owned(),
            target_filename: file.file_name.clone(),
            size_in_bytes: file.size_in_bytes,
            hashes: file.hashes.clone(),
            url,
            arguments: None,
            related_files: file.related_files.iter().map(RelatedFile::from).collect(),
            download_handler: file.download_handler.clone(),
        }
    }
}

/// Engine-side view of a related file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedFile {
    /// Name of the related payload.
    pub file_name: String,
    /// Exact size in bytes.
    pub size_in_bytes: u64,
    /// Hash algorithm name → base64 digest.
    pub hashes: BTreeMap<String, String>,
    /// Free-form properties the download handler interprets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Handler that can produce the parent file from this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_handler: Option<DownloadHandlerRef>,
}

impl From<&RelatedManifestFile> for RelatedFile {
    fn from(f: &RelatedManifestFile) -> Self {
        Self {
            file_name: f.file_name.clone(),
            size_in_bytes: f.size_in_bytes,
            hashes: f.hashes.clone(),
            properties: f.properties.clone(),
            download_handler: f.download_handler.clone(),
        }
    }
}

/// Integrity failures raised by [`verify_file`].
#[derive(Debug, thiserror::Error)]
pub enum FileIntegrityError {
    /// The payload could not be read back.
    #[error("cannot read payload `{path}`: {source}")]
    Io {
        /// Path the engine tried to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// On-disk size differs from the manifest.
    #[error("size mismatch for `{path}`: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        /// Path of the payload.
        path: String,
        /// Size the manifest declared.
        expected: u64,
        /// Size found on disk.
        actual: u64,
    },

    /// A declared digest did not match the bytes on disk.
    #[error("{algorithm} mismatch for `{path}`")]
    HashMismatch {
        /// Path of the payload.
        path: String,
        /// Algorithm whose digest failed.
        algorithm: String,
    },

    /// The manifest declared an algorithm this agent cannot compute.
    #[error("unsupported hash algorithm `{0}`")]
    UnsupportedAlgorithm(String),

    /// The manifest digest was not valid base64.
    #[error("declared {algorithm} digest is not valid base64")]
    MalformedDigest {
        /// Algorithm whose declared digest is malformed.
        algorithm: String,
    },
}

/// Verify a payload's size and every declared hash.
///
/// All declared algorithms must be supported and must match; files are read
/// in 64 KiB chunks so large images do not balloon memory.
pub fn verify_file(
    path: &Path,
    expected_size: u64,
    hashes: &BTreeMap<String, String>,
) -> Result<(), FileIntegrityError> {
    let display = path.display().to_string();
    let io_err = |source| FileIntegrityError::Io {
        path: display.clone(),
        source,
    };

    let metadata = std::fs::metadata(path).map_err(io_err)?;
    if metadata.len() != expected_size {
        return Err(FileIntegrityError::SizeMismatch {
            path: display,
            expected: expected_size,
            actual: metadata.len(),
        });
    }

    for (algorithm, declared) in hashes {
        let expected = BASE64.decode(declared).map_err(|_| {
            FileIntegrityError::MalformedDigest {
                algorithm: algorithm.clone(),
            }
        })?;
        let actual = digest_file(path, algorithm)?;
        if actual != expected {
            return Err(FileIntegrityError::HashMismatch {
                path: display.clone(),
                algorithm: algorithm.clone(),
            });
        }
    }
    Ok(())
}

fn digest_file(path: &Path, algorithm: &str) -> Result<Vec<u8>, FileIntegrityError> {
    let file = std::fs::File::open(path).map_err(|source| FileIntegrityError::Io {
        path: path.display().to_string(),
        source,
    })?;
    match algorithm.to_ascii_lowercase().as_str() {
        "sha256" => digest_reader::<Sha256>(file, path),
        "sha384" => digest_reader::<Sha384>(file, path),
        "sha512" => digest_reader::<Sha512>(file, path),
        other => Err(FileIntegrityError::UnsupportedAlgorithm(other.to_owned())),
    }
}

fn digest_reader<D: Digest>(
    mut reader: std::fs::File,
    path: &Path,
) -> Result<Vec<u8>, FileIntegrityError> {
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|source| FileIntegrityError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Base64 digest of a byte slice; convenience for tests and manifest tooling.
#[must_use]
pub fn base64_sha256(bytes: &[u8]) -> String {
    BASE64.encode(Sha256::digest(bytes))
}
