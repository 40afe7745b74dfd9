// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! dua-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the update agent.
//!
//! Handlers, the workflow engine, and the cloud operations all speak the
//! types defined here; nothing in this crate performs I/O beyond reading a
//! payload file back for hash verification.

/// Payload file entities and on-disk integrity verification.
pub mod files;
/// Update manifest model: steps, file tables, compatibility.
pub mod manifest;
/// The uniform result triple and its code bands.
pub mod result;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use files::{FileEntity, FileIntegrityError, RelatedFile, verify_file};
pub use manifest::{DownloadHandlerRef, ManifestError, ManifestFile, Step, UpdateManifest};
pub use result::{Facility, UpdateResult, erc, erc_errno, facility_of};

/// Identity of one update: provider, name, and version.
///
/// Equality and hashing are case-insensitive on `provider` and `name` and
/// exact on `version`, matching how the service compares deployments.
///
/// # Examples
///
/// ```
/// use dua_core::UpdateId;
///
/// let a = UpdateId::new("Contoso", "Toaster", "1.0");
/// let b = UpdateId::new("contoso", "toaster", "1.0");
/// assert_eq!(a, b);
/// assert_ne!(a, UpdateId::new("contoso", "toaster", "1.1"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateId {
    /// Entity who authors and owns the update.
    pub provider: String,
    /// Name of the update within the provider's namespace.
    pub name: String,
    /// Version string; compared byte-for-byte.
    pub version: String,
}

impl UpdateId {
    /// Construct an update identity from its three parts.
    pub fn new(
        provider: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl PartialEq for UpdateId {
    fn eq(&self, other: &Self) -> bool {
        self.provider.eq_ignore_ascii_case(&other.provider)
            && self.name.eq_ignore_ascii_case(&other.name)
            && self.version == other.version
    }
}

impl Eq for UpdateId {}

impl std::hash::Hash for UpdateId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.provider.to_ascii_lowercase().hash(state);
        self.name.to_ascii_lowercase().hash(state);
        self.version.hash(state);
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.provider, self.name, self.version)
    }
}

/// Update type in the `{provider}/{name}:{majorVersion}` form.
///
/// This is the key the handler registry resolves to a content handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
pub struct UpdateType {
    /// Handler provider segment (case-insensitive).
    pub provider: String,
    /// Handler name segment (case-insensitive).
    pub name: String,
    /// Contract major version.
    pub version: u32,
}

impl UpdateType {
    /// Parse an update type from its canonical string form.
    pub fn parse(s: &str) -> Result<Self, UpdateTypeError> {
        let (provider, rest) = s
            .split_once('/')
            .ok_or_else(|| UpdateTypeError::Malformed(s.to_owned()))?;
        let (name, version) = rest
            .split_once(':')
            .ok_or_else(|| UpdateTypeError::Malformed(s.to_owned()))?;
        if provider.is_empty() || name.is_empty() {
            return Err(UpdateTypeError::Malformed(s.to_owned()));
        }
        let version = version
            .parse::<u32>()
            .map_err(|_| UpdateTypeError::Malformed(s.to_owned()))?;
        Ok(Self {
            provider: provider.to_ascii_lowercase(),
            name: name.to_ascii_lowercase(),
            version,
        })
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.provider, self.name, self.version)
    }
}

impl TryFrom<String> for UpdateType {
    type Error = UpdateTypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UpdateType> for String {
    fn from(value: UpdateType) -> Self {
        value.to_string()
    }
}

/// Error raised when an update-type string does not match
/// `{provider}/{name}:{version}`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpdateTypeError {
    /// The string is not of the `provider/name:version` shape.
    #[error("malformed update type `{0}`, expected provider/name:version")]
    Malformed(String),
}
