// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsed update manifest: steps, file table, compatibility.
//!
//! The manifest arrives from the service as signed JSON. Parsing here is
//! structural only; signature verification happens before the engine
//! materializes a workflow from the parsed form.

use crate::{UpdateId, UpdateType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lowest manifest schema version this agent understands.
pub const MIN_MANIFEST_VERSION: u32 = 4;

/// Errors raised while parsing or validating an update manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The document is not valid JSON or misses required fields.
    #[error("malformed update manifest: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `manifestVersion` is older than [`MIN_MANIFEST_VERSION`].
    #[error("unsupported manifest version {found}, need at least {min}")]
    UnsupportedVersion {
        /// Version the document declared.
        found: u32,
        /// Minimum version this agent accepts.
        min: u32,
    },

    /// A step names a file id missing from the manifest `files` table.
    #[error("step references unknown file id `{0}`")]
    UnknownFileId(String),

    /// A reference step carries no detached manifest file id.
    #[error("reference step {0} has no detachedManifestFileId")]
    MissingDetachedManifest(usize),
}

/// A signed update manifest as authored by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    /// Manifest schema version.
    pub manifest_version: u32,
    /// Identity of the update this manifest describes.
    pub update_id: UpdateId,
    /// Disjunction of device-property conjunctions; empty means "any device".
    #[serde(default)]
    pub compatibility: Vec<BTreeMap<String, String>>,
    /// Ordered update instructions.
    #[serde(default)]
    pub instructions: Instructions,
    /// Payload file table keyed by file id.
    #[serde(default)]
    pub files: BTreeMap<String, ManifestFile>,
    /// When the service created this manifest.
    pub created_date_time: DateTime<Utc>,
}

impl UpdateManifest {
    /// Parse and structurally validate a manifest document.
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural validation: version floor, step/file cross-references.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.manifest_version < MIN_MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                found: self.manifest_version,
                min: MIN_MANIFEST_VERSION,
            });
        }
        for (index, step) in self.instructions.steps.iter().enumerate() {
            match step {
                Step::Inline { files, .. } => {
                    for file_id in files {
                        if !self.files.contains_key(file_id) {
                            return Err(ManifestError::UnknownFileId(file_id.clone()));
                        }
                    }
                }
                Step::Reference {
                    detached_manifest_file_id,
                } => {
                    if detached_manifest_file_id.is_empty() {
                        return Err(ManifestError::MissingDetachedManifest(index));
                    }
                    if !self.files.contains_key(detached_manifest_file_id) {
                        return Err(ManifestError::UnknownFileId(
                            detached_manifest_file_id.clone(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Evaluate the compatibility sets against the device's properties.
    ///
    /// Each map in `compatibility` is a conjunction; the array is a
    /// disjunction. Property names and values compare case-insensitively.
    /// An empty array is compatible with every device.
    #[must_use]
    pub fn is_compatible_with(&self, device: &BTreeMap<String, String>) -> bool {
        if self.compatibility.is_empty() {
            return true;
        }
        self.compatibility.iter().any(|required| {
            required.iter().all(|(key, want)| {
                device
                    .iter()
                    .find(|(have_key, _)| have_key.eq_ignore_ascii_case(key))
                    .is_some_and(|(_, have)| have.eq_ignore_ascii_case(want))
            })
        })
    }
}

/// Ordered sequence of update steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instructions {
    /// The steps, executed in declaration order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One unit of update work.
///
/// A step is either *inline* — executed by a content handler named by its
/// update type — or a *reference* to a detached child manifest that is
/// fetched and expanded into nested steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub enum Step {
    /// A step executed directly by a content handler.
    Inline {
        /// Update type resolving to the handler, e.g. `microsoft/swupdate:2`.
        handler: UpdateType,
        /// File ids (into the manifest file table) this step downloads.
        files: Vec<String>,
        /// Handler-interpreted properties (`installedCriteria`, script
        /// name, arguments, ...). Opaque to the engine except for the
        /// accessors below.
        handler_properties: serde_json::Map<String, serde_json::Value>,
    },
    /// A pointer to a detached child manifest.
    Reference {
        /// File id of the detached manifest in the file table.
        detached_manifest_file_id: String,
    },
}

impl Step {
    /// The step's `installedCriteria` handler property, if present.
    #[must_use]
    pub fn installed_criteria(&self) -> Option<&str> {
        self.handler_property("installedCriteria")
    }

    /// The step's `scriptFileName` handler property, if present.
    #[must_use]
    pub fn script_file_name(&self) -> Option<&str> {
        self.handler_property("scriptFileName")
    }

    /// The step's `arguments` handler property, if present.
    #[must_use]
    pub fn arguments(&self) -> Option<&str> {
        self.handler_property("arguments")
    }

    /// Fetch an arbitrary string-valued handler property.
    #[must_use]
    pub fn handler_property(&self, name: &str) -> Option<&str> {
        match self {
            Self::Inline {
                handler_properties, ..
            } => handler_properties.get(name).and_then(|v| v.as_str()),
            Self::Reference { .. } => None,
        }
    }
}

/// Serde-facing shape of a step; `type` defaults to `inline` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    step_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    handler: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    files: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    handler_properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detached_manifest_file_id: Option<String>,
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        match raw.step_type.as_deref().unwrap_or("inline") {
            "inline" => {
                let handler = raw.handler.ok_or("inline step has no handler")?;
                let handler = UpdateType::parse(&handler).map_err(|e| e.to_string())?;
                Ok(Self::Inline {
                    handler,
                    files: raw.files,
                    handler_properties: raw.handler_properties,
                })
            }
            "reference" => {
                let detached_manifest_file_id = raw
                    .detached_manifest_file_id
                    .ok_or("reference step has no detachedManifestFileId")?;
                Ok(Self::Reference {
                    detached_manifest_file_id,
                })
            }
            other => Err(format!("unknown step type `{other}`")),
        }
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        match step {
            Step::Inline {
                handler,
                files,
                handler_properties,
            } => Self {
                step_type: Some("inline".into()),
                handler: Some(handler.to_string()),
                files,
                handler_properties,
                detached_manifest_file_id: None,
            },
            Step::Reference {
                detached_manifest_file_id,
            } => Self {
                step_type: Some("reference".into()),
                handler: None,
                files: Vec::new(),
                handler_properties: serde_json::Map::new(),
                detached_manifest_file_id: Some(detached_manifest_file_id),
            },
        }
    }
}

/// One payload file in the manifest `files` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    /// Name the file takes inside the step sandbox.
    pub file_name: String,
    /// Exact payload size in bytes.
    pub size_in_bytes: u64,
    /// Hash algorithm name → base64 digest; all entries must verify.
    pub hashes: BTreeMap<String, String>,
    /// Auxiliary files a download handler may consult (e.g. delta sources).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<RelatedManifestFile>,
    /// Download handler to consult before the generic download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_handler: Option<DownloadHandlerRef>,
}

/// A related file attached to a [`ManifestFile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedManifestFile {
    /// Name of the related payload.
    pub file_name: String,
    /// Exact size in bytes.
    pub size_in_bytes: u64,
    /// Hash algorithm name → base64 digest.
    pub hashes: BTreeMap<String, String>,
    /// Free-form properties the download handler interprets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Handler to consult for producing the parent file from this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_handler: Option<DownloadHandlerRef>,
}

/// Names a download-handler plug-in, e.g. `microsoft/delta-download-handler:1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadHandlerRef {
    /// Registry id of the plug-in.
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest_json() -> String {
        r#"{
            "manifestVersion": 5,
            "updateId": { "provider": "contoso", "name": "toaster", "version": "1.0" },
            "compatibility": [
                { "manufacturer": "contoso", "model": "toaster" }
            ],
            "instructions": {
                "steps": [
                    {
                        "handler": "microsoft/swupdate:2",
                        "files": ["f1"],
                        "handlerProperties": { "installedCriteria": "1.0" }
                    }
                ]
            },
            "files": {
                "f1": {
                    "fileName": "image.swu",
                    "sizeInBytes": 4,
                    "hashes": { "sha256": "q3kRconNbeNPjbVkMFdD1mvRAdJioeSdBlZXwvRkaTA=" }
                }
            },
            "createdDateTime": "2025-10-01T12:00:00Z"
        }"#
        .to_owned()
    }

    #[test]
    fn parses_inline_step_without_type_tag() {
        let m = UpdateManifest::from_json(&sample_manifest_json()).unwrap();
        assert_eq!(m.instructions.steps.len(), 1);
        match &m.instructions.steps[0] {
            Step::Inline { handler, files, .. } => {
                assert_eq!(handler.to_string(), "microsoft/swupdate:2");
                assert_eq!(files, &["f1".to_owned()]);
            }
            other => panic!("expected inline step, got {other:?}"),
        }
    }

    #[test]
    fn installed_criteria_accessor() {
        let m = UpdateManifest::from_json(&sample_manifest_json()).unwrap();
        assert_eq!(m.instructions.steps[0].installed_criteria(), Some("1.0"));
        assert_eq!(m.instructions.steps[0].script_file_name(), None);
    }

    #[test]
    fn rejects_old_manifest_version() {
        let json = sample_manifest_json().replace("\"manifestVersion\": 5", "\"manifestVersion\": 3");
        let err = UpdateManifest::from_json(&json).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::UnsupportedVersion { found: 3, min: 4 }
        ));
    }

    #[test]
    fn rejects_step_with_unknown_file_id() {
        let json = sample_manifest_json().replace("\"files\": [\"f1\"]", "\"files\": [\"nope\"]");
        let err = UpdateManifest::from_json(&json).unwrap_err();
        assert!(matches!(err, ManifestError::UnknownFileId(id) if id == "nope"));
    }

    #[test]
    fn reference_step_round_trips() {
        let step = Step::Reference {
            detached_manifest_file_id: "child".into(),
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "reference");
        assert_eq!(json["detachedManifestFileId"], "child");
        let back: Step = serde_json::from_value(json).unwrap();
        assert!(matches!(back, Step::Reference { detached_manifest_file_id } if detached_manifest_file_id == "child"));
    }

    #[test]
    fn unknown_step_type_is_rejected() {
        let err = serde_json::from_str::<Step>(r#"{ "type": "mystery" }"#).unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn compatibility_is_disjunction_of_conjunctions() {
        let m = UpdateManifest::from_json(&sample_manifest_json()).unwrap();
        let mut device = BTreeMap::new();
        device.insert("manufacturer".to_owned(), "Contoso".to_owned());
        device.insert("model".to_owned(), "TOASTER".to_owned());
        device.insert("extra".to_owned(), "ignored".to_owned());
        assert!(m.is_compatible_with(&device));

        device.insert("model".to_owned(), "kettle".to_owned());
        assert!(!m.is_compatible_with(&device));
    }

    #[test]
    fn empty_compatibility_matches_any_device() {
        let mut m = UpdateManifest::from_json(&sample_manifest_json()).unwrap();
        m.compatibility.clear();
        assert!(m.is_compatible_with(&BTreeMap::new()));
    }

    #[test]
    fn download_handler_ref_parses() {
        let json = r#"{
            "fileName": "target.swu",
            "sizeInBytes": 10,
            "hashes": { "sha256": "AAAA" },
            "relatedFiles": [{
                "fileName": "source.swu",
                "sizeInBytes": 9,
                "hashes": { "sha256": "BBBB" },
                "properties": { "microsoft.sourceFileHashAlgorithm": "sha256" },
                "downloadHandler": { "id": "microsoft/delta-download-handler:1" }
            }],
            "downloadHandler": { "id": "microsoft/delta-download-handler:1" }
        }"#;
        let f: ManifestFile = serde_json::from_str(json).unwrap();
        assert_eq!(
            f.download_handler.as_ref().unwrap().id,
            "microsoft/delta-download-handler:1"
        );
        assert_eq!(f.related_files.len(), 1);
        assert_eq!(
            f.related_files[0].download_handler.as_ref().unwrap().id,
            "microsoft/delta-download-handler:1"
        );
    }
}
