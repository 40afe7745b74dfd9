// SPDX-License-Identifier: MIT OR Apache-2.0

//! The signed root-key package model.
//!
//! `n`, `e`, `hash`, and `sig` fields are base64url (no padding). The
//! signatures cover the canonical (serde-ordered) serialization of the
//! `protected` object; both sides of this deployment serialize with ordered
//! maps, so canonicalization is stable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Signing algorithms accepted for root-key package signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlg {
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    RS256,
    /// RSASSA-PKCS1-v1_5 with SHA-384.
    RS384,
    /// RSASSA-PKCS1-v1_5 with SHA-512.
    RS512,
}

/// An RSA public key in the package (`n`/`e` base64url).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootKey {
    /// Key type; only `RSA` is defined.
    pub key_type: String,
    /// Modulus, base64url.
    pub n: String,
    /// Public exponent, base64url.
    pub e: String,
}

/// A disabled signing key, identified by the hash of its public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisabledSigningKey {
    /// Hash algorithm name (e.g. `sha256`).
    pub alg: String,
    /// Hash of the signing key's modulus, base64url.
    pub hash: String,
}

/// The signed body of the package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedProperties {
    /// Test packages are rejected on production devices.
    #[serde(default)]
    pub is_test: bool,
    /// Monotonic package version; replaces only if strictly greater.
    pub version: u64,
    /// Unix timestamp of publication.
    pub published: i64,
    /// Root-key ids revoked by this package.
    #[serde(default)]
    pub disabled_root_keys: Vec<String>,
    /// Signing keys revoked by this package.
    #[serde(default)]
    pub disabled_signing_keys: Vec<DisabledSigningKey>,
    /// The trust anchors, keyed by key id.
    pub root_keys: BTreeMap<String, RootKey>,
}

/// One signature over the protected body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSignature {
    /// Signature algorithm.
    pub alg: SigningAlg,
    /// Signature bytes, base64url.
    pub sig: String,
}

/// A parsed root-key package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootKeyPackage {
    /// The signed body.
    pub protected: ProtectedProperties,
    /// Signatures over the body, one per current root key.
    pub signatures: Vec<PackageSignature>,
}

/// Errors raised while parsing a package.
#[derive(Debug, thiserror::Error)]
pub enum PackageParseError {
    /// Not valid JSON or missing required fields.
    #[error("malformed root-key package: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The package declares no root keys at all.
    #[error("root-key package contains no root keys")]
    Empty,

    /// A key declares a type other than RSA.
    #[error("root key `{0}` has unsupported key type `{1}`")]
    UnsupportedKeyType(String, String),
}

impl RootKeyPackage {
    /// Parse and structurally validate a package document.
    pub fn from_json(json: &str) -> Result<Self, PackageParseError> {
        let package: Self = serde_json::from_str(json)?;
        if package.protected.root_keys.is_empty() {
            return Err(PackageParseError::Empty);
        }
        for (kid, key) in &package.protected.root_keys {
            if !key.key_type.eq_ignore_ascii_case("RSA") {
                return Err(PackageParseError::UnsupportedKeyType(
                    kid.clone(),
                    key.key_type.clone(),
                ));
            }
        }
        Ok(package)
    }

    /// The canonical bytes the signatures cover.
    #[must_use]
    pub fn signed_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.protected).expect("protected body serializes")
    }
}
