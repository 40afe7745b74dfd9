// SPDX-License-Identifier: MIT OR Apache-2.0

//! RSA signature verification for root-key packages and update manifests.
//!
//! Manifest signatures are compact JWS tokens
//! (`b64url(header).b64url(payload).b64url(sig)`) whose header names the
//! signing key id and whose payload pins the manifest's SHA-256 digest.

use crate::package::{RootKey, RootKeyPackage, SigningAlg};
use crate::store::ActiveKeySet;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64URL};
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use rsa::sha2::{Digest, Sha256, Sha384, Sha512};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors raised by signature verification.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// A base64url field failed to decode.
    #[error("invalid base64url in `{0}`")]
    Base64(&'static str),

    /// The named key id is not a trusted root key.
    #[error("unknown signing key `{0}`")]
    UnknownKey(String),

    /// The named key id is disabled.
    #[error("signing key `{0}` is disabled")]
    DisabledKey(String),

    /// The RSA public key could not be constructed.
    #[error("malformed public key: {0}")]
    MalformedKey(String),

    /// The cryptographic check failed.
    #[error("signature verification failed")]
    BadSignature,

    /// A JWS token was structurally invalid.
    #[error("malformed signature envelope: {0}")]
    MalformedEnvelope(String),

    /// The signed digest does not match the document bytes.
    #[error("payload digest mismatch")]
    DigestMismatch,

    /// No signature in the package verified under any trusted key.
    #[error("no package signature verified")]
    NoValidSignature,
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, VerifyError> {
    BASE64URL.decode(value).map_err(|_| VerifyError::Base64(field))
}

fn public_key(key: &RootKey) -> Result<RsaPublicKey, VerifyError> {
    let n = BigUint::from_bytes_be(&decode_field("n", &key.n)?);
    let e = BigUint::from_bytes_be(&decode_field("e", &key.e)?);
    RsaPublicKey::new(n, e).map_err(|err| VerifyError::MalformedKey(err.to_string()))
}

/// Base64url SHA-256 fingerprint of a key's modulus, as used by the
/// disabled-signing-key list.
#[must_use]
pub fn key_fingerprint(key: &RootKey) -> String {
    let n = BASE64URL.decode(&key.n).unwrap_or_default();
    BASE64URL.encode(Sha256::digest(&n))
}

/// Verify `signature` over `message` with `key` under `alg`.
pub fn verify_rsa(
    key: &RootKey,
    alg: SigningAlg,
    message: &[u8],
    signature: &[u8],
) -> Result<(), VerifyError> {
    let key = public_key(key)?;
    let result = match alg {
        SigningAlg::RS256 => key.verify(
            Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(message),
            signature,
        ),
        SigningAlg::RS384 => key.verify(
            Pkcs1v15Sign::new::<Sha384>(),
            &Sha384::digest(message),
            signature,
        ),
        SigningAlg::RS512 => key.verify(
            Pkcs1v15Sign::new::<Sha512>(),
            &Sha512::digest(message),
            signature,
        ),
    };
    result.map_err(|_| VerifyError::BadSignature)
}

/// Verify an incoming package against the currently trusted key set.
///
/// At least one signature must verify under a current, non-disabled root
/// key. (On first boot the current set is the baked-in one.)
pub fn verify_package(package: &RootKeyPackage, current: &ActiveKeySet) -> Result<(), VerifyError> {
    let message = package.signed_bytes();
    for signature in &package.signatures {
        let sig_bytes = match decode_field("sig", &signature.sig) {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        for (kid, key) in current.trusted_keys() {
            if verify_rsa(key, signature.alg, &message, &sig_bytes).is_ok() {
                debug!(kid = %kid, "root-key package signature verified");
                return Ok(());
            }
        }
    }
    Err(VerifyError::NoValidSignature)
}

// ---------------------------------------------------------------------------
// Manifest signatures
// ---------------------------------------------------------------------------

/// JWS protected header of a manifest signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSignatureHeader {
    /// Signature algorithm.
    pub alg: SigningAlg,
    /// Id of the signing key.
    pub kid: String,
}

/// JWS payload of a manifest signature: the pinned manifest digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSignatureClaims {
    /// Base64 (standard alphabet) SHA-256 digest of the manifest bytes.
    pub sha256: String,
}

/// Verify a detached manifest signature.
///
/// `signature` is a compact JWS whose header `kid` must resolve to a
/// trusted, non-disabled key and whose payload digest must match
/// `manifest_json` byte-for-byte.
pub fn verify_manifest(
    manifest_json: &str,
    signature: &str,
    keys: &ActiveKeySet,
) -> Result<(), VerifyError> {
    let mut parts = signature.split('.');
    let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(VerifyError::MalformedEnvelope(
            "expected three dot-separated sections".into(),
        ));
    };

    let header_bytes = decode_field("header", header_b64)?;
    let header: ManifestSignatureHeader = serde_json::from_slice(&header_bytes)
        .map_err(|err| VerifyError::MalformedEnvelope(err.to_string()))?;

    let key = keys
        .trusted_key(&header.kid)
        .ok_or_else(|| VerifyError::UnknownKey(header.kid.clone()))?;
    if keys.is_signing_key_disabled(&key_fingerprint(key)) {
        return Err(VerifyError::DisabledKey(header.kid.clone()));
    }

    let signed = format!("{header_b64}.{payload_b64}");
    let sig_bytes = decode_field("sig", sig_b64)?;
    verify_rsa(key, header.alg, signed.as_bytes(), &sig_bytes)?;

    let payload_bytes = decode_field("payload", payload_b64)?;
    let claims: ManifestSignatureClaims = serde_json::from_slice(&payload_bytes)
        .map_err(|err| VerifyError::MalformedEnvelope(err.to_string()))?;
    let digest = BASE64.encode(Sha256::digest(manifest_json.as_bytes()));
    if digest != claims.sha256 {
        return Err(VerifyError::DigestMismatch);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::package::{PackageSignature, ProtectedProperties};
    use crate::store::ActiveKeySet;
    use rsa::RsaPrivateKey;
    use rsa::traits::PublicKeyParts;
    use std::collections::BTreeMap;

    pub(crate) struct TestSigner {
        pub private: RsaPrivateKey,
        pub kid: String,
    }

    impl TestSigner {
        pub(crate) fn generate(kid: &str) -> Self {
            let mut rng = rand::thread_rng();
            let private = RsaPrivateKey::new(&mut rng, 2048).expect("key generation");
            Self {
                private,
                kid: kid.to_owned(),
            }
        }

        pub(crate) fn root_key(&self) -> RootKey {
            let public = self.private.to_public_key();
            RootKey {
                key_type: "RSA".into(),
                n: BASE64URL.encode(public.n().to_bytes_be()),
                e: BASE64URL.encode(public.e().to_bytes_be()),
            }
        }

        pub(crate) fn sign(&self, message: &[u8]) -> Vec<u8> {
            self.private
                .sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(message))
                .expect("signing")
        }

        pub(crate) fn sign_manifest(&self, manifest_json: &str) -> String {
            let header = serde_json::to_vec(&ManifestSignatureHeader {
                alg: SigningAlg::RS256,
                kid: self.kid.clone(),
            })
            .unwrap();
            let claims = serde_json::to_vec(&ManifestSignatureClaims {
                sha256: BASE64.encode(Sha256::digest(manifest_json.as_bytes())),
            })
            .unwrap();
            let signed = format!("{}.{}", BASE64URL.encode(&header), BASE64URL.encode(&claims));
            let sig = self.sign(signed.as_bytes());
            format!("{signed}.{}", BASE64URL.encode(sig))
        }

        pub(crate) fn package(&self, version: u64) -> RootKeyPackage {
            let protected = ProtectedProperties {
                is_test: false,
                version,
                published: 1_759_300_000,
                disabled_root_keys: Vec::new(),
                disabled_signing_keys: Vec::new(),
                root_keys: BTreeMap::from([(self.kid.clone(), self.root_key())]),
            };
            let mut package = RootKeyPackage {
                protected,
                signatures: Vec::new(),
            };
            let sig = self.sign(&package.signed_bytes());
            package.signatures.push(PackageSignature {
                alg: SigningAlg::RS256,
                sig: BASE64URL.encode(sig),
            });
            package
        }
    }

    fn key_set(signer: &TestSigner) -> ActiveKeySet {
        ActiveKeySet::baked_in(BTreeMap::from([(signer.kid.clone(), signer.root_key())]))
    }

    #[test]
    fn package_signature_verifies_under_current_keys() {
        let signer = TestSigner::generate("kid-1");
        let package = signer.package(3);
        verify_package(&package, &key_set(&signer)).unwrap();
    }

    #[test]
    fn tampered_package_fails() {
        let signer = TestSigner::generate("kid-1");
        let mut package = signer.package(3);
        package.protected.version = 4;
        let err = verify_package(&package, &key_set(&signer)).unwrap_err();
        assert!(matches!(err, VerifyError::NoValidSignature));
    }

    #[test]
    fn manifest_signature_round_trip() {
        let signer = TestSigner::generate("kid-1");
        let manifest = r#"{"manifestVersion":5}"#;
        let token = signer.sign_manifest(manifest);
        verify_manifest(manifest, &token, &key_set(&signer)).unwrap();
    }

    #[test]
    fn manifest_digest_mismatch_is_detected() {
        let signer = TestSigner::generate("kid-1");
        let token = signer.sign_manifest(r#"{"manifestVersion":5}"#);
        let err = verify_manifest(r#"{"manifestVersion":6}"#, &token, &key_set(&signer))
            .unwrap_err();
        assert!(matches!(err, VerifyError::DigestMismatch));
    }

    #[test]
    fn unknown_kid_is_rejected() {
        let signer = TestSigner::generate("kid-1");
        let stranger = TestSigner::generate("kid-2");
        let manifest = r#"{"manifestVersion":5}"#;
        let token = stranger.sign_manifest(manifest);
        let err = verify_manifest(manifest, &token, &key_set(&signer)).unwrap_err();
        assert!(matches!(err, VerifyError::UnknownKey(kid) if kid == "kid-2"));
    }

    #[test]
    fn disabled_signing_key_is_rejected() {
        let signer = TestSigner::generate("kid-1");
        let manifest = r#"{"manifestVersion":5}"#;
        let token = signer.sign_manifest(manifest);
        let mut keys = key_set(&signer);
        keys.disable_signing_key_for_tests(key_fingerprint(&signer.root_key()));
        let err = verify_manifest(manifest, &token, &keys).unwrap_err();
        assert!(matches!(err, VerifyError::DisabledKey(_)));
    }

    #[test]
    fn garbage_envelope_is_rejected() {
        let signer = TestSigner::generate("kid-1");
        let err = verify_manifest("{}", "not-a-jws", &key_set(&signer)).unwrap_err();
        assert!(matches!(err, VerifyError::MalformedEnvelope(_)));
    }
}
