// SPDX-License-Identifier: MIT OR Apache-2.0

//! The active trust-anchor set and its atomic-swap store.
//!
//! Readers always see a consistent snapshot; the only writer is the
//! rotation operation, and a swap happens iff the incoming package's
//! version is strictly greater than the active one.

use crate::package::{DisabledSigningKey, RootKey, RootKeyPackage};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// One consistent snapshot of trust anchors.
#[derive(Debug, Clone, Default)]
pub struct ActiveKeySet {
    version: u64,
    root_keys: BTreeMap<String, RootKey>,
    disabled_root_keys: BTreeSet<String>,
    disabled_signing_keys: Vec<DisabledSigningKey>,
}

impl ActiveKeySet {
    /// The device's baked-in bootstrap set (version 0).
    #[must_use]
    pub fn baked_in(root_keys: BTreeMap<String, RootKey>) -> Self {
        Self {
            version: 0,
            root_keys,
            disabled_root_keys: BTreeSet::new(),
            disabled_signing_keys: Vec::new(),
        }
    }

    /// Build a set from a verified package.
    #[must_use]
    pub fn from_package(package: &RootKeyPackage) -> Self {
        Self {
            version: package.protected.version,
            root_keys: package.protected.root_keys.clone(),
            disabled_root_keys: package.protected.disabled_root_keys.iter().cloned().collect(),
            disabled_signing_keys: package.protected.disabled_signing_keys.clone(),
        }
    }

    /// Package version this set came from.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// A trusted (present and not disabled) key by id.
    #[must_use]
    pub fn trusted_key(&self, kid: &str) -> Option<&RootKey> {
        if self.disabled_root_keys.contains(kid) {
            return None;
        }
        self.root_keys.get(kid)
    }

    /// All trusted keys.
    pub fn trusted_keys(&self) -> impl Iterator<Item = (&str, &RootKey)> {
        self.root_keys
            .iter()
            .filter(|(kid, _)| !self.disabled_root_keys.contains(*kid))
            .map(|(kid, key)| (kid.as_str(), key))
    }

    /// Whether a signing-key fingerprint is on the disabled list.
    #[must_use]
    pub fn is_signing_key_disabled(&self, fingerprint: &str) -> bool {
        self.disabled_signing_keys
            .iter()
            .any(|key| key.hash == fingerprint)
    }

    #[cfg(test)]
    pub(crate) fn disable_signing_key_for_tests(&mut self, fingerprint: String) {
        self.disabled_signing_keys.push(DisabledSigningKey {
            alg: "sha256".into(),
            hash: fingerprint,
        });
    }
}

/// Shared handle to the active key set.
///
/// One of the two process-wide values in the agent (the other is the MQTT
/// channel); constructed by the daemon and passed down, never global.
#[derive(Clone)]
pub struct RootKeyStore {
    active: Arc<RwLock<ActiveKeySet>>,
}

impl RootKeyStore {
    /// Store seeded with the baked-in bootstrap set.
    #[must_use]
    pub fn new(initial: ActiveKeySet) -> Self {
        Self {
            active: Arc::new(RwLock::new(initial)),
        }
    }

    /// A consistent snapshot of the active set.
    #[must_use]
    pub fn snapshot(&self) -> ActiveKeySet {
        self.active.read().expect("root-key store lock").clone()
    }

    /// The active set's version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.active.read().expect("root-key store lock").version
    }

    /// Swap in a verified package iff its version is strictly greater.
    ///
    /// Returns `true` when the swap happened. Verification is the caller's
    /// duty (see [`crate::verify::verify_package`]); the store only enforces
    /// monotonicity.
    pub fn swap_if_newer(&self, package: &RootKeyPackage) -> bool {
        let mut active = self.active.write().expect("root-key store lock");
        if package.protected.version <= active.version {
            warn!(
                incoming = package.protected.version,
                active = active.version,
                "root-key package does not advance the version, ignoring"
            );
            return false;
        }
        info!(
            from = active.version,
            to = package.protected.version,
            "root-key set rotated"
        );
        *active = ActiveKeySet::from_package(package);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: &str) -> RootKey {
        RootKey {
            key_type: "RSA".into(),
            n: n.into(),
            e: "AQAB".into(),
        }
    }

    fn package(version: u64) -> RootKeyPackage {
        serde_json::from_value(serde_json::json!({
            "protected": {
                "isTest": false,
                "version": version,
                "published": 1759300000,
                "disabledRootKeys": [],
                "disabledSigningKeys": [],
                "rootKeys": { "kid-new": { "keyType": "RSA", "n": "AQAB", "e": "AQAB" } }
            },
            "signatures": []
        }))
        .unwrap()
    }

    #[test]
    fn swap_requires_strictly_greater_version() {
        let store = RootKeyStore::new(ActiveKeySet::baked_in(BTreeMap::from([(
            "kid-0".to_owned(),
            key("AQAB"),
        )])));
        assert_eq!(store.version(), 0);
        assert!(store.swap_if_newer(&package(1)));
        assert_eq!(store.version(), 1);
        assert!(!store.swap_if_newer(&package(1)));
        assert!(!store.swap_if_newer(&package(0)));
        assert_eq!(store.version(), 1);
        assert!(store.swap_if_newer(&package(5)));
        assert_eq!(store.version(), 5);
    }

    #[test]
    fn snapshot_is_isolated_from_later_swaps() {
        let store = RootKeyStore::new(ActiveKeySet::baked_in(BTreeMap::from([(
            "kid-0".to_owned(),
            key("AQAB"),
        )])));
        let before = store.snapshot();
        store.swap_if_newer(&package(2));
        assert_eq!(before.version(), 0);
        assert!(before.trusted_key("kid-0").is_some());
        assert!(store.snapshot().trusted_key("kid-0").is_none());
        assert!(store.snapshot().trusted_key("kid-new").is_some());
    }

    #[test]
    fn disabled_root_keys_are_not_trusted() {
        let mut value = serde_json::to_value(package(3)).unwrap();
        value["protected"]["disabledRootKeys"] = serde_json::json!(["kid-new"]);
        let package: RootKeyPackage = serde_json::from_value(value).unwrap();
        let set = ActiveKeySet::from_package(&package);
        assert!(set.trusted_key("kid-new").is_none());
        assert_eq!(set.trusted_keys().count(), 0);
    }
}
