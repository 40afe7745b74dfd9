// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! dua-rootkey
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The background rotation operation.
pub mod lifecycle;
/// The signed package model.
pub mod package;
/// The active set and its atomic-swap store.
pub mod store;
/// RSA verification for packages and manifest signatures.
pub mod verify;

pub use lifecycle::{RootKeyPackageSource, RotationLogic};
pub use package::{PackageParseError, RootKey, RootKeyPackage, SigningAlg};
pub use store::{ActiveKeySet, RootKeyStore};
pub use verify::{VerifyError, verify_manifest, verify_package};
