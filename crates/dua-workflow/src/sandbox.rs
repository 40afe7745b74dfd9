// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-workflow sandbox directories.
//!
//! The sandbox is exclusively owned by the engine; handlers treat it as
//! scratch. It is created on first need and removed when the root workflow
//! reaches terminal success or permanent failure.

use dua_core::{UpdateResult, erc_errno};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Compute the sandbox path for a workflow id under the configured root.
#[must_use]
pub fn sandbox_path(sandbox_root: &Path, workflow_id: &str) -> PathBuf {
    sandbox_root.join(workflow_id)
}

/// Create the sandbox directory, including parents.
///
/// Failure here is unrecoverable for the workflow; the error carries the
/// OS errno in the errno facility.
pub fn create_sandbox(path: &Path) -> Result<(), UpdateResult> {
    match std::fs::create_dir_all(path) {
        Ok(()) => {
            debug!(path = %path.display(), "sandbox created");
            Ok(())
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "cannot create sandbox");
            Err(UpdateResult::failure_with_details(
                erc_errno(err.raw_os_error().unwrap_or(0)),
                format!("cannot create sandbox `{}`: {err}", path.display()),
            ))
        }
    }
}

/// Remove the sandbox; best effort, errors are logged and swallowed.
pub fn remove_sandbox(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "sandbox removed"),
        Err(err) => warn!(path = %path.display(), %err, "cannot remove sandbox"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = sandbox_path(dir.path(), "wf-42");
        create_sandbox(&path).unwrap();
        assert!(path.is_dir());
        remove_sandbox(&path);
        assert!(!path.exists());
    }

    #[test]
    fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = sandbox_path(dir.path(), "wf-42");
        create_sandbox(&path).unwrap();
        create_sandbox(&path).unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn remove_of_absent_sandbox_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        remove_sandbox(&dir.path().join("never-created"));
    }

    #[cfg(unix)]
    #[test]
    fn create_failure_carries_errno_facility() {
        use dua_core::{Facility, facility_of};
        // A file where a directory is needed forces ENOTDIR/EEXIST.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let err = create_sandbox(&blocker.join("child")).unwrap_err();
        assert!(!err.is_success());
        assert_eq!(facility_of(err.extended_result_code), Some(Facility::Errno));
    }
}
