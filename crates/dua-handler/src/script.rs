// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subprocess marshalling for script-like handlers.
//!
//! Handlers that shell out to an installer script build their command line
//! here: reserved component tokens are substituted from the selected
//! component, then the engine-controlled arguments (`--action-*`,
//! `--work-folder`, `--result-file`, `--installed-criteria`) are appended
//! unconditionally. After the process exits, the outcome is read back from
//! the result file in the sandbox.

use crate::context::Component;
use dua_core::UpdateResult;
use dua_core::result::erc_value;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Name of the handler result file inside the step sandbox.
pub const RESULT_FILE_NAME: &str = "aduc_result.json";

/// Substituted when a component token cannot be resolved.
const UNAVAILABLE: &str = "n/a";

/// The five workflow actions a subprocess can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerAction {
    /// Fetch payloads into the sandbox.
    Download,
    /// Apply the update to the device/component.
    Install,
    /// Finalize the update.
    Apply,
    /// Revert in-progress work.
    Cancel,
    /// Probe the installed criteria.
    IsInstalled,
}

impl HandlerAction {
    /// The action flag appended to every subprocess invocation.
    #[must_use]
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::Download => "--action-download",
            Self::Install => "--action-install",
            Self::Apply => "--action-apply",
            Self::Cancel => "--action-cancel",
            Self::IsInstalled => "--action-is-installed",
        }
    }
}

/// Errors raised while building a subprocess command line.
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    /// The handler arguments used the retired `--workfolder` spelling.
    #[error("legacy `--workfolder` argument is not accepted; use `--work-folder`")]
    LegacyWorkFolder,

    /// `--component-prop-val` appeared with no following property name.
    #[error("--component-prop-val requires a property name")]
    DanglingPropToken,
}

/// Expand component tokens and append the engine-controlled arguments.
///
/// `handler_args` is the step's whitespace-split `arguments` property.
/// Fields of an absent or incomplete component substitute the literal
/// `"n/a"`.
pub fn marshal_arguments(
    handler_args: &[String],
    component: Option<&Component>,
    action: HandlerAction,
    work_folder: &Path,
    result_file: &Path,
    installed_criteria: &str,
) -> Result<Vec<String>, MarshalError> {
    let mut out = Vec::with_capacity(handler_args.len() + 7);

    let mut args = handler_args.iter();
    while let Some(arg) = args.next() {
        if arg == "--workfolder" {
            return Err(MarshalError::LegacyWorkFolder);
        }
        if let Some(field) = component_token_field(arg) {
            out.push(resolve_field(component, field));
            continue;
        }
        if arg == "--component-prop-val" {
            let prop = args.next().ok_or(MarshalError::DanglingPropToken)?;
            out.push(resolve_property(component, prop));
            continue;
        }
        out.push(arg.clone());
    }

    out.push(action.as_flag().to_owned());
    out.push("--work-folder".to_owned());
    out.push(work_folder.display().to_string());
    out.push("--result-file".to_owned());
    out.push(result_file.display().to_string());
    out.push("--installed-criteria".to_owned());
    out.push(installed_criteria.to_owned());
    Ok(out)
}

fn component_token_field(arg: &str) -> Option<&'static str> {
    match arg {
        "--component-id-val" => Some("id"),
        "--component-name-val" => Some("name"),
        "--component-manufacturer-val" => Some("manufacturer"),
        "--component-model-val" => Some("model"),
        "--component-version-val" => Some("version"),
        "--component-group-val" => Some("group"),
        _ => None,
    }
}

fn resolve_field(component: Option<&Component>, field: &str) -> String {
    component
        .and_then(|c| c.field(field))
        .unwrap_or(UNAVAILABLE)
        .to_owned()
}

fn resolve_property(component: Option<&Component>, prop: &str) -> String {
    component
        .and_then(|c| c.property(prop))
        .unwrap_or_else(|| UNAVAILABLE.to_owned())
}

/// Read the handler result file a subprocess left in the sandbox.
///
/// A missing or unparseable file is a content-handler-facility failure; the
/// subprocess's exit status alone is never trusted as an outcome.
#[must_use]
pub fn read_result_file(work_folder: &Path) -> UpdateResult {
    let path = work_folder.join(RESULT_FILE_NAME);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %path.display(), %err, "result file missing");
            return UpdateResult::failure_with_details(
                erc_value::PARSE_RESULT_FILE,
                format!("result file `{}` missing: {err}", path.display()),
            );
        }
    };
    match serde_json::from_str::<UpdateResult>(&text) {
        Ok(result) => result,
        Err(err) => {
            warn!(path = %path.display(), %err, "result file unparseable");
            UpdateResult::failure_with_details(
                erc_value::PARSE_RESULT_FILE,
                format!("result file `{}` unparseable: {err}", path.display()),
            )
        }
    }
}

/// Run a handler subprocess and read its outcome back from the result file.
///
/// The child's stdout/stderr are inherited; cancellation is the child's
/// responsibility (it receives the cancel action as a separate invocation).
pub async fn run_handler_process(
    program: &Path,
    args: &[String],
    work_folder: &Path,
) -> UpdateResult {
    let status = tokio::process::Command::new(program)
        .args(args)
        .current_dir(work_folder)
        .status()
        .await;
    match status {
        Ok(status) => {
            if !status.success() {
                warn!(program = %program.display(), ?status, "handler process failed");
            }
            // The result file is authoritative either way.
            read_result_file(work_folder)
        }
        Err(err) => UpdateResult::failure_with_details(
            dua_core::erc(dua_core::Facility::Errno, err.raw_os_error().unwrap_or(0) as u32),
            format!("cannot spawn `{}`: {err}", program.display()),
        ),
    }
}
