// SPDX-License-Identifier: MIT OR Apache-2.0

//! The orchestrator: walks the workflow tree, invokes handlers phase by
//! phase, persists progress, and emits reports.
//!
//! The engine is driven cooperatively: the agent loop calls
//! [`WorkflowEngine::step`] once per tick and each call advances exactly one
//! phase of one step. Cancellation is observed at every phase boundary.
//! Ordering guarantees: the snapshot is persisted before any report is
//! handed to the sink, and a cancel observed between step *k* and *k+1*
//! prevents *k+1* from starting.

use crate::persistence::{SNAPSHOT_SCHEMA_VERSION, WorkflowSnapshot};
use crate::sandbox;
use crate::state::{AgentRestartState, DeploymentAction, RebootState, WorkflowState};
use crate::tree::{NodeId, NodeKind, WorkflowTree};
use async_trait::async_trait;
use dua_core::result::{PostActionRequest, codes, erc_value};
use dua_core::{
    FileEntity, FileIntegrityError, UpdateId, UpdateManifest, UpdateResult, verify_file,
};
use dua_handler::download::DownloadHandlerOutcome;
use dua_handler::{
    ContentDownloader, ContentHandler, DownloadHandlerRegistry, HandlerRegistry, StepContext,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Verifies the root manifest's detached signature against the active
/// trust anchors. Implemented by the root-key subsystem; tests stub it.
pub trait ManifestVerifier: Send + Sync {
    /// `Ok` iff `signature` verifies `manifest_json` under a currently
    /// trusted, non-disabled signing key.
    fn verify(&self, manifest_json: &str, signature: &str) -> Result<(), String>;
}

/// Receives workflow reports; the daemon forwards them to the service as
/// `updrslt_req` messages.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Hand over one report. Called after the matching snapshot write.
    async fn publish(&self, report: WorkflowReport);
}

/// A deployment assignment as delivered by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Service-assigned workflow id.
    pub workflow_id: String,
    /// What to do: run or cancel.
    pub action: DeploymentAction,
    /// Raw signed manifest JSON (byte-exact, as signed).
    pub update_manifest: String,
    /// Detached signature material for the manifest.
    pub update_manifest_signature: String,
    /// File id → download URL.
    #[serde(default)]
    pub file_urls: HashMap<String, String>,
}

/// One report emitted toward the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowReport {
    /// Workflow the report belongs to.
    pub workflow_id: String,
    /// Update the workflow installs, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<UpdateId>,
    /// Root-level state at report time.
    pub state: WorkflowState,
    /// Root-level result.
    pub result: UpdateResult,
    /// Set when a cancel arrived after the root was already terminal.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel_requested_after_terminal: bool,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine tuning and device facts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory under which per-workflow sandboxes are created.
    pub sandbox_root: PathBuf,
    /// Path of the progress snapshot file.
    pub snapshot_path: PathBuf,
    /// Device properties evaluated against manifest compatibility sets.
    pub device_properties: BTreeMap<String, String>,
    /// Depth bound for reference-step resolution.
    pub max_reference_depth: u8,
    /// How long to wait for a handler's `cancel` before giving up on it.
    pub cancel_timeout: Duration,
}

impl EngineConfig {
    /// Config rooted at the given directories with default bounds.
    #[must_use]
    pub fn new(sandbox_root: PathBuf, snapshot_path: PathBuf) -> Self {
        Self {
            sandbox_root,
            snapshot_path,
            device_properties: BTreeMap::new(),
            max_reference_depth: 8,
            cancel_timeout: Duration::from_secs(30),
        }
    }
}

/// What one `step()` call observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineTick {
    /// No workflow, or the workflow is paused awaiting an external action.
    Idle,
    /// One phase was advanced.
    Working,
    /// The workflow just reached (or already is in) a terminal state.
    Terminal(WorkflowState),
}

// ---------------------------------------------------------------------------
// The engine
// ---------------------------------------------------------------------------

/// The workflow engine. Owns at most one live [`WorkflowTree`].
pub struct WorkflowEngine {
    config: EngineConfig,
    handlers: Arc<HandlerRegistry>,
    download_handlers: Arc<DownloadHandlerRegistry>,
    downloader: Arc<dyn ContentDownloader>,
    verifier: Arc<dyn ManifestVerifier>,
    reporter: Arc<dyn ReportSink>,
    tree: Option<WorkflowTree>,
    /// Immediate reboot/agent-restart the daemon must act on before the
    /// engine will advance again.
    pending_immediate: Option<PostActionRequest>,
    final_reported: bool,
}

impl WorkflowEngine {
    /// Wire up an engine with its collaborators.
    pub fn new(
        config: EngineConfig,
        handlers: Arc<HandlerRegistry>,
        download_handlers: Arc<DownloadHandlerRegistry>,
        downloader: Arc<dyn ContentDownloader>,
        verifier: Arc<dyn ManifestVerifier>,
        reporter: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            config,
            handlers,
            download_handlers,
            downloader,
            verifier,
            reporter,
            tree: None,
            pending_immediate: None,
            final_reported: false,
        }
    }

    /// The live tree, if any. Read-only; all mutation goes through the
    /// engine.
    #[must_use]
    pub fn tree(&self) -> Option<&WorkflowTree> {
        self.tree.as_ref()
    }

    /// Immediate reboot/restart request awaiting the outer daemon, if any.
    #[must_use]
    pub fn pending_immediate_action(&self) -> Option<PostActionRequest> {
        self.pending_immediate
    }

    /// Deferred reboot/restart requests accumulated so far.
    #[must_use]
    pub fn deferred_actions(&self) -> (bool, bool) {
        self.tree
            .as_ref()
            .map(|t| {
                (
                    t.post_actions.reboot_requested(),
                    t.post_actions.agent_restart_requested(),
                )
            })
            .unwrap_or((false, false))
    }

    // -- startup recovery ---------------------------------------------------

    /// Recover from a persisted snapshot before accepting new work.
    ///
    /// A terminal snapshot is re-reported and deleted; the sandbox goes with
    /// it. A non-terminal snapshot means the process died (or rebooted) mid
    /// workflow: its state is re-reported so the service learns where the
    /// device stands, and the snapshot is kept until the service re-issues
    /// the deployment — handlers are idempotent w.r.t. installed criteria,
    /// so re-running the workflow converges.
    pub async fn recover(&mut self) {
        let Some(snapshot) = WorkflowSnapshot::load(&self.config.snapshot_path) else {
            return;
        };
        info!(
            workflow_id = %snapshot.workflow_id,
            step = ?snapshot.workflow_step,
            "recovering persisted workflow state"
        );
        let report = WorkflowReport {
            workflow_id: snapshot.workflow_id.clone(),
            update_id: Some(snapshot.expected_update_id.clone()),
            state: snapshot.workflow_step,
            result: UpdateResult {
                result_code: snapshot.result_code,
                extended_result_code: snapshot.extended_result_code,
                result_details: None,
            },
            cancel_requested_after_terminal: false,
        };
        self.reporter.publish(report).await;
        if snapshot.workflow_step.is_terminal() {
            WorkflowSnapshot::delete(&self.config.snapshot_path);
            sandbox::remove_sandbox(&snapshot.work_folder);
        }
    }

    // -- deployment entry ---------------------------------------------------

    /// Accept a deployment assignment.
    ///
    /// `Cancel` actions flag the live tree; `ProcessDeployment` aborts any
    /// prior non-terminal workflow, verifies the manifest signature, checks
    /// compatibility, materializes the tree (resolving reference steps), and
    /// leaves the engine ready to be stepped.
    pub async fn process_deployment(&mut self, deployment: Deployment) {
        match deployment.action {
            DeploymentAction::Cancel => self.handle_cancel_request(&deployment.workflow_id),
            DeploymentAction::ProcessDeployment => self.start_deployment(deployment).await,
        }
    }

    fn handle_cancel_request(&mut self, workflow_id: &str) {
        match &mut self.tree {
            Some(tree) if tree.workflow_id == workflow_id => {
                info!(workflow_id, "cancel requested");
                tree.request_cancel();
            }
            Some(tree) => {
                warn!(
                    live = %tree.workflow_id,
                    requested = workflow_id,
                    "cancel for a workflow that is not live; ignoring"
                );
            }
            None => warn!(workflow_id, "cancel with no live workflow; ignoring"),
        }
    }

    async fn start_deployment(&mut self, deployment: Deployment) {
        self.abort_live_workflow().await;

        let workflow_id = deployment.workflow_id.clone();
        info!(workflow_id = %workflow_id, "deployment accepted");

        // Signature first: nothing in the manifest is trusted before this.
        if let Err(detail) = self
            .verifier
            .verify(&deployment.update_manifest, &deployment.update_manifest_signature)
        {
            self.reject_deployment(
                &workflow_id,
                None,
                erc_value::SIGNATURE_VALIDATION_FAILED,
                format!("manifest signature rejected: {detail}"),
            )
            .await;
            return;
        }

        let manifest = match UpdateManifest::from_json(&deployment.update_manifest) {
            Ok(manifest) => manifest,
            Err(err) => {
                self.reject_deployment(
                    &workflow_id,
                    None,
                    erc_value::MANIFEST_VALIDATION_FAILED,
                    err.to_string(),
                )
                .await;
                return;
            }
        };
        let update_id = manifest.update_id.clone();

        if !manifest.is_compatible_with(&self.config.device_properties) {
            self.reject_deployment(
                &workflow_id,
                Some(update_id),
                erc_value::INCOMPATIBLE_UPDATE,
                "no compatibility set matches this device".to_owned(),
            )
            .await;
            return;
        }

        let work_folder = sandbox::sandbox_path(&self.config.sandbox_root, &workflow_id);
        if let Err(result) = sandbox::create_sandbox(&work_folder) {
            self.reject_deployment(
                &workflow_id,
                Some(update_id),
                result.extended_result_code,
                result.result_details.unwrap_or_default(),
            )
            .await;
            return;
        }

        let mut tree = WorkflowTree::new(
            workflow_id,
            manifest,
            deployment.update_manifest,
            deployment.update_manifest_signature,
            deployment.file_urls,
            work_folder,
        );

        let mut seen = HashSet::new();
        seen.insert(tree.node(tree.root()).update_id.clone());
        if let Err(result) = self.materialize_children(&mut tree, NodeId::ROOT, 0, &mut seen).await
        {
            let update_id = tree.node(tree.root()).update_id.clone();
            let workflow_id = tree.workflow_id.clone();
            sandbox::remove_sandbox(&tree.work_folder);
            self.reject_deployment(
                &workflow_id,
                Some(update_id),
                result.extended_result_code,
                result.result_details.unwrap_or_default(),
            )
            .await;
            return;
        }

        tree.node_mut(NodeId::ROOT).state = WorkflowState::DeploymentInProgress;
        self.tree = Some(tree);
        self.final_reported = false;
        self.pending_immediate = None;
        self.persist();
        self.report_current_state().await;
    }

    /// Abort a live non-terminal workflow in favor of a new deployment.
    async fn abort_live_workflow(&mut self) {
        if self.tree.is_none() {
            return;
        }
        let step_to_cancel = {
            let tree = self.tree.as_mut().expect("live tree");
            if tree.node(tree.root()).state.is_terminal() {
                None
            } else {
                info!(workflow_id = %tree.workflow_id, "aborting superseded workflow");
                tree.request_cancel();
                Some(current_step(tree))
            }
        };
        if let Some(step_id) = step_to_cancel {
            if let Some(step_id) = step_id {
                let _ = self.invoke_cancel(step_id).await;
            }
            let tree = self.tree.as_mut().expect("live tree");
            tree.node_mut(NodeId::ROOT).state = WorkflowState::Cancelled;
            tree.node_mut(NodeId::ROOT).result = Some(
                UpdateResult::failure_with_details(
                    erc_value::DEPLOYMENT_SUPERSEDED,
                    "superseded by a newer deployment",
                ),
            );
            self.persist();
            self.report_current_state().await;
        }
        let tree = self.tree.take().expect("live tree");
        sandbox::remove_sandbox(&tree.work_folder);
        WorkflowSnapshot::delete(&self.config.snapshot_path);
    }

    /// Terminal failure before any tree exists (signature, parse,
    /// compatibility, sandbox).
    async fn reject_deployment(
        &mut self,
        workflow_id: &str,
        update_id: Option<UpdateId>,
        extended_result_code: i32,
        detail: String,
    ) {
        warn!(workflow_id, %detail, "deployment rejected");
        let report = WorkflowReport {
            workflow_id: workflow_id.to_owned(),
            update_id,
            state: WorkflowState::Failed,
            result: UpdateResult::failure_with_details(extended_result_code, detail),
            cancel_requested_after_terminal: false,
        };
        self.reporter.publish(report).await;
    }

    /// Walk a manifest's steps, adding child nodes; reference steps are
    /// fetched, verified, parsed, and recursed into.
    async fn materialize_children(
        &self,
        tree: &mut WorkflowTree,
        parent: NodeId,
        depth: u8,
        seen: &mut HashSet<UpdateId>,
    ) -> Result<(), UpdateResult> {
        if depth >= self.config.max_reference_depth {
            return Err(UpdateResult::failure_with_details(
                erc_value::MANIFEST_REFERENCE_CYCLE,
                format!("reference depth bound {} exceeded", self.config.max_reference_depth),
            ));
        }

        let steps = tree
            .node(parent)
            .manifest()
            .expect("materialize_children called on an Update node")
            .instructions
            .steps
            .clone();
        let parent_update_id = tree.node(parent).update_id.clone();

        for step in steps {
            match step {
                dua_core::Step::Inline {
                    handler,
                    files,
                    handler_properties,
                } => {
                    tree.add_child(
                        parent,
                        parent_update_id.clone(),
                        NodeKind::Step {
                            handler,
                            files,
                            handler_properties,
                            selected_components: Vec::new(),
                            backed_up: false,
                        },
                    );
                }
                dua_core::Step::Reference {
                    detached_manifest_file_id,
                } => {
                    let child_manifest = self
                        .resolve_detached_manifest(tree, parent, &detached_manifest_file_id)
                        .await?;
                    let child_update_id = child_manifest.update_id.clone();
                    if !seen.insert(child_update_id.clone()) {
                        return Err(UpdateResult::failure_with_details(
                            erc_value::MANIFEST_REFERENCE_CYCLE,
                            format!("detached manifest cycle at {child_update_id}"),
                        ));
                    }
                    let child = tree.add_child(
                        parent,
                        child_update_id,
                        NodeKind::Update {
                            manifest: child_manifest,
                        },
                    );
                    Box::pin(self.materialize_children(tree, child, depth + 1, seen)).await?;
                }
            }
        }
        Ok(())
    }

    /// Fetch and parse one detached child manifest.
    async fn resolve_detached_manifest(
        &self,
        tree: &WorkflowTree,
        parent: NodeId,
        file_id: &str,
    ) -> Result<UpdateManifest, UpdateResult> {
        let manifest = tree.governing_manifest(parent);
        let Some(file) = manifest.files.get(file_id) else {
            return Err(UpdateResult::failure_with_details(
                erc_value::UNRESOLVABLE_REFERENCE_STEP,
                format!("no file table entry for detached manifest `{file_id}`"),
            ));
        };
        let entity =
            FileEntity::from_manifest(file_id, file, tree.file_urls.get(file_id).cloned());
        let target = tree.work_folder.join(&entity.target_filename);
        self.ensure_payload(tree, None, &entity, &target).await?;

        let text = std::fs::read_to_string(&target).map_err(|err| {
            UpdateResult::failure_with_details(
                erc_value::UNRESOLVABLE_REFERENCE_STEP,
                format!("cannot read detached manifest `{file_id}`: {err}"),
            )
        })?;
        UpdateManifest::from_json(&text).map_err(|err| {
            UpdateResult::failure_with_details(
                erc_value::UNRESOLVABLE_REFERENCE_STEP,
                format!("detached manifest `{file_id}` invalid: {err}"),
            )
        })
    }

    // -- stepping -----------------------------------------------------------

    /// Advance the workflow by exactly one phase of one step.
    pub async fn step(&mut self) -> EngineTick {
        if self.pending_immediate.is_some() {
            // Waiting for the daemon to reboot/restart us.
            return EngineTick::Idle;
        }
        let (root_state, cancel_requested, next_step) = {
            let Some(tree) = &self.tree else {
                return EngineTick::Idle;
            };
            (
                tree.node(tree.root()).state,
                tree.cancellation.is_cancelled(),
                current_step(tree),
            )
        };

        if root_state.is_terminal() {
            if !self.final_reported {
                self.finish_terminal().await;
            }
            return EngineTick::Terminal(root_state);
        }

        if cancel_requested {
            self.cancel_workflow().await;
            return EngineTick::Terminal(self.root_state());
        }

        let Some(step_id) = next_step else {
            self.finalize_success().await;
            return EngineTick::Terminal(self.root_state());
        };

        self.advance_step(step_id).await;
        match self.root_state() {
            state if state.is_terminal() => EngineTick::Terminal(state),
            _ => EngineTick::Working,
        }
    }

    fn root_state(&self) -> WorkflowState {
        self.tree
            .as_ref()
            .map(|t| t.node(t.root()).state)
            .unwrap_or(WorkflowState::Idle)
    }

    async fn advance_step(&mut self, step_id: NodeId) {
        let state = self.tree.as_ref().expect("live tree").node(step_id).state;
        match state {
            WorkflowState::Idle => self.phase_probe(step_id).await,
            WorkflowState::DownloadStarted => self.phase_download(step_id).await,
            WorkflowState::DownloadSucceeded => self.phase_install(step_id).await,
            WorkflowState::InstallSucceeded => self.phase_apply(step_id).await,
            other => {
                // A stuck intermediate state would loop forever; fail loudly.
                warn!(?other, "step in unexpected state");
                self.fail_step(
                    step_id,
                    UpdateResult::failure_with_details(
                        erc_value::COMPONENT_PANIC,
                        format!("step wedged in state {other:?}"),
                    ),
                )
                .await;
            }
        }
    }

    /// Phase 0: resolve the handler and probe `is_installed`.
    async fn phase_probe(&mut self, step_id: NodeId) {
        let Some(handler) = self.resolve_handler(step_id) else {
            let update_type = self
                .tree
                .as_ref()
                .and_then(|t| t.node(step_id).handler().cloned());
            self.fail_step(
                step_id,
                UpdateResult::failure_with_details(
                    erc_value::UNKNOWN_UPDATE_TYPE,
                    format!(
                        "no handler registered for `{}`",
                        update_type.map(|t| t.to_string()).unwrap_or_default()
                    ),
                ),
            )
            .await;
            return;
        };

        let context = self.step_context(step_id);
        let result = invoke_guarded(handler.clone(), &context, Phase::IsInstalled).await;
        if result.result_code == codes::IS_INSTALLED_INSTALLED {
            debug!(step = ?step_id, "installed criteria already satisfied, skipping step");
            let tree = self.tree.as_mut().expect("live tree");
            let node = tree.node_mut(step_id);
            node.result = Some(UpdateResult::success(
                codes::INSTALL_SKIPPED_UPDATE_ALREADY_INSTALLED,
            ));
            node.state = WorkflowState::ApplySucceeded;
        } else {
            // NotInstalled and probe failures both proceed to download; a
            // genuinely broken handler will fail its next phase with full
            // detail.
            let tree = self.tree.as_mut().expect("live tree");
            tree.node_mut(step_id).state = WorkflowState::DownloadStarted;
            self.mirror_root_state(WorkflowState::DownloadStarted);
        }
        self.persist();
    }

    /// Phase 1: handler consult, payload fetch, integrity verification.
    async fn phase_download(&mut self, step_id: NodeId) {
        let handler = self.resolve_handler(step_id).expect("resolved in probe");
        let context = self.step_context(step_id);

        let result = invoke_guarded(handler, &context, Phase::Download).await;
        if result.is_cancelled() {
            self.cancel_workflow().await;
            return;
        }
        if !result.is_success() {
            self.fail_step(step_id, result).await;
            return;
        }

        if result.result_code != codes::DOWNLOAD_SKIPPED_UPDATE_ALREADY_INSTALLED {
            let mut cancelled = false;
            let mut failure = None;
            {
                let tree = self.tree.as_ref().expect("live tree");
                for entity in &context.files {
                    if tree.cancellation.is_cancelled() {
                        cancelled = true;
                        break;
                    }
                    let target = context.work_folder.join(&entity.target_filename);
                    if let Err(err) = self.ensure_payload(tree, Some(&context), entity, &target).await
                    {
                        failure = Some(err);
                        break;
                    }
                }
            }
            if cancelled {
                self.cancel_workflow().await;
                return;
            }
            if let Some(failure) = failure {
                self.fail_step(step_id, failure).await;
                return;
            }
        }

        let tree = self.tree.as_mut().expect("live tree");
        let node = tree.node_mut(step_id);
        node.result = Some(result);
        node.state = WorkflowState::DownloadSucceeded;
        self.mirror_root_state(WorkflowState::DownloadSucceeded);
        self.persist();
    }

    /// Phase 2: backup, then install; observe reboot/restart requests.
    async fn phase_install(&mut self, step_id: NodeId) {
        let handler = self.resolve_handler(step_id).expect("resolved in probe");
        let context = self.step_context(step_id);

        self.mirror_root_state(WorkflowState::InstallStarted);
        let backup = invoke_guarded(handler.clone(), &context, Phase::Backup).await;
        if backup.is_success() {
            if backup.result_code == codes::BACKUP_SUCCESS {
                if let Some(tree) = &mut self.tree {
                    if let NodeKind::Step { backed_up, .. } = &mut tree.node_mut(step_id).kind {
                        *backed_up = true;
                    }
                }
            }
        } else {
            self.fail_step(step_id, backup).await;
            return;
        }

        let result = invoke_guarded(handler, &context, Phase::Install).await;
        if result.is_cancelled() {
            self.cancel_workflow().await;
            return;
        }
        if !result.is_success() {
            self.fail_step(step_id, result).await;
            return;
        }

        if result.result_code == codes::INSTALL_SKIPPED_UPDATE_ALREADY_INSTALLED {
            // Already installed at install time: record success for this
            // step and continue with the next one; apply never runs here.
            debug!(step = ?step_id, "install reported already installed, step complete");
            let tree = self.tree.as_mut().expect("live tree");
            let node = tree.node_mut(step_id);
            node.result = Some(result);
            node.state = WorkflowState::ApplySucceeded;
            self.persist();
            return;
        }

        self.observe_post_actions(&result, &context);
        let tree = self.tree.as_mut().expect("live tree");
        let node = tree.node_mut(step_id);
        node.result = Some(result);
        node.state = WorkflowState::InstallSucceeded;
        self.mirror_root_state(WorkflowState::InstallSucceeded);
        self.persist();
    }

    /// Phase 3: apply; observe reboot/restart requests.
    async fn phase_apply(&mut self, step_id: NodeId) {
        let handler = self.resolve_handler(step_id).expect("resolved in probe");
        let context = self.step_context(step_id);

        self.mirror_root_state(WorkflowState::ApplyStarted);
        let result = invoke_guarded(handler.clone(), &context, Phase::Apply).await;
        if result.is_cancelled() {
            self.cancel_workflow().await;
            return;
        }
        if !result.is_success() {
            // A failed apply gets its backup restored right away; earlier
            // steps are unwound by fail_step.
            self.fail_step(step_id, result).await;
            return;
        }

        self.observe_post_actions(&result, &context);
        let tree = self.tree.as_mut().expect("live tree");
        let node = tree.node_mut(step_id);
        node.result = Some(result);
        node.state = WorkflowState::ApplySucceeded;
        self.persist();
    }

    // -- failure / cancellation unwinding ------------------------------------

    /// Record a step failure, run `cancel` on it, unwind backups, and mark
    /// the root failed. No subsequent step runs.
    async fn fail_step(&mut self, step_id: NodeId, failure: UpdateResult) {
        let failure = failure.with_discovery_sentinel();
        warn!(step = ?step_id, %failure, "step failed");

        let _ = self.invoke_cancel(step_id).await;
        let restore_ok = self.restore_backed_up_steps(step_id).await;

        let tree = self.tree.as_mut().expect("live tree");
        {
            let node = tree.node_mut(step_id);
            node.result = Some(failure.clone());
            node.state = WorkflowState::Failed;
        }
        let root = tree.node_mut(NodeId::ROOT);
        root.state = if restore_ok {
            WorkflowState::Failed
        } else {
            WorkflowState::FailedRestoreFailed
        };
        root.result = Some(failure);
        self.persist();
        self.finish_terminal().await;
    }

    /// Drive `restore` on every earlier step that backed up, newest first.
    /// Returns `false` when any restore fails.
    async fn restore_backed_up_steps(&mut self, failed_step: NodeId) -> bool {
        let to_restore: Vec<NodeId> = {
            let tree = self.tree.as_ref().expect("live tree");
            tree.steps_in_order()
                .into_iter()
                .take_while(|id| *id != failed_step)
                .filter(|id| {
                    matches!(
                        tree.node(*id).kind,
                        NodeKind::Step { backed_up: true, .. }
                    )
                })
                .collect()
        };

        let mut all_ok = true;
        for step_id in to_restore.into_iter().rev() {
            let Some(handler) = self.resolve_handler(step_id) else {
                all_ok = false;
                continue;
            };
            let context = self.step_context(step_id);
            let result = invoke_guarded(handler, &context, Phase::Restore).await;
            if !result.is_success() {
                warn!(step = ?step_id, %result, "restore failed");
                all_ok = false;
            }
        }
        all_ok
    }

    /// Invoke a handler's `cancel` with a bounded wait.
    async fn invoke_cancel(&mut self, step_id: NodeId) -> UpdateResult {
        let Some(handler) = self.resolve_handler(step_id) else {
            return UpdateResult::success(codes::CANCEL_UNABLE_TO_CANCEL);
        };
        let context = self.step_context(step_id);
        match tokio::time::timeout(
            self.config.cancel_timeout,
            invoke_guarded(handler, &context, Phase::Cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(step = ?step_id, "handler cancel timed out");
                UpdateResult::success(codes::CANCEL_UNABLE_TO_CANCEL)
            }
        }
    }

    /// Cancellation observed: cancel the in-flight step, mark the root, and
    /// finish.
    async fn cancel_workflow(&mut self) {
        let step_id = self.tree.as_ref().and_then(current_step);
        let cancel_result = match step_id {
            Some(step_id) => {
                let result = self.invoke_cancel(step_id).await;
                let tree = self.tree.as_mut().expect("live tree");
                let node = tree.node_mut(step_id);
                node.state = WorkflowState::Cancelled;
                node.result = Some(UpdateResult::cancelled());
                result
            }
            None => UpdateResult::success(codes::CANCEL_SUCCESS),
        };
        info!(cancel = %cancel_result, "workflow cancelled");

        let tree = self.tree.as_mut().expect("live tree");
        let root = tree.node_mut(NodeId::ROOT);
        root.state = WorkflowState::Cancelled;
        root.result = Some(UpdateResult::cancelled().with_details(format!(
            "deployment cancelled (handler cancel: {})",
            cancel_result.result_code
        )));
        self.persist();
        self.finish_terminal().await;
    }

    // -- completion ---------------------------------------------------------

    /// Every step is terminal-successful: seal the root and notify plug-ins.
    async fn finalize_success(&mut self) {
        let tree = self.tree.as_mut().expect("live tree");
        let last_result = tree
            .steps_in_order()
            .last()
            .and_then(|id| tree.node(*id).result.clone())
            .unwrap_or_else(|| UpdateResult::success(codes::APPLY_SUCCESS));
        let root = tree.node_mut(NodeId::ROOT);
        root.state = WorkflowState::ApplySucceeded;
        root.result = Some(last_result);
        self.persist();

        // Give download-handler plug-ins their shot at the sandbox payloads
        // before the sandbox goes away.
        let root_context = self.root_context();
        for (id, plugin) in self.download_handlers.iter() {
            debug!(plugin = id, "notifying download handler of workflow completion");
            plugin.on_update_workflow_completed(&root_context).await;
        }

        self.finish_terminal().await;
    }

    /// Persist-then-report the terminal state, then release resources.
    async fn finish_terminal(&mut self) {
        self.report_current_state().await;
        self.final_reported = true;
        let tree = self.tree.as_ref().expect("live tree");
        sandbox::remove_sandbox(&tree.work_folder);
        WorkflowSnapshot::delete(&self.config.snapshot_path);
    }

    // -- shared plumbing ----------------------------------------------------

    fn resolve_handler(&self, step_id: NodeId) -> Option<Arc<dyn ContentHandler>> {
        let tree = self.tree.as_ref()?;
        let update_type = tree.node(step_id).handler()?;
        self.handlers.get(update_type)
    }

    /// Build the opaque handle a handler receives for `step_id`.
    fn step_context(&self, step_id: NodeId) -> StepContext {
        let tree = self.tree.as_ref().expect("live tree");
        let node = tree.node(step_id);
        let manifest = tree.governing_manifest(step_id);

        let (handler, files, handler_properties, selected_components) = match &node.kind {
            NodeKind::Step {
                handler,
                files,
                handler_properties,
                selected_components,
                ..
            } => (
                handler.clone(),
                files.clone(),
                handler_properties.clone(),
                selected_components.clone(),
            ),
            NodeKind::Update { .. } => unreachable!("step_context called on an Update node"),
        };

        let files = files
            .iter()
            .filter_map(|file_id| {
                manifest.files.get(file_id).map(|f| {
                    FileEntity::from_manifest(file_id, f, tree.file_urls.get(file_id).cloned())
                })
            })
            .collect();

        StepContext::new(
            tree.workflow_id.clone(),
            node.update_id.clone(),
            handler,
            tree.work_folder.clone(),
            node.installed_criteria().map(str::to_owned),
            handler_properties,
            files,
            selected_components,
            tree.cancellation.clone(),
            tree.post_actions.clone(),
        )
    }

    /// A minimal context for root-scoped notifications.
    fn root_context(&self) -> StepContext {
        let tree = self.tree.as_ref().expect("live tree");
        let root = tree.node(tree.root());
        StepContext::new(
            tree.workflow_id.clone(),
            root.update_id.clone(),
            dua_core::UpdateType {
                provider: root.update_id.provider.to_ascii_lowercase(),
                name: root.update_id.name.to_ascii_lowercase(),
                version: 1,
            },
            tree.work_folder.clone(),
            None,
            serde_json::Map::new(),
            Vec::new(),
            Vec::new(),
            tree.cancellation.clone(),
            tree.post_actions.clone(),
        )
    }

    /// Make sure one payload exists in the sandbox and verifies.
    ///
    /// Order: existing valid file → download-handler plug-in → generic
    /// download; hashes are verified whichever path produced the bytes, and
    /// a mismatch is not retried locally.
    async fn ensure_payload(
        &self,
        tree: &WorkflowTree,
        context: Option<&StepContext>,
        entity: &FileEntity,
        target: &Path,
    ) -> Result<(), UpdateResult> {
        if target.exists()
            && verify_file(target, entity.size_in_bytes, &entity.hashes).is_ok()
        {
            debug!(file = %entity.target_filename, "payload already present and valid");
            return Ok(());
        }

        let mut downloaded = false;
        if let (Some(handler_ref), Some(context)) = (&entity.download_handler, context) {
            if let Some(plugin) = self.download_handlers.get(&handler_ref.id) {
                let result = plugin.process_update(context, entity, target).await;
                match DownloadHandlerOutcome::from_result(&result) {
                    DownloadHandlerOutcome::SkipDownload => {
                        debug!(file = %entity.target_filename, plugin = %handler_ref.id,
                               "download handler produced the payload");
                        downloaded = true;
                    }
                    DownloadHandlerOutcome::FullDownloadRequired => {
                        debug!(file = %entity.target_filename, plugin = %handler_ref.id,
                               "download handler declined, falling back");
                    }
                    DownloadHandlerOutcome::Fatal => return Err(result),
                }
            } else {
                debug!(plugin = %handler_ref.id, "download handler not registered, falling back");
            }
        }

        if !downloaded {
            let Some(url) = entity
                .url
                .clone()
                .or_else(|| tree.file_urls.get(&entity.file_id).cloned())
            else {
                return Err(UpdateResult::failure_with_details(
                    erc_value::MISSING_FILE_URL,
                    format!("no URL for file id `{}`", entity.file_id),
                ));
            };
            let result = self.downloader.download(&url, target).await;
            if !result.is_success() {
                return Err(result);
            }
        }

        verify_file(target, entity.size_in_bytes, &entity.hashes).map_err(integrity_failure)
    }

    fn observe_post_actions(&mut self, result: &UpdateResult, context: &StepContext) {
        match PostActionRequest::from_result_code(result.result_code) {
            PostActionRequest::Reboot => context.post_actions().request_reboot(),
            PostActionRequest::ImmediateReboot => {
                context.post_actions().request_immediate_reboot();
            }
            PostActionRequest::AgentRestart => context.post_actions().request_agent_restart(),
            PostActionRequest::ImmediateAgentRestart => {
                context.post_actions().request_immediate_agent_restart();
            }
            PostActionRequest::None => {}
        }

        let flags = context.post_actions();
        if flags.immediate_reboot_requested() {
            self.pending_immediate = Some(PostActionRequest::ImmediateReboot);
        } else if flags.immediate_agent_restart_requested() {
            self.pending_immediate = Some(PostActionRequest::ImmediateAgentRestart);
        }
    }

    fn mirror_root_state(&mut self, state: WorkflowState) {
        if let Some(tree) = &mut self.tree {
            tree.node_mut(NodeId::ROOT).state = state;
        }
    }

    /// Write the snapshot for the current root state.
    fn persist(&self) {
        let Some(tree) = &self.tree else { return };
        let root = tree.node(tree.root());
        let step_id = current_step(tree);
        let (update_type, installed_criteria) = step_id
            .map(|id| {
                let node = tree.node(id);
                (
                    node.handler().map(ToString::to_string),
                    node.installed_criteria().map(str::to_owned),
                )
            })
            .unwrap_or((None, None));

        let result = root.result.clone().unwrap_or(UpdateResult {
            result_code: codes::FAILURE,
            extended_result_code: 0,
            result_details: None,
        });
        let report = self.build_report();
        let snapshot = WorkflowSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            workflow_step: root.state,
            result_code: result.result_code,
            extended_result_code: result.extended_result_code,
            system_reboot_state: if tree.post_actions.reboot_requested()
                || tree.post_actions.immediate_reboot_requested()
            {
                RebootState::Required
            } else {
                RebootState::None
            },
            agent_restart_state: if tree.post_actions.agent_restart_requested()
                || tree.post_actions.immediate_agent_restart_requested()
            {
                AgentRestartState::Required
            } else {
                AgentRestartState::None
            },
            expected_update_id: root.update_id.clone(),
            workflow_id: tree.workflow_id.clone(),
            update_type,
            installed_criteria,
            work_folder: tree.work_folder.clone(),
            reporting_json: serde_json::to_value(&report).unwrap_or_default(),
        };
        if let Err(err) = snapshot.save(&self.config.snapshot_path) {
            warn!(%err, "snapshot write failed");
        }
    }

    fn build_report(&self) -> WorkflowReport {
        let tree = self.tree.as_ref().expect("live tree");
        let root = tree.node(tree.root());
        WorkflowReport {
            workflow_id: tree.workflow_id.clone(),
            update_id: Some(root.update_id.clone()),
            state: root.state,
            result: root
                .result
                .clone()
                .unwrap_or_else(|| UpdateResult::success(codes::SUCCESS)),
            cancel_requested_after_terminal: tree.cancel_requested_after_terminal,
        }
    }

    async fn report_current_state(&self) {
        if self.tree.is_some() {
            self.reporter.publish(self.build_report()).await;
        }
    }
}

/// The first step (declaration order) that is not yet terminal.
fn current_step(tree: &WorkflowTree) -> Option<NodeId> {
    tree.steps_in_order()
        .into_iter()
        .find(|id| !tree.node(*id).state.is_terminal())
}

/// Map an integrity failure to its content-handler-facility result.
fn integrity_failure(err: FileIntegrityError) -> UpdateResult {
    let erc = match &err {
        FileIntegrityError::SizeMismatch { .. } => erc_value::FILE_SIZE_MISMATCH,
        FileIntegrityError::HashMismatch { .. } => erc_value::FILE_HASH_MISMATCH,
        FileIntegrityError::UnsupportedAlgorithm(_) | FileIntegrityError::MalformedDigest { .. } => {
            erc_value::UNSUPPORTED_HASH_ALGORITHM
        }
        FileIntegrityError::Io { source, .. } => {
            dua_core::erc_errno(source.raw_os_error().unwrap_or(0))
        }
    };
    UpdateResult::failure_with_details(erc, err.to_string())
}

/// Handler phases routed through the panic guard.
#[derive(Debug, Clone, Copy)]
enum Phase {
    IsInstalled,
    Download,
    Install,
    Apply,
    Cancel,
    Backup,
    Restore,
}

/// Invoke one handler phase on its own task so a panic inside a handler is
/// converted to a component failure instead of tearing the agent down.
async fn invoke_guarded(
    handler: Arc<dyn ContentHandler>,
    context: &StepContext,
    phase: Phase,
) -> UpdateResult {
    let context = context.clone();
    let task = tokio::spawn(async move {
        match phase {
            Phase::IsInstalled => handler.is_installed(&context).await,
            Phase::Download => handler.download(&context).await,
            Phase::Install => handler.install(&context).await,
            Phase::Apply => handler.apply(&context).await,
            Phase::Cancel => handler.cancel(&context).await,
            Phase::Backup => handler.backup(&context).await,
            Phase::Restore => handler.restore(&context).await,
        }
    });
    match task.await {
        Ok(result) => result.with_discovery_sentinel(),
        Err(err) if err.is_panic() => {
            warn!(?phase, "handler panicked");
            UpdateResult::failure_with_details(
                erc_value::COMPONENT_PANIC,
                format!("handler panicked during {phase:?}"),
            )
        }
        Err(_) => UpdateResult::cancelled(),
    }
}
