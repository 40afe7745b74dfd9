// SPDX-License-Identifier: MIT OR Apache-2.0

//! The agent runtime: construction and the cooperative loop.
//!
//! One tick executes, in order: channel events already waiting, the cloud
//! operations in priority order, outbound publishes, report forwarding, and
//! a single workflow-engine step. The engine persists its snapshot before a
//! report ever reaches the channel.

use crate::adapters::{
    DownloadedPackageSource, FsDownloader, ManifestPolicy, QueueingReporter,
};
use dua_cloud::{CloudClient, WorkflowRef};
use dua_config::AgentConfig;
use dua_core::result::PostActionRequest;
use dua_handler::{ContentDownloader, DownloadHandlerRegistry, HandlerRegistry, SimulatorHandler};
use dua_mqtt::{
    ChannelConfig, ChannelEvent, MessageProperties, MqttChannel, QoS, agent_topic, service_topic,
};
use dua_retry::{OperationState, RetriableOperation, RetryParams};
use dua_rootkey::lifecycle::RotationLogic;
use dua_rootkey::{ActiveKeySet, RootKeyPackage, RootKeyStore};
use dua_workflow::engine::{Deployment, WorkflowEngine, WorkflowReport};
use dua_workflow::{DeploymentAction, EngineConfig};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shutdown signal received.
    Shutdown,
    /// A handler requires a device reboot; exit and let the service
    /// manager reboot.
    RebootRequired,
    /// A handler requires an agent restart; exit and let the service
    /// manager restart the unit.
    AgentRestartRequired,
}

impl RunOutcome {
    /// Process exit code for the service manager.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Shutdown => 0,
            Self::RebootRequired => 10,
            Self::AgentRestartRequired => 20,
        }
    }
}

/// The assembled agent.
pub struct AgentRuntime {
    config: AgentConfig,
    channel: MqttChannel,
    cloud: CloudClient,
    engine: WorkflowEngine,
    reports: mpsc::UnboundedReceiver<WorkflowReport>,
    rootkey_store: Option<RootKeyStore>,
    rootkey_rotation: Option<RetriableOperation<RotationLogic>>,
    rootkey_refreshed_at: Option<Instant>,
    service_topic: String,
    agent_topic: String,
}

impl AgentRuntime {
    /// Wire the agent from configuration and the registered handlers.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        mut handlers: HandlerRegistry,
        download_handlers: DownloadHandlerRegistry,
        downloader: Arc<dyn ContentDownloader>,
    ) -> Self {
        // The simulator ships with the agent for demo deployments.
        let simulator_type = dua_core::UpdateType::parse("microsoft/simulator:1")
            .expect("static update type parses");
        if !handlers.contains(&simulator_type) {
            handlers.register(simulator_type, SimulatorHandler::succeeding());
        }

        let retry = RetryParams {
            initial_delay: config.retry.initial_delay(),
            max_delay: config.retry.max_delay(),
            multiplier: config.retry.multiplier,
            jitter: config.retry.jitter,
            attempt_timeout: config.retry.attempt_timeout(),
            ..RetryParams::default()
        };

        let mut channel_config =
            ChannelConfig::new(config.broker.host.clone(), config.broker.port, config.device_id.clone());
        channel_config.keep_alive = Duration::from_secs(config.broker.keep_alive_secs);
        channel_config.clean_start = config.broker.clean_start;
        channel_config.reconnect = retry;
        let channel = MqttChannel::new(&channel_config);

        let cloud = CloudClient::new(config.device_properties.clone(), retry);

        let (rootkey_store, rootkey_rotation) = match &config.rootkey {
            Some(settings) => {
                let store = RootKeyStore::new(bootstrap_key_set(&settings.staging_path));
                let source = DownloadedPackageSource::new(
                    downloader.clone(),
                    settings.package_url.clone(),
                    settings.staging_path.clone(),
                );
                let rotation = RetriableOperation::new(
                    RotationLogic::new(Arc::new(source), store.clone()),
                    retry,
                );
                (Some(store), Some(rotation))
            }
            None => {
                warn!("no root-key source configured; manifests will not be verified");
                (None, None)
            }
        };
        let policy = match &rootkey_store {
            Some(store) => ManifestPolicy::Verify(store.clone()),
            None => ManifestPolicy::TrustAll,
        };

        let (reporter, reports) = QueueingReporter::new();
        let mut engine_config =
            EngineConfig::new(config.sandbox_root.clone(), config.snapshot_path.clone());
        engine_config.device_properties = config.device_properties.clone();
        let engine = WorkflowEngine::new(
            engine_config,
            Arc::new(handlers),
            Arc::new(download_handlers),
            downloader,
            Arc::new(policy),
            reporter,
        );

        let service_topic = service_topic(&config.device_id, config.instance.as_deref());
        let agent_topic = agent_topic(&config.device_id, config.instance.as_deref());

        Self {
            config,
            channel,
            cloud,
            engine,
            reports,
            rootkey_store,
            rootkey_rotation,
            rootkey_refreshed_at: None,
            service_topic,
            agent_topic,
        }
    }

    /// Runtime wired with the local-filesystem downloader.
    #[must_use]
    pub fn with_default_delivery(config: AgentConfig) -> Self {
        Self::new(
            config,
            HandlerRegistry::new(),
            DownloadHandlerRegistry::new(),
            Arc::new(FsDownloader),
        )
    }

    /// The active root-key store, when a source is configured.
    #[must_use]
    pub fn rootkey_store(&self) -> Option<&RootKeyStore> {
        self.rootkey_store.as_ref()
    }

    /// Run until shutdown or until a handler demands a reboot/restart.
    pub async fn run(mut self) -> RunOutcome {
        self.engine.recover().await;
        self.channel
            .register_subscription(self.service_topic.clone(), QoS::AtLeastOnce);
        info!(
            device = %self.config.device_id,
            service = %self.service_topic,
            agent = %self.agent_topic,
            "agent loop starting"
        );

        let mut tick = tokio::time::interval(Duration::from_millis(200));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.channel.poll() => self.handle_channel_event(event).await,
                _ = tick.tick() => {
                    if let Some(outcome) = self.tick().await {
                        return outcome;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    return RunOutcome::Shutdown;
                }
            }
        }
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) => {
                if message.topic != self.service_topic {
                    return;
                }
                let now = Instant::now();
                if let Some(deployment) = self.cloud.handle_message(&message, now).await {
                    let action = match deployment.workflow.action.as_str() {
                        "cancel" => DeploymentAction::Cancel,
                        _ => DeploymentAction::ProcessDeployment,
                    };
                    self.engine
                        .process_deployment(Deployment {
                            workflow_id: deployment.workflow.id,
                            action,
                            update_manifest: deployment.update_manifest,
                            update_manifest_signature: deployment.update_manifest_signature,
                            file_urls: deployment.file_urls,
                        })
                        .await;
                }
            }
            ChannelEvent::Connected => info!("control channel connected"),
            ChannelEvent::Disconnected => warn!("control channel lost"),
            ChannelEvent::PublishCompleted(_) | ChannelEvent::None => {}
        }
    }

    /// One cooperative tick. Returns an outcome when the loop must exit.
    async fn tick(&mut self) -> Option<RunOutcome> {
        let now = Instant::now();

        self.cloud.do_work(now).await;
        self.drive_rootkey_rotation(now).await;
        self.flush_outbound(now).await;
        self.forward_reports();

        self.engine.step().await;
        match self.engine.pending_immediate_action() {
            Some(PostActionRequest::ImmediateReboot) => return Some(RunOutcome::RebootRequired),
            Some(PostActionRequest::ImmediateAgentRestart) => {
                return Some(RunOutcome::AgentRestartRequired);
            }
            _ => {}
        }

        // Deferred requests fire once the workflow is terminal and every
        // pending report has been handed to the channel.
        let (reboot, restart) = self.engine.deferred_actions();
        if (reboot || restart) && self.workflow_settled() {
            return Some(if reboot {
                RunOutcome::RebootRequired
            } else {
                RunOutcome::AgentRestartRequired
            });
        }
        None
    }

    fn workflow_settled(&self) -> bool {
        let terminal = self
            .engine
            .tree()
            .map(|tree| tree.node(tree.root()).state.is_terminal())
            .unwrap_or(true);
        terminal && self.cloud.pending_report_count() == 0
    }

    async fn drive_rootkey_rotation(&mut self, now: Instant) {
        let Some(rotation) = &mut self.rootkey_rotation else {
            return;
        };
        let refresh = self
            .config
            .rootkey
            .as_ref()
            .map(|s| Duration::from_secs(s.refresh_interval_secs))
            .unwrap_or(Duration::from_secs(24 * 60 * 60));
        if rotation.state() == OperationState::CompletedSuccess
            && self
                .rootkey_refreshed_at
                .is_some_and(|at| now.duration_since(at) >= refresh)
        {
            rotation.reset();
            self.rootkey_refreshed_at = None;
        }
        if rotation.do_work(now).await == OperationState::CompletedSuccess {
            self.rootkey_refreshed_at.get_or_insert(now);
        }
    }

    async fn flush_outbound(&mut self, now: Instant) {
        let mut failed: VecDeque<&'static str> = VecDeque::new();
        for request in self.cloud.drain_outbound() {
            let properties =
                MessageProperties::request(request.message_type, request.correlation_data.clone());
            let result = if request.defer_when_disconnected {
                self.channel
                    .publish_or_defer(
                        &self.agent_topic,
                        request.payload,
                        QoS::AtLeastOnce,
                        false,
                        &properties,
                    )
                    .await
            } else {
                self.channel
                    .publish(
                        &self.agent_topic,
                        request.payload,
                        QoS::AtLeastOnce,
                        false,
                        &properties,
                    )
                    .await
            };
            if let Err(err) = result {
                warn!(mt = request.message_type, %err, "publish failed");
                failed.push_back(request.message_type);
            }
        }
        for message_type in failed {
            self.cloud.publish_failed(message_type, now).await;
        }
    }

    fn forward_reports(&mut self) {
        while let Ok(report) = self.reports.try_recv() {
            let workflow = WorkflowRef {
                id: report.workflow_id.clone(),
                action: "processDeployment".into(),
            };
            match serde_json::to_value(&report) {
                Ok(body) => self.cloud.enqueue_report(workflow, body),
                Err(err) => warn!(%err, "cannot serialize report"),
            }
        }
    }
}

/// Load the previously staged (already verified) package as the boot set.
fn bootstrap_key_set(staging_path: &Path) -> ActiveKeySet {
    match std::fs::read_to_string(staging_path) {
        Ok(text) => match RootKeyPackage::from_json(&text) {
            Ok(package) => {
                info!(version = package.protected.version, "root-key set restored from staging");
                ActiveKeySet::from_package(&package)
            }
            Err(err) => {
                warn!(%err, "staged root-key package unusable, starting empty");
                ActiveKeySet::default()
            }
        },
        Err(_) => ActiveKeySet::default(),
    }
}
