use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::compiler::Compiler;
use crate::devices::{ApplyOutcome, ControlTransport, DeliveryEvent, DeviceEnforcer, TelemetryUpdate};
use crate::feedback::{FeedbackConfig, FeedbackLoop};
use crate::observe::{HealthState, Observe};
use crate::parser;
use crate::shaper::{Shaper, ShaperMode};
use crate::store::{
    Intent, IntentStatus, MetricSample, Plane, Policy, PolicyKind, PolicyStatus, Store, StoreError,
};

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Parse(#[from] parser::ParseError),
    #[error(transparent)]
    Compile(#[from] crate::compiler::CompileError),
    #[error("State store unavailable: {0}")]
    Store(String),
    #[error("No such intent")]
    NotFound,
    #[error("Intent is already in a terminal state")]
    Conflict,
    #[error("Controller is degraded and not accepting submissions")]
    Degraded,
    #[error("Controller is shutting down")]
    Shutdown,
}

impl SubmitError {
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::Parse(e) => e.kind(),
            SubmitError::Compile(e) => e.kind(),
            SubmitError::Store(_) | SubmitError::Degraded => "store_unavailable",
            SubmitError::NotFound => "not_found",
            SubmitError::Conflict => "conflict",
            SubmitError::Shutdown => "shutting_down",
        }
    }
}

impl From<StoreError> for SubmitError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => SubmitError::NotFound,
            other => SubmitError::Store(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct SubmitOutcome {
    pub intent_id: Uuid,
    pub status: IntentStatus,
    pub policies: Vec<Policy>,
}

#[derive(Debug)]
pub struct IntentDetails {
    pub intent: Intent,
    pub policies: Vec<Policy>,
    pub last_metrics: Vec<MetricSample>,
}

/// The submission worker's inbox. Everything that mutates intent status
/// flows through here, so supersession and status transitions are totally
/// ordered by arrival.
pub enum Request {
    Submit {
        raw_text: String,
        submitter: String,
        parent: Option<Uuid>,
        reply: Option<tokio::sync::oneshot::Sender<Result<SubmitOutcome, SubmitError>>>,
    },
    Revoke {
        intent_id: Uuid,
        reply: tokio::sync::oneshot::Sender<Result<(), SubmitError>>,
    },
    Delivery(DeliveryEvent),
    SetIntentStatus {
        intent_id: Uuid,
        status: IntentStatus,
        reason: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub interface: String,
    pub interface_rate_bps: u64,
    pub shaper_mode: ShaperMode,
    pub data_plane_deadline: std::time::Duration,
    pub device_plane_deadline: std::time::Duration,
    pub apply_attempts: u32,
    pub device: crate::devices::DeviceEnforcerConfig,
    pub feedback: FeedbackConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            interface: "eth0".to_owned(),
            interface_rate_bps: 100_000_000,
            shaper_mode: ShaperMode::Tc,
            data_plane_deadline: std::time::Duration::from_secs(3),
            device_plane_deadline: std::time::Duration::from_secs(10),
            apply_attempts: 3,
            device: crate::devices::DeviceEnforcerConfig::default(),
            feedback: FeedbackConfig::default(),
        }
    }
}

/// The controller core: owns the store, the catalog snapshot pointer, the
/// enforcer handles, and the worker inboxes. The external surface calls the
/// operations below and nothing else.
pub struct Core {
    requests: tokio::sync::mpsc::Sender<Request>,
    store: Arc<Store>,
    observe: Arc<Observe>,
    health: Arc<HealthState>,
    pub devices: DeviceEnforcer,
    log: slog::Logger,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        store: Arc<Store>,
        catalog: Arc<Catalog>,
        transport: Arc<dyn ControlTransport>,
        telemetry_tx: tokio::sync::broadcast::Sender<TelemetryUpdate>,
        transport_connected: Arc<AtomicBool>,
        config: CoreConfig,
        observe: Arc<Observe>,
        shutdown: tokio::sync::watch::Receiver<bool>,
        log: slog::Logger,
    ) -> Result<Core, SubmitError> {
        let shaper = Shaper::new(
            &config.interface,
            config.shaper_mode,
            Arc::clone(&catalog),
            config.data_plane_deadline,
            shutdown.clone(),
            log.new(slog::o!("subsystem" => "shaper")),
        );

        // Converge the live plane with what the store believes is applied.
        let desired = store.applied_policies(Plane::DataPlane).await?;
        let report = shaper
            .reconcile(desired)
            .await
            .map_err(|e| SubmitError::Store(e.to_string()))?;
        slog::info!(log, "data plane reconciled";
            "reapplied" => report.reapplied, "removed_strays" => report.removed_strays);

        let (requests_tx, requests_rx) = tokio::sync::mpsc::channel::<Request>(64);
        let (delivery_tx, mut delivery_rx) = tokio::sync::mpsc::channel::<DeliveryEvent>(64);

        let devices = DeviceEnforcer::new(
            transport,
            Arc::clone(&store),
            Arc::clone(&catalog),
            config.device.clone(),
            telemetry_tx,
            delivery_tx,
            shutdown.clone(),
            log.new(slog::o!("subsystem" => "devices")),
        );

        // Late delivery outcomes re-enter the single-writer path as requests.
        let forward_requests = requests_tx.clone();
        tokio::task::spawn(async move {
            while let Some(event) = delivery_rx.recv().await {
                if forward_requests.send(Request::Delivery(event)).await.is_err() {
                    break;
                }
            }
        });

        let degraded = Arc::new(AtomicBool::new(false));
        let schema_version = store.schema_version().await.unwrap_or(0);
        let health = Arc::new(HealthState {
            started_at: std::time::Instant::now(),
            schema_version,
            shaper_mode: match config.shaper_mode {
                ShaperMode::Tc => "tc",
                ShaperMode::Dry => "dry",
            },
            transport_connected,
            degraded: Arc::clone(&degraded),
        });

        let worker = SubmissionWorker {
            store: Arc::clone(&store),
            catalog: Arc::clone(&catalog),
            compiler: Compiler::new(config.interface.clone(), config.interface_rate_bps),
            shaper,
            device_apply: DeviceApplyHandle::new(&devices),
            config: config.clone(),
            observe: Arc::clone(&observe),
            degraded,
            log: log.new(slog::o!("subsystem" => "submission")),
        };
        tokio::task::spawn(run_submission_worker(worker, requests_rx, shutdown.clone()));

        let feedback = FeedbackLoop::new(
            Arc::clone(&store),
            requests_tx.clone(),
            config.feedback.clone(),
            Arc::clone(&observe),
            log.new(slog::o!("subsystem" => "feedback")),
        );
        feedback.spawn(shutdown);

        Ok(Core {
            requests: requests_tx,
            store,
            observe,
            health,
            devices,
            log,
        })
    }

    pub async fn submit(
        &self,
        raw_text: &str,
        submitter: &str,
    ) -> Result<SubmitOutcome, SubmitError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.requests
            .send(Request::Submit {
                raw_text: raw_text.to_owned(),
                submitter: submitter.to_owned(),
                parent: None,
                reply: Some(reply_tx),
            })
            .await
            .or(Err(SubmitError::Shutdown))?;
        reply_rx.await.unwrap_or(Err(SubmitError::Shutdown))
    }

    pub async fn revoke_intent(&self, intent_id: Uuid) -> Result<(), SubmitError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.requests
            .send(Request::Revoke {
                intent_id,
                reply: reply_tx,
            })
            .await
            .or(Err(SubmitError::Shutdown))?;
        reply_rx.await.unwrap_or(Err(SubmitError::Shutdown))
    }

    pub async fn list_intents(
        &self,
        status: Option<IntentStatus>,
    ) -> Result<Vec<Intent>, SubmitError> {
        Ok(self.store.list_intents(status).await?)
    }

    pub async fn get_intent(&self, intent_id: Uuid) -> Result<IntentDetails, SubmitError> {
        let intent = self.store.get_intent(intent_id).await?;
        let policies = self.store.policies_for_intent(intent_id).await?;
        let mut last_metrics = Vec::new();
        for policy in policies.iter().filter(|p| p.plane == Plane::Device) {
            last_metrics.extend(
                self.store
                    .recent_metrics_for_device(&policy.target, 5)
                    .await?,
            );
        }
        if let Some(device_id) = intent.goal.as_ref().and_then(|g| g.device_id.clone()) {
            last_metrics.extend(self.store.recent_metrics_for_device(&device_id, 5).await?);
        }
        Ok(IntentDetails {
            intent,
            policies,
            last_metrics,
        })
    }

    pub async fn list_policies(&self, plane: Option<Plane>) -> Result<Vec<Policy>, SubmitError> {
        Ok(self.store.list_policies(plane).await?)
    }

    pub fn health(&self) -> serde_json::Value {
        self.health.summary()
    }

    pub fn health_state(&self) -> Arc<HealthState> {
        Arc::clone(&self.health)
    }

    pub fn observe(&self) -> Arc<Observe> {
        Arc::clone(&self.observe)
    }

    /// The handle the feedback loop and external surface submit through.
    pub fn request_channel(&self) -> tokio::sync::mpsc::Sender<Request> {
        self.requests.clone()
    }

    pub fn logger(&self) -> &slog::Logger {
        &self.log
    }
}

// A cloneable device-plane apply facade for the submission worker.
struct DeviceApplyHandle {
    inbox: tokio::sync::mpsc::Sender<crate::devices::Message>,
}

impl DeviceApplyHandle {
    fn new(devices: &DeviceEnforcer) -> DeviceApplyHandle {
        DeviceApplyHandle {
            inbox: devices.input_channel(),
        }
    }

    async fn apply(&self, policy: Policy) -> Result<ApplyOutcome, crate::devices::DeviceError> {
        let (out_channel, result) = tokio::sync::oneshot::channel();
        self.inbox
            .send(crate::devices::Message::Apply {
                policy,
                out_channel,
            })
            .await
            .or(Err(crate::devices::DeviceError::CommunicationError))?;
        result
            .await
            .unwrap_or(Err(crate::devices::DeviceError::CommunicationError))
    }
}

struct SubmissionWorker {
    store: Arc<Store>,
    catalog: Arc<Catalog>,
    compiler: Compiler,
    shaper: Shaper,
    device_apply: DeviceApplyHandle,
    config: CoreConfig,
    observe: Arc<Observe>,
    degraded: Arc<AtomicBool>,
    log: slog::Logger,
}

async fn run_submission_worker(
    worker: SubmissionWorker,
    mut requests: tokio::sync::mpsc::Receiver<Request>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        match request {
            Request::Submit {
                raw_text,
                submitter,
                parent,
                reply,
            } => {
                let result = worker.handle_submit(&raw_text, &submitter, parent).await;
                if let Err(e) = &result {
                    slog::info!(worker.log, "submission rejected";
                        "kind" => e.kind(), "error" => e.to_string(), "text" => &raw_text);
                    worker.observe.submissions_rejected.inc();
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Request::Revoke { intent_id, reply } => {
                let _ = reply.send(worker.handle_revoke(intent_id).await);
            }
            Request::Delivery(event) => {
                worker.handle_delivery(event).await;
            }
            Request::SetIntentStatus {
                intent_id,
                status,
                reason,
            } => {
                worker.handle_status_update(intent_id, status, reason).await;
            }
        }
    }
    slog::debug!(worker.log, "submission worker exiting");
}

impl SubmissionWorker {
    async fn handle_submit(
        &self,
        raw_text: &str,
        submitter: &str,
        parent: Option<Uuid>,
    ) -> Result<SubmitOutcome, SubmitError> {
        if self.degraded.load(Ordering::Relaxed) {
            // Re-probe the store before rejecting outright.
            match self.store.schema_version().await {
                Ok(_) => self.degraded.store(false, Ordering::Relaxed),
                Err(_) => return Err(SubmitError::Degraded),
            }
        }

        let snapshot = self.catalog.snapshot();
        let parsed = parser::parse(&snapshot, raw_text)?;
        let intent_id = Uuid::now_v7();
        let compiled = self.compiler.compile(&snapshot, intent_id, &parsed)?;

        // Corrective intents are a mechanism, not a desire: the parent keeps
        // the goal under evaluation.
        let goal = if parent.is_some() {
            None
        } else {
            compiled.goal
        };

        let mut policies = compiled.policies;
        let displaced = self.scan_conflicts(intent_id, &mut policies).await?;

        let now = Utc::now();
        let intent = Intent {
            id: intent_id,
            raw_text: raw_text.to_owned(),
            parsed,
            goal,
            status: IntentStatus::Compiled,
            submitter: submitter.to_owned(),
            parent_id: parent,
            superseded_by: None,
            warning: None,
            submitted_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.create_intent(&intent, &policies).await {
            self.degraded.store(true, Ordering::Relaxed);
            return Err(SubmitError::Store(e.to_string()));
        }
        self.observe.intents_submitted.inc();
        self.store.ensure_user(submitter).await.ok();

        self.displace(intent_id, parent, displaced).await;
        let status = self.apply_policies(intent_id, &policies).await?;

        Ok(SubmitOutcome {
            intent_id,
            status,
            policies: self.store.policies_for_intent(intent_id).await?,
        })
    }

    /// Find live policies holding any of the new policies' keys, and resolve
    /// competing netem delays to the minimum.
    async fn scan_conflicts(
        &self,
        intent_id: Uuid,
        policies: &mut [Policy],
    ) -> Result<Vec<Policy>, SubmitError> {
        let mut displaced = Vec::new();
        for policy in policies.iter_mut() {
            let conflicts = self
                .store
                .live_conflicts(&policy.conflict_key, intent_id)
                .await?;
            for old in conflicts {
                if policy.kind == PolicyKind::NetemDelay && old.kind == PolicyKind::NetemDelay {
                    let old_delay = old
                        .parameters
                        .get("effective_delay_ms")
                        .or_else(|| old.parameters.get("delay_ms"))
                        .and_then(|v| v.as_u64());
                    let new_delay = policy.parameters.get("delay_ms").and_then(|v| v.as_u64());
                    if let (Some(old_delay), Some(new_delay)) = (old_delay, new_delay) {
                        if old_delay < new_delay {
                            policy.parameters["effective_delay_ms"] =
                                serde_json::json!(old_delay);
                        }
                    }
                }
                displaced.push(old);
            }
        }
        Ok(displaced)
    }

    /// Roll displaced claims out of the plane and mark their owners
    /// superseded, before anything new is applied.
    async fn displace(&self, successor: Uuid, parent: Option<Uuid>, displaced: Vec<Policy>) {
        let mut superseded_intents = std::collections::HashSet::new();
        for old in displaced {
            if old.plane == Plane::DataPlane {
                if let Err(e) = self.shaper.rollback(old.clone()).await {
                    slog::warn!(self.log, "rollback of displaced policy failed";
                        "policy" => old.id.to_string(), "error" => e.to_string());
                }
            }
            if Some(old.intent_id) == parent {
                // A feedback correction replaces its parent's policy but the
                // parent intent itself stays under evaluation.
                if let Err(e) = self.store.roll_back_policy(old.id).await {
                    slog::error!(self.log, "unable to roll back displaced policy";
                        "error" => e.to_string());
                }
            } else if superseded_intents.insert(old.intent_id) {
                if let Err(e) = self.store.supersede_intent(old.intent_id, successor).await {
                    slog::error!(self.log, "unable to supersede intent";
                        "intent" => old.intent_id.to_string(), "error" => e.to_string());
                }
            }
        }
    }

    /// Apply in declared order; the next policy starts only when the
    /// previous one has reported applied or failed.
    async fn apply_policies(
        &self,
        intent_id: Uuid,
        policies: &[Policy],
    ) -> Result<IntentStatus, SubmitError> {
        let mut warning: Option<String> = None;
        let mut any_failed = false;

        for policy in policies {
            let result = match policy.plane {
                Plane::DataPlane => self.apply_data_plane(policy).await,
                Plane::Device => self.apply_device_plane(policy).await,
            };
            match result {
                Ok(PolicyStatus::Applied) => {
                    self.store
                        .set_policy_status(policy.id, PolicyStatus::Applied, None)
                        .await?;
                    self.observe.policies_applied.inc();
                }
                Ok(PolicyStatus::PendingDelivery) => {
                    self.store
                        .set_policy_status(policy.id, PolicyStatus::PendingDelivery, None)
                        .await?;
                    warning = Some("one or more policies await device delivery".to_owned());
                }
                Ok(other) => {
                    let message = format!("unexpected apply outcome {}", other.as_str());
                    self.store
                        .set_policy_status(policy.id, PolicyStatus::Failed, Some(&message))
                        .await?;
                    self.observe.policies_failed.inc();
                    any_failed = true;
                }
                Err(message) => {
                    slog::warn!(self.log, "policy failed to apply";
                        "policy" => policy.id.to_string(), "error" => &message);
                    self.store
                        .set_policy_status(policy.id, PolicyStatus::Failed, Some(&message))
                        .await?;
                    self.observe.policies_failed.inc();
                    any_failed = true;
                }
            }
        }

        let status = if any_failed {
            IntentStatus::Violated
        } else {
            IntentStatus::Applied
        };
        self.store.set_intent_status(intent_id, status).await?;
        if let Some(warning) = &warning {
            self.store
                .set_intent_warning(intent_id, Some(warning))
                .await?;
        }
        Ok(status)
    }

    async fn apply_data_plane(&self, policy: &Policy) -> Result<PolicyStatus, String> {
        let mut last_error = String::new();
        for attempt in 0..self.config.apply_attempts {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(100 << attempt)).await;
            }
            match tokio::time::timeout(
                self.config.data_plane_deadline,
                self.shaper.apply(policy.clone()),
            )
            .await
            {
                Ok(Ok(())) => return Ok(PolicyStatus::Applied),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "timeout".to_owned(),
            }
        }
        Err(last_error)
    }

    async fn apply_device_plane(&self, policy: &Policy) -> Result<PolicyStatus, String> {
        match tokio::time::timeout(
            self.config.device_plane_deadline,
            self.device_apply.apply(policy.clone()),
        )
        .await
        {
            Ok(Ok(ApplyOutcome::Applied)) => Ok(PolicyStatus::Applied),
            Ok(Ok(ApplyOutcome::PendingDelivery)) => Ok(PolicyStatus::PendingDelivery),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timeout".to_owned()),
        }
    }

    async fn handle_revoke(&self, intent_id: Uuid) -> Result<(), SubmitError> {
        let intent = self.store.get_intent(intent_id).await?;
        if intent.status.is_terminal() {
            return Err(SubmitError::Conflict);
        }
        let policies = self.store.policies_for_intent(intent_id).await?;
        for policy in policies.iter().filter(|p| p.status.is_live()) {
            if policy.plane == Plane::DataPlane {
                if let Err(e) = self.shaper.rollback(policy.clone()).await {
                    slog::warn!(self.log, "rollback failed during revoke";
                        "policy" => policy.id.to_string(), "error" => e.to_string());
                }
            }
            self.store
                .set_policy_status(policy.id, PolicyStatus::RolledBack, None)
                .await?;
        }
        self.store
            .set_intent_status(intent_id, IntentStatus::Revoked)
            .await?;
        Ok(())
    }

    async fn handle_delivery(&self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::Delivered {
                policy_id,
                intent_id,
            } => {
                slog::info!(self.log, "parked policy delivered";
                    "policy" => policy_id.to_string());
                self.observe.policies_applied.inc();
                let remaining = self
                    .store
                    .policies_for_intent(intent_id)
                    .await
                    .map(|ps| {
                        ps.iter()
                            .filter(|p| p.status == PolicyStatus::PendingDelivery)
                            .count()
                    })
                    .unwrap_or(0);
                if remaining == 0 {
                    if let Err(e) = self.store.set_intent_warning(intent_id, None).await {
                        slog::warn!(self.log, "unable to clear intent warning"; "error" => e.to_string());
                    }
                }
            }
            DeliveryEvent::Failed {
                policy_id,
                intent_id,
                error,
            } => {
                slog::warn!(self.log, "parked policy failed to deliver";
                    "policy" => policy_id.to_string(), "error" => &error);
                self.observe.policies_failed.inc();
                if let Err(e) = self
                    .store
                    .set_intent_status(intent_id, IntentStatus::Violated)
                    .await
                {
                    slog::warn!(self.log, "unable to mark intent violated"; "error" => e.to_string());
                }
            }
        }
    }

    async fn handle_status_update(
        &self,
        intent_id: Uuid,
        status: IntentStatus,
        reason: &'static str,
    ) {
        let current = match self.store.get_intent(intent_id).await {
            Ok(intent) => intent,
            Err(_) => return,
        };
        // Terminal states are never overwritten by feedback.
        if current.status.is_terminal() {
            return;
        }
        slog::info!(self.log, "intent status transition";
            "intent" => intent_id.to_string(), "to" => status.as_str(), "reason" => reason);
        if let Err(e) = self.store.set_intent_status(intent_id, status).await {
            slog::error!(self.log, "unable to update intent status"; "error" => e.to_string());
        }
    }
}
