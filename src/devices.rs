use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::store::{MetricSample, Plane, Policy, PolicyKind, PolicyStatus, Store};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Lost communication with device worker")]
    CommunicationError,
    #[error("Transport publish failed: {0}")]
    TransportError(String),
    #[error("No telemetry reflected the change within the ack window")]
    AckTimeout,
    #[error("Device '{0}' is not in the catalog")]
    UnknownDevice(String),
    #[error("Policy kind {0} does not belong to the device plane")]
    WrongPlane(String),
    #[error("Failed to encode control message: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

/// How the enforcer reaches endpoints. The production implementation wraps
/// the MQTT client; tests substitute a recording transport.
#[async_trait]
pub trait ControlTransport: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), DeviceError>;
}

pub struct MqttTransport {
    client: rumqttc::AsyncClient,
}

impl MqttTransport {
    pub fn new(client: rumqttc::AsyncClient) -> MqttTransport {
        MqttTransport { client }
    }
}

#[async_trait]
impl ControlTransport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), DeviceError> {
        // Control messages ride the at-least-once tier.
        self.client
            .publish(topic, rumqttc::QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| DeviceError::TransportError(e.to_string()))
    }
}

/// Inbound traffic from the bus, already lowered out of the transport
/// callback context onto a bounded queue.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Telemetry {
        device_id: String,
        payload: serde_json::Value,
    },
    Status {
        device_id: String,
        online: bool,
    },
    Reconnected,
}

/// Telemetry fan-out to workers waiting on an acknowledgement.
#[derive(Debug, Clone)]
pub struct TelemetryUpdate {
    pub device_id: String,
    pub payload: serde_json::Value,
}

/// Notifications the submission worker needs for intent bookkeeping after
/// asynchronous late deliveries.
#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    Delivered { policy_id: Uuid, intent_id: Uuid },
    Failed { policy_id: Uuid, intent_id: Uuid, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    PendingDelivery,
}

#[derive(Debug, Clone)]
pub struct DeviceEnforcerConfig {
    pub ack_window: std::time::Duration,
    pub max_attempts: u32,
    pub retry_backoff: std::time::Duration,
}

impl Default for DeviceEnforcerConfig {
    fn default() -> Self {
        DeviceEnforcerConfig {
            ack_window: std::time::Duration::from_secs(5),
            max_attempts: 3,
            retry_backoff: std::time::Duration::from_millis(500),
        }
    }
}

/// Handle to the device-plane dispatcher. One logical queue per device,
/// serialized per device and parallel across devices.
#[derive(Debug)]
pub struct DeviceEnforcer {
    dispatch_channel: tokio::sync::mpsc::Sender<Message>,
    log: slog::Logger,
}

pub enum Message {
    Apply {
        policy: Policy,
        out_channel: tokio::sync::oneshot::Sender<Result<ApplyOutcome, DeviceError>>,
    },
    DeviceStatus {
        device_id: String,
        online: bool,
    },
    /// Re-verify every applied device policy, e.g. after a reconnect.
    Reverify,
}

impl DeviceEnforcer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn ControlTransport>,
        store: Arc<Store>,
        catalog: Arc<Catalog>,
        config: DeviceEnforcerConfig,
        telemetry_tx: tokio::sync::broadcast::Sender<TelemetryUpdate>,
        delivery_tx: tokio::sync::mpsc::Sender<DeliveryEvent>,
        shutdown: tokio::sync::watch::Receiver<bool>,
        log: slog::Logger,
    ) -> DeviceEnforcer {
        let (sender, receiver) = tokio::sync::mpsc::channel(64);
        let local_logger = log.clone();
        tokio::task::spawn(async move {
            dispatch_device_work(
                receiver,
                transport,
                store,
                catalog,
                config,
                telemetry_tx,
                delivery_tx,
                shutdown,
                log,
            )
            .await;
        });
        DeviceEnforcer {
            dispatch_channel: sender,
            log: local_logger,
        }
    }

    pub async fn apply(&self, policy: Policy) -> Result<ApplyOutcome, DeviceError> {
        let (out_channel, result) = tokio::sync::oneshot::channel();
        self.dispatch_channel
            .send(Message::Apply {
                policy,
                out_channel,
            })
            .await
            .or(Err(DeviceError::CommunicationError))?;
        result.await.unwrap_or_else(|e| {
            slog::error!(self.log, "failed to receive device worker result"; "error" => e.to_string());
            Err(DeviceError::CommunicationError)
        })
    }

    pub fn input_channel(&self) -> tokio::sync::mpsc::Sender<Message> {
        self.dispatch_channel.clone()
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_device_work(
    mut chan: tokio::sync::mpsc::Receiver<Message>,
    transport: Arc<dyn ControlTransport>,
    store: Arc<Store>,
    catalog: Arc<Catalog>,
    config: DeviceEnforcerConfig,
    telemetry_tx: tokio::sync::broadcast::Sender<TelemetryUpdate>,
    delivery_tx: tokio::sync::mpsc::Sender<DeliveryEvent>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    log: slog::Logger,
) {
    let mut directory: HashMap<String, tokio::sync::mpsc::Sender<WorkerMessage>> = HashMap::new();
    let mut online: HashSet<String> = HashSet::new();

    loop {
        let message = tokio::select! {
            message = chan.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match message {
            Message::Apply {
                policy,
                out_channel,
            } => {
                let device_id = policy.target.clone();
                let worker = ensure_worker(
                    &mut directory,
                    &device_id,
                    online.contains(&device_id),
                    &transport,
                    &store,
                    &catalog,
                    &config,
                    &telemetry_tx,
                    &delivery_tx,
                    &log,
                );
                worker
                    .send(WorkerMessage::Apply {
                        policy,
                        out_channel,
                    })
                    .await
                    .unwrap_or_else(
                        |e| slog::error!(log, "Failed to dispatch"; "error" => e.to_string()),
                    );
            }
            Message::DeviceStatus { device_id, online: is_online } => {
                slog::info!(log, "device status changed";
                    "device" => &device_id, "online" => is_online);
                if is_online {
                    online.insert(device_id.clone());
                } else {
                    online.remove(&device_id);
                }
                let worker = ensure_worker(
                    &mut directory,
                    &device_id,
                    is_online,
                    &transport,
                    &store,
                    &catalog,
                    &config,
                    &telemetry_tx,
                    &delivery_tx,
                    &log,
                );
                worker
                    .send(WorkerMessage::Online(is_online))
                    .await
                    .unwrap_or_else(
                        |e| slog::error!(log, "Failed to dispatch"; "error" => e.to_string()),
                    );
            }
            Message::Reverify => {
                let applied = match store.applied_policies(Plane::Device).await {
                    Ok(applied) => applied,
                    Err(e) => {
                        slog::error!(log, "unable to read applied device policies"; "error" => e.to_string());
                        continue;
                    }
                };
                for policy in applied {
                    let device_id = policy.target.clone();
                    let worker = ensure_worker(
                        &mut directory,
                        &device_id,
                        online.contains(&device_id),
                        &transport,
                        &store,
                        &catalog,
                        &config,
                        &telemetry_tx,
                        &delivery_tx,
                        &log,
                    );
                    worker
                        .send(WorkerMessage::Reverify { policy })
                        .await
                        .unwrap_or_else(
                            |e| slog::error!(log, "Failed to dispatch"; "error" => e.to_string()),
                        );
                }
            }
        }
    }
    slog::debug!(log, "device dispatcher exiting");
}

#[allow(clippy::too_many_arguments)]
fn ensure_worker(
    directory: &mut HashMap<String, tokio::sync::mpsc::Sender<WorkerMessage>>,
    device_id: &str,
    online: bool,
    transport: &Arc<dyn ControlTransport>,
    store: &Arc<Store>,
    catalog: &Arc<Catalog>,
    config: &DeviceEnforcerConfig,
    telemetry_tx: &tokio::sync::broadcast::Sender<TelemetryUpdate>,
    delivery_tx: &tokio::sync::mpsc::Sender<DeliveryEvent>,
    log: &slog::Logger,
) -> tokio::sync::mpsc::Sender<WorkerMessage> {
    if let Some(sender) = directory.get(device_id) {
        return sender.clone();
    }
    let (worker_chan_send, worker_chan_recv) = tokio::sync::mpsc::channel(32);
    let worker_log = log.new(slog::o!("device" => device_id.to_owned()));
    let worker = DeviceWorker {
        device_id: device_id.to_owned(),
        online,
        transport: Arc::clone(transport),
        store: Arc::clone(store),
        catalog: Arc::clone(catalog),
        config: config.clone(),
        telemetry_rx: telemetry_tx.subscribe(),
        delivery_tx: delivery_tx.clone(),
        log: worker_log,
    };
    directory.insert(device_id.to_owned(), worker_chan_send.clone());
    tokio::task::spawn(async move {
        worker.run(worker_chan_recv).await;
    });
    worker_chan_send
}

#[derive(Debug)]
enum WorkerMessage {
    Apply {
        policy: Policy,
        out_channel: tokio::sync::oneshot::Sender<Result<ApplyOutcome, DeviceError>>,
    },
    Online(bool),
    Reverify {
        policy: Policy,
    },
}

struct DeviceWorker {
    device_id: String,
    online: bool,
    transport: Arc<dyn ControlTransport>,
    store: Arc<Store>,
    catalog: Arc<Catalog>,
    config: DeviceEnforcerConfig,
    telemetry_rx: tokio::sync::broadcast::Receiver<TelemetryUpdate>,
    delivery_tx: tokio::sync::mpsc::Sender<DeliveryEvent>,
    log: slog::Logger,
}

impl DeviceWorker {
    async fn run(mut self, mut chan: tokio::sync::mpsc::Receiver<WorkerMessage>) {
        while let Some(message) = chan.recv().await {
            match message {
                WorkerMessage::Apply {
                    policy,
                    out_channel,
                } => {
                    let result = if self.online {
                        match self.publish_and_confirm(&policy).await {
                            Ok(()) => Ok(ApplyOutcome::Applied),
                            Err(DeviceError::TransportError(e)) => {
                                // The bus itself is unavailable; park the
                                // policy for redelivery instead of failing it.
                                slog::warn!(self.log, "transport unavailable, parking policy";
                                    "policy" => policy.id.to_string(), "error" => e);
                                Ok(ApplyOutcome::PendingDelivery)
                            }
                            Err(e) => Err(e),
                        }
                    } else {
                        slog::info!(self.log, "device offline, parking policy";
                            "policy" => policy.id.to_string());
                        Ok(ApplyOutcome::PendingDelivery)
                    };
                    out_channel.send(result).unwrap_or_else(|_| {
                        slog::error!(self.log, "apply requester went away");
                    });
                }
                WorkerMessage::Online(online) => {
                    self.online = online;
                    if online {
                        self.deliver_parked().await;
                    }
                }
                WorkerMessage::Reverify { policy } => {
                    if !self.online {
                        continue;
                    }
                    if let Err(e) = self.publish_and_confirm(&policy).await {
                        slog::warn!(self.log, "re-verification failed";
                            "policy" => policy.id.to_string(), "error" => e.to_string());
                    }
                }
            }
        }
        slog::debug!(self.log, "Shutting down worker {}", self.device_id);
    }

    /// Drain pending_delivery policies after a birth announcement.
    async fn deliver_parked(&mut self) {
        let parked = match self.store.pending_delivery_policies(&self.device_id).await {
            Ok(parked) => parked,
            Err(e) => {
                slog::error!(self.log, "unable to read parked policies"; "error" => e.to_string());
                return;
            }
        };
        for policy in parked {
            match self.publish_and_confirm(&policy).await {
                Ok(()) => {
                    if let Err(e) = self
                        .store
                        .set_policy_status(policy.id, PolicyStatus::Applied, None)
                        .await
                    {
                        slog::error!(self.log, "unable to mark policy applied"; "error" => e.to_string());
                        continue;
                    }
                    let _ = self
                        .delivery_tx
                        .send(DeliveryEvent::Delivered {
                            policy_id: policy.id,
                            intent_id: policy.intent_id,
                        })
                        .await;
                }
                Err(DeviceError::TransportError(e)) => {
                    // Still parked; it will be retried on the next online or
                    // reconnect event.
                    slog::warn!(self.log, "transport unavailable during redelivery"; "error" => e);
                }
                Err(e) => {
                    let _ = self
                        .store
                        .set_policy_status(policy.id, PolicyStatus::Failed, Some(&e.to_string()))
                        .await;
                    let _ = self
                        .delivery_tx
                        .send(DeliveryEvent::Failed {
                            policy_id: policy.id,
                            intent_id: policy.intent_id,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    /// Publish the control message, then wait for a telemetry sample that
    /// reflects the change. Retries with exponential backoff.
    async fn publish_and_confirm(&mut self, policy: &Policy) -> Result<(), DeviceError> {
        let snapshot = self.catalog.snapshot();
        let device = snapshot
            .lookup_device(&self.device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(self.device_id.clone()))?;
        let message = control_message(policy)?;
        let payload = serde_json::to_vec(&message)?;
        let expects_reflection = message
            .as_object()
            .map(|o| o.len() > 1)
            .unwrap_or(false);

        let mut backoff = self.config.retry_backoff;
        let mut last_error = DeviceError::AckTimeout;
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            slog::debug!(self.log, "publishing control message";
                "topic" => &device.control_topic, "attempt" => attempt + 1);
            if let Err(e) = self
                .transport
                .publish(&device.control_topic, payload.clone())
                .await
            {
                last_error = e;
                continue;
            }
            if !expects_reflection {
                return Ok(());
            }
            if self.await_reflection(policy).await {
                return Ok(());
            }
            last_error = DeviceError::AckTimeout;
        }
        Err(last_error)
    }

    async fn await_reflection(&mut self, policy: &Policy) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.ack_window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, self.telemetry_rx.recv()).await {
                Ok(Ok(update)) => {
                    if update.device_id == self.device_id
                        && reflects_parameters(&update.payload, &policy.parameters)
                    {
                        return true;
                    }
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped))) => {
                    slog::warn!(self.log, "telemetry listener lagged"; "skipped" => skipped);
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return false,
                Err(_) => return false,
            }
        }
    }
}

/// The wire shape on the control topic: the policy parameters verbatim plus
/// a command derived from the policy kind.
pub fn control_message(policy: &Policy) -> Result<serde_json::Value, DeviceError> {
    if policy.plane != Plane::Device {
        return Err(DeviceError::WrongPlane(policy.kind.as_str().to_owned()));
    }
    let command = match policy.kind {
        PolicyKind::MqttQos => "SET_MQTT_QOS".to_owned(),
        PolicyKind::DeviceControl => {
            let parameter = policy
                .conflict_key
                .rsplit(':')
                .next()
                .unwrap_or_default();
            match parameter {
                "sampling_interval_ms" => "SET_SAMPLING_INTERVAL".to_owned(),
                "audio_gain" => "SET_AUDIO_GAIN".to_owned(),
                "resolution" => "SET_CAMERA_RESOLUTION".to_owned(),
                "framerate" => "SET_CAMERA_FRAMERATE".to_owned(),
                "quality" => "SET_CAMERA_QUALITY".to_owned(),
                "enabled" => "SET_ENABLED".to_owned(),
                "power_saving" => "SET_POWER_SAVING".to_owned(),
                "secure_mode" => "SET_SECURE_MODE".to_owned(),
                "reset" => "RESET".to_owned(),
                other => format!("SET_{}", other.to_uppercase()),
            }
        }
        other => return Err(DeviceError::WrongPlane(other.as_str().to_owned())),
    };

    let mut message = policy.parameters.clone();
    if !message.is_object() {
        message = serde_json::json!({});
    }
    message["command"] = serde_json::Value::String(command);
    Ok(message)
}

// A telemetry payload reflects a policy when every control parameter appears
// with the requested value. Numbers compare numerically so 30000 matches
// 30000.0.
fn reflects_parameters(payload: &serde_json::Value, parameters: &serde_json::Value) -> bool {
    let parameters = match parameters.as_object() {
        Some(parameters) => parameters,
        None => return true,
    };
    parameters.iter().all(|(key, expected)| {
        payload
            .get(key)
            .map(|observed| values_match(observed, expected))
            .unwrap_or(false)
    })
}

fn values_match(observed: &serde_json::Value, expected: &serde_json::Value) -> bool {
    match (observed.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() < 1e-9,
        _ => observed == expected,
    }
}

/// Pump the MQTT event loop: push inbound publishes onto the bounded event
/// queue, resubscribe and flag re-verification on every (re)connect.
pub fn spawn_event_pump(
    client: rumqttc::AsyncClient,
    mut event_loop: rumqttc::EventLoop,
    catalog: Arc<Catalog>,
    status_topic: String,
    inbound_tx: tokio::sync::mpsc::Sender<InboundEvent>,
    connected: Arc<AtomicBool>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    log: slog::Logger,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(async move {
        let mut ever_connected = false;
        loop {
            let event = tokio::select! {
                event = event_loop.poll() => event,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            match event {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    connected.store(true, Ordering::Relaxed);
                    let snapshot = catalog.snapshot();
                    let mut topics: Vec<String> =
                        snapshot.devices().map(|d| d.telemetry_topic.clone()).collect();
                    topics.push(status_topic.clone());
                    for topic in topics {
                        if let Err(e) = client
                            .subscribe(&topic, rumqttc::QoS::AtLeastOnce)
                            .await
                        {
                            slog::error!(log, "subscribe failed"; "topic" => topic, "error" => e.to_string());
                        }
                    }
                    if ever_connected {
                        slog::info!(log, "transport reconnected, re-verifying applied policies");
                        let _ = inbound_tx.send(InboundEvent::Reconnected).await;
                    }
                    ever_connected = true;
                }
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                    if let Some(event) = classify_publish(
                        &catalog,
                        &publish.topic,
                        &publish.payload,
                        &log,
                    ) {
                        if inbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    connected.store(false, Ordering::Relaxed);
                    slog::warn!(log, "transport connection error, backing off"; "error" => e.to_string());
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }
        slog::debug!(log, "event pump exiting");
    })
}

fn classify_publish(
    catalog: &Catalog,
    topic: &str,
    payload: &bytes::Bytes,
    log: &slog::Logger,
) -> Option<InboundEvent> {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            slog::debug!(log, "discarding unparseable message"; "topic" => topic, "error" => e.to_string());
            return None;
        }
    };

    let snapshot = catalog.snapshot();
    if let Some(device) = snapshot.device_by_telemetry_topic(topic) {
        return Some(InboundEvent::Telemetry {
            device_id: device.id.clone(),
            payload: value,
        });
    }

    // Anything else is a status announcement; the device names itself in the
    // payload.
    let device_id = value.get("device_id")?.as_str()?.to_owned();
    let online = value.get("status")?.as_str()? == "online";
    Some(InboundEvent::Status { device_id, online })
}

/// Route inbound events: samples into the store, telemetry to ack waiters,
/// status and reconnect notices to the device dispatcher.
pub fn spawn_inbound_router(
    mut inbound_rx: tokio::sync::mpsc::Receiver<InboundEvent>,
    store: Arc<Store>,
    telemetry_tx: tokio::sync::broadcast::Sender<TelemetryUpdate>,
    dispatcher: tokio::sync::mpsc::Sender<Message>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    log: slog::Logger,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(async move {
        loop {
            let event = tokio::select! {
                event = inbound_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            match event {
                InboundEvent::Telemetry { device_id, payload } => {
                    for sample in telemetry_samples(&device_id, &payload) {
                        if let Err(e) = store.append_metric(&sample).await {
                            slog::warn!(log, "failed to append metric"; "error" => e.to_string());
                        }
                    }
                    let _ = telemetry_tx.send(TelemetryUpdate { device_id, payload });
                }
                InboundEvent::Status { device_id, online } => {
                    let _ = dispatcher
                        .send(Message::DeviceStatus { device_id, online })
                        .await;
                }
                InboundEvent::Reconnected => {
                    let _ = dispatcher.send(Message::Reverify).await;
                }
            }
        }
        slog::debug!(log, "inbound router exiting");
    })
}

/// Every numeric field of a telemetry message becomes a sample named after
/// the field. The device's own timestamp is honored when present so replays
/// dedup in the store.
pub fn telemetry_samples(device_id: &str, payload: &serde_json::Value) -> Vec<MetricSample> {
    let object = match payload.as_object() {
        Some(object) => object,
        None => return Vec::new(),
    };
    let timestamp = object
        .get("timestamp")
        .and_then(|t| t.as_i64())
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
        .unwrap_or_else(Utc::now);

    object
        .iter()
        .filter(|(key, _)| *key != "timestamp" && *key != "device_id")
        .filter_map(|(key, value)| {
            value.as_f64().map(|value| MetricSample {
                metric_name: key.clone(),
                device_id: Some(device_id.to_owned()),
                value,
                timestamp,
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::tests::test_snapshot;
    use crate::compiler::Compiler;
    use crate::parser::parse;
    use tokio::sync::Mutex;

    pub(crate) struct FakeTransport {
        pub published: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Arc<FakeTransport> {
            Arc::new(FakeTransport {
                published: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ControlTransport for FakeTransport {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), DeviceError> {
            let value = serde_json::from_slice(&payload)?;
            self.published.lock().await.push((topic.to_owned(), value));
            Ok(())
        }
    }

    fn compile_device_policy(text: &str) -> Policy {
        let snapshot = test_snapshot();
        let parsed = parse(&snapshot, text).unwrap();
        let compiled = Compiler::new("eth0".to_owned(), 100_000_000)
            .compile(&snapshot, Uuid::now_v7(), &parsed)
            .unwrap();
        compiled
            .policies
            .into_iter()
            .find(|p| p.plane == Plane::Device)
            .unwrap()
    }

    #[test]
    fn control_message_derives_command_from_kind() {
        let policy = compile_device_policy("set sampling interval to 30s for esp32-mhz19-1");
        let message = control_message(&policy).unwrap();
        assert_eq!(message["command"], "SET_SAMPLING_INTERVAL");
        assert_eq!(message["sampling_interval_ms"], 30000);

        let policy = compile_device_policy("set audio gain to 3.5 for esp32-audio-1");
        let message = control_message(&policy).unwrap();
        assert_eq!(message["command"], "SET_AUDIO_GAIN");
        assert_eq!(message["audio_gain"], 3.5);

        let policy = compile_device_policy("set camera resolution to vga for esp32-cam-1");
        let message = control_message(&policy).unwrap();
        assert_eq!(message["command"], "SET_CAMERA_RESOLUTION");
        assert_eq!(message["resolution"], "vga");

        let policy = compile_device_policy("set qos to 2 for esp32-mhz19-1");
        let message = control_message(&policy).unwrap();
        assert_eq!(message["command"], "SET_MQTT_QOS");
        assert_eq!(message["qos"], 2);
    }

    #[test]
    fn reflection_compares_numbers_numerically() {
        let parameters = serde_json::json!({"sampling_interval_ms": 30000});
        let payload = serde_json::json!({
            "device_id": "esp32-mhz19-1",
            "timestamp": 1700000000,
            "sampling_interval_ms": 30000.0,
            "co2_ppm": 420.0,
        });
        assert!(reflects_parameters(&payload, &parameters));

        let stale = serde_json::json!({
            "device_id": "esp32-mhz19-1",
            "sampling_interval_ms": 60000.0,
        });
        assert!(!reflects_parameters(&stale, &parameters));
    }

    #[test]
    fn telemetry_samples_extract_numeric_fields_with_device_stamp() {
        let payload = serde_json::json!({
            "device_id": "sensor-01",
            "timestamp": 1700000000,
            "latency_ms": 40.0,
            "status_note": "ok",
        });
        let samples = telemetry_samples("sensor-01", &payload);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].metric_name, "latency_ms");
        assert_eq!(samples[0].value, 40.0);
        assert_eq!(samples[0].timestamp, Utc.timestamp_opt(1700000000, 0).unwrap());
    }

    #[tokio::test]
    async fn offline_device_parks_policy_in_pending_delivery() {
        let transport = FakeTransport::new();
        let store = Arc::new(crate::store::tests::test_store().await);
        let catalog = test_catalog();
        let (telemetry_tx, _) = tokio::sync::broadcast::channel(16);
        let (delivery_tx, _delivery_rx) = tokio::sync::mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let log = slog::Logger::root(slog::Discard, slog::o!());

        let enforcer = DeviceEnforcer::new(
            transport.clone(),
            store,
            catalog,
            DeviceEnforcerConfig {
                ack_window: std::time::Duration::from_millis(50),
                max_attempts: 1,
                retry_backoff: std::time::Duration::from_millis(10),
            },
            telemetry_tx,
            delivery_tx,
            shutdown_rx,
            log,
        );

        // No birth announcement has arrived, so the device counts as offline.
        let policy = compile_device_policy("set sampling interval to 30s for esp32-mhz19-1");
        let outcome = enforcer.apply(policy).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::PendingDelivery);
        assert!(transport.published.lock().await.is_empty());
    }

    #[tokio::test]
    async fn online_device_applies_after_telemetry_reflection() {
        let transport = FakeTransport::new();
        let store = Arc::new(crate::store::tests::test_store().await);
        let catalog = test_catalog();
        let (telemetry_tx, _) = tokio::sync::broadcast::channel(16);
        let (delivery_tx, _delivery_rx) = tokio::sync::mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let log = slog::Logger::root(slog::Discard, slog::o!());

        let enforcer = DeviceEnforcer::new(
            transport.clone(),
            store,
            catalog,
            DeviceEnforcerConfig {
                ack_window: std::time::Duration::from_secs(2),
                max_attempts: 1,
                retry_backoff: std::time::Duration::from_millis(10),
            },
            telemetry_tx.clone(),
            delivery_tx,
            shutdown_rx,
            log,
        );

        enforcer
            .input_channel()
            .send(Message::DeviceStatus {
                device_id: "esp32-mhz19-1".to_owned(),
                online: true,
            })
            .await
            .unwrap();

        // Echo the requested interval back as telemetry once the publish
        // lands, standing in for the device.
        let transport_for_echo = transport.clone();
        let echo = tokio::task::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                if !transport_for_echo.published.lock().await.is_empty() {
                    let _ = telemetry_tx.send(TelemetryUpdate {
                        device_id: "esp32-mhz19-1".to_owned(),
                        payload: serde_json::json!({"sampling_interval_ms": 30000}),
                    });
                    break;
                }
            }
        });

        let policy = compile_device_policy("set sampling interval to 30s for esp32-mhz19-1");
        let outcome = enforcer.apply(policy).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        echo.await.unwrap();

        let published = transport.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "drover/control/esp32-mhz19-1");
        assert_eq!(published[0].1["command"], "SET_SAMPLING_INTERVAL");
    }

    #[tokio::test]
    async fn missing_reflection_fails_after_retries() {
        let transport = FakeTransport::new();
        let store = Arc::new(crate::store::tests::test_store().await);
        let catalog = test_catalog();
        let (telemetry_tx, _) = tokio::sync::broadcast::channel(16);
        let (delivery_tx, _delivery_rx) = tokio::sync::mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let log = slog::Logger::root(slog::Discard, slog::o!());

        let enforcer = DeviceEnforcer::new(
            transport.clone(),
            store,
            catalog,
            DeviceEnforcerConfig {
                ack_window: std::time::Duration::from_millis(30),
                max_attempts: 2,
                retry_backoff: std::time::Duration::from_millis(5),
            },
            telemetry_tx,
            delivery_tx,
            shutdown_rx,
            log,
        );

        enforcer
            .input_channel()
            .send(Message::DeviceStatus {
                device_id: "esp32-audio-1".to_owned(),
                online: true,
            })
            .await
            .unwrap();

        let policy = compile_device_policy("set audio gain to 3.5 for esp32-audio-1");
        let result = enforcer.apply(policy).await;
        assert!(matches!(result, Err(DeviceError::AckTimeout)));
        // One initial attempt plus one retry.
        assert_eq!(transport.published.lock().await.len(), 2);
    }

    pub(crate) fn test_catalog() -> Arc<Catalog> {
        use crate::catalog::tests::{TEST_DEVICES, TEST_GRAMMAR, TEST_TEMPLATES};
        let dir = std::env::temp_dir().join(format!(
            "drover-devtest-{}-{:x}",
            std::process::id(),
            rand_suffix()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let paths = crate::catalog::CatalogPaths {
            devices: dir.join("devices.yml"),
            grammar: dir.join("grammar.yml"),
            templates: dir.join("templates.yml"),
        };
        std::fs::write(&paths.devices, TEST_DEVICES).unwrap();
        std::fs::write(&paths.grammar, TEST_GRAMMAR).unwrap();
        std::fs::write(&paths.templates, TEST_TEMPLATES).unwrap();
        let log = slog::Logger::root(slog::Discard, slog::o!());
        Arc::new(Catalog::load(paths, log).unwrap())
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos() as u64
    }
}
