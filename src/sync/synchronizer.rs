use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::{property_topic, Command, TopicRoute};
use super::error::SyncError;
use crate::mqtt::{MqttMessage, MqttSession};
use crate::smartthings::{Device, Endpoint, EndpointCache, HookKind, HookRequest, Routine};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const RETRY_DELAY: Duration = Duration::from_secs(60);

const ROUTINES_LEVEL: &str = "routines";

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub topic_namespace: String,
    pub location_id: String,
    pub poll_interval: Duration,
    /// Pause before a failed pipeline starts over
    pub retry_delay: Duration,
}

impl SyncSettings {
    pub fn new(topic_namespace: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            topic_namespace: topic_namespace.into().to_lowercase(),
            location_id: location_id.into(),
            poll_interval: POLL_INTERVAL,
            retry_delay: RETRY_DELAY,
        }
    }
}

/// Devices of the last poll and the endpoint they came from
#[derive(Debug)]
pub struct SyncSnapshot {
    pub endpoint: Endpoint,
    pub devices: Vec<Device>,
}

/// Keeps SmartThings devices and their MQTT topics in sync.
///
/// Two pipelines run once enabled:
/// - `[ST => MQTT]` polls the location's devices and publishes every property that
///   changed.
/// - `[MQTT => ST]` turns messages under the namespace into device commands. It
///   drops everything until a poll has been published since it last subscribed,
///   and runs commands one at a time in arrival order.
///
/// Each pipeline is restarted after [`SyncSettings::retry_delay`] when it fails.
pub struct Synchronizer {
    inner: Arc<SyncInner>,
    enabled: AtomicBool,
    lifetime: CancellationToken,
    pipelines: StdMutex<Vec<JoinHandle<()>>>,
}

struct SyncInner {
    mqtt: MqttSession,
    endpoints: EndpointCache,
    settings: SyncSettings,
    snapshot: watch::Sender<Option<Arc<SyncSnapshot>>>,
    synced: watch::Sender<bool>,
    /// Wakes the outbound pipeline ahead of its next poll
    resync: Notify,
    command_gate: Mutex<()>,
}

impl Synchronizer {
    pub fn new(mqtt: MqttSession, endpoints: EndpointCache, settings: SyncSettings) -> Self {
        let (snapshot, _) = watch::channel(None);
        let (synced, _) = watch::channel(false);

        Self {
            inner: Arc::new(SyncInner {
                mqtt,
                endpoints,
                settings,
                snapshot,
                synced,
                resync: Notify::new(),
                command_gate: Mutex::new(()),
            }),
            enabled: AtomicBool::new(false),
            lifetime: CancellationToken::new(),
            pipelines: StdMutex::new(Vec::new()),
        }
    }

    /// Starts both pipelines. Only the first call has an effect.
    pub fn enable(&self) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            debug!("Synchronizer already enabled");
            return;
        }
        if self.lifetime.is_cancelled() {
            warn!("Synchronizer was disposed, not enabling it");
            return;
        }

        info!(
            "Synchronizing location {} with topics under '{}/'",
            self.inner.settings.location_id, self.inner.settings.topic_namespace
        );

        let outbound = {
            let inner = self.inner.clone();
            tokio::spawn(supervise(
                "ST => MQTT",
                self.inner.settings.retry_delay,
                self.lifetime.child_token(),
                move |ct| {
                    let inner = inner.clone();
                    async move { inner.run_outbound(&ct).await }
                },
            ))
        };
        let inbound = {
            let inner = self.inner.clone();
            let mut resubscribing = false;
            tokio::spawn(supervise(
                "MQTT => ST",
                self.inner.settings.retry_delay,
                self.lifetime.child_token(),
                move |ct| {
                    let inner = inner.clone();
                    let resubscribed = std::mem::replace(&mut resubscribing, true);
                    async move { inner.run_inbound(&ct, resubscribed).await }
                },
            ))
        };

        self.pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([outbound, inbound]);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.lifetime.is_cancelled()
    }

    /// Publishes the properties of one device right away, as a poll would.
    pub async fn update(&self, ct: &CancellationToken, device: &Device) -> Result<(), SyncError> {
        self.inner.publish_devices(ct, std::slice::from_ref(device)).await
    }

    /// Publishes a triggered routine on `{namespace}/routines/{routine id}`.
    pub async fn execute(
        &self,
        ct: &CancellationToken,
        routine: &Routine,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let topic = format!(
            "{}/{}/{}",
            self.inner.settings.topic_namespace,
            ROUTINES_LEVEL,
            routine.id.to_lowercase()
        );
        let value = timestamp.to_rfc3339();

        info!("[ST => MQTT] Routine '{}' triggered: {} = {}", routine.name, topic, value);
        let sent = self
            .inner
            .mqtt
            .publish(ct, vec![(topic, value)], QoS::AtLeastOnce, false)
            .await?;
        for (topic, value) in sent {
            info!("[ST => MQTT] Sent: {} = {}", topic, value);
        }
        Ok(())
    }

    /// Routes a SmartApp notification to [`update`](Self::update) or
    /// [`execute`](Self::execute).
    pub async fn dispatch(&self, ct: &CancellationToken, request: HookRequest) -> Result<(), SyncError> {
        match request.kind {
            HookKind::Device => {
                let device = request.device.ok_or_else(|| {
                    SyncError::MalformedRequest("device notification without device".into())
                })?;
                self.update(ct, &device).await
            }
            HookKind::Routine => {
                let routine = request.routine.ok_or_else(|| {
                    SyncError::MalformedRequest("routine notification without routine".into())
                })?;
                self.execute(ct, &routine, request.date.unwrap_or_else(Utc::now))
                    .await
            }
        }
    }

    pub fn snapshot(&self) -> Option<Arc<SyncSnapshot>> {
        self.inner.snapshot.borrow().clone()
    }

    /// Resolves once a poll has been published since the inbound side last
    /// subscribed
    pub async fn wait_until_synced(&self) {
        let mut synced = self.inner.synced.subscribe();
        let _ = synced.wait_for(|done| *done).await;
    }

    /// Stops both pipelines for good
    pub fn dispose(&self) {
        self.lifetime.cancel();
        let pipelines = std::mem::take(
            &mut *self.pipelines.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for pipeline in pipelines {
            pipeline.abort();
        }
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn supervise<F, Fut>(name: &'static str, retry_delay: Duration, ct: CancellationToken, mut pipeline: F)
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), SyncError>>,
{
    loop {
        let result = tokio::select! {
            _ = ct.cancelled() => break,
            result = pipeline(ct.clone()) => result,
        };

        match result {
            Err(SyncError::Cancelled) if ct.is_cancelled() => break,
            Err(e) => error!("[{}] Pipeline failed, restarting in {:?}: {}", name, retry_delay, e),
            Ok(()) => warn!("[{}] Pipeline ended, restarting in {:?}", name, retry_delay),
        }

        tokio::select! {
            _ = ct.cancelled() => break,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
    debug!("[{}] Pipeline stopped", name);
}

impl SyncInner {
    async fn run_outbound(&self, ct: &CancellationToken) -> Result<(), SyncError> {
        let endpoint = self
            .endpoints
            .observe(ct, &self.settings.location_id)
            .await?;
        info!(
            "[ST => MQTT] Polling location {} every {:?}",
            endpoint.location_id(),
            self.settings.poll_interval
        );

        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ct.cancelled() => return Err(SyncError::Cancelled),
                _ = poll.tick() => {}
                _ = self.resync.notified() => {
                    debug!("[ST => MQTT] Republishing for the renewed subscription");
                }
            }

            let devices = endpoint.list_devices(ct, true).await?;
            // A closed gate needs a publish to open again, even without changes
            let synced = *self.synced.borrow();
            let unchanged = self
                .snapshot
                .borrow()
                .as_ref()
                .is_some_and(|snapshot| snapshot.devices == devices);
            if synced && unchanged {
                debug!("[ST => MQTT] No device changed since the last poll");
                continue;
            }

            self.publish_devices(ct, &devices).await?;
            self.snapshot.send_replace(Some(Arc::new(SyncSnapshot {
                endpoint: endpoint.clone(),
                devices,
            })));
            self.synced.send_replace(true);
        }
    }

    async fn publish_devices(&self, ct: &CancellationToken, devices: &[Device]) -> Result<(), SyncError> {
        let mut messages = Vec::new();
        for device in devices {
            for (property, value) in &device.properties {
                let Some(value) = value.as_deref().filter(|value| !value.trim().is_empty()) else {
                    continue;
                };
                let topic = property_topic(&self.settings.topic_namespace, &device.id, property);
                let value = value.to_lowercase();
                info!("[ST => MQTT] Sending ({}): {} = {}", device.name, topic, value);
                messages.push((topic, value));
            }
        }

        if messages.is_empty() {
            return Ok(());
        }

        let sent = self
            .mqtt
            .publish(ct, messages, QoS::AtLeastOnce, true)
            .await?;
        for (topic, value) in sent {
            info!("[ST => MQTT] Sent: {} = {}", topic, value);
        }
        Ok(())
    }

    /// `resubscribed` closes the gate until the next published poll. The broker
    /// replays the retained state under the namespace on every subscription.
    async fn run_inbound(self: Arc<Self>, ct: &CancellationToken, resubscribed: bool) -> Result<(), SyncError> {
        if resubscribed && self.synced.send_replace(false) {
            info!("[MQTT => ST] Ignoring messages until devices are published again");
            self.resync.notify_one();
        }

        let prefix = format!("{}/", self.settings.topic_namespace);
        let mut messages = self.mqtt.observe_all(ct, &prefix, QoS::AtLeastOnce).await?;
        info!("[MQTT => ST] Listening to '{}#'", prefix);

        // Single consumer so commands reach the devices in arrival order
        let (queue, mut pending) = mpsc::unbounded_channel::<MqttMessage>();
        let mut worker = JoinSet::new();
        {
            let inner = self.clone();
            let ct = ct.clone();
            worker.spawn(async move {
                while let Some(message) = pending.recv().await {
                    inner.forward(&ct, message).await;
                }
            });
        }

        loop {
            let message = tokio::select! {
                _ = ct.cancelled() => return Err(SyncError::Cancelled),
                Some(done) = worker.join_next() => {
                    if let Err(e) = done {
                        error!("[MQTT => ST] Command worker failed: {}", e);
                    }
                    return Ok(());
                }
                message = messages.next() => message?,
            };

            if !*self.synced.borrow() {
                debug!("[MQTT => ST] Devices not published yet, ignoring {}", message);
                continue;
            }

            if queue.send(message).is_err() {
                warn!("[MQTT => ST] Command worker stopped");
                return Ok(());
            }
        }
    }

    async fn forward(&self, ct: &CancellationToken, message: MqttMessage) {
        if let Err(e) = self.try_forward(ct, &message).await {
            error!("[MQTT => ST] Failed to send {}: {}", message, e);
        }
    }

    async fn try_forward(&self, ct: &CancellationToken, message: &MqttMessage) -> Result<(), SyncError> {
        let Some(route) = TopicRoute::parse(&message.topic) else {
            warn!("[MQTT => ST] Not a device topic: {}", message.topic);
            return Ok(());
        };
        let Some(snapshot) = self.snapshot.borrow().clone() else {
            return Ok(());
        };
        let Some(device) = snapshot.devices.iter().find(|device| device.has_id(&route.device_id)) else {
            warn!("[MQTT => ST] No device found for id: {}", route.device_id);
            return Ok(());
        };
        let Some(command) = Command::from_property(&route.property, &message.value)? else {
            warn!("[MQTT => ST] No command found on {} for {}", device.name, message);
            return Ok(());
        };

        let _gate = tokio::select! {
            _ = ct.cancelled() => return Err(SyncError::Cancelled),
            gate = self.command_gate.lock() => gate,
        };

        info!("[MQTT => ST] Sending ({}): {}", device.name, message);
        snapshot.endpoint.execute(ct, &device.id, &command).await?;
        info!(
            "[MQTT => ST] Sent {} ({}.{}({}))",
            message,
            device.name,
            command.name,
            command
                .parameters
                .values()
                .map(|value| value.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }
}
