//! MQTT session manager
//!
//! One logical broker connection shared by the whole bridge. A single worker task
//! owns the transport and every piece of session state; [`MqttSession`] handles
//! talk to it through an action queue, so wire operations from different callers
//! never interleave.
//!
//! ```text
//! MqttSession ──[SessionAction]──► SessionWorker ──► Transport ──► broker
//!      ▲                               │    ▲
//!      └──────[Inbound broadcast]──────┘    └──[TransportEvent]
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use statum::{machine, state};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::MqttError;
use super::message_manager::{Inbound, MessageStream, MqttMessage, ObserverGuard};
use super::topic_cache::TopicValueCache;
use super::transport::{Transport, TransportEvent, Will};

pub const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Filter covering every topic; shared by all observers
pub const WILDCARD_FILTER: &str = "#";

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

macro_rules! respond {
    ($action:expr, $response_tx:expr) => {
        if $response_tx.send($action.await).is_err() {
            debug!("Requester left before its response was ready");
        }
    };
}

const ACTION_QUEUE_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MqttSessionSettings {
    /// Topic carrying the bridge's retained "online"/"offline" status
    pub status_topic: String,
    pub subscribe_ack_timeout: Duration,
}

impl MqttSessionSettings {
    pub fn new(status_topic: impl Into<String>) -> Self {
        Self {
            status_topic: status_topic.into(),
            subscribe_ack_timeout: SUBSCRIBE_ACK_TIMEOUT,
        }
    }
}

pub(crate) enum SessionAction {
    Publish {
        messages: Vec<(String, String)>,
        qos: QoS,
        retain: bool,
        response_tx: oneshot::Sender<Result<Vec<(String, String)>, MqttError>>,
    },
    Subscribe {
        filters: Vec<String>,
        qos: QoS,
        response_tx: oneshot::Sender<Result<Option<oneshot::Receiver<()>>, MqttError>>,
    },
    /// Subscribe without waiting for the acknowledgment
    TrySubscribe { filters: Vec<String>, qos: QoS },
    ObserversReleased,
}

/// Cheap, cloneable handle to the session worker
#[derive(Clone)]
pub struct MqttSession {
    actions: mpsc::Sender<SessionAction>,
    inbound: broadcast::Sender<Inbound>,
    observers: Arc<AtomicUsize>,
    settings: Arc<MqttSessionSettings>,
    lifetime: CancellationToken,
}

impl MqttSession {
    /// Starts the session worker. Nothing touches the broker until the first
    /// publish or subscribe.
    pub fn spawn(transport: impl Transport, settings: MqttSessionSettings) -> Self {
        let (actions_tx, actions_rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        let observers = Arc::new(AtomicUsize::new(0));
        let settings = Arc::new(settings);
        let lifetime = CancellationToken::new();

        let worker = SessionWorker::create(
            Box::new(transport),
            settings.clone(),
            actions_rx,
            inbound_tx.clone(),
            observers.clone(),
        );
        let shutdown = lifetime.clone();
        tokio::spawn(async move {
            worker.start().run_until_shutdown(shutdown).await;
        });

        Self {
            actions: actions_tx,
            inbound: inbound_tx,
            observers,
            settings,
            lifetime,
        }
    }

    /// Publishes every pair whose value changed since it was last seen and returns
    /// the pairs that actually went out.
    pub async fn publish(
        &self,
        ct: &CancellationToken,
        messages: Vec<(String, String)>,
        qos: QoS,
        retain: bool,
    ) -> Result<Vec<(String, String)>, MqttError> {
        self.request(ct, |response_tx| SessionAction::Publish {
            messages,
            qos,
            retain,
            response_tx,
        })
        .await
    }

    pub async fn publish_one(
        &self,
        ct: &CancellationToken,
        topic: impl Into<String>,
        value: impl Into<String>,
        qos: QoS,
        retain: bool,
    ) -> Result<bool, MqttError> {
        let sent = self
            .publish(ct, vec![(topic.into(), value.into())], qos, retain)
            .await?;
        Ok(!sent.is_empty())
    }

    /// Subscribes to the filters not subscribed yet and waits for the broker's
    /// acknowledgment. Already subscribed filters return immediately.
    pub async fn subscribe(
        &self,
        ct: &CancellationToken,
        filters: &[String],
        qos: QoS,
    ) -> Result<(), MqttError> {
        let filters = filters.to_vec();
        let pending = self
            .request(ct, |response_tx| SessionAction::Subscribe {
                filters,
                qos,
                response_tx,
            })
            .await?;

        let Some(ack) = pending else {
            return Ok(());
        };

        let timeout = self.settings.subscribe_ack_timeout;
        tokio::select! {
            _ = ct.cancelled() => Err(MqttError::Cancelled),
            result = tokio::time::timeout(timeout, ack) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(MqttError::Disconnected),
                Err(_) => Err(MqttError::SubscribeTimeout(timeout)),
            },
        }
    }

    /// Observes every inbound message whose topic starts with `topic_prefix`
    /// (case-insensitive).
    ///
    /// All observers share a single `#` subscription. Known limitation: a retained
    /// message already received through that subscription is not replayed to an
    /// observer added later; it only shows up on the next live publish.
    pub async fn observe_all(
        &self,
        ct: &CancellationToken,
        topic_prefix: &str,
        qos: QoS,
    ) -> Result<MessageStream, MqttError> {
        let guard = ObserverGuard::acquire(self.observers.clone(), self.actions.clone());
        let receiver = self.inbound.subscribe();

        self.subscribe(ct, &[WILDCARD_FILTER.to_string()], QoS::AtLeastOnce)
            .await?;

        debug!("Observing topics under '{}'", topic_prefix);
        Ok(MessageStream::new(
            receiver,
            topic_prefix,
            qos,
            self.clone(),
            guard,
        ))
    }

    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::SeqCst)
    }

    /// Stops the worker; pending and later requests fail with `SessionClosed`
    pub fn shutdown(&self) {
        self.lifetime.cancel();
    }

    pub(crate) fn request_subscription(&self, topic: &str, qos: QoS) {
        let action = SessionAction::TrySubscribe {
            filters: vec![topic.to_string()],
            qos,
        };
        if let Err(e) = self.actions.try_send(action) {
            debug!("Skipped subscription to {}: {}", topic, e);
        }
    }

    async fn request<T>(
        &self,
        ct: &CancellationToken,
        build: impl FnOnce(oneshot::Sender<Result<T, MqttError>>) -> SessionAction,
    ) -> Result<T, MqttError> {
        let (response_tx, response_rx) = oneshot::channel();
        let action = build(response_tx);

        tokio::select! {
            _ = ct.cancelled() => Err(MqttError::Cancelled),
            result = async {
                self.actions
                    .send(action)
                    .await
                    .map_err(|_| MqttError::SessionClosed)?;
                response_rx.await.map_err(|_| MqttError::SessionClosed)?
            } => result,
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum WorkerState {
    Idle,    // Created, nothing spawned yet
    Running, // Serving actions and broker events
}

/// Owner of the transport and of all session state
#[machine]
pub(crate) struct SessionWorker<S: WorkerState> {
    transport: Box<dyn Transport>,
    settings: Arc<MqttSessionSettings>,
    actions: mpsc::Receiver<SessionAction>,
    inbound: broadcast::Sender<Inbound>,
    observers: Arc<AtomicUsize>,
    cache: TopicValueCache,
    subscriptions: HashSet<String>,
    pending_acks: HashMap<u16, oneshot::Sender<()>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    connected: bool,
}

enum Step {
    Action(SessionAction),
    Event(Option<TransportEvent>),
}

impl SessionWorker<Idle> {
    pub(crate) fn create(
        transport: Box<dyn Transport>,
        settings: Arc<MqttSessionSettings>,
        actions: mpsc::Receiver<SessionAction>,
        inbound: broadcast::Sender<Inbound>,
        observers: Arc<AtomicUsize>,
    ) -> Self {
        Self::new(
            transport,
            settings,
            actions,
            inbound,
            observers,
            TopicValueCache::new(),
            HashSet::new(),
            HashMap::new(),
            None,  // events
            false, // connected
        )
    }

    pub fn start(self) -> SessionWorker<Running> {
        info!(
            "Starting MQTT session worker (status topic: {})",
            self.settings.status_topic
        );
        self.transition()
    }
}

impl SessionWorker<Running> {
    pub async fn run_until_shutdown(mut self, shutdown: CancellationToken) {
        loop {
            // Broker events drain before queued actions
            let step = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = next_event(&mut self.events) => Step::Event(event),
                action = self.actions.recv() => match action {
                    Some(action) => Step::Action(action),
                    None => break,
                },
            };

            match step {
                Step::Action(action) => self.handle_action(action).await,
                Step::Event(event) => self.handle_event(event),
            }
        }

        info!("MQTT session worker stopped");
    }

    async fn handle_action(&mut self, action: SessionAction) {
        match action {
            SessionAction::Publish {
                messages,
                qos,
                retain,
                response_tx,
            } => {
                respond!(self.publish(messages, qos, retain), response_tx);
            }
            SessionAction::Subscribe {
                filters,
                qos,
                response_tx,
            } => {
                respond!(self.subscribe(filters, qos), response_tx);
            }
            SessionAction::TrySubscribe { filters, qos } => {
                if let Err(e) = self.subscribe(filters, qos).await {
                    warn!("Failed to subscribe: {}", e);
                }
            }
            SessionAction::ObserversReleased => {
                if self.observers.load(Ordering::SeqCst) == 0 {
                    debug!("Last observer left, forgetting subscriptions and cached values");
                    self.subscriptions.clear();
                    self.cache.clear();
                }
            }
        }
    }

    fn handle_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message { topic, payload }) => self.on_message(topic, payload),
            Some(TransportEvent::SubscribeAck { pkid }) => match self.pending_acks.remove(&pkid) {
                Some(waiter) => {
                    let _ = waiter.send(());
                }
                None => trace!("Unawaited subscribe acknowledgment {}", pkid),
            },
            Some(TransportEvent::Disconnected(reason)) => self.on_disconnected(&reason),
            None => self.on_disconnected("event stream closed"),
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), MqttError> {
        if self.connected {
            return Ok(());
        }

        let status_topic = self.settings.status_topic.clone();
        let will = Will {
            topic: status_topic.clone(),
            payload: STATUS_OFFLINE.to_string(),
            qos: QoS::AtLeastOnce,
            retain: true,
        };

        let events = self.transport.connect(&will).await?;
        self.events = Some(events);
        self.connected = true;

        if let Err(e) = self
            .transport
            .publish(&status_topic, STATUS_ONLINE, QoS::AtLeastOnce, true)
            .await
        {
            self.on_disconnected(&e.to_string());
            return Err(e);
        }

        info!("Connected to MQTT broker, bridge is {}", STATUS_ONLINE);
        Ok(())
    }

    async fn publish(
        &mut self,
        messages: Vec<(String, String)>,
        qos: QoS,
        retain: bool,
    ) -> Result<Vec<(String, String)>, MqttError> {
        self.ensure_connected().await?;

        let mut sent = Vec::with_capacity(messages.len());
        for (topic, value) in messages {
            if !self.cache.update(&topic, &value) {
                trace!("Skipping unchanged {} = {}", topic, value);
                continue;
            }

            if let Err(e) = self.transport.publish(&topic, &value, qos, retain).await {
                self.cache.forget(&topic);
                return Err(e);
            }
            sent.push((topic, value));
        }

        Ok(sent)
    }

    async fn subscribe(
        &mut self,
        filters: Vec<String>,
        qos: QoS,
    ) -> Result<Option<oneshot::Receiver<()>>, MqttError> {
        self.ensure_connected().await?;

        let mut added = Vec::new();
        for filter in filters {
            if !self.subscriptions.contains(&filter) && !added.contains(&filter) {
                added.push(filter);
            }
        }
        if added.is_empty() {
            return Ok(None);
        }

        let pkid = self.transport.subscribe(&added, qos).await?;
        debug!("Subscribing to {:?} (packet {})", added, pkid);
        self.subscriptions.extend(added);

        self.pending_acks.retain(|_, waiter| !waiter.is_closed());
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks.insert(pkid, ack_tx);

        Ok(Some(ack_rx))
    }

    fn on_message(&mut self, topic: String, payload: String) {
        if self.observers.load(Ordering::SeqCst) == 0 {
            trace!("No observer for {}", topic);
            return;
        }
        if !self.cache.update(&topic, &payload) {
            trace!("Ignoring unchanged {} = {}", topic, payload);
            return;
        }
        let _ = self
            .inbound
            .send(Inbound::Message(MqttMessage::new(topic, payload)));
    }

    fn on_disconnected(&mut self, reason: &str) {
        warn!("Lost connection to MQTT broker: {}", reason);
        self.connected = false;
        self.events = None;
        self.cache.clear();
        self.subscriptions.clear();
        self.pending_acks.clear();
        let _ = self.inbound.send(Inbound::Disconnected);
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
