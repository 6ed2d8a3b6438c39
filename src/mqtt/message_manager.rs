use chrono::NaiveDateTime;
use rumqttc::QoS;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::error::MqttError;
use super::mqtt_handler::{MqttSession, SessionAction};

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub value: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} = {}", self.topic, self.value)
    }
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, value: impl Into<String>) -> Self {
        MqttMessage {
            topic: topic.into(),
            value: value.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }
}

/// What the session worker fans out to every observer
#[derive(Debug, Clone)]
pub(crate) enum Inbound {
    Message(MqttMessage),
    Disconnected,
}

/// Keeps the observer count of a session up to date.
///
/// The last guard to drop tells the worker that nobody listens anymore.
pub(crate) struct ObserverGuard {
    observers: Arc<AtomicUsize>,
    actions: mpsc::Sender<SessionAction>,
}

impl ObserverGuard {
    pub(crate) fn acquire(observers: Arc<AtomicUsize>, actions: mpsc::Sender<SessionAction>) -> Self {
        observers.fetch_add(1, Ordering::SeqCst);
        Self { observers, actions }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if self.observers.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Err(e) = self.actions.try_send(SessionAction::ObserversReleased) {
                warn!("Could not notify session that the last observer left: {}", e);
            }
        }
    }
}

/// Continuous sequence of inbound messages under one topic prefix.
///
/// Ends with [`MqttError::Disconnected`] when the broker connection drops; the
/// owner is expected to observe again, which reconnects and resubscribes.
pub struct MessageStream {
    receiver: broadcast::Receiver<Inbound>,
    prefix: String,
    qos: QoS,
    session: MqttSession,
    _guard: ObserverGuard,
}

impl MessageStream {
    pub(crate) fn new(
        receiver: broadcast::Receiver<Inbound>,
        prefix: &str,
        qos: QoS,
        session: MqttSession,
        guard: ObserverGuard,
    ) -> Self {
        Self {
            receiver,
            prefix: prefix.to_lowercase(),
            qos,
            session,
            _guard: guard,
        }
    }

    pub async fn next(&mut self) -> Result<MqttMessage, MqttError> {
        loop {
            match self.receiver.recv().await {
                Ok(Inbound::Message(message)) => {
                    if !message.topic.to_lowercase().starts_with(&self.prefix) {
                        continue;
                    }
                    self.session.request_subscription(&message.topic, self.qos);
                    return Ok(message);
                }
                Ok(Inbound::Disconnected) => return Err(MqttError::Disconnected),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Observer of '{}' fell behind, {} messages skipped",
                        self.prefix, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Inbound channel closed");
                    return Err(MqttError::SessionClosed);
                }
            }
        }
    }
}
