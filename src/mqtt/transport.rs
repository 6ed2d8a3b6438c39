//! Wire-level MQTT primitive used by the session worker
//!
//! The session only needs connect / publish / subscribe plus a stream of inbound
//! events. [`RumqttcTransport`] provides them on top of `rumqttc`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::MqttConfig;
use super::error::MqttError;

const EVENT_BUFFER: usize = 256;
const REQUEST_CAPACITY: usize = 64;

/// Something the broker connection reports back to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { topic: String, payload: String },
    SubscribeAck { pkid: u16 },
    Disconnected(String),
}

/// Last will registered with the broker on connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

#[async_trait]
pub trait Transport: Send + 'static {
    /// Opens a new broker connection and returns its inbound event stream.
    ///
    /// The stream yields [`TransportEvent::Disconnected`] (or ends) when the
    /// connection drops; a later `connect` starts over.
    async fn connect(&mut self, will: &Will) -> Result<mpsc::Receiver<TransportEvent>, MqttError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError>;

    /// Sends a SUBSCRIBE for `filters` and returns its packet id
    async fn subscribe(&mut self, filters: &[String], qos: QoS) -> Result<u16, MqttError>;
}

type PendingSubscribes = Arc<Mutex<VecDeque<oneshot::Sender<u16>>>>;

/// [`Transport`] backed by a `rumqttc` client and its event loop
pub struct RumqttcTransport {
    config: MqttConfig,
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
    // Subscribe calls waiting to learn the packet id rumqttc assigned them
    pending_subscribes: PendingSubscribes,
}

impl RumqttcTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            client: None,
            driver: None,
            pending_subscribes: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn options(&self, will: &Will) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options
            .set_keep_alive(Duration::from_secs(self.config.keep_alive_secs))
            .set_clean_session(false)
            .set_last_will(LastWill::new(
                &will.topic,
                will.payload.clone(),
                will.qos,
                will.retain,
            ));
        if let Some(user) = &self.config.username {
            options.set_credentials(user.clone(), self.config.password.clone().unwrap_or_default());
        }
        options
    }

    fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.client = None;
        if let Ok(mut pending) = self.pending_subscribes.lock() {
            pending.clear();
        }
    }
}

#[async_trait]
impl Transport for RumqttcTransport {
    async fn connect(&mut self, will: &Will) -> Result<mpsc::Receiver<TransportEvent>, MqttError> {
        self.close();

        info!("Connecting to MQTT broker {}", self.config);
        let (client, mut eventloop) = AsyncClient::new(self.options(will), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!("Broker accepted connection: {:?}", ack.code);
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(MqttError::Connection(e.to_string())),
            }
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        self.driver = Some(tokio::spawn(drive_event_loop(
            eventloop,
            events_tx,
            self.pending_subscribes.clone(),
        )));
        self.client = Some(client);

        Ok(events_rx)
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        let client = self.client.as_ref().ok_or(MqttError::Disconnected)?;
        client
            .publish(topic, qos, retain, payload.as_bytes().to_vec())
            .await?;
        Ok(())
    }

    async fn subscribe(&mut self, filters: &[String], qos: QoS) -> Result<u16, MqttError> {
        let client = self.client.as_ref().ok_or(MqttError::Disconnected)?;

        let (pkid_tx, pkid_rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending_subscribes.lock() {
            pending.push_back(pkid_tx);
        }

        let request = filters
            .iter()
            .map(|filter| SubscribeFilter::new(filter.clone(), qos));
        if let Err(e) = client.subscribe_many(request).await {
            if let Ok(mut pending) = self.pending_subscribes.lock() {
                pending.pop_back();
            }
            return Err(e.into());
        }

        pkid_rx.await.map_err(|_| MqttError::Disconnected)
    }
}

impl Drop for RumqttcTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    pending_subscribes: PendingSubscribes,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                topic: publish.topic,
                payload: String::from_utf8_lossy(&publish.payload).into_owned(),
            },
            Ok(Event::Incoming(Packet::SubAck(ack))) => TransportEvent::SubscribeAck { pkid: ack.pkid },
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                if let Some(waiter) = pending_subscribes
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.pop_front())
                {
                    let _ = waiter.send(pkid);
                }
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("MQTT event loop stopped: {}", e);
                if let Ok(mut pending) = pending_subscribes.lock() {
                    pending.clear();
                }
                let _ = events.send(TransportEvent::Disconnected(e.to_string())).await;
                break;
            }
        };

        if events.send(event).await.is_err() {
            debug!("Session dropped the event stream, stopping event loop");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_carry_will_and_credentials() {
        let config = MqttConfig {
            host: "broker.local".into(),
            username: Some("bridge".into()),
            password: Some("pw".into()),
            ..MqttConfig::default()
        };
        let transport = RumqttcTransport::new(config);
        let will = Will {
            topic: "bridge/status".into(),
            payload: "offline".into(),
            qos: QoS::AtLeastOnce,
            retain: true,
        };

        let options = transport.options(&will);

        assert_eq!(options.keep_alive(), Duration::from_secs(10));
        assert!(!options.clean_session());
        assert_eq!(
            options.credentials(),
            Some(("bridge".to_string(), "pw".to_string()))
        );
        let last_will = options.last_will().unwrap();
        assert_eq!(last_will.topic, "bridge/status");
        assert_eq!(&last_will.message[..], b"offline");
        assert!(last_will.retain);
    }
}
