//! In-memory stand-ins for the broker and the SmartApp

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rumqttc::QoS;
use tokio::sync::mpsc;

use crate::mqtt::transport::{Transport, TransportEvent, Will};
use crate::mqtt::MqttError;
use crate::smartthings::{ApiError, Device, DeviceCloud, EndpointInfo};
use crate::sync::command::Command;

#[derive(Default)]
struct BrokerState {
    connects: Vec<Will>,
    published: Vec<(String, String, bool)>,
    subscribes: Vec<(Vec<String>, QoS)>,
    events: Option<mpsc::Sender<TransportEvent>>,
    next_pkid: u16,
    manual_ack: bool,
    fail_connect: bool,
}

/// Broker double: records every wire operation, acknowledges subscribes right away
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn connects(&self) -> Vec<Will> {
        self.state().connects.clone()
    }

    pub fn published(&self) -> Vec<(String, String, bool)> {
        self.state().published.clone()
    }

    /// Published pairs, without the status messages
    pub fn published_on(&self, prefix: &str) -> Vec<(String, String)> {
        self.state()
            .published
            .iter()
            .filter(|(topic, _, _)| topic.starts_with(prefix))
            .map(|(topic, value, _)| (topic.clone(), value.clone()))
            .collect()
    }

    pub fn subscribes(&self) -> Vec<(Vec<String>, QoS)> {
        self.state().subscribes.clone()
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.state().manual_ack = !enabled;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.state().events {
            let _ = events.try_send(event);
        }
    }

    pub fn emit_message(&self, topic: &str, payload: &str) {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&mut self, will: &Will) -> Result<mpsc::Receiver<TransportEvent>, MqttError> {
        let mut state = self.state();
        if state.fail_connect {
            return Err(MqttError::Connection("connection refused".into()));
        }
        let (events_tx, events_rx) = mpsc::channel(256);
        state.events = Some(events_tx);
        state.connects.push(will.clone());
        Ok(events_rx)
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        _qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        let mut state = self.state();
        if state.events.is_none() {
            return Err(MqttError::Disconnected);
        }
        state
            .published
            .push((topic.to_string(), payload.to_string(), retain));
        Ok(())
    }

    async fn subscribe(&mut self, filters: &[String], qos: QoS) -> Result<u16, MqttError> {
        let mut state = self.state();
        state.next_pkid += 1;
        let pkid = state.next_pkid;
        state.subscribes.push((filters.to_vec(), qos));
        if !state.manual_ack {
            if let Some(events) = &state.events {
                let _ = events.try_send(TransportEvent::SubscribeAck { pkid });
            }
        }
        Ok(pkid)
    }
}

struct CloudState {
    endpoints: VecDeque<Result<Vec<EndpointInfo>, ApiError>>,
    endpoint_calls: usize,
    endpoint_delay: Duration,
    devices: HashMap<String, Vec<Device>>,
    device_calls: usize,
    fail_devices: bool,
    executed: Vec<(String, String, Command)>,
    execute_delay: Duration,
    running: usize,
    max_running: usize,
}

/// SmartApp double. Endpoint listings are answered from a queue, devices per uri.
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CloudState {
                endpoints: VecDeque::new(),
                endpoint_calls: 0,
                endpoint_delay: Duration::ZERO,
                devices: HashMap::new(),
                device_calls: 0,
                fail_devices: false,
                executed: Vec::new(),
                execute_delay: Duration::ZERO,
                running: 0,
                max_running: 0,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap()
    }

    pub fn push_endpoints(&self, result: Result<Vec<EndpointInfo>, ApiError>) {
        self.state().endpoints.push_back(result);
    }

    pub fn set_endpoint_delay(&self, delay: Duration) {
        self.state().endpoint_delay = delay;
    }

    pub fn endpoint_calls(&self) -> usize {
        self.state().endpoint_calls
    }

    pub fn set_devices(&self, uri: &str, devices: Vec<Device>) {
        self.state().devices.insert(uri.to_string(), devices);
    }

    pub fn set_fail_devices(&self, fail: bool) {
        self.state().fail_devices = fail;
    }

    pub fn device_calls(&self) -> usize {
        self.state().device_calls
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        self.state().execute_delay = delay;
    }

    pub fn executed(&self) -> Vec<(String, String, Command)> {
        self.state().executed.clone()
    }

    pub fn max_concurrent_executions(&self) -> usize {
        self.state().max_running
    }
}

#[async_trait]
impl DeviceCloud for FakeCloud {
    async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>, ApiError> {
        let (result, delay) = {
            let mut state = self.state();
            state.endpoint_calls += 1;
            let result = state
                .endpoints
                .pop_front()
                .unwrap_or(Err(ApiError::Status(StatusCode::SERVICE_UNAVAILABLE)));
            (result, state.endpoint_delay)
        };
        tokio::time::sleep(delay).await;
        result
    }

    async fn list_devices(&self, uri: &str, _detailed: bool) -> Result<Vec<Device>, ApiError> {
        let mut state = self.state();
        state.device_calls += 1;
        if state.fail_devices {
            return Err(ApiError::Status(StatusCode::INTERNAL_SERVER_ERROR));
        }
        state
            .devices
            .get(uri)
            .cloned()
            .ok_or(ApiError::Status(StatusCode::NOT_FOUND))
    }

    async fn execute(&self, uri: &str, device_id: &str, command: &Command) -> Result<(), ApiError> {
        let delay = {
            let mut state = self.state();
            state
                .executed
                .push((uri.to_string(), device_id.to_string(), command.clone()));
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
            state.execute_delay
        };
        tokio::time::sleep(delay).await;
        self.state().running -= 1;
        Ok(())
    }
}
