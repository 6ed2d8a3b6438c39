use thiserror::Error;

/// Errors surfaced by the MQTT session
#[derive(Debug, Error)]
pub enum MqttError {
    /// The broker could not be reached or refused the connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// The client rejected an outgoing request
    #[error("Client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The broker connection dropped while the operation was pending
    #[error("Broker connection lost")]
    Disconnected,

    #[error("No subscribe acknowledgment received within {0:?}")]
    SubscribeTimeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    /// The session worker is gone (session shut down)
    #[error("MQTT session closed")]
    SessionClosed,
}
