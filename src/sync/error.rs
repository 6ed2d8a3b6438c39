use thiserror::Error;

use crate::mqtt::MqttError;
use crate::smartthings::{ApiError, EndpointError};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("'{0}' is not a valid level")]
    InvalidLevel(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Mqtt(#[from] MqttError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Command(#[from] CommandError),

    /// A notification that does not carry what its kind announces
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<ApiError> for SyncError {
    fn from(error: ApiError) -> Self {
        SyncError::Endpoint(EndpointError::Api(error))
    }
}
