use reqwest::StatusCode;
use thiserror::Error;

/// Failures of a single call to the SmartApp
#[derive(Debug, Error)]
pub enum ApiError {
    /// The SmartApp revoked or never accepted the access token
    #[error("SmartApp rejected the access token")]
    Unauthorized,

    #[error("SmartApp responded with {0}")]
    Status(StatusCode),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid SmartApp response: {0}")]
    Decode(String),

    #[error("Invalid client configuration: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("No endpoint available for location {0}")]
    NotFound(String),

    /// Listing devices on an endpoint that only stands in for a missing one
    #[error("Endpoint of location {0} is a placeholder")]
    Placeholder(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Endpoint cache disposed")]
    Disposed,
}
