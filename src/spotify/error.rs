use std::time::Duration;
use thiserror::Error;

/// Errors returned by calls to the Spotify accounts service or Web API.
#[derive(Debug, Error)]
pub enum SpotifyError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by Spotify (retry after {0:?})")]
    RateLimited(Option<Duration>),

    #[error("Spotify server error: status {0}")]
    Server(u16),

    /// The bearer token was not accepted by a data endpoint.
    #[error("Access token rejected")]
    Unauthorized,

    /// The accounts service refused the authorization code or refresh token.
    #[error("Grant rejected: {0}")]
    InvalidGrant(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl SpotifyError {
    /// Transient failures that may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpotifyError::Network(_) | SpotifyError::RateLimited(_) | SpotifyError::Server(_)
        )
    }
}

impl From<reqwest::Error> for SpotifyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SpotifyError::InvalidResponse(err.to_string())
        } else {
            SpotifyError::Network(err.to_string())
        }
    }
}
