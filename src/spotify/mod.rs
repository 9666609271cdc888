//! Spotify accounts service and Web API client.

mod client;
mod error;
pub mod models;
mod retry_policy;

pub use client::{SpotifyApi, SpotifyClient, SpotifyClientConfig};
pub use error::SpotifyError;
pub use retry_policy::RetryPolicy;
