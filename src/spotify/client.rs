//! HTTP client for the Spotify accounts service and Web API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::error::SpotifyError;
use super::models::{PlaylistItemsPage, SpotifyPlaylist, TokenErrorBody, TokenResponse};
use super::retry_policy::RetryPolicy;
use crate::import::Page;

/// Operations the import pipeline needs from Spotify.
///
/// Implementations perform their own bounded retries for transient failures,
/// so any error returned here is final for that call.
#[async_trait]
pub trait SpotifyApi: Send + Sync {
    /// Exchange an authorization code from the consent redirect for tokens.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, SpotifyError>;

    /// Obtain a new access token using a refresh token.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, SpotifyError>;

    async fn get_playlist(
        &self,
        access_token: &str,
        playlist_id: &str,
    ) -> Result<SpotifyPlaylist, SpotifyError>;

    /// Fetch one page of playlist items. `cursor` is the opaque continuation
    /// returned with the previous page, `None` for the first page.
    async fn get_playlist_items(
        &self,
        access_token: &str,
        playlist_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<serde_json::Value>, SpotifyError>;
}

#[derive(Debug, Clone)]
pub struct SpotifyClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub accounts_url: String,
    pub api_url: String,
    pub timeout_sec: u64,
    pub page_size: u32,
    pub retry: RetryPolicy,
}

pub struct SpotifyClient {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    accounts_url: String,
    api_url: String,
    page_size: u32,
    retry: RetryPolicy,
}

impl SpotifyClient {
    pub fn new(config: SpotifyClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            client_id: config.client_id,
            client_secret: config.client_secret,
            accounts_url: config.accounts_url.trim_end_matches('/').to_string(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            page_size: config.page_size.clamp(1, 100),
            retry: config.retry,
        })
    }

    /// URL of the consent page a user must visit to link their account.
    pub fn authorize_url(&self, redirect_uri: &str, scopes: &[&str], state: &str) -> String {
        format!(
            "{}/authorize?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.accounts_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes.join(" ")),
            urlencoding::encode(state),
        )
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<TokenResponse, SpotifyError> {
        slowdown().await;
        let url = format!("{}/api/token", self.accounts_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        if status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<TokenErrorBody>(&body) {
                Ok(err) if err.error == "invalid_grant" => SpotifyError::InvalidGrant(
                    err.error_description.unwrap_or(err.error),
                ),
                _ => SpotifyError::Status {
                    status: status.as_u16(),
                    body,
                },
            });
        }
        Err(error_from_response(response).await)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T, SpotifyError> {
        slowdown().await;
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    fn first_page_url(&self, playlist_id: &str) -> String {
        format!(
            "{}/v1/playlists/{}/tracks?limit={}&offset=0",
            self.api_url,
            urlencoding::encode(playlist_id),
            self.page_size
        )
    }
}

#[async_trait]
impl SpotifyApi for SpotifyClient {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, SpotifyError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        self.retry
            .run("exchange_code", || self.post_token_form(&form))
            .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, SpotifyError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.retry
            .run("refresh_token", || self.post_token_form(&form))
            .await
    }

    async fn get_playlist(
        &self,
        access_token: &str,
        playlist_id: &str,
    ) -> Result<SpotifyPlaylist, SpotifyError> {
        let url = format!(
            "{}/v1/playlists/{}?fields=id,name,description,images,owner",
            self.api_url,
            urlencoding::encode(playlist_id)
        );
        self.retry
            .run("get_playlist", || self.get_json(&url, access_token))
            .await
    }

    async fn get_playlist_items(
        &self,
        access_token: &str,
        playlist_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<serde_json::Value>, SpotifyError> {
        let url = match cursor {
            None => self.first_page_url(playlist_id),
            // The bearer token must never leave the configured API host.
            Some(next) if next.starts_with(&format!("{}/", self.api_url)) => next.to_string(),
            Some(next) => {
                return Err(SpotifyError::InvalidResponse(format!(
                    "continuation points outside the API: {}",
                    next
                )))
            }
        };

        let page: PlaylistItemsPage = self
            .retry
            .run("get_playlist_items", || self.get_json(&url, access_token))
            .await?;
        Ok(Page {
            items: page.items,
            next: page.next,
        })
    }
}

async fn error_from_response(response: Response) -> SpotifyError {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED => SpotifyError::Unauthorized,
        StatusCode::NOT_FOUND => SpotifyError::NotFound(response.url().path().to_string()),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            SpotifyError::RateLimited(retry_after)
        }
        s if s.is_server_error() => SpotifyError::Server(s.as_u16()),
        s => SpotifyError::Status {
            status: s.as_u16(),
            body: response.text().await.unwrap_or_default(),
        },
    }
}

#[cfg(feature = "slowdown")]
async fn slowdown() {
    use rand::Rng;
    let delay_ms = rand::rng().random_range(50..=500);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
}

#[cfg(not(feature = "slowdown"))]
async fn slowdown() {}
