mod file_config;

pub use file_config::{FileConfig, RetryConfig, SpotifyConfig};

use crate::spotify::{RetryPolicy, SpotifyClientConfig};
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ACCOUNTS_URL: &str = "https://accounts.spotify.com";
pub const DEFAULT_API_URL: &str = "https://api.spotify.com";
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8888/callback";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
    pub spotify_accounts_url: String,
    pub spotify_api_url: String,
    pub redirect_uri: String,
    pub http_timeout_sec: u64,
    pub page_size: u32,
    pub token_safety_margin_sec: u64,
    pub busy_timeout_sec: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_dir: None,
            spotify_client_id: None,
            spotify_client_secret: None,
            spotify_accounts_url: DEFAULT_ACCOUNTS_URL.to_string(),
            spotify_api_url: DEFAULT_API_URL.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            http_timeout_sec: 30,
            page_size: 100,
            token_safety_margin_sec: 60,
            busy_timeout_sec: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub busy_timeout: Duration,
    pub spotify: SpotifySettings,
    pub retry: RetrySettings,
}

#[derive(Clone)]
pub struct SpotifySettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub accounts_url: String,
    pub api_url: String,
    pub redirect_uri: String,
    pub timeout_sec: u64,
    pub page_size: u32,
    pub token_safety_margin: Duration,
}

// The client secret stays out of logs.
impl std::fmt::Debug for SpotifySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifySettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("accounts_url", &self.accounts_url)
            .field("api_url", &self.api_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("timeout_sec", &self.timeout_sec)
            .field("page_size", &self.page_size)
            .field("token_safety_margin", &self.token_safety_margin)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let busy_timeout =
            Duration::from_secs(file.busy_timeout_sec.unwrap_or(cli.busy_timeout_sec));

        let sp = file.spotify.unwrap_or_default();
        let page_size = sp.page_size.unwrap_or(cli.page_size);
        if page_size == 0 || page_size > 100 {
            bail!("page_size must be between 1 and 100, got {}", page_size);
        }
        let spotify = SpotifySettings {
            client_id: sp.client_id.or_else(|| cli.spotify_client_id.clone()),
            client_secret: sp
                .client_secret
                .or_else(|| cli.spotify_client_secret.clone()),
            accounts_url: sp
                .accounts_url
                .unwrap_or_else(|| cli.spotify_accounts_url.clone()),
            api_url: sp.api_url.unwrap_or_else(|| cli.spotify_api_url.clone()),
            redirect_uri: sp.redirect_uri.unwrap_or_else(|| cli.redirect_uri.clone()),
            timeout_sec: sp.timeout_sec.unwrap_or(cli.http_timeout_sec),
            page_size,
            token_safety_margin: Duration::from_secs(
                sp.token_safety_margin_sec
                    .unwrap_or(cli.token_safety_margin_sec),
            ),
        };

        let retry_file = file.retry.unwrap_or_default();
        let defaults = RetrySettings::default();
        let retry = RetrySettings {
            max_attempts: retry_file.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff_ms: retry_file
                .initial_backoff_ms
                .unwrap_or(defaults.initial_backoff_ms),
            max_backoff_ms: retry_file.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            backoff_multiplier: retry_file
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
        };
        if retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            bail!(
                "retry.backoff_multiplier must be a finite number >= 1.0, got {}",
                retry.backoff_multiplier
            );
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            bail!(
                "retry.initial_backoff_ms ({}) must not exceed retry.max_backoff_ms ({})",
                retry.initial_backoff_ms,
                retry.max_backoff_ms
            );
        }

        Ok(Self {
            db_dir,
            busy_timeout,
            spotify,
            retry,
        })
    }

    pub fn catalog_db_path(&self) -> PathBuf {
        self.db_dir.join("catalog.db")
    }

    pub fn user_db_path(&self) -> PathBuf {
        self.db_dir.join("user.db")
    }

    /// Settings for the Spotify HTTP client. Fails if the application
    /// credentials were not configured.
    pub fn spotify_client_config(&self) -> Result<SpotifyClientConfig> {
        let (Some(client_id), Some(client_secret)) =
            (&self.spotify.client_id, &self.spotify.client_secret)
        else {
            bail!("Spotify client_id and client_secret must be configured");
        };
        Ok(SpotifyClientConfig {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            accounts_url: self.spotify.accounts_url.clone(),
            api_url: self.spotify.api_url.clone(),
            timeout_sec: self.spotify.timeout_sec,
            page_size: self.spotify.page_size,
            retry: RetryPolicy::new(&self.retry),
        })
    }
}
