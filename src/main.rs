use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use playlist_catalog_server::catalog_store::{CatalogStore, SqliteCatalogStore};
use playlist_catalog_server::config::{self, AppConfig, CliConfig, FileConfig};
use playlist_catalog_server::credentials::{SqliteCredentialStore, TokenStore};
use playlist_catalog_server::import::{ImportError, ItemStatus, PlaylistImporter};
use playlist_catalog_server::metrics;
use playlist_catalog_server::spotify::SpotifyClient;

const SCOPES: &[&str] = &["playlist-read-private", "playlist-read-collaborative"];

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(version = env!("GIT_HASH"))]
struct CliArgs {
    /// Path to a TOML config file. Its values override the command line.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding catalog.db and user.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Spotify application client id.
    #[clap(long)]
    pub spotify_client_id: Option<String>,

    /// Spotify application client secret.
    #[clap(long)]
    pub spotify_client_secret: Option<String>,

    #[clap(long, default_value = config::DEFAULT_ACCOUNTS_URL)]
    pub spotify_accounts_url: String,

    #[clap(long, default_value = config::DEFAULT_API_URL)]
    pub spotify_api_url: String,

    /// Redirect URI registered for the Spotify application.
    #[clap(long, default_value = config::DEFAULT_REDIRECT_URI)]
    pub redirect_uri: String,

    /// Timeout in seconds for each Spotify request.
    #[clap(long, default_value_t = 30)]
    pub http_timeout_sec: u64,

    /// Number of playlist items requested per page (1-100).
    #[clap(long, default_value_t = 100)]
    pub page_size: u32,

    /// Access tokens expiring within this many seconds are refreshed first.
    #[clap(long, default_value_t = 60)]
    pub token_safety_margin_sec: u64,

    /// How long an import waits for another import's write lock.
    #[clap(long, default_value_t = 30)]
    pub busy_timeout_sec: u64,

    #[command(subcommand)]
    command: Command,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            spotify_client_id: self.spotify_client_id.clone(),
            spotify_client_secret: self.spotify_client_secret.clone(),
            spotify_accounts_url: self.spotify_accounts_url.clone(),
            spotify_api_url: self.spotify_api_url.clone(),
            redirect_uri: self.redirect_uri.clone(),
            http_timeout_sec: self.http_timeout_sec,
            page_size: self.page_size,
            token_safety_margin_sec: self.token_safety_margin_sec,
            busy_timeout_sec: self.busy_timeout_sec,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints the Spotify consent page URL for linking an account.
    AuthorizeUrl {
        #[clap(long, default_value = "link")]
        state: String,
    },

    /// Links a user's Spotify account, either from the authorization code
    /// of the consent redirect or from an existing refresh token.
    Link {
        user_id: String,
        #[clap(long, conflicts_with = "refresh_token", required_unless_present = "refresh_token")]
        code: Option<String>,
        #[clap(long)]
        refresh_token: Option<String>,
    },

    /// Forgets a user's linked Spotify account.
    Unlink { user_id: String },

    /// Imports a Spotify playlist for a user. Ctrl-C cancels the import.
    Import {
        user_id: String,
        playlist_id: String,
        /// Print the full result as JSON.
        #[clap(long)]
        json: bool,
        /// Print metrics in the Prometheus text format when done.
        #[clap(long)]
        print_metrics: bool,
    },

    /// Prints the tracks of a local playlist.
    Show { playlist_id: i64 },

    /// Prints catalog row counts.
    Stats,
}

struct Services {
    store: Arc<SqliteCatalogStore>,
    tokens: Arc<TokenStore>,
    client: Arc<SpotifyClient>,
}

fn open_catalog(config: &AppConfig) -> Result<Arc<SqliteCatalogStore>> {
    info!("Opening catalog database at {:?}...", config.catalog_db_path());
    Ok(Arc::new(SqliteCatalogStore::new(
        config.catalog_db_path(),
        config.busy_timeout,
    )?))
}

fn open_services(config: &AppConfig) -> Result<Services> {
    let store = open_catalog(config)?;
    let client = Arc::new(SpotifyClient::new(config.spotify_client_config()?)?);
    let credentials = Arc::new(SqliteCredentialStore::new(config.user_db_path())?);
    let tokens = Arc::new(TokenStore::new(
        client.clone(),
        credentials,
        config.spotify.token_safety_margin,
    ));
    Ok(Services {
        store,
        tokens,
        client,
    })
}

async fn run_import(
    config: &AppConfig,
    user_id: &str,
    playlist_id: &str,
    json: bool,
) -> Result<()> {
    let services = open_services(config)?;
    let importer = PlaylistImporter::new(
        services.client.clone(),
        services.tokens.clone(),
        services.store.clone(),
    );

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling import...");
            ctrl_c_cancel.cancel();
        }
    });

    let result = match importer.import_playlist(user_id, playlist_id, &cancel).await {
        Ok(result) => result,
        Err(ImportError::AuthenticationRequired(reason)) => bail!(
            "Spotify account of {} must be linked again ({}). Run the `link` command.",
            user_id,
            reason
        ),
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "Local playlist {}: {} of {} items imported, {} skipped, {} failed",
            result.playlist_id, result.succeeded, result.attempted, result.skipped, result.failed
        );
        for outcome in result.failures() {
            if let ItemStatus::Failed { error } = &outcome.status {
                println!(
                    "  item {} ({}): {}",
                    outcome.index,
                    outcome.external_id.as_deref().unwrap_or("no id"),
                    error
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;
    metrics::init_metrics();

    match cli_args.command {
        Command::AuthorizeUrl { state } => {
            let client = SpotifyClient::new(config.spotify_client_config()?)?;
            println!(
                "{}",
                client.authorize_url(&config.spotify.redirect_uri, SCOPES, &state)
            );
        }
        Command::Link {
            user_id,
            code,
            refresh_token,
        } => {
            let services = open_services(&config)?;
            let credential = match (code, refresh_token) {
                (Some(code), _) => {
                    services
                        .tokens
                        .link(&user_id, &code, &config.spotify.redirect_uri)
                        .await?
                }
                (None, Some(refresh_token)) => {
                    services
                        .tokens
                        .link_refresh_token(&user_id, &refresh_token)
                        .await?
                }
                (None, None) => bail!("Either --code or --refresh-token is required"),
            };
            println!(
                "Linked Spotify account for {} (access token valid until {})",
                user_id, credential.expires_at
            );
        }
        Command::Unlink { user_id } => {
            let services = open_services(&config)?;
            if services.tokens.unlink(&user_id).await? {
                println!("Unlinked Spotify account for {}", user_id);
            } else {
                println!("No Spotify account linked for {}", user_id);
            }
        }
        Command::Import {
            user_id,
            playlist_id,
            json,
            print_metrics,
        } => {
            run_import(&config, &user_id, &playlist_id, json).await?;
            if print_metrics {
                print!("{}", metrics::render());
            }
        }
        Command::Show { playlist_id } => {
            let store = open_catalog(&config)?;
            let Some(playlist) = store.get_playlist(playlist_id)? else {
                bail!("Playlist {} not found", playlist_id);
            };
            println!(
                "{} (owner {}, spotify {})",
                playlist.name,
                playlist.owner_id,
                playlist.external_id.as_deref().unwrap_or("-")
            );
            for entry in store.get_playlist_entries(playlist_id)? {
                println!(
                    "{:>4}. {} - {} [{}]",
                    entry.position, entry.artist_name, entry.track_name, entry.album_name
                );
            }
        }
        Command::Stats => {
            let counts = open_catalog(&config)?.get_counts()?;
            println!(
                "artists: {}\nalbums: {}\ntracks: {}\nplaylists: {}",
                counts.artists, counts.albums, counts.tracks, counts.playlists
            );
        }
    }

    Ok(())
}
