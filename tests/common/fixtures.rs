//! Test environment wiring and playlist item builders

use super::constants::*;
use super::server::MockSpotify;
use chrono::{Duration as ChronoDuration, Utc};
use playlist_catalog_server::catalog_store::SqliteCatalogStore;
use playlist_catalog_server::credentials::{Credential, CredentialStore};
use playlist_catalog_server::import::{ImportError, PlaylistImportResult, PlaylistImporter};
use playlist_catalog_server::spotify::{RetryPolicy, SpotifyClient, SpotifyClientConfig};
use playlist_catalog_server::{SqliteCredentialStore, TokenStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A playlist item as returned by `GET /v1/playlists/{id}/tracks`.
///
/// The album and its artist are named after their ids.
pub fn track_item(track_id: &str, album_id: &str, artist_id: &str) -> Value {
    let artist = json!({"id": artist_id, "name": format!("Artist {}", artist_id)});
    json!({
        "added_at": "2024-03-01T12:00:00Z",
        "is_local": false,
        "track": {
            "type": "track",
            "id": track_id,
            "name": format!("Track {}", track_id),
            "duration_ms": 201_000,
            "track_number": 1,
            "is_local": false,
            "album": {
                "id": album_id,
                "name": format!("Album {}", album_id),
                "release_date": "2024-02-16",
                "images": [{"url": format!("https://i.scdn.co/image/{}", album_id), "width": 640, "height": 640}],
                "artists": [artist.clone()]
            },
            "artists": [artist]
        }
    })
}

fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(20),
        backoff_multiplier: 2.0,
    }
}

/// Everything an end-to-end test needs: the mock service, the real client,
/// and stores backed by temporary databases.
pub struct TestEnv {
    pub spotify: MockSpotify,
    pub client: Arc<SpotifyClient>,
    pub store: Arc<SqliteCatalogStore>,
    pub credentials: Arc<SqliteCredentialStore>,
    pub tokens: Arc<TokenStore>,
    pub importer: PlaylistImporter,
    db_dir: TempDir,
    busy_timeout: Duration,
}

impl TestEnv {
    pub async fn spawn() -> Self {
        Self::spawn_with_busy_timeout(Duration::from_secs(5)).await
    }

    /// Like `spawn`, with catalog connections giving up on a locked database
    /// after `busy_timeout`.
    pub async fn spawn_with_busy_timeout(busy_timeout: Duration) -> Self {
        let spotify = MockSpotify::spawn().await;
        let db_dir = TempDir::new().expect("Failed to create temp dir");

        let client = Arc::new(
            SpotifyClient::new(SpotifyClientConfig {
                client_id: CLIENT_ID.to_string(),
                client_secret: CLIENT_SECRET.to_string(),
                accounts_url: spotify.base_url.clone(),
                api_url: spotify.base_url.clone(),
                timeout_sec: 5,
                page_size: PAGE_SIZE,
                retry: fast_retry_policy(),
            })
            .expect("Failed to create Spotify client"),
        );
        let store = Arc::new(
            SqliteCatalogStore::new(db_dir.path().join("catalog.db"), busy_timeout)
                .expect("Failed to open catalog store"),
        );
        let credentials = Arc::new(
            SqliteCredentialStore::new(db_dir.path().join("user.db"))
                .expect("Failed to open credential store"),
        );
        let tokens = Arc::new(TokenStore::new(
            client.clone(),
            credentials.clone(),
            Duration::from_secs(60),
        ));
        let importer = PlaylistImporter::new(client.clone(), tokens.clone(), store.clone());

        Self {
            spotify,
            client,
            store,
            credentials,
            tokens,
            importer,
            db_dir,
            busy_timeout,
        }
    }

    /// A second token store over the same credential database, as after a
    /// process restart.
    pub fn reopen_tokens(&self) -> TokenStore {
        let credentials = SqliteCredentialStore::new(self.db_dir.path().join("user.db"))
            .expect("Failed to reopen credential store");
        TokenStore::new(
            self.client.clone(),
            Arc::new(credentials),
            Duration::from_secs(60),
        )
    }

    /// A second catalog store handle on the same database.
    pub fn reopen_store(&self) -> Arc<SqliteCatalogStore> {
        Arc::new(
            SqliteCatalogStore::new(self.db_dir.path().join("catalog.db"), self.busy_timeout)
                .expect("Failed to reopen catalog store"),
        )
    }

    /// Store a credential for `user` whose access token expires in
    /// `expires_in_secs` (negative for an already expired token).
    pub fn link_user(&self, user: &str, expires_in_secs: i64) {
        self.spotify.accept_access_token(LINKED_ACCESS_TOKEN);
        self.credentials
            .save(&Credential {
                owner_id: user.to_string(),
                access_token: LINKED_ACCESS_TOKEN.to_string(),
                refresh_token: LINKED_REFRESH_TOKEN.to_string(),
                expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
                scope: Some("playlist-read-private".to_string()),
            })
            .expect("Failed to save credential");
    }

    pub async fn import(
        &self,
        user: &str,
        playlist_id: &str,
    ) -> Result<PlaylistImportResult, ImportError> {
        self.importer
            .import_playlist(user, playlist_id, &CancellationToken::new())
            .await
    }
}
