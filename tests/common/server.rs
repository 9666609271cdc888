//! In-process mock of the Spotify accounts service and Web API
//!
//! Serves `POST /api/token`, `GET /v1/playlists/{id}` and
//! `GET /v1/playlists/{id}/tracks` on a random local port. Tests tune its
//! behaviour (delays, failures, revoked tokens) through the setters and read
//! back request counters.

use super::constants::*;
use axum::extract::{Form, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Default)]
struct MockState {
    base_url: String,
    refresh_calls: AtomicU32,
    code_exchanges: AtomicU32,
    page_requests: AtomicU32,
    minted: AtomicU32,
    rotate_refresh_tokens: Mutex<bool>,
    token_delay: Mutex<Duration>,
    revoked_refresh_tokens: Mutex<HashSet<String>>,
    valid_access_tokens: Mutex<HashSet<String>>,
    playlists: Mutex<HashMap<String, Vec<Value>>>,
    /// Offsets that always answer 500.
    failing_offsets: Mutex<HashSet<usize>>,
    /// Offsets that answer 429 once before succeeding.
    rate_limited_offsets: Mutex<HashSet<usize>>,
    slow_offsets: Mutex<HashMap<usize, Duration>>,
    /// Offsets whose `next` link points back at themselves.
    looping_offsets: Mutex<HashSet<usize>>,
}

impl MockState {
    fn mint_token_response(&self, refresh_token: Option<String>) -> Value {
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        let access_token = format!("access-{}", n);
        self.valid_access_tokens
            .lock()
            .unwrap()
            .insert(access_token.clone());
        let mut body = json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "playlist-read-private"
        });
        if let Some(refresh_token) = refresh_token {
            body["refresh_token"] = json!(refresh_token);
        }
        body
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| self.valid_access_tokens.lock().unwrap().contains(token))
            .unwrap_or(false)
    }
}

fn oauth_error(error: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": error, "error_description": "Invalid refresh token"})),
    )
        .into_response()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"status": 401, "message": "The access token expired"}})),
    )
        .into_response()
}

async fn token(State(state): State<Arc<MockState>>, Form(form): Form<HashMap<String, String>>) -> Response {
    let delay = *state.token_delay.lock().unwrap();
    tokio::time::sleep(delay).await;

    match form.get("grant_type").map(String::as_str) {
        Some("refresh_token") => {
            state.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let Some(refresh_token) = form.get("refresh_token") else {
                return oauth_error("invalid_request");
            };
            if state.revoked_refresh_tokens.lock().unwrap().contains(refresh_token) {
                return oauth_error("invalid_grant");
            }
            let rotated = if *state.rotate_refresh_tokens.lock().unwrap() {
                Some(format!("rotated-{}", state.refresh_calls.load(Ordering::SeqCst)))
            } else {
                None
            };
            Json(state.mint_token_response(rotated)).into_response()
        }
        Some("authorization_code") => {
            state.code_exchanges.fetch_add(1, Ordering::SeqCst);
            if form.get("code").map(String::as_str) != Some(VALID_AUTH_CODE) {
                return oauth_error("invalid_grant");
            }
            let refresh_token = format!(
                "code-refresh-{}",
                state.code_exchanges.load(Ordering::SeqCst)
            );
            Json(state.mint_token_response(Some(refresh_token))).into_response()
        }
        _ => oauth_error("unsupported_grant_type"),
    }
}

async fn playlist(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    if !state.playlists.lock().unwrap().contains_key(&id) {
        return (StatusCode::NOT_FOUND, Json(json!({"error": {"status": 404}}))).into_response();
    }
    Json(json!({
        "id": id,
        "name": PLAYLIST_NAME,
        "description": "The hottest tracks right now.",
        "images": [{"url": "https://i.scdn.co/image/cover", "width": 640, "height": 640}],
        "owner": {"id": "spotify", "display_name": "Spotify"}
    }))
    .into_response()
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn playlist_tracks(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> Response {
    state.page_requests.fetch_add(1, Ordering::SeqCst);
    if !state.authorized(&headers) {
        return unauthorized();
    }

    let delay = state.slow_offsets.lock().unwrap().get(&query.offset).copied();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if state.failing_offsets.lock().unwrap().contains(&query.offset) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if state.rate_limited_offsets.lock().unwrap().remove(&query.offset) {
        return (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "0")]).into_response();
    }

    let Some(items) = state.playlists.lock().unwrap().get(&id).cloned() else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": {"status": 404}}))).into_response();
    };
    let end = (query.offset + query.limit).min(items.len());
    let page: Vec<Value> = items[query.offset.min(end)..end].to_vec();
    let next_offset = if state.looping_offsets.lock().unwrap().contains(&query.offset) {
        Some(query.offset)
    } else {
        (end < items.len()).then_some(end)
    };
    let next = next_offset.map(|offset| {
        format!(
            "{}/v1/playlists/{}/tracks?offset={}&limit={}",
            state.base_url, id, offset, query.limit
        )
    });

    Json(json!({
        "items": page,
        "next": next,
        "offset": query.offset,
        "limit": query.limit,
        "total": items.len()
    }))
    .into_response()
}

/// Mock Spotify instance
///
/// When dropped, the server shuts down.
pub struct MockSpotify {
    /// Base URL of both the accounts service and the Web API
    pub base_url: String,
    state: Arc<MockState>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockSpotify {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let state = Arc::new(MockState {
            base_url: base_url.clone(),
            ..Default::default()
        });
        let app = Router::new()
            .route("/api/token", post(token))
            .route("/v1/playlists/{id}", get(playlist))
            .route("/v1/playlists/{id}/tracks", get(playlist_tracks))
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Mock Spotify failed");
        });

        let server = Self {
            base_url,
            state,
            _shutdown_tx: Some(shutdown_tx),
        };
        server.wait_for_ready().await;
        server
    }

    async fn wait_for_ready(&self) {
        let client = reqwest::Client::new();
        let start = std::time::Instant::now();
        loop {
            if start.elapsed() > Duration::from_millis(SERVER_READY_TIMEOUT_MS) {
                panic!("Mock Spotify did not become ready");
            }
            if client
                .post(format!("{}/api/token", self.base_url))
                .send()
                .await
                .is_ok()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ========================================================================
    // Setup
    // ========================================================================

    pub fn set_playlist(&self, id: &str, items: Vec<Value>) {
        self.state
            .playlists
            .lock()
            .unwrap()
            .insert(id.to_string(), items);
    }

    /// Make `token` acceptable as a bearer token, as if issued earlier.
    pub fn accept_access_token(&self, token: &str) {
        self.state
            .valid_access_tokens
            .lock()
            .unwrap()
            .insert(token.to_string());
    }

    pub fn revoke_access_token(&self, token: &str) {
        self.state.valid_access_tokens.lock().unwrap().remove(token);
    }

    pub fn revoke_refresh_token(&self, token: &str) {
        self.state
            .revoked_refresh_tokens
            .lock()
            .unwrap()
            .insert(token.to_string());
    }

    pub fn rotate_refresh_tokens(&self, rotate: bool) {
        *self.state.rotate_refresh_tokens.lock().unwrap() = rotate;
    }

    pub fn set_token_delay(&self, delay: Duration) {
        *self.state.token_delay.lock().unwrap() = delay;
    }

    pub fn fail_page_at(&self, offset: usize) {
        self.state.failing_offsets.lock().unwrap().insert(offset);
    }

    pub fn rate_limit_page_once(&self, offset: usize) {
        self.state.rate_limited_offsets.lock().unwrap().insert(offset);
    }

    pub fn slow_page_at(&self, offset: usize, delay: Duration) {
        self.state.slow_offsets.lock().unwrap().insert(offset, delay);
    }

    /// The page at `offset` links to itself as the next page.
    pub fn loop_page_at(&self, offset: usize) {
        self.state.looping_offsets.lock().unwrap().insert(offset);
    }

    // ========================================================================
    // Counters
    // ========================================================================

    pub fn refresh_calls(&self) -> u32 {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn code_exchanges(&self) -> u32 {
        self.state.code_exchanges.load(Ordering::SeqCst)
    }

    pub fn page_requests(&self) -> u32 {
        self.state.page_requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockSpotify {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
