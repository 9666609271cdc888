//! End-to-end playlist import.
//!
//! The playlist shell is committed on its own before any item is touched, so it
//! survives a failed or cancelled item phase. The Spotify listing is then walked
//! to the end, and only after that are all items resolved and positioned inside
//! one transaction. The write lock is therefore never held across a network
//! call, and other imports can create their shells meanwhile. A bad item is
//! recorded and skipped; only a transaction-level failure or cancellation throws
//! the phase away.

use async_trait::async_trait;
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::{
    ImportError, ItemOutcome, ItemStatus, PlaylistImportResult, SkipReason,
};
use super::page_walker::{Page, PageFetcher, PageWalker};
use super::resolver::{EntityResolver, ResolveError, TrackRefs};
use crate::catalog_store::{CatalogStore, ImportTransaction, NewPlaylist, StoreError};
use crate::credentials::TokenStore;
use crate::metrics;
use crate::spotify::models::{best_image, PlaylistItem, SpotifyPlaylist};
use crate::spotify::{SpotifyApi, SpotifyError};

/// Spotify calls made on behalf of one user, retrying once with a fresh token
/// when the current one is rejected.
struct SpotifySession<'a> {
    api: &'a dyn SpotifyApi,
    tokens: &'a TokenStore,
    owner_id: &'a str,
    access_token: String,
}

impl SpotifySession<'_> {
    async fn reauthorize(&mut self) -> Result<(), ImportError> {
        debug!("Access token for {} rejected, refreshing", self.owner_id);
        self.tokens.invalidate(self.owner_id).await;
        self.access_token = self.tokens.get_valid(self.owner_id).await?.access_token;
        Ok(())
    }

    async fn playlist(&mut self, playlist_id: &str) -> Result<SpotifyPlaylist, ImportError> {
        match self.api.get_playlist(&self.access_token, playlist_id).await {
            Err(SpotifyError::Unauthorized) => {
                self.reauthorize().await?;
                Ok(self.api.get_playlist(&self.access_token, playlist_id).await?)
            }
            other => Ok(other?),
        }
    }

    async fn items_page(
        &mut self,
        playlist_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<serde_json::Value>, ImportError> {
        match self
            .api
            .get_playlist_items(&self.access_token, playlist_id, cursor)
            .await
        {
            Err(SpotifyError::Unauthorized) => {
                self.reauthorize().await?;
                Ok(self
                    .api
                    .get_playlist_items(&self.access_token, playlist_id, cursor)
                    .await?)
            }
            other => Ok(other?),
        }
    }
}

struct PlaylistItemPages<'a> {
    session: SpotifySession<'a>,
    playlist_id: &'a str,
}

#[async_trait]
impl<'a> PageFetcher for PlaylistItemPages<'a> {
    type Item = serde_json::Value;
    type Error = ImportError;

    async fn fetch(&mut self, cursor: Option<&str>) -> Result<Page<Self::Item>, ImportError> {
        self.session.items_page(self.playlist_id, cursor).await
    }
}

pub struct PlaylistImporter {
    api: Arc<dyn SpotifyApi>,
    tokens: Arc<TokenStore>,
    store: Arc<dyn CatalogStore>,
    resolver: EntityResolver,
}

impl PlaylistImporter {
    pub fn new(
        api: Arc<dyn SpotifyApi>,
        tokens: Arc<TokenStore>,
        store: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            api,
            tokens,
            store,
            resolver: EntityResolver::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: EntityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Import the Spotify playlist `playlist_id` for `user_id` into a new local
    /// playlist.
    pub async fn import_playlist(
        &self,
        user_id: &str,
        playlist_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PlaylistImportResult, ImportError> {
        let started = Instant::now();
        let result = self.run_import(user_id, playlist_id, cancel).await;
        match &result {
            Ok(r) => {
                info!(
                    "Imported playlist {} for {} as {}: {}/{} items ({} skipped, {} failed) in {:?}",
                    playlist_id,
                    user_id,
                    r.playlist_id,
                    r.succeeded,
                    r.attempted,
                    r.skipped,
                    r.failed,
                    started.elapsed()
                );
                metrics::record_import("completed", started.elapsed());
            }
            Err(e) => {
                warn!("Import of playlist {} for {} failed: {}", playlist_id, user_id, e);
                metrics::record_import(e.kind(), started.elapsed());
            }
        }
        result
    }

    async fn run_import(
        &self,
        user_id: &str,
        playlist_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PlaylistImportResult, ImportError> {
        let credential = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ImportError::Cancelled),
            credential = self.tokens.get_valid(user_id) => credential?,
        };
        let mut session = SpotifySession {
            api: self.api.as_ref(),
            tokens: self.tokens.as_ref(),
            owner_id: user_id,
            access_token: credential.access_token,
        };

        let metadata = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ImportError::Cancelled),
            metadata = session.playlist(playlist_id) => metadata?,
        };
        let shell = NewPlaylist {
            owner_id: user_id.to_string(),
            external_id: Some(metadata.id.clone()),
            name: metadata.name.clone(),
            description: metadata.description.clone().filter(|d| !d.is_empty()),
            cover_url: best_image(&metadata.images).map(str::to_string),
        };
        let local_playlist_id =
            with_store(&self.store, move |store| store.create_playlist(&shell)).await?;
        debug!(
            "Created local playlist {} for Spotify playlist {}",
            local_playlist_id, playlist_id
        );

        // The listing is walked before the item transaction opens, so no write
        // lock is held while waiting on Spotify.
        let walker = PageWalker::new(PlaylistItemPages {
            session,
            playlist_id,
        });
        let items: Vec<serde_json::Value> = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ImportError::Cancelled),
            items = walker.into_stream().try_collect::<Vec<_>>() => items?,
        };
        debug!(
            "Listed {} items of Spotify playlist {}",
            items.len(),
            playlist_id
        );

        let apply = ItemPhase {
            store: self.store.clone(),
            resolver: self.resolver.clone(),
            playlist_id: local_playlist_id,
            source_id: playlist_id.to_string(),
            cancel: cancel.clone(),
        };
        // Not raced against `cancel`: the phase observes it between items and
        // must finish its rollback before the import returns.
        let result = match tokio::task::spawn_blocking(move || apply.run(items)).await {
            Ok(result) => result?,
            Err(e) => {
                warn!("Import item phase panicked: {}", e);
                return Err(ImportError::TransactionFailed(StoreError::TransactionAborted));
            }
        };

        if let Ok(counts) = self.store.get_counts() {
            metrics::set_catalog_counts(&counts);
        }
        Ok(result)
    }
}

/// The transactional half of an import: resolve and position every listed item
/// inside one transaction, then commit. Runs on the blocking pool and only does
/// local work, so the write lock is held for as short as possible.
struct ItemPhase {
    store: Arc<dyn CatalogStore>,
    resolver: EntityResolver,
    playlist_id: i64,
    /// Spotify playlist id, for logs.
    source_id: String,
    cancel: CancellationToken,
}

impl ItemPhase {
    fn run(self, items: Vec<serde_json::Value>) -> Result<PlaylistImportResult, ImportError> {
        if self.cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        let mut tx = self
            .store
            .begin_import()
            .map_err(ImportError::TransactionFailed)?;
        let mut result = PlaylistImportResult::new(self.playlist_id);
        let mut next_position = 1;

        for (index, raw) in items.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(abort(tx, ImportError::Cancelled));
            }

            let (external_id, status) = match self.import_item(tx.as_mut(), raw, &mut next_position)
            {
                Ok(imported) => imported,
                Err((external_id, e)) => {
                    if e.is_transaction_fatal() || !tx.is_active() {
                        let err = match e {
                            ResolveError::Store(store_err) if store_err.is_transaction_fatal() => {
                                store_err
                            }
                            _ => StoreError::TransactionAborted,
                        };
                        return Err(abort(tx, ImportError::TransactionFailed(err)));
                    }
                    warn!(
                        "Item {} ({}) of playlist {} failed: {}",
                        index,
                        external_id.as_deref().unwrap_or("no id"),
                        self.source_id,
                        e
                    );
                    let error = e.to_string();
                    (external_id, ItemStatus::Failed { error })
                }
            };
            metrics::record_import_item(match status {
                ItemStatus::Imported { .. } => "imported",
                ItemStatus::Skipped { .. } => "skipped",
                ItemStatus::Failed { .. } => "failed",
            });
            result.record(ItemOutcome {
                index,
                external_id,
                status,
            });
        }

        if self.cancel.is_cancelled() {
            return Err(abort(tx, ImportError::Cancelled));
        }
        tx.commit().map_err(ImportError::TransactionFailed)?;
        Ok(result)
    }

    /// Resolve and position one raw playlist item. The track's external id is
    /// returned alongside the status or error whenever it could be read.
    fn import_item(
        &self,
        tx: &mut dyn ImportTransaction,
        raw: serde_json::Value,
        next_position: &mut i64,
    ) -> Result<(Option<String>, ItemStatus), (Option<String>, ResolveError)> {
        let item: PlaylistItem = serde_json::from_value(raw)
            .map_err(|e| (None, ResolveError::Malformed(e.to_string())))?;

        let track = match item.track {
            Some(track) => track,
            None => return Ok((None, skipped(SkipReason::Unavailable))),
        };
        let external_id = track.id.clone();
        if track.is_episode() {
            return Ok((external_id, skipped(SkipReason::Episode)));
        }

        let refs = TrackRefs::from_playable(&track).map_err(|e| (external_id.clone(), e))?;
        let resolved = self
            .resolver
            .resolve_item(tx, &refs)
            .map_err(|e| (external_id.clone(), e))?;

        let placed = tx
            .insert_playlist_track(self.playlist_id, resolved.track_id, *next_position)
            .map_err(|e| (external_id.clone(), ResolveError::Store(e)))?;
        if !placed {
            return Ok((external_id, skipped(SkipReason::Duplicate)));
        }

        let position = *next_position;
        *next_position += 1;
        Ok((
            external_id,
            ItemStatus::Imported {
                position,
                track_id: resolved.track_id,
            },
        ))
    }
}

/// Run a store call that may block on another connection's write lock on the
/// blocking pool, so a waiting import does not stall the runtime.
async fn with_store<T, F>(store: &Arc<dyn CatalogStore>, op: F) -> Result<T, ImportError>
where
    F: FnOnce(&dyn CatalogStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    match tokio::task::spawn_blocking(move || op(store.as_ref())).await {
        Ok(result) => result.map_err(ImportError::TransactionFailed),
        Err(e) => {
            warn!("Blocking store call panicked: {}", e);
            Err(ImportError::TransactionFailed(StoreError::TransactionAborted))
        }
    }
}

fn skipped(reason: SkipReason) -> ItemStatus {
    ItemStatus::Skipped { reason }
}

/// Roll back the item phase and hand back the error that caused it.
fn abort(tx: Box<dyn ImportTransaction>, err: ImportError) -> ImportError {
    if let Err(e) = tx.rollback() {
        warn!("Rollback after failed import also failed: {}", e);
    }
    err
}
