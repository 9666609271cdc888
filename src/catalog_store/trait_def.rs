//! Storage traits consumed by the import pipeline.
//!
//! `CatalogStore` covers operations that run in their own implicit transaction
//! (playlist shell creation, reads). `ImportTransaction` is the minimal
//! query/transaction interface an import drives: lookups and inserts by external
//! id, playlist positions, and the final commit or rollback.

use super::error::StoreError;
use super::models::*;

pub trait CatalogStore: Send + Sync {
    // =========================================================================
    // Writes outside the import transaction
    // =========================================================================

    /// Create a playlist shell and return its local id. Committed immediately.
    fn create_playlist(&self, playlist: &NewPlaylist) -> Result<i64, StoreError>;

    /// Open a new transaction for the item phase of an import.
    ///
    /// The returned transaction owns its connection; dropping it without calling
    /// `commit` rolls everything back.
    fn begin_import(&self) -> Result<Box<dyn ImportTransaction>, StoreError>;

    // =========================================================================
    // Reads
    // =========================================================================

    fn get_playlist(&self, id: i64) -> Result<Option<Playlist>, StoreError>;

    /// Tracks of a playlist ordered by position.
    fn get_playlist_entries(&self, playlist_id: i64) -> Result<Vec<PlaylistEntry>, StoreError>;

    fn get_artist_by_external_id(&self, external_id: &str)
        -> Result<Option<ArtistRecord>, StoreError>;

    fn get_album_by_external_id(&self, external_id: &str)
        -> Result<Option<AlbumRecord>, StoreError>;

    fn get_track_by_external_id(&self, external_id: &str)
        -> Result<Option<TrackRecord>, StoreError>;

    fn get_counts(&self) -> Result<CatalogCounts, StoreError>;
}

pub trait ImportTransaction: Send {
    // =========================================================================
    // Artists
    // =========================================================================

    fn find_artist(&mut self, external_id: &str) -> Result<Option<ArtistRecord>, StoreError>;

    /// Insert a new artist. Fails with `StoreError::UniqueViolation` if a row with
    /// the same external id already exists.
    fn insert_artist(&mut self, external_id: &str, fields: &ArtistFields)
        -> Result<i64, StoreError>;

    fn update_artist(&mut self, id: i64, fields: &ArtistFields) -> Result<(), StoreError>;

    // =========================================================================
    // Albums
    // =========================================================================

    fn find_album(&mut self, external_id: &str) -> Result<Option<AlbumRecord>, StoreError>;

    fn insert_album(
        &mut self,
        external_id: &str,
        artist_id: i64,
        fields: &AlbumFields,
    ) -> Result<i64, StoreError>;

    fn update_album(&mut self, id: i64, fields: &AlbumFields) -> Result<(), StoreError>;

    // =========================================================================
    // Tracks
    // =========================================================================

    fn find_track(&mut self, external_id: &str) -> Result<Option<TrackRecord>, StoreError>;

    fn insert_track(
        &mut self,
        external_id: &str,
        album_id: i64,
        fields: &TrackFields,
    ) -> Result<i64, StoreError>;

    fn update_track(&mut self, id: i64, fields: &TrackFields) -> Result<(), StoreError>;

    // =========================================================================
    // Playlist positions and lifecycle
    // =========================================================================

    /// Place `track_id` at `position` in the playlist.
    ///
    /// Returns `false` without writing anything if the track already occupies a
    /// position in this playlist.
    fn insert_playlist_track(
        &mut self,
        playlist_id: i64,
        track_id: i64,
        position: i64,
    ) -> Result<bool, StoreError>;

    /// Whether the underlying transaction is still open and can accept writes.
    fn is_active(&self) -> bool;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
