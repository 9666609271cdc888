//! Cascading resolve-or-create of artists, albums and tracks.
//!
//! Lookups and inserts run inside the caller's import transaction. Insert races
//! on an external id are settled by the unique constraint: the loser sees
//! `StoreError::UniqueViolation` and re-reads the winner's row.

use crate::catalog_store::{
    AlbumFields, ArtistFields, EntityKind, ImportTransaction, StoreError, TrackFields,
};
use crate::spotify::models::{best_image, PlayableItem, SimplifiedArtist};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Malformed item: {0}")]
    Malformed(String),

    #[error("Expected a {expected} reference, got a {actual}")]
    KindMismatch {
        expected: EntityKind,
        actual: EntityKind,
    },

    /// The insert lost a uniqueness race but the winning row is not visible.
    #[error("Conflicting {kind} {external_id} could not be read back")]
    UnresolvedConflict {
        kind: EntityKind,
        external_id: String,
    },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl ResolveError {
    pub fn is_transaction_fatal(&self) -> bool {
        match self {
            ResolveError::Store(e) => e.is_transaction_fatal(),
            _ => false,
        }
    }
}

/// Optional metadata carried by an external reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalMetadata {
    pub image_url: Option<String>,
    pub release_date: Option<String>,
    pub duration_ms: Option<i64>,
    pub track_number: Option<i32>,
}

/// Snapshot of one external entity, used only to derive local rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalItemRef {
    pub external_id: String,
    pub kind: EntityKind,
    pub name: String,
    pub metadata: ExternalMetadata,
}

impl ExternalItemRef {
    pub fn new(kind: EntityKind, external_id: &str, name: &str) -> Self {
        Self {
            external_id: external_id.to_string(),
            kind,
            name: name.to_string(),
            metadata: ExternalMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: ExternalMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn expect_kind(&self, expected: EntityKind) -> Result<(), ResolveError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(ResolveError::KindMismatch {
                expected,
                actual: self.kind,
            })
        }
    }
}

/// The artist, album and track references of one playlist item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRefs {
    pub artist: ExternalItemRef,
    pub album: ExternalItemRef,
    pub track: ExternalItemRef,
}

fn artist_ref(artists: &[SimplifiedArtist]) -> Option<ExternalItemRef> {
    artists.iter().find_map(|a| match (&a.id, &a.name) {
        (Some(id), Some(name)) => Some(ExternalItemRef::new(EntityKind::Artist, id, name)),
        _ => None,
    })
}

impl TrackRefs {
    /// Extract the references of a playable track. Items without an id at any
    /// level (local files, partial objects) are malformed.
    pub fn from_playable(item: &PlayableItem) -> Result<Self, ResolveError> {
        let (track_id, track_name) = match (&item.id, &item.name) {
            (Some(id), Some(name)) => (id, name),
            _ if item.is_local => {
                return Err(ResolveError::Malformed(
                    "local file has no Spotify id".to_string(),
                ))
            }
            _ => return Err(ResolveError::Malformed("track without id or name".to_string())),
        };

        let album = item
            .album
            .as_ref()
            .ok_or_else(|| ResolveError::Malformed(format!("track {} has no album", track_id)))?;
        let (album_id, album_name) = match (&album.id, &album.name) {
            (Some(id), Some(name)) => (id, name),
            _ => {
                return Err(ResolveError::Malformed(format!(
                    "album of track {} has no id or name",
                    track_id
                )))
            }
        };

        // Albums hang off their album artist; fall back to the track's artist.
        let artist = artist_ref(&album.artists)
            .or_else(|| artist_ref(&item.artists))
            .ok_or_else(|| {
                ResolveError::Malformed(format!("track {} has no identifiable artist", track_id))
            })?;

        Ok(Self {
            artist,
            album: ExternalItemRef::new(EntityKind::Album, album_id, album_name).with_metadata(
                ExternalMetadata {
                    image_url: best_image(&album.images).map(str::to_string),
                    release_date: album.release_date.clone(),
                    ..Default::default()
                },
            ),
            track: ExternalItemRef::new(EntityKind::Track, track_id, track_name).with_metadata(
                ExternalMetadata {
                    duration_ms: item.duration_ms,
                    track_number: item.track_number,
                    ..Default::default()
                },
            ),
        })
    }
}

/// Local ids of a resolved playlist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTrack {
    pub artist_id: i64,
    pub album_id: i64,
    pub track_id: i64,
}

#[derive(Debug, Clone)]
pub struct EntityResolver {
    /// Overwrite display fields of existing rows when the external data changed.
    refresh_display_fields: bool,
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self {
            refresh_display_fields: true,
        }
    }
}

impl EntityResolver {
    pub fn new(refresh_display_fields: bool) -> Self {
        Self {
            refresh_display_fields,
        }
    }

    pub fn resolve_artist(
        &self,
        tx: &mut dyn ImportTransaction,
        artist: &ExternalItemRef,
    ) -> Result<i64, ResolveError> {
        artist.expect_kind(EntityKind::Artist)?;
        let fields = ArtistFields {
            name: artist.name.clone(),
            image_url: artist.metadata.image_url.clone(),
        };

        if let Some(existing) = tx.find_artist(&artist.external_id)? {
            if self.refresh_display_fields && existing.fields() != fields {
                tx.update_artist(existing.id, &fields)?;
            }
            return Ok(existing.id);
        }

        match tx.insert_artist(&artist.external_id, &fields) {
            Ok(id) => Ok(id),
            Err(StoreError::UniqueViolation(_)) => {
                debug!("Artist {} inserted concurrently", artist.external_id);
                tx.find_artist(&artist.external_id)?
                    .map(|a| a.id)
                    .ok_or_else(|| conflict(artist))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn resolve_album(
        &self,
        tx: &mut dyn ImportTransaction,
        album: &ExternalItemRef,
        artist_id: i64,
    ) -> Result<i64, ResolveError> {
        album.expect_kind(EntityKind::Album)?;
        let fields = AlbumFields {
            name: album.name.clone(),
            cover_url: album.metadata.image_url.clone(),
            release_date: album.metadata.release_date.clone(),
        };

        if let Some(existing) = tx.find_album(&album.external_id)? {
            if self.refresh_display_fields && existing.fields() != fields {
                tx.update_album(existing.id, &fields)?;
            }
            return Ok(existing.id);
        }

        match tx.insert_album(&album.external_id, artist_id, &fields) {
            Ok(id) => Ok(id),
            Err(StoreError::UniqueViolation(_)) => {
                debug!("Album {} inserted concurrently", album.external_id);
                tx.find_album(&album.external_id)?
                    .map(|a| a.id)
                    .ok_or_else(|| conflict(album))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn resolve_track(
        &self,
        tx: &mut dyn ImportTransaction,
        track: &ExternalItemRef,
        album_id: i64,
    ) -> Result<i64, ResolveError> {
        track.expect_kind(EntityKind::Track)?;
        let fields = TrackFields {
            name: track.name.clone(),
            duration_ms: track.metadata.duration_ms,
            track_number: track.metadata.track_number,
        };

        if let Some(existing) = tx.find_track(&track.external_id)? {
            if self.refresh_display_fields && existing.fields() != fields {
                tx.update_track(existing.id, &fields)?;
            }
            return Ok(existing.id);
        }

        match tx.insert_track(&track.external_id, album_id, &fields) {
            Ok(id) => Ok(id),
            Err(StoreError::UniqueViolation(_)) => {
                debug!("Track {} inserted concurrently", track.external_id);
                tx.find_track(&track.external_id)?
                    .map(|t| t.id)
                    .ok_or_else(|| conflict(track))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve artist, then album, then track. Any failing step fails the whole
    /// item, so a track is never written without its album.
    pub fn resolve_item(
        &self,
        tx: &mut dyn ImportTransaction,
        refs: &TrackRefs,
    ) -> Result<ResolvedTrack, ResolveError> {
        let artist_id = self.resolve_artist(tx, &refs.artist)?;
        let album_id = self.resolve_album(tx, &refs.album, artist_id)?;
        let track_id = self.resolve_track(tx, &refs.track, album_id)?;
        Ok(ResolvedTrack {
            artist_id,
            album_id,
            track_id,
        })
    }
}

fn conflict(item: &ExternalItemRef) -> ResolveError {
    ResolveError::UnresolvedConflict {
        kind: item.kind,
        external_id: item.external_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_store::{
        AlbumRecord, ArtistRecord, CatalogStore, SqliteCatalogStore, TrackRecord,
    };
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, SqliteCatalogStore) {
        let dir = TempDir::new().unwrap();
        let store =
            SqliteCatalogStore::new(dir.path().join("catalog.db"), Duration::from_secs(1))
                .unwrap();
        (dir, store)
    }

    fn refs(artist: &str, album: &str, track: &str) -> TrackRefs {
        TrackRefs {
            artist: ExternalItemRef::new(EntityKind::Artist, artist, &format!("Artist {}", artist)),
            album: ExternalItemRef::new(EntityKind::Album, album, &format!("Album {}", album)),
            track: ExternalItemRef::new(EntityKind::Track, track, &format!("Track {}", track)),
        }
    }

    /// Simulates another transaction winning the insert race: lookups miss
    /// once, then the insert hits the constraint.
    struct RacingTransaction {
        inner: Box<dyn ImportTransaction>,
        hide_next_lookup: bool,
    }

    impl ImportTransaction for RacingTransaction {
        fn find_artist(&mut self, id: &str) -> Result<Option<ArtistRecord>, StoreError> {
            if std::mem::take(&mut self.hide_next_lookup) {
                return Ok(None);
            }
            self.inner.find_artist(id)
        }
        fn insert_artist(&mut self, id: &str, f: &ArtistFields) -> Result<i64, StoreError> {
            self.inner.insert_artist(id, f)
        }
        fn update_artist(&mut self, id: i64, f: &ArtistFields) -> Result<(), StoreError> {
            self.inner.update_artist(id, f)
        }
        fn find_album(&mut self, id: &str) -> Result<Option<AlbumRecord>, StoreError> {
            self.inner.find_album(id)
        }
        fn insert_album(
            &mut self,
            id: &str,
            artist_id: i64,
            f: &AlbumFields,
        ) -> Result<i64, StoreError> {
            self.inner.insert_album(id, artist_id, f)
        }
        fn update_album(&mut self, id: i64, f: &AlbumFields) -> Result<(), StoreError> {
            self.inner.update_album(id, f)
        }
        fn find_track(&mut self, id: &str) -> Result<Option<TrackRecord>, StoreError> {
            self.inner.find_track(id)
        }
        fn insert_track(
            &mut self,
            id: &str,
            album_id: i64,
            f: &TrackFields,
        ) -> Result<i64, StoreError> {
            self.inner.insert_track(id, album_id, f)
        }
        fn update_track(&mut self, id: i64, f: &TrackFields) -> Result<(), StoreError> {
            self.inner.update_track(id, f)
        }
        fn insert_playlist_track(
            &mut self,
            playlist_id: i64,
            track_id: i64,
            position: i64,
        ) -> Result<bool, StoreError> {
            self.inner.insert_playlist_track(playlist_id, track_id, position)
        }
        fn is_active(&self) -> bool {
            self.inner.is_active()
        }
        fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.commit()
        }
        fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.rollback()
        }
    }

    #[test]
    fn test_resolving_twice_returns_same_ids() {
        let (_dir, store) = create_test_store();
        let resolver = EntityResolver::default();
        let mut tx = store.begin_import().unwrap();

        let first = resolver.resolve_item(tx.as_mut(), &refs("ar1", "al1", "t1")).unwrap();
        let second = resolver.resolve_item(tx.as_mut(), &refs("ar1", "al1", "t1")).unwrap();
        assert_eq!(first, second);
        tx.commit().unwrap();

        let counts = store.get_counts().unwrap();
        assert_eq!((counts.artists, counts.albums, counts.tracks), (1, 1, 1));
    }

    #[test]
    fn test_resolution_is_idempotent_across_imports() {
        let (_dir, store) = create_test_store();
        let resolver = EntityResolver::default();

        let mut tx = store.begin_import().unwrap();
        let first = resolver.resolve_item(tx.as_mut(), &refs("ar1", "al1", "t1")).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin_import().unwrap();
        let second = resolver.resolve_item(tx.as_mut(), &refs("ar1", "al1", "t1")).unwrap();
        tx.commit().unwrap();

        assert_eq!(first, second);
        assert_eq!(store.get_counts().unwrap().tracks, 1);
    }

    #[test]
    fn test_shared_artist_and_album() {
        let (_dir, store) = create_test_store();
        let resolver = EntityResolver::default();
        let mut tx = store.begin_import().unwrap();

        let a = resolver.resolve_item(tx.as_mut(), &refs("ar1", "al1", "t1")).unwrap();
        let b = resolver.resolve_item(tx.as_mut(), &refs("ar1", "al1", "t2")).unwrap();
        assert_eq!(a.artist_id, b.artist_id);
        assert_eq!(a.album_id, b.album_id);
        assert_ne!(a.track_id, b.track_id);
    }

    #[test]
    fn test_unique_violation_falls_back_to_lookup() {
        let (_dir, store) = create_test_store();
        let resolver = EntityResolver::default();

        let mut setup = store.begin_import().unwrap();
        let winner = resolver
            .resolve_artist(setup.as_mut(), &refs("ar1", "al1", "t1").artist)
            .unwrap();
        setup.commit().unwrap();

        let mut racing = RacingTransaction {
            inner: store.begin_import().unwrap(),
            hide_next_lookup: true,
        };
        let id = resolver
            .resolve_artist(&mut racing, &refs("ar1", "al1", "t1").artist)
            .unwrap();
        assert_eq!(id, winner);
        assert!(racing.is_active());
        Box::new(racing).commit().unwrap();

        assert_eq!(store.get_counts().unwrap().artists, 1);
    }

    #[test]
    fn test_display_fields_are_refreshed() {
        let (_dir, store) = create_test_store();
        let resolver = EntityResolver::default();
        let mut tx = store.begin_import().unwrap();

        let artist = ExternalItemRef::new(EntityKind::Artist, "ar1", "Old name");
        let id = resolver.resolve_artist(tx.as_mut(), &artist).unwrap();
        let renamed = ExternalItemRef::new(EntityKind::Artist, "ar1", "New name");
        assert_eq!(resolver.resolve_artist(tx.as_mut(), &renamed).unwrap(), id);
        tx.commit().unwrap();

        let stored = store.get_artist_by_external_id("ar1").unwrap().unwrap();
        assert_eq!(stored.name, "New name");
    }

    #[test]
    fn test_display_fields_kept_when_refresh_disabled() {
        let (_dir, store) = create_test_store();
        let resolver = EntityResolver::new(false);
        let mut tx = store.begin_import().unwrap();

        resolver
            .resolve_artist(tx.as_mut(), &ExternalItemRef::new(EntityKind::Artist, "ar1", "Old"))
            .unwrap();
        resolver
            .resolve_artist(tx.as_mut(), &ExternalItemRef::new(EntityKind::Artist, "ar1", "New"))
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(store.get_artist_by_external_id("ar1").unwrap().unwrap().name, "Old");
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let (_dir, store) = create_test_store();
        let resolver = EntityResolver::default();
        let mut tx = store.begin_import().unwrap();

        let album = ExternalItemRef::new(EntityKind::Album, "al1", "Album");
        assert!(matches!(
            resolver.resolve_artist(tx.as_mut(), &album),
            Err(ResolveError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_failed_ancestor_fails_item_without_track() {
        let (_dir, store) = create_test_store();
        let resolver = EntityResolver::default();
        let mut tx = store.begin_import().unwrap();

        // Album kind in the artist slot fails the first cascade step.
        let mut bad = refs("ar1", "al1", "t1");
        bad.artist.kind = EntityKind::Album;
        assert!(resolver.resolve_item(tx.as_mut(), &bad).is_err());
        assert!(tx.find_track("t1").unwrap().is_none());
        assert!(tx.find_album("al1").unwrap().is_none());
    }

    #[test]
    fn test_track_refs_from_playable() {
        let item: PlayableItem = serde_json::from_value(json!({
            "type": "track",
            "id": "t1",
            "name": "Song",
            "duration_ms": 1000,
            "track_number": 2,
            "album": {
                "id": "al1",
                "name": "Album",
                "release_date": "2021",
                "images": [{"url": "cover", "width": 300}],
                "artists": [{"id": "ar1", "name": "Album Artist"}]
            },
            "artists": [{"id": "ar2", "name": "Featured"}]
        }))
        .unwrap();

        let refs = TrackRefs::from_playable(&item).unwrap();
        assert_eq!(refs.artist.external_id, "ar1");
        assert_eq!(refs.album.metadata.image_url.as_deref(), Some("cover"));
        assert_eq!(refs.album.metadata.release_date.as_deref(), Some("2021"));
        assert_eq!(refs.track.metadata.track_number, Some(2));
    }

    #[test]
    fn test_track_refs_reject_local_files() {
        let item: PlayableItem = serde_json::from_value(json!({
            "type": "track",
            "id": null,
            "name": "My recording",
            "is_local": true,
            "album": {"id": null, "name": "Local"},
            "artists": [{"id": null, "name": "Me"}]
        }))
        .unwrap();
        assert!(matches!(
            TrackRefs::from_playable(&item),
            Err(ResolveError::Malformed(_))
        ));
    }
}
