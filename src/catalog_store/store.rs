//! SQLite-backed catalog store.
//!
//! Reads and playlist shell creation go through a shared connection. Each
//! import gets its own connection holding a `BEGIN IMMEDIATE` transaction, so
//! concurrent imports serialize on SQLite's write lock instead of racing on
//! lookups: a second import waits (up to the busy timeout) and then sees every
//! row the first one committed.

use super::error::StoreError;
use super::models::*;
use super::schema::CATALOG_VERSIONED_SCHEMAS;
use super::trait_def::{CatalogStore, ImportTransaction};
use crate::sqlite_persistence::migrate_if_needed;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct SqliteCatalogStore {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    busy_timeout: Duration,
}

fn open_connection(db_path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Row helpers shared by the store and its transactions
// =============================================================================

fn query_artist(conn: &Connection, external_id: &str) -> rusqlite::Result<Option<ArtistRecord>> {
    conn.prepare_cached(
        "SELECT id, external_id, name, image_url FROM artists WHERE external_id = ?1",
    )?
    .query_row(params![external_id], |row| {
        Ok(ArtistRecord {
            id: row.get(0)?,
            external_id: row.get(1)?,
            name: row.get(2)?,
            image_url: row.get(3)?,
        })
    })
    .optional()
}

fn query_album(conn: &Connection, external_id: &str) -> rusqlite::Result<Option<AlbumRecord>> {
    conn.prepare_cached(
        "SELECT id, external_id, artist_id, name, cover_url, release_date
         FROM albums WHERE external_id = ?1",
    )?
    .query_row(params![external_id], |row| {
        Ok(AlbumRecord {
            id: row.get(0)?,
            external_id: row.get(1)?,
            artist_id: row.get(2)?,
            name: row.get(3)?,
            cover_url: row.get(4)?,
            release_date: row.get(5)?,
        })
    })
    .optional()
}

fn query_track(conn: &Connection, external_id: &str) -> rusqlite::Result<Option<TrackRecord>> {
    conn.prepare_cached(
        "SELECT id, external_id, album_id, name, duration_ms, track_number
         FROM tracks WHERE external_id = ?1",
    )?
    .query_row(params![external_id], |row| {
        Ok(TrackRecord {
            id: row.get(0)?,
            external_id: row.get(1)?,
            album_id: row.get(2)?,
            name: row.get(3)?,
            duration_ms: row.get(4)?,
            track_number: row.get(5)?,
        })
    })
    .optional()
}

fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<usize> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| {
        r.get(0)
    })?;
    Ok(count as usize)
}

impl SqliteCatalogStore {
    /// Open (creating and migrating if needed) the catalog database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P, busy_timeout: Duration) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let mut conn = open_connection(&db_path, busy_timeout)
            .with_context(|| format!("Failed to open catalog database {:?}", db_path))?;

        migrate_if_needed(&mut conn, CATALOG_VERSIONED_SCHEMAS, "catalog")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = SqliteCatalogStore {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
            busy_timeout,
        };

        let counts = store.get_counts()?;
        info!(
            "Opened catalog: {} artists, {} albums, {} tracks, {} playlists",
            counts.artists, counts.albums, counts.tracks, counts.playlists
        );

        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CatalogStore for SqliteCatalogStore {
    fn create_playlist(&self, playlist: &NewPlaylist) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO playlists (owner_id, external_id, name, description, cover_url)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                playlist.owner_id,
                playlist.external_id,
                playlist.name,
                playlist.description,
                playlist.cover_url
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Created playlist shell {} for owner {}", id, playlist.owner_id);
        Ok(id)
    }

    fn begin_import(&self) -> Result<Box<dyn ImportTransaction>, StoreError> {
        let conn = open_connection(&self.db_path, self.busy_timeout)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteImportTransaction {
            conn,
            finished: false,
        }))
    }

    fn get_playlist(&self, id: i64) -> Result<Option<Playlist>, StoreError> {
        let conn = self.lock();
        let playlist = conn
            .query_row(
                "SELECT id, owner_id, external_id, name, description, cover_url, created_at
                 FROM playlists WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Playlist {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        external_id: row.get(2)?,
                        name: row.get(3)?,
                        description: row.get(4)?,
                        cover_url: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(playlist)
    }

    fn get_playlist_entries(&self, playlist_id: i64) -> Result<Vec<PlaylistEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT pt.position, t.id, t.external_id, t.name, al.name, ar.name
             FROM playlist_tracks pt
             JOIN tracks t ON t.id = pt.track_id
             JOIN albums al ON al.id = t.album_id
             JOIN artists ar ON ar.id = al.artist_id
             WHERE pt.playlist_id = ?1
             ORDER BY pt.position ASC",
        )?;
        let entries = stmt
            .query_map(params![playlist_id], |row| {
                Ok(PlaylistEntry {
                    position: row.get(0)?,
                    track_id: row.get(1)?,
                    track_external_id: row.get(2)?,
                    track_name: row.get(3)?,
                    album_name: row.get(4)?,
                    artist_name: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn get_artist_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ArtistRecord>, StoreError> {
        Ok(query_artist(&self.lock(), external_id)?)
    }

    fn get_album_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<AlbumRecord>, StoreError> {
        Ok(query_album(&self.lock(), external_id)?)
    }

    fn get_track_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<TrackRecord>, StoreError> {
        Ok(query_track(&self.lock(), external_id)?)
    }

    fn get_counts(&self) -> Result<CatalogCounts, StoreError> {
        let conn = self.lock();
        Ok(CatalogCounts {
            artists: count_rows(&conn, "artists")?,
            albums: count_rows(&conn, "albums")?,
            tracks: count_rows(&conn, "tracks")?,
            playlists: count_rows(&conn, "playlists")?,
        })
    }
}

// =============================================================================
// Import transaction
// =============================================================================

/// An open import transaction on a dedicated connection.
pub struct SqliteImportTransaction {
    conn: Connection,
    finished: bool,
}

impl SqliteImportTransaction {
    fn ensure_active(&self) -> Result<(), StoreError> {
        if self.conn.is_autocommit() {
            Err(StoreError::TransactionAborted)
        } else {
            Ok(())
        }
    }

    fn finish(mut self, sql: &str) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.finished = true;
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

impl ImportTransaction for SqliteImportTransaction {
    fn find_artist(&mut self, external_id: &str) -> Result<Option<ArtistRecord>, StoreError> {
        self.ensure_active()?;
        Ok(query_artist(&self.conn, external_id)?)
    }

    fn insert_artist(
        &mut self,
        external_id: &str,
        fields: &ArtistFields,
    ) -> Result<i64, StoreError> {
        self.ensure_active()?;
        self.conn
            .prepare_cached(
                "INSERT INTO artists (external_id, name, image_url) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![external_id, fields.name, fields.image_url])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_artist(&mut self, id: i64, fields: &ArtistFields) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.conn
            .prepare_cached(
                "UPDATE artists SET name = ?2, image_url = ?3, updated_at = ?4 WHERE id = ?1",
            )?
            .execute(params![id, fields.name, fields.image_url, now_timestamp()])?;
        Ok(())
    }

    fn find_album(&mut self, external_id: &str) -> Result<Option<AlbumRecord>, StoreError> {
        self.ensure_active()?;
        Ok(query_album(&self.conn, external_id)?)
    }

    fn insert_album(
        &mut self,
        external_id: &str,
        artist_id: i64,
        fields: &AlbumFields,
    ) -> Result<i64, StoreError> {
        self.ensure_active()?;
        self.conn
            .prepare_cached(
                "INSERT INTO albums (external_id, artist_id, name, cover_url, release_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                external_id,
                artist_id,
                fields.name,
                fields.cover_url,
                fields.release_date
            ])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_album(&mut self, id: i64, fields: &AlbumFields) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.conn
            .prepare_cached(
                "UPDATE albums SET name = ?2, cover_url = ?3, release_date = ?4, updated_at = ?5
                 WHERE id = ?1",
            )?
            .execute(params![
                id,
                fields.name,
                fields.cover_url,
                fields.release_date,
                now_timestamp()
            ])?;
        Ok(())
    }

    fn find_track(&mut self, external_id: &str) -> Result<Option<TrackRecord>, StoreError> {
        self.ensure_active()?;
        Ok(query_track(&self.conn, external_id)?)
    }

    fn insert_track(
        &mut self,
        external_id: &str,
        album_id: i64,
        fields: &TrackFields,
    ) -> Result<i64, StoreError> {
        self.ensure_active()?;
        self.conn
            .prepare_cached(
                "INSERT INTO tracks (external_id, album_id, name, duration_ms, track_number)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                external_id,
                album_id,
                fields.name,
                fields.duration_ms,
                fields.track_number
            ])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_track(&mut self, id: i64, fields: &TrackFields) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.conn
            .prepare_cached(
                "UPDATE tracks SET name = ?2, duration_ms = ?3, track_number = ?4, updated_at = ?5
                 WHERE id = ?1",
            )?
            .execute(params![
                id,
                fields.name,
                fields.duration_ms,
                fields.track_number,
                now_timestamp()
            ])?;
        Ok(())
    }

    fn insert_playlist_track(
        &mut self,
        playlist_id: i64,
        track_id: i64,
        position: i64,
    ) -> Result<bool, StoreError> {
        self.ensure_active()?;
        let inserted = self
            .conn
            .prepare_cached(
                "INSERT INTO playlist_tracks (playlist_id, track_id, position)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (playlist_id, track_id) DO NOTHING",
            )?
            .execute(params![playlist_id, track_id, position])?;
        Ok(inserted == 1)
    }

    fn is_active(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        (*self).finish("COMMIT")
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        (*self).finish("ROLLBACK")
    }
}

impl Drop for SqliteImportTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Failed to roll back abandoned import transaction: {}", e);
            }
        }
    }
}
