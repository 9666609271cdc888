//! Local catalog models.
//!
//! Every entity row carries a locally generated integer id and, when it was
//! derived from the external catalog, the external (Spotify) id it came from.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a catalog entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Artist,
    Album,
    Track,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Artist => "artist",
            EntityKind::Album => "album",
            EntityKind::Track => "track",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Mutable display fields
// =============================================================================

/// Display fields of an artist that may be refreshed on re-import.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArtistFields {
    pub name: String,
    pub image_url: Option<String>,
}

/// Display fields of an album that may be refreshed on re-import.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlbumFields {
    pub name: String,
    pub cover_url: Option<String>,
    pub release_date: Option<String>,
}

/// Display fields of a track that may be refreshed on re-import.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackFields {
    pub name: String,
    pub duration_ms: Option<i64>,
    pub track_number: Option<i32>,
}

// =============================================================================
// Stored rows
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArtistRecord {
    pub id: i64,
    pub external_id: Option<String>,
    pub name: String,
    pub image_url: Option<String>,
}

impl ArtistRecord {
    pub fn fields(&self) -> ArtistFields {
        ArtistFields {
            name: self.name.clone(),
            image_url: self.image_url.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AlbumRecord {
    pub id: i64,
    pub external_id: Option<String>,
    pub artist_id: i64,
    pub name: String,
    pub cover_url: Option<String>,
    pub release_date: Option<String>,
}

impl AlbumRecord {
    pub fn fields(&self) -> AlbumFields {
        AlbumFields {
            name: self.name.clone(),
            cover_url: self.cover_url.clone(),
            release_date: self.release_date.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TrackRecord {
    pub id: i64,
    pub external_id: Option<String>,
    pub album_id: i64,
    pub name: String,
    pub duration_ms: Option<i64>,
    pub track_number: Option<i32>,
}

impl TrackRecord {
    pub fn fields(&self) -> TrackFields {
        TrackFields {
            name: self.name.clone(),
            duration_ms: self.duration_ms,
            track_number: self.track_number,
        }
    }
}

// =============================================================================
// Playlists
// =============================================================================

/// Data needed to create a local playlist shell.
#[derive(Clone, Debug)]
pub struct NewPlaylist {
    pub owner_id: String,
    pub external_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub cover_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Playlist {
    pub id: i64,
    pub owner_id: String,
    pub external_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub created_at: i64,
}

/// A positioned track of a playlist, joined with its album and artist names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlaylistEntry {
    pub position: i64,
    pub track_id: i64,
    pub track_external_id: Option<String>,
    pub track_name: String,
    pub album_name: String,
    pub artist_name: String,
}

/// Row counts, used for stats and metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub artists: usize,
    pub albums: usize,
    pub tracks: usize,
    pub playlists: usize,
}
