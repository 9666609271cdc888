//! Playlist Catalog Server Library
//!
//! Imports Spotify playlists into a local SQLite catalog. Exposed as a library
//! for the binary and the integration tests.

pub mod catalog_store;
pub mod config;
pub mod credentials;
pub mod import;
pub mod metrics;
pub mod spotify;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use catalog_store::{CatalogStore, SqliteCatalogStore};
pub use credentials::{AuthError, SqliteCredentialStore, TokenStore};
pub use import::{ImportError, PlaylistImportResult, PlaylistImporter};
pub use spotify::{SpotifyApi, SpotifyClient};
