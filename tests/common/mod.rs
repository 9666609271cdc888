//! Common test infrastructure
//!
//! Tests run the real `SpotifyClient` against an in-process mock of the
//! Spotify accounts service and Web API, with isolated SQLite databases.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{track_item, TestEnv, PLAYLIST_ID, TEST_USER};
//!
//! #[tokio::test]
//! async fn test_import() {
//!     let env = TestEnv::spawn().await;
//!     env.spotify.set_playlist(PLAYLIST_ID, vec![track_item("t1", "al1", "ar1")]);
//!     env.link_user(TEST_USER, 3600);
//!     let result = env.import(TEST_USER, PLAYLIST_ID).await.unwrap();
//!     assert_eq!(result.succeeded, 1);
//! }
//! ```

mod constants;
mod fixtures;
mod server;

// Public API - this is what tests import
#[allow(unused_imports)]
pub use constants::*;
pub use fixtures::{track_item, TestEnv};
#[allow(unused_imports)]
pub use server::MockSpotify;
