//! Shared constants for end-to-end tests

// ============================================================================
// Spotify application
// ============================================================================

pub const CLIENT_ID: &str = "test-client-id";

pub const CLIENT_SECRET: &str = "test-client-secret";

pub const REDIRECT_URI: &str = "http://127.0.0.1:8888/callback";

/// Authorization code the mock accounts service accepts.
pub const VALID_AUTH_CODE: &str = "valid-auth-code";

// ============================================================================
// Users and credentials
// ============================================================================

pub const TEST_USER: &str = "user-1";

pub const OTHER_USER: &str = "user-2";

/// Refresh token stored for linked test users.
pub const LINKED_REFRESH_TOKEN: &str = "linked-refresh-token";

/// Access token stored for linked test users.
pub const LINKED_ACCESS_TOKEN: &str = "linked-access-token";

// ============================================================================
// Playlists
// ============================================================================

pub const PLAYLIST_ID: &str = "37i9dQZF1DXcBWIGoYBM5M";

pub const PLAYLIST_NAME: &str = "Today's Top Hits";

/// Items per page requested by the client in tests.
pub const PAGE_SIZE: u32 = 2;

// ============================================================================
// Timing
// ============================================================================

pub const SERVER_READY_TIMEOUT_MS: u64 = 2000;
