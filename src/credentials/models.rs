use crate::spotify::models::TokenResponse;
use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Longest access token lifetime accepted from the token endpoint. Spotify
/// issues one-hour tokens; anything beyond this is treated as this.
const MAX_TOKEN_LIFETIME_SECS: i64 = 86_400 * 365;

/// A user's OAuth grant for Spotify.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub owner_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scope: Option<String>,
}

impl Credential {
    /// Build a credential from a token endpoint response.
    ///
    /// Spotify only sends a refresh token when it rotates it, so
    /// `previous_refresh_token` is kept when the response has none.
    pub fn from_token_response(
        owner_id: &str,
        response: TokenResponse,
        previous_refresh_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let refresh_token = response
            .refresh_token
            .or_else(|| previous_refresh_token.map(str::to_string))?;
        Some(Self {
            owner_id: owner_id.to_string(),
            access_token: response.access_token,
            refresh_token,
            expires_at: now
                .checked_add_signed(Duration::seconds(
                    response.expires_in.clamp(0, MAX_TOKEN_LIFETIME_SECS),
                ))
                .unwrap_or(now),
            scope: response.scope,
        })
    }

    /// Whether the access token is still usable `margin` from `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

// Tokens never end up in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("owner_id", &self.owner_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}
