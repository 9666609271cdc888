use super::page_walker::WalkError;
use crate::catalog_store::StoreError;
use crate::credentials::AuthError;
use crate::spotify::SpotifyError;
use serde::Serialize;
use thiserror::Error;

/// Errors that end an import. Per-item failures are not errors at this level;
/// they only show up in `PlaylistImportResult`.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The user has to link their Spotify account (again).
    #[error("Spotify account must be reconnected: {0}")]
    AuthenticationRequired(String),

    #[error("Spotify is unavailable: {0}")]
    ExternalSourceUnavailable(String),

    /// The item phase was lost. A playlist shell may already exist.
    #[error("Import transaction failed: {0}")]
    TransactionFailed(#[source] StoreError),

    #[error("Import cancelled")]
    Cancelled,
}

impl From<AuthError> for ImportError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::NotLinked(_) | AuthError::RefreshFailed(_) => {
                ImportError::AuthenticationRequired(err.to_string())
            }
            AuthError::TransientNetworkError(e) => {
                ImportError::ExternalSourceUnavailable(e.to_string())
            }
            AuthError::Storage(e) => ImportError::TransactionFailed(e),
        }
    }
}

impl From<SpotifyError> for ImportError {
    fn from(err: SpotifyError) -> Self {
        match err {
            SpotifyError::Unauthorized => {
                ImportError::AuthenticationRequired("access token rejected".to_string())
            }
            other => ImportError::ExternalSourceUnavailable(other.to_string()),
        }
    }
}

impl From<WalkError<ImportError>> for ImportError {
    fn from(err: WalkError<ImportError>) -> Self {
        match err {
            WalkError::Fetch { source, .. } => source,
            e @ WalkError::CursorLoop(_) => ImportError::ExternalSourceUnavailable(e.to_string()),
        }
    }
}

impl ImportError {
    /// Label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::AuthenticationRequired(_) => "authentication_required",
            ImportError::ExternalSourceUnavailable(_) => "source_unavailable",
            ImportError::TransactionFailed(_) => "transaction_failed",
            ImportError::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The track was removed upstream; Spotify returns a null body.
    Unavailable,
    /// Podcast episodes have no album or artist to resolve.
    Episode,
    /// The track already has a position in this playlist.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Imported { position: i64, track_id: i64 },
    Skipped { reason: SkipReason },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    /// Zero-based index in the external listing.
    pub index: usize,
    pub external_id: Option<String>,
    #[serde(flatten)]
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistImportResult {
    pub playlist_id: i64,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// One entry per attempted item, in listing order.
    pub outcomes: Vec<ItemOutcome>,
}

impl PlaylistImportResult {
    pub(super) fn new(playlist_id: i64) -> Self {
        Self {
            playlist_id,
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            outcomes: Vec::new(),
        }
    }

    pub(super) fn record(&mut self, outcome: ItemOutcome) {
        self.attempted += 1;
        match outcome.status {
            ItemStatus::Imported { .. } => self.succeeded += 1,
            ItemStatus::Skipped { .. } => self.skipped += 1,
            ItemStatus::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ItemStatus::Failed { .. }))
    }
}
