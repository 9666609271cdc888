//! Per-owner access token cache with single-flight refresh.
//!
//! Every owner has a slot guarded by an async mutex. Whoever holds the slot
//! while the token is expired performs the refresh and persists the result
//! before releasing it, so concurrent callers for the same owner queue behind a
//! single refresh and then observe its outcome. Different owners never contend.

use super::models::Credential;
use super::store::CredentialStore;
use crate::catalog_store::StoreError;
use crate::metrics;
use crate::spotify::{SpotifyApi, SpotifyError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No Spotify account linked for {0}")]
    NotLinked(String),

    /// Spotify refused the grant; the user has to link their account again.
    #[error("Spotify rejected the credential, reconnect required: {0}")]
    RefreshFailed(String),

    #[error("Spotify accounts service unavailable: {0}")]
    TransientNetworkError(#[source] SpotifyError),

    #[error("Credential storage failed: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Default)]
struct Slot {
    credential: Option<Credential>,
    /// Set by `invalidate`: the cached access token must not be handed out again
    /// even if it has not expired yet.
    stale: bool,
}

pub struct TokenStore {
    api: Arc<dyn SpotifyApi>,
    backing: Arc<dyn CredentialStore>,
    safety_margin: chrono::Duration,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Slot>>>>,
}

impl TokenStore {
    pub fn new(
        api: Arc<dyn SpotifyApi>,
        backing: Arc<dyn CredentialStore>,
        safety_margin: std::time::Duration,
    ) -> Self {
        Self {
            api,
            backing,
            safety_margin: chrono::Duration::from_std(safety_margin)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, owner_id: &str) -> Arc<AsyncMutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.entry(owner_id.to_string()).or_default().clone()
    }

    /// Drop the owner's slot unless someone else is still using it. Only for
    /// owners with nothing cached, since the slot goes with its credential.
    fn release_slot(&self, owner_id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots
            .get(owner_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(owner_id);
        }
    }

    /// Run a credential store call on the blocking pool.
    async fn with_backing<T, F>(&self, op: F) -> Result<T, AuthError>
    where
        F: FnOnce(&dyn CredentialStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let backing = self.backing.clone();
        match tokio::task::spawn_blocking(move || op(backing.as_ref())).await {
            Ok(result) => Ok(result?),
            Err(e) => {
                error!("Blocking credential store call panicked: {}", e);
                Err(AuthError::Storage(StoreError::TransactionAborted))
            }
        }
    }

    #[cfg(test)]
    fn cached_owner_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Link an account by exchanging the authorization code from the consent
    /// redirect. Replaces any previously linked credential.
    pub async fn link(
        &self,
        owner_id: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Credential, AuthError> {
        let response = self
            .api
            .exchange_code(code, redirect_uri)
            .await
            .map_err(map_grant_error)?;
        let credential = Credential::from_token_response(owner_id, response, None, Utc::now())
            .ok_or_else(|| {
                AuthError::RefreshFailed("token response carried no refresh token".to_string())
            })?;

        let slot = self.slot(owner_id);
        let mut slot = slot.lock().await;
        let saved = credential.clone();
        self.with_backing(move |backing| backing.save(&saved)).await?;
        slot.credential = Some(credential.clone());
        slot.stale = false;
        info!("Linked Spotify account for {}", owner_id);
        Ok(credential)
    }

    /// Link an account from a refresh token obtained elsewhere. The token is
    /// verified by refreshing it right away; a rejected token is not kept.
    pub async fn link_refresh_token(
        &self,
        owner_id: &str,
        refresh_token: &str,
    ) -> Result<Credential, AuthError> {
        let placeholder = Credential {
            owner_id: owner_id.to_string(),
            access_token: String::new(),
            refresh_token: refresh_token.to_string(),
            expires_at: DateTime::<Utc>::default(),
            scope: None,
        };
        {
            let slot = self.slot(owner_id);
            let mut slot = slot.lock().await;
            let saved = placeholder.clone();
            self.with_backing(move |backing| backing.save(&saved)).await?;
            slot.credential = Some(placeholder);
            slot.stale = true;
        }

        match self.get_valid(owner_id).await {
            Err(AuthError::RefreshFailed(reason)) => {
                self.unlink(owner_id).await?;
                Err(AuthError::RefreshFailed(reason))
            }
            other => other,
        }
    }

    /// Return a credential whose access token is valid for at least the safety
    /// margin, refreshing it first if needed.
    pub async fn get_valid(&self, owner_id: &str) -> Result<Credential, AuthError> {
        let slot_ref = self.slot(owner_id);
        let mut slot = slot_ref.lock().await;

        if slot.credential.is_none() {
            let owner = owner_id.to_string();
            slot.credential = self.with_backing(move |backing| backing.load(&owner)).await?;
        }
        let Some(current) = slot.credential.clone() else {
            drop(slot);
            drop(slot_ref);
            self.release_slot(owner_id);
            return Err(AuthError::NotLinked(owner_id.to_string()));
        };

        if !slot.stale && current.is_valid_at(Utc::now(), self.safety_margin) {
            return Ok(current);
        }

        debug!("Refreshing Spotify access token for {}", owner_id);
        let response = match self.api.refresh_token(&current.refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                let err = map_grant_error(e);
                match &err {
                    AuthError::RefreshFailed(reason) => {
                        warn!("Refresh rejected for {}: {}", owner_id, reason);
                        metrics::TOKEN_REFRESHES_TOTAL
                            .with_label_values(&["rejected"])
                            .inc();
                        slot.credential = None;
                    }
                    _ => {
                        warn!("Refresh for {} failed transiently: {}", owner_id, err);
                        metrics::TOKEN_REFRESHES_TOTAL
                            .with_label_values(&["transient"])
                            .inc();
                    }
                }
                return Err(err);
            }
        };

        let refreshed = Credential::from_token_response(
            owner_id,
            response,
            Some(&current.refresh_token),
            Utc::now(),
        )
        .ok_or_else(|| AuthError::RefreshFailed("missing refresh token".to_string()))?;

        // The new pair stays cached even if persisting it fails: a rotated refresh
        // token may already have invalidated the old one.
        slot.credential = Some(refreshed.clone());
        slot.stale = false;
        let saved = refreshed.clone();
        if let Err(e) = self.with_backing(move |backing| backing.save(&saved)).await {
            error!("Failed to persist refreshed credential for {}: {}", owner_id, e);
            return Err(e);
        }

        metrics::TOKEN_REFRESHES_TOTAL
            .with_label_values(&["success"])
            .inc();
        info!(
            "Refreshed Spotify access token for {}, expires at {}",
            owner_id, refreshed.expires_at
        );
        Ok(refreshed)
    }

    /// Drop the cached access token so the next `get_valid` refreshes it.
    /// Used when a data endpoint rejects a token that looked valid.
    pub async fn invalidate(&self, owner_id: &str) {
        let slot = self.slot(owner_id);
        let mut slot = slot.lock().await;
        slot.stale = true;
        debug!("Invalidated cached Spotify token for {}", owner_id);
    }

    /// Forget the linked account entirely.
    pub async fn unlink(&self, owner_id: &str) -> Result<bool, AuthError> {
        let removed = {
            let slot = self.slot(owner_id);
            let mut slot = slot.lock().await;
            slot.credential = None;
            slot.stale = false;
            let owner = owner_id.to_string();
            self.with_backing(move |backing| backing.delete(&owner)).await?
        };
        self.release_slot(owner_id);
        Ok(removed)
    }
}

fn map_grant_error(err: SpotifyError) -> AuthError {
    match err {
        SpotifyError::InvalidGrant(reason) => AuthError::RefreshFailed(reason),
        SpotifyError::Unauthorized => AuthError::RefreshFailed("unauthorized".to_string()),
        SpotifyError::Status { status, body } => {
            AuthError::RefreshFailed(format!("status {}: {}", status, body))
        }
        other => AuthError::TransientNetworkError(other),
    }
}
