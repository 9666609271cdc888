//! Durable storage for linked credentials.

use super::models::Credential;
use super::schema::CREDENTIALS_VERSIONED_SCHEMAS;
use crate::catalog_store::StoreError;
use crate::sqlite_persistence::migrate_if_needed;
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

pub trait CredentialStore: Send + Sync {
    fn load(&self, owner_id: &str) -> Result<Option<Credential>, StoreError>;

    /// Insert or replace the credential for `credential.owner_id`.
    fn save(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Returns whether a credential was removed.
    fn delete(&self, owner_id: &str) -> Result<bool, StoreError>;
}

#[derive(Clone)]
pub struct SqliteCredentialStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCredentialStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open user database {:?}", db_path))?;
        let store = Self::from_connection(conn)?;
        info!("Opened user database {:?}", db_path);
        Ok(store)
    }

    /// Wrap an already open connection, creating or migrating the schema.
    pub fn from_connection(mut conn: Connection) -> Result<Self> {
        migrate_if_needed(&mut conn, CREDENTIALS_VERSIONED_SCHEMAS, "user")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn load(&self, owner_id: &str) -> Result<Option<Credential>, StoreError> {
        let conn = self.lock();
        let credential = conn
            .query_row(
                "SELECT owner_id, access_token, refresh_token, expires_at, scope
                 FROM spotify_credentials WHERE owner_id = ?1",
                params![owner_id],
                |row| {
                    let expires_at: i64 = row.get(3)?;
                    Ok(Credential {
                        owner_id: row.get(0)?,
                        access_token: row.get(1)?,
                        refresh_token: row.get(2)?,
                        expires_at: Utc
                            .timestamp_opt(expires_at, 0)
                            .single()
                            .unwrap_or_default(),
                        scope: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(credential)
    }

    fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO spotify_credentials
                 (owner_id, access_token, refresh_token, expires_at, scope, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (owner_id) DO UPDATE SET
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 expires_at = excluded.expires_at,
                 scope = excluded.scope,
                 updated_at = excluded.updated_at",
            params![
                credential.owner_id,
                credential.access_token,
                credential.refresh_token,
                credential.expires_at.timestamp(),
                credential.scope,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    fn delete(&self, owner_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM spotify_credentials WHERE owner_id = ?1",
            params![owner_id],
        )?;
        Ok(deleted > 0)
    }
}
