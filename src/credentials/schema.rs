//! SQLite schema for the user database holding linked Spotify credentials.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};

const SPOTIFY_CREDENTIALS_TABLE: Table = Table {
    name: "spotify_credentials",
    columns: &[
        sqlite_column!("owner_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("access_token", &SqlType::Text, non_null = true),
        sqlite_column!("refresh_token", &SqlType::Text, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true), // unix seconds
        sqlite_column!("scope", &SqlType::Text),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
    unique_constraints: &[],
};

pub const CREDENTIALS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[SPOTIFY_CREDENTIALS_TABLE],
    migration: None,
}];
