//! Linked Spotify credentials and the token store that keeps them fresh.

mod models;
mod schema;
mod store;
mod token_store;

pub use models::Credential;
pub use schema::CREDENTIALS_VERSIONED_SCHEMAS;
pub use store::{CredentialStore, SqliteCredentialStore};
pub use token_store::{AuthError, TokenStore};
