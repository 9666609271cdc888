mod error;
mod models;
mod schema;
mod store;
mod trait_def;

pub use error::StoreError;
pub use models::*;
pub use schema::CATALOG_VERSIONED_SCHEMAS;
pub use store::{SqliteCatalogStore, SqliteImportTransaction};
pub use trait_def::{CatalogStore, ImportTransaction};
