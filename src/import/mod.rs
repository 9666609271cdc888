//! Playlist import pipeline: page walking, entity resolution and the
//! transactional import itself.

mod importer;
mod models;
mod page_walker;
mod resolver;

pub use importer::PlaylistImporter;
pub use models::{ImportError, ItemOutcome, ItemStatus, PlaylistImportResult, SkipReason};
pub use page_walker::{ImportCursor, Page, PageFetcher, PageWalker, WalkError};
pub use resolver::{
    EntityResolver, ExternalItemRef, ExternalMetadata, ResolveError, ResolvedTrack, TrackRefs,
};
