//! Chunk ownership metadata.
//!
//! - [`ConfigService`]: the authoritative chunk table per namespace
//! - [`MetadataStore`]: each shard's cached view, with pending ranges for
//!   in-flight incoming migrations
//! - [`CollectionMetadata`]: one immutable snapshot of that view

pub mod chunk;
pub mod collection;
pub mod config_service;
pub mod store;

pub use chunk::{validate_partition, Chunk, ChunkVersion};
pub use collection::CollectionMetadata;
pub use config_service::{CollectionRouting, ConfigService, InMemoryConfigService};
pub use store::MetadataStore;
