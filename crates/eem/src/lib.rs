//! 🧬 eem: the entity definition manager.
//!
//! 🎬 An entity definition says "services look like this, find them in `logs-*`".
//! This crate turns that sentence into ingest pipelines, index templates and
//! transforms on an Elasticsearch cluster, keeps the definition document in
//! sync with them, and answers the eternal question: is it actually running?
//!
//! Start at [`EntityClient`]. Everything else is plumbing it stands on.

pub mod app_config;
pub mod backends;
pub mod common;
pub mod entity_client;
pub mod errors;
pub mod installer;
pub mod reconciler;
pub mod resources;
pub mod transform_controller;

pub use entity_client::{
    EntityClient, EntityDefinitionWithState, FindEntitiesOptions, FindEntitiesResult, FindOptions,
    FindResult,
};
pub use errors::{ClusterError, EntityManagerError, StoreError};
pub use reconciler::EntityDefinitionStats;
