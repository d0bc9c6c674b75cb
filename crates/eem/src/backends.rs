//! 🔌 Backends: where the real I/O happens.
//!
//! 📡 A [`Cluster`] is anything that speaks the handful of Elasticsearch APIs
//! the entity manager needs: ingest pipelines, index templates, transforms,
//! and a paged search over the indices those transforms fill.
//! 🗄️ A [`DefinitionStore`] is anything that can persist entity definition
//! documents with a version attached, so two writers can't both win.
//!
//! 🎭 Each trait has an enum casting agency ([`ClusterBackend`], [`StoreBackend`])
//! so the CLI can pick an implementation from config, while tests grab the
//! in-memory variants directly and poke at their insides.
//!
//! ⚠️ 404 handling contract: lookups (`get_*`) return `None` / empty maps for
//! absent resources, deletes treat absent as done. Everything else that is not
//! 2xx comes back as a [`ClusterError`]. 🦆

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::EntityDefinition;
use crate::errors::{ClusterError, StoreError};

pub mod common_config;
pub mod elasticsearch;
pub mod elasticsearch_store;
pub mod in_mem;

pub use common_config::ElasticsearchConfig;
pub use elasticsearch::ElasticsearchCluster;
pub use elasticsearch_store::ElasticsearchStore;
pub use in_mem::{ClusterOp, InMemoryCluster, InMemoryStore, InjectedFailure};

// ===== Cluster Trait and Backend Enum =====

/// 📊 Ingest counters for one pipeline, summed over every node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub count: u64,
    pub failed: u64,
}

/// 🚦 The task state a transform reports in its `_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformTaskState {
    Started,
    Indexing,
    Stopping,
    Stopped,
    Aborting,
    Failed,
    #[serde(other)]
    Unknown,
}

impl TransformTaskState {
    pub fn is_running(self) -> bool {
        matches!(self, TransformTaskState::Started | TransformTaskState::Indexing)
    }
}

/// 📊 One entry from `GET _transform/<id>/_stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStats {
    pub id: String,
    pub state: TransformTaskState,
    #[serde(default)]
    pub stats: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

impl SortField {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }
}

/// 🔎 A document search. `query` is Lucene query-string syntax; `None` matches everything.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub size: usize,
    pub sort: Vec<SortField>,
    /// 📍 Sort values of the last hit of the previous page.
    pub search_after: Option<Vec<Value>>,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: None,
            size: 10,
            sort: Vec::new(),
            search_after: None,
        }
    }
}

impl SearchRequest {
    /// 📐 The request body as Elasticsearch wants it.
    pub fn body(&self) -> Value {
        let query = match self.query.as_deref().filter(|query| !query.trim().is_empty()) {
            Some(query) => serde_json::json!({ "query_string": { "query": query } }),
            None => serde_json::json!({ "match_all": {} }),
        };
        let sort: Vec<Value> = self
            .sort
            .iter()
            .map(|sort| serde_json::json!({ (sort.field.clone()): { "order": sort.order } }))
            .collect();
        let mut body = serde_json::json!({
            "size": self.size,
            "track_total_hits": true,
            "query": query,
            "sort": sort,
        });
        if let Some(after) = &self.search_after {
            body["search_after"] = Value::Array(after.clone());
        }
        body
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub index: String,
    pub id: String,
    pub source: Value,
    /// Sort values, ready to be fed back as `search_after`.
    pub sort: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResponse {
    /// Matches across all pages, not just this one.
    pub total: u64,
    pub hits: Vec<SearchHit>,
}

/// 📡 The Elasticsearch surface the entity manager consumes.
///
/// # Contract
/// - `put_*` calls are idempotent for an unchanged id.
/// - `get_*` calls return `None` (or omit the key) for absent resources.
/// - `delete_*` calls succeed when the resource is already gone.
/// - `start_transform` succeeds on an already started transform.
#[async_trait]
pub trait Cluster: std::fmt::Debug + Send + Sync {
    async fn put_ingest_pipeline(&self, id: &str, body: &Value) -> Result<(), ClusterError>;
    /// 🔍 One request for all ids; the map only holds the pipelines that exist.
    async fn get_ingest_pipelines(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Value>, ClusterError>;
    /// 📊 `nodes.stats` with the ingest metric, folded across nodes.
    async fn ingest_pipeline_stats(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PipelineStats>, ClusterError>;
    async fn delete_ingest_pipeline(&self, id: &str) -> Result<(), ClusterError>;

    async fn put_index_template(&self, name: &str, body: &Value) -> Result<(), ClusterError>;
    async fn get_index_template(&self, name: &str) -> Result<Option<Value>, ClusterError>;
    async fn delete_index_template(&self, name: &str) -> Result<(), ClusterError>;

    async fn put_transform(&self, id: &str, body: &Value) -> Result<(), ClusterError>;
    async fn get_transform(&self, id: &str) -> Result<Option<Value>, ClusterError>;
    async fn get_transform_stats(&self, id: &str) -> Result<Option<TransformStats>, ClusterError>;
    async fn start_transform(&self, id: &str) -> Result<(), ClusterError>;
    async fn stop_transform(&self, id: &str) -> Result<(), ClusterError>;
    async fn delete_transform(&self, id: &str) -> Result<(), ClusterError>;

    /// 🗑️ Deletes every index matching `pattern`. No match is not an error.
    async fn delete_indices(&self, pattern: &str) -> Result<(), ClusterError>;

    /// 🔎 Searches every index matching `pattern`. No matching index is an empty response.
    async fn search(
        &self,
        pattern: &str,
        request: &SearchRequest,
    ) -> Result<SearchResponse, ClusterError>;
}

/// 🎭 The many faces of a Cluster: pick one from config, forget which one you picked.
#[derive(Debug)]
pub enum ClusterBackend {
    InMemory(InMemoryCluster),
    Elasticsearch(ElasticsearchCluster),
}

#[async_trait]
impl Cluster for ClusterBackend {
    async fn put_ingest_pipeline(&self, id: &str, body: &Value) -> Result<(), ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.put_ingest_pipeline(id, body).await,
            ClusterBackend::Elasticsearch(c) => c.put_ingest_pipeline(id, body).await,
        }
    }

    async fn get_ingest_pipelines(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Value>, ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.get_ingest_pipelines(ids).await,
            ClusterBackend::Elasticsearch(c) => c.get_ingest_pipelines(ids).await,
        }
    }

    async fn ingest_pipeline_stats(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PipelineStats>, ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.ingest_pipeline_stats(ids).await,
            ClusterBackend::Elasticsearch(c) => c.ingest_pipeline_stats(ids).await,
        }
    }

    async fn delete_ingest_pipeline(&self, id: &str) -> Result<(), ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.delete_ingest_pipeline(id).await,
            ClusterBackend::Elasticsearch(c) => c.delete_ingest_pipeline(id).await,
        }
    }

    async fn put_index_template(&self, name: &str, body: &Value) -> Result<(), ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.put_index_template(name, body).await,
            ClusterBackend::Elasticsearch(c) => c.put_index_template(name, body).await,
        }
    }

    async fn get_index_template(&self, name: &str) -> Result<Option<Value>, ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.get_index_template(name).await,
            ClusterBackend::Elasticsearch(c) => c.get_index_template(name).await,
        }
    }

    async fn delete_index_template(&self, name: &str) -> Result<(), ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.delete_index_template(name).await,
            ClusterBackend::Elasticsearch(c) => c.delete_index_template(name).await,
        }
    }

    async fn put_transform(&self, id: &str, body: &Value) -> Result<(), ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.put_transform(id, body).await,
            ClusterBackend::Elasticsearch(c) => c.put_transform(id, body).await,
        }
    }

    async fn get_transform(&self, id: &str) -> Result<Option<Value>, ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.get_transform(id).await,
            ClusterBackend::Elasticsearch(c) => c.get_transform(id).await,
        }
    }

    async fn get_transform_stats(&self, id: &str) -> Result<Option<TransformStats>, ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.get_transform_stats(id).await,
            ClusterBackend::Elasticsearch(c) => c.get_transform_stats(id).await,
        }
    }

    async fn start_transform(&self, id: &str) -> Result<(), ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.start_transform(id).await,
            ClusterBackend::Elasticsearch(c) => c.start_transform(id).await,
        }
    }

    async fn stop_transform(&self, id: &str) -> Result<(), ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.stop_transform(id).await,
            ClusterBackend::Elasticsearch(c) => c.stop_transform(id).await,
        }
    }

    async fn delete_transform(&self, id: &str) -> Result<(), ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.delete_transform(id).await,
            ClusterBackend::Elasticsearch(c) => c.delete_transform(id).await,
        }
    }

    async fn delete_indices(&self, pattern: &str) -> Result<(), ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.delete_indices(pattern).await,
            ClusterBackend::Elasticsearch(c) => c.delete_indices(pattern).await,
        }
    }

    async fn search(
        &self,
        pattern: &str,
        request: &SearchRequest,
    ) -> Result<SearchResponse, ClusterError> {
        match self {
            ClusterBackend::InMemory(c) => c.search(pattern, request).await,
            ClusterBackend::Elasticsearch(c) => c.search(pattern, request).await,
        }
    }
}

// ===== Definition Store Trait and Backend Enum =====

/// 🔢 Optimistic-concurrency token, shaped after `_seq_no` + `_primary_term`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocVersion {
    pub seq_no: u64,
    pub primary_term: u64,
}

impl std::fmt::Display for DocVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.seq_no, self.primary_term)
    }
}

/// 📦 A definition as read from the store, with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDefinition {
    pub definition: EntityDefinition,
    pub version: DocVersion,
}

/// 🔍 Filters and paging for [`DefinitionStore::find`]. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionQuery {
    pub id: Option<String>,
    pub entity_type: Option<String>,
    /// `Some(true)` keeps only built-ins, `Some(false)` drops them.
    pub built_in: Option<bool>,
    pub page: usize,
    pub per_page: usize,
}

impl Default for DefinitionQuery {
    fn default() -> Self {
        Self {
            id: None,
            entity_type: None,
            built_in: None,
            page: 1,
            per_page: 10,
        }
    }
}

impl DefinitionQuery {
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            per_page: 1,
            ..Self::default()
        }
    }

    /// 🎯 Index of the first hit on this page. Page 0 is read as page 1.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.per_page
    }
}

/// 📄 One page of results plus the total match count.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// 🗄️ Persistence for entity definition documents (the "saved object" role).
///
/// # Contract
/// - `create` fails with [`StoreError::AlreadyExists`] if the id is taken.
/// - `update` is a check-and-set: it fails with [`StoreError::VersionConflict`]
///   unless `expected` is the version currently stored.
/// - `find` results are sorted by id.
#[async_trait]
pub trait DefinitionStore: std::fmt::Debug + Send + Sync {
    async fn find(&self, query: &DefinitionQuery) -> Result<Page<StoredDefinition>, StoreError>;
    async fn get(&self, id: &str) -> Result<Option<StoredDefinition>, StoreError>;
    async fn create(&self, definition: &EntityDefinition) -> Result<StoredDefinition, StoreError>;
    async fn update(
        &self,
        definition: &EntityDefinition,
        expected: DocVersion,
    ) -> Result<StoredDefinition, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// 🎭 The many faces of a DefinitionStore. Same deal as [`ClusterBackend`].
#[derive(Debug)]
pub enum StoreBackend {
    InMemory(InMemoryStore),
    Elasticsearch(ElasticsearchStore),
}

#[async_trait]
impl DefinitionStore for StoreBackend {
    async fn find(&self, query: &DefinitionQuery) -> Result<Page<StoredDefinition>, StoreError> {
        match self {
            StoreBackend::InMemory(s) => s.find(query).await,
            StoreBackend::Elasticsearch(s) => s.find(query).await,
        }
    }

    async fn get(&self, id: &str) -> Result<Option<StoredDefinition>, StoreError> {
        match self {
            StoreBackend::InMemory(s) => s.get(id).await,
            StoreBackend::Elasticsearch(s) => s.get(id).await,
        }
    }

    async fn create(&self, definition: &EntityDefinition) -> Result<StoredDefinition, StoreError> {
        match self {
            StoreBackend::InMemory(s) => s.create(definition).await,
            StoreBackend::Elasticsearch(s) => s.create(definition).await,
        }
    }

    async fn update(
        &self,
        definition: &EntityDefinition,
        expected: DocVersion,
    ) -> Result<StoredDefinition, StoreError> {
        match self {
            StoreBackend::InMemory(s) => s.update(definition, expected).await,
            StoreBackend::Elasticsearch(s) => s.update(definition, expected).await,
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        match self {
            StoreBackend::InMemory(s) => s.delete(id).await,
            StoreBackend::Elasticsearch(s) => s.delete(id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_only_started_and_indexing_count_as_running() {
        for (raw, running) in [
            ("\"started\"", true),
            ("\"indexing\"", true),
            ("\"stopped\"", false),
            ("\"failed\"", false),
            ("\"waiting\"", false),
        ] {
            let state: TransformTaskState =
                serde_json::from_str(raw).expect("💀 task state should parse");
            assert_eq!(state.is_running(), running, "state {raw}");
        }
    }

    #[test]
    fn the_one_where_page_zero_is_politely_treated_as_page_one() {
        let query = DefinitionQuery {
            page: 0,
            per_page: 10,
            ..DefinitionQuery::default()
        };
        assert_eq!(query.offset(), 0);
        let query = DefinitionQuery {
            page: 3,
            per_page: 10,
            ..DefinitionQuery::default()
        };
        assert_eq!(query.offset(), 20);
    }

    #[test]
    fn the_one_where_a_search_request_remembers_where_it_left_off() {
        let request = SearchRequest {
            query: Some("entity.type:service".to_string()),
            size: 25,
            sort: vec![
                SortField::new("entity.lastSeenTimestamp", SortOrder::Desc),
                SortField::new("entity.id", SortOrder::Asc),
            ],
            search_after: Some(vec![serde_json::json!(1700000000000u64), serde_json::json!("abc")]),
        };
        let body = request.body();
        assert_eq!(body["size"], 25);
        assert_eq!(body["query"]["query_string"]["query"], "entity.type:service");
        assert_eq!(body["sort"][0]["entity.lastSeenTimestamp"]["order"], "desc");
        assert_eq!(body["sort"][1]["entity.id"]["order"], "asc");
        assert_eq!(body["search_after"][1], "abc");

        let blank = SearchRequest {
            query: Some("  ".to_string()),
            size: 10,
            sort: vec![],
            search_after: None,
        };
        let body = blank.body();
        assert!(body["query"]["match_all"].is_object(), "blank query matches all");
        assert!(body.get("search_after").is_none());
    }
}
