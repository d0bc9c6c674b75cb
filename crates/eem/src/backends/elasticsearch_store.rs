//! 🗄️ Elasticsearch-backed definition store.
//!
//! Definitions live as plain documents in one system index (default
//! `.kibana-entities-definitions`), `_id` = definition id. Every write after
//! the first carries `if_seq_no` + `if_primary_term`, so the "install in
//! progress" marker can't be overwritten by a writer holding a stale read.
//!
//! 🧠 Knowledge graph:
//! - create → `PUT <index>/_create/<id>` (409 = [`StoreError::AlreadyExists`])
//! - update → `PUT <index>/_doc/<id>?if_seq_no=..&if_primary_term=..` (409 = conflict or gone)
//! - find → `POST <index>/_search?seq_no_primary_term=true`, sorted by `id`
//!
//! The index is created on first use with `id` and `type` mapped as keywords
//! and dynamic mapping off, so the definition body is stored but not indexed. 🦆

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use tracing::debug;

use crate::backends::elasticsearch::{EsHttp, EsResponse};
use crate::backends::{
    DefinitionQuery, DefinitionStore, DocVersion, ElasticsearchConfig, Page, StoredDefinition,
};
use crate::common::{BUILT_IN_ID_PREFIX, EntityDefinition};
use crate::errors::StoreError;

/// 🏷️ Where definitions live unless configured otherwise.
pub const DEFAULT_DEFINITIONS_INDEX: &str = ".kibana-entities-definitions";

#[derive(Debug, Clone)]
pub struct ElasticsearchStore {
    http: EsHttp,
    index: String,
}

fn decode_version(body: &Value) -> Result<DocVersion, StoreError> {
    match (body["_seq_no"].as_u64(), body["_primary_term"].as_u64()) {
        (Some(seq_no), Some(primary_term)) => Ok(DocVersion {
            seq_no,
            primary_term,
        }),
        _ => Err(StoreError::Decode(
            "response is missing _seq_no/_primary_term".to_string(),
        )),
    }
}

fn decode_hit(hit: &Value) -> Result<StoredDefinition, StoreError> {
    let definition: EntityDefinition = serde_json::from_value(hit["_source"].clone())
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(StoredDefinition {
        definition,
        version: decode_version(hit)?,
    })
}

fn parse(response: &EsResponse, operation: &str) -> Result<Value, StoreError> {
    Ok(response.json(operation)?)
}

impl ElasticsearchStore {
    /// 🚀 Connects and makes sure the definitions index exists.
    pub async fn new(config: ElasticsearchConfig, index: impl Into<String>) -> Result<Self, StoreError> {
        let store = Self {
            http: EsHttp::new(config)?,
            index: index.into(),
        };
        store.ensure_index().await?;
        Ok(store)
    }

    async fn ensure_index(&self) -> Result<(), StoreError> {
        let operation = "indices.create";
        let mappings = json!({
            "mappings": {
                "dynamic": false,
                "properties": {
                    "id": { "type": "keyword" },
                    "type": { "type": "keyword" }
                }
            }
        });
        let response = self
            .http
            .send(Method::PUT, &self.index, Some(&mappings), operation)
            .await?;
        if response.is_success() {
            debug!("🏗️ Created definitions index [{}]", self.index);
            return Ok(());
        }
        if response.status == 400 && response.body.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(response.into_error(operation).into())
    }

    fn search_body(query: &DefinitionQuery) -> Value {
        let mut filter = Vec::new();
        let mut must_not = Vec::new();
        if let Some(id) = &query.id {
            filter.push(json!({ "term": { "id": id } }));
        }
        if let Some(entity_type) = &query.entity_type {
            filter.push(json!({ "term": { "type": entity_type } }));
        }
        let built_in_clause = json!({ "prefix": { "id": BUILT_IN_ID_PREFIX } });
        match query.built_in {
            Some(true) => filter.push(built_in_clause),
            Some(false) => must_not.push(built_in_clause),
            None => {}
        }
        json!({
            "from": query.offset(),
            "size": query.per_page,
            "track_total_hits": true,
            "sort": [{ "id": "asc" }],
            "query": { "bool": { "filter": filter, "must_not": must_not } }
        })
    }
}

#[async_trait]
impl DefinitionStore for ElasticsearchStore {
    async fn find(&self, query: &DefinitionQuery) -> Result<Page<StoredDefinition>, StoreError> {
        let operation = "search";
        let response = self
            .http
            .send(
                Method::POST,
                &format!("{}/_search?seq_no_primary_term=true", self.index),
                Some(&Self::search_body(query)),
                operation,
            )
            .await?;
        if response.status == 404 {
            return Ok(Page {
                items: vec![],
                total: 0,
            });
        }
        if !response.is_success() {
            return Err(response.into_error(operation).into());
        }
        let body = parse(&response, operation)?;
        let total = body
            .pointer("/hits/total/value")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let items = body
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .map(|hits| hits.iter().map(decode_hit).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        Ok(Page { items, total })
    }

    async fn get(&self, id: &str) -> Result<Option<StoredDefinition>, StoreError> {
        let operation = "get";
        let response = self
            .http
            .send(Method::GET, &format!("{}/_doc/{id}", self.index), None, operation)
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(response.into_error(operation).into());
        }
        decode_hit(&parse(&response, operation)?).map(Some)
    }

    async fn create(&self, definition: &EntityDefinition) -> Result<StoredDefinition, StoreError> {
        let operation = "create";
        let body = serde_json::to_value(definition).map_err(|e| StoreError::Decode(e.to_string()))?;
        let response = self
            .http
            .send(
                Method::PUT,
                &format!("{}/_create/{}?refresh=wait_for", self.index, definition.id),
                Some(&body),
                operation,
            )
            .await?;
        if response.status == 409 {
            return Err(StoreError::AlreadyExists(definition.id.clone()));
        }
        if !response.is_success() {
            return Err(response.into_error(operation).into());
        }
        Ok(StoredDefinition {
            definition: definition.clone(),
            version: decode_version(&parse(&response, operation)?)?,
        })
    }

    async fn update(
        &self,
        definition: &EntityDefinition,
        expected: DocVersion,
    ) -> Result<StoredDefinition, StoreError> {
        let operation = "index";
        let body = serde_json::to_value(definition).map_err(|e| StoreError::Decode(e.to_string()))?;
        let response = self
            .http
            .send(
                Method::PUT,
                &format!(
                    "{}/_doc/{}?if_seq_no={}&if_primary_term={}&refresh=wait_for",
                    self.index, definition.id, expected.seq_no, expected.primary_term
                ),
                Some(&body),
                operation,
            )
            .await?;
        if response.status == 409 {
            // 🕵️ ES says 409 both for "someone else wrote" and "nobody is home". Look before blaming.
            return match self.get(&definition.id).await? {
                None => Err(StoreError::NotFound(definition.id.clone())),
                Some(current) => Err(StoreError::VersionConflict {
                    id: definition.id.clone(),
                    expected: expected.to_string(),
                    actual: current.version.to_string(),
                }),
            };
        }
        if !response.is_success() {
            return Err(response.into_error(operation).into());
        }
        Ok(StoredDefinition {
            definition: definition.clone(),
            version: decode_version(&parse(&response, operation)?)?,
        })
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let operation = "delete";
        let response = self
            .http
            .send(
                Method::DELETE,
                &format!("{}/_doc/{id}?refresh=wait_for", self.index),
                None,
                operation,
            )
            .await?;
        if response.status == 404 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if !response.is_success() {
            return Err(response.into_error(operation).into());
        }
        Ok(())
    }
}
