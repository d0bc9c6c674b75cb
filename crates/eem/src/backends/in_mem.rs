//! # Previously, on the entity manager...
//!
//! 🎬 The cluster was down. Again. The integration tests were red. Again.
//! Somebody said "what if the cluster lived in RAM?" and everyone laughed,
//! and then everyone stopped laughing, because it was a good idea.
//!
//! `in_mem` provides an in-memory [`Cluster`] and [`DefinitionStore`] for tests
//! and local demos. Both wrap their state in `Arc<Mutex<...>>` and are `Clone`,
//! so a test can hand one copy to the entity client and keep another to peek
//! inside afterwards: which transforms are started, which pipelines exist, which
//! calls were made in which order.
//!
//! 💥 [`InMemoryCluster::fail_on`] injects failures per operation + resource id,
//! which is how the partial-install and partial-start scenarios get exercised
//! without a real cluster having a real bad day.
//!
//! ⚠️ NOT for production. If you're deploying this to prod, please also deploy a therapist.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::backends::{
    Cluster, DefinitionQuery, DefinitionStore, DocVersion, Page, PipelineStats, SearchHit,
    SearchRequest, SearchResponse, SortField, SortOrder, StoredDefinition, TransformStats,
    TransformTaskState,
};
use crate::common::EntityDefinition;
use crate::errors::{ClusterError, StoreError};

/// 🎯 Which call a failure is injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    PutIngestPipeline,
    GetIngestPipeline,
    DeleteIngestPipeline,
    PutIndexTemplate,
    GetIndexTemplate,
    DeleteIndexTemplate,
    PutTransform,
    GetTransform,
    GetTransformStats,
    StartTransform,
    StopTransform,
    DeleteTransform,
    Search,
}

/// 💥 Flavours of simulated misfortune.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// 🔒 A 403 with `security_exception`.
    Security,
    /// 🔥 A 500 with nothing useful in it. Realistic.
    ServerError,
}

#[derive(Debug, Clone)]
struct SimulatedTransform {
    body: Value,
    state: TransformTaskState,
}

#[derive(Debug, Default)]
struct ClusterState {
    pipelines: HashMap<String, Value>,
    pipeline_stats: HashMap<String, PipelineStats>,
    templates: HashMap<String, Value>,
    transforms: HashMap<String, SimulatedTransform>,
    indices: BTreeSet<String>,
    documents: BTreeMap<String, BTreeMap<String, Value>>,
    failures: HashMap<(ClusterOp, String), InjectedFailure>,
    calls: Vec<String>,
}

impl ClusterState {
    /// 📝 Logs the call, then springs any trap set for it.
    fn check(&mut self, op: ClusterOp, id: &str) -> Result<(), ClusterError> {
        self.calls.push(format!("{op:?}:{id}"));
        match self.failures.get(&(op, id.to_string())) {
            None => Ok(()),
            Some(InjectedFailure::Security) => Err(ClusterError::Security {
                operation: format!("{op:?}"),
                reason: format!("action on [{id}] is unauthorized for user [eem_tester]"),
            }),
            Some(InjectedFailure::ServerError) => Err(ClusterError::Response {
                operation: format!("{op:?}"),
                status: 500,
                body: "simulated failure".to_string(),
            }),
        }
    }
}

fn missing_transform(op: ClusterOp, id: &str) -> ClusterError {
    ClusterError::Response {
        operation: format!("{op:?}"),
        status: 404,
        body: format!("Transform with id [{id}] could not be found"),
    }
}

/// 📦 A pretend cluster that never goes red.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 💥 The next (and every following) `op` on `id` fails with `failure`.
    pub async fn fail_on(&self, op: ClusterOp, id: &str, failure: InjectedFailure) {
        self.state
            .lock()
            .await
            .failures
            .insert((op, id.to_string()), failure);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// 🎛️ Forces a transform into a state, e.g. `Indexing` or `Failed`.
    pub async fn set_transform_state(&self, id: &str, state: TransformTaskState) {
        if let Some(transform) = self.state.lock().await.transforms.get_mut(id) {
            transform.state = state;
        }
    }

    /// 👻 Makes a transform vanish behind our back, like an operator with cluster admin.
    pub async fn remove_transform(&self, id: &str) {
        self.state.lock().await.transforms.remove(id);
    }

    pub async fn set_pipeline_stats(&self, id: &str, stats: PipelineStats) {
        self.state
            .lock()
            .await
            .pipeline_stats
            .insert(id.to_string(), stats);
    }

    pub async fn create_index(&self, name: &str) {
        self.state.lock().await.indices.insert(name.to_string());
    }

    /// 📄 Drops a document into an index, creating the index if it wasn't there.
    pub async fn index_document(&self, index: &str, id: &str, document: Value) {
        let mut state = self.state.lock().await;
        state.indices.insert(index.to_string());
        state
            .documents
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), document);
    }

    pub async fn indices(&self) -> Vec<String> {
        self.state.lock().await.indices.iter().cloned().collect()
    }

    pub async fn transform_state(&self, id: &str) -> Option<TransformTaskState> {
        self.state
            .lock()
            .await
            .transforms
            .get(id)
            .map(|transform| transform.state)
    }

    pub async fn transform_body(&self, id: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .transforms
            .get(id)
            .map(|transform| transform.body.clone())
    }

    pub async fn has_transform(&self, id: &str) -> bool {
        self.state.lock().await.transforms.contains_key(id)
    }

    pub async fn has_pipeline(&self, id: &str) -> bool {
        self.state.lock().await.pipelines.contains_key(id)
    }

    pub async fn has_template(&self, name: &str) -> bool {
        self.state.lock().await.templates.contains_key(name)
    }

    /// 📝 Every call made so far, as `Op:id`, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }
}

/// 🔍 `*` suffix wildcard, comma lists, exact names. Enough of ES's expression language to be dangerous.
fn index_matches(pattern: &str, index: &str) -> bool {
    pattern.split(',').any(|part| match part.strip_suffix('*') {
        Some(prefix) => index.starts_with(prefix),
        None => index == part,
    })
}

/// 🔎 Looks a dotted path up both flat (`{"entity.id": ..}`) and nested (`{"entity": {"id": ..}}`).
fn field_value<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    document
        .get(path)
        .or_else(|| document.pointer(&format!("/{}", path.replace('.', "/"))))
}

/// 🧪 Understands exactly one query shape, `field:value`. Anything else matches everything.
fn matches_search(query: Option<&str>, document: &Value) -> bool {
    let Some((field, expected)) = query.and_then(|query| query.trim().split_once(':')) else {
        return true;
    };
    let expected = expected.trim().trim_matches('"');
    field_value(document, field.trim()).is_some_and(|value| match value {
        Value::String(text) => text == expected,
        other => other.to_string() == expected,
    })
}

fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left.as_f64(), right.as_f64()) {
        (Some(left), Some(right)) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
        _ => match (left.as_str(), right.as_str()) {
            (Some(left), Some(right)) => left.cmp(right),
            _ => left.to_string().cmp(&right.to_string()),
        },
    }
}

/// 📏 Field-by-field, direction-aware. Missing values sort last either way, like ES.
fn compare_sort_keys(left: &[Value], right: &[Value], sort: &[SortField]) -> Ordering {
    sort.iter()
        .zip(left.iter().zip(right))
        .map(|(field, (left, right))| match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => match field.order {
                SortOrder::Asc => compare_values(left, right),
                SortOrder::Desc => compare_values(left, right).reverse(),
            },
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

#[async_trait]
impl Cluster for InMemoryCluster {
    async fn put_ingest_pipeline(&self, id: &str, body: &Value) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::PutIngestPipeline, id)?;
        state.pipelines.insert(id.to_string(), body.clone());
        Ok(())
    }

    async fn get_ingest_pipelines(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Value>, ClusterError> {
        let mut state = self.state.lock().await;
        for id in ids {
            state.check(ClusterOp::GetIngestPipeline, id)?;
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.pipelines.get(id).map(|body| (id.clone(), body.clone())))
            .collect())
    }

    async fn ingest_pipeline_stats(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PipelineStats>, ClusterError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter(|id| state.pipelines.contains_key(*id))
            .map(|id| {
                let stats = state.pipeline_stats.get(id).copied().unwrap_or_default();
                (id.clone(), stats)
            })
            .collect())
    }

    async fn delete_ingest_pipeline(&self, id: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::DeleteIngestPipeline, id)?;
        state.pipelines.remove(id);
        state.pipeline_stats.remove(id);
        Ok(())
    }

    async fn put_index_template(&self, name: &str, body: &Value) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::PutIndexTemplate, name)?;
        state.templates.insert(name.to_string(), body.clone());
        Ok(())
    }

    async fn get_index_template(&self, name: &str) -> Result<Option<Value>, ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::GetIndexTemplate, name)?;
        Ok(state.templates.get(name).cloned())
    }

    async fn delete_index_template(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::DeleteIndexTemplate, name)?;
        state.templates.remove(name);
        Ok(())
    }

    async fn put_transform(&self, id: &str, body: &Value) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::PutTransform, id)?;
        // 🔁 Same id, same revision, same body: a second put is a no-op.
        state
            .transforms
            .entry(id.to_string())
            .or_insert_with(|| SimulatedTransform {
                body: body.clone(),
                state: TransformTaskState::Stopped,
            });
        Ok(())
    }

    async fn get_transform(&self, id: &str) -> Result<Option<Value>, ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::GetTransform, id)?;
        Ok(state.transforms.get(id).map(|transform| {
            let mut summary = transform.body.clone();
            if let Some(object) = summary.as_object_mut() {
                object.insert("id".to_string(), json!(id));
            }
            summary
        }))
    }

    async fn get_transform_stats(&self, id: &str) -> Result<Option<TransformStats>, ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::GetTransformStats, id)?;
        Ok(state.transforms.get(id).map(|transform| TransformStats {
            id: id.to_string(),
            state: transform.state,
            stats: json!({ "pages_processed": 0, "documents_indexed": 0 }),
        }))
    }

    async fn start_transform(&self, id: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::StartTransform, id)?;
        let transform = state
            .transforms
            .get_mut(id)
            .ok_or_else(|| missing_transform(ClusterOp::StartTransform, id))?;
        transform.state = TransformTaskState::Started;
        Ok(())
    }

    async fn stop_transform(&self, id: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::StopTransform, id)?;
        let transform = state
            .transforms
            .get_mut(id)
            .ok_or_else(|| missing_transform(ClusterOp::StopTransform, id))?;
        transform.state = TransformTaskState::Stopped;
        Ok(())
    }

    async fn delete_transform(&self, id: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::DeleteTransform, id)?;
        state.transforms.remove(id);
        Ok(())
    }

    async fn delete_indices(&self, pattern: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("DeleteIndices:{pattern}"));
        state.indices.retain(|index| !index_matches(pattern, index));
        state.documents.retain(|index, _| !index_matches(pattern, index));
        Ok(())
    }

    async fn search(
        &self,
        pattern: &str,
        request: &SearchRequest,
    ) -> Result<SearchResponse, ClusterError> {
        let mut state = self.state.lock().await;
        state.check(ClusterOp::Search, pattern)?;
        let mut hits: Vec<SearchHit> = state
            .documents
            .iter()
            .filter(|(index, _)| index_matches(pattern, index))
            .flat_map(|(index, documents)| {
                documents.iter().map(move |(id, source)| (index, id, source))
            })
            .filter(|(_, _, source)| matches_search(request.query.as_deref(), source))
            .map(|(index, id, source)| SearchHit {
                index: index.clone(),
                id: id.clone(),
                source: source.clone(),
                sort: request
                    .sort
                    .iter()
                    .map(|field| field_value(source, &field.field).cloned().unwrap_or(Value::Null))
                    .collect(),
            })
            .collect();
        hits.sort_by(|left, right| {
            compare_sort_keys(&left.sort, &right.sort, &request.sort)
                .then_with(|| (&left.index, &left.id).cmp(&(&right.index, &right.id)))
        });

        // 📊 Like ES, the total ignores where the page starts.
        let total = hits.len() as u64;
        let hits = hits
            .into_iter()
            .filter(|hit| match &request.search_after {
                Some(after) => compare_sort_keys(&hit.sort, after, &request.sort).is_gt(),
                None => true,
            })
            .take(request.size)
            .collect();
        Ok(SearchResponse { total, hits })
    }
}

#[derive(Debug, Default)]
struct StoreState {
    docs: BTreeMap<String, StoredDefinition>,
    seq_no: u64,
}

impl StoreState {
    fn next_version(&mut self) -> DocVersion {
        self.seq_no += 1;
        DocVersion {
            seq_no: self.seq_no,
            primary_term: 1,
        }
    }
}

/// 🗄️ A definition store that forgets everything when the process exits. Like a goldfish, but versioned.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_query(definition: &EntityDefinition, query: &DefinitionQuery) -> bool {
    if let Some(id) = &query.id {
        if &definition.id != id {
            return false;
        }
    }
    if let Some(entity_type) = &query.entity_type {
        if &definition.entity_type != entity_type {
            return false;
        }
    }
    match query.built_in {
        Some(built_in) => definition.is_built_in() == built_in,
        None => true,
    }
}

#[async_trait]
impl DefinitionStore for InMemoryStore {
    async fn find(&self, query: &DefinitionQuery) -> Result<Page<StoredDefinition>, StoreError> {
        let state = self.state.lock().await;
        let matching: Vec<&StoredDefinition> = state
            .docs
            .values()
            .filter(|stored| matches_query(&stored.definition, query))
            .collect();
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(query.offset())
            .take(query.per_page)
            .cloned()
            .collect();
        Ok(Page { items, total })
    }

    async fn get(&self, id: &str) -> Result<Option<StoredDefinition>, StoreError> {
        Ok(self.state.lock().await.docs.get(id).cloned())
    }

    async fn create(&self, definition: &EntityDefinition) -> Result<StoredDefinition, StoreError> {
        let mut state = self.state.lock().await;
        if state.docs.contains_key(&definition.id) {
            return Err(StoreError::AlreadyExists(definition.id.clone()));
        }
        let stored = StoredDefinition {
            definition: definition.clone(),
            version: state.next_version(),
        };
        state.docs.insert(definition.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        definition: &EntityDefinition,
        expected: DocVersion,
    ) -> Result<StoredDefinition, StoreError> {
        let mut state = self.state.lock().await;
        let current = state
            .docs
            .get(&definition.id)
            .map(|stored| stored.version)
            .ok_or_else(|| StoreError::NotFound(definition.id.clone()))?;
        // 🏁 Check-and-set: the version you read must still be the version we hold.
        if current != expected {
            return Err(StoreError::VersionConflict {
                id: definition.id.clone(),
                expected: expected.to_string(),
                actual: current.to_string(),
            });
        }
        let stored = StoredDefinition {
            definition: definition.clone(),
            version: state.next_version(),
        };
        state.docs.insert(definition.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .docs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
