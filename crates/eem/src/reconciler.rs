//! 🔍 State Reconciler: "is it installed?" "is it running?" "define 'it'."
//!
//! 🎬 The definition says it owns six resources. The cluster has opinions.
//! This module asks the cluster about every single one of them, at the same
//! time, and writes down exactly what it heard.
//!
//! 🧠 Knowledge graph:
//! - Input: a definition's `installed_components` (the only list we check).
//! - Output: [`DefinitionState`]: a per-component `resources` list plus two
//!   booleans folded out of that same list. One source of truth, two summaries.
//! - 404s are answers, not errors: they become [`Observed::Missing`].
//! - [`EntityDefinitionStats`] looks at the output instead: how many entities
//!   the latest index holds and when the freshest one was last seen.
//! - Nothing here is ever persisted. Ask again, get a fresh answer.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::backends::{
    Cluster, PipelineStats, SearchRequest, SortField, SortOrder, TransformTaskState,
};
use crate::common::{ComponentType, EntityDefinition};
use crate::errors::ClusterError;
use crate::resources::ids;

const LAST_SEEN_FIELD: &str = "entity.lastSeenTimestamp";

/// 🩺 What the cluster said about one component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Observed {
    /// 👻 Not there. Never was, or not anymore.
    Missing,
    IngestPipeline { stats: Option<PipelineStats> },
    Template { template: Value },
    Transform {
        state: TransformTaskState,
        stats: Value,
        summary: Value,
    },
}

/// 📋 One line of the diagnostic report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentState {
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub observed: Observed,
}

impl ComponentState {
    pub fn installed(&self) -> bool {
        !matches!(self.observed, Observed::Missing)
    }

    /// 🏃 `Some(running)` for transforms, `None` for everything that can't run.
    pub fn running(&self) -> Option<bool> {
        match (&self.observed, self.component_type) {
            (Observed::Transform { state, .. }, _) => Some(state.is_running()),
            (Observed::Missing, ComponentType::Transform) => Some(false),
            _ => None,
        }
    }
}

/// 📊 The aggregate verdict plus the evidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefinitionState {
    pub installed: bool,
    pub running: bool,
    pub resources: Vec<ComponentState>,
}

impl DefinitionState {
    /// 🧮 AND semantics all the way down, with one twist: an empty list proves
    /// nothing, so zero components is not installed and zero transforms is not running.
    pub fn from_components(resources: Vec<ComponentState>) -> Self {
        #[derive(Default)]
        struct Tally {
            components: usize,
            missing: usize,
            transforms: usize,
            idle_transforms: usize,
        }
        let tally = resources.iter().fold(Tally::default(), |mut tally, component| {
            tally.components += 1;
            if !component.installed() {
                tally.missing += 1;
            }
            if let Some(running) = component.running() {
                tally.transforms += 1;
                if !running {
                    tally.idle_transforms += 1;
                }
            }
            tally
        });
        Self {
            installed: tally.components > 0 && tally.missing == 0,
            running: tally.transforms > 0 && tally.idle_transforms == 0,
            resources,
        }
    }

    pub fn component(&self, id: &str) -> Option<&ComponentState> {
        self.resources.iter().find(|component| component.id == id)
    }
}

/// 📈 What the definition has produced so far, read off its latest index.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDefinitionStats {
    pub entity_count: u64,
    /// `entity.lastSeenTimestamp` of the most recently seen entity, as stored.
    pub last_seen_timestamp: Option<Value>,
}

/// 🔍 Observes live cluster state for a definition's components.
#[derive(Debug)]
pub struct StateReconciler<C> {
    cluster: Arc<C>,
}

impl<C> Clone for StateReconciler<C> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
        }
    }
}

impl<C: Cluster> StateReconciler<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    pub async fn get_state(
        &self,
        definition: &EntityDefinition,
    ) -> Result<DefinitionState, ClusterError> {
        let (pipelines, transforms, templates) = futures::try_join!(
            self.pipeline_states(definition),
            self.transform_states(definition),
            self.template_states(definition),
        )?;

        let by_key: HashMap<(ComponentType, String), ComponentState> = pipelines
            .into_iter()
            .chain(transforms)
            .chain(templates)
            .map(|state| ((state.component_type, state.id.clone()), state))
            .collect();
        // 📋 Report in the order the definition lists its components.
        let resources = definition
            .installed_components
            .iter()
            .filter_map(|component| {
                by_key
                    .get(&(component.component_type, component.id.clone()))
                    .cloned()
            })
            .collect::<Vec<_>>();

        let state = DefinitionState::from_components(resources);
        debug!(
            "🔍 Entity definition [{}] reconciled: installed={} running={} ({} components)",
            definition.id,
            state.installed,
            state.running,
            state.resources.len()
        );
        Ok(state)
    }

    /// 📈 Counts the entities in the latest index and finds the freshest one.
    /// No latest index yet is zero entities, not an error.
    pub async fn get_stats(
        &self,
        definition: &EntityDefinition,
    ) -> Result<EntityDefinitionStats, ClusterError> {
        let request = SearchRequest {
            query: None,
            size: 1,
            sort: vec![SortField::new(LAST_SEEN_FIELD, SortOrder::Desc)],
            search_after: None,
        };
        let found = self
            .cluster
            .search(&ids::latest_index_name(definition), &request)
            .await?;
        let last_seen_timestamp = found.hits.first().and_then(|hit| {
            hit.source
                .get(LAST_SEEN_FIELD)
                .or_else(|| hit.source.pointer("/entity/lastSeenTimestamp"))
                .filter(|value| !value.is_null())
                .cloned()
        });
        Ok(EntityDefinitionStats {
            entity_count: found.total,
            last_seen_timestamp,
        })
    }

    async fn pipeline_states(
        &self,
        definition: &EntityDefinition,
    ) -> Result<Vec<ComponentState>, ClusterError> {
        let ids = definition.component_ids(ComponentType::IngestPipeline);
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let (pipelines, stats) = futures::try_join!(
            self.cluster.get_ingest_pipelines(&ids),
            self.cluster.ingest_pipeline_stats(&ids),
        )?;
        Ok(ids
            .into_iter()
            .map(|id| {
                let observed = if pipelines.contains_key(&id) {
                    Observed::IngestPipeline {
                        stats: stats.get(&id).copied(),
                    }
                } else {
                    Observed::Missing
                };
                ComponentState {
                    id,
                    component_type: ComponentType::IngestPipeline,
                    observed,
                }
            })
            .collect())
    }

    async fn transform_states(
        &self,
        definition: &EntityDefinition,
    ) -> Result<Vec<ComponentState>, ClusterError> {
        let ids = definition.component_ids(ComponentType::Transform);
        try_join_all(ids.into_iter().map(|id| async move {
            let (summary, stats) = futures::try_join!(
                self.cluster.get_transform(&id),
                self.cluster.get_transform_stats(&id),
            )?;
            // 🧩 Both halves or nothing: a summary without stats is a transform mid-delete.
            let observed = match (summary, stats) {
                (Some(summary), Some(stats)) => Observed::Transform {
                    state: stats.state,
                    stats: stats.stats,
                    summary,
                },
                _ => Observed::Missing,
            };
            Ok::<_, ClusterError>(ComponentState {
                id,
                component_type: ComponentType::Transform,
                observed,
            })
        }))
        .await
    }

    async fn template_states(
        &self,
        definition: &EntityDefinition,
    ) -> Result<Vec<ComponentState>, ClusterError> {
        let ids = definition.component_ids(ComponentType::Template);
        try_join_all(ids.into_iter().map(|id| async move {
            let observed = match self.cluster.get_index_template(&id).await? {
                Some(template) => Observed::Template { template },
                None => Observed::Missing,
            };
            Ok::<_, ClusterError>(ComponentState {
                id,
                component_type: ComponentType::Template,
                observed,
            })
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{ClusterOp, InMemoryCluster, InjectedFailure};
    use crate::common::InstalledComponent;
    use crate::common::fixtures::service_definition;
    use serde_json::json;

    fn with_components(components: &[(&str, ComponentType)]) -> EntityDefinition {
        let mut definition = service_definition("svc");
        definition.installed_components = components
            .iter()
            .map(|(id, kind)| InstalledComponent::new(*id, *kind))
            .collect();
        definition
    }

    async fn started_transform(cluster: &InMemoryCluster, id: &str) {
        cluster
            .put_transform(id, &json!({ "source": {} }))
            .await
            .expect("put");
        cluster.start_transform(id).await.expect("start");
    }

    #[tokio::test]
    async fn the_one_where_nothing_installed_means_nothing_running() {
        let reconciler = StateReconciler::new(Arc::new(InMemoryCluster::new()));
        let state = reconciler
            .get_state(&with_components(&[]))
            .await
            .expect("state");
        assert!(!state.installed);
        assert!(!state.running);
        assert!(state.resources.is_empty());
    }

    #[tokio::test]
    async fn the_one_where_running_is_an_and_not_an_or() {
        let cluster = InMemoryCluster::new();
        started_transform(&cluster, "t1").await;
        started_transform(&cluster, "t2").await;
        cluster
            .set_transform_state("t2", TransformTaskState::Indexing)
            .await;
        let definition = with_components(&[
            ("t1", ComponentType::Transform),
            ("t2", ComponentType::Transform),
        ]);
        let reconciler = StateReconciler::new(Arc::new(cluster.clone()));

        let state = reconciler.get_state(&definition).await.expect("state");
        assert!(state.installed);
        assert!(state.running, "started + indexing is running");

        cluster
            .set_transform_state("t2", TransformTaskState::Stopped)
            .await;
        let state = reconciler.get_state(&definition).await.expect("state");
        assert!(state.installed);
        assert!(!state.running, "one stopped transform is enough to say no");
    }

    #[tokio::test]
    async fn the_one_where_one_transform_went_missing() {
        let cluster = InMemoryCluster::new();
        started_transform(&cluster, "t1").await;
        cluster
            .put_ingest_pipeline("p1", &json!({ "processors": [] }))
            .await
            .expect("pipeline");
        cluster
            .set_pipeline_stats("p1", PipelineStats { count: 42, failed: 2 })
            .await;
        let definition = with_components(&[
            ("t1", ComponentType::Transform),
            ("t2", ComponentType::Transform),
            ("p1", ComponentType::IngestPipeline),
        ]);
        let reconciler = StateReconciler::new(Arc::new(cluster));

        let state = reconciler.get_state(&definition).await.expect("state");
        assert!(!state.installed);
        assert!(!state.running);
        assert_eq!(state.resources.len(), 3);

        let ids: Vec<_> = state.resources.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "p1"], "stored order is kept");

        let t1 = state.component("t1").expect("t1");
        assert!(t1.installed());
        assert_eq!(t1.running(), Some(true));

        let t2 = state.component("t2").expect("t2");
        assert_eq!(t2.observed, Observed::Missing);
        assert_eq!(t2.running(), Some(false));

        let p1 = state.component("p1").expect("p1");
        assert_eq!(
            p1.observed,
            Observed::IngestPipeline {
                stats: Some(PipelineStats { count: 42, failed: 2 })
            }
        );
        assert_eq!(p1.running(), None);
    }

    #[tokio::test]
    async fn the_one_where_pipelines_alone_are_installed_but_never_running() {
        let cluster = InMemoryCluster::new();
        cluster
            .put_ingest_pipeline("p1", &json!({}))
            .await
            .expect("pipeline");
        cluster
            .put_index_template("tpl", &json!({}))
            .await
            .expect("template");
        let definition = with_components(&[
            ("p1", ComponentType::IngestPipeline),
            ("tpl", ComponentType::Template),
        ]);

        let state = StateReconciler::new(Arc::new(cluster))
            .get_state(&definition)
            .await
            .expect("state");
        assert!(state.installed);
        assert!(!state.running);
    }

    #[tokio::test]
    async fn the_one_where_a_real_error_is_not_mistaken_for_absence() {
        let cluster = InMemoryCluster::new();
        started_transform(&cluster, "t1").await;
        cluster
            .fail_on(ClusterOp::GetTransformStats, "t1", InjectedFailure::ServerError)
            .await;
        let definition = with_components(&[("t1", ComponentType::Transform)]);

        let result = StateReconciler::new(Arc::new(cluster))
            .get_state(&definition)
            .await;
        assert!(matches!(result, Err(ClusterError::Response { status: 500, .. })));
    }

    #[test]
    fn the_one_where_the_report_serializes_with_a_status_tag() {
        let state = DefinitionState::from_components(vec![ComponentState {
            id: "tpl".to_string(),
            component_type: ComponentType::Template,
            observed: Observed::Missing,
        }]);
        let json = serde_json::to_value(&state).expect("serialize");
        assert_eq!(json["installed"], false);
        assert_eq!(json["resources"][0]["type"], "template");
        assert_eq!(json["resources"][0]["observed"]["status"], "missing");
    }

    #[tokio::test]
    async fn the_one_where_stats_count_entities_and_remember_the_freshest() {
        let cluster = InMemoryCluster::new();
        let definition = service_definition("svc");
        for (id, seen) in [("a", "2026-10-01T00:00:00Z"), ("b", "2026-10-17T12:00:00Z")] {
            cluster
                .index_document(
                    &ids::latest_index_name(&definition),
                    id,
                    json!({ "entity": { "id": id, "lastSeenTimestamp": seen } }),
                )
                .await;
        }
        cluster
            .index_document(
                ".entities.v1.latest.other",
                "x",
                json!({ "entity": { "id": "x", "lastSeenTimestamp": "2030-01-01T00:00:00Z" } }),
            )
            .await;

        let stats = StateReconciler::new(Arc::new(cluster))
            .get_stats(&definition)
            .await
            .expect("stats");
        assert_eq!(stats.entity_count, 2);
        assert_eq!(stats.last_seen_timestamp, Some(json!("2026-10-17T12:00:00Z")));
    }

    #[tokio::test]
    async fn the_one_where_no_latest_index_means_no_entities_yet() {
        let stats = StateReconciler::new(Arc::new(InMemoryCluster::new()))
            .get_stats(&service_definition("svc"))
            .await
            .expect("stats");
        assert_eq!(stats, EntityDefinitionStats::default());
        let json = serde_json::to_value(&stats).expect("serialize");
        assert_eq!(json["entityCount"], 0);
    }
}
