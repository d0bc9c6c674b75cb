//! 🚦 Start and stop a definition's transforms, all at once, and own up to partial failure.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};

use crate::backends::Cluster;
use crate::common::{ComponentType, EntityDefinition};
use crate::errors::{ClusterError, EntityManagerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Stop,
}

impl Action {
    fn label(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
        }
    }
}

#[derive(Debug)]
pub struct TransformController<C> {
    cluster: Arc<C>,
}

impl<C> Clone for TransformController<C> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
        }
    }
}

impl<C: Cluster> TransformController<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    pub async fn start(&self, definition: &EntityDefinition) -> Result<()> {
        let ids = definition.component_ids(ComponentType::Transform);
        self.start_transforms(&definition.id, &ids).await
    }

    pub async fn stop(&self, definition: &EntityDefinition) -> Result<()> {
        let ids = definition.component_ids(ComponentType::Transform);
        self.stop_transforms(&definition.id, &ids).await
    }

    /// ▶️ Starts just these transforms of `definition_id`.
    pub async fn start_transforms(&self, definition_id: &str, ids: &[String]) -> Result<()> {
        self.apply(definition_id, ids, Action::Start).await
    }

    /// ⏹️ Stops just these transforms of `definition_id`. A transform that is
    /// already gone counts as stopped.
    pub async fn stop_transforms(&self, definition_id: &str, ids: &[String]) -> Result<()> {
        self.apply(definition_id, ids, Action::Stop).await
    }

    /// 🎯 Every transform gets its call; the ones that said no are listed in the error.
    /// The ones that said yes stay that way.
    async fn apply(&self, definition_id: &str, ids: &[String], action: Action) -> Result<()> {
        let outcomes = join_all(ids.iter().map(|id| async move {
            let outcome = match action {
                Action::Start => self.cluster.start_transform(id).await,
                Action::Stop => match self.cluster.stop_transform(id).await {
                    Err(err) if err.is_not_found() => Ok(()),
                    outcome => outcome,
                },
            };
            (id, outcome)
        }))
        .await;

        let mut failed = Vec::new();
        let mut security: Option<ClusterError> = None;
        for (id, outcome) in outcomes {
            if let Err(err) = outcome {
                error!(
                    "💀 Failed to {} transform [{id}] of entity definition [{definition_id}]: {err}",
                    action.label()
                );
                failed.push(id.clone());
                if err.is_security() && security.is_none() {
                    security = Some(err);
                }
            }
        }

        if failed.is_empty() {
            info!(
                "🚦 {} transforms of entity definition [{definition_id}]: {}",
                ids.len(),
                match action {
                    Action::Start => "started",
                    Action::Stop => "stopped",
                }
            );
            return Ok(());
        }
        // 🔒 Missing privileges on every call is a permissions problem, not a transform problem.
        if failed.len() == ids.len() {
            if let Some(err) = security {
                return Err(EntityManagerError::install(definition_id, err));
            }
        }
        Err(EntityManagerError::TransformControl {
            definition_id: definition_id.to_string(),
            action: action.label(),
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{ClusterOp, InMemoryCluster, InjectedFailure, TransformTaskState};
    use crate::common::InstalledComponent;
    use crate::common::fixtures::service_definition;
    use serde_json::json;

    async fn two_transforms() -> (InMemoryCluster, EntityDefinition) {
        let cluster = InMemoryCluster::new();
        let mut definition = service_definition("svc");
        definition.installed_components = vec![
            InstalledComponent::new("t1", ComponentType::Transform),
            InstalledComponent::new("p1", ComponentType::IngestPipeline),
            InstalledComponent::new("t2", ComponentType::Transform),
        ];
        for id in ["t1", "t2"] {
            cluster
                .put_transform(id, &json!({}))
                .await
                .expect("put transform");
        }
        (cluster, definition)
    }

    #[tokio::test]
    async fn the_one_where_everybody_starts_and_then_everybody_stops() {
        let (cluster, definition) = two_transforms().await;
        let controller = TransformController::new(Arc::new(cluster.clone()));

        controller.start(&definition).await.expect("start");
        assert_eq!(cluster.transform_state("t1").await, Some(TransformTaskState::Started));
        assert_eq!(cluster.transform_state("t2").await, Some(TransformTaskState::Started));

        controller.start(&definition).await.expect("starting twice is fine");

        controller.stop(&definition).await.expect("stop");
        assert_eq!(cluster.transform_state("t1").await, Some(TransformTaskState::Stopped));
        assert_eq!(cluster.transform_state("t2").await, Some(TransformTaskState::Stopped));
    }

    #[tokio::test]
    async fn the_one_where_one_transform_refuses_and_the_other_runs_anyway() {
        let (cluster, definition) = two_transforms().await;
        cluster
            .fail_on(ClusterOp::StartTransform, "t2", InjectedFailure::ServerError)
            .await;

        let result = TransformController::new(Arc::new(cluster.clone()))
            .start(&definition)
            .await;
        match result {
            Err(EntityManagerError::TransformControl {
                definition_id,
                action,
                failed,
            }) => {
                assert_eq!(definition_id, "svc");
                assert_eq!(action, "start");
                assert_eq!(failed, vec!["t2".to_string()]);
            }
            plot_twist => panic!("💀 expected TransformControl, got {plot_twist:?}"),
        }
        assert_eq!(cluster.transform_state("t1").await, Some(TransformTaskState::Started));
        assert_eq!(cluster.transform_state("t2").await, Some(TransformTaskState::Stopped));
    }

    #[tokio::test]
    async fn the_one_where_nobody_has_the_privileges() {
        let (cluster, definition) = two_transforms().await;
        for id in ["t1", "t2"] {
            cluster
                .fail_on(ClusterOp::StopTransform, id, InjectedFailure::Security)
                .await;
        }

        let result = TransformController::new(Arc::new(cluster))
            .stop(&definition)
            .await;
        assert!(matches!(
            result,
            Err(EntityManagerError::SecurityException { definition_id, .. }) if definition_id == "svc"
        ));
    }

    #[tokio::test]
    async fn the_one_where_no_transforms_means_nothing_to_do() {
        let cluster = InMemoryCluster::new();
        let mut definition = service_definition("svc");
        definition.installed_components.clear();

        TransformController::new(Arc::new(cluster.clone()))
            .start(&definition)
            .await
            .expect("vacuous start");
        assert!(cluster.calls().await.is_empty());
    }

    #[tokio::test]
    async fn the_one_where_stopping_a_vanished_transform_is_already_done() {
        let (cluster, definition) = two_transforms().await;
        let controller = TransformController::new(Arc::new(cluster.clone()));
        controller.start(&definition).await.expect("start");
        cluster.remove_transform("t2").await;

        controller
            .stop(&definition)
            .await
            .expect("💀 a 404 on stop means there was nothing left to stop");
        assert_eq!(cluster.transform_state("t1").await, Some(TransformTaskState::Stopped));
    }

    #[tokio::test]
    async fn the_one_where_only_the_named_transforms_get_touched() {
        let (cluster, _) = two_transforms().await;
        let controller = TransformController::new(Arc::new(cluster.clone()));

        controller
            .start_transforms("svc", &["t2".to_string()])
            .await
            .expect("start t2");
        assert_eq!(cluster.transform_state("t1").await, Some(TransformTaskState::Stopped));
        assert_eq!(cluster.transform_state("t2").await, Some(TransformTaskState::Started));
    }
}
