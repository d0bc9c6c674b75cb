//! 🎯 EntityClient: the front desk. Every request about entity definitions checks in here.
//!
//! 🎬 *[narrator voice]* "The store knows what was asked for. The cluster knows
//! what actually exists. The client is the only one who talks to both, and it
//! is very tired of being the middle child."
//!
//! 🧠 Knowledge graph:
//! ```text
//!   create ──▶ Installer::install ──▶ (TransformController::start unless install_only)
//!   update ──▶ in-progress guard ──▶ StateReconciler (was it running?)
//!              ──▶ Installer::claim_upgrade ──▶ stop what was running
//!              ──▶ Installer::complete_upgrade ──▶ (start if it was running) ──▶ remove previous revision
//!   delete ──▶ Installer::uninstall
//!   find/get ─▶ DefinitionStore (+ state and stats per hit when include_state)
//!   find_entities ─▶ Cluster::search over every latest index
//!   start/stop ─▶ TransformController
//! ```
//!
//! ⚠️ Lifecycle: uninstalled → installing → installed(stopped) ⇄ installed(running)
//! → uninstalling → uninstalled. `upgrading` is what `update` looks like from
//! the outside. `failed` sticks around until the next update or delete.

use std::sync::Arc;

use chrono::Utc;
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::app_config::ManagerConfig;
use crate::backends::{
    Cluster, DefinitionQuery, DefinitionStore, SearchRequest, SortField, SortOrder,
    StoredDefinition,
};
use crate::common::{EntityDefinition, EntityDefinitionUpdate};
use crate::errors::{EntityManagerError, Result};
use crate::installer::{Installer, Reinstalled};
use crate::reconciler::{DefinitionState, EntityDefinitionStats, StateReconciler};
use crate::resources::ids;
use crate::transform_controller::TransformController;

const ENTITY_ID_FIELD: &str = "entity.id";

/// 🔍 Filters and paging for [`EntityClient::find`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindOptions {
    pub id: Option<String>,
    pub entity_type: Option<String>,
    /// `Some(false)` hides the `builtin_` definitions, `Some(true)` shows only them.
    pub built_in: Option<bool>,
    pub page: usize,
    /// `None` falls back to the configured default page size.
    pub per_page: Option<usize>,
    pub include_state: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            id: None,
            entity_type: None,
            built_in: None,
            page: 1,
            per_page: None,
            include_state: false,
        }
    }
}

/// 📦 A definition, optionally with what the cluster says about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDefinitionWithState {
    #[serde(flatten)]
    pub definition: EntityDefinition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DefinitionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<EntityDefinitionStats>,
}

/// 📄 One page of [`EntityClient::find`] results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindResult {
    pub definitions: Vec<EntityDefinitionWithState>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

/// 🔎 Paging and sorting for [`EntityClient::find_entities`].
#[derive(Debug, Clone, PartialEq)]
pub struct FindEntitiesOptions {
    pub per_page: usize,
    /// Lucene query-string syntax. `None` returns everything.
    pub query: Option<String>,
    /// The `search_after` of the previous page, to fetch the next one.
    pub search_after: Option<Vec<Value>>,
    pub sort_field: String,
    pub sort_direction: SortOrder,
}

impl Default for FindEntitiesOptions {
    fn default() -> Self {
        Self {
            per_page: 10,
            query: None,
            search_after: None,
            sort_field: "entity.lastSeenTimestamp".to_string(),
            sort_direction: SortOrder::Asc,
        }
    }
}

/// 📄 One page of entities. `search_after` is set when there may be more.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindEntitiesResult {
    pub entities: Vec<Value>,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_after: Option<Vec<Value>>,
}

#[derive(Debug)]
pub struct EntityClient<C, S> {
    cluster: Arc<C>,
    store: Arc<S>,
    installer: Installer<C, S>,
    reconciler: StateReconciler<C>,
    transforms: TransformController<C>,
    config: ManagerConfig,
}

impl<C: Cluster, S: DefinitionStore> EntityClient<C, S> {
    pub fn new(cluster: C, store: S, config: ManagerConfig) -> Self {
        let cluster = Arc::new(cluster);
        let store = Arc::new(store);
        Self {
            installer: Installer::new(Arc::clone(&cluster), Arc::clone(&store)),
            reconciler: StateReconciler::new(Arc::clone(&cluster)),
            transforms: TransformController::new(Arc::clone(&cluster)),
            cluster,
            store,
            config,
        }
    }

    /// 🚀 Installs a new definition and, unless `install_only`, starts its transforms.
    pub async fn create(
        &self,
        definition: EntityDefinition,
        install_only: bool,
    ) -> Result<EntityDefinition> {
        let installed = self.installer.install(&definition).await?;
        if !install_only {
            self.transforms.start(&installed).await?;
        }
        Ok(installed)
    }

    /// 🔁 Patches a definition and moves it to a fresh revision, keeping its running-ness.
    ///
    /// "Running" here means any transform running: a half-started definition
    /// comes back fully started. Validation and the version-checked claim come
    /// first, so a rejected update never stops anything. If the new revision
    /// fails to install, the transforms that were running are started again.
    pub async fn update(
        &self,
        id: &str,
        update: EntityDefinitionUpdate,
    ) -> Result<EntityDefinition> {
        let stored = self.claimable(id).await?;

        let state = self.reconciler.get_state(&stored.definition).await?;
        let running: Vec<String> = state
            .resources
            .iter()
            .filter(|component| component.running() == Some(true))
            .map(|component| component.id.clone())
            .collect();
        let was_running = !running.is_empty();

        let claim = self.installer.claim_upgrade(stored, &update).await?;
        if was_running {
            if let Err(err) = self.transforms.stop_transforms(id, &running).await {
                self.resume(id, &running).await;
                self.installer.release(claim).await;
                return Err(err);
            }
        }

        let Reinstalled {
            definition,
            previous_components,
        } = match self.installer.complete_upgrade(claim).await {
            Ok(reinstalled) => reinstalled,
            Err(err) => {
                if was_running {
                    self.resume(id, &running).await;
                }
                return Err(err);
            }
        };

        let started = if was_running {
            self.transforms.start(&definition).await
        } else {
            Ok(())
        };
        self.installer
            .uninstall_components(&previous_components)
            .await
            .map_err(|err| EntityManagerError::install(&definition.id, err))?;
        started?;

        info!(
            "✅ Entity definition [{id}] updated to revision {} (running={was_running})",
            definition.revision
        );
        Ok(definition)
    }

    /// 🗑️ Uninstalls the definition. `delete_data` also drops its history and latest indices.
    pub async fn delete(&self, id: &str, delete_data: bool) -> Result<()> {
        let stored = self.claimable(id).await?;
        self.installer.uninstall(stored, delete_data).await
    }

    pub async fn find(&self, options: FindOptions) -> Result<FindResult> {
        let query = DefinitionQuery {
            id: options.id,
            entity_type: options.entity_type,
            built_in: options.built_in,
            page: options.page.max(1),
            per_page: options.per_page.unwrap_or(self.config.default_per_page),
        };
        let page = self.store.find(&query).await?;
        let definitions = self
            .with_state(page.items, options.include_state)
            .await?;
        Ok(FindResult {
            definitions,
            total: page.total,
            page: query.page,
            per_page: query.per_page,
        })
    }

    pub async fn get(&self, id: &str, include_state: bool) -> Result<EntityDefinitionWithState> {
        let stored = self.lookup(id).await?;
        let mut found = self.with_state(vec![stored], include_state).await?;
        found
            .pop()
            .ok_or_else(|| EntityManagerError::NotFound(id.to_string()))
    }

    /// 🔎 Pages through the entities every definition has produced, across all latest indices.
    pub async fn find_entities(&self, options: FindEntitiesOptions) -> Result<FindEntitiesResult> {
        let mut sort = vec![SortField::new(options.sort_field, options.sort_direction)];
        // 🪢 Tiebreaker, so a cursor never skips or repeats entities that share a timestamp.
        if sort[0].field != ENTITY_ID_FIELD {
            sort.push(SortField::new(ENTITY_ID_FIELD, SortOrder::Asc));
        }
        let request = SearchRequest {
            query: options.query,
            size: options.per_page.max(1),
            sort,
            search_after: options.search_after,
        };
        let found = self
            .cluster
            .search(&ids::latest_index_pattern(), &request)
            .await?;
        let search_after = if found.hits.len() == request.size {
            found.hits.last().map(|hit| hit.sort.clone())
        } else {
            None
        };
        debug!(
            "🔎 Found {} of {} entities (more={})",
            found.hits.len(),
            found.total,
            search_after.is_some()
        );
        Ok(FindEntitiesResult {
            entities: found.hits.into_iter().map(|hit| hit.source).collect(),
            total: found.total,
            search_after,
        })
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let stored = self.lookup(id).await?;
        self.transforms.start(&stored.definition).await
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        let stored = self.lookup(id).await?;
        self.transforms.stop(&stored.definition).await
    }

    /// ▶️ Best effort restart of transforms an aborted update had stopped.
    async fn resume(&self, id: &str, transforms: &[String]) {
        if let Err(err) = self.transforms.start_transforms(id, transforms).await {
            warn!("⚠️ Could not restart transforms of entity definition [{id}]: {err}");
        }
    }

    async fn lookup(&self, id: &str) -> Result<StoredDefinition> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| EntityManagerError::NotFound(id.to_string()))
    }

    /// 🚦 Reads the definition and refuses if another writer holds a live in-progress marker.
    async fn claimable(&self, id: &str) -> Result<StoredDefinition> {
        let stored = self.lookup(id).await?;
        if stored
            .definition
            .installation_in_progress(Utc::now(), self.config.install_timeout())
        {
            warn!(
                "🚧 Entity definition [{id}] is busy ({:?} since {:?})",
                stored.definition.install_status, stored.definition.install_started_at
            );
            return Err(EntityManagerError::UpdateConflict(id.to_string()));
        }
        Ok(stored)
    }

    async fn with_state(
        &self,
        stored: Vec<StoredDefinition>,
        include_state: bool,
    ) -> Result<Vec<EntityDefinitionWithState>> {
        if !include_state {
            return Ok(stored
                .into_iter()
                .map(|stored| EntityDefinitionWithState {
                    definition: stored.definition,
                    state: None,
                    stats: None,
                })
                .collect());
        }
        try_join_all(stored.into_iter().map(|stored| async move {
            let (state, stats) = futures::try_join!(
                self.reconciler.get_state(&stored.definition),
                self.reconciler.get_stats(&stored.definition),
            )?;
            Ok::<_, EntityManagerError>(EntityDefinitionWithState {
                definition: stored.definition,
                state: Some(state),
                stats: Some(stats),
            })
        }))
        .await
    }
}
