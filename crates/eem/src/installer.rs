//! 🏗️ Installer: puts a definition's resources into the cluster, and takes them back out.
//!
//! 🎬 COLD OPEN: a definition document, freshly minted, status `installing`,
//! six component ids listed and not one of them real yet. The installer has
//! one job. Several, actually. It doesn't like to talk about it.
//!
//! 🧠 Knowledge graph:
//! - The stored document is written FIRST, with the planned components and an
//!   in-progress status. If we crash halfway, the leftovers are discoverable.
//! - Pipelines and templates go in together, then transforms (a transform
//!   referencing a pipeline that doesn't exist yet is a transform with regrets).
//! - Failure writes status `failed` and walks away. No rollback.
//! - Every write that claims an existing document is version-checked. Lose the
//!   race, get an `UpdateConflict`, touch nothing.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::backends::{Cluster, DefinitionStore, StoredDefinition};
use crate::common::{
    ComponentType, EntityDefinition, EntityDefinitionUpdate, InstallStatus, InstalledComponent,
};
use crate::errors::{ClusterError, EntityManagerError, Result};
use crate::resources::{ResourcePlan, ids};

/// 🔁 What a reinstall leaves behind: the new definition plus the receipts of the revision it replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct Reinstalled {
    pub definition: EntityDefinition,
    pub previous_components: Vec<InstalledComponent>,
}

/// 🎟️ An upgrade we hold the in-progress marker for, not yet installed.
///
/// Nothing in the cluster has been touched when one of these exists. Hand it to
/// [`Installer::complete_upgrade`] to go ahead, or [`Installer::release`] to back out.
#[derive(Debug, Clone)]
pub struct UpgradeClaim {
    previous: EntityDefinition,
    claimed: StoredDefinition,
    plan: ResourcePlan,
}

impl UpgradeClaim {
    /// The revision being installed, as stored under the marker.
    pub fn definition(&self) -> &EntityDefinition {
        &self.claimed.definition
    }

    /// The revision being replaced.
    pub fn previous(&self) -> &EntityDefinition {
        &self.previous
    }
}

#[derive(Debug)]
pub struct Installer<C, S> {
    cluster: Arc<C>,
    store: Arc<S>,
}

impl<C, S> Clone for Installer<C, S> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
            store: Arc::clone(&self.store),
        }
    }
}

/// 🧹 Deleting something that isn't there is a delete that already happened.
fn tolerate_missing(result: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

/// ⏳ Waits for everything, then reports the first failure. Nobody gets cancelled mid-request.
fn first_failure(results: Vec<Result<(), ClusterError>>) -> Result<(), ClusterError> {
    results.into_iter().collect::<Result<Vec<()>, _>>().map(|_| ())
}

fn marked(definition: &EntityDefinition, status: InstallStatus) -> EntityDefinition {
    let mut marked = definition.clone();
    marked.install_status = Some(status);
    marked.install_started_at = if status.is_in_progress() {
        Some(Utc::now())
    } else {
        None
    };
    marked
}

impl<C: Cluster, S: DefinitionStore> Installer<C, S> {
    pub fn new(cluster: Arc<C>, store: Arc<S>) -> Self {
        Self { cluster, store }
    }

    /// 🚀 Stores the definition and creates every resource it needs. Transforms are left stopped.
    pub async fn install(&self, definition: &EntityDefinition) -> Result<EntityDefinition> {
        definition
            .validate()
            .map_err(EntityManagerError::InvalidDefinition)?;

        let plan = ResourcePlan::for_definition(definition);
        let mut pending = marked(definition, InstallStatus::Installing);
        pending.installed_components = plan.components();

        let stored = self.store.create(&pending).await?;
        info!(
            "🏗️ Installing entity definition [{}] revision {} ({} components)",
            definition.id,
            definition.revision,
            pending.installed_components.len()
        );
        self.finish_install(stored, &plan).await
    }

    /// 🔁 Claims the stored definition, applies `update`, and installs the next revision.
    ///
    /// The previous revision's resources stay in the cluster; the caller decides
    /// when they can go (typically after the new transforms are up).
    pub async fn reinstall(
        &self,
        stored: StoredDefinition,
        update: &EntityDefinitionUpdate,
    ) -> Result<Reinstalled> {
        let claim = self.claim_upgrade(stored, update).await?;
        self.complete_upgrade(claim).await
    }

    /// 🏁 Validates the next revision and writes it under an `upgrading` marker.
    /// The cluster is not touched. Invalid updates and lost races fail here.
    pub async fn claim_upgrade(
        &self,
        stored: StoredDefinition,
        update: &EntityDefinitionUpdate,
    ) -> Result<UpgradeClaim> {
        let current = &stored.definition;
        let mut next = update.apply(current);
        next.revision = current.revision + 1;
        next.validate()
            .map_err(EntityManagerError::InvalidDefinition)?;

        let plan = ResourcePlan::for_definition(&next);
        next.installed_components = plan.components();
        let next = marked(&next, InstallStatus::Upgrading);

        // 🏁 The claim. If anyone wrote since we read, this is where we find out.
        let claimed = self.store.update(&next, stored.version).await?;
        info!(
            "🔁 Upgrading entity definition [{}] from revision {} to {}",
            current.id, current.revision, next.revision
        );
        Ok(UpgradeClaim {
            previous: stored.definition,
            claimed,
            plan,
        })
    }

    /// 🏗️ Installs the claimed revision. On failure the document is left `failed`.
    pub async fn complete_upgrade(&self, claim: UpgradeClaim) -> Result<Reinstalled> {
        let UpgradeClaim {
            previous,
            claimed,
            plan,
        } = claim;
        let keep: HashSet<&InstalledComponent> =
            claimed.definition.installed_components.iter().collect();
        let previous_components = previous
            .installed_components
            .iter()
            .filter(|component| !keep.contains(component))
            .cloned()
            .collect();

        let definition = self.finish_install(claimed, &plan).await?;
        Ok(Reinstalled {
            definition,
            previous_components,
        })
    }

    /// ↩️ Backs out of a claim: the previous revision goes back into the store as it was.
    /// Best effort; if the write fails the stale marker times out on its own.
    pub async fn release(&self, claim: UpgradeClaim) {
        let UpgradeClaim {
            previous, claimed, ..
        } = claim;
        match self.store.update(&previous, claimed.version).await {
            Ok(_) => debug!(
                "↩️ Released upgrade claim on entity definition [{}]",
                previous.id
            ),
            Err(err) => warn!(
                "⚠️ Could not release upgrade claim on entity definition [{}]: {err}",
                previous.id
            ),
        }
    }

    /// 🗑️ Removes every component, optionally the entity data, then the stored document.
    pub async fn uninstall(&self, stored: StoredDefinition, delete_data: bool) -> Result<()> {
        let definition = &stored.definition;
        let claimed = self
            .store
            .update(
                &marked(definition, InstallStatus::Uninstalling),
                stored.version,
            )
            .await?;
        info!(
            "🗑️ Uninstalling entity definition [{}] (delete_data={delete_data})",
            definition.id
        );

        let removal = async {
            self.uninstall_components(&definition.installed_components)
                .await?;
            if delete_data {
                let indices = format!(
                    "{},{}",
                    ids::history_index_pattern(definition),
                    ids::latest_index_name(definition)
                );
                debug!("🧨 Deleting entity data [{indices}]");
                self.cluster.delete_indices(&indices).await?;
            }
            Ok::<_, ClusterError>(())
        };
        if let Err(err) = removal.await {
            error!(
                "💀 Uninstall of entity definition [{}] failed: {err}",
                definition.id
            );
            self.mark_failed(&claimed).await;
            return Err(EntityManagerError::install(&definition.id, err));
        }

        self.store.delete(&definition.id).await?;
        info!("✅ Entity definition [{}] uninstalled", definition.id);
        Ok(())
    }

    /// 🧹 Stops and deletes transforms, then deletes pipelines and templates. Missing pieces are fine.
    pub async fn uninstall_components(
        &self,
        components: &[InstalledComponent],
    ) -> Result<(), ClusterError> {
        let of_type = |kind: ComponentType| {
            components
                .iter()
                .filter(move |component| component.component_type == kind)
                .map(|component| component.id.as_str())
        };

        let transforms = join_all(of_type(ComponentType::Transform).map(|id| async move {
            tolerate_missing(self.cluster.stop_transform(id).await)?;
            tolerate_missing(self.cluster.delete_transform(id).await)
        }))
        .await;
        first_failure(transforms)?;

        let pipelines = of_type(ComponentType::IngestPipeline)
            .map(|id| async move { tolerate_missing(self.cluster.delete_ingest_pipeline(id).await) });
        let templates = of_type(ComponentType::Template)
            .map(|id| async move { tolerate_missing(self.cluster.delete_index_template(id).await) });
        let (pipelines, templates) = futures::join!(join_all(pipelines), join_all(templates));
        first_failure(pipelines)?;
        first_failure(templates)?;

        debug!("🧹 Removed {} components", components.len());
        Ok(())
    }

    async fn finish_install(
        &self,
        stored: StoredDefinition,
        plan: &ResourcePlan,
    ) -> Result<EntityDefinition> {
        let id = stored.definition.id.clone();
        if let Err(err) = self.install_resources(plan).await {
            error!("💀 Install of entity definition [{id}] failed: {err}");
            self.mark_failed(&stored).await;
            return Err(EntityManagerError::install(&id, err));
        }

        let installed = marked(&stored.definition, InstallStatus::Installed);
        self.store.update(&installed, stored.version).await?;
        info!(
            "✅ Entity definition [{id}] revision {} installed",
            installed.revision
        );
        Ok(installed)
    }

    async fn install_resources(&self, plan: &ResourcePlan) -> Result<(), ClusterError> {
        let pipelines = plan
            .pipelines
            .iter()
            .map(|(id, body)| self.cluster.put_ingest_pipeline(id, body));
        let templates = plan
            .templates
            .iter()
            .map(|(id, body)| self.cluster.put_index_template(id, body));
        let (pipelines, templates) = futures::join!(join_all(pipelines), join_all(templates));
        first_failure(pipelines)?;
        first_failure(templates)?;

        let transforms = plan
            .transforms
            .iter()
            .map(|(id, body)| self.cluster.put_transform(id, body));
        first_failure(join_all(transforms).await)
    }

    /// 🩹 Best effort: if even this write fails, the stale in-progress marker times out on its own.
    async fn mark_failed(&self, stored: &StoredDefinition) {
        let failed = marked(&stored.definition, InstallStatus::Failed);
        if let Err(err) = self.store.update(&failed, stored.version).await {
            warn!(
                "⚠️ Could not mark entity definition [{}] as failed: {err}",
                stored.definition.id
            );
        }
    }
}
