//! 🏗️ Resources: turning a definition into the Elasticsearch bodies that make it real.
//!
//! ```text
//!                 ┌───────────────────────┐
//!   raw events ──▶│ history transform     │──▶ history pipeline ──▶ .entities.v1.history.<id>.<yyyy-MM>
//!  (index_patterns)└───────────────────────┘
//!                 ┌───────────────────────┐
//!   history idx ─▶│ latest transform      │──▶ latest pipeline  ──▶ .entities.v1.latest.<id>
//!                 └───────────────────────┘
//!   + one index template per destination, so the mappings exist before the first doc lands
//! ```
//!
//! Every generator here is a pure function of the definition. Same definition,
//! same revision, same bodies, same ids. That's what lets the installer retry a
//! put without wondering what it's overwriting.
//!
//! 🧠 Knowledge graph:
//! - `ids`: deterministic names (definition id + revision)
//! - `pipelines`, `templates`, `transforms`: the bodies
//! - [`ResourcePlan`]: everything above bundled for the installer

use serde_json::Value;

use crate::common::{ComponentType, EntityDefinition, InstalledComponent};

pub mod ids;
pub mod pipelines;
pub mod templates;
pub mod transforms;

/// 📋 The full set of resources one definition revision needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePlan {
    pub pipelines: Vec<(String, Value)>,
    pub templates: Vec<(String, Value)>,
    pub transforms: Vec<(String, Value)>,
}

impl ResourcePlan {
    pub fn for_definition(definition: &EntityDefinition) -> Self {
        Self {
            pipelines: vec![
                (
                    ids::history_pipeline_id(definition),
                    pipelines::history_pipeline(definition),
                ),
                (
                    ids::latest_pipeline_id(definition),
                    pipelines::latest_pipeline(definition),
                ),
            ],
            templates: vec![
                (
                    ids::history_template_id(definition),
                    templates::history_template(definition),
                ),
                (
                    ids::latest_template_id(definition),
                    templates::latest_template(definition),
                ),
            ],
            transforms: vec![
                (
                    ids::history_transform_id(definition),
                    transforms::history_transform(definition),
                ),
                (
                    ids::latest_transform_id(definition),
                    transforms::latest_transform(definition),
                ),
            ],
        }
    }

    /// 🧾 The receipts to store on the definition, transforms first.
    pub fn components(&self) -> Vec<InstalledComponent> {
        let transforms = self
            .transforms
            .iter()
            .map(|(id, _)| InstalledComponent::new(id.clone(), ComponentType::Transform));
        let pipelines = self
            .pipelines
            .iter()
            .map(|(id, _)| InstalledComponent::new(id.clone(), ComponentType::IngestPipeline));
        let templates = self
            .templates
            .iter()
            .map(|(id, _)| InstalledComponent::new(id.clone(), ComponentType::Template));
        transforms.chain(pipelines).chain(templates).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::fixtures::service_definition;

    #[test]
    fn the_one_where_the_plan_lists_two_of_everything() {
        let plan = ResourcePlan::for_definition(&service_definition("svc"));
        let components = plan.components();
        assert_eq!(components.len(), 6);
        let count = |kind| {
            components
                .iter()
                .filter(|component| component.component_type == kind)
                .count()
        };
        assert_eq!(count(ComponentType::Transform), 2);
        assert_eq!(count(ComponentType::IngestPipeline), 2);
        assert_eq!(count(ComponentType::Template), 2);
        assert_eq!(components[0].id, "entities-v1-history-svc-r1");
    }

    #[test]
    fn the_one_where_a_revision_bump_renames_everything_but_the_data() {
        let first = service_definition("svc");
        let mut second = first.clone();
        second.revision = 2;

        let before = ResourcePlan::for_definition(&first).components();
        let after = ResourcePlan::for_definition(&second).components();
        assert!(before.iter().all(|component| !after.contains(component)));
        assert_eq!(
            ids::latest_index_name(&first),
            ids::latest_index_name(&second)
        );
    }
}
