//! 🏷️ Deterministic resource names.
//!
//! Resource ids carry the revision, index names do not: a new revision gets
//! fresh pipelines/templates/transforms but keeps writing into the same data.

use crate::common::{ENTITY_SCHEMA_VERSION as V, EntityDefinition};

pub fn history_transform_id(definition: &EntityDefinition) -> String {
    format!("entities-{V}-history-{}-r{}", definition.id, definition.revision)
}

pub fn latest_transform_id(definition: &EntityDefinition) -> String {
    format!("entities-{V}-latest-{}-r{}", definition.id, definition.revision)
}

pub fn history_pipeline_id(definition: &EntityDefinition) -> String {
    format!("{}-history@entities-{V}-r{}", definition.id, definition.revision)
}

pub fn latest_pipeline_id(definition: &EntityDefinition) -> String {
    format!("{}-latest@entities-{V}-r{}", definition.id, definition.revision)
}

pub fn history_template_id(definition: &EntityDefinition) -> String {
    format!(
        "entities_{V}_history_{}_r{}_index_template",
        definition.id, definition.revision
    )
}

pub fn latest_template_id(definition: &EntityDefinition) -> String {
    format!(
        "entities_{V}_latest_{}_r{}_index_template",
        definition.id, definition.revision
    )
}

/// 📅 Monthly history indices hang off this prefix.
pub fn history_index_prefix(definition: &EntityDefinition) -> String {
    format!(".entities.{V}.history.{}", definition.id)
}

pub fn history_index_pattern(definition: &EntityDefinition) -> String {
    format!("{}.*", history_index_prefix(definition))
}

pub fn latest_index_name(definition: &EntityDefinition) -> String {
    format!(".entities.{V}.latest.{}", definition.id)
}

/// 🌐 Every definition's latest index at once.
pub fn latest_index_pattern() -> String {
    format!(".entities.{V}.latest.*")
}

/// 🕳️ Placeholder destination; the pipeline rewrites `_index` before anything is written.
pub fn latest_noop_index() -> String {
    format!(".entities.{V}.latest.noop")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::fixtures::service_definition;

    #[test]
    fn the_one_where_names_are_boringly_predictable() {
        let mut definition = service_definition("svc");
        definition.revision = 3;
        assert_eq!(history_transform_id(&definition), "entities-v1-history-svc-r3");
        assert_eq!(latest_transform_id(&definition), "entities-v1-latest-svc-r3");
        assert_eq!(history_pipeline_id(&definition), "svc-history@entities-v1-r3");
        assert_eq!(latest_pipeline_id(&definition), "svc-latest@entities-v1-r3");
        assert_eq!(
            history_template_id(&definition),
            "entities_v1_history_svc_r3_index_template"
        );
        assert_eq!(history_index_pattern(&definition), ".entities.v1.history.svc.*");
        assert_eq!(latest_index_name(&definition), ".entities.v1.latest.svc");
        assert_eq!(latest_index_pattern(), ".entities.v1.latest.*");
    }
}
