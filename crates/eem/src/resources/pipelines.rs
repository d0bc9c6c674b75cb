//! 🚰 Ingest pipelines: stamp entity bookkeeping on every transform output doc
//! and route it to the right index.

use serde_json::{Value, json};

use crate::common::{ENTITY_SCHEMA_VERSION, EntityDefinition};
use crate::resources::ids;

// 🔧 Transform pivots emit `terms` aggregations as `{value: doc_count}` maps.
// Entities want plain lists, so this flattens the map at `params.path` into its keys.
const FLATTEN_TERMS_SCRIPT: &str = "\
def parent = ctx; \
for (int i = 0; i < params.path.size() - 1; i++) { \
  if (!(parent instanceof Map) || !parent.containsKey(params.path[i])) { return; } \
  parent = parent[params.path[i]]; \
} \
def leaf = params.path[params.path.size() - 1]; \
if (parent instanceof Map && parent[leaf] instanceof Map) { \
  parent[leaf] = new ArrayList(parent[leaf].keySet()); \
}";

fn set(field: &str, value: Value) -> Value {
    json!({ "set": { "field": field, "value": value } })
}

/// 🧾 Processors both pipelines share: who made this doc, and when.
fn bookkeeping_processors(definition: &EntityDefinition) -> Vec<Value> {
    vec![
        set("event.ingested", json!("{{{_ingest.timestamp}}}")),
        set("entity.type", json!(definition.entity_type)),
        set("entity.definitionId", json!(definition.id)),
        set("entity.definitionVersion", json!(definition.revision)),
        set("entity.schemaVersion", json!(ENTITY_SCHEMA_VERSION)),
        set(
            "entity.identityFields",
            json!(
                definition
                    .identity_fields
                    .iter()
                    .map(|identity| identity.field.as_str())
                    .collect::<Vec<_>>()
            ),
        ),
    ]
}

fn metadata_flatteners(definition: &EntityDefinition) -> Vec<Value> {
    definition
        .metadata
        .iter()
        .map(|metadata| {
            let mut path = vec!["entity".to_string(), "metadata".to_string()];
            path.extend(metadata.destination().split('.').map(str::to_string));
            json!({
                "script": {
                    "lang": "painless",
                    "source": FLATTEN_TERMS_SCRIPT,
                    "params": { "path": path }
                }
            })
        })
        .collect()
}

fn pipeline_meta(definition: &EntityDefinition) -> Value {
    json!({
        "definitionVersion": definition.revision,
        "managed": definition.managed,
    })
}

/// 🚰 History docs get an `entity.id` fingerprint, a display name, and a monthly index.
pub fn history_pipeline(definition: &EntityDefinition) -> Value {
    let mut processors = bookkeeping_processors(definition);
    processors.push(json!({
        "fingerprint": {
            "fields": definition
                .identity_fields
                .iter()
                .map(|identity| identity.field.as_str())
                .collect::<Vec<_>>(),
            "target_field": "entity.id",
            "method": "MurmurHash3",
            "ignore_missing": true
        }
    }));
    processors.push(set(
        "entity.displayName",
        json!(definition.display_name_template),
    ));
    processors.extend(metadata_flatteners(definition));
    processors.push(json!({
        "date_index_name": {
            "field": "@timestamp",
            "index_name_prefix": format!("{}.", ids::history_index_prefix(definition)),
            "date_rounding": "M",
            "date_formats": ["UNIX_MS", "ISO8601", "yyyy-MM-dd'T'HH:mm:ss.SSSXX"]
        }
    }));
    json!({
        "description": format!(
            "Ingest pipeline for entity definition history [{}] revision {}",
            definition.id, definition.revision
        ),
        "processors": processors,
        "_meta": pipeline_meta(definition),
    })
}

/// 🚰 Latest docs keep the id they were grouped by and land in one index per definition.
pub fn latest_pipeline(definition: &EntityDefinition) -> Value {
    let mut processors = bookkeeping_processors(definition);
    processors.extend(metadata_flatteners(definition));
    processors.push(set("_index", json!(ids::latest_index_name(definition))));
    json!({
        "description": format!(
            "Ingest pipeline for entity definition latest [{}] revision {}",
            definition.id, definition.revision
        ),
        "processors": processors,
        "_meta": pipeline_meta(definition),
    })
}
