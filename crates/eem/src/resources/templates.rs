//! 📐 Index templates for the history and latest destinations.

use serde_json::{Value, json};

use crate::common::{ENTITY_SCHEMA_VERSION, EntityDefinition};
use crate::resources::ids;

// 🎯 Above the built-in `logs-*-*`/`metrics-*-*` templates (100) so ours wins on overlap.
const TEMPLATE_PRIORITY: u32 = 200;

fn entity_mappings() -> Value {
    json!({
        "date_detection": false,
        "dynamic_templates": [{
            "strings_as_keyword": {
                "match_mapping_type": "string",
                "mapping": { "type": "keyword", "ignore_above": 1024 }
            }
        }],
        "properties": {
            "@timestamp": { "type": "date" },
            "event": { "properties": { "ingested": { "type": "date" } } },
            "entity": {
                "properties": {
                    "id": { "type": "keyword" },
                    "type": { "type": "keyword" },
                    "definitionId": { "type": "keyword" },
                    "definitionVersion": { "type": "long" },
                    "schemaVersion": { "type": "keyword" },
                    "identityFields": { "type": "keyword" },
                    "displayName": {
                        "type": "text",
                        "fields": { "keyword": { "type": "keyword", "ignore_above": 1024 } }
                    },
                    "lastSeenTimestamp": { "type": "date" },
                    "firstSeenTimestamp": { "type": "date" }
                }
            }
        }
    })
}

fn template(definition: &EntityDefinition, pattern: String, dataset: &str) -> Value {
    json!({
        "index_patterns": [pattern],
        "priority": TEMPLATE_PRIORITY,
        "template": {
            "settings": {
                "index": {
                    "codec": "best_compression",
                    "mapping": { "total_fields": { "limit": 2000 } }
                }
            },
            "mappings": entity_mappings()
        },
        "_meta": {
            "description": format!(
                "Index template for {dataset} indices of entity definition [{}]",
                definition.id
            ),
            "definitionVersion": definition.revision,
            "schemaVersion": ENTITY_SCHEMA_VERSION,
            "managed": true,
            "managed_by": "elastic_entity_model"
        }
    })
}

pub fn history_template(definition: &EntityDefinition) -> Value {
    template(definition, ids::history_index_pattern(definition), "history")
}

pub fn latest_template(definition: &EntityDefinition) -> Value {
    template(definition, ids::latest_index_name(definition), "latest")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::fixtures::service_definition;

    #[test]
    fn the_one_where_each_template_covers_exactly_its_own_indices() {
        let definition = service_definition("svc");
        let history = history_template(&definition);
        let latest = latest_template(&definition);

        assert_eq!(history["index_patterns"], json!([".entities.v1.history.svc.*"]));
        assert_eq!(latest["index_patterns"], json!([".entities.v1.latest.svc"]));
        assert_eq!(latest["priority"], 200);
        assert_eq!(
            latest["template"]["mappings"]["properties"]["entity"]["properties"]["displayName"]
                ["fields"]["keyword"]["type"],
            "keyword"
        );
    }
}
