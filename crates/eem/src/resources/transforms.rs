//! 🔄 Transform bodies: the history pivot (raw events → per-interval entity docs)
//! and the latest pivot (history docs → one doc per entity).

use serde_json::{Map, Value, json};

use crate::common::{Aggregation, EntityDefinition, KeyMetric, MetricSource};
use crate::resources::ids;

pub const DEFAULT_HISTORY_FREQUENCY: &str = "1m";
pub const DEFAULT_HISTORY_SYNC_DELAY: &str = "60s";
pub const DEFAULT_LATEST_FREQUENCY: &str = "30s";
pub const DEFAULT_LATEST_SYNC_DELAY: &str = "1s";

fn transform_meta(definition: &EntityDefinition) -> Value {
    json!({
        "definitionId": definition.id,
        "definitionVersion": definition.revision,
        "managed": definition.managed,
    })
}

fn query_or_match_all(filter: Option<&str>) -> Value {
    match filter {
        Some(query) => json!({ "query_string": { "query": query } }),
        None => json!({ "match_all": {} }),
    }
}

/// 🔤 Rewrites `A / B` into `params.A / params.B` for the given input names.
///
/// Identifier-ish runs (`[A-Za-z0-9_.]`) are matched whole, so `AB` is never
/// mistaken for `A` followed by `B`.
pub fn painless_equation(equation: &str, inputs: &[&str]) -> String {
    let mut out = String::with_capacity(equation.len() + inputs.len() * 7);
    let mut token = String::new();
    let flush = |token: &mut String, out: &mut String| {
        if inputs.contains(&token.as_str()) {
            out.push_str("params.");
        }
        out.push_str(token);
        token.clear();
    };
    for c in equation.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            token.push(c);
        } else {
            flush(&mut token, &mut out);
            out.push(c);
        }
    }
    flush(&mut token, &mut out);
    out
}

fn source_agg_name(metric: &KeyMetric, source: &MetricSource) -> String {
    format!("_{}_{}", metric.name, source.name)
}

/// 🧮 The filter-wrapped sub-aggregation feeding one equation input.
fn source_aggregation(source: &MetricSource, timestamp_field: &str) -> Value {
    let filter = query_or_match_all(source.filter.as_deref());
    let (Some(agg), Some(field)) = (source.aggregation.es_name(), source.field.as_deref()) else {
        return json!({ "filter": filter });
    };
    let inner = match source.aggregation {
        Aggregation::LastValue => json!({
            "top_metrics": { "metrics": { "field": field }, "sort": { timestamp_field: "desc" } }
        }),
        _ => json!({ agg: { "field": field } }),
    };
    json!({ "filter": filter, "aggs": { "value": inner } })
}

/// 🧭 bucket_script path to the number a sub-aggregation produced.
fn buckets_path(metric: &KeyMetric, source: &MetricSource) -> String {
    let agg = source_agg_name(metric, source);
    match (source.aggregation, source.field.as_deref()) {
        (Aggregation::DocCount, _) | (_, None) => format!("{agg}>_count"),
        (Aggregation::StdDeviation, _) => format!("{agg}>value[std_deviation]"),
        (Aggregation::LastValue, Some(field)) => format!("{agg}>value[{field}]"),
        _ => format!("{agg}>value"),
    }
}

fn history_metric_aggregations(definition: &EntityDefinition, aggs: &mut Map<String, Value>) {
    for metric in &definition.metrics {
        let mut paths = Map::new();
        for source in &metric.metrics {
            aggs.insert(
                source_agg_name(metric, source),
                source_aggregation(source, &definition.history.timestamp_field),
            );
            paths.insert(source.name.clone(), json!(buckets_path(metric, source)));
        }
        let inputs: Vec<&str> = metric.metrics.iter().map(|s| s.name.as_str()).collect();
        aggs.insert(
            format!("entity.metrics.{}", metric.name),
            json!({
                "bucket_script": {
                    "buckets_path": paths,
                    "script": {
                        "source": painless_equation(&metric.equation, &inputs),
                        "lang": "painless"
                    }
                }
            }),
        );
    }
}

fn metadata_aggregations(
    definition: &EntityDefinition,
    aggs: &mut Map<String, Value>,
    from_history: bool,
) {
    for metadata in &definition.metadata {
        let destination = format!("entity.metadata.{}", metadata.destination());
        let field = if from_history {
            destination.clone()
        } else {
            metadata.source.clone()
        };
        aggs.insert(
            destination,
            json!({ "terms": { "field": field, "size": metadata.limit() } }),
        );
    }
}

/// 📜 Raw events → one doc per entity per `interval`.
pub fn history_transform(definition: &EntityDefinition) -> Value {
    let history = &definition.history;
    let timestamp_field = history.timestamp_field.as_str();

    let mut filter: Vec<Value> = definition
        .identity_fields
        .iter()
        .filter(|identity| !identity.optional)
        .map(|identity| json!({ "exists": { "field": identity.field } }))
        .collect();
    if let Some(query) = &definition.filter {
        filter.push(json!({ "query_string": { "query": query } }));
    }

    let mut group_by = Map::new();
    group_by.insert(
        "@timestamp".to_string(),
        json!({ "date_histogram": { "field": timestamp_field, "fixed_interval": history.interval } }),
    );
    for identity in &definition.identity_fields {
        group_by.insert(
            identity.field.clone(),
            json!({ "terms": { "field": identity.field, "missing_bucket": identity.optional } }),
        );
    }

    let mut aggs = Map::new();
    history_metric_aggregations(definition, &mut aggs);
    metadata_aggregations(definition, &mut aggs, false);
    aggs.insert(
        "entity.lastSeenTimestamp".to_string(),
        json!({ "max": { "field": timestamp_field } }),
    );

    json!({
        "description": format!("History transform for entity definition [{}]", definition.id),
        "_meta": transform_meta(definition),
        "source": {
            "index": definition.index_patterns,
            "query": { "bool": { "filter": filter } }
        },
        "dest": {
            "index": format!("{}.noop", ids::history_index_prefix(definition)),
            "pipeline": ids::history_pipeline_id(definition)
        },
        "frequency": history
            .settings
            .frequency
            .as_deref()
            .unwrap_or(DEFAULT_HISTORY_FREQUENCY),
        "sync": {
            "time": {
                "field": history.settings.sync_field.as_deref().unwrap_or(timestamp_field),
                "delay": history.settings.sync_delay.as_deref().unwrap_or(DEFAULT_HISTORY_SYNC_DELAY)
            }
        },
        "settings": { "deduce_mappings": false, "unattended": true },
        "pivot": { "group_by": group_by, "aggs": aggs }
    })
}

/// 🏁 History docs → exactly one doc per entity with its most recent values.
pub fn latest_transform(definition: &EntityDefinition) -> Value {
    let settings = &definition.latest.settings;

    let mut group_by = Map::new();
    group_by.insert(
        "entity.id".to_string(),
        json!({ "terms": { "field": "entity.id" } }),
    );
    group_by.insert(
        "entity.displayName".to_string(),
        json!({ "terms": { "field": "entity.displayName.keyword" } }),
    );
    for identity in &definition.identity_fields {
        group_by.insert(
            identity.field.clone(),
            json!({ "terms": { "field": identity.field, "missing_bucket": identity.optional } }),
        );
    }

    let mut aggs = Map::new();
    for metric in &definition.metrics {
        let field = format!("entity.metrics.{}", metric.name);
        aggs.insert(
            field.clone(),
            json!({
                "top_metrics": { "metrics": [{ "field": field }], "sort": { "@timestamp": "desc" } }
            }),
        );
    }
    metadata_aggregations(definition, &mut aggs, true);
    aggs.insert(
        "entity.lastSeenTimestamp".to_string(),
        json!({ "max": { "field": "entity.lastSeenTimestamp" } }),
    );
    aggs.insert(
        "entity.firstSeenTimestamp".to_string(),
        json!({ "min": { "field": "@timestamp" } }),
    );

    json!({
        "description": format!("Latest transform for entity definition [{}]", definition.id),
        "_meta": transform_meta(definition),
        "source": { "index": [ids::history_index_pattern(definition)] },
        "dest": {
            "index": ids::latest_noop_index(),
            "pipeline": ids::latest_pipeline_id(definition)
        },
        "frequency": settings.frequency.as_deref().unwrap_or(DEFAULT_LATEST_FREQUENCY),
        "sync": {
            "time": {
                "field": "event.ingested",
                "delay": settings.sync_delay.as_deref().unwrap_or(DEFAULT_LATEST_SYNC_DELAY)
            }
        },
        "settings": { "deduce_mappings": false, "unattended": true },
        "pivot": { "group_by": group_by, "aggs": aggs }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::fixtures::service_definition;
    use crate::common::HistoryTuning;

    #[test]
    fn the_one_where_letters_become_params_but_words_stay_words() {
        assert_eq!(painless_equation("A / B", &["A", "B"]), "params.A / params.B");
        assert_eq!(
            painless_equation("(A + AB) * 100", &["A", "B"]),
            "(params.A + AB) * 100"
        );
        assert_eq!(painless_equation("Math.max(A,1)", &["A"]), "Math.max(params.A,1)");
    }

    #[test]
    fn the_one_where_the_history_pivot_groups_by_time_and_identity() {
        let transform = history_transform(&service_definition("svc"));
        let group_by = &transform["pivot"]["group_by"];

        assert_eq!(group_by["@timestamp"]["date_histogram"]["fixed_interval"], "1m");
        assert_eq!(group_by["service.name"]["terms"]["missing_bucket"], false);
        assert_eq!(group_by["service.environment"]["terms"]["missing_bucket"], true);
        assert_eq!(
            transform["source"]["query"]["bool"]["filter"],
            json!([{ "exists": { "field": "service.name" } }])
        );
        assert_eq!(transform["dest"]["pipeline"], "svc-history@entities-v1-r1");
        assert_eq!(transform["frequency"], DEFAULT_HISTORY_FREQUENCY);
        assert_eq!(transform["sync"]["time"]["field"], "@timestamp");
        assert_eq!(transform["sync"]["time"]["delay"], DEFAULT_HISTORY_SYNC_DELAY);
    }

    #[test]
    fn the_one_where_key_metrics_become_bucket_scripts() {
        let transform = history_transform(&service_definition("svc"));
        let aggs = &transform["pivot"]["aggs"];

        assert_eq!(
            aggs["_errorRate_A"]["filter"],
            json!({ "query_string": { "query": "log.level: \"error\"" } })
        );
        assert_eq!(aggs["_errorRate_B"]["filter"], json!({ "match_all": {} }));
        let script = &aggs["entity.metrics.errorRate"]["bucket_script"];
        assert_eq!(script["buckets_path"]["A"], "_errorRate_A>_count");
        assert_eq!(script["script"]["source"], "params.A / params.B");
        assert_eq!(aggs["entity.metadata.agent"]["terms"]["field"], "agent.name");
        assert_eq!(aggs["entity.metadata.agent"]["terms"]["size"], 10);
        assert_eq!(aggs["entity.metadata.host.name"]["terms"]["size"], 1000);
    }

    #[test]
    fn the_one_where_field_aggregations_nest_under_value() {
        let mut definition = service_definition("svc");
        definition.metrics[0].metrics[0].aggregation = Aggregation::Avg;
        definition.metrics[0].metrics[0].field = Some("transaction.duration.us".to_string());
        definition.history.settings = HistoryTuning {
            frequency: Some("5m".to_string()),
            sync_field: Some("event.ingested".to_string()),
            sync_delay: None,
        };
        let transform = history_transform(&definition);
        let aggs = &transform["pivot"]["aggs"];

        assert_eq!(
            aggs["_errorRate_A"]["aggs"]["value"]["avg"]["field"],
            "transaction.duration.us"
        );
        assert_eq!(
            aggs["entity.metrics.errorRate"]["bucket_script"]["buckets_path"]["A"],
            "_errorRate_A>value"
        );
        assert_eq!(transform["frequency"], "5m");
        assert_eq!(transform["sync"]["time"]["field"], "event.ingested");
    }

    #[test]
    fn the_one_where_latest_reads_history_and_keeps_first_and_last_seen() {
        let transform = latest_transform(&service_definition("svc"));
        assert_eq!(transform["source"]["index"], json!([".entities.v1.history.svc.*"]));
        assert_eq!(transform["dest"]["index"], ".entities.v1.latest.noop");
        assert_eq!(transform["dest"]["pipeline"], "svc-latest@entities-v1-r1");
        assert_eq!(transform["frequency"], DEFAULT_LATEST_FREQUENCY);

        let aggs = &transform["pivot"]["aggs"];
        assert_eq!(aggs["entity.firstSeenTimestamp"]["min"]["field"], "@timestamp");
        assert_eq!(
            aggs["entity.metrics.errorRate"]["top_metrics"]["metrics"][0]["field"],
            "entity.metrics.errorRate"
        );
        assert_eq!(
            aggs["entity.metadata.agent"]["terms"]["field"],
            "entity.metadata.agent"
        );
    }
}
