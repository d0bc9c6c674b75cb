//! 📦 Common data structures: the nouns of the entity manager.
//!
//! 🎬 COLD OPEN — INT. OBSERVABILITY TEAM STANDUP — 9:01 AM
//!
//! "What is a service?" asked the PM. Nobody answered. Somebody opened a
//! JSON file. It had `identityFields`. It had `indexPatterns`. It had a
//! `revision` that had been bumped eleven times since Tuesday.
//! That file is an [`EntityDefinition`], and this module is where it lives.
//!
//! 🧠 Knowledge graph:
//! - [`EntityDefinition`] is the stored document. Everything else derives from it.
//! - [`InstalledComponent`] is the receipt: which ES resources a definition owns.
//! - [`InstallStatus`] is the sentinel that says "hands off, I'm busy".
//! - [`EntityDefinitionUpdate`] is the patch applied by `update`.
//!
//! Field names serialize in camelCase so stored documents look the way the
//! Kibana-side consumers expect them to. 🦆

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 🏷️ Ids starting with this prefix belong to built-in definitions.
pub const BUILT_IN_ID_PREFIX: &str = "builtin_";

/// 🧬 Schema version baked into every generated resource name.
pub const ENTITY_SCHEMA_VERSION: &str = "v1";

/// 📦 Default `terms` size for metadata aggregations.
pub const DEFAULT_METADATA_LIMIT: usize = 1000;

const MAX_ID_LENGTH: usize = 255;

/// 📦 A stored specification of how to derive entities from raw events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 🏷️ The entity type, e.g. `service` or `host`.
    #[serde(rename = "type")]
    pub entity_type: String,
    pub index_patterns: Vec<String>,
    pub identity_fields: Vec<IdentityField>,
    /// 🎭 Mustache template rendered into `entity.displayName`, e.g. `{{service.name}}`.
    pub display_name_template: String,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
    #[serde(default)]
    pub metrics: Vec<KeyMetric>,
    /// 🔍 Optional query string applied to the history transform source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub history: HistorySettings,
    #[serde(default)]
    pub latest: LatestSettings,
    #[serde(default)]
    pub managed: bool,
    /// 🔢 Starts at 1, incremented by every successful `update`.
    #[serde(default = "default_revision")]
    pub revision: u64,
    #[serde(default)]
    pub installed_components: Vec<InstalledComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_status: Option<InstallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_started_at: Option<DateTime<Utc>>,
}

fn default_revision() -> u64 {
    1
}

/// 🎯 A field that contributes to an entity's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityField {
    pub field: String,
    /// Optional fields become `missing_bucket: true` terms groups.
    #[serde(default)]
    pub optional: bool,
}

/// 🏷️ A metadata field copied from source documents onto the entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl MetadataField {
    /// 📍 Where the value lands under `entity.metadata`. Defaults to the source field.
    pub fn destination(&self) -> &str {
        self.destination.as_deref().unwrap_or(&self.source)
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_METADATA_LIMIT)
    }
}

/// 📊 A named metric computed by an equation over lettered sub-aggregations.
///
/// `equation: "A / B"` with metrics `A` and `B` becomes a `bucket_script`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMetric {
    pub name: String,
    pub equation: String,
    pub metrics: Vec<MetricSource>,
}

/// 📊 One lettered input to a [`KeyMetric`] equation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSource {
    pub name: String,
    pub aggregation: Aggregation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Avg,
    Max,
    Min,
    Sum,
    Cardinality,
    LastValue,
    StdDeviation,
    DocCount,
}

impl Aggregation {
    /// 🔧 The Elasticsearch aggregation keyword, or `None` for pseudo-aggregations.
    pub fn es_name(self) -> Option<&'static str> {
        match self {
            Aggregation::Avg => Some("avg"),
            Aggregation::Max => Some("max"),
            Aggregation::Min => Some("min"),
            Aggregation::Sum => Some("sum"),
            Aggregation::Cardinality => Some("cardinality"),
            Aggregation::StdDeviation => Some("extended_stats"),
            Aggregation::LastValue => Some("top_metrics"),
            Aggregation::DocCount => None,
        }
    }

    pub fn requires_field(self) -> bool {
        !matches!(self, Aggregation::DocCount)
    }
}

/// ⏳ Knobs for the history transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySettings {
    pub timestamp_field: String,
    /// 📅 date_histogram bucket width, e.g. `1m`.
    pub interval: String,
    #[serde(default)]
    pub settings: HistoryTuning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTuning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_delay: Option<String>,
}

/// ⏳ Knobs for the latest transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestSettings {
    #[serde(default)]
    pub settings: LatestTuning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestTuning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_delay: Option<String>,
}

/// 🧾 A receipt for one Elasticsearch resource owned by a definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstalledComponent {
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
}

impl InstalledComponent {
    pub fn new(id: impl Into<String>, component_type: ComponentType) -> Self {
        Self {
            id: id.into(),
            component_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Transform,
    IngestPipeline,
    Template,
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ComponentType::Transform => "transform",
            ComponentType::IngestPipeline => "ingest_pipeline",
            ComponentType::Template => "template",
        };
        f.write_str(label)
    }
}

/// 🚦 The sentinel stored on the definition while writers are at work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Installing,
    Upgrading,
    Installed,
    Failed,
    Uninstalling,
}

impl InstallStatus {
    /// ⏳ Transient states block concurrent updates.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            InstallStatus::Installing | InstallStatus::Upgrading | InstallStatus::Uninstalling
        )
    }
}

impl std::fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            InstallStatus::Installing => "installing",
            InstallStatus::Upgrading => "upgrading",
            InstallStatus::Installed => "installed",
            InstallStatus::Failed => "failed",
            InstallStatus::Uninstalling => "uninstalling",
        };
        f.write_str(label)
    }
}

impl EntityDefinition {
    pub fn is_built_in(&self) -> bool {
        self.id.starts_with(BUILT_IN_ID_PREFIX)
    }

    /// 🔍 Ids of every installed component of the given type, in stored order.
    pub fn component_ids(&self, component_type: ComponentType) -> Vec<String> {
        self.installed_components
            .iter()
            .filter(|component| component.component_type == component_type)
            .map(|component| component.id.clone())
            .collect()
    }

    /// 🚦 True while an install/upgrade/uninstall holds the definition.
    ///
    /// A marker older than `timeout` is treated as abandoned: the writer that set it
    /// crashed or gave up, and nobody is coming back for it.
    pub fn installation_in_progress(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let Some(status) = self.install_status else {
            return false;
        };
        if !status.is_in_progress() {
            return false;
        }
        match self.install_started_at {
            Some(started_at) => match chrono::Duration::from_std(timeout) {
                Ok(timeout) => now.signed_duration_since(started_at) < timeout,
                Err(_) => true,
            },
            None => true,
        }
    }

    /// ✅ Structural checks run before anything touches the cluster.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() || self.id.len() > MAX_ID_LENGTH {
            return Err(format!(
                "id must be between 1 and {MAX_ID_LENGTH} characters, got {}",
                self.id.len()
            ));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(format!(
                "id [{}] may only contain lowercase letters, digits, '_' and '-'",
                self.id
            ));
        }
        if self.index_patterns.is_empty() {
            return Err(format!("[{}] needs at least one index pattern", self.id));
        }
        if self.identity_fields.is_empty() {
            return Err(format!("[{}] needs at least one identity field", self.id));
        }
        for key_metric in &self.metrics {
            if key_metric.metrics.is_empty() {
                return Err(format!(
                    "metric [{}] has no source aggregations",
                    key_metric.name
                ));
            }
            for source in &key_metric.metrics {
                if source.name.is_empty() || !source.name.chars().all(|c| c.is_ascii_uppercase()) {
                    return Err(format!(
                        "metric [{}] input [{}] must be named with uppercase letters",
                        key_metric.name, source.name
                    ));
                }
                if source.aggregation.requires_field() && source.field.is_none() {
                    return Err(format!(
                        "metric [{}] input [{}] needs a field for {:?}",
                        key_metric.name, source.name, source.aggregation
                    ));
                }
            }
        }
        Ok(())
    }
}

/// 🩹 A partial update. Every `Some` replaces the stored value wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDefinitionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_fields: Option<Vec<IdentityField>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<MetadataField>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<KeyMetric>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistorySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<LatestSettings>,
}

impl EntityDefinitionUpdate {
    /// 🩹 Produces the patched definition. Bookkeeping fields are left alone.
    pub fn apply(&self, definition: &EntityDefinition) -> EntityDefinition {
        let mut patched = definition.clone();
        if let Some(name) = &self.name {
            patched.name = name.clone();
        }
        if let Some(description) = &self.description {
            patched.description = Some(description.clone());
        }
        if let Some(index_patterns) = &self.index_patterns {
            patched.index_patterns = index_patterns.clone();
        }
        if let Some(identity_fields) = &self.identity_fields {
            patched.identity_fields = identity_fields.clone();
        }
        if let Some(template) = &self.display_name_template {
            patched.display_name_template = template.clone();
        }
        if let Some(metadata) = &self.metadata {
            patched.metadata = metadata.clone();
        }
        if let Some(metrics) = &self.metrics {
            patched.metrics = metrics.clone();
        }
        if let Some(filter) = &self.filter {
            patched.filter = Some(filter.clone());
        }
        if let Some(history) = &self.history {
            patched.history = history.clone();
        }
        if let Some(latest) = &self.latest {
            patched.latest = latest.clone();
        }
        patched
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// 🧪 A service definition with one of everything. The test suite's favourite child.
    pub(crate) fn service_definition(id: &str) -> EntityDefinition {
        EntityDefinition {
            id: id.to_string(),
            name: "Services from logs".to_string(),
            description: None,
            entity_type: "service".to_string(),
            index_patterns: vec!["logs-*".to_string(), "traces-*".to_string()],
            identity_fields: vec![
                IdentityField {
                    field: "service.name".to_string(),
                    optional: false,
                },
                IdentityField {
                    field: "service.environment".to_string(),
                    optional: true,
                },
            ],
            display_name_template: "{{service.name}}".to_string(),
            metadata: vec![
                MetadataField {
                    source: "host.name".to_string(),
                    destination: None,
                    limit: None,
                },
                MetadataField {
                    source: "agent.name".to_string(),
                    destination: Some("agent".to_string()),
                    limit: Some(10),
                },
            ],
            metrics: vec![KeyMetric {
                name: "errorRate".to_string(),
                equation: "A / B".to_string(),
                metrics: vec![
                    MetricSource {
                        name: "A".to_string(),
                        aggregation: Aggregation::DocCount,
                        field: None,
                        filter: Some("log.level: \"error\"".to_string()),
                    },
                    MetricSource {
                        name: "B".to_string(),
                        aggregation: Aggregation::DocCount,
                        field: None,
                        filter: None,
                    },
                ],
            }],
            filter: None,
            history: HistorySettings {
                timestamp_field: "@timestamp".to_string(),
                interval: "1m".to_string(),
                settings: HistoryTuning::default(),
            },
            latest: LatestSettings::default(),
            managed: false,
            revision: 1,
            installed_components: vec![],
            install_status: None,
            install_started_at: None,
        }
    }
}
