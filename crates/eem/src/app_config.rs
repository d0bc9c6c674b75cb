//! 🔧 App Configuration: the sacred TOML-to-struct pipeline, entity edition.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." — every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment. Env vars (`EEM_*`, `__` between nesting levels) form
//! the base layer, an optional TOML file goes on top.
//!
//! ```toml
//! [elasticsearch]
//! url = "https://localhost:9200"
//! api_key = "..."
//!
//! [store.Elasticsearch]
//! index = ".kibana-entities-definitions"
//!
//! [manager]
//! install_timeout_secs = 300
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::elasticsearch_store::DEFAULT_DEFINITIONS_INDEX;
use crate::backends::{
    ClusterBackend, ElasticsearchCluster, ElasticsearchConfig, ElasticsearchStore, InMemoryStore,
    StoreBackend,
};
use crate::entity_client::EntityClient;

/// 📦 One struct to rule them all, one struct to find them, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
}

/// 🗄️ Where definition documents live.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// 🧠 Process memory. Gone on exit. Great for demos, terrible for Mondays.
    InMemory,
    Elasticsearch {
        #[serde(default = "default_definitions_index")]
        index: String,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Elasticsearch {
            index: default_definitions_index(),
        }
    }
}

fn default_definitions_index() -> String {
    DEFAULT_DEFINITIONS_INDEX.to_string()
}

/// 🎛️ Knobs for the entity client itself.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// ⏳ An in-progress marker older than this is considered abandoned.
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_per_page")]
    pub default_per_page: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            install_timeout_secs: default_install_timeout_secs(),
            default_per_page: default_per_page(),
        }
    }
}

impl ManagerConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

fn default_install_timeout_secs() -> u64 {
    300
}

fn default_per_page() -> usize {
    10
}

/// 🚀 Load the config: env vars always, plus the TOML file when one is given. TOML wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("EEM_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (EEM_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (EEM_*). \
                 No file was provided, this one's all on the environment. Classic."
            .to_string(),
    };
    config.extract().context(context_msg)
}

/// 🏗️ Wires the configured backends into a ready-to-use client.
pub async fn build_client(
    config: &AppConfig,
) -> anyhow::Result<EntityClient<ClusterBackend, StoreBackend>> {
    let cluster = ElasticsearchCluster::new(config.elasticsearch.clone())
        .await
        .context("💀 Could not reach the Elasticsearch cluster")?;
    let store = match &config.store {
        StoreConfig::InMemory => StoreBackend::InMemory(InMemoryStore::new()),
        StoreConfig::Elasticsearch { index } => StoreBackend::Elasticsearch(
            ElasticsearchStore::new(config.elasticsearch.clone(), index.clone())
                .await
                .with_context(|| format!("💀 Could not prepare definition index [{index}]"))?,
        ),
    };
    Ok(EntityClient::new(
        ClusterBackend::Elasticsearch(cluster),
        store,
        config.manager.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("💀 Failed to create temp config. The filesystem said 'new phone who dis'.");
        file.write_all(contents.as_bytes())
            .expect("💀 Failed to write test config.");
        file
    }

    #[test]
    fn the_one_where_every_section_shows_up_dressed() {
        let file = write_test_config(
            r#"
            [elasticsearch]
            url = "https://es.internal:9243"
            api_key = "c2VjcmV0"

            [store.Elasticsearch]
            index = ".my-definitions"

            [manager]
            install_timeout_secs = 60
            default_per_page = 25
            "#,
        );

        let config = load_config(Some(file.path())).expect("config should parse");
        assert_eq!(config.elasticsearch.url, "https://es.internal:9243");
        assert_eq!(config.elasticsearch.api_key.as_deref(), Some("c2VjcmV0"));
        assert_eq!(
            config.store,
            StoreConfig::Elasticsearch {
                index: ".my-definitions".to_string()
            }
        );
        assert_eq!(config.manager.install_timeout(), Duration::from_secs(60));
        assert_eq!(config.manager.default_per_page, 25);
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() {
        let file = write_test_config("");
        let config: AppConfig = Figment::new()
            .merge(Toml::file(file.path()))
            .extract()
            .expect("empty config should parse");

        assert_eq!(config.elasticsearch.url, "http://localhost:9200");
        assert_eq!(
            config.store,
            StoreConfig::Elasticsearch {
                index: ".kibana-entities-definitions".to_string()
            }
        );
        assert_eq!(config.manager, ManagerConfig::default());
        assert_eq!(config.manager.install_timeout_secs, 300);
    }

    #[test]
    fn the_one_where_the_store_forgets_everything_on_purpose() {
        let file = write_test_config(
            r#"
            store = "InMemory"
            "#,
        );
        let config: AppConfig = Figment::new()
            .merge(Toml::file(file.path()))
            .extract()
            .expect("unit variant should parse");
        assert_eq!(config.store, StoreConfig::InMemory);
    }
}
