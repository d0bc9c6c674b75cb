//! 📦 **Common Backend Config**: the connection details both Elasticsearch
//! backends share. The cluster client and the document store talk to the same
//! cluster with the same credentials, so they read the same struct.
//!
//! 🔒 Auth is tri-modal: api_key, username+password, or anonymous.
//! API key wins when both are set. This is not a democracy. 🦆

use serde::Deserialize;

/// 📡 Where the cluster lives and how to get in.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ElasticsearchConfig {
    /// 📡 Scheme + host + port. `localhost` alone worked in dev. It will not work here.
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// ⏳ Per-request ceiling. Transform stops wait for completion, so be generous.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_url() -> String {
    "http://localhost:9200".to_string()
}

// 🔧 10s to handshake. If ES can't say hello in 10 seconds it's not having a good day.
fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: None,
            password: None,
            api_key: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ElasticsearchConfig {
    /// 📡 `url` + `path`, with exactly one slash between them.
    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
