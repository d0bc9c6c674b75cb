//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN — INT. SERVER ROOM — 3:47 AM
//!
//! The entities dashboard is empty. Not "no data" empty. "Transform stopped
//! three days ago and nobody noticed" empty. Our hero opens the definition.
//! `installed: true`. `running: false`. The reconciler was right all along.
//! Nobody listens to the reconciler.
//!
//! 🚀 This module is the HTTP muscle behind [`Cluster`]: ingest pipelines,
//! index templates, transforms, and the occasional index deletion, all spoken
//! over reqwest with the auth dance (API key beats basic auth, always).
//!
//! ⚠️ 404s on lookups become `None`. 404s on deletes become success. 409s on
//! transform start ("already started") and put ("already exists") become
//! success, since ids are revision-scoped and a second put carries the same body.
//! Everything else is a [`ClusterError`] with the response body attached.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, trace};

use crate::backends::{
    Cluster, ElasticsearchConfig, PipelineStats, SearchHit, SearchRequest, SearchResponse,
    TransformStats,
};
use crate::errors::ClusterError;

/// 📬 Status + raw body. We read the body eagerly because error bodies are
/// where Elasticsearch keeps its feelings.
#[derive(Debug)]
pub(crate) struct EsResponse {
    pub(crate) status: u16,
    pub(crate) body: String,
}

impl EsResponse {
    pub(crate) fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub(crate) fn into_error(self, operation: &str) -> ClusterError {
        ClusterError::from_response(operation, self.status, self.body)
    }

    pub(crate) fn json(&self, operation: &str) -> Result<Value, ClusterError> {
        serde_json::from_str(&self.body).map_err(|e| ClusterError::Decode {
            operation: operation.to_string(),
            detail: e.to_string(),
        })
    }

    /// ✅ 2xx passes, `tolerated` statuses pass, everything else becomes an error.
    pub(crate) fn ok_or_tolerate(self, operation: &str, tolerated: &[u16]) -> Result<(), ClusterError> {
        if self.is_success() || tolerated.contains(&self.status) {
            Ok(())
        } else {
            Err(self.into_error(operation))
        }
    }
}

/// 🔧 The shared HTTP plumbing: one reqwest client, one config, one auth policy.
/// Used by both the cluster client and the document store.
#[derive(Debug, Clone)]
pub(crate) struct EsHttp {
    client: reqwest::Client,
    config: ElasticsearchConfig,
}

impl EsHttp {
    pub(crate) fn new(config: ElasticsearchConfig) -> Result<Self, ClusterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|source| ClusterError::Transport {
                operation: "build http client".to_string(),
                source,
            })?;
        Ok(Self { client, config })
    }

    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        operation: &str,
    ) -> Result<EsResponse, ClusterError> {
        let url = self.config.endpoint(path);
        trace!("📡 {} {} ({})", method, url, operation);
        let mut request = self.client.request(method, &url);
        // 🔒 Auth priority: API key wins over basic auth. This is not a democracy.
        if let Some(api_key) = &self.config.api_key {
            request = request.header("Authorization", format!("ApiKey {api_key}"));
        } else if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body.to_string());
        }
        let transport = |source| ClusterError::Transport {
            operation: operation.to_string(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;
        Ok(EsResponse { status, body })
    }
}

/// 📡 [`Cluster`] over the Elasticsearch REST API.
#[derive(Debug, Clone)]
pub struct ElasticsearchCluster {
    http: EsHttp,
}

impl ElasticsearchCluster {
    /// 🚀 Builds the client and pings the cluster root, so a bad URL fails here
    /// and not halfway through installing a definition.
    pub async fn new(config: ElasticsearchConfig) -> Result<Self, ClusterError> {
        let http = EsHttp::new(config)?;
        let response = http.send(Method::GET, "/", None, "ping").await?;
        if !response.is_success() {
            return Err(response.into_error("ping"));
        }
        let hello = response.json("ping").unwrap_or(Value::Null);
        debug!(
            "✅ Connected to cluster [{}] running {}",
            hello["cluster_name"].as_str().unwrap_or("unknown"),
            hello["version"]["number"].as_str().unwrap_or("an undisclosed version")
        );
        Ok(Self { http })
    }
}

#[async_trait]
impl Cluster for ElasticsearchCluster {
    async fn put_ingest_pipeline(&self, id: &str, body: &Value) -> Result<(), ClusterError> {
        let operation = "ingest.putPipeline";
        self.http
            .send(Method::PUT, &format!("_ingest/pipeline/{id}"), Some(body), operation)
            .await?
            .ok_or_tolerate(operation, &[])
    }

    async fn get_ingest_pipelines(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Value>, ClusterError> {
        // ⚠️ No ids means no request: `GET _ingest/pipeline/` would return every pipeline in the cluster.
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let operation = "ingest.getPipeline";
        let response = self
            .http
            .send(Method::GET, &format!("_ingest/pipeline/{}", ids.join(",")), None, operation)
            .await?;
        if response.status == 404 {
            return Ok(HashMap::new());
        }
        if !response.is_success() {
            return Err(response.into_error(operation));
        }
        match response.json(operation)? {
            Value::Object(pipelines) => Ok(pipelines.into_iter().collect()),
            _ => Err(ClusterError::Decode {
                operation: operation.to_string(),
                detail: "expected an object keyed by pipeline id".to_string(),
            }),
        }
    }

    async fn ingest_pipeline_stats(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PipelineStats>, ClusterError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let operation = "nodes.stats";
        let filter_path = ids
            .iter()
            .map(|id| format!("nodes.*.ingest.pipelines.{id}"))
            .collect::<Vec<_>>()
            .join(",");
        let response = self
            .http
            .send(
                Method::GET,
                &format!("_nodes/stats/ingest?filter_path={filter_path}"),
                None,
                operation,
            )
            .await?;
        if !response.is_success() {
            return Err(response.into_error(operation));
        }
        let body = response.json(operation)?;
        // 🧮 Every node keeps its own counters. Sum them, or the dashboard lies by a factor of N.
        let mut totals: HashMap<String, PipelineStats> = HashMap::new();
        if let Some(nodes) = body.get("nodes").and_then(Value::as_object) {
            for node in nodes.values() {
                let Some(pipelines) = node
                    .pointer("/ingest/pipelines")
                    .and_then(Value::as_object)
                else {
                    continue;
                };
                for (id, counters) in pipelines {
                    let total = totals.entry(id.clone()).or_default();
                    total.count += counters["count"].as_u64().unwrap_or(0);
                    total.failed += counters["failed"].as_u64().unwrap_or(0);
                }
            }
        }
        Ok(totals)
    }

    async fn delete_ingest_pipeline(&self, id: &str) -> Result<(), ClusterError> {
        let operation = "ingest.deletePipeline";
        self.http
            .send(Method::DELETE, &format!("_ingest/pipeline/{id}"), None, operation)
            .await?
            .ok_or_tolerate(operation, &[404])
    }

    async fn put_index_template(&self, name: &str, body: &Value) -> Result<(), ClusterError> {
        let operation = "indices.putIndexTemplate";
        self.http
            .send(Method::PUT, &format!("_index_template/{name}"), Some(body), operation)
            .await?
            .ok_or_tolerate(operation, &[])
    }

    async fn get_index_template(&self, name: &str) -> Result<Option<Value>, ClusterError> {
        let operation = "indices.getIndexTemplate";
        let response = self
            .http
            .send(Method::GET, &format!("_index_template/{name}"), None, operation)
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(response.into_error(operation));
        }
        let body = response.json(operation)?;
        Ok(body
            .get("index_templates")
            .and_then(Value::as_array)
            .and_then(|templates| {
                templates
                    .iter()
                    .find(|template| template["name"].as_str() == Some(name))
            })
            .map(|template| template["index_template"].clone()))
    }

    async fn delete_index_template(&self, name: &str) -> Result<(), ClusterError> {
        let operation = "indices.deleteIndexTemplate";
        self.http
            .send(Method::DELETE, &format!("_index_template/{name}"), None, operation)
            .await?
            .ok_or_tolerate(operation, &[404])
    }

    async fn put_transform(&self, id: &str, body: &Value) -> Result<(), ClusterError> {
        let operation = "transform.putTransform";
        let response = self
            .http
            .send(
                Method::PUT,
                &format!("_transform/{id}?defer_validation=true"),
                Some(body),
                operation,
            )
            .await?;
        if response.status == 409 {
            debug!("🔁 Transform [{}] already exists, leaving it be", id);
        }
        response.ok_or_tolerate(operation, &[409])
    }

    async fn get_transform(&self, id: &str) -> Result<Option<Value>, ClusterError> {
        let operation = "transform.getTransform";
        let response = self
            .http
            .send(Method::GET, &format!("_transform/{id}"), None, operation)
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(response.into_error(operation));
        }
        let body = response.json(operation)?;
        Ok(body
            .get("transforms")
            .and_then(Value::as_array)
            .and_then(|transforms| transforms.iter().find(|t| t["id"].as_str() == Some(id)))
            .cloned())
    }

    async fn get_transform_stats(&self, id: &str) -> Result<Option<TransformStats>, ClusterError> {
        let operation = "transform.getTransformStats";
        let response = self
            .http
            .send(Method::GET, &format!("_transform/{id}/_stats"), None, operation)
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(response.into_error(operation));
        }
        let body = response.json(operation)?;
        let Some(entry) = body
            .get("transforms")
            .and_then(Value::as_array)
            .and_then(|transforms| transforms.iter().find(|t| t["id"].as_str() == Some(id)))
        else {
            return Ok(None);
        };
        serde_json::from_value(entry.clone())
            .map(Some)
            .map_err(|e| ClusterError::Decode {
                operation: operation.to_string(),
                detail: e.to_string(),
            })
    }

    async fn start_transform(&self, id: &str) -> Result<(), ClusterError> {
        let operation = "transform.startTransform";
        let response = self
            .http
            .send(Method::POST, &format!("_transform/{id}/_start"), None, operation)
            .await?;
        if response.status == 409 {
            debug!("🔁 Transform [{}] was already started", id);
        }
        response.ok_or_tolerate(operation, &[409])
    }

    async fn stop_transform(&self, id: &str) -> Result<(), ClusterError> {
        let operation = "transform.stopTransform";
        self.http
            .send(
                Method::POST,
                &format!("_transform/{id}/_stop?wait_for_completion=true&force=true"),
                None,
                operation,
            )
            .await?
            .ok_or_tolerate(operation, &[])
    }

    async fn delete_transform(&self, id: &str) -> Result<(), ClusterError> {
        let operation = "transform.deleteTransform";
        self.http
            .send(Method::DELETE, &format!("_transform/{id}?force=true"), None, operation)
            .await?
            .ok_or_tolerate(operation, &[404])
    }

    async fn delete_indices(&self, pattern: &str) -> Result<(), ClusterError> {
        let operation = "indices.delete";
        self.http
            .send(
                Method::DELETE,
                &format!("{pattern}?ignore_unavailable=true&allow_no_indices=true"),
                None,
                operation,
            )
            .await?
            .ok_or_tolerate(operation, &[404])
    }

    async fn search(
        &self,
        pattern: &str,
        request: &SearchRequest,
    ) -> Result<SearchResponse, ClusterError> {
        let operation = "search";
        let response = self
            .http
            .send(
                Method::POST,
                &format!("{pattern}/_search?ignore_unavailable=true&allow_no_indices=true"),
                Some(&request.body()),
                operation,
            )
            .await?;
        // 🕳️ No latest index yet means no entities yet, not a failure.
        if response.status == 404 {
            return Ok(SearchResponse::default());
        }
        if !response.is_success() {
            return Err(response.into_error(operation));
        }
        let body = response.json(operation)?;
        let hits = body["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .map(|hit| SearchHit {
                        index: hit["_index"].as_str().unwrap_or_default().to_string(),
                        id: hit["_id"].as_str().unwrap_or_default().to_string(),
                        source: hit["_source"].clone(),
                        sort: hit["sort"].as_array().cloned().unwrap_or_default(),
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let total = body["hits"]["total"]["value"]
            .as_u64()
            .or_else(|| body["hits"]["total"].as_u64())
            .unwrap_or(hits.len() as u64);
        trace!("🔎 {} of {} hits from [{}]", hits.len(), total, pattern);
        Ok(SearchResponse { total, hits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::backends::{SortField, SortOrder};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn cluster_for(server: &MockServer, config: ElasticsearchConfig) -> ElasticsearchCluster {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cluster_name": "entities-test",
                "version": { "number": "8.15.0" }
            })))
            .mount(server)
            .await;
        ElasticsearchCluster::new(ElasticsearchConfig {
            url: server.uri(),
            ..config
        })
        .await
        .expect("💀 the mock cluster should answer the ping")
    }

    #[tokio::test]
    async fn the_one_where_a_missing_transform_is_just_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_transform/ghost/_stats"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "type": "resource_not_found_exception", "reason": "Transform with id [ghost] could not be found" },
                "status": 404
            })))
            .mount(&server)
            .await;
        let cluster = cluster_for(&server, ElasticsearchConfig::default()).await;

        let stats = cluster
            .get_transform_stats("ghost")
            .await
            .expect("💀 404 must not be an error");
        assert!(stats.is_none());
    }

    #[tokio::test]
    async fn the_one_where_transform_stats_are_read_off_the_wire() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_transform/t1/_stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 1,
                "transforms": [{
                    "id": "t1",
                    "state": "indexing",
                    "stats": { "pages_processed": 12 },
                    "checkpointing": { "last": { "checkpoint": 3 } }
                }]
            })))
            .mount(&server)
            .await;
        let cluster = cluster_for(&server, ElasticsearchConfig::default()).await;

        let stats = cluster
            .get_transform_stats("t1")
            .await
            .expect("stats")
            .expect("present");
        assert!(stats.state.is_running());
        assert_eq!(stats.stats["pages_processed"], 12);
    }

    #[tokio::test]
    async fn the_one_where_pipeline_lookups_tolerate_404_and_stats_are_summed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_ingest/pipeline/p1,p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "p1": { "processors": [] }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_ingest/pipeline/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_nodes/stats/ingest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nodes": {
                    "node-a": { "ingest": { "pipelines": { "p1": { "count": 5, "failed": 1 } } } },
                    "node-b": { "ingest": { "pipelines": { "p1": { "count": 7, "failed": 0 } } } }
                }
            })))
            .mount(&server)
            .await;
        let cluster = cluster_for(&server, ElasticsearchConfig::default()).await;
        let ids = vec!["p1".to_string(), "p2".to_string()];

        let pipelines = cluster.get_ingest_pipelines(&ids).await.expect("pipelines");
        assert!(pipelines.contains_key("p1"));
        assert!(!pipelines.contains_key("p2"));

        let gone = cluster
            .get_ingest_pipelines(&["gone".to_string()])
            .await
            .expect("💀 404 on getPipeline is tolerated");
        assert!(gone.is_empty());

        let stats = cluster.ingest_pipeline_stats(&ids).await.expect("stats");
        assert_eq!(stats["p1"], PipelineStats { count: 12, failed: 1 });
        assert!(!stats.contains_key("p2"));
    }

    #[tokio::test]
    async fn the_one_where_the_bouncer_says_security_exception() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/_transform/t1"))
            .and(query_param("defer_validation", "true"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {
                    "type": "security_exception",
                    "reason": "action [cluster:admin/transform/put] is unauthorized for user [viewer]"
                },
                "status": 403
            })))
            .mount(&server)
            .await;
        let cluster = cluster_for(&server, ElasticsearchConfig::default()).await;

        let err = cluster
            .put_transform("t1", &json!({ "source": {} }))
            .await
            .expect_err("💀 a 403 must not be swallowed");
        match err {
            ClusterError::Security { reason, .. } => assert!(reason.contains("viewer")),
            plot_twist => panic!("💀 expected Security, got {plot_twist:?}"),
        }
    }

    #[tokio::test]
    async fn the_one_where_starting_twice_is_not_a_crime_and_api_keys_win() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_transform/t1/_start"))
            .and(header("Authorization", "ApiKey c2VjcmV0"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": { "type": "status_exception", "reason": "Cannot start transform [t1] as it is already started" },
                "status": 409
            })))
            .expect(1)
            .mount(&server)
            .await;
        let cluster = cluster_for(
            &server,
            ElasticsearchConfig {
                api_key: Some("c2VjcmV0".to_string()),
                username: Some("elastic".to_string()),
                password: Some("changeme".to_string()),
                ..ElasticsearchConfig::default()
            },
        )
        .await;

        cluster
            .start_transform("t1")
            .await
            .expect("💀 409 on start means it is already running, which is what we wanted");
    }

    #[tokio::test]
    async fn the_one_where_templates_come_back_unwrapped_or_not_at_all() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_index_template/tpl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "index_templates": [{
                    "name": "tpl",
                    "index_template": { "index_patterns": [".entities.v1.latest.svc"], "priority": 200 }
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_index_template/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({})))
            .mount(&server)
            .await;
        let cluster = cluster_for(&server, ElasticsearchConfig::default()).await;

        let template = cluster
            .get_index_template("tpl")
            .await
            .expect("template")
            .expect("present");
        assert_eq!(template["priority"], 200);
        assert!(
            cluster
                .get_index_template("missing")
                .await
                .expect("💀 404 is tolerated")
                .is_none()
        );
    }

    #[tokio::test]
    async fn the_one_where_server_errors_keep_their_receipts() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/_ingest/pipeline/p1"))
            .respond_with(ResponseTemplate::new(500).set_body_string("shard meltdown"))
            .mount(&server)
            .await;
        let cluster = cluster_for(&server, ElasticsearchConfig::default()).await;

        let err = cluster
            .put_ingest_pipeline("p1", &json!({ "processors": [] }))
            .await
            .expect_err("💀 500 must surface");
        match err {
            ClusterError::Response { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "shard meltdown");
            }
            plot_twist => panic!("💀 expected Response, got {plot_twist:?}"),
        }
    }

    #[tokio::test]
    async fn the_one_where_search_sends_the_cursor_and_reads_the_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/.entities.v1.latest.*/_search"))
            .and(query_param("ignore_unavailable", "true"))
            .and(body_partial_json(json!({
                "size": 2,
                "search_after": [200, "c"],
                "sort": [{ "entity.lastSeenTimestamp": { "order": "desc" } }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {
                    "total": { "value": 3, "relation": "eq" },
                    "hits": [{
                        "_index": ".entities.v1.latest.svc",
                        "_id": "a",
                        "_source": { "entity": { "id": "a" } },
                        "sort": [100, "a"]
                    }]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;
        let cluster = cluster_for(&server, ElasticsearchConfig::default()).await;

        let found = cluster
            .search(
                ".entities.v1.latest.*",
                &SearchRequest {
                    query: None,
                    size: 2,
                    sort: vec![SortField::new("entity.lastSeenTimestamp", SortOrder::Desc)],
                    search_after: Some(vec![json!(200), json!("c")]),
                },
            )
            .await
            .expect("💀 search");
        assert_eq!(found.total, 3);
        assert_eq!(found.hits.len(), 1);
        assert_eq!(found.hits[0].index, ".entities.v1.latest.svc");
        assert_eq!(found.hits[0].source["entity"]["id"], "a");
        assert_eq!(found.hits[0].sort, vec![json!(100), json!("a")]);
    }

    #[tokio::test]
    async fn the_one_where_searching_an_index_that_never_was_finds_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/.entities.v1.latest.svc/_search"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "type": "index_not_found_exception" },
                "status": 404
            })))
            .mount(&server)
            .await;
        let cluster = cluster_for(&server, ElasticsearchConfig::default()).await;

        let found = cluster
            .search(".entities.v1.latest.svc", &SearchRequest::default())
            .await
            .expect("💀 a missing index is an empty result");
        assert_eq!(found, SearchResponse::default());
    }
}
