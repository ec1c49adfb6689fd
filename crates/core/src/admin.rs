//! Index and endpoint lifecycle on Vertex AI Vector Search.

use crate::config::{AdminConfig, GcpConfig};
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const BACKEND: &str = "vertex-admin";
const METADATA_SCHEMA_URI: &str =
    "gs://google-cloud-aiplatform/schema/matchingengine/metadata/nearest_neighbor_search_1.0.0.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentState {
    Deployed,
    Deploying,
    NotFound,
}

/// Reads the status of a long-running operation.
#[async_trait]
pub trait OperationSource {
    /// `Ok(None)` while pending, `Ok(Some(response))` when done.
    async fn poll_operation(&self, name: &str) -> Result<Option<Value>, SearchError>;
}

/// Polls `name` until it completes or `timeout` elapses.
pub async fn wait_for_operation<S>(
    source: &S,
    name: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Value, SearchError>
where
    S: OperationSource + ?Sized,
{
    let started = Instant::now();
    loop {
        if let Some(response) = source.poll_operation(name).await? {
            info!(operation = name, "operation completed");
            return Ok(response);
        }

        let elapsed = started.elapsed();
        if elapsed > timeout {
            error!(operation = name, ?elapsed, "operation timed out");
            return Err(SearchError::Timeout {
                operation: name.to_string(),
                elapsed,
            });
        }

        debug!(operation = name, "waiting for operation to complete");
        sleep(poll_interval).await;
    }
}

pub struct IndexAdmin {
    client: Client,
    api_base: String,
    parent: String,
    access_token: Option<String>,
    config: AdminConfig,
}

impl IndexAdmin {
    pub fn new(gcp: &GcpConfig, config: AdminConfig) -> Self {
        Self {
            client: Client::new(),
            api_base: gcp.aiplatform_base(),
            parent: gcp.location_path(),
            access_token: gcp.access_token.clone(),
            config,
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Value, SearchError> {
        let response = self.authorized(request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let details = response.text().await.unwrap_or_default();
            error!(operation, %status, %details, "admin call failed");
            return Err(SearchError::backend(BACKEND, format!("{operation}: {status}")));
        }
        Ok(response.json().await?)
    }

    fn operation_name(response: &Value, operation: &str) -> Result<String, SearchError> {
        response
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SearchError::backend(BACKEND, format!("{operation} returned no operation")))
    }

    pub fn index_body(&self, display_name: &str, dimension: usize) -> Value {
        json!({
            "displayName": display_name,
            "description": format!("Vector search index created at {}", chrono::Utc::now().to_rfc3339()),
            "metadataSchemaUri": METADATA_SCHEMA_URI,
            "indexUpdateMethod": "STREAM_UPDATE",
            "metadata": {
                "config": {
                    "dimensions": dimension,
                    "approximateNeighborsCount": self.config.approximate_neighbors_count,
                    "distanceMeasureType": "DOT_PRODUCT_DISTANCE",
                    "shardSize": "SHARD_SIZE_SMALL",
                    "algorithmConfig": {
                        "treeAhConfig": {
                            "leafNodeEmbeddingCount": self.config.leaf_node_embedding_count,
                            "leafNodesToSearchPercent": self.config.leaf_nodes_to_search_percent,
                        }
                    }
                }
            }
        })
    }

    /// Starts index creation and returns the operation name.
    pub async fn create_index(&self, display_name: &str, dimension: usize) -> Result<String, SearchError> {
        let request = self
            .client
            .post(format!("{}/v1/{}/indexes", self.api_base, self.parent))
            .json(&self.index_body(display_name, dimension));
        let response = self.send(request, "createIndex").await?;
        info!(display_name, dimension, "index creation started");
        Self::operation_name(&response, "createIndex")
    }

    pub async fn create_endpoint(&self, display_name: &str) -> Result<String, SearchError> {
        let request = self
            .client
            .post(format!("{}/v1/{}/indexEndpoints", self.api_base, self.parent))
            .json(&json!({
                "displayName": display_name,
                "description": format!("Vector search endpoint created at {}", chrono::Utc::now().to_rfc3339()),
                "publicEndpointEnabled": true,
            }));
        let response = self.send(request, "createIndexEndpoint").await?;
        info!(display_name, "endpoint creation started");
        Self::operation_name(&response, "createIndexEndpoint")
    }

    pub async fn deploy_index(
        &self,
        index_name: &str,
        endpoint_name: &str,
        deployed_index_id: &str,
    ) -> Result<String, SearchError> {
        let request = self
            .client
            .post(format!("{}/v1/{}:deployIndex", self.api_base, endpoint_name))
            .json(&json!({
                "deployedIndex": {
                    "id": deployed_index_id,
                    "index": index_name,
                    "displayName": format!("Deployed index {deployed_index_id}"),
                    "dedicatedResources": {
                        "machineSpec": { "machineType": self.config.machine_type },
                        "minReplicaCount": self.config.min_replica_count,
                        "maxReplicaCount": self.config.max_replica_count,
                    }
                }
            }));
        let response = self.send(request, "deployIndex").await?;
        info!(deployed_index_id, "index deployment started");
        Self::operation_name(&response, "deployIndex")
    }

    /// Waits using the configured timeout and poll interval.
    pub async fn wait(&self, operation: &str) -> Result<Value, SearchError> {
        wait_for_operation(
            self,
            operation,
            self.config.operation_timeout,
            self.config.poll_interval,
        )
        .await
    }

    pub async fn get_endpoint(&self, endpoint_name: &str) -> Result<Value, SearchError> {
        let request = self
            .client
            .get(format!("{}/v1/{}", self.api_base, endpoint_name));
        self.send(request, "getIndexEndpoint").await
    }

    pub async fn deployment_state(
        &self,
        endpoint_name: &str,
        deployed_index_id: &str,
    ) -> Result<DeploymentState, SearchError> {
        let endpoint = self.get_endpoint(endpoint_name).await?;
        Ok(deployment_state_of(&endpoint, deployed_index_id))
    }
}

pub fn deployment_state_of(endpoint: &Value, deployed_index_id: &str) -> DeploymentState {
    let deployed = endpoint
        .get("deployedIndexes")
        .and_then(Value::as_array)
        .and_then(|indexes| {
            indexes.iter().find(|index| {
                index.get("id").and_then(Value::as_str) == Some(deployed_index_id)
            })
        });

    match deployed {
        Some(index) if index.get("indexSyncTime").is_some() => DeploymentState::Deployed,
        Some(_) => DeploymentState::Deploying,
        None => {
            warn!(deployed_index_id, "deployed index not found");
            DeploymentState::NotFound
        }
    }
}

#[async_trait]
impl OperationSource for IndexAdmin {
    async fn poll_operation(&self, name: &str) -> Result<Option<Value>, SearchError> {
        let request = self.client.get(format!("{}/v1/{}", self.api_base, name));
        let operation = self.send(request, "getOperation").await?;

        if !operation.get("done").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(None);
        }
        if let Some(failure) = operation.get("error") {
            return Err(SearchError::backend(
                BACKEND,
                format!("operation {name} failed: {failure}"),
            ));
        }
        Ok(Some(operation.get("response").cloned().unwrap_or(Value::Null)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountdownOperation {
        polls_until_done: u32,
        polls: AtomicU32,
    }

    #[async_trait]
    impl OperationSource for CountdownOperation {
        async fn poll_operation(&self, _name: &str) -> Result<Option<Value>, SearchError> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if poll >= self.polls_until_done {
                Ok(Some(json!({ "name": "projects/p/locations/r/indexes/1" })))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn returns_response_once_done() {
        let source = CountdownOperation {
            polls_until_done: 3,
            polls: AtomicU32::new(0),
        };

        let response = wait_for_operation(
            &source,
            "operations/1",
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .expect("completes");

        assert_eq!(response["name"], "projects/p/locations/r/indexes/1");
        assert_eq!(source.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_finishing_operation_times_out() {
        let source = CountdownOperation {
            polls_until_done: u32::MAX,
            polls: AtomicU32::new(0),
        };

        let error = wait_for_operation(
            &source,
            "operations/slow",
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .await
        .expect_err("times out");

        assert!(matches!(error, SearchError::Timeout { ref operation, .. } if operation == "operations/slow"));
    }

    #[test]
    fn deployment_state_reads_sync_time() {
        let endpoint = json!({
            "deployedIndexes": [
                { "id": "other" },
                { "id": "table_metadata_index_deployed", "indexSyncTime": "2024-05-01T00:00:00Z" }
            ]
        });
        assert_eq!(
            deployment_state_of(&endpoint, "table_metadata_index_deployed"),
            DeploymentState::Deployed
        );
        assert_eq!(deployment_state_of(&endpoint, "other"), DeploymentState::Deploying);
        assert_eq!(deployment_state_of(&endpoint, "missing"), DeploymentState::NotFound);
    }

    #[test]
    fn index_body_uses_dot_product_distance() {
        let admin = IndexAdmin::new(&GcpConfig::default(), AdminConfig::default());
        let body = admin.index_body("table_metadata_index", 768);
        let config = &body["metadata"]["config"];
        assert_eq!(config["dimensions"], 768);
        assert_eq!(config["distanceMeasureType"], "DOT_PRODUCT_DISTANCE");
        assert_eq!(config["algorithmConfig"]["treeAhConfig"]["leafNodeEmbeddingCount"], 500);
    }
}
