use crate::config::{GcpConfig, VectorSearchConfig};
use crate::models::{DataPoint, IndexStats, Neighbor};
use crate::traits::VectorIndex;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::{error, info};

const BACKEND: &str = "vertex-vector-search";

/// Vertex AI Vector Search: streaming updates go to the index resource,
/// queries go to the deployed index behind its public endpoint.
pub struct VertexVectorIndex {
    client: Client,
    api_base: String,
    query_base: String,
    index: String,
    index_endpoint: String,
    deployed_index_id: String,
    access_token: Option<String>,
}

impl VertexVectorIndex {
    pub fn new(gcp: &GcpConfig, vector_search: &VectorSearchConfig) -> Self {
        let api_base = gcp.aiplatform_base();
        let domain = vector_search.public_endpoint_domain.trim_end_matches('/');
        let query_base = if domain.is_empty() {
            api_base.clone()
        } else if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{domain}")
        };

        Self {
            client: Client::new(),
            api_base,
            query_base,
            index: vector_search.index.clone(),
            index_endpoint: vector_search.index_endpoint.clone(),
            deployed_index_id: vector_search.deployed_index_id.clone(),
            access_token: gcp.access_token.clone(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post(&self, url: String, body: Value, operation: &str) -> Result<Value, SearchError> {
        let response = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let details = response.text().await.unwrap_or_default();
            error!(operation, %status, %details, "vector search call failed");
            return Err(SearchError::backend(BACKEND, format!("{operation}: {status}")));
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

fn datapoint_body(point: &DataPoint) -> Value {
    let mut body = json!({
        "datapointId": point.id,
        "featureVector": point.vector,
    });

    if !point.restricts.is_empty() {
        body["restricts"] = point
            .restricts
            .iter()
            .map(|restrict| {
                json!({
                    "namespace": restrict.namespace,
                    "allowList": restrict.allow_list,
                    "denyList": restrict.deny_list,
                })
            })
            .collect();
    }
    if let Some(tag) = &point.crowding_tag {
        body["crowdingTag"] = json!({ "crowdingAttribute": tag });
    }

    body
}

fn parse_neighbors(response: &Value, expected_queries: usize) -> Result<Vec<Vec<Neighbor>>, SearchError> {
    let groups = response
        .pointer("/nearestNeighbors")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if groups.len() != expected_queries {
        return Err(SearchError::backend(
            BACKEND,
            format!(
                "expected neighbors for {expected_queries} queries, got {}",
                groups.len()
            ),
        ));
    }

    let mut result = Vec::with_capacity(groups.len());
    for group in groups {
        let hits = group
            .pointer("/neighbors")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut neighbors = Vec::with_capacity(hits.len());
        for hit in hits {
            let id = hit
                .pointer("/datapoint/datapointId")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| SearchError::backend(BACKEND, "neighbor without datapointId"))?
                .to_string();
            // proto3 JSON leaves out a zero distance
            let distance = hit.pointer("/distance").and_then(Value::as_f64).unwrap_or(0.0);
            neighbors.push(Neighbor { id, distance });
        }
        result.push(neighbors);
    }

    Ok(result)
}

#[async_trait]
impl VectorIndex for VertexVectorIndex {
    async fn upsert_datapoints(&self, datapoints: &[DataPoint]) -> Result<(), SearchError> {
        if datapoints.is_empty() {
            return Ok(());
        }

        info!(count = datapoints.len(), "upserting data points");
        let body = json!({
            "datapoints": datapoints.iter().map(datapoint_body).collect::<Vec<_>>(),
        });
        self.post(
            format!("{}/v1/{}:upsertDatapoints", self.api_base, self.index),
            body,
            "upsertDatapoints",
        )
        .await?;
        info!(count = datapoints.len(), "data points upserted");
        Ok(())
    }

    async fn remove_datapoints(&self, ids: &[String]) -> Result<(), SearchError> {
        if ids.is_empty() {
            return Ok(());
        }

        info!(count = ids.len(), "removing data points");
        self.post(
            format!("{}/v1/{}:removeDatapoints", self.api_base, self.index),
            json!({ "datapointIds": ids }),
            "removeDatapoints",
        )
        .await?;
        info!(count = ids.len(), "data points removed");
        Ok(())
    }

    async fn find_neighbors(
        &self,
        queries: &[Vec<f32>],
        num_neighbors: usize,
    ) -> Result<Vec<Vec<Neighbor>>, SearchError> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "deployedIndexId": self.deployed_index_id,
            "queries": queries
                .iter()
                .enumerate()
                .map(|(position, vector)| json!({
                    "datapoint": {
                        "datapointId": format!("query-{position}"),
                        "featureVector": vector,
                    },
                    "neighborCount": num_neighbors,
                }))
                .collect::<Vec<_>>(),
            "returnFullDatapoint": false,
        });

        let response = self
            .post(
                format!("{}/v1/{}:findNeighbors", self.query_base, self.index_endpoint),
                body,
                "findNeighbors",
            )
            .await?;

        let neighbors = parse_neighbors(&response, queries.len())?;
        info!(
            queries = queries.len(),
            hits = neighbors.iter().map(Vec::len).sum::<usize>(),
            "neighbor search complete"
        );
        Ok(neighbors)
    }

    async fn index_stats(&self) -> Result<IndexStats, SearchError> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/v1/{}", self.api_base, self.index)),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            error!(status = %response.status(), "index lookup failed");
            return Err(SearchError::backend(BACKEND, response.status().to_string()));
        }

        let index: Value = response.json().await?;
        let total_data_points = match index.pointer("/indexStats/vectorsCount") {
            Some(Value::String(count)) => count.parse::<u64>().unwrap_or(0),
            Some(other) => other.as_u64().unwrap_or(0),
            None => 0,
        };

        Ok(IndexStats {
            index: self.index.clone(),
            total_data_points,
            updated_at: index
                .pointer("/updateTime")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Restriction;

    #[test]
    fn datapoints_carry_restricts_and_crowding() {
        let mut point = DataPoint::new("p-1", vec![0.5, 0.5]);
        point.restricts.push(Restriction {
            namespace: "dataset".to_string(),
            allow_list: vec!["sales".to_string()],
            deny_list: Vec::new(),
        });
        point.crowding_tag = Some("sales".to_string());

        let body = datapoint_body(&point);
        assert_eq!(body["datapointId"], "p-1");
        assert_eq!(body["restricts"][0]["allowList"][0], "sales");
        assert_eq!(body["crowdingTag"]["crowdingAttribute"], "sales");
    }

    #[test]
    fn plain_datapoints_omit_optional_fields() {
        let body = datapoint_body(&DataPoint::new("p-2", vec![1.0]));
        assert!(body.get("restricts").is_none());
        assert!(body.get("crowdingTag").is_none());
    }

    #[test]
    fn neighbors_keep_service_order_per_query() {
        let response = json!({
            "nearestNeighbors": [
                { "id": "query-0", "neighbors": [
                    { "datapoint": { "datapointId": "a" }, "distance": 0.1 },
                    { "datapoint": { "datapointId": "b" }, "distance": 0.4 }
                ]},
                { "id": "query-1", "neighbors": [] }
            ]
        });

        let parsed = parse_neighbors(&response, 2).expect("parses");
        assert_eq!(parsed[0][0], Neighbor { id: "a".to_string(), distance: 0.1 });
        assert_eq!(parsed[0][1].id, "b");
        assert!(parsed[1].is_empty());
    }

    #[test]
    fn neighbors_need_an_id_but_not_a_distance() {
        let exact = json!({
            "nearestNeighbors": [
                { "neighbors": [ { "datapoint": { "datapointId": "a" } } ] }
            ]
        });
        let parsed = parse_neighbors(&exact, 1).expect("parses");
        assert_eq!(parsed[0][0].distance, 0.0);

        let anonymous = json!({
            "nearestNeighbors": [
                { "neighbors": [ { "datapoint": {}, "distance": 0.3 } ] }
            ]
        });
        assert!(matches!(
            parse_neighbors(&anonymous, 1),
            Err(SearchError::BackendResponse { ref details, .. }) if details.contains("datapointId")
        ));
    }

    #[test]
    fn missing_query_groups_are_an_error() {
        let response = json!({ "nearestNeighbors": [] });
        assert!(matches!(
            parse_neighbors(&response, 1),
            Err(SearchError::BackendResponse { .. })
        ));
    }

    #[test]
    fn public_domain_gets_https_scheme() {
        let gcp = GcpConfig::default();
        let config = VectorSearchConfig {
            public_endpoint_domain: "123.asia-northeast1-1.vdb.vertexai.goog".to_string(),
            ..VectorSearchConfig::default()
        };
        let index = VertexVectorIndex::new(&gcp, &config);
        assert_eq!(index.query_base, "https://123.asia-northeast1-1.vdb.vertexai.goog");
    }
}
