//! Explicit configuration passed into each component's constructor.

use crate::retry::RetryPolicy;
use crate::tokenizer::EncodingType;
use crate::SearchError;
use std::time::Duration;
use url::Url;

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-multilingual-embedding-002";
pub const DEFAULT_MAX_TOKENS_PER_TEXT: usize = 2042;
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct GcpConfig {
    pub project_id: String,
    pub region: String,
    /// OAuth bearer token sent with every request.
    pub access_token: Option<String>,
    /// Overrides `https://{region}-aiplatform.googleapis.com`.
    pub aiplatform_base: Option<String>,
    pub firestore_base: String,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            region: "asia-northeast1".to_string(),
            access_token: None,
            aiplatform_base: None,
            firestore_base: "https://firestore.googleapis.com".to_string(),
        }
    }
}

impl GcpConfig {
    pub fn aiplatform_base(&self) -> String {
        self.aiplatform_base
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com", self.region))
            .trim_end_matches('/')
            .to_string()
    }

    /// `projects/{project}/locations/{region}`
    pub fn location_path(&self) -> String {
        format!("projects/{}/locations/{}", self.project_id, self.region)
    }

    /// Checks the settings every managed-service client depends on.
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.project_id.trim().is_empty() {
            return Err(SearchError::Request("project id is required".to_string()));
        }
        if self.region.trim().is_empty() {
            return Err(SearchError::Request("region is required".to_string()));
        }
        Url::parse(&self.aiplatform_base())?;
        Url::parse(&self.firestore_base)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    pub model_name: String,
    pub encoding: EncodingType,
    pub max_tokens: usize,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Upper bound on concurrently running batch requests.
    pub max_workers: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_EMBEDDING_MODEL.to_string(),
            encoding: EncodingType::Cl100kBase,
            max_tokens: DEFAULT_MAX_TOKENS_PER_TEXT,
            batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
            retry: RetryPolicy::default(),
            max_workers: default_worker_count(),
        }
    }
}

fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    (cpus + 4).min(32)
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorSearchConfig {
    /// Full resource name, `projects/../locations/../indexes/{id}`.
    pub index: String,
    /// Full resource name, `projects/../locations/../indexEndpoints/{id}`.
    pub index_endpoint: String,
    /// Domain serving `findNeighbors` for a public endpoint.
    pub public_endpoint_domain: String,
    pub deployed_index_id: String,
}

impl Default for VectorSearchConfig {
    fn default() -> Self {
        Self {
            index: String::new(),
            index_endpoint: String::new(),
            public_endpoint_domain: String::new(),
            deployed_index_id: "table_metadata_index_deployed".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataConfig {
    pub database_id: String,
    pub collection: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            database_id: "database-test-001".to_string(),
            collection: "table_metadata".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchParameters {
    pub num_results: usize,
    pub min_similarity_score: f64,
    pub include_metadata: bool,
    pub compute_statistics: bool,
    pub max_summary_matches: usize,
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            num_results: 10,
            min_similarity_score: 0.0,
            include_metadata: true,
            compute_statistics: true,
            max_summary_matches: 5,
        }
    }
}

/// Settings for long-running administrative operations.
#[derive(Debug, Clone, PartialEq)]
pub struct AdminConfig {
    pub operation_timeout: Duration,
    pub poll_interval: Duration,
    pub machine_type: String,
    pub min_replica_count: u32,
    pub max_replica_count: u32,
    pub approximate_neighbors_count: u32,
    pub leaf_node_embedding_count: u32,
    pub leaf_nodes_to_search_percent: u32,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(45 * 60),
            poll_interval: Duration::from_secs(1),
            machine_type: "e2-standard-2".to_string(),
            min_replica_count: 1,
            max_replica_count: 1,
            approximate_neighbors_count: 150,
            leaf_node_embedding_count: 500,
            leaf_nodes_to_search_percent: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineConfig {
    pub gcp: GcpConfig,
    pub embedding: EmbeddingConfig,
    pub vector_search: VectorSearchConfig,
    pub metadata: MetadataConfig,
    pub admin: AdminConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployed_settings() {
        let config = PipelineConfig::default();
        assert_eq!(config.embedding.max_tokens, 2042);
        assert_eq!(config.embedding.batch_size, 10);
        assert_eq!(config.embedding.retry, RetryPolicy::fixed(3, Duration::from_secs(1)));
        assert!(config.embedding.max_workers >= 5 && config.embedding.max_workers <= 32);
        assert_eq!(config.metadata.collection, "table_metadata");
    }

    #[test]
    fn aiplatform_base_follows_region_unless_overridden() {
        let mut gcp = GcpConfig {
            project_id: "p".to_string(),
            ..GcpConfig::default()
        };
        assert_eq!(
            gcp.aiplatform_base(),
            "https://asia-northeast1-aiplatform.googleapis.com"
        );
        assert_eq!(gcp.location_path(), "projects/p/locations/asia-northeast1");

        gcp.aiplatform_base = Some("http://localhost:8080/".to_string());
        assert_eq!(gcp.aiplatform_base(), "http://localhost:8080");
    }

    #[test]
    fn validation_needs_project_and_parseable_bases() {
        assert!(matches!(
            GcpConfig::default().validate(),
            Err(SearchError::Request(_))
        ));

        let mut gcp = GcpConfig {
            project_id: "p".to_string(),
            ..GcpConfig::default()
        };
        assert!(gcp.validate().is_ok());

        gcp.firestore_base = "not a url".to_string();
        assert!(matches!(gcp.validate(), Err(SearchError::Url(_))));
    }
}
