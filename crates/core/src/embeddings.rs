use crate::config::GcpConfig;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::error;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// An external model that turns a batch of strings into vectors.
///
/// Implementations must return exactly one vector per input, in input order.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn name(&self) -> &str;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Offline model hashing character trigrams into a fixed number of buckets.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingModel for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        "character-ngram"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

/// Vertex AI text-embedding model reached through its `:predict` endpoint.
pub struct VertexEmbeddingModel {
    client: Client,
    endpoint: String,
    model: String,
    access_token: Option<String>,
}

impl VertexEmbeddingModel {
    pub fn new(gcp: &GcpConfig, model: impl Into<String>) -> Self {
        let model = model.into();
        let endpoint = format!(
            "{}/v1/{}/publishers/google/models/{}:predict",
            gcp.aiplatform_base(),
            gcp.location_path(),
            model
        );

        Self {
            client: Client::new(),
            endpoint,
            model,
            access_token: gcp.access_token.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: Vec<PredictInstance<'a>>,
}

#[derive(Serialize)]
struct PredictInstance<'a> {
    content: &'a str,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
struct Prediction {
    embeddings: PredictionEmbeddings,
}

#[derive(Deserialize)]
struct PredictionEmbeddings {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingModel for VertexEmbeddingModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = PredictRequest {
            instances: texts
                .iter()
                .map(|text| PredictInstance { content: text })
                .collect(),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let details = response.text().await.unwrap_or_default();
            error!(model = %self.model, %status, "embedding request rejected");
            return Err(EmbeddingError::BackendResponse {
                backend: "vertex-embeddings".to_string(),
                details: format!("{status}: {details}"),
            });
        }

        let parsed: PredictResponse = response.json().await?;
        Ok(parsed
            .predictions
            .into_iter()
            .map(|prediction| prediction.embeddings.values)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("customer purchase history");
        let second = embedder.embed("customer purchase history");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed("abc");
        assert_eq!(vector.len(), 32);
    }

    #[tokio::test]
    async fn ngram_batch_preserves_input_order() {
        let embedder = CharacterNgramEmbedder { dimensions: 16 };
        let texts = vec!["first table".to_string(), "second table".to_string()];

        let vectors = embedder.embed_batch(&texts).await.expect("offline embedding");
        assert_eq!(vectors, vec![embedder.embed("first table"), embedder.embed("second table")]);
    }

    #[test]
    fn vertex_endpoint_targets_publisher_model() {
        let gcp = GcpConfig {
            project_id: "demo".to_string(),
            region: "us-central1".to_string(),
            ..GcpConfig::default()
        };
        let model = VertexEmbeddingModel::new(&gcp, "text-multilingual-embedding-002");
        assert_eq!(
            model.endpoint(),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/demo/locations/us-central1/publishers/google/models/text-multilingual-embedding-002:predict"
        );
    }
}
