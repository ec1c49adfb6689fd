use crate::batcher::EmbeddingBatcher;
use crate::config::SearchParameters;
use crate::embeddings::EmbeddingModel;
use crate::formatter::{self, DetailedResult, StatisticalSummary};
use crate::models::{Neighbor, QueryResult, SearchMatch, TextUnit};
use crate::traits::{MetadataStore, VectorIndex};
use crate::SearchError;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<DetailedResult>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<StatisticalSummary>,
    #[serde(skip)]
    pub query_results: Vec<QueryResult>,
}

/// Embeds questions, looks up their nearest neighbors and joins each hit
/// with its metadata record.
pub struct SemanticSearcher<V, S, M> {
    index: Arc<V>,
    metadata: Arc<S>,
    batcher: Arc<EmbeddingBatcher<M>>,
}

impl<V, S, M> SemanticSearcher<V, S, M>
where
    V: VectorIndex,
    S: MetadataStore,
    M: EmbeddingModel + 'static,
{
    pub fn new(index: Arc<V>, metadata: Arc<S>, batcher: Arc<EmbeddingBatcher<M>>) -> Self {
        Self {
            index,
            metadata,
            batcher,
        }
    }

    pub async fn search(
        &self,
        questions: &[String],
        parameters: &SearchParameters,
    ) -> Result<SearchResponse, SearchError> {
        let query_results = self.find_matches(questions, parameters).await?;

        let statistics = if parameters.compute_statistics {
            let statistics = formatter::calculate_statistics(&query_results);
            if statistics.is_none() {
                debug!("no surviving scores, statistics omitted");
            }
            statistics
        } else {
            None
        };

        Ok(SearchResponse {
            results: formatter::to_detailed(&query_results, parameters.include_metadata),
            summary: formatter::to_summary_text(&query_results, parameters.max_summary_matches),
            statistics,
            query_results,
        })
    }

    /// Ranked matches per question, in question order.
    pub async fn find_matches(
        &self,
        questions: &[String],
        parameters: &SearchParameters,
    ) -> Result<Vec<QueryResult>, SearchError> {
        validate(questions, parameters)?;

        let units: Vec<TextUnit> = questions
            .iter()
            .enumerate()
            .map(|(position, question)| TextUnit::new(format!("question_{position}"), question.as_str()))
            .collect();

        info!(questions = questions.len(), k = parameters.num_results, "searching");
        let vectors = self.batcher.embed_texts(&units).await?;
        let neighbors = self
            .index
            .find_neighbors(&vectors, parameters.num_results)
            .await?;

        if neighbors.len() != questions.len() {
            return Err(SearchError::backend(
                "vector-index",
                format!(
                    "expected neighbors for {} queries, got {}",
                    questions.len(),
                    neighbors.len()
                ),
            ));
        }

        let mut results = Vec::with_capacity(questions.len());
        for (question, hits) in questions.iter().zip(neighbors) {
            let matches = self
                .process_neighbors(hits, parameters.min_similarity_score)
                .await?;
            info!(question = %question, matches = matches.len(), "query processed");
            results.push(QueryResult {
                question: question.clone(),
                matches,
            });
        }

        Ok(results)
    }

    async fn process_neighbors(
        &self,
        neighbors: Vec<Neighbor>,
        threshold: f64,
    ) -> Result<Vec<SearchMatch>, SearchError> {
        let mut matches = Vec::with_capacity(neighbors.len());

        for neighbor in neighbors {
            let score = neighbor.similarity();
            if score < threshold {
                debug!(id = %neighbor.id, score, threshold, "below threshold");
                continue;
            }

            match self.metadata.get(&neighbor.id).await? {
                Some(metadata) => matches.push(SearchMatch {
                    data_point_id: neighbor.id,
                    similarity_score: score,
                    metadata,
                }),
                None => warn!(id = %neighbor.id, "no metadata for data point, dropping match"),
            }
        }

        Ok(matches)
    }
}

fn validate(questions: &[String], parameters: &SearchParameters) -> Result<(), SearchError> {
    if questions.is_empty() {
        return Err(SearchError::Request("no questions given".to_string()));
    }
    if let Some(position) = questions.iter().position(|question| question.trim().is_empty()) {
        return Err(SearchError::Request(format!("question_{position} is empty")));
    }
    if parameters.num_results == 0 {
        return Err(SearchError::Request("num_results must be at least 1".to_string()));
    }
    if !(0.0..=1.0).contains(&parameters.min_similarity_score) {
        return Err(SearchError::Request(format!(
            "min_similarity_score {} is outside [0, 1]",
            parameters.min_similarity_score
        )));
    }
    Ok(())
}
