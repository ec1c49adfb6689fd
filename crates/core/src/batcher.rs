use crate::config::EmbeddingConfig;
use crate::embeddings::EmbeddingModel;
use crate::error::EmbeddingError;
use crate::models::TextUnit;
use crate::retry::RetryPolicy;
use crate::tokenizer::TextTokenizer;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Validates, batches, and concurrently embeds texts.
///
/// Batches run in parallel up to `max_workers`; the output is reassembled by
/// batch index, so vector `i` always belongs to input `i`. Any batch that
/// still fails after its retries aborts the whole call.
pub struct EmbeddingBatcher<M> {
    model: Arc<M>,
    tokenizer: TextTokenizer,
    config: EmbeddingConfig,
    dimension: OnceLock<usize>,
}

impl<M> EmbeddingBatcher<M>
where
    M: EmbeddingModel + 'static,
{
    pub fn new(model: M, config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        if config.batch_size == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if config.max_workers == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "max_workers must be greater than zero".to_string(),
            ));
        }

        let tokenizer = TextTokenizer::new(config.encoding)?;
        info!(
            model = model.name(),
            batch_size = config.batch_size,
            max_workers = config.max_workers,
            "embedding batcher ready"
        );

        Ok(Self {
            model: Arc::new(model),
            tokenizer,
            config,
            dimension: OnceLock::new(),
        })
    }

    /// Dimension observed on the first successful call, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    pub async fn embed_texts(&self, units: &[TextUnit]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if units.is_empty() {
            return Ok(Vec::new());
        }

        self.tokenizer.validate(units, self.config.max_tokens)?;

        let started = Instant::now();
        let batch_size = self.config.batch_size;
        let batches: Vec<Vec<String>> = units
            .chunks(batch_size)
            .map(|chunk| chunk.iter().map(|unit| unit.content.clone()).collect())
            .collect();
        let batch_count = batches.len();

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut tasks = JoinSet::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let model = Arc::clone(&self.model);
            let retry = self.config.retry.clone();
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        embed_with_retry(model.as_ref(), &retry, &batch, index * batch_size).await
                    }
                    Err(closed) => Err(EmbeddingError::InvalidConfig(closed.to_string())),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<Vec<Vec<f32>>>> = vec![None; batch_count];
        let mut completed = 0usize;

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined?;
            match result {
                Ok(vectors) => {
                    completed += vectors.len();
                    info!(
                        batch = index + 1,
                        batches = batch_count,
                        progress = completed,
                        total = units.len(),
                        "completed embedding batch"
                    );
                    slots[index] = Some(vectors);
                }
                Err(source) => {
                    error!(batch = index + 1, error = %source, "embedding batch failed");
                    tasks.abort_all();
                    return Err(EmbeddingError::Batch {
                        index,
                        source: Box::new(source),
                    });
                }
            }
        }

        let embeddings: Vec<Vec<f32>> = slots.into_iter().flatten().flatten().collect();
        if embeddings.len() != units.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: units.len(),
                actual: embeddings.len(),
            });
        }

        self.check_dimensions(&embeddings)?;
        info!(
            count = embeddings.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generated embeddings"
        );
        Ok(embeddings)
    }

    /// Embeds one text with the same validation and retry rules.
    pub async fn embed_one(&self, unit: &TextUnit) -> Result<Vec<f32>, EmbeddingError> {
        self.tokenizer
            .validate(std::slice::from_ref(unit), self.config.max_tokens)?;

        let input = [unit.content.clone()];
        let vectors =
            embed_with_retry(self.model.as_ref(), &self.config.retry, &input, 0).await?;

        self.check_dimensions(&vectors)?;
        vectors.into_iter().next().ok_or(EmbeddingError::CountMismatch {
            expected: 1,
            actual: 0,
        })
    }

    fn check_dimensions(&self, vectors: &[Vec<f32>]) -> Result<(), EmbeddingError> {
        let Some(first) = vectors.first() else {
            return Ok(());
        };
        let expected = *self.dimension.get_or_init(|| first.len());

        match vectors.iter().find(|vector| vector.len() != expected) {
            Some(vector) => Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: vector.len(),
            }),
            None => Ok(()),
        }
    }
}

async fn embed_with_retry<M>(
    model: &M,
    retry: &RetryPolicy,
    batch: &[String],
    start_index: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError>
where
    M: EmbeddingModel + ?Sized,
{
    let label = format!("embed batch at {start_index}");
    let vectors = retry
        .execute(&label, || model.embed_batch(batch))
        .await
        .map_err(|(error, attempts)| EmbeddingError::Generation {
            attempts,
            details: error.to_string(),
        })?;

    if vectors.len() != batch.len() {
        return Err(EmbeddingError::CountMismatch {
            expected: batch.len(),
            actual: vectors.len(),
        });
    }

    debug!(start_index, size = batch.len(), "embedded batch");
    Ok(vectors)
}
