use crate::batcher::EmbeddingBatcher;
use crate::embeddings::EmbeddingModel;
use crate::models::{DataPoint, MetadataRecord, TextUnit};
use crate::traits::{MetadataStore, VectorIndex};
use crate::SearchError;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const TEXT_EXTENSIONS: [&str; 2] = ["txt", "md"];

pub fn discover_text_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_text = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                TEXT_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            });

        if is_text {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Reads every text file under `folder` into a unit labelled by file name.
pub fn load_text_units(folder: &Path) -> Result<Vec<TextUnit>, SearchError> {
    let files = discover_text_files(folder);
    if files.is_empty() {
        return Err(SearchError::Request(format!(
            "no text files found in {}",
            folder.display()
        )));
    }

    let mut units = Vec::with_capacity(files.len());
    for path in files {
        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            warn!(path = %path.display(), "skipping empty file");
            continue;
        }

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| SearchError::Request(format!("path missing filename: {}", path.display())))?;
        units.push(TextUnit::new(name, content));
    }

    Ok(units)
}

pub fn content_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub data_point_ids: Vec<String>,
    pub dimension: usize,
}

/// Writes texts into both the metadata store and the vector index under
/// freshly generated ids.
pub struct Ingestor<V, S, M> {
    index: Arc<V>,
    metadata: Arc<S>,
    batcher: Arc<EmbeddingBatcher<M>>,
}

impl<V, S, M> Ingestor<V, S, M>
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

    /// Metadata is committed before the vectors, so a failed upsert leaves
    /// orphaned records rather than unsearchable hits.
    pub async fn ingest(&self, units: &[TextUnit]) -> Result<IngestReport, SearchError> {
        if units.is_empty() {
            return Err(SearchError::Request("no texts to ingest".to_string()));
        }

        let vectors = self.batcher.embed_texts(units).await?;
        let dimension = vectors.first().map(Vec::len).unwrap_or(0);
        let now = Utc::now();

        let mut records = Vec::with_capacity(units.len());
        let mut datapoints = Vec::with_capacity(units.len());
        for (unit, vector) in units.iter().zip(vectors) {
            let id = Uuid::new_v4().to_string();
            records.push(
                MetadataRecord::new(id.as_str(), unit, now)
                    .with_additional("embedding_dimension", Value::from(dimension))
                    .with_additional("checksum", Value::String(content_checksum(&unit.content))),
            );
            datapoints.push(DataPoint::new(id, vector));
        }

        let data_point_ids: Vec<String> = datapoints.iter().map(|point| point.id.clone()).collect();

        self.metadata.batch_save(records).await?;
        info!(count = data_point_ids.len(), "metadata saved");
        self.index.upsert_datapoints(&datapoints).await?;
        info!(count = data_point_ids.len(), dimension, "texts ingested");

        Ok(IngestReport {
            data_point_ids,
            dimension,
        })
    }

    /// Removes vectors only; their metadata records stay behind.
    pub async fn remove(&self, ids: &[String]) -> Result<(), SearchError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.index.remove_datapoints(ids).await?;
        info!(count = ids.len(), "data points removed");
        Ok(())
    }
}
