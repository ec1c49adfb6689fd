use crate::models::{DataPoint, IndexStats, MetadataRecord, Neighbor};
use crate::SearchError;
use async_trait::async_trait;
use serde_json::{Map, Value};

#[async_trait]
pub trait VectorIndex {
    async fn upsert_datapoints(&self, datapoints: &[DataPoint]) -> Result<(), SearchError>;

    async fn remove_datapoints(&self, ids: &[String]) -> Result<(), SearchError>;

    /// Returns, per query vector, up to `num_neighbors` ranked by distance.
    async fn find_neighbors(
        &self,
        queries: &[Vec<f32>],
        num_neighbors: usize,
    ) -> Result<Vec<Vec<Neighbor>>, SearchError>;

    async fn index_stats(&self) -> Result<IndexStats, SearchError>;
}

#[async_trait]
pub trait MetadataStore {
    /// Creates or overwrites the record. An existing `created_at` survives.
    async fn save(&self, record: MetadataRecord) -> Result<(), SearchError>;

    /// `Ok(None)` when no record exists for `id`.
    async fn get(&self, id: &str) -> Result<Option<MetadataRecord>, SearchError>;

    /// Writes all records or none of them.
    async fn batch_save(&self, records: Vec<MetadataRecord>) -> Result<(), SearchError>;

    /// Merges `fields` into the record and stamps `updated_at`.
    async fn update(&self, id: &str, fields: Map<String, Value>) -> Result<(), SearchError>;
}
