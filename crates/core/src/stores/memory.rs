//! Process-local stand-ins for the managed services, used for offline runs
//! and tests. The vector index is an exhaustive scan, not an ANN structure.

use crate::models::{DataPoint, IndexStats, MetadataRecord, Neighbor};
use crate::traits::{MetadataStore, VectorIndex};
use crate::SearchError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

fn lock<'a, T>(mutex: &'a Mutex<T>, backend: &str) -> Result<MutexGuard<'a, T>, SearchError> {
    mutex
        .lock()
        .map_err(|_| SearchError::backend(backend, "store lock poisoned"))
}

/// Scores with `1 - dot(query, point)`, which stays in `[0, 2]` for unit
/// vectors like the managed index's dot-product distance.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    points: Mutex<HashMap<String, DataPoint>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.lock().map(|points| points.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.points
            .lock()
            .map(|points| points.contains_key(id))
            .unwrap_or(false)
    }
}

fn dot(left: &[f32], right: &[f32]) -> f64 {
    left.iter()
        .zip(right.iter())
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum()
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert_datapoints(&self, datapoints: &[DataPoint]) -> Result<(), SearchError> {
        let mut points = lock(&self.points, "memory-index")?;
        for point in datapoints {
            points.insert(point.id.clone(), point.clone());
        }
        Ok(())
    }

    async fn remove_datapoints(&self, ids: &[String]) -> Result<(), SearchError> {
        let mut points = lock(&self.points, "memory-index")?;
        for id in ids {
            points.remove(id);
        }
        Ok(())
    }

    async fn find_neighbors(
        &self,
        queries: &[Vec<f32>],
        num_neighbors: usize,
    ) -> Result<Vec<Vec<Neighbor>>, SearchError> {
        let points = lock(&self.points, "memory-index")?;

        queries
            .iter()
            .map(|query| {
                let mut neighbors = points
                    .values()
                    .map(|point| {
                        if point.vector.len() != query.len() {
                            return Err(SearchError::Request(format!(
                                "query vector dim {} is not {}",
                                query.len(),
                                point.vector.len()
                            )));
                        }
                        Ok(Neighbor {
                            id: point.id.clone(),
                            distance: 1.0 - dot(query, &point.vector),
                        })
                    })
                    .collect::<Result<Vec<_>, SearchError>>()?;

                neighbors.sort_by(|left, right| {
                    left.distance
                        .total_cmp(&right.distance)
                        .then_with(|| left.id.cmp(&right.id))
                });
                neighbors.truncate(num_neighbors);
                Ok(neighbors)
            })
            .collect()
    }

    async fn index_stats(&self) -> Result<IndexStats, SearchError> {
        let points = lock(&self.points, "memory-index")?;
        Ok(IndexStats {
            index: "memory".to_string(),
            total_data_points: points.len() as u64,
            updated_at: None,
        })
    }
}

#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: Mutex<HashMap<String, MetadataRecord>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn save(&self, record: MetadataRecord) -> Result<(), SearchError> {
        let mut records = lock(&self.records, "memory-metadata")?;
        let previous = records.get(&record.id).cloned();
        let record = record.restamp(previous.as_ref(), Utc::now());
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MetadataRecord>, SearchError> {
        let records = lock(&self.records, "memory-metadata")?;
        Ok(records.get(id).cloned())
    }

    async fn batch_save(&self, batch: Vec<MetadataRecord>) -> Result<(), SearchError> {
        let mut records = lock(&self.records, "memory-metadata")?;
        let now = Utc::now();
        for record in batch {
            let previous = records.get(&record.id).cloned();
            let record = record.restamp(previous.as_ref(), now);
            records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn update(&self, id: &str, fields: Map<String, Value>) -> Result<(), SearchError> {
        let mut records = lock(&self.records, "memory-metadata")?;
        let Some(existing) = records.get(id) else {
            return Err(SearchError::Request(format!("no metadata record for {id}")));
        };

        let mut updated = existing.clone();
        updated
            .apply_update(fields, Utc::now())
            .map_err(SearchError::Request)?;
        records.insert(id.to_string(), updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TextUnit;

    #[tokio::test]
    async fn neighbors_are_ranked_by_increasing_distance() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert_datapoints(&[
                DataPoint::new("far", vec![0.0, 1.0]),
                DataPoint::new("near", vec![1.0, 0.0]),
                DataPoint::new("mid", vec![0.6, 0.8]),
            ])
            .await
            .expect("upsert");

        let results = index
            .find_neighbors(&[vec![1.0, 0.0]], 2)
            .await
            .expect("query");

        let ids: Vec<&str> = results[0].iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
        assert!(results[0][0].distance.abs() < 1e-9);
    }

    #[tokio::test]
    async fn removed_points_disappear() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert_datapoints(&[DataPoint::new("a", vec![1.0]), DataPoint::new("b", vec![1.0])])
            .await
            .expect("upsert");
        index.remove_datapoints(&["a".to_string()]).await.expect("remove");

        assert!(!index.contains("a"));
        assert_eq!(index.index_stats().await.expect("stats").total_data_points, 1);
    }

    #[tokio::test]
    async fn missing_metadata_is_none() {
        let store = InMemoryMetadataStore::new();
        assert!(store.get("unknown").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn resaving_keeps_created_at_and_moves_updated_at() {
        let store = InMemoryMetadataStore::new();
        let unit = TextUnit::new("orders", "orders: purchases");
        let first = MetadataRecord::new("id-1", &unit, Utc::now());

        store.save(first.clone()).await.expect("first save");
        let stored_first = store.get("id-1").await.expect("get").expect("present");

        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .save(MetadataRecord::new("id-1", &unit, Utc::now()))
            .await
            .expect("second save");
        let stored_second = store.get("id-1").await.expect("get").expect("present");

        assert_eq!(stored_second.created_at, stored_first.created_at);
        assert!(stored_second.updated_at > stored_first.updated_at);
    }

    #[tokio::test]
    async fn update_of_missing_record_fails() {
        let store = InMemoryMetadataStore::new();
        let result = store.update("ghost", Map::new()).await;
        assert!(matches!(result, Err(SearchError::Request(_))));
    }
}
