use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A labelled piece of text waiting to be embedded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextUnit {
    pub filename: String,
    pub content: String,
}

impl TextUnit {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Restriction {
    pub namespace: String,
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
}

/// A vector stored in the nearest-neighbor index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub restricts: Vec<Restriction>,
    pub crowding_tag: Option<String>,
}

impl DataPoint {
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
            restricts: Vec::new(),
            crowding_tag: None,
        }
    }
}

/// One ranked neighbor as reported by the index. Lower distance is closer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub distance: f64,
}

impl Neighbor {
    /// Maps the index's dot-product distance (in `[0, 2]`) onto `[0, 1]`.
    ///
    /// Records already stored by earlier deployments were scored with this
    /// exact formula, so it must not change.
    pub fn similarity(&self) -> f64 {
        1.0 - (self.distance / 2.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRecord {
    pub id: String,
    pub filename: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub additional_metadata: Map<String, Value>,
}

impl MetadataRecord {
    pub fn new(id: impl Into<String>, unit: &TextUnit, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            filename: unit.filename.clone(),
            content: unit.content.clone(),
            created_at: now,
            updated_at: now,
            additional_metadata: Map::new(),
        }
    }

    pub fn with_additional(mut self, key: impl Into<String>, value: Value) -> Self {
        self.additional_metadata.insert(key.into(), value);
        self
    }

    /// Merges update fields into this record. Fails on reserved keys or on
    /// non-string values for `filename`/`content`.
    pub fn apply_update(
        &mut self,
        fields: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        for (key, value) in fields {
            match UpdateTarget::of(&key) {
                UpdateTarget::Filename | UpdateTarget::Content => {
                    let Value::String(text) = value else {
                        return Err(format!("field {key} must be a string"));
                    };
                    if key == "filename" {
                        self.filename = text;
                    } else {
                        self.content = text;
                    }
                }
                UpdateTarget::Additional(name) => {
                    self.additional_metadata.insert(name, value);
                }
                UpdateTarget::Reserved => return Err(format!("field {key} cannot be updated")),
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// Prepares a record for overwriting `previous`: the original creation
    /// time survives and `updated_at` moves to `now`.
    pub fn restamp(mut self, previous: Option<&MetadataRecord>, now: DateTime<Utc>) -> Self {
        if let Some(previous) = previous {
            self.created_at = previous.created_at;
        }
        self.updated_at = now;
        self
    }
}

/// Where a field passed to a metadata update lands in the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateTarget {
    Filename,
    Content,
    Additional(String),
    /// Identity and timestamps are owned by the store.
    Reserved,
}

impl UpdateTarget {
    pub fn of(key: &str) -> Self {
        match key {
            "filename" => UpdateTarget::Filename,
            "content" => UpdateTarget::Content,
            "id" | "data_point_id" | "created_at" | "updated_at" => UpdateTarget::Reserved,
            other => UpdateTarget::Additional(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchMatch {
    pub data_point_id: String,
    pub similarity_score: f64,
    pub metadata: MetadataRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub question: String,
    pub matches: Vec<SearchMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    pub index: String,
    pub total_data_points: u64,
    pub updated_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn similarity_maps_distance_range_onto_unit_interval() {
        let exact = Neighbor { id: "a".to_string(), distance: 0.0 };
        let opposite = Neighbor { id: "b".to_string(), distance: 2.0 };
        let middle = Neighbor { id: "c".to_string(), distance: 0.5 };

        assert_eq!(exact.similarity(), 1.0);
        assert_eq!(opposite.similarity(), 0.0);
        assert_eq!(middle.similarity(), 0.75);
    }

    #[test]
    fn restamp_keeps_original_creation_time() {
        let first_write = Utc::now();
        let second_write = first_write + Duration::seconds(5);
        let unit = TextUnit::new("orders", "orders: one row per purchase");

        let original = MetadataRecord::new("id-1", &unit, first_write);
        let rewritten = MetadataRecord::new("id-1", &unit, second_write)
            .restamp(Some(&original), second_write);

        assert_eq!(rewritten.created_at, first_write);
        assert_eq!(rewritten.updated_at, second_write);
    }

    #[test]
    fn update_merges_fields_and_stamps_time() {
        let created = Utc::now();
        let later = created + Duration::seconds(3);
        let unit = TextUnit::new("sales", "sales: daily totals");
        let mut record = MetadataRecord::new("id", &unit, created)
            .with_additional("owner", Value::String("finance".to_string()));

        let mut fields = Map::new();
        fields.insert("content".to_string(), Value::String("sales: hourly totals".to_string()));
        fields.insert("rows".to_string(), Value::from(1200));
        record.apply_update(fields, later).expect("valid update");

        assert_eq!(record.content, "sales: hourly totals");
        assert_eq!(record.filename, "sales");
        assert_eq!(record.additional_metadata.get("owner"), Some(&Value::from("finance")));
        assert_eq!(record.additional_metadata.get("rows"), Some(&Value::from(1200)));
        assert_eq!(record.created_at, created);
        assert_eq!(record.updated_at, later);
    }

    #[test]
    fn update_rejects_reserved_fields() {
        let now = Utc::now();
        let mut record = MetadataRecord::new("id", &TextUnit::new("a", "b"), now);
        let mut fields = Map::new();
        fields.insert("created_at".to_string(), Value::from("yesterday"));

        assert!(record.apply_update(fields, now).is_err());
    }

    #[test]
    fn restamp_without_previous_only_moves_updated_at() {
        let created = Utc::now();
        let later = created + Duration::seconds(1);
        let unit = TextUnit::new("a", "b");

        let record = MetadataRecord::new("id", &unit, created).restamp(None, later);
        assert_eq!(record.created_at, created);
        assert_eq!(record.updated_at, later);
    }
}
