use crate::config::{GcpConfig, MetadataConfig};
use crate::models::{MetadataRecord, UpdateTarget};
use crate::traits::MetadataStore;
use crate::SearchError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Map, Number, Value};
use std::collections::HashMap;
use tracing::{error, info, warn};

const BACKEND: &str = "firestore";

/// Metadata records kept as Firestore documents, one per data point id.
pub struct FirestoreStore {
    client: Client,
    base: String,
    database_path: String,
    collection: String,
    access_token: Option<String>,
}

impl FirestoreStore {
    pub fn new(gcp: &GcpConfig, metadata: &MetadataConfig) -> Self {
        Self {
            client: Client::new(),
            base: gcp.firestore_base.trim_end_matches('/').to_string(),
            database_path: format!(
                "projects/{}/databases/{}",
                gcp.project_id, metadata.database_id
            ),
            collection: metadata.collection.clone(),
            access_token: gcp.access_token.clone(),
        }
    }

    fn document_name(&self, id: &str) -> String {
        format!("{}/documents/{}/{}", self.database_path, self.collection, id)
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/v1/{}", self.base, resource)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// One atomic write per record; documents found in `existing` keep
    /// their stored `created_at`.
    fn commit_body(
        &self,
        records: &[MetadataRecord],
        existing: &HashMap<String, MetadataRecord>,
        now: DateTime<Utc>,
    ) -> Value {
        let writes: Vec<Value> = records
            .iter()
            .map(|record| {
                let record = record.clone().restamp(existing.get(&record.id), now);
                json!({
                    "update": {
                        "name": self.document_name(&record.id),
                        "fields": encode_record(&record),
                    }
                })
            })
            .collect();

        json!({ "writes": writes })
    }

    async fn fetch_many(
        &self,
        ids: &[&str],
    ) -> Result<HashMap<String, MetadataRecord>, SearchError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let documents: Vec<String> = ids.iter().map(|id| self.document_name(id)).collect();
        let response = self
            .authorized(self.client.post(self.url(&format!(
                "{}/documents:batchGet",
                self.database_path
            ))))
            .json(&json!({ "documents": documents }))
            .send()
            .await?;

        if !response.status().is_success() {
            error!(status = %response.status(), "metadata batch lookup failed");
            return Err(SearchError::backend(BACKEND, response.status().to_string()));
        }

        let entries: Vec<Value> = response.json().await?;
        let mut found = HashMap::new();
        for entry in entries {
            if let Some(document) = entry.get("found") {
                let record = decode_document(document)?;
                found.insert(record.id.clone(), record);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl MetadataStore for FirestoreStore {
    async fn save(&self, record: MetadataRecord) -> Result<(), SearchError> {
        let previous = self.get(&record.id).await?;
        let record = record.restamp(previous.as_ref(), Utc::now());

        let response = self
            .authorized(self.client.patch(self.url(&self.document_name(&record.id))))
            .json(&json!({ "fields": encode_record(&record) }))
            .send()
            .await?;

        if !response.status().is_success() {
            error!(id = %record.id, status = %response.status(), "metadata save failed");
            return Err(SearchError::backend(BACKEND, response.status().to_string()));
        }

        info!(collection = %self.collection, id = %record.id, "saved metadata");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MetadataRecord>, SearchError> {
        let response = self
            .authorized(self.client.get(self.url(&self.document_name(id))))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!(collection = %self.collection, id, "metadata not found");
            return Ok(None);
        }
        if !response.status().is_success() {
            error!(id, status = %response.status(), "metadata lookup failed");
            return Err(SearchError::backend(BACKEND, response.status().to_string()));
        }

        let document: Value = response.json().await?;
        decode_document(&document).map(Some)
    }

    async fn batch_save(&self, records: Vec<MetadataRecord>) -> Result<(), SearchError> {
        if records.is_empty() {
            return Ok(());
        }

        let ids: Vec<&str> = records.iter().map(|record| record.id.as_str()).collect();
        let existing = self.fetch_many(&ids).await?;
        let body = self.commit_body(&records, &existing, Utc::now());

        let response = self
            .authorized(
                self.client
                    .post(self.url(&format!("{}/documents:commit", self.database_path))),
            )
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            error!(count = records.len(), status = %response.status(), "metadata batch save failed");
            return Err(SearchError::backend(BACKEND, response.status().to_string()));
        }

        info!(collection = %self.collection, count = records.len(), "batch saved metadata");
        Ok(())
    }

    async fn update(&self, id: &str, fields: Map<String, Value>) -> Result<(), SearchError> {
        let (document_fields, mask) = encode_update(fields, Utc::now())?;

        let mut query: Vec<(&str, String)> = mask
            .into_iter()
            .map(|path| ("updateMask.fieldPaths", path))
            .collect();
        query.push(("currentDocument.exists", "true".to_string()));

        let response = self
            .authorized(self.client.patch(self.url(&self.document_name(id))))
            .query(&query)
            .json(&json!({ "fields": document_fields }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SearchError::Request(format!("no metadata record for {id}")));
        }
        if !response.status().is_success() {
            error!(id, status = %response.status(), "metadata update failed");
            return Err(SearchError::backend(BACKEND, response.status().to_string()));
        }

        info!(collection = %self.collection, id, "updated metadata");
        Ok(())
    }
}

/// Converts plain JSON into Firestore's typed value representation.
pub fn to_firestore_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(flag) => json!({ "booleanValue": flag }),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => json!({ "integerValue": integer.to_string() }),
            None => json!({ "doubleValue": number.as_f64().unwrap_or_default() }),
        },
        Value::String(text) => json!({ "stringValue": text }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(to_firestore_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": to_firestore_fields(map) } }),
    }
}

fn to_firestore_fields(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| (key.clone(), to_firestore_value(value)))
        .collect()
}

/// Converts a Firestore typed value back into plain JSON. Timestamps come
/// back as RFC 3339 strings.
pub fn from_firestore_value(value: &Value) -> Result<Value, SearchError> {
    let Some((kind, inner)) = value.as_object().and_then(|object| object.iter().next()) else {
        return Err(SearchError::backend(BACKEND, format!("untyped value {value}")));
    };

    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" | "stringValue" | "timestampValue" | "referenceValue" => Ok(inner.clone()),
        "integerValue" => {
            let parsed = match inner {
                Value::String(text) => text.parse::<i64>().ok(),
                other => other.as_i64(),
            };
            parsed
                .map(Value::from)
                .ok_or_else(|| SearchError::backend(BACKEND, format!("bad integer {inner}")))
        }
        "doubleValue" => inner
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| SearchError::backend(BACKEND, format!("bad double {inner}"))),
        "arrayValue" => inner
            .get("values")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(from_firestore_value).collect::<Result<Vec<_>, _>>())
            .unwrap_or_else(|| Ok(Vec::new()))
            .map(Value::Array),
        "mapValue" => inner
            .get("fields")
            .and_then(Value::as_object)
            .map(from_firestore_fields)
            .unwrap_or_else(|| Ok(Map::new()))
            .map(Value::Object),
        other => Err(SearchError::backend(BACKEND, format!("unsupported value type {other}"))),
    }
}

fn from_firestore_fields(fields: &Map<String, Value>) -> Result<Map<String, Value>, SearchError> {
    fields
        .iter()
        .map(|(key, value)| Ok((key.clone(), from_firestore_value(value)?)))
        .collect()
}

fn timestamp_value(at: &DateTime<Utc>) -> Value {
    json!({ "timestampValue": at.to_rfc3339() })
}

fn encode_record(record: &MetadataRecord) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("data_point_id".to_string(), json!({ "stringValue": record.id }));
    fields.insert("filename".to_string(), json!({ "stringValue": record.filename }));
    fields.insert("content".to_string(), json!({ "stringValue": record.content }));
    fields.insert("created_at".to_string(), timestamp_value(&record.created_at));
    fields.insert("updated_at".to_string(), timestamp_value(&record.updated_at));
    fields.insert(
        "additional_metadata".to_string(),
        json!({ "mapValue": { "fields": to_firestore_fields(&record.additional_metadata) } }),
    );
    fields
}

fn decode_document(document: &Value) -> Result<MetadataRecord, SearchError> {
    let fields = document
        .get("fields")
        .and_then(Value::as_object)
        .map(from_firestore_fields)
        .transpose()?
        .unwrap_or_default();

    let id = match fields.get("data_point_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => document
            .get("name")
            .and_then(Value::as_str)
            .and_then(|name| name.rsplit('/').next())
            .unwrap_or_default()
            .to_string(),
    };

    let text = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let timestamp = |key: &str| -> Result<DateTime<Utc>, SearchError> {
        let raw = fields
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| SearchError::backend(BACKEND, format!("document {id} lacks {key}")))?;
        DateTime::parse_from_rfc3339(raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|error| SearchError::backend(BACKEND, format!("bad {key}: {error}")))
    };

    Ok(MetadataRecord {
        filename: text("filename"),
        content: text("content"),
        created_at: timestamp("created_at")?,
        updated_at: timestamp("updated_at")?,
        additional_metadata: fields
            .get("additional_metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        id,
    })
}

/// Builds the document body and update mask for a merge-style update.
fn encode_update(
    fields: Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<(Map<String, Value>, Vec<String>), SearchError> {
    let mut document = Map::new();
    let mut additional = Map::new();
    let mut mask = Vec::new();

    for (key, value) in fields {
        match UpdateTarget::of(&key) {
            UpdateTarget::Filename | UpdateTarget::Content => {
                if !value.is_string() {
                    return Err(SearchError::Request(format!("field {key} must be a string")));
                }
                document.insert(key.clone(), to_firestore_value(&value));
                mask.push(key);
            }
            UpdateTarget::Additional(name) => {
                mask.push(format!("additional_metadata.{}", quote_field_path(&name)));
                additional.insert(name, to_firestore_value(&value));
            }
            UpdateTarget::Reserved => {
                return Err(SearchError::Request(format!("field {key} cannot be updated")));
            }
        }
    }

    if !additional.is_empty() {
        document.insert(
            "additional_metadata".to_string(),
            json!({ "mapValue": { "fields": additional } }),
        );
    }
    document.insert("updated_at".to_string(), timestamp_value(&now));
    mask.push("updated_at".to_string());

    Ok((document, mask))
}

fn quote_field_path(segment: &str) -> String {
    let mut chars = segment.chars();
    let simple = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|rest| rest.is_ascii_alphanumeric() || rest == '_');

    if simple {
        segment.to_string()
    } else {
        format!("`{}`", segment.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TextUnit;

    #[test]
    fn nested_values_survive_the_codec() {
        let original = json!({
            "rows": 1200,
            "ratio": 0.25,
            "tags": ["sales", "daily"],
            "owner": { "team": "finance", "active": true },
            "note": null,
        });

        let encoded = to_firestore_value(&original);
        assert_eq!(encoded.pointer("/mapValue/fields/rows/integerValue"), Some(&json!("1200")));

        let decoded = from_firestore_value(&encoded).expect("decodes");
        assert_eq!(decoded, original);
    }

    #[test]
    fn records_decode_from_documents() {
        let created = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);
        let unit = TextUnit::new("orders", "orders: purchases");
        let record = MetadataRecord::new("abc", &unit, created)
            .with_additional("embedding_dimension", json!(768));

        let document = json!({
            "name": "projects/p/databases/d/documents/table_metadata/abc",
            "fields": encode_record(&record),
        });

        assert_eq!(decode_document(&document).expect("decodes"), record);
    }

    #[test]
    fn update_mask_targets_nested_metadata() {
        let mut fields = Map::new();
        fields.insert("content".to_string(), json!("orders: refunds too"));
        fields.insert("row-count".to_string(), json!(10));

        let (document, mask) = encode_update(fields, Utc::now()).expect("valid update");

        assert!(mask.contains(&"content".to_string()));
        assert!(mask.contains(&"additional_metadata.`row-count`".to_string()));
        assert!(mask.contains(&"updated_at".to_string()));
        assert!(document
            .get("updated_at")
            .and_then(|value| value.get("timestampValue"))
            .is_some());
    }

    #[test]
    fn reserved_fields_are_not_updatable() {
        let mut fields = Map::new();
        fields.insert("created_at".to_string(), json!("2020-01-01T00:00:00Z"));
        assert!(matches!(
            encode_update(fields, Utc::now()),
            Err(SearchError::Request(_))
        ));
    }

    #[test]
    fn commit_keeps_stored_creation_time() {
        let gcp = GcpConfig {
            project_id: "demo".to_string(),
            ..GcpConfig::default()
        };
        let store = FirestoreStore::new(&gcp, &MetadataConfig::default());
        let stored_at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);
        let now = DateTime::parse_from_rfc3339("2024-06-01T10:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);

        let unit = TextUnit::new("orders", "orders: purchases");
        let mut existing = HashMap::new();
        existing.insert("old".to_string(), MetadataRecord::new("old", &unit, stored_at));
        let records = vec![
            MetadataRecord::new("old", &unit, now),
            MetadataRecord::new("new", &unit, now),
        ];

        let body = store.commit_body(&records, &existing, now);
        let writes = body["writes"].as_array().expect("writes");
        assert_eq!(writes.len(), 2);

        let created = |write: &Value| {
            write
                .pointer("/update/fields/created_at/timestampValue")
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let updated = |write: &Value| {
            write
                .pointer("/update/fields/updated_at/timestampValue")
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        assert!(writes[0]["update"]["name"]
            .as_str()
            .is_some_and(|name| name.ends_with("/table_metadata/old")));
        assert_eq!(created(&writes[0]), Some(stored_at.to_rfc3339()));
        assert_eq!(updated(&writes[0]), Some(now.to_rfc3339()));
        assert_eq!(created(&writes[1]), Some(now.to_rfc3339()));
    }

    #[test]
    fn document_names_follow_collection_layout() {
        let gcp = GcpConfig {
            project_id: "demo".to_string(),
            ..GcpConfig::default()
        };
        let store = FirestoreStore::new(&gcp, &MetadataConfig::default());
        assert_eq!(
            store.url(&store.document_name("id-1")),
            "https://firestore.googleapis.com/v1/projects/demo/databases/database-test-001/documents/table_metadata/id-1"
        );
    }
}
