//! Presentation of search results: detailed views, summary text, and
//! score statistics.

use crate::models::{MetadataRecord, QueryResult, SearchMatch};
use crate::SearchError;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt::Write as _;

const SUMMARY_PREVIEW_CHARS: usize = 100;
const METADATA_PREVIEW_CHARS: usize = 200;

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn serialize_round4<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round4(*value))
}

fn serialize_round4_opt<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serializer.serialize_some(&round4(*value)),
        None => serializer.serialize_none(),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticalSummary {
    pub count: usize,
    #[serde(serialize_with = "serialize_round4")]
    pub mean: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub median: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub min_value: f64,
    #[serde(serialize_with = "serialize_round4")]
    pub max_value: f64,
    /// Sample standard deviation; absent for a single value.
    #[serde(
        serialize_with = "serialize_round4_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub std_dev: Option<f64>,
}

fn all_scores(results: &[QueryResult]) -> Vec<f64> {
    results
        .iter()
        .flat_map(|result| result.matches.iter().map(|hit| hit.similarity_score))
        .collect()
}

/// Statistics over every similarity score in `results`, or `None` when
/// there are no scores at all.
pub fn calculate_statistics(results: &[QueryResult]) -> Option<StatisticalSummary> {
    let mut values = all_scores(results);
    if values.is_empty() {
        return None;
    }

    values.sort_by(f64::total_cmp);
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let median = if count % 2 == 1 {
        values[count / 2]
    } else {
        (values[count / 2 - 1] + values[count / 2]) / 2.0
    };
    let std_dev = (count > 1).then(|| {
        let variance = values
            .iter()
            .map(|value| (value - mean).powi(2))
            .sum::<f64>()
            / (count - 1) as f64;
        variance.sqrt()
    });

    Some(StatisticalSummary {
        count,
        mean,
        median,
        min_value: values[0],
        max_value: values[count - 1],
        std_dev,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreGroup {
    pub label: String,
    pub matches: Vec<SearchMatch>,
}

/// Buckets matches into half-open `[start, end)` score ranges, in the order
/// the ranges are given. Matches outside every range are left out.
pub fn group_by_range(
    results: &[QueryResult],
    ranges: &[(f64, f64)],
) -> Result<Vec<ScoreGroup>, SearchError> {
    if results.is_empty() || ranges.is_empty() {
        return Err(SearchError::Format("empty results or ranges provided".to_string()));
    }
    if let Some((start, end)) = ranges.iter().find(|(start, end)| !(start < end)) {
        return Err(SearchError::Format(format!("invalid range values: {start}-{end}")));
    }

    let mut groups: Vec<ScoreGroup> = ranges
        .iter()
        .map(|(start, end)| ScoreGroup {
            label: format!("{start}-{end}"),
            matches: Vec::new(),
        })
        .collect();

    for hit in results.iter().flat_map(|result| result.matches.iter()) {
        let score = hit.similarity_score;
        if let Some(position) = ranges
            .iter()
            .position(|(start, end)| *start <= score && score < *end)
        {
            groups[position].matches.push(hit.clone());
        }
    }

    Ok(groups)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataView {
    pub filename: String,
    pub content_preview: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub additional_metadata: Map<String, Value>,
}

impl From<&MetadataRecord> for MetadataView {
    fn from(record: &MetadataRecord) -> Self {
        Self {
            filename: record.filename.clone(),
            content_preview: preview(&record.content, METADATA_PREVIEW_CHARS),
            created_at: record.created_at.to_rfc3339(),
            additional_metadata: record.additional_metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedMatch {
    pub id: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedResult {
    pub query: String,
    pub match_count: usize,
    pub matches: Vec<DetailedMatch>,
}

pub fn to_detailed(results: &[QueryResult], include_metadata: bool) -> Vec<DetailedResult> {
    results
        .iter()
        .map(|result| DetailedResult {
            query: result.question.clone(),
            match_count: result.matches.len(),
            matches: result
                .matches
                .iter()
                .map(|hit| DetailedMatch {
                    id: hit.data_point_id.clone(),
                    score: round4(hit.similarity_score),
                    metadata: include_metadata.then(|| MetadataView::from(&hit.metadata)),
                })
                .collect(),
        })
        .collect()
}

/// Human-readable summary listing at most `max_matches` matches per query.
pub fn to_summary_text(results: &[QueryResult], max_matches: usize) -> String {
    let mut summary = String::new();

    for result in results {
        let shown = &result.matches[..result.matches.len().min(max_matches)];
        let _ = writeln!(summary, "\nQuery: {}", result.question);
        let _ = writeln!(summary, "Top {} matches:", shown.len());

        for (position, hit) in shown.iter().enumerate() {
            let _ = writeln!(summary, "\n{}. Score: {:.4}", position + 1, hit.similarity_score);
            let _ = writeln!(summary, "   File: {}", hit.metadata.filename);
            let _ = writeln!(
                summary,
                "   Preview: {}",
                preview(&hit.metadata.content, SUMMARY_PREVIEW_CHARS)
            );
        }

        let _ = writeln!(summary, "\n{}", "-".repeat(50));
    }

    summary
}

/// Keeps matches scoring at least `min_score`, truncated per query.
pub fn filter_results(
    results: &[QueryResult],
    min_score: f64,
    max_results_per_query: Option<usize>,
) -> Result<Vec<QueryResult>, SearchError> {
    if !(0.0..=1.0).contains(&min_score) {
        return Err(SearchError::Format("min_score must be between 0 and 1".to_string()));
    }

    Ok(results
        .iter()
        .map(|result| {
            let kept = result
                .matches
                .iter()
                .filter(|hit| hit.similarity_score >= min_score)
                .take(max_results_per_query.unwrap_or(usize::MAX))
                .cloned()
                .collect();
            QueryResult {
                question: result.question.clone(),
                matches: kept,
            }
        })
        .collect())
}
