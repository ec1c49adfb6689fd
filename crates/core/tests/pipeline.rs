use std::sync::Arc;
use table_search_core::{
    CharacterNgramEmbedder, EmbeddingBatcher, EmbeddingConfig, InMemoryMetadataStore,
    InMemoryVectorIndex, Ingestor, MetadataStore, SearchParameters, SemanticSearcher, TextUnit,
    VectorIndex,
};

struct Pipeline {
    index: Arc<InMemoryVectorIndex>,
    metadata: Arc<InMemoryMetadataStore>,
    ingestor: Ingestor<InMemoryVectorIndex, InMemoryMetadataStore, CharacterNgramEmbedder>,
    searcher: SemanticSearcher<InMemoryVectorIndex, InMemoryMetadataStore, CharacterNgramEmbedder>,
}

fn pipeline() -> Pipeline {
    let index = Arc::new(InMemoryVectorIndex::new());
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let config = EmbeddingConfig {
        batch_size: 10,
        ..EmbeddingConfig::default()
    };
    let batcher = Arc::new(
        EmbeddingBatcher::new(CharacterNgramEmbedder::default(), config).expect("batcher"),
    );

    Pipeline {
        ingestor: Ingestor::new(index.clone(), metadata.clone(), batcher.clone()),
        searcher: SemanticSearcher::new(index.clone(), metadata.clone(), batcher),
        index,
        metadata,
    }
}

#[tokio::test]
async fn ingested_tables_are_found_by_description() {
    let pipeline = pipeline();
    let units = vec![
        TextUnit::new("a", "a: short table description"),
        TextUnit::new("b", "b: another table"),
    ];

    let report = pipeline.ingestor.ingest(&units).await.expect("ingest");
    assert_eq!(report.data_point_ids.len(), 2);
    assert_ne!(report.data_point_ids[0], report.data_point_ids[1]);
    assert!(report.dimension > 0);

    for (id, unit) in report.data_point_ids.iter().zip(&units) {
        let record = pipeline
            .metadata
            .get(id)
            .await
            .expect("lookup")
            .expect("metadata record");
        assert_eq!(record.content, unit.content);
    }

    let parameters = SearchParameters {
        num_results: 2,
        min_similarity_score: 0.0,
        ..SearchParameters::default()
    };
    let response = pipeline
        .searcher
        .search(&["table description".to_string()], &parameters)
        .await
        .expect("search");

    let matches = &response.query_results[0].matches;
    let mut found: Vec<&str> = matches.iter().map(|hit| hit.data_point_id.as_str()).collect();
    assert!(matches
        .windows(2)
        .all(|pair| pair[0].similarity_score >= pair[1].similarity_score));
    assert_eq!(found[0], report.data_point_ids[0]);

    found.sort_unstable();
    let mut expected: Vec<&str> = report.data_point_ids.iter().map(String::as_str).collect();
    expected.sort_unstable();
    assert_eq!(found, expected);

    assert_eq!(response.statistics.expect("statistics").count, 2);
    assert!(response.summary.contains("Query: table description"));
}

#[tokio::test]
async fn removed_vectors_no_longer_match() {
    let pipeline = pipeline();
    let report = pipeline
        .ingestor
        .ingest(&[
            TextUnit::new("orders", "orders: purchase history per customer"),
            TextUnit::new("stock", "stock: warehouse inventory levels"),
        ])
        .await
        .expect("ingest");

    pipeline
        .ingestor
        .remove(&report.data_point_ids[..1])
        .await
        .expect("remove");
    assert_eq!(
        pipeline.index.index_stats().await.expect("stats").total_data_points,
        1
    );

    let results = pipeline
        .searcher
        .find_matches(&["purchase history".to_string()], &SearchParameters::default())
        .await
        .expect("search");
    let ids: Vec<&str> = results[0]
        .matches
        .iter()
        .map(|hit| hit.data_point_id.as_str())
        .collect();
    assert_eq!(ids, vec![report.data_point_ids[1].as_str()]);
}

#[tokio::test]
async fn vectors_without_metadata_are_skipped() {
    let pipeline = pipeline();
    let orphan = CharacterNgramEmbedder::default().embed("orphan table");
    pipeline
        .index
        .upsert_datapoints(&[table_search_core::DataPoint::new("orphan", orphan)])
        .await
        .expect("upsert");

    let results = pipeline
        .searcher
        .find_matches(&["orphan table".to_string()], &SearchParameters::default())
        .await
        .expect("search");
    assert!(results[0].matches.is_empty());
}
