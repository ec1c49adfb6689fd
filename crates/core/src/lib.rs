pub mod admin;
pub mod batcher;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod formatter;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod stores;
pub mod tokenizer;
pub mod traits;

pub use admin::{deployment_state_of, wait_for_operation, DeploymentState, IndexAdmin, OperationSource};
pub use batcher::EmbeddingBatcher;
pub use config::{
    AdminConfig, EmbeddingConfig, GcpConfig, MetadataConfig, PipelineConfig, SearchParameters,
    VectorSearchConfig,
};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingModel, VertexEmbeddingModel, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbeddingError, SearchError};
pub use formatter::{
    calculate_statistics, filter_results, group_by_range, to_detailed, to_summary_text,
    DetailedMatch, DetailedResult, MetadataView, ScoreGroup, StatisticalSummary,
};
pub use ingest::{content_checksum, discover_text_files, load_text_units, IngestReport, Ingestor};
pub use models::{
    DataPoint, IndexStats, MetadataRecord, Neighbor, QueryResult, Restriction, SearchMatch,
    TextUnit, UpdateTarget,
};
pub use orchestrator::{SearchResponse, SemanticSearcher};
pub use retry::{Backoff, RetryPolicy};
pub use stores::{FirestoreStore, InMemoryMetadataStore, InMemoryVectorIndex, VertexVectorIndex};
pub use tokenizer::{EncodingType, TextTokenizer};
pub use traits::{MetadataStore, VectorIndex};
