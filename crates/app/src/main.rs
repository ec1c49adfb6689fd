use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use table_search_core::{
    load_text_units, AdminConfig, CharacterNgramEmbedder, EmbeddingBatcher, EmbeddingConfig,
    EmbeddingModel, EncodingType, FirestoreStore, GcpConfig, InMemoryMetadataStore,
    InMemoryVectorIndex, IndexAdmin, Ingestor, MetadataConfig, MetadataStore, PipelineConfig,
    RetryPolicy, SearchParameters, SemanticSearcher, TextUnit, VectorIndex, VectorSearchConfig,
    VertexEmbeddingModel, VertexVectorIndex,
};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "table-search", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Google Cloud project id
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT", default_value = "")]
    project: String,

    /// Google Cloud region
    #[arg(long, env = "GOOGLE_CLOUD_REGION", default_value = "asia-northeast1")]
    region: String,

    /// OAuth access token, e.g. from `gcloud auth print-access-token`
    #[arg(long, env = "GOOGLE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Override for the Vertex AI API base URL
    #[arg(long, env = "AIPLATFORM_API_BASE")]
    aiplatform_base: Option<String>,

    /// Firestore API base URL
    #[arg(long, env = "FIRESTORE_API_BASE", default_value = "https://firestore.googleapis.com")]
    firestore_base: String,

    /// Vector index resource name
    #[arg(long, env = "VECTOR_SEARCH_INDEX", default_value = "")]
    index: String,

    /// Index endpoint resource name
    #[arg(long, env = "VECTOR_SEARCH_INDEX_ENDPOINT", default_value = "")]
    index_endpoint: String,

    /// Public domain of the index endpoint
    #[arg(long, env = "VECTOR_SEARCH_PUBLIC_DOMAIN", default_value = "")]
    public_endpoint_domain: String,

    /// Id of the deployed index on the endpoint
    #[arg(long, env = "VECTOR_SEARCH_DEPLOYED_INDEX_ID", default_value = "table_metadata_index_deployed")]
    deployed_index_id: String,

    /// Firestore database id
    #[arg(long, env = "FIRESTORE_DATABASE", default_value = "database-test-001")]
    database: String,

    /// Firestore collection holding metadata records
    #[arg(long, env = "FIRESTORE_COLLECTION", default_value = "table_metadata")]
    collection: String,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    /// Also write logs to `semantic_search_<timestamp>.log` in this folder
    #[arg(long, env = "TABLE_SEARCH_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Args)]
struct EmbeddingArgs {
    /// Embedding model name
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-multilingual-embedding-002")]
    model: String,

    /// Token encoding used for validation (cl100k_base, p50k_base, r50k_base)
    #[arg(long, default_value = "cl100k_base")]
    encoding: String,

    /// Maximum tokens per text
    #[arg(long, default_value = "2042")]
    max_tokens: usize,

    /// Texts per embedding request
    #[arg(long, default_value = "10")]
    batch_size: usize,

    /// Attempts per embedding request
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Seconds between attempts
    #[arg(long, default_value = "1")]
    retry_delay_secs: u64,

    /// Concurrent embedding requests; defaults to min(32, cpus + 4)
    #[arg(long)]
    max_workers: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Embed texts and store them in the index and the metadata store.
    Ingest {
        /// Folder with .txt/.md files, searched recursively.
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Inline text to ingest; may be repeated.
        #[arg(long)]
        text: Vec<String>,
    },
    /// Find the tables most similar to each question.
    Search {
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Remove data points from the index. Metadata is kept.
    Remove {
        /// Data point id; may be repeated.
        #[arg(long = "id", required = true)]
        ids: Vec<String>,
    },
    /// Show index statistics.
    Stats,
    /// Create an index and a public endpoint, then deploy the index.
    Setup {
        #[arg(long, default_value = "table_metadata_index")]
        display_name: String,
        /// Embedding dimension of the index.
        #[arg(long, default_value = "768")]
        dimension: usize,
    },
    /// Show whether the configured index is deployed on its endpoint.
    Status,
    /// Inspect or edit metadata records.
    Metadata {
        #[command(subcommand)]
        action: MetadataAction,
    },
    /// Ingest a folder into in-process stores with the offline n-gram
    /// embedder, then search it.
    Local {
        #[arg(long)]
        folder: PathBuf,
        #[command(flatten)]
        query: QueryArgs,
    },
}

#[derive(Args)]
struct QueryArgs {
    /// Question to search for; may be repeated.
    #[arg(long = "question", required = true)]
    questions: Vec<String>,
    /// Neighbors per question.
    #[arg(long, default_value = "10")]
    top_k: usize,
    /// Minimum similarity score in [0, 1].
    #[arg(long, default_value = "0.0")]
    min_score: f64,
    /// Skip score statistics.
    #[arg(long, default_value_t = false)]
    no_stats: bool,
    /// Leave metadata out of the detailed results.
    #[arg(long, default_value_t = false)]
    no_metadata: bool,
    /// Matches per question shown in the summary.
    #[arg(long, default_value = "5")]
    max_summary_matches: usize,
    /// Print the full response as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Subcommand)]
enum MetadataAction {
    Get {
        id: String,
    },
    /// Merge fields into a record, e.g. `--set owner=sales --set rows=42`.
    Update {
        id: String,
        #[arg(long = "set", required = true)]
        fields: Vec<String>,
    },
}

impl Cli {
    fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let encoding: EncodingType = self.embedding.encoding.parse()?;
        let mut embedding = EmbeddingConfig {
            model_name: self.embedding.model.clone(),
            encoding,
            max_tokens: self.embedding.max_tokens,
            batch_size: self.embedding.batch_size,
            retry: RetryPolicy::fixed(
                self.embedding.max_retries,
                Duration::from_secs(self.embedding.retry_delay_secs),
            ),
            ..EmbeddingConfig::default()
        };
        if let Some(workers) = self.embedding.max_workers {
            embedding.max_workers = workers;
        }

        Ok(PipelineConfig {
            gcp: GcpConfig {
                project_id: self.project.clone(),
                region: self.region.clone(),
                access_token: self.access_token.clone(),
                aiplatform_base: self.aiplatform_base.clone(),
                firestore_base: self.firestore_base.clone(),
            },
            embedding,
            vector_search: VectorSearchConfig {
                index: self.index.clone(),
                index_endpoint: self.index_endpoint.clone(),
                public_endpoint_domain: self.public_endpoint_domain.clone(),
                deployed_index_id: self.deployed_index_id.clone(),
            },
            metadata: MetadataConfig {
                database_id: self.database.clone(),
                collection: self.collection.clone(),
            },
            admin: AdminConfig::default(),
        })
    }
}

impl QueryArgs {
    fn parameters(&self) -> SearchParameters {
        SearchParameters {
            num_results: self.top_k,
            min_similarity_score: self.min_score,
            include_metadata: !self.no_metadata,
            compute_statistics: !self.no_stats,
            max_summary_matches: self.max_summary_matches,
        }
    }
}

fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let file_name = format!("semantic_search_{}.log", Utc::now().format("%Y%m%d_%H%M%S"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter()))
        .with(file_layer)
        .init();

    Ok(guard)
}

struct OnlineServices {
    index: Arc<VertexVectorIndex>,
    metadata: Arc<FirestoreStore>,
    batcher: Arc<EmbeddingBatcher<VertexEmbeddingModel>>,
}

impl OnlineServices {
    fn connect(config: &PipelineConfig) -> anyhow::Result<Self> {
        config.gcp.validate()?;
        let model = VertexEmbeddingModel::new(&config.gcp, config.embedding.model_name.clone());
        Ok(Self {
            index: Arc::new(VertexVectorIndex::new(&config.gcp, &config.vector_search)),
            metadata: Arc::new(FirestoreStore::new(&config.gcp, &config.metadata)),
            batcher: Arc::new(EmbeddingBatcher::new(model, config.embedding.clone())?),
        })
    }

    fn ingestor(&self) -> Ingestor<VertexVectorIndex, FirestoreStore, VertexEmbeddingModel> {
        Ingestor::new(self.index.clone(), self.metadata.clone(), self.batcher.clone())
    }

    fn searcher(&self) -> SemanticSearcher<VertexVectorIndex, FirestoreStore, VertexEmbeddingModel> {
        SemanticSearcher::new(self.index.clone(), self.metadata.clone(), self.batcher.clone())
    }
}

fn collect_units(folder: Option<&Path>, texts: &[String]) -> anyhow::Result<Vec<TextUnit>> {
    let mut units = match folder {
        Some(folder) => load_text_units(folder)?,
        None => Vec::new(),
    };
    units.extend(
        texts
            .iter()
            .enumerate()
            .map(|(position, text)| TextUnit::new(format!("text_{position}"), text.as_str())),
    );

    if units.is_empty() {
        return Err(anyhow!("nothing to ingest: pass --folder or --text"));
    }
    Ok(units)
}

async fn ingest_units<V, S, M>(ingestor: &Ingestor<V, S, M>, units: &[TextUnit]) -> anyhow::Result<()>
where
    V: VectorIndex,
    S: MetadataStore,
    M: EmbeddingModel + 'static,
{
    info!(texts = units.len(), "ingesting texts");
    let report = ingestor.ingest(units).await?;
    for (unit, id) in units.iter().zip(&report.data_point_ids) {
        println!("{id}\t{}", unit.filename);
    }
    println!(
        "{} texts ingested (dimension {}) at {}",
        report.data_point_ids.len(),
        report.dimension,
        Utc::now().to_rfc3339()
    );
    Ok(())
}

async fn run_search<V, S, M>(
    searcher: &SemanticSearcher<V, S, M>,
    query: &QueryArgs,
) -> anyhow::Result<()>
where
    V: VectorIndex,
    S: MetadataStore,
    M: EmbeddingModel + 'static,
{
    let response = searcher.search(&query.questions, &query.parameters()).await?;

    if query.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    print!("{}", response.summary);
    if let Some(statistics) = &response.statistics {
        println!(
            "scores: count={} mean={:.4} median={:.4} min={:.4} max={:.4}",
            statistics.count,
            statistics.mean,
            statistics.median,
            statistics.min_value,
            statistics.max_value
        );
        if let Some(std_dev) = statistics.std_dev {
            println!("scores: std_dev={std_dev:.4}");
        }
    }
    Ok(())
}

fn parse_fields(fields: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut parsed = Map::new();
    for field in fields {
        let (key, raw) = field
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got {field}"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        parsed.insert(key.trim().to_string(), value);
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref())?;
    let config = cli.pipeline_config()?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "table-search boot"
    );

    match &cli.command {
        Command::Ingest { folder, text } => {
            let units = collect_units(folder.as_deref(), text)?;
            let services = OnlineServices::connect(&config)?;
            ingest_units(&services.ingestor(), &units).await?;
        }
        Command::Search { query } => {
            let services = OnlineServices::connect(&config)?;
            run_search(&services.searcher(), query).await?;
        }
        Command::Remove { ids } => {
            let services = OnlineServices::connect(&config)?;
            services.ingestor().remove(ids).await?;
            println!("{} data points removed", ids.len());
        }
        Command::Stats => {
            let services = OnlineServices::connect(&config)?;
            let stats = services.index.index_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Setup {
            display_name,
            dimension,
        } => {
            config.gcp.validate()?;
            let admin = IndexAdmin::new(&config.gcp, config.admin.clone());

            let operation = admin.create_index(display_name, *dimension).await?;
            let index = admin.wait(&operation).await?;
            let index_name = resource_name(&index, "index")?;
            println!("index: {index_name}");

            let operation = admin
                .create_endpoint(&format!("{display_name}_endpoint"))
                .await?;
            let endpoint = admin.wait(&operation).await?;
            let endpoint_name = resource_name(&endpoint, "endpoint")?;
            println!("endpoint: {endpoint_name}");
            if let Some(domain) = endpoint.get("publicEndpointDomainName").and_then(Value::as_str) {
                println!("public endpoint domain: {domain}");
            }

            let operation = admin
                .deploy_index(&index_name, &endpoint_name, &config.vector_search.deployed_index_id)
                .await?;
            admin.wait(&operation).await?;
            let state = admin
                .deployment_state(&endpoint_name, &config.vector_search.deployed_index_id)
                .await?;
            println!("deployment: {state:?}");
        }
        Command::Status => {
            config.gcp.validate()?;
            let admin = IndexAdmin::new(&config.gcp, config.admin.clone());
            let state = admin
                .deployment_state(
                    &config.vector_search.index_endpoint,
                    &config.vector_search.deployed_index_id,
                )
                .await?;
            println!("deployment: {state:?}");
        }
        Command::Metadata { action } => {
            let services = OnlineServices::connect(&config)?;
            match action {
                MetadataAction::Get { id } => match services.metadata.get(id).await? {
                    Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                    None => warn!(id = %id, "no metadata record"),
                },
                MetadataAction::Update { id, fields } => {
                    services.metadata.update(id, parse_fields(fields)?).await?;
                    println!("updated {id}");
                }
            }
        }
        Command::Local { folder, query } => {
            let units = load_text_units(folder)?;
            let index = Arc::new(InMemoryVectorIndex::new());
            let metadata = Arc::new(InMemoryMetadataStore::new());
            let batcher = Arc::new(EmbeddingBatcher::new(
                CharacterNgramEmbedder::default(),
                config.embedding.clone(),
            )?);

            ingest_units(
                &Ingestor::new(index.clone(), metadata.clone(), batcher.clone()),
                &units,
            )
            .await?;
            run_search(&SemanticSearcher::new(index, metadata, batcher), query).await?;
        }
    }

    Ok(())
}

fn resource_name(response: &Value, kind: &str) -> anyhow::Result<String> {
    response
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{kind} operation finished without a resource name"))
}
