use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use querybridge_core::{
    BackendKind, Connector, ConnectorPool, DatasetSchema, ElasticsearchConfig, ElasticsearchConnector,
    EngineConfig, QueryEngine, QueryRequest, RawColumn,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "querybridge")]
#[command(about = "Compile and run pushdown queries against SQL, search and document backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct ClusterArgs {
    /// Elasticsearch base URL
    #[arg(long, env = "QUERYBRIDGE_ES_URL", default_value = "http://localhost:9200")]
    url: String,
    /// Username for basic authentication
    #[arg(short, long)]
    user: Option<String>,
    /// Password for basic authentication
    #[arg(short = 'P', long, env = "QUERYBRIDGE_ES_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the canonical type of native column types
    Types {
        #[arg(long)]
        backend: BackendKind,
        /// Native type names, e.g. `varchar(255)` or `timestamp with time zone`
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Compile a request offline and print the native query
    ///
    /// The schema file is a JSON array of
    /// `{"dataset", "column", "native_type", "has_keyword"}` objects.
    Explain {
        #[arg(long)]
        backend: BackendKind,
        #[arg(long)]
        schema: PathBuf,
        /// Request JSON: `{"id", "columns", "filters", "pushdown"}`
        #[arg(long)]
        request: PathBuf,
    },
    /// List the datasets of an Elasticsearch cluster
    Datasets {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Run a request against an Elasticsearch cluster, printing one JSON array per row
    Query {
        #[command(flatten)]
        cluster: ClusterArgs,
        #[arg(long)]
        request: PathBuf,
        /// Rows or buckets per page (overrides QUERYBRIDGE_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

fn init_logging() {
    let log_format = std::env::var("QUERYBRIDGE_LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    }
}

fn read_request(path: &Path) -> Result<QueryRequest> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(QueryRequest::from_json(&bytes)?)
}

fn read_columns(path: &Path) -> Result<Vec<RawColumn>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn type_report(engine: &QueryEngine, backend: BackendKind, names: &[String]) -> Result<Vec<String>> {
    let mapper = engine.registry().get(backend)?;
    Ok(names
        .iter()
        .map(|name| format!("{name}\t{}", mapper.type_mapper().to_canonical(name)))
        .collect())
}

fn explain(
    engine: &QueryEngine,
    backend: BackendKind,
    columns: Vec<RawColumn>,
    request: &QueryRequest,
) -> Result<String> {
    let compiler = engine.registry().get(backend)?;
    let schema = DatasetSchema::from_columns(columns, compiler.type_mapper());
    let compiled = engine.compile_with_schema(backend, request, &schema)?;
    let first_page = compiler.page_query(&compiled, None, engine.config().batch_size);
    Ok(format!(
        "backend: {}\nshape: {:?}\npaging: {:?}\ngroups: {}\n\n{}",
        compiled.backend, compiled.shape, compiled.strategy, compiled.group_count, first_page
    ))
}

async fn connect(pool: &ConnectorPool, cluster: &ClusterArgs) -> Result<Arc<dyn Connector>> {
    let mut config = ElasticsearchConfig::new(cluster.url.clone());
    if let Some(user) = &cluster.user {
        config = config.credentials(user.clone(), cluster.password.clone().unwrap_or_default());
    }
    let identity = config.identity();
    let connector = pool
        .get_or_connect(&identity, move || {
            Ok(Arc::new(ElasticsearchConnector::new(config)?) as Arc<dyn Connector>)
        })
        .await?;
    Ok(connector)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;
    if let Commands::Query {
        batch_size: Some(size),
        ..
    } = &cli.command
    {
        config.batch_size = *size;
    }
    let engine = QueryEngine::new(config)?;

    match &cli.command {
        Commands::Types { backend, names } => {
            for line in type_report(&engine, *backend, names)? {
                println!("{line}");
            }
        }
        Commands::Explain {
            backend,
            schema,
            request,
        } => {
            let columns = read_columns(schema)?;
            let request = read_request(request)?;
            println!("{}", explain(&engine, *backend, columns, &request)?);
        }
        Commands::Datasets { cluster } => {
            let pool = ConnectorPool::from_config(engine.config());
            let connector = connect(&pool, cluster).await?;
            let datasets = engine.datasets(connector.as_ref()).await;
            pool.close_all().await;
            println!("{}", serde_json::to_string_pretty(&datasets?)?);
        }
        Commands::Query {
            cluster, request, ..
        } => {
            let request = read_request(request)?;
            let pool = ConnectorPool::from_config(engine.config());
            let connector = connect(&pool, cluster).await?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupted, cancelling query");
                    on_interrupt.cancel();
                }
            });

            let outcome = run_query(&engine, &request, connector, cancel).await;
            pool.close_all().await;
            let rows = outcome?;
            tracing::info!(rows, "query finished");
        }
    }

    Ok(())
}

async fn run_query(
    engine: &QueryEngine,
    request: &QueryRequest,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
) -> Result<u64> {
    let mut rows = engine.query(request, connector, cancel).await?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut count = 0u64;
    while let Some(row) = rows.next().await {
        let row = row.map_err(|e| anyhow!("query failed after {count} rows: {e}"))?;
        serde_json::to_writer(&mut out, &row)?;
        out.write_all(b"\n")?;
        count += 1;
    }
    out.flush()?;
    Ok(count)
}
