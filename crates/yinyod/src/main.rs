//! yinyod - Yinyo run orchestrator daemon
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use yinyod::app::App;
use yinyod::authz::AuthzClient;
use yinyod::blobstore::{BlobStore, ObjectBlobStore};
use yinyod::dispatcher::{FakeDispatcher, JobDispatcher, KubernetesDispatcher};
use yinyod::keyvaluestore::{KeyValueStore, MemoryKeyValueStore, RedisKeyValueStore};
use yinyod::server::{start_server, AppState, ServerConfig};
use yinyod::stream::{EventStream, MemoryEventStream, RedisEventStream};

/// Which set of backends the daemon binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Backends {
    /// Everything in process memory. For development and tests only: runs
    /// are never actually dispatched.
    Memory,
    /// MinIO + Redis + Kubernetes, for the cluster deployment.
    Cluster,
}

/// Yinyo run orchestrator daemon.
#[derive(Debug, Parser)]
#[command(name = "yinyod")]
#[command(about = "Runs scrapers in containers and streams their output")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "YINYO_ADDR", default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// Backend set to use
    #[arg(long, env = "YINYO_BACKENDS", value_enum, default_value = "cluster")]
    backends: Backends,

    /// Run time applied when a start request does not ask for one (seconds)
    #[arg(long, env = "YINYO_DEFAULT_MAX_RUN_TIME", default_value_t = 3600)]
    default_max_run_time: i64,

    /// Hard ceiling on a run's max_run_time (seconds)
    #[arg(long, env = "YINYO_MAX_RUN_TIME", default_value_t = 86400)]
    max_run_time: i64,

    /// Memory applied when a start request does not ask for any (bytes)
    #[arg(long, env = "YINYO_DEFAULT_MEMORY", default_value_t = 1_073_741_824)]
    default_memory: i64,

    /// Hard ceiling on a run's memory (bytes)
    #[arg(long, env = "YINYO_MAX_MEMORY", default_value_t = 1_610_612_736)]
    max_memory: i64,

    /// Image runs are executed in
    #[arg(
        long,
        env = "YINYO_RUNNER_IMAGE",
        default_value = "openaustralia/yinyo-scraper:v1"
    )]
    runner_image: String,

    /// Kubernetes namespace for run jobs and secrets
    #[arg(long, env = "YINYO_NAMESPACE", default_value = "yinyo-runs")]
    namespace: String,

    /// Redis connection URL (key-value store and event stream)
    #[arg(long, env = "REDIS_URL", default_value = "redis://redis:6379")]
    redis_url: String,

    /// S3-compatible blob store endpoint
    #[arg(long, env = "STORE_HOST", default_value = "http://minio:9000")]
    store_host: String,

    /// Blob store bucket
    #[arg(long, env = "STORE_BUCKET", default_value = "yinyo")]
    store_bucket: String,

    /// Blob store access key
    #[arg(long, env = "STORE_ACCESS_KEY", default_value = "")]
    store_access_key: String,

    /// Blob store secret key
    #[arg(long, env = "STORE_SECRET_KEY", default_value = "")]
    store_secret_key: String,

    /// Optional authorization hook endpoint; when unset everything is
    /// allowed
    #[arg(long, env = "YINYO_AUTHZ_URL")]
    authz_url: Option<String>,
}

async fn build_app(cli: &Cli) -> eyre::Result<App> {
    let http = reqwest::Client::new();
    let authz = AuthzClient::new(cli.authz_url.clone(), http);

    let app = match cli.backends {
        Backends::Memory => App::new(
            Arc::new(ObjectBlobStore::in_memory()),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(MemoryEventStream::new()),
            Arc::new(FakeDispatcher::new()),
            authz,
        ),
        Backends::Cluster => {
            let blob_store: Arc<dyn BlobStore> = Arc::new(ObjectBlobStore::s3_compatible(
                &cli.store_host,
                &cli.store_bucket,
                &cli.store_access_key,
                &cli.store_secret_key,
            )?);
            let key_value_store: Arc<dyn KeyValueStore> =
                Arc::new(RedisKeyValueStore::connect(&cli.redis_url).await?);
            let stream: Arc<dyn EventStream> =
                Arc::new(RedisEventStream::connect(&cli.redis_url).await?);
            let dispatcher: Arc<dyn JobDispatcher> =
                Arc::new(KubernetesDispatcher::new(&cli.namespace).await?);
            App::new(blob_store, key_value_store, stream, dispatcher, authz)
        }
    };
    Ok(app)
}

fn main() -> eyre::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let app = build_app(&cli).await?;
        let state = Arc::new(AppState {
            app,
            config: ServerConfig {
                default_max_run_time: cli.default_max_run_time,
                max_run_time: cli.max_run_time,
                default_memory: cli.default_memory,
                max_memory: cli.max_memory,
                runner_image: cli.runner_image.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        });

        info!(backends = ?cli.backends, "starting yinyod");
        tokio::select! {
            result = start_server(state, cli.addr) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                Ok(())
            }
        }
    })
}
