use axum::http::{HeaderValue, Method};
use orchestrator::api::{self, ApiState};
use orchestrator::app_state::AppState;
use orchestrator::config::{self, Config};
use orchestrator::run::{InMemoryRunStore, PlanningExecutor, RunStore, SqliteRunStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const RETENTION_SWEEP_EVERY: Duration = Duration::from_secs(60);

fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    let mut current = cwd.clone();
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            match dotenvy::from_path(&candidate) {
                Ok(_) => tracing::info!(path = %candidate.display(), "Loaded environment from .env"),
                Err(e) => tracing::warn!(
                    path = %candidate.display(),
                    error = %e,
                    "Failed to load .env file"
                ),
            }
            return;
        }
        if !current.pop() {
            break;
        }
    }

    tracing::info!(
        cwd = %cwd.display(),
        "No .env file found in current directory or ancestors; using process environment only"
    );
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origins.is_empty() {
        return base.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(allowed))
}

/// Requests are served on a current-thread runtime; runs execute on a
/// separate multi-threaded runtime owned by `main`.
fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchestrator=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    load_env_file();
    let config = Config::from_env()?;

    let worker_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.run_workers.max(1))
        .thread_name("run-worker")
        .enable_all()
        .build()?;
    let io_runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let result = io_runtime.block_on(serve(config, worker_runtime.handle().clone()));

    drop(io_runtime);
    worker_runtime.shutdown_timeout(Duration::from_secs(5));
    result
}

async fn serve(config: Config, worker_runtime: tokio::runtime::Handle) -> anyhow::Result<()> {
    tracing::info!(port = config.port, "Starting crew run orchestrator");

    let store: Arc<dyn RunStore> = match &config.database_url {
        Some(url) => Arc::new(SqliteRunStore::connect(url).await?),
        None => {
            tracing::info!("No ORCHESTRATOR_DATABASE_URL set; using in-memory run store");
            Arc::new(InMemoryRunStore::new())
        }
    };

    if let Some(path) = &config.crews_file {
        let crews = config::load_crews(path)?;
        for crew in &crews {
            store.put_crew(crew).await?;
        }
        tracing::info!(path = %path.display(), count = crews.len(), "Seeded crews");
    }

    let app_state = Arc::new(
        AppState::start(
            config.stack(),
            store,
            Arc::new(PlanningExecutor::default()),
            &worker_runtime,
        )
        .await?,
    );
    let sweep = app_state.spawn_retention_sweep(config.event_log_retention, RETENTION_SWEEP_EVERY);

    let app = api::router()
        .with_state(ApiState {
            app_state: Arc::clone(&app_state),
        })
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "Orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep.abort();
    app_state.shutdown().await;
    tracing::info!("Orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
