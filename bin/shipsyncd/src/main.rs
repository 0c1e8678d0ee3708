//! `shipsyncd` — the shipsync backend server binary.
//!
//! Hosts the queue module behind an HTTP API. With `--public-url` set,
//! deferred work is dispatched as fire-and-forget requests against this
//! server's own `/queue/process/{guid}` endpoint so each unit runs in its
//! own request lifecycle; without it, an in-process dispatcher runs the
//! units on blocking threads.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::response::IntoResponse;
use axum::routing::get;
use clap::Parser;
use tracing::info;

use shipsync_core::Module;
use shipsync_queue::{QueueModule, RunnerConfig};

/// shipsync server.
#[derive(Parser, Debug)]
#[command(name = "shipsyncd", about = "shipsync backend server")]
struct Cli {
    /// Directory holding all persistent state.
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// SQLite database path (defaults to `{data-dir}/data.sqlite`).
    #[arg(long = "sqlite")]
    sqlite: Option<PathBuf>,

    /// Listen address.
    #[arg(long = "listen", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Externally reachable base URL; enables HTTP dispatch mode.
    #[arg(long = "public-url")]
    public_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = shipsync_core::ServiceConfig {
        data_dir: cli.data_dir.clone(),
        sqlite_path: cli.sqlite.clone(),
        listen: cli.listen.clone(),
        public_url: cli
            .public_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string()),
    };

    if let Some(dir) = &config.data_dir {
        std::fs::create_dir_all(dir)?;
    }

    let sqlite_path = config.resolve_sqlite_path();
    info!("Opening SQLite store at {}", sqlite_path.display());
    let sql: Arc<dyn shipsync_sql::SQLStore> = Arc::new(
        shipsync_sql::SqliteStore::open(&sqlite_path)
            .map_err(|e| anyhow::anyhow!("failed to open SQL store: {}", e))?,
    );

    let queue_module = match &config.public_url {
        Some(base) => {
            let endpoint = format!("{base}/queue/process");
            info!("Queue module initialized (HTTP dispatch via {endpoint})");
            QueueModule::with_http_dispatch(sql, RunnerConfig::default(), &endpoint)
                .map_err(|e| anyhow::anyhow!("failed to initialize queue module: {}", e))?
        }
        None => {
            info!("Queue module initialized (in-process dispatch)");
            QueueModule::new(sql)
                .map_err(|e| anyhow::anyhow!("failed to initialize queue module: {}", e))?
        }
    };

    // Embedding services register their task kinds here before serving:
    //     queue_module.registry().register_serde::<RefreshRatesTask>("rates.refresh");

    let app = build_router(vec![(queue_module.name(), queue_module.routes())]);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("shipsync server listening on {}", config.listen);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Mount system endpoints plus each module's routes under `/{module_name}`.
fn build_router(module_routes: Vec<(&str, Router)>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/version", get(version));

    for (name, router) in module_routes {
        app = app.nest(&format!("/{name}"), router);
    }

    app
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
    }))
}

async fn version() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": "shipsyncd",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
