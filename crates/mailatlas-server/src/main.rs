mod api;

use std::sync::Arc;
use std::{env, net::SocketAddr};

use mailatlas_core::{
    Config, Database, GenaiLLMClient, JobStore, JobSupervisor, MockMailSource, NoopEventSink,
    PipelineContext, PipelineExecutor, PipelineSettings, SupervisorConfig, init_telemetry,
    migrations, run_supervisor,
};
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub(crate) struct AppState {
    pub db: Database,
    pub supervisor: Arc<JobSupervisor>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;

    let llm = Arc::new(GenaiLLMClient::new(db.clone(), config.model.clone()));
    let ctx = PipelineContext {
        db: db.clone(),
        // TODO: replace with the Gmail-backed source once the OAuth adapter lands.
        mail_source: Arc::new(MockMailSource::new()),
        llm,
        enricher: None,
        events: Arc::new(NoopEventSink),
        settings: PipelineSettings::from_config(&config),
    };
    let executor = Arc::new(PipelineExecutor::new(ctx));

    let supervisor = Arc::new(JobSupervisor::new(
        JobStore::new(db.clone()),
        Arc::new(NoopEventSink),
    ));

    let shutdown = CancellationToken::new();
    let supervisor_config = SupervisorConfig {
        poll_interval: std::time::Duration::from_secs(config.job.poll_interval_s.max(1)),
        ..SupervisorConfig::default()
    };
    let loop_handle = tokio::spawn(run_supervisor(
        supervisor.clone(),
        executor,
        supervisor_config,
        shutdown.child_token(),
    ));

    let state = AppState {
        db: db.clone(),
        supervisor,
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("mailatlas listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(err) = loop_handle.await {
        warn!("supervisor task join error: {err}");
    }
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api::router())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: String,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_status = match state.db.health_check().await {
        Ok(_) => "ok",
        Err(_) => "unhealthy",
    };

    let status = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if db_status == "ok" {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_status.to_string(),
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
    }

    shutdown.cancel();
}
