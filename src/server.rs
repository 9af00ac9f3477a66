use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::conf::{Settings, SettingsHandle};
use crate::controller::{JobController, KillResult, RestoreRequest};
use crate::error::{ControlError, Result};
use crate::events::EventBus;
use crate::liveness::OsProbe;
use crate::procscan::SysinfoEnumerator;
use crate::reconciler::Reconciler;
use crate::record::{validate_subject, JobMode, JobStatus};
use crate::store::RecordStore;

#[derive(Parser, Debug)]
#[command(name = "tm-control", version)]
pub struct ServerArgs {
    /// TOML configuration file; `TM_*` environment variables override it.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, default_value = "0.0.0.0:7600")]
    bind: String,
    #[arg(long = "project-root", value_name = "DIR")]
    project_root: Option<PathBuf>,
    #[arg(long = "log-json")]
    log_json: bool,
}

pub struct AppState {
    controller: JobController,
    reconciler: Reconciler,
    started: Instant,
}

impl AppState {
    pub fn new(controller: JobController, reconciler: Reconciler) -> Self {
        Self {
            controller,
            reconciler,
            started: Instant::now(),
        }
    }
}

pub async fn run() -> Result<()> {
    let args = ServerArgs::parse();
    init_tracing(args.log_json);

    let settings = Settings::load(args.config.as_deref(), args.project_root.clone())?;
    info!(
        "Using state dir {:?}, log dir {:?}, backup script {:?}",
        settings.get_state_dir(),
        settings.get_log_dir(),
        settings.get_backup_script()
    );
    let store = Arc::new(RecordStore::new(settings.get_state_dir()));
    store.ensure_dir()?;
    if let Err(err) = tokio::fs::create_dir_all(settings.get_log_dir()).await {
        warn!("Failed to create log dir {:?}: {}", settings.get_log_dir(), err);
    }

    let settings = SettingsHandle::new(settings);
    let controller = JobController::new(
        settings.clone(),
        Arc::clone(&store),
        Arc::new(OsProbe),
        EventBus::new(),
    );
    let reconciler = Reconciler::new(controller.clone(), Arc::new(SysinfoEnumerator));
    match reconciler.run() {
        Ok(report) => info!(
            "Startup reconcile: {} marked failed, {} adopted",
            report.marked_failed.len(),
            report.adopted.len()
        ),
        Err(err) => warn!("Startup reconcile failed: {}", err),
    }
    reload_on_hangup(settings, args.config.clone(), args.project_root.clone());

    let state = Arc::new(AppState::new(controller, reconciler));
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    info!("Server listening on {}", &args.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/processes", get(processes))
        .route("/api/processes/clear", post(clear_processes))
        .route("/api/processes/{host}", delete(delete_processes))
        .route("/api/backup/{host}", post(start_backup).delete(kill_backup))
        .route("/api/backup/{host}/kill", post(kill_backup))
        .route("/api/restore/{host}", post(start_restore))
        .route("/api/restores", get(restores))
        .route("/api/restores/clear", post(clear_restores))
        .route("/api/restores/{id}", delete(delete_restore))
        .route("/api/running/{host}", get(running))
        .route("/api/logs/{host}", get(backup_log))
        .route("/api/restore-log/{name}", get(restore_log))
        .route("/api/reconcile", post(reconcile))
        .with_state(state)
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn reload_on_hangup(settings: SettingsHandle, config: Option<PathBuf>, project_root: Option<PathBuf>) {
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(err) => {
                warn!("SIGHUP reload disabled: {}", err);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match Settings::load(config.as_deref(), project_root.clone()) {
                Ok(next) => {
                    if next.get_state_dir() != settings.current().get_state_dir() {
                        warn!("State dir changes take effect after a restart");
                    }
                    settings.replace(next);
                    info!("Settings reloaded");
                }
                Err(err) => warn!("Settings reload failed, keeping current: {}", err),
            }
        }
    });
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
}

pub struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::InvalidSubject(_) | ControlError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let processes = state.controller.list();
    let running = processes
        .iter()
        .filter(|view| view.status == JobStatus::Running)
        .count();
    let backups_today = running > 0 || state.controller.has_backup_log_today();
    Json(json!({
        "status": "running",
        "uptime": state.started.elapsed().as_secs(),
        "hostname": System::host_name().unwrap_or_default(),
        "version": env!("CARGO_PKG_VERSION"),
        "running": running,
        "processes": processes,
        "backups_today": backups_today,
    }))
}

async fn processes(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.controller.list()))
}

async fn clear_processes(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "cleared": state.controller.clear_finished() }))
}

async fn delete_processes(State(state): State<Arc<AppState>>, Path(host): Path<String>) -> ApiResult {
    let cleared = state.controller.delete_finished(&host)?;
    Ok(Json(json!({ "cleared": cleared, "hostname": host })))
}

#[derive(Debug, Default, Deserialize)]
struct BackupQuery {
    mode: Option<String>,
}

async fn start_backup(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
    Query(query): Query<BackupQuery>,
) -> ApiResult {
    let mode = match query.mode.as_deref().map(str::trim).filter(|mode| !mode.is_empty()) {
        None => JobMode::Full,
        Some(value) => JobMode::parse(value).ok_or_else(|| {
            ControlError::InvalidRequest(format!("unknown mode {value:?}"))
        })?,
    };
    let handle = state.controller.launch(&host, mode)?;
    Ok(Json(json!({
        "status": "started",
        "hostname": handle.subject,
        "key": handle.key,
        "pid": handle.pid,
    })))
}

async fn kill_backup(State(state): State<Arc<AppState>>, Path(host): Path<String>) -> ApiResult {
    match state.controller.kill(&host)? {
        KillResult::Killed { key, pid } => Ok(Json(json!({
            "status": "killed",
            "hostname": host,
            "key": key,
            "pid": pid,
        }))),
        KillResult::NotFound => {
            Err(ControlError::NotFound(format!("No running backup found for {host}")).into())
        }
    }
}

async fn start_restore(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult {
    let handle = state.controller.launch_restore(&host, &request)?;
    Ok(Json(json!({
        "status": "started",
        "hostname": handle.subject,
        "id": handle.key,
        "pid": handle.pid,
    })))
}

async fn restores(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.controller.list_restores()))
}

async fn clear_restores(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "cleared": state.controller.clear_restores() }))
}

async fn delete_restore(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    state.controller.delete_restore(&id)?;
    Ok(Json(json!({ "status": "deleted", "id": id })))
}

async fn running(State(state): State<Arc<AppState>>, Path(host): Path<String>) -> ApiResult {
    validate_subject(&host)?;
    Ok(Json(json!({
        "hostname": host,
        "running": state.controller.is_running(&host),
    })))
}

async fn backup_log(State(state): State<Arc<AppState>>, Path(host): Path<String>) -> ApiResult {
    Ok(Json(json!(state.controller.backup_log(&host)?)))
}

async fn restore_log(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    Ok(Json(json!(state.controller.restore_log(&name)?)))
}

async fn reconcile(State(state): State<Arc<AppState>>) -> ApiResult {
    // Process scan and record walk are blocking.
    let report = tokio::task::spawn_blocking(move || state.reconciler.run())
        .await
        .map_err(|err| ControlError::Io(std::io::Error::other(err)))??;
    Ok(Json(json!(report)))
}
