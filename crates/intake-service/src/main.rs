use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use intake_core::{ClientId, ClientSummary, IntakeError, Submission};
use intake_store_sqlite::{ClientDetail, SqliteIntakeStore};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Cloneable handle the HTTP layer hands to blocking workers. Each call opens
/// its own connection-scoped store, so no database state outlives a request.
#[derive(Debug, Clone)]
struct IntakeApi {
    db_path: PathBuf,
}

impl IntakeApi {
    fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteIntakeStore> {
        SqliteIntakeStore::open(&self.db_path)
    }

    fn migrate(&self) -> Result<()> {
        self.open_store()?.migrate()
    }

    fn save_submission(&self, submission: &Submission) -> Result<ClientId> {
        self.open_store()?.save_submission(submission)
    }

    fn list_clients(&self) -> Result<Vec<ClientSummary>> {
        self.open_store()?.list_clients()
    }

    fn get_client(&self, client_id: ClientId) -> Result<ClientDetail> {
        self.open_store()?.get_client_with_answers(client_id)
    }
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: IntakeApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct SaveResponse {
    status: &'static str,
    message: &'static str,
    client_id: ClientId,
}

#[derive(Debug, Clone, Serialize)]
struct ClientsResponse {
    status: &'static str,
    clients: Vec<ClientSummary>,
}

#[derive(Debug, Clone, Serialize)]
struct ClientResponse {
    status: &'static str,
    client: ClientSummary,
    data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorEnvelope {
    status: &'static str,
    message: String,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    client_not_found_total: AtomicU64,
    storage_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    client_not_found_total: u64,
    storage_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "intake-service")]
#[command(about = "HTTP service for the client intake store")]
struct Args {
    #[arg(long, default_value = "./intake.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:5000")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ErrorEnvelope {
            status: "error",
            message: self.message,
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
        }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(rejection.status(), "invalid_json", rejection.body_text())
    }

    fn validation_with_telemetry(&self, err: &IntakeError) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        match err.downcast_ref::<IntakeError>() {
            Some(IntakeError::Validation(_)) => {
                return Self::failure(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
            }
            Some(IntakeError::ClientNotFound(_)) => {
                return Self::failure(StatusCode::NOT_FOUND, "client_not_found", "Client not found")
            }
            None => {}
        }

        let normalized = format!("{err:#}").to_ascii_lowercase();
        if normalized.contains("sqlite")
            || normalized.contains("database")
            || normalized.contains("disk")
            || normalized.contains("locked")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                err.to_string(),
            );
        }

        Self::failure(default_status, default_code, err.to_string())
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(IntakeApi) -> Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                tracing::warn!(
                    operation = operation_label,
                    code = failure.code,
                    "request failed: {err:#}"
                );
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "client_not_found" => {
                self.client_not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "storage_unavailable" => {
                self.storage_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            client_not_found_total: self.client_not_found_total.load(Ordering::Relaxed),
            storage_unavailable_total: self.storage_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route("/api/save", post(save))
        .route("/api/clients", get(clients))
        .route("/api/client/:client_id", get(client_detail))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let api = IntakeApi::new(args.db.clone());
    api.migrate().context("failed to prepare database schema")?;
    tracing::info!(db = %args.db.display(), "database ready");

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "intake service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/html; charset=utf-8")],
        INDEX_HTML,
    )
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn save(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SaveResponse>, ServiceFailure> {
    let Json(raw) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let submission =
        Submission::from_value(raw).map_err(|err| state.validation_with_telemetry(&err))?;

    let client_id = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "save_submission",
            move |api| api.save_submission(&submission),
        )
        .await?;

    Ok(Json(SaveResponse {
        status: "success",
        message: "Data saved successfully",
        client_id,
    }))
}

async fn clients(
    State(state): State<ServiceState>,
) -> Result<Json<ClientsResponse>, ServiceFailure> {
    let clients = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "read_failed",
            "list_clients",
            |api| api.list_clients(),
        )
        .await?;

    Ok(Json(ClientsResponse {
        status: "success",
        clients,
    }))
}

async fn client_detail(
    State(state): State<ServiceState>,
    Path(client_id): Path<i64>,
) -> Result<Json<ClientResponse>, ServiceFailure> {
    let detail = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "read_failed",
            "get_client",
            move |api| api.get_client(ClientId(client_id)),
        )
        .await?;

    Ok(Json(ClientResponse {
        status: "success",
        client: detail.client,
        data: detail.answers,
    }))
}
