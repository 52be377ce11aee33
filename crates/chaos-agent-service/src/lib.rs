//! HTTP adapter: a small JSON API over the lifecycle engine.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chaos_agent_core::{
    ExperimentError, ExperimentFilter, ExperimentKind, ExperimentRecord, ExperimentRun,
    ExperimentStatus, LaunchMode, SortOrder, Uid,
};
use chaos_agent_engine::{registry, Engine, FaultConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

mod tls;

pub use tls::{load_server_config, TlsOptions};

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ServiceState {
    engine: Engine,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
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
    invalid_request_total: AtomicU64,
    bad_config_total: AtomicU64,
    not_found_total: AtomicU64,
    conflict_total: AtomicU64,
    failed_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_request_total: u64,
    bad_config_total: u64,
    not_found_total: u64,
    conflict_total: u64,
    failed_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct AttackResponse {
    uid: Uid,
}

#[derive(Debug, Clone, Serialize)]
struct RecoverResponse {
    uid: Uid,
    status: ExperimentStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchParams {
    uid: Option<String>,
    status: Option<String>,
    kind: Option<String>,
    launch_mode: Option<String>,
    sort: Option<String>,
    offset: Option<u32>,
    limit: Option<u32>,
}

impl SearchParams {
    fn into_filter(self) -> Result<ExperimentFilter, ExperimentError> {
        fn parse_with<T>(
            field: &str,
            value: Option<String>,
            parse: impl Fn(&str) -> Option<T>,
        ) -> Result<Option<T>, ExperimentError> {
            value
                .filter(|raw| !raw.is_empty())
                .map(|raw| {
                    parse(&raw).ok_or_else(|| {
                        ExperimentError::BadConfig(format!("unknown {field} {raw:?}"))
                    })
                })
                .transpose()
        }

        Ok(ExperimentFilter {
            uid: self
                .uid
                .filter(|raw| !raw.is_empty())
                .map(|raw| Uid::parse(&raw))
                .transpose()?,
            status: parse_with("status", self.status, ExperimentStatus::parse)?,
            kind: parse_with("kind", self.kind, ExperimentKind::parse)?,
            launch_mode: parse_with("launch_mode", self.launch_mode, LaunchMode::parse)?,
            order: parse_with("sort", self.sort, SortOrder::parse)?.unwrap_or_default(),
            offset: self.offset,
            limit: self.limit,
        })
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl From<ExperimentError> for ServiceFailure {
    fn from(err: ExperimentError) -> Self {
        let status = match &err {
            ExperimentError::BadConfig(_) => StatusCode::BAD_REQUEST,
            ExperimentError::NotFound(_) => StatusCode::NOT_FOUND,
            ExperimentError::BadState(_) | ExperimentError::NonRecoverable(_) => {
                StatusCode::CONFLICT
            }
            ExperimentError::Transient(_) | ExperimentError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            code: err.kind_str(),
            message: err.to_string(),
        }
    }
}

impl ServiceState {
    #[must_use]
    pub fn new(engine: Engine, operation_timeout: Duration) -> Self {
        Self {
            engine,
            operation_timeout,
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn invalid_request(&self, status: StatusCode, message: String) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_failure("invalid_request", false);
        ServiceFailure {
            status,
            code: "invalid_request",
            message,
        }
    }

    fn rejected(&self, err: ExperimentError) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let failure = ServiceFailure::from(err);
        self.telemetry.record_failure(failure.code, false);
        failure
    }

    /// Runs a blocking engine call on the blocking pool, bounded by the
    /// operation timeout. A call that times out keeps running in the
    /// background; only the response gives up on it.
    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(Engine) -> Result<T, ExperimentError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let engine = self.engine.clone();
        let handle = tokio::task::spawn_blocking(move || op(engine));
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                warn!(operation = operation_label, "operation timed out");
                ServiceFailure {
                    status: StatusCode::GATEWAY_TIMEOUT,
                    code: "timeout",
                    message: format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                }
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal", false);
            ServiceFailure {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: format!("{operation_label} join failure: {err}"),
            }
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = ServiceFailure::from(err);
                self.telemetry.record_failure(failure.code, false);
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
        let counter = match code {
            "invalid_request" => &self.invalid_request_total,
            "bad_config" => &self.bad_config_total,
            "not_found" => &self.not_found_total,
            "bad_state" | "non_recoverable" => &self.conflict_total,
            "timeout" => return,
            _ => &self.failed_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_request_total: self.invalid_request_total.load(Ordering::Relaxed),
            bad_config_total: self.bad_config_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
        }
    }
}

pub fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/api/system/health", get(health))
        .route("/api/attack/:target", post(attack).delete(recover))
        .route("/api/experiments", get(search))
        .route("/api/experiments/:uid", get(experiment))
        .route("/api/experiments/:uid/runs", get(runs))
        .with_state(state)
}

/// Where and how to listen.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub addr: SocketAddr,
    pub operation_timeout: Duration,
    pub tls: Option<TlsOptions>,
}

/// Serves the API until `shutdown` resolves.
///
/// # Errors
/// Fails when the listener cannot be bound or the TLS material cannot be
/// loaded.
pub async fn serve<S>(engine: Engine, options: ServeOptions, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let router = app(ServiceState::new(engine, options.operation_timeout));
    match &options.tls {
        Some(tls) => {
            let config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(
                load_server_config(tls)?,
            ));
            let handle = axum_server::Handle::new();
            let stopper = handle.clone();
            tokio::spawn(async move {
                shutdown.await;
                stopper.graceful_shutdown(Some(Duration::from_secs(10)));
            });
            info!(addr = %options.addr, mutual = tls.ca.is_some(), "serving https");
            axum_server::bind_rustls(options.addr, config)
                .handle(handle)
                .serve(router.into_make_service())
                .await
                .context("https server failed")?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(options.addr)
                .await
                .with_context(|| format!("failed to bind {}", options.addr))?;
            info!(addr = %options.addr, "serving http");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
                .context("http server failed")?;
        }
    }
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn attack(
    State(state): State<ServiceState>,
    Path(kind): Path<String>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<AttackResponse>, ServiceFailure> {
    let Json(body) = payload
        .map_err(|rejection| state.invalid_request(rejection.status(), rejection.body_text()))?;
    let kind = ExperimentKind::parse(&kind).ok_or_else(|| {
        state.rejected(ExperimentError::BadConfig(format!(
            "unknown experiment kind {kind:?}"
        )))
    })?;
    if registry::descriptor(kind).is_none() {
        return Err(state.rejected(ExperimentError::BadConfig(format!(
            "{kind} experiments are not supported by this agent"
        ))));
    }
    let config = FaultConfig::from_json_value(kind, body).map_err(|err| state.rejected(err))?;

    let uid = state
        .run_blocking("attack", move |engine| {
            engine.execute(config, LaunchMode::Server)
        })
        .await?;
    Ok(Json(AttackResponse { uid }))
}

async fn recover(
    State(state): State<ServiceState>,
    Path(uid): Path<String>,
) -> Result<Json<RecoverResponse>, ServiceFailure> {
    let uid = Uid::parse(&uid).map_err(|err| state.rejected(err))?;
    state
        .run_blocking("recover", move |engine| engine.recover(uid))
        .await?;
    Ok(Json(RecoverResponse {
        uid,
        status: ExperimentStatus::Destroyed,
    }))
}

async fn search(
    State(state): State<ServiceState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<Vec<ExperimentRecord>>, ServiceFailure> {
    let Query(params) = params
        .map_err(|rejection| state.invalid_request(rejection.status(), rejection.body_text()))?;
    let filter = params.into_filter().map_err(|err| state.rejected(err))?;
    let records = state
        .run_blocking("search", move |engine| engine.search(&filter))
        .await?;
    Ok(Json(records))
}

async fn experiment(
    State(state): State<ServiceState>,
    Path(uid): Path<String>,
) -> Result<Json<ExperimentRecord>, ServiceFailure> {
    let uid = Uid::parse(&uid).map_err(|err| state.rejected(err))?;
    let record = state
        .run_blocking("experiment", move |engine| engine.get(uid))
        .await?;
    Ok(Json(record))
}

async fn runs(
    State(state): State<ServiceState>,
    Path(uid): Path<String>,
) -> Result<Json<Vec<ExperimentRun>>, ServiceFailure> {
    let uid = Uid::parse(&uid).map_err(|err| state.rejected(err))?;
    let runs = state
        .run_blocking("runs", move |engine| engine.runs(uid))
        .await?;
    Ok(Json(runs))
}
