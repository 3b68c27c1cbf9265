use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, Response, StatusCode, header::CONTENT_TYPE},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
};
use protocol::{Message, RPC_HEALTH_PATH, RPC_MESSAGE_PATH, RpcCall, RpcReply};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    audit::{AuditCode, AuditEntry, AuditLevel, NO_CORRELATION, SharedAudit},
    credentials::SharedCredentials,
    dispatcher::Dispatcher,
    logging::{Category, method_label, status_label},
};

pub const ENVELOPE_ERROR: &str = "Error al deserializar el mensaje.";
pub const INVALID_CREDENTIALS: &str = "Credenciales inválidas.";

#[derive(Clone)]
pub struct SharedState {
    pub dispatcher: Arc<Dispatcher>,
    pub credentials: SharedCredentials,
    pub audit: SharedAudit,
    runtime_metrics: Arc<RuntimeMetrics>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub device_connected: bool,
    pub recording_active: bool,
    pub remote_access: bool,
    pub uptime_seconds: u64,
}

impl SharedState {
    pub fn new(dispatcher: Dispatcher, credentials: SharedCredentials, audit: SharedAudit) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            credentials,
            audit,
            runtime_metrics: Arc::new(RuntimeMetrics::default()),
        }
    }

    /// Handles one serialized envelope end to end. Every failure is
    /// reported in the returned text.
    pub async fn receive(&self, raw: &str) -> String {
        let metrics = &self.runtime_metrics;
        metrics.rpc_calls_total.fetch_add(1, Ordering::Relaxed);

        let message = match Message::deserialize(raw) {
            Ok(message) => message,
            Err(err) => {
                metrics
                    .rpc_bad_envelope_total
                    .fetch_add(1, Ordering::Relaxed);
                self.audit.record(AuditEntry::event(
                    AuditLevel::Error,
                    format!("Error al deserializar el mensaje: {err}"),
                    AuditCode::BadRequest,
                    NO_CORRELATION,
                ));
                return ENVELOPE_ERROR.to_string();
            }
        };

        let Some(role) = self
            .credentials
            .validate(&message.user, &message.credential)
        else {
            metrics
                .rpc_auth_failures_total
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                "{} login failed user={} id={}",
                Category::Access,
                message.user,
                message.id
            );
            self.audit
                .record(AuditEntry::login(&message.user, false, message.id));
            return INVALID_CREDENTIALS.to_string();
        };
        self.audit
            .record(AuditEntry::login(&message.user, true, message.id));

        let result = self.dispatcher.handle(&message, role).await;
        metrics
            .rpc_dispatched_total
            .fetch_add(1, Ordering::Relaxed);
        result
    }

    pub async fn health_status(&self) -> HealthStatus {
        let snapshot = self.dispatcher.snapshot();
        HealthStatus {
            status: "ok".to_string(),
            device_connected: snapshot.device_connected,
            recording_active: snapshot.recording.active,
            remote_access: snapshot.remote_access,
            uptime_seconds: self.runtime_metrics.started_at.elapsed().as_secs(),
        }
    }

    pub async fn metrics_text(&self) -> String {
        let health = self.health_status().await;
        let metrics = &self.runtime_metrics;

        format!(
            concat!(
                "rc_gateway_uptime_seconds {}\n",
                "rc_gateway_device_connected {}\n",
                "rc_gateway_recording_active {}\n",
                "rc_gateway_remote_access_enabled {}\n",
                "rc_gateway_rpc_calls_total {}\n",
                "rc_gateway_rpc_bad_envelope_total {}\n",
                "rc_gateway_rpc_auth_failures_total {}\n",
                "rc_gateway_rpc_dispatched_total {}\n"
            ),
            health.uptime_seconds,
            u8::from(health.device_connected),
            u8::from(health.recording_active),
            u8::from(health.remote_access),
            metrics.rpc_calls_total.load(Ordering::Relaxed),
            metrics.rpc_bad_envelope_total.load(Ordering::Relaxed),
            metrics.rpc_auth_failures_total.load(Ordering::Relaxed),
            metrics.rpc_dispatched_total.load(Ordering::Relaxed),
        )
    }
}

struct RuntimeMetrics {
    started_at: Instant,
    rpc_calls_total: AtomicU64,
    rpc_bad_envelope_total: AtomicU64,
    rpc_auth_failures_total: AtomicU64,
    rpc_dispatched_total: AtomicU64,
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            rpc_calls_total: AtomicU64::new(0),
            rpc_bad_envelope_total: AtomicU64::new(0),
            rpc_auth_failures_total: AtomicU64::new(0),
            rpc_dispatched_total: AtomicU64::new(0),
        }
    }
}

pub fn build_rpc_app(state: SharedState) -> Router {
    Router::new()
        .route(RPC_MESSAGE_PATH, post(message_handler))
        .route(RPC_HEALTH_PATH, get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(access_log_middleware))
        .with_state(state)
}

async fn message_handler(
    State(state): State<SharedState>,
    Json(call): Json<RpcCall>,
) -> impl IntoResponse {
    let result = state.receive(&call.message).await;
    (StatusCode::OK, Json(RpcReply { result }))
}

async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let status = state.health_status().await;
    (StatusCode::OK, Json(status))
}

async fn metrics_handler(State(state): State<SharedState>) -> Response<Body> {
    let metrics = state.metrics_text().await;
    let mut response = Response::new(Body::from(metrics));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

async fn access_log_middleware(request: Request, next: Next) -> Response<Body> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();
    let response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_millis();
    let status = response.status();

    info!(
        "{} {} {} {} {}ms",
        Category::Access,
        method_label(method.as_str()),
        status_label(status.as_u16()),
        uri,
        elapsed_ms
    );

    response
}
