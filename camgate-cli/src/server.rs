use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;

use camgate_core::events::StatusListener;
use camgate_core::infrastructure::{ClientCallbacks, DisconnectReason, LivenessEvent};
use camgate_core::infrastructure_in_memory::{InMemoryHardware, InMemoryPriorityOracle};
use camgate_core::types::{CallerIdentity, DeviceId, DeviceInfo, DeviceStatus, EndpointId, TorchStatus};
use camgate_core::{ArbiterEngine, ArbiterError, ConnectRequest, EngineConfig};

use crate::handlers::*;

/// Upper bound on requests handled at once; each may park a blocking thread
/// for up to the connect timeout plus the teardown wait.
const MAX_IN_FLIGHT_REQUESTS: usize = 64;

pub struct AppContext {
    pub engine: ArbiterEngine,
    pub oracle: Arc<InMemoryPriorityOracle>,
    pub hardware: Arc<InMemoryHardware>,
    pub liveness: Sender<LivenessEvent>,
}

pub type AppState = Arc<AppContext>;

pub async fn run(host: &str, port: u16, config: EngineConfig, devices: Vec<DeviceInfo>) {
    let hardware = Arc::new(InMemoryHardware::new(devices));
    let oracle = Arc::new(InMemoryPriorityOracle::new());
    let engine = ArbiterEngine::builder(hardware.clone(), oracle.clone())
        .config(config)
        .build();

    if let Err(e) = engine.subscribe(Arc::new(LoggingListener)) {
        tracing::warn!(error = %e, "Could not attach status logger");
    }

    let (liveness, events) = mpsc::channel();
    if let Err(e) = engine.watch_liveness(events) {
        tracing::error!(error = %e, "Failed to start liveness watcher");
        std::process::exit(1);
    }

    let state: AppState = Arc::new(AppContext {
        engine,
        oracle,
        hardware,
        liveness,
    });

    let app = Router::new()
        // Health is always open (no auth)
        .route("/health", get(health))
        // Protected routes
        .route("/devices", get(list_devices))
        .route("/clients", get(list_clients))
        .route("/processes", post(register_process))
        .route("/processes/{pid}/died", post(process_died))
        .route("/connect", post(connect))
        .route("/sessions/{id}", delete(disconnect))
        .route("/torch", post(set_torch_mode))
        .route("/users", post(switch_users))
        .route("/dump", get(dump))
        // Simulated hardware callbacks
        .route("/hardware/devices", post(add_device))
        .route("/hardware/devices/{id}/status", post(device_status_changed))
        .route("/hardware/devices/{id}/torch", post(torch_status_changed))
        .layer(middleware::from_fn(auth_middleware))
        .layer(CorsLayer::permissive())
        .layer(ConcurrencyLimitLayer::new(MAX_IN_FLIGHT_REQUESTS))
        .with_state(state);

    let addr = format!("{}:{}", host, port);

    if std::env::var("CAMGATE_API_KEY").is_ok() {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!("No CAMGATE_API_KEY set, server is open (dev mode)");
    }

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %addr, "Failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!("camgate server starting on http://{}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Server error");
    }
}

// ─── Auth Middleware ────────────────────────────────────────────────────────

async fn auth_middleware(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected_key = match std::env::var("CAMGATE_API_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ => return Ok(next.run(request).await),
    };

    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if token == expected_key {
        Ok(next.run(request).await)
    } else {
        tracing::warn!("Unauthorized request to {}", request.uri().path());
        Err(StatusCode::UNAUTHORIZED)
    }
}

// ─── Transport Adapters ─────────────────────────────────────────────────────

/// Remote end of an HTTP caller. There is no push channel back to the
/// caller, so forced disconnects are only logged.
struct HttpRemote {
    endpoint: EndpointId,
}

impl ClientCallbacks for HttpRemote {
    fn endpoint(&self) -> EndpointId {
        self.endpoint.clone()
    }

    fn on_forced_disconnect(&self, device: &DeviceId, reason: DisconnectReason) {
        tracing::warn!(endpoint = %self.endpoint, device = %device, ?reason, "Client lost its device");
    }
}

struct LoggingListener;

impl StatusListener for LoggingListener {
    fn on_status_changed(&self, device: &DeviceId, status: DeviceStatus) {
        tracing::info!(device = %device, %status, "Device status changed");
    }

    fn on_torch_status_changed(&self, device: &DeviceId, status: TorchStatus) {
        tracing::info!(device = %device, %status, "Torch status changed");
    }
}

// ─── Response Helpers ───────────────────────────────────────────────────────

fn error_status(error: &ArbiterError) -> StatusCode {
    match error {
        ArbiterError::Busy { .. } | ArbiterError::TimedOut { .. } => StatusCode::CONFLICT,
        ArbiterError::UnknownDevice { .. } => StatusCode::NOT_FOUND,
        ArbiterError::DeviceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ArbiterError::NotAuthorized { .. } => StatusCode::FORBIDDEN,
        ArbiterError::IllegalArgument { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn engine_error(error: ArbiterError) -> Response {
    let status = error_status(&error);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %error, "Engine failure");
    }
    (
        status,
        Json(ApiResponse::<()>::err(error.to_string()).with_code(error.as_label())),
    )
        .into_response()
}

fn bad_request(msg: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::<()>::err(msg))).into_response()
}

fn respond<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(ApiResponse::ok(data))).into_response()
}

/// Runs a blocking engine call off the async workers.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&ArbiterEngine) -> Result<T, ArbiterError> + Send + 'static,
{
    let state = Arc::clone(state);
    match tokio::task::spawn_blocking(move || f(&state.engine)).await {
        Ok(result) => result.map_err(engine_error),
        Err(e) => {
            tracing::error!(error = %e, "Engine task failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<()>::err("engine task failed")),
            )
                .into_response())
        }
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::ok(HealthResponse {
        status: "ok".to_string(),
        devices: state.engine.list_devices().len(),
        active_clients: state.engine.clients().len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

async fn list_devices(State(state): State<AppState>) -> Json<ApiResponse<Vec<DeviceStatusInfo>>> {
    let devices = state
        .engine
        .list_devices()
        .into_iter()
        .map(|(id, status)| DeviceStatusInfo {
            torch: state.engine.torch_status(&id),
            id: id.to_string(),
            status,
            status_code: status.to_interface(),
        })
        .collect();
    Json(ApiResponse::ok(devices))
}

async fn list_clients(State(state): State<AppState>) -> Response {
    respond(StatusCode::OK, state.engine.clients())
}

async fn register_process(
    State(state): State<AppState>,
    Json(req): Json<RegisterProcessRequest>,
) -> Response {
    if req.pid <= 0 {
        return bad_request("pid must be greater than 0");
    }
    state.oracle.register_process(req.pid, req.priority());
    tracing::info!(pid = req.pid, score = req.score, state = req.state, "Process priority registered");
    respond(StatusCode::CREATED, req.priority())
}

async fn process_died(State(state): State<AppState>, Path(pid): Path<i32>) -> Response {
    state.oracle.forget_process(pid);
    if state.liveness.send(LivenessEvent::ProcessDied(pid)).is_err() {
        tracing::error!(pid, "Liveness watcher is gone");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::<()>::err("liveness watcher is not running")),
        )
            .into_response();
    }
    respond(StatusCode::ACCEPTED, pid)
}

async fn connect(State(state): State<AppState>, Json(req): Json<ConnectDeviceRequest>) -> Response {
    let kind = match req.validate() {
        Ok(kind) => kind,
        Err(e) => return bad_request(e),
    };

    let endpoint = req
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("http:{}", req.pid));
    let remote = Arc::new(HttpRemote {
        endpoint: EndpointId::new(endpoint),
    });
    let request = ConnectRequest::new(
        req.device_id.as_str(),
        CallerIdentity::new(req.pid, req.uid, req.package.clone()),
        remote,
    )
    .with_kind(kind);

    let wait = req.wait_ms.map(Duration::from_millis);
    let result = blocking(&state, move |engine| match wait {
        Some(budget) => engine.connect_within(request, budget),
        None => engine.connect(request),
    })
    .await;

    match result {
        Ok(connection) => {
            tracing::info!(
                device_id = %req.device_id,
                pid = req.pid,
                session = connection.handle.id(),
                evicted = connection.evicted.len(),
                "Device connected"
            );
            let status = if connection.reused {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            respond(status, connection)
        }
        Err(response) => response,
    }
}

async fn disconnect(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let session = id.clone();
    match blocking(&state, move |engine| engine.disconnect_session(&session)).await {
        Ok(()) => respond(StatusCode::OK, id),
        Err(response) => response,
    }
}

async fn set_torch_mode(State(state): State<AppState>, Json(req): Json<TorchRequest>) -> Response {
    if req.device_id.is_empty() {
        return bad_request("device_id is required");
    }
    let device = DeviceId::new(req.device_id.clone());
    let (pid, enabled) = (req.pid, req.enabled);
    match blocking(&state, move |engine| engine.set_torch_mode(&device, pid, enabled)).await {
        Ok(()) => respond(StatusCode::ACCEPTED, req.enabled),
        Err(response) => response,
    }
}

async fn switch_users(State(state): State<AppState>, Json(req): Json<SwitchUsersRequest>) -> Response {
    let users = req.user_ids;
    match blocking(&state, move |engine| engine.switch_users(&users)).await {
        Ok(disconnected) => respond(StatusCode::OK, DisconnectedResponse { disconnected }),
        Err(response) => response,
    }
}

async fn dump(State(state): State<AppState>) -> Response {
    respond(StatusCode::OK, state.engine.dump())
}

async fn add_device(State(state): State<AppState>, Json(req): Json<AddDeviceRequest>) -> Response {
    let info = match req.validate() {
        Ok(info) => info,
        Err(e) => return bad_request(e),
    };
    if state.engine.device(&info.id).is_some() {
        return bad_request(format!("Device '{}' is already known", info.id));
    }
    tracing::info!(device_id = %info.id, cost = info.resource_cost, "Simulated device plugged in");
    state.hardware.add_device(info.clone());
    respond(StatusCode::CREATED, info)
}

async fn device_status_changed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Response {
    let status = match parse_device_status(&req.status) {
        Ok(status) => status,
        Err(e) => return bad_request(e),
    };
    let device = DeviceId::new(id.clone());
    match blocking(&state, move |engine| engine.set_device_status(&device, status)).await {
        Ok(transition) => respond(
            StatusCode::OK,
            TransitionResponse {
                device_id: id,
                old: transition.old,
                new: transition.new,
                accepted: transition.accepted,
            },
        ),
        Err(response) => response,
    }
}

async fn torch_status_changed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Response {
    let status = match parse_torch_status(&req.status) {
        Ok(status) => status,
        Err(e) => return bad_request(e),
    };
    let device = DeviceId::new(id);
    let query = device.clone();
    match blocking(&state, move |engine| {
        engine.on_torch_status_changed(&device, status.to_interface())
    })
    .await
    {
        Ok(()) => respond(StatusCode::OK, state.engine.torch_status(&query)),
        Err(response) => response,
    }
}
