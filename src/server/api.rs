//! Request/response handlers and wire types.
//!
//! Every mutation runs under the configured deadline; expiry reports
//! `Timeout` and the operation's rollback guards unwind partial kernel
//! state. Errors serialize as `{kind, message}` with a status per kind.

use std::net::Ipv4Addr;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::{EmuError, ErrorKind};
use crate::exec::DEFAULT_EXEC_TIMEOUT;
use crate::topology::{DeviceKind, DeviceSpec, Failure, LinkSpec};
use netkit::ShapingSpec;

use super::AppState;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError(pub EmuError);

#[derive(Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            kind: self.0.kind,
            message: self.0.message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<EmuError> for ApiError {
    fn from(err: EmuError) -> Self {
        Self(err)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run a control operation under the server-wide deadline.
async fn bounded<T>(
    state: &AppState,
    op: impl Future<Output = crate::error::Result<T>>,
) -> Result<T, ApiError> {
    match timeout(state.op_timeout, op).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(_) => Err(ApiError(EmuError::timeout(format!(
            "control operation exceeded {:?}",
            state.op_timeout
        )))),
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    pub kind: String,
    pub x: Option<i32>,
    pub y: Option<i32>,
    /// Optional address for the first interface, `a.b.c.d` or `a.b.c.d/p`.
    pub addr: Option<String>,
    pub prefix: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    pub device_a: String,
    pub device_b: String,
    pub latency_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub bandwidth_mbps: Option<f64>,
    pub loss_pct: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLinkRequest {
    pub latency_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub bandwidth_mbps: Option<f64>,
    pub loss_pct: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct GatewayRequest {
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Deserialize)]
pub struct FailureRequest {
    pub device: String,
    pub kind: String,
    pub iface: Option<String>,
    pub pct: Option<f32>,
    pub ms: Option<u32>,
    pub mbps: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ClearFailureQuery {
    pub iface: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub device: String,
    pub argv: Vec<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub counters: crate::topology::StatusView,
}

#[derive(Serialize)]
pub struct Removed {
    pub removed: bool,
}

#[derive(Serialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Serialize)]
pub struct RoutesInstalled {
    pub installed: usize,
}

fn parse_addr(req: &CreateDeviceRequest) -> Result<Option<(Ipv4Addr, u8)>, EmuError> {
    let Some(raw) = req.addr.as_deref() else {
        return Ok(None);
    };
    let (addr_str, prefix) = match raw.split_once('/') {
        Some((a, p)) => {
            let prefix: u8 = p
                .parse()
                .map_err(|_| EmuError::invalid(format!("prefix '{p}'")))?;
            (a, prefix)
        }
        None => (raw, req.prefix.unwrap_or(24)),
    };
    let addr: Ipv4Addr = addr_str
        .parse()
        .map_err(|_| EmuError::invalid(format!("address '{addr_str}'")))?;
    Ok(Some((addr, prefix)))
}

fn parse_failure(req: &FailureRequest) -> Result<Failure, EmuError> {
    let need_iface = || {
        req.iface
            .clone()
            .ok_or_else(|| EmuError::invalid(format!("failure '{}' requires iface", req.kind)))
    };
    match req.kind.as_str() {
        "interface_down" => Ok(Failure::InterfaceDown { iface: need_iface()? }),
        "block_icmp" => Ok(Failure::BlockIcmp),
        "silent_router" => Ok(Failure::SilentRouter),
        "packet_loss" => Ok(Failure::PacketLoss {
            iface: need_iface()?,
            pct: req
                .pct
                .ok_or_else(|| EmuError::invalid("packet_loss requires pct"))?,
        }),
        "latency" => Ok(Failure::Latency {
            iface: need_iface()?,
            ms: req
                .ms
                .ok_or_else(|| EmuError::invalid("latency requires ms"))?,
        }),
        "bandwidth_limit" => Ok(Failure::BandwidthLimit {
            iface: need_iface()?,
            mbps: req
                .mbps
                .ok_or_else(|| EmuError::invalid("bandwidth_limit requires mbps"))?,
        }),
        other => Err(EmuError::invalid(format!("unknown failure kind '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running",
        uptime_secs: state.started.elapsed().as_secs(),
        counters: state.topology.status(),
    })
}

pub async fn create_device(
    State(state): State<AppState>,
    Json(req): Json<CreateDeviceRequest>,
) -> ApiResult<crate::topology::DeviceSummary> {
    let kind = DeviceKind::parse(&req.kind)?;
    let addr = parse_addr(&req)?;
    let spec = DeviceSpec {
        name: req.name,
        kind,
        x: req.x,
        y: req.y,
        addr,
    };
    let summary = bounded(&state, state.topology.add_device(spec)).await?;
    Ok(Json(summary))
}

pub async fn list_devices(
    State(state): State<AppState>,
) -> Json<Vec<crate::topology::DeviceSummary>> {
    Json(state.topology.list_devices())
}

pub async fn inspect_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<crate::topology::DeviceView> {
    let view = bounded(&state, state.topology.inspect(&name)).await?;
    Ok(Json(view))
}

pub async fn delete_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Removed> {
    bounded(&state, state.topology.remove_device(&name)).await?;
    Ok(Json(Removed { removed: true }))
}

pub async fn create_link(
    State(state): State<AppState>,
    Json(req): Json<CreateLinkRequest>,
) -> ApiResult<crate::topology::LinkSummary> {
    let spec = LinkSpec {
        device_a: req.device_a,
        device_b: req.device_b,
        latency_ms: req.latency_ms,
        jitter_ms: req.jitter_ms,
        bandwidth_mbps: req.bandwidth_mbps,
        loss_pct: req.loss_pct,
    };
    let summary = bounded(&state, state.topology.add_link(spec)).await?;
    Ok(Json(summary))
}

pub async fn list_links(State(state): State<AppState>) -> Json<Vec<crate::topology::LinkSummary>> {
    Json(state.topology.list_links())
}

pub async fn update_link(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateLinkRequest>,
) -> ApiResult<crate::topology::LinkSummary> {
    let params = ShapingSpec {
        latency_ms: req.latency_ms,
        jitter_ms: req.jitter_ms,
        loss_pct: req.loss_pct,
        bandwidth_mbps: req.bandwidth_mbps,
    };
    let summary = bounded(&state, state.topology.update_link(&id, params)).await?;
    Ok(Json(summary))
}

pub async fn delete_link(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Removed> {
    bounded(&state, state.topology.remove_link(&id)).await?;
    Ok(Json(Removed { removed: true }))
}

pub async fn set_gateway(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<GatewayRequest>,
) -> ApiResult<Ack> {
    bounded(&state, state.topology.set_gateway(&name, req.gateway)).await?;
    Ok(Json(Ack { ok: true }))
}

pub async fn inject_failure(
    State(state): State<AppState>,
    Json(req): Json<FailureRequest>,
) -> ApiResult<Vec<crate::topology::FailureReport>> {
    let failure = parse_failure(&req)?;
    bounded(&state, state.topology.inject_failure(&req.device, failure)).await?;
    Ok(Json(state.topology.list_failures()))
}

pub async fn list_failures(
    State(state): State<AppState>,
) -> Json<Vec<crate::topology::FailureReport>> {
    Json(state.topology.list_failures())
}

pub async fn clear_failure(
    State(state): State<AppState>,
    Path((device, kind)): Path<(String, String)>,
    axum::extract::Query(query): axum::extract::Query<ClearFailureQuery>,
) -> ApiResult<Vec<crate::topology::FailureReport>> {
    bounded(
        &state,
        state
            .topology
            .clear_failure(&device, &kind, query.iface.as_deref()),
    )
    .await?;
    Ok(Json(state.topology.list_failures()))
}

pub async fn exec(
    State(state): State<AppState>,
    Json(req): Json<ExecRequest>,
) -> ApiResult<crate::exec::ExecOutcome> {
    let deadline = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_EXEC_TIMEOUT);
    let outcome = state
        .topology
        .exec(&req.device, &req.argv, deadline)
        .await?;
    Ok(Json(outcome))
}

pub async fn auto_route(State(state): State<AppState>) -> ApiResult<RoutesInstalled> {
    let installed = bounded(&state, state.topology.auto_route()).await?;
    Ok(Json(RoutesInstalled { installed }))
}

pub async fn snapshot(
    State(state): State<AppState>,
) -> Json<crate::topology::TopologySnapshot> {
    Json(state.topology.snapshot())
}
