//! Control server: JSON/HTTP request-response surface plus the two
//! streaming WebSocket surfaces (terminals and packet events).

pub mod api;
pub mod packets;
pub mod terminal;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::routing::{delete, get, post, put};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::topology::Topology;

#[derive(Clone)]
pub struct AppState {
    pub topology: Arc<Topology>,
    /// Deadline for every control operation.
    pub op_timeout: Duration,
    pub started: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api::status))
        .route("/api/devices", post(api::create_device).get(api::list_devices))
        .route(
            "/api/devices/{name}",
            get(api::inspect_device).delete(api::delete_device),
        )
        .route("/api/devices/{name}/gateway", put(api::set_gateway))
        .route("/api/links", post(api::create_link).get(api::list_links))
        .route(
            "/api/links/{id}",
            put(api::update_link).delete(api::delete_link),
        )
        .route(
            "/api/failures",
            post(api::inject_failure).get(api::list_failures),
        )
        .route("/api/failures/{device}/{kind}", delete(api::clear_failure))
        .route("/api/exec", post(api::exec))
        .route("/api/routes/auto", post(api::auto_route))
        .route("/api/topology", get(api::snapshot))
        .route("/ws/terminal/{device}", get(terminal::terminal_ws))
        .route("/ws/packets", get(packets::packets_ws))
        .with_state(state)
}

/// Serve until `shutdown` fires, then drain gracefully.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "control server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
