use std::net::SocketAddr;

use axum::{
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    alpaca::{management, switch},
    error::Error,
    gateway::Gateway,
    websocket,
};

/// The default port to run the server on.
pub use crate::config::DEFAULT_NETWORK_PORT as DEFAULT_PORT;

/// Every route the gateway serves.
pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route(
            "/api/v1/switch/:device_number/:member",
            get(switch::get_handler).put(switch::put_handler),
        )
        .route("/management/apiversions", get(management::api_versions))
        .route("/management/v1/description", get(management::description))
        .route(
            "/management/v1/configureddevices",
            get(management::configured_devices),
        )
        .route("/api/status", get(show_status))
        .route("/ws/logs", get(websocket::ws_logs_handler))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Every handler reaches the device through the gateway
                .layer(Extension(gateway)),
        )
}

async fn run(
    gateway: Gateway,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
) -> Result<(), Error> {
    let app = router(gateway);

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0)));
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| Error::Server(format!("Could not listen on {addr}: {e}")))?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        // The caller may not care anymore.
        let _ = port_reply.send(addr.port());
    }

    info!("listening on {}", addr);

    server
        .await
        .map_err(|e| Error::Server(format!("Server stopped: {e}")))
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(
    gateway: Gateway,
    allocated_port: oneshot::Sender<u16>,
) -> Result<(), Error> {
    run(gateway, None, Some(allocated_port)).await
}

/// Start the server on the given port.
pub async fn run_on_port(gateway: Gateway, port: u16) -> Result<(), Error> {
    run(gateway, Some(port), None).await
}

async fn show_status(Extension(gateway): Extension<Gateway>) -> impl IntoResponse {
    Json(gateway.status())
}

async fn show_version() -> impl IntoResponse {
    format!("SV241 Alpaca gateway v{}\n", env!("CARGO_PKG_VERSION"))
}
