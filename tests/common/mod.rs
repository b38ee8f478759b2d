#![allow(dead_code)]

use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use color_eyre::Result;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use sv241_gateway::{
    config::{Config, Timing},
    gateway::Gateway,
    hub::HubHandle,
    link::codec::LinesCodec,
    mock::MockConnector,
    server,
};
use tokio::{io::DuplexStream, net::TcpStream, sync::oneshot, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{Decoder, Framed};
use tower::ServiceExt;
use tracing::info;

/// Short timings, so tests don't wait around.
pub fn test_config() -> Config {
    Config {
        timing: Timing {
            command_timeout_ms: 1000,
            sync_timeout_ms: 1000,
            settle_delay_ms: 10,
            reconnect_interval_ms: 50,
        },
        ..Default::default()
    }
}

pub fn start_gateway(connector: MockConnector) -> Gateway {
    start_gateway_with_config(test_config(), connector)
}

pub fn start_gateway_with_config(config: Config, connector: MockConnector) -> Gateway {
    let hub = HubHandle::spawn(config.hub_queue_capacity);

    Gateway::start(config, connector, hub)
}

/// Poll until the condition holds, or fail after a few seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let result = timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(result.is_ok(), "Timed out waiting for: {what}");
}

pub async fn start_server(gateway: Gateway) -> u16 {
    let (port_tx, port_rx) = oneshot::channel();

    tokio::spawn(async move { server::run_any_port(gateway, port_tx).await });
    port_rx
        .await
        .expect("Server should reply with allocated port")
}

pub async fn connect_logs(port: u16) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    info!("Connecting to log stream on port {port}");
    let (stream, http_response) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws/logs")).await?;

    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

/// The next text frame, skipping pings and the like.
pub async fn receive_text(
    client: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<String> {
    loop {
        let message = timeout(Duration::from_secs(5), client.next())
            .await?
            .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

        if let tungstenite::Message::Text(text) = message {
            return Ok(text);
        }
    }
}

async fn send(gateway: &Gateway, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = server::router(gateway.clone()).oneshot(request).await?;
    let status = response.status();

    let body = hyper::body::to_bytes(response.into_body()).await?;
    let body = serde_json::from_slice(&body).unwrap_or(Value::String(
        String::from_utf8_lossy(&body).into_owned(),
    ));

    Ok((status, body))
}

/// GET a route in-process.
pub async fn get(gateway: &Gateway, uri: &str) -> Result<(StatusCode, Value)> {
    send(gateway, Request::get(uri).body(Body::empty())?).await
}

/// PUT a form to a route in-process.
pub async fn put(gateway: &Gateway, uri: &str, form: &str) -> Result<(StatusCode, Value)> {
    send(
        gateway,
        Request::put(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form.to_string()))?,
    )
    .await
}

/// The device end of a scripted link.
pub struct ScriptedDevice(Framed<DuplexStream, LinesCodec>);

impl ScriptedDevice {
    pub fn new(io: DuplexStream) -> Self {
        Self(LinesCodec::default().framed(io))
    }

    /// The next line the gateway sent.
    pub async fn next_line(&mut self) -> Result<String> {
        let line = timeout(Duration::from_secs(5), self.0.next())
            .await?
            .ok_or_else(|| color_eyre::eyre::eyre!("Link closed"))??;

        Ok(String::from_utf8(line)?)
    }

    /// Whether the gateway sends anything within the given time.
    pub async fn is_quiet_for(&mut self, duration: Duration) -> bool {
        timeout(duration, self.0.next()).await.is_err()
    }

    pub async fn send(&mut self, line: &str) -> Result<()> {
        self.0.send(line.as_bytes().to_vec()).await?;

        Ok(())
    }
}
