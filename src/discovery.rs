//! Alpaca discovery: clients broadcast a UDP datagram and every
//! Alpaca server on the network answers with its HTTP port.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// The datagram clients send.
pub const DISCOVERY_REQUEST: &[u8] = b"alpacadiscovery1";

/// The answer to [`DISCOVERY_REQUEST`], `None` for anything else.
pub fn respond(payload: &[u8], alpaca_port: u16) -> Option<Vec<u8>> {
    (payload == DISCOVERY_REQUEST).then(|| format!(r#"{{"AlpacaPort": {alpaca_port}}}"#).into_bytes())
}

/// Bind the discovery socket on every interface.
pub async fn bind(port: u16) -> Result<UdpSocket, Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    UdpSocket::bind(addr).await.map_err(|e| {
        Error::Server(format!(
            "Could not listen for discovery on UDP port {port}: {e}. \
             Is another Alpaca server running?"
        ))
    })
}

/// Answer discovery requests on the socket, forever.
pub async fn serve(socket: UdpSocket, alpaca_port: u16) {
    if let Ok(addr) = socket.local_addr() {
        info!("Alpaca discovery responder listening on {addr}");
    }

    let mut buffer = [0u8; 1024];

    loop {
        let (n, peer) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Discovery read failed: {e}");
                continue;
            }
        };

        let Some(response) = respond(&buffer[..n], alpaca_port) else {
            debug!(%peer, "Ignoring non-discovery datagram");
            continue;
        };

        debug!(%peer, "Discovery request");

        if let Err(e) = socket.send_to(&response, peer).await {
            error!(%peer, "Could not answer discovery: {e}");
        }
    }
}
