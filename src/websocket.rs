use std::{borrow::Cow, net::SocketAddr, time::Duration};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};
use futures::{sink::Sink, stream::Stream, SinkExt, StreamExt};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{error::Error, gateway::Gateway, hub::Subscription};

/// How often the server pings a log subscriber.
pub const PING_INTERVAL: Duration = Duration::from_secs(50);

// RFC 6455 close code 1001.
const GOING_AWAY: u16 = 1001;

/// A log subscriber which sends nothing (not even a pong) for this long is dropped.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) async fn ws_logs_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(gateway): Extension<Gateway>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected to the log stream", user_agent.as_str());
    }

    ws.on_upgrade(move |socket| {
        let subscription = gateway.hub().subscribe();
        let span = info_span!("LogSubscriber", %addr, id = %subscription.id());

        handle_websocket(socket, subscription, PING_INTERVAL, READ_TIMEOUT).instrument(span)
    })
}

pub(crate) async fn read<S>(mut receiver: S, read_timeout: Duration)
where
    S: Unpin,
    S: Stream<Item = Result<Message, axum::Error>>,
{
    loop {
        let msg = match tokio::time::timeout(read_timeout, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!("read error: {e}");
                return;
            }
            Ok(None) => {
                debug!("client disconnected");
                return;
            }
            Err(_) => {
                info!("Nothing heard from subscriber in {read_timeout:?}, closing");
                return;
            }
        };

        match msg {
            Message::Text(text) => trace!(%text, "ignoring text from subscriber"),
            Message::Binary(_) => debug!("client sent binary data"),
            Message::Ping(_) => debug!("socket ping"),
            Message::Pong(_) => trace!("socket pong"),
            Message::Close(_) => {
                debug!("client closed");
                return;
            }
        }
    }
}

pub(crate) async fn write(
    mut sender: impl Sink<Message> + Unpin,
    mut subscription: Subscription,
    ping_interval: Duration,
) {
    let mut ping =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            batch = subscription.next_batch() => {
                let Some(batch) = batch else {
                    let reason = if subscription.overrun() {
                        warn!("{}", Error::SubscriberOverrun);
                        Error::SubscriberOverrun.to_string()
                    } else {
                        "log stream closed".to_string()
                    };

                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: GOING_AWAY,
                            reason: Cow::Owned(reason),
                        })))
                        .await;
                    return;
                };

                let text = String::from_utf8_lossy(&batch).into_owned();

                if sender.send(Message::Text(text)).await.is_err() {
                    debug!("client disconnected");
                    return;
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    debug!("client disconnected");
                    return;
                }
                trace!("ping sent");
            }
        }
    }
}

pub(crate) async fn handle_websocket(
    websocket: WebSocket,
    subscription: Subscription,
    ping_interval: Duration,
    read_timeout: Duration,
) {
    let (stream_sender, stream_receiver) = websocket.split();

    let mut read_handle = tokio::spawn(
        read(stream_receiver, read_timeout).instrument(info_span!("Read")),
    );
    let mut write_handle = tokio::spawn(
        write(stream_sender, subscription, ping_interval).instrument(info_span!("Write")),
    );

    // Whichever side is done first ends the session.
    // Aborting the other one drops the socket, closing the TCP connection.
    tokio::select! {
        _ = &mut read_handle => {
            debug!("Read task done, aborting write task");
            write_handle.abort();
        }
        _ = &mut write_handle => {
            debug!("Write task done, aborting read task");
            read_handle.abort();
        }
    }
}
