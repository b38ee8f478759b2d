//! The command correlator owns the link to the device.
//!
//! Any number of callers may [`CorrelatorHandle::execute`] commands concurrently.
//! The wire protocol has no request ids, so a single worker task puts
//! exactly one command on the wire at a time and waits for its response
//! before the next one goes out.
//!
//! The worker also runs the reconnection loop:
//!
//! ```text
//! Disconnected ──► Connecting ──(open ok)──► Connected
//!       ▲              │  ▲                      │
//!       │              └──┘ (open failed,        │
//!       │                    wait and retry)     │
//!       └────────────(read/write failed)─────────┘
//! ```

use std::time::Duration;

use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    error::Error,
    link::{error::LinkError, Connector, Link},
    status::{ConnectionState, ConnectionStatus},
};

/// How long the link must stay quiet before a command is written,
/// when an earlier command's response might still be on its way.
pub const DEFAULT_STALE_DRAIN: Duration = Duration::from_millis(100);

/// Tunables for the correlator worker.
#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    /// Wait this long between attempts to open the link.
    pub reconnect_interval: Duration,

    /// See [`DEFAULT_STALE_DRAIN`].
    pub stale_drain: Duration,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
            stale_drain: DEFAULT_STALE_DRAIN,
        }
    }
}

#[derive(Debug)]
struct PendingCommand {
    request: String,
    expect_response: bool,
    timeout: Duration,
    deadline: Instant,
    reply: oneshot::Sender<Result<String, Error>>,
}

impl PendingCommand {
    fn resolve(self, result: Result<String, Error>) {
        // The caller may have given up, that's fine.
        let _ = self.reply.send(result);
    }

    fn timed_out(&self) -> Error {
        Error::Timeout(self.timeout.as_millis() as u64)
    }
}

/// A handle to the correlator.
/// Cheap to clone, every clone talks to the same worker.
#[derive(Debug, Clone)]
pub struct CorrelatorHandle {
    commands: mpsc::UnboundedSender<PendingCommand>,
    status: ConnectionStatus,
}

impl CorrelatorHandle {
    /// Start the worker.
    ///
    /// It starts connecting right away and keeps the link up
    /// until every handle is dropped.
    pub fn spawn<C: Connector>(
        connector: C,
        status: ConnectionStatus,
        settings: CorrelatorSettings,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let span = info_span!("link", device = %connector.describe());

        let worker = Worker {
            connector,
            status: status.clone(),
            commands: commands_rx,
            settings,
        };

        let join_handle = tokio::spawn(worker.run().instrument(span));

        (
            Self {
                commands: commands_tx,
                status,
            },
            join_handle,
        )
    }

    /// Send a command to the device.
    ///
    /// If `expect_response` is false this resolves as soon as the command is written,
    /// with an empty string.
    /// Otherwise the first JSON object line the device sends back is the response.
    ///
    /// The timeout covers waiting in line behind other commands too.
    /// Dropping the returned future releases the command.
    pub async fn execute(
        &self,
        request: impl Into<String>,
        expect_response: bool,
        timeout: Duration,
    ) -> Result<String, Error> {
        let deadline = Instant::now() + timeout;
        let (reply, response) = oneshot::channel();

        self.commands
            .send(PendingCommand {
                request: request.into(),
                expect_response,
                timeout,
                deadline,
                reply,
            })
            .map_err(|_| Error::LinkDown)?;

        match tokio::time::timeout_at(deadline, response).await {
            Ok(Ok(result)) => result,
            // The worker is gone.
            Ok(Err(_)) => Err(Error::LinkDown),
            Err(_) => Err(Error::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// The connection status the worker maintains.
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }
}

/// What a line from the device turned out to be.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// A response to the command in flight.
    Response(String),

    /// Debug output and the like. Not a response.
    Chatter,

    /// Looked like a response, but isn't usable.
    Malformed(String),
}

fn classify(line: &[u8]) -> Frame {
    let Ok(text) = std::str::from_utf8(line) else {
        return Frame::Malformed(format!("response is not UTF-8: {line:?}"));
    };

    let text = text.trim();

    if !text.starts_with('{') {
        return Frame::Chatter;
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value) => match value.get("error") {
            Some(error) => Frame::Malformed(format!("device reported an error: {error}")),
            None => Frame::Response(text.to_owned()),
        },
        Err(e) => Frame::Malformed(format!("`{text}`: {e}")),
    }
}

enum Outcome {
    /// The link failed, reconnect.
    LinkFailed,

    /// Every handle is gone.
    Shutdown,
}

enum Wait {
    Deadline,
    CallerGone,
    Line(Result<Vec<u8>, LinkError>),
}

struct Worker<C: Connector> {
    connector: C,
    status: ConnectionStatus,
    commands: mpsc::UnboundedReceiver<PendingCommand>,
    settings: CorrelatorSettings,
}

impl<C: Connector> Worker<C> {
    async fn run(mut self) {
        loop {
            let Some(mut link) = self.connect().await else { break };

            match self.serve(&mut link).await {
                Outcome::LinkFailed => {
                    self.fail_queued();
                    continue;
                }
                Outcome::Shutdown => break,
            }
        }

        self.status.set(ConnectionState::Disconnected);
        debug!("Correlator stopped");
    }

    /// Open the link, retrying until it works.
    /// Commands arriving meanwhile fail right away.
    async fn connect(&mut self) -> Option<Link<C::Io>> {
        self.status.set(ConnectionState::Connecting);

        loop {
            match Link::open(&self.connector, self.status.clone()) {
                Ok(link) => {
                    info!("Connected to {}", self.connector.describe());
                    self.status.set(ConnectionState::Connected);

                    return Some(link);
                }
                Err(e) => {
                    warn!(
                        ?e,
                        "Could not open link, retrying in {:?}", self.settings.reconnect_interval
                    );

                    let backoff = tokio::time::sleep(self.settings.reconnect_interval);
                    tokio::pin!(backoff);

                    loop {
                        tokio::select! {
                            _ = &mut backoff => break,
                            command = self.commands.recv() => match command {
                                Some(command) => command.resolve(Err(Error::LinkDown)),
                                None => return None,
                            }
                        }
                    }
                }
            }
        }
    }

    async fn serve(&mut self, link: &mut Link<C::Io>) -> Outcome {
        // An earlier command gave up while its response was still owed.
        let mut stale = false;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { return Outcome::Shutdown };

                    if self.dispatch(link, command, &mut stale).await.is_err() {
                        return Outcome::LinkFailed;
                    }
                }
                line = link.read_line() => match line {
                    Ok(line) => {
                        if stale && classify(&line) != Frame::Chatter {
                            debug!("Late response arrived while idle, discarding");
                            stale = false;
                        } else {
                            debug!("Unsolicited line: `{}`", String::from_utf8_lossy(&line));
                        }
                    }
                    Err(e) => {
                        warn!(?e, "Link lost while idle");
                        return Outcome::LinkFailed;
                    }
                }
            }
        }
    }

    /// Put one command on the wire and see it through.
    /// An `Err` means the link failed, the command has then been resolved with [`Error::LinkDown`].
    async fn dispatch(
        &mut self,
        link: &mut Link<C::Io>,
        mut command: PendingCommand,
        stale: &mut bool,
    ) -> Result<(), LinkError> {
        if command.reply.is_closed() {
            debug!("Caller gave up before dispatch, skipping `{}`", command.request);
            return Ok(());
        }

        if *stale {
            let drained = tokio::select! {
                drained = tokio::time::timeout_at(command.deadline, self.drain(link)) => drained,
                _ = command.reply.closed() => {
                    debug!(request = %command.request, "Caller gave up while draining");
                    return Ok(());
                }
            };

            match drained {
                Ok(Ok(())) => *stale = false,
                Ok(Err(e)) => {
                    command.resolve(Err(Error::LinkDown));
                    return Err(e);
                }
                // Still stale, the next command drains again.
                Err(_) => {
                    warn!(request = %command.request, "Link never went quiet, not sending");
                    let error = command.timed_out();
                    command.resolve(Err(error));

                    return Ok(());
                }
            }
        }

        // Never write a command whose caller was already told it timed out.
        if command.reply.is_closed() || Instant::now() >= command.deadline {
            debug!(request = %command.request, "Expired before dispatch, skipping");
            let error = command.timed_out();
            command.resolve(Err(error));

            return Ok(());
        }

        trace!(request = %command.request, "Dispatching");

        if let Err(e) = link.write(command.request.as_bytes()).await {
            command.resolve(Err(Error::LinkDown));
            return Err(e);
        }

        if !command.expect_response {
            // The firmware may still answer, that answer must not reach the next caller.
            *stale = true;
            command.resolve(Ok(String::new()));
            return Ok(());
        }

        let deadline = tokio::time::sleep_until(command.deadline);
        tokio::pin!(deadline);

        loop {
            let wait = tokio::select! {
                _ = &mut deadline => Wait::Deadline,
                _ = command.reply.closed() => Wait::CallerGone,
                line = link.read_line() => Wait::Line(line),
            };

            match wait {
                Wait::Deadline => {
                    warn!(request = %command.request, "Device did not respond in time");
                    *stale = true;
                    let error = command.timed_out();
                    command.resolve(Err(error));

                    return Ok(());
                }
                Wait::CallerGone => {
                    debug!(request = %command.request, "Caller gave up while waiting");
                    *stale = true;

                    return Ok(());
                }
                Wait::Line(Err(e)) => {
                    command.resolve(Err(Error::LinkDown));

                    return Err(e);
                }
                Wait::Line(Ok(line)) => match classify(&line) {
                    Frame::Chatter => {
                        debug!("Device chatter: `{}`", String::from_utf8_lossy(&line));
                    }
                    Frame::Response(response) => {
                        trace!(%response, "Response");
                        command.resolve(Ok(response));

                        return Ok(());
                    }
                    Frame::Malformed(problem) => {
                        warn!(request = %command.request, %problem, "Bad response");
                        command.resolve(Err(Error::Protocol(problem)));

                        return Ok(());
                    }
                },
            }
        }
    }

    /// Discard lines until the link has been quiet for a while.
    async fn drain(&mut self, link: &mut Link<C::Io>) -> Result<(), LinkError> {
        loop {
            match tokio::time::timeout(self.settings.stale_drain, link.read_line()).await {
                Err(_) => return Ok(()),
                Ok(Ok(line)) => {
                    debug!("Discarding stale line: `{}`", String::from_utf8_lossy(&line));
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Everything still queued gets [`Error::LinkDown`].
    fn fail_queued(&mut self) {
        let mut failed = 0;

        while let Ok(command) = self.commands.try_recv() {
            command.resolve(Err(Error::LinkDown));
            failed += 1;
        }

        if failed > 0 {
            info!("Failed {failed} queued command(s) after losing the link");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn classify_lines() {
        assert_eq!(
            classify(br#"{"ps":{"d1":1}}"#),
            Frame::Response(r#"{"ps":{"d1":1}}"#.into())
        );
        assert_eq!(classify(b"  {\"a\":1}  "), Frame::Response("{\"a\":1}".into()));
        assert_eq!(classify(b"Booting..."), Frame::Chatter);
        assert_eq!(classify(b""), Frame::Chatter);
        assert!(matches!(classify(b"{\"a\":"), Frame::Malformed(_)));
        assert!(matches!(
            classify(br#"{"error":"unknown command"}"#),
            Frame::Malformed(_)
        ));
        assert!(matches!(classify(&[b'{', 0xff, b'}']), Frame::Malformed(_)));
    }
}
