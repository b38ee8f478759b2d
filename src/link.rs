use std::fmt::Debug;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Decoder, Framed};
use tracing::{debug, trace, warn};

use crate::status::{ConnectionState, ConnectionStatus};

/// Serial link related errors.
pub mod error;

/// Codecs for encoding/decoding lines to/from wire.
pub mod codec;

use codec::LinesCodec;
use error::LinkError;

/// Something which knows how to open the byte stream to the device.
///
/// Opening is synchronous, the serial port is opened this way by `tokio-serial` too.
pub trait Connector: Send + Sync + 'static {
    /// The byte stream.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Try opening the stream once.
    fn open(&self) -> Result<Self::Io, LinkError>;

    /// What we connect to, for logging.
    fn describe(&self) -> String;
}

/// Opens a real serial port, 8N1 without flow control.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    baud: u32,
}

impl SerialConnector {
    /// The tty should likely be along the lines of `/dev/ttyUSBx` on unix, and `COMx` on Windows.
    pub fn new(path: &str, baud: u32) -> Self {
        Self {
            path: path.to_string(),
            baud,
        }
    }
}

impl Connector for SerialConnector {
    type Io = SerialStream;

    fn open(&self) -> Result<Self::Io, LinkError> {
        tokio_serial::new(&self.path, self.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| LinkError::Open {
                path: self.path.clone(),
                problem: e.to_string(),
            })
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud)
    }
}

/// An open link to the device.
///
/// Reads and writes whole lines.
/// Payloads are not interpreted here.
///
/// The first failure marks the connection [`ConnectionState::Disconnected`].
/// A failed link stays failed, open a new one to reconnect.
pub struct Link<T> {
    framed: Framed<T, LinesCodec>,
    status: ConnectionStatus,
    failed: bool,
}

impl<T> Debug for Link<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("status", &self.status.get())
            .field("failed", &self.failed)
            .finish()
    }
}

impl<T> Link<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Open a link using the connector.
    pub fn open<C>(connector: &C, status: ConnectionStatus) -> Result<Self, LinkError>
    where
        C: Connector<Io = T>,
    {
        let io = connector.open()?;

        Ok(Self::new(io, status))
    }

    /// Wrap an already open byte stream.
    pub fn new(io: T, status: ConnectionStatus) -> Self {
        Self {
            framed: LinesCodec::default().framed(io),
            status,
            failed: false,
        }
    }

    /// Read one line, without its terminator.
    ///
    /// Cancel safe: a partially received line stays buffered.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, LinkError> {
        if self.failed {
            return Err(LinkError::Closed);
        }

        match self.framed.next().await {
            Some(Ok(line)) => {
                trace!("Line from wire: `{}`", String::from_utf8_lossy(&line));
                Ok(line)
            }
            Some(Err(e)) => Err(self.fail(e)),
            None => Err(self.fail(LinkError::Closed)),
        }
    }

    /// Write one line, a newline is appended.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.failed {
            return Err(LinkError::Closed);
        }

        trace!("Line to wire: `{}`", String::from_utf8_lossy(bytes));

        match self.framed.send(bytes.to_vec()).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Whether the link has seen a failure.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn fail(&mut self, error: LinkError) -> LinkError {
        if !self.failed {
            self.failed = true;
            warn!(?error, "Link failed");

            if !self.status.set(ConnectionState::Disconnected) {
                debug!("Already disconnected");
            }
        }

        error
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn reads_and_writes_lines() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        let status = ConnectionStatus::new();
        let mut link = Link::new(ours, status);

        link.write(br#"{"get":"config"}"#).await.unwrap();

        let mut buf = [0u8; 17];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"{\"get\":\"config\"}\n");

        theirs.write_all(b"{\"dh\":[]}\r\n").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), b"{\"dh\":[]}".to_vec());
    }

    #[tokio::test]
    async fn eof_disconnects_once() {
        let (ours, theirs) = tokio::io::duplex(256);
        let status = ConnectionStatus::new();
        status.set(ConnectionState::Connected);
        let mut transitions = status.subscribe();

        let mut link = Link::new(ours, status.clone());
        drop(theirs);

        assert!(!link.is_failed());
        assert!(matches!(link.read_line().await, Err(LinkError::Closed)));
        assert!(link.is_failed());
        assert!(matches!(link.read_line().await, Err(LinkError::Closed)));
        assert!(link.write(b"anyone?").await.is_err());

        assert_eq!(status.get(), ConnectionState::Disconnected);
        assert_eq!(
            transitions.try_recv().unwrap().state,
            ConnectionState::Disconnected
        );
        assert!(transitions.try_recv().is_err());
    }
}
