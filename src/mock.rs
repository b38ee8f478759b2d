//! A mock SV241, useful to run the gateway without the actual device.
//!
//! The simulated firmware answers the same line protocol as the real one,
//! enough to drive the gateway end to end.
//! A scripted variant hands the device side of the link to the caller instead,
//! which lets tests decide exactly what the "device" says and when.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::{
    io::DuplexStream,
    sync::{mpsc, watch},
};
use tokio_util::codec::Decoder;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    link::{codec::LinesCodec, error::LinkError, Connector},
    topology::{HEATER_DISABLED, MASTER_POWER_KEY, STANDARD_SWITCHES},
};

/// The greeting the simulated firmware prints when the port opens.
pub const MOCK_GREETING: &str = "SV241 mock firmware ready";

/// The version the simulated firmware reports.
pub const MOCK_FIRMWARE_VERSION: &str = "1.0.0-mock";

/// In-memory firmware state.
#[derive(Debug, Clone)]
pub struct MockFirmware {
    heater_modes: Vec<u8>,
    power: Map<String, Value>,
}

impl Default for MockFirmware {
    /// Two heaters, both in automatic mode.
    fn default() -> Self {
        Self::new(&[1, 1])
    }
}

impl MockFirmware {
    /// Firmware with one heater per given mode.
    pub fn new(heater_modes: &[u8]) -> Self {
        let mut firmware = Self {
            heater_modes: vec![],
            power: Map::new(),
        };
        firmware.set_heater_modes(heater_modes);

        firmware
    }

    /// Change the heater modes, like the user would in the device's own setup page.
    pub fn set_heater_modes(&mut self, heater_modes: &[u8]) {
        self.heater_modes = heater_modes.to_vec();

        let mut power = Map::new();
        for (_, short_key) in STANDARD_SWITCHES {
            power.insert(short_key.to_string(), json!(0));
        }
        for (index, mode) in self.heater_modes.iter().enumerate() {
            if *mode != HEATER_DISABLED {
                power.insert(format!("pwm{}", index + 1), json!(0));
            }
        }
        self.power = power;
    }

    /// The current value of a channel by short key.
    pub fn power(&self, short_key: &str) -> Option<&Value> {
        self.power.get(short_key)
    }

    /// Answer a line.
    /// Lines which are not JSON are ignored, like the firmware does.
    pub fn respond(&mut self, line: &str) -> Option<String> {
        let request: Value = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(_) => {
                debug!(%line, "Mock ignoring non-JSON line");
                return None;
            }
        };

        let response = if let Some(what) = request.get("get").and_then(Value::as_str) {
            match what {
                "config" => json!({
                    "dh": self
                        .heater_modes
                        .iter()
                        .map(|mode| json!({ "m": mode }))
                        .collect::<Vec<_>>(),
                }),
                "status" => json!({ "ps": self.power }),
                "version" => json!({ "version": MOCK_FIRMWARE_VERSION }),
                other => json!({ "error": format!("unknown get `{other}`") }),
            }
        } else if let Some(set) = request.get("set").and_then(Value::as_object) {
            match self.apply(set) {
                Ok(()) => json!({ "ps": self.power }),
                Err(problem) => json!({ "error": problem }),
            }
        } else {
            json!({ "error": "unknown command" })
        };

        Some(response.to_string())
    }

    fn apply(&mut self, set: &Map<String, Value>) -> Result<(), String> {
        for (key, value) in set {
            if key == MASTER_POWER_KEY {
                for channel in self.power.values_mut() {
                    *channel = value.clone();
                }
            } else if let Some(channel) = self.power.get_mut(key) {
                *channel = value.clone();
            } else {
                return Err(format!("unknown channel `{key}`"));
            }
        }

        Ok(())
    }
}

enum Backend {
    Simulated(Arc<Mutex<MockFirmware>>),
    Scripted(mpsc::UnboundedSender<DuplexStream>),
}

struct Inner {
    backend: Backend,
    available: AtomicBool,
    opened: AtomicUsize,
    plugged: watch::Sender<u64>,
}

/// A [`Connector`] which opens in-memory links.
#[derive(Clone)]
pub struct MockConnector {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector")
            .field("available", &self.inner.available.load(Ordering::SeqCst))
            .field("opened", &self.opens())
            .finish()
    }
}

impl MockConnector {
    fn with_backend(backend: Backend) -> Self {
        let (plugged, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                backend,
                available: AtomicBool::new(true),
                opened: AtomicUsize::new(0),
                plugged,
            }),
        }
    }

    /// Each open talks to the simulated firmware.
    pub fn simulated(firmware: MockFirmware) -> Self {
        Self::with_backend(Backend::Simulated(Arc::new(Mutex::new(firmware))))
    }

    /// Each open sends the device side of the new link on the returned channel.
    pub fn scripted() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (Self::with_backend(Backend::Scripted(tx)), rx)
    }

    /// Make opening succeed (`true`) or fail (`false`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Pull the cable: every simulated link currently open is closed.
    pub fn unplug(&self) {
        self.inner.plugged.send_modify(|generation| *generation += 1);
    }

    /// How many times a link was opened successfully.
    pub fn opens(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Inspect or change the simulated firmware.
    /// Returns `None` for scripted connectors.
    pub fn with_firmware<R>(&self, f: impl FnOnce(&mut MockFirmware) -> R) -> Option<R> {
        match &self.inner.backend {
            Backend::Simulated(firmware) => {
                let mut firmware = firmware.lock().unwrap_or_else(PoisonError::into_inner);
                Some(f(&mut firmware))
            }
            Backend::Scripted(_) => None,
        }
    }
}

impl Connector for MockConnector {
    type Io = DuplexStream;

    fn open(&self) -> Result<Self::Io, LinkError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(LinkError::Open {
                path: self.describe(),
                problem: "mock device unavailable".into(),
            });
        }

        let (ours, theirs) = tokio::io::duplex(4096);

        match &self.inner.backend {
            Backend::Simulated(firmware) => {
                let unplugged = self.inner.plugged.subscribe();
                tokio::spawn(
                    serve(firmware.clone(), theirs, unplugged).instrument(info_span!("mock-sv241")),
                );
            }
            Backend::Scripted(tx) => {
                tx.send(theirs).map_err(|_| LinkError::Open {
                    path: self.describe(),
                    problem: "nobody is scripting the mock device".into(),
                })?;
            }
        }

        self.inner.opened.fetch_add(1, Ordering::SeqCst);

        Ok(ours)
    }

    fn describe(&self) -> String {
        "mock-sv241".into()
    }
}

async fn serve(
    firmware: Arc<Mutex<MockFirmware>>,
    io: DuplexStream,
    mut unplugged: watch::Receiver<u64>,
) {
    info!("Mock device attached");

    let mut framed = LinesCodec::default().framed(io);

    if framed.send(MOCK_GREETING.as_bytes().to_vec()).await.is_err() {
        warn!("Mock could not greet");
        return;
    }

    loop {
        tokio::select! {
            _ = unplugged.changed() => {
                info!("Mock device unplugged");
                break;
            }
            line = framed.next() => {
                let Some(Ok(line)) = line else { break };

                let reply = firmware
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .respond(&String::from_utf8_lossy(&line));

                if let Some(reply) = reply {
                    if framed.send(reply.into_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    debug!("Mock device detached");
}
