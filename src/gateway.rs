//! Ties the pieces together.
//!
//! A [`Gateway`] owns the correlator, the live switch table, the transaction counters
//! and the hub. HTTP handlers get a clone of it.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    alpaca::envelope::TransactionCounters,
    config::Config,
    correlator::{CorrelatorHandle, CorrelatorSettings, DEFAULT_STALE_DRAIN},
    error::Error,
    hub::HubHandle,
    link::Connector,
    status::{ConnectionState, ConnectionStatus},
    topology::{SharedSwitchTable, Switch, SwitchKind, SwitchTable, TopologySync},
};

/// The query answered with the state of every output.
pub const STATUS_QUERY: &str = r#"{"get":"status"}"#;

/// The query answered with the firmware version.
pub const VERSION_QUERY: &str = r#"{"get":"version"}"#;

/// A switch as shown by `/api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchInfo {
    /// The Alpaca switch id.
    pub id: usize,

    /// What clients see.
    pub display_name: String,

    /// See [`Switch`].
    #[serde(flatten)]
    pub switch: Switch,
}

/// Gateway health, as shown by `/api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    /// The link state.
    pub connection: ConnectionState,

    /// Known once the device has been connected.
    pub firmware_version: Option<String>,

    /// The switch table as of now.
    pub switches: Vec<SwitchInfo>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    correlator: CorrelatorHandle,
    table: SharedSwitchTable,
    counters: TransactionCounters,
    hub: HubHandle,
    names: RwLock<BTreeMap<String, String>>,
    firmware_version: Arc<ArcSwapOption<String>>,
}

/// Shared gateway state.
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Start the gateway's background tasks: the correlator (which connects right away),
    /// the topology synchronizer and the forwarding of status events to the hub.
    pub fn start<C: Connector>(config: Config, connector: C, hub: HubHandle) -> Self {
        let status = ConnectionStatus::new();
        let table = SharedSwitchTable::new(SwitchTable::default());

        // Subscribe before the correlator gets to connect.
        forward_status(&status, hub.clone());

        let (correlator, _) = CorrelatorHandle::spawn(
            connector,
            status.clone(),
            CorrelatorSettings {
                reconnect_interval: config.timing.reconnect_interval(),
                stale_drain: DEFAULT_STALE_DRAIN,
            },
        );

        TopologySync::new(
            correlator.clone(),
            table.clone(),
            config.timing.sync_timeout(),
            config.timing.settle_delay(),
        )
        .spawn(&status);

        let firmware_version = Arc::new(ArcSwapOption::empty());
        fetch_firmware_version(
            correlator.clone(),
            config.timing.settle_delay(),
            config.timing.sync_timeout(),
            firmware_version.clone(),
        );

        let names = RwLock::new(config.switch_names.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                correlator,
                table,
                counters: TransactionCounters::default(),
                hub,
                names,
                firmware_version,
            }),
        }
    }

    /// The configuration the gateway started with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// See [`CorrelatorHandle`].
    pub fn correlator(&self) -> &CorrelatorHandle {
        &self.inner.correlator
    }

    /// The live switch table.
    pub fn table(&self) -> &SharedSwitchTable {
        &self.inner.table
    }

    /// See [`TransactionCounters`].
    pub fn counters(&self) -> &TransactionCounters {
        &self.inner.counters
    }

    /// See [`HubHandle`].
    pub fn hub(&self) -> &HubHandle {
        &self.inner.hub
    }

    /// The version the firmware reported, if it has been asked yet.
    pub fn firmware_version(&self) -> Option<String> {
        self.inner
            .firmware_version
            .load_full()
            .map(|version| version.as_ref().clone())
    }

    /// The link state right now.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.correlator.status().get()
    }

    /// What a client should see for this switch.
    pub fn display_name(&self, switch: &Switch) -> String {
        self.inner
            .names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&switch.name)
            .cloned()
            .unwrap_or_else(|| switch.name.clone())
    }

    /// Rename a switch until the gateway restarts.
    pub fn set_display_name(&self, switch: &Switch, name: &str) {
        info!("Switch `{}` is now called `{name}`", switch.name);

        self.inner
            .names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(switch.name.clone(), name.to_string());
    }

    /// Look up a switch in the live table.
    pub fn switch(&self, id: i64) -> Result<Switch, Error> {
        let table = self.inner.table.load();

        usize::try_from(id)
            .ok()
            .and_then(|id| table.get(id))
            .cloned()
            .ok_or_else(|| {
                Error::InvalidValue(format!(
                    "Switch id {id} is out of range, there are {} switches",
                    table.len()
                ))
            })
    }

    /// Send a raw command, see [`CorrelatorHandle::execute`].
    pub async fn command(&self, request: &str, expect_response: bool) -> Result<String, Error> {
        self.inner
            .correlator
            .execute(request, expect_response, self.command_timeout())
            .await
    }

    /// The present value of a switch.
    pub async fn switch_value(&self, switch: &Switch) -> Result<f64, Error> {
        let response = self.command(STATUS_QUERY, true).await?;

        read_value(&response, switch)
    }

    /// Set a switch. The value must be in range for the switch.
    pub async fn set_switch_value(&self, switch: &Switch, value: f64) -> Result<(), Error> {
        if !(0.0..=switch.max_value()).contains(&value) {
            return Err(Error::InvalidValue(format!(
                "{value} is out of range for `{}`, expected 0 to {}",
                switch.name,
                switch.max_value()
            )));
        }

        let mut set = Map::new();
        set.insert(switch.short_key.clone(), json!(value.round() as i64));
        let request = json!({ "set": set });

        debug!(%request, "Setting switch");

        let response = self.command(&request.to_string(), true).await?;

        // The firmware answers with the new status, make sure it makes sense.
        let _: Value = serde_json::from_str(&response)
            .map_err(|e| Error::Protocol(format!("`{response}`: {e}")))?;

        Ok(())
    }

    /// Connection state and the switch table.
    pub fn status(&self) -> GatewayStatus {
        let table = self.inner.table.load();

        GatewayStatus {
            connection: self.connection_state(),
            firmware_version: self.firmware_version(),
            switches: table
                .iter()
                .map(|(id, switch)| SwitchInfo {
                    id,
                    display_name: self.display_name(switch),
                    switch: switch.clone(),
                })
                .collect(),
        }
    }

    fn command_timeout(&self) -> Duration {
        self.inner.config.timing.command_timeout()
    }
}

fn read_value(response: &str, switch: &Switch) -> Result<f64, Error> {
    let status: Value =
        serde_json::from_str(response).map_err(|e| Error::Protocol(format!("`{response}`: {e}")))?;

    let Some(power) = status.get("ps").and_then(Value::as_object) else {
        return Err(Error::Protocol(format!("no power status in `{response}`")));
    };

    let as_number = |value: &Value| match value {
        Value::Bool(on) => Some(if *on { 1.0 } else { 0.0 }),
        other => other.as_f64(),
    };

    match power.get(&switch.short_key) {
        Some(value) => as_number(value).ok_or_else(|| {
            Error::Protocol(format!("`{}` has a non-numeric value {value}", switch.short_key))
        }),
        // The firmware does not report master power, it is on when anything is.
        None if switch.kind == SwitchKind::MasterPower => {
            let any_on = power.values().filter_map(as_number).any(|value| value > 0.0);
            Ok(if any_on { 1.0 } else { 0.0 })
        }
        None => Err(Error::Protocol(format!(
            "no value for `{}` in `{response}`",
            switch.short_key
        ))),
    }
}

fn parse_version(response: &str) -> Result<String, Error> {
    let value: Value =
        serde_json::from_str(response).map_err(|e| Error::Protocol(format!("`{response}`: {e}")))?;

    match value.get("version") {
        Some(Value::String(version)) => Ok(version.clone()),
        Some(Value::Number(version)) => Ok(version.to_string()),
        _ => Err(Error::Protocol(format!("no version in `{response}`"))),
    }
}

/// Ask for the firmware version once, after the first connect.
fn fetch_firmware_version(
    correlator: CorrelatorHandle,
    settle_delay: Duration,
    timeout: Duration,
    version: Arc<ArcSwapOption<String>>,
) -> JoinHandle<()> {
    let status = correlator.status().clone();
    let mut transitions = status.subscribe();

    tokio::spawn(
        async move {
            while status.get() != ConnectionState::Connected {
                match transitions.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
            }

            tokio::time::sleep(settle_delay).await;

            let fetched = correlator
                .execute(VERSION_QUERY, true, timeout)
                .await
                .and_then(|response| parse_version(&response));

            match fetched {
                Ok(fetched) => {
                    info!("Firmware version {fetched}");
                    version.store(Some(Arc::new(fetched)));
                }
                Err(e) => warn!("Could not fetch the firmware version: {e}"),
            }
        }
        .instrument(info_span!("firmware-version")),
    )
}

/// Publish every connection state change on the hub.
fn forward_status(status: &ConnectionStatus, hub: HubHandle) -> JoinHandle<()> {
    let mut transitions = status.subscribe();

    tokio::spawn(
        async move {
            loop {
                match transitions.recv().await {
                    Ok(event) => {
                        let line = json!({
                            "event": "connection",
                            "state": event.state,
                            "timestamp": event.timestamp,
                        });
                        hub.publish(line.to_string());
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        }
        .instrument(info_span!("status-forwarder")),
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::topology::FirmwareConfig;

    fn switch(name: &str) -> Switch {
        let table = SwitchTable::from_firmware(&FirmwareConfig::with_modes(&[1, 1]));
        let id = table.id_of(name).unwrap();
        table.get(id).unwrap().clone()
    }

    #[test]
    fn reads_values() {
        let response = r#"{"ps":{"d1":1,"d2":0,"pwm1":42.5,"u12":true}}"#;

        assert_eq!(read_value(response, &switch("dc1")).unwrap(), 1.0);
        assert_eq!(read_value(response, &switch("dc2")).unwrap(), 0.0);
        assert_eq!(read_value(response, &switch("pwm1")).unwrap(), 42.5);
        assert_eq!(read_value(response, &switch("usbc12")).unwrap(), 1.0);
        assert_eq!(read_value(response, &switch("master_power")).unwrap(), 1.0);
    }

    #[test]
    fn version_replies() {
        assert_eq!(parse_version(r#"{"version":"2.1.0"}"#).unwrap(), "2.1.0");
        assert_eq!(parse_version(r#"{"version":3}"#).unwrap(), "3");
        assert!(matches!(
            parse_version(r#"{"ps":{}}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn master_power_off_when_everything_is() {
        let response = r#"{"ps":{"d1":0,"d2":0}}"#;

        assert_eq!(read_value(response, &switch("master_power")).unwrap(), 0.0);
    }

    #[test]
    fn missing_values_are_protocol_errors() {
        assert!(matches!(
            read_value(r#"{"ps":{"d1":1}}"#, &switch("dc2")),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            read_value(r#"{"dh":[]}"#, &switch("dc1")),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            read_value("nope", &switch("dc1")),
            Err(Error::Protocol(_))
        ));
    }
}
