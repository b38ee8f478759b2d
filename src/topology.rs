//! Which switches the gateway exposes, and under which ids.
//!
//! Alpaca clients address switches by a dense integer id.
//! The SV241 lets the user disable dew heaters, and a disabled heater
//! should not show up as a switch at all.
//! So the id table is rebuilt from the firmware configuration each time
//! the device (re)connects.
//!
//! The table is replaced as a whole, never patched.
//! Readers load an `Arc` of the current table and are never blocked by a rebuild:
//!
//! ```text
//! Reader ──► load() ──► Arc<SwitchTable> ──► read
//! Sync   ──► build new table ──► store() ──► atomic swap
//! ```

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    correlator::CorrelatorHandle,
    error::Error,
    status::{ConnectionState, ConnectionStatus},
};

/// The heater mode meaning "disabled" in the firmware.
pub const HEATER_DISABLED: u8 = 5;

/// Channels which always exist, in id order: (internal name, short wire key).
pub const STANDARD_SWITCHES: [(&str, &str); 8] = [
    ("dc1", "d1"),
    ("dc2", "d2"),
    ("dc3", "d3"),
    ("dc4", "d4"),
    ("dc5", "d5"),
    ("usbc12", "u12"),
    ("usb345", "u34"),
    ("adj_conv", "adj"),
];

/// Internal name of the master power switch.
pub const MASTER_POWER_NAME: &str = "master_power";

/// Short wire key of the master power switch.
pub const MASTER_POWER_KEY: &str = "all";

/// The query answered with the firmware configuration.
pub const CONFIG_QUERY: &str = r#"{"get":"config"}"#;

/// What kind of channel a switch is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchKind {
    /// A DC/USB output or the adjustable converter. On or off.
    Power,

    /// A dew heater. Its value is the PWM duty in percent.
    DewHeater,

    /// Switches every output at once.
    MasterPower,
}

/// A switch as exposed over Alpaca.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Switch {
    /// The internal name, like `dc1` or `pwm2`.
    /// Display name overrides are keyed by this.
    pub name: String,

    /// The key used on the wire, like `d1`.
    pub short_key: String,

    /// What kind of channel this is.
    pub kind: SwitchKind,
}

impl Switch {
    fn new(name: &str, short_key: &str, kind: SwitchKind) -> Self {
        Self {
            name: name.into(),
            short_key: short_key.into(),
            kind,
        }
    }

    fn heater(position: usize) -> Self {
        let name = format!("pwm{position}");
        Self::new(&name, &name, SwitchKind::DewHeater)
    }

    /// The largest value the switch takes.
    pub fn max_value(&self) -> f64 {
        match self.kind {
            SwitchKind::DewHeater => 100.0,
            SwitchKind::Power | SwitchKind::MasterPower => 1.0,
        }
    }
}

/// One dew heater as the firmware describes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaterConfig {
    /// The heater mode. [`HEATER_DISABLED`] means disabled.
    #[serde(rename = "m")]
    pub mode: u8,
}

/// The part of the firmware configuration the switch table depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Dew heaters in firmware order.
    #[serde(rename = "dh", default)]
    pub heaters: Vec<HeaterConfig>,
}

impl FirmwareConfig {
    /// Parse the device's response to [`CONFIG_QUERY`].
    pub fn parse(response: &str) -> Result<Self, Error> {
        serde_json::from_str(response).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    /// A configuration with heaters in the given modes.
    pub fn with_modes(modes: &[u8]) -> Self {
        Self {
            heaters: modes.iter().map(|&mode| HeaterConfig { mode }).collect(),
        }
    }
}

/// Maps switch ids `0..len()` to switches.
///
/// Ids are contiguous. The standard channels come first in a fixed order,
/// then enabled heaters in firmware order, and master power is always last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchTable {
    switches: Vec<Switch>,
}

impl Default for SwitchTable {
    /// What is exposed before the firmware has been asked: two enabled heaters.
    fn default() -> Self {
        Self::from_firmware(&FirmwareConfig::with_modes(&[0, 0]))
    }
}

impl SwitchTable {
    /// Build the table for a firmware configuration.
    pub fn from_firmware(config: &FirmwareConfig) -> Self {
        let mut switches = STANDARD_SWITCHES
            .iter()
            .map(|(name, short_key)| Switch::new(name, short_key, SwitchKind::Power))
            .collect::<Vec<_>>();

        for (index, heater) in config.heaters.iter().enumerate() {
            if heater.mode == HEATER_DISABLED {
                info!(
                    "Heater PWM{} is disabled in firmware, hiding it from the switch list",
                    index + 1
                );
            } else {
                switches.push(Switch::heater(index + 1));
            }
        }

        switches.push(Switch::new(
            MASTER_POWER_NAME,
            MASTER_POWER_KEY,
            SwitchKind::MasterPower,
        ));

        Self { switches }
    }

    /// Number of switches.
    pub fn len(&self) -> usize {
        self.switches.len()
    }

    /// Never true, master power is always there.
    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }

    /// The switch with this id.
    pub fn get(&self, id: usize) -> Option<&Switch> {
        self.switches.get(id)
    }

    /// The id of the switch with this internal name.
    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.switches.iter().position(|switch| switch.name == name)
    }

    /// Iterate `(id, switch)` in id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Switch)> {
        self.switches.iter().enumerate()
    }
}

/// The live switch table, shared between the synchronizer and every reader.
#[derive(Debug, Clone)]
pub struct SharedSwitchTable(Arc<ArcSwap<SwitchTable>>);

impl Default for SharedSwitchTable {
    fn default() -> Self {
        Self::new(SwitchTable::default())
    }
}

impl SharedSwitchTable {
    /// Start out with this table.
    pub fn new(table: SwitchTable) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(table)))
    }

    /// The current table.
    /// Later swaps do not affect the returned snapshot.
    pub fn load(&self) -> Arc<SwitchTable> {
        self.0.load_full()
    }

    /// Replace the table.
    pub fn store(&self, table: SwitchTable) {
        self.0.store(Arc::new(table));
    }
}

/// Rebuilds the switch table after every (re)connect.
#[derive(Debug, Clone)]
pub struct TopologySync {
    correlator: CorrelatorHandle,
    table: SharedSwitchTable,
    timeout: Duration,
    settle_delay: Duration,
}

impl TopologySync {
    /// The config query uses `timeout`.
    /// After connecting, wait `settle_delay` before asking, the firmware
    /// reads its own configuration right after the port opens.
    pub fn new(
        correlator: CorrelatorHandle,
        table: SharedSwitchTable,
        timeout: Duration,
        settle_delay: Duration,
    ) -> Self {
        Self {
            correlator,
            table,
            timeout,
            settle_delay,
        }
    }

    /// Ask the firmware for its configuration and swap in a new table.
    /// Returns the number of switches now exposed.
    ///
    /// On failure the previous table stays.
    pub async fn sync_once(&self) -> Result<usize, Error> {
        info!("Syncing switch configuration with firmware");

        let response = self
            .correlator
            .execute(CONFIG_QUERY, true, self.timeout)
            .await?;

        let config = FirmwareConfig::parse(&response)?;
        let table = SwitchTable::from_firmware(&config);
        let switches = table.len();

        info!(
            "Switch configuration sync complete, {switches} switches: {}",
            table.iter().map(|(_, switch)| &switch.name).join(", ")
        );

        self.table.store(table);

        Ok(switches)
    }

    /// Run [`Self::sync_once`] after every transition into [`ConnectionState::Connected`].
    ///
    /// Subscribes before returning, so no transition after this call is missed.
    pub fn spawn(self, status: &ConnectionStatus) -> JoinHandle<()> {
        let mut transitions = status.subscribe();
        let already_connected = status.get() == ConnectionState::Connected;

        tokio::spawn(
            async move {
                if already_connected {
                    self.settle_and_sync().await;
                }

                loop {
                    match transitions.recv().await {
                        Ok(event) if event.state == ConnectionState::Connected => {
                            self.settle_and_sync().await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Missed {skipped} status event(s)");

                            if self.correlator.status().get() == ConnectionState::Connected {
                                self.settle_and_sync().await;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            .instrument(info_span!("topology")),
        )
    }

    async fn settle_and_sync(&self) {
        tokio::time::sleep(self.settle_delay).await;

        if let Err(e) = self.sync_once().await {
            error!("Failed to sync firmware config: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn names(table: &SwitchTable) -> Vec<&str> {
        table.iter().map(|(_, switch)| switch.name.as_str()).collect()
    }

    #[test]
    fn one_heater_disabled() {
        let table = SwitchTable::from_firmware(&FirmwareConfig::with_modes(&[1, 5]));

        assert_eq!(table.len(), 10);
        assert_eq!(
            names(&table),
            vec![
                "dc1",
                "dc2",
                "dc3",
                "dc4",
                "dc5",
                "usbc12",
                "usb345",
                "adj_conv",
                "pwm1",
                "master_power"
            ]
        );
        assert_eq!(table.get(8).unwrap().short_key, "pwm1");
        assert_eq!(table.get(9).unwrap().short_key, "all");
        assert_eq!(table.id_of("pwm2"), None);
    }

    #[test]
    fn first_heater_disabled_keeps_firmware_position_name() {
        let table = SwitchTable::from_firmware(&FirmwareConfig::with_modes(&[5, 2]));

        assert_eq!(table.id_of("pwm2"), Some(8));
        assert_eq!(table.id_of("pwm1"), None);
    }

    #[test]
    fn no_heaters() {
        let table = SwitchTable::from_firmware(&FirmwareConfig::default());

        assert_eq!(table.len(), 9);
        assert_eq!(table.id_of("master_power"), Some(8));
    }

    #[test]
    fn default_has_both_heaters() {
        let table = SwitchTable::default();

        assert_eq!(table.id_of("pwm1"), Some(8));
        assert_eq!(table.id_of("pwm2"), Some(9));
        assert_eq!(table.id_of("master_power"), Some(10));
    }

    #[test]
    fn parse_ignores_other_fields() {
        let config =
            FirmwareConfig::parse(r#"{"dh":[{"m":1,"o":2.5},{"m":5}],"ps":{"d1":1}}"#).unwrap();

        assert_eq!(config, FirmwareConfig::with_modes(&[1, 5]));
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = FirmwareConfig::parse(r#"{"dh":"nope"}"#).unwrap_err();

        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn loaded_snapshot_survives_store() {
        let shared = SharedSwitchTable::default();
        let before = shared.load();

        shared.store(SwitchTable::from_firmware(&FirmwareConfig::with_modes(&[5, 5])));

        assert_eq!(before.len(), 11);
        assert_eq!(shared.load().len(), 9);
    }
}
