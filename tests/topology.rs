use std::time::Duration;

use color_eyre::Result;
use pretty_assertions::assert_eq;
use sv241_gateway::{
    correlator::{CorrelatorHandle, CorrelatorSettings},
    error::Error,
    mock::{MockConnector, MockFirmware},
    status::ConnectionStatus,
    topology::{SharedSwitchTable, TopologySync},
};

mod common;
use common::*;

#[tokio::test]
async fn disabled_heater_is_hidden() -> Result<()> {
    let connector = MockConnector::simulated(MockFirmware::new(&[1, 5]));
    let gateway = start_gateway(connector);

    eventually("table synced", || gateway.table().load().len() == 10).await;

    let table = gateway.table().load();
    assert_eq!(table.get(8).unwrap().name, "pwm1");
    assert_eq!(table.get(9).unwrap().name, "master_power");
    assert_eq!(table.id_of("pwm2"), None);

    Ok(())
}

#[tokio::test]
async fn reenabled_heater_reappears_after_reconnect() -> Result<()> {
    let connector = MockConnector::simulated(MockFirmware::new(&[1, 5]));
    let gateway = start_gateway(connector.clone());

    eventually("first sync", || gateway.table().load().len() == 10).await;

    connector.with_firmware(|firmware| firmware.set_heater_modes(&[1, 1]));
    connector.unplug();

    eventually("resync", || gateway.table().load().len() == 11).await;

    let table = gateway.table().load();
    assert_eq!(table.id_of("pwm2"), Some(9));
    assert_eq!(table.id_of("master_power"), Some(10));
    assert!(connector.opens() >= 2);

    Ok(())
}

#[tokio::test]
async fn unusable_config_keeps_the_previous_table() -> Result<()> {
    let (connector, mut links) = MockConnector::scripted();
    let (correlator, _) = CorrelatorHandle::spawn(
        connector,
        ConnectionStatus::new(),
        CorrelatorSettings::default(),
    );
    let table = SharedSwitchTable::default();

    let sync = TopologySync::new(
        correlator,
        table.clone(),
        Duration::from_secs(2),
        Duration::ZERO,
    );

    let mut device = ScriptedDevice::new(links.recv().await.unwrap());

    let result = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.sync_once().await })
    };

    assert_eq!(device.next_line().await?, r#"{"get":"config"}"#);
    device.send(r#"{"dh":"not a list"}"#).await?;

    assert!(matches!(result.await?, Err(Error::ConfigParse(_))));
    assert_eq!(table.load().len(), 11);

    let result = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.sync_once().await })
    };

    device.next_line().await?;
    device.send(r#"{"dh":[{"m":5},{"m":5}]}"#).await?;

    assert_eq!(result.await??, 9);
    assert_eq!(table.load().len(), 9);

    Ok(())
}
