use std::time::Duration;

use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::Value;
use sv241_gateway::{
    correlator::{CorrelatorHandle, CorrelatorSettings},
    error::Error,
    mock::MockConnector,
    status::{ConnectionState, ConnectionStatus},
};
use tokio::{io::DuplexStream, sync::mpsc};

mod common;
use common::*;

fn settings() -> CorrelatorSettings {
    CorrelatorSettings {
        reconnect_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn scripted() -> Result<(
    CorrelatorHandle,
    MockConnector,
    mpsc::UnboundedReceiver<DuplexStream>,
    ScriptedDevice,
)> {
    let (connector, mut links) = MockConnector::scripted();
    let (correlator, _) =
        CorrelatorHandle::spawn(connector.clone(), ConnectionStatus::new(), settings());

    let device = ScriptedDevice::new(
        links
            .recv()
            .await
            .ok_or_else(|| color_eyre::eyre::eyre!("No link opened"))?,
    );

    Ok((correlator, connector, links, device))
}

const LONG: Duration = Duration::from_secs(3);

#[tokio::test]
async fn concurrent_callers_get_their_own_responses() -> Result<()> {
    let (correlator, _connector, _links, mut device) = scripted().await?;

    let callers = (0..5)
        .map(|i| {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                let response = correlator
                    .execute(format!(r#"{{"get":"thing{i}"}}"#), true, LONG)
                    .await;
                (i, response)
            })
        })
        .collect::<Vec<_>>();

    for _ in 0..5 {
        let line = device.next_line().await?;

        // Exactly one command on the wire at a time.
        assert!(device.is_quiet_for(Duration::from_millis(50)).await);

        let request: Value = serde_json::from_str(&line)?;
        device
            .send(&format!(r#"{{"answer":{}}}"#, request["get"]))
            .await?;
    }

    for caller in callers {
        let (i, response) = caller.await?;
        let response: Value = serde_json::from_str(&response?)?;

        assert_eq!(response["answer"], format!("thing{i}"));
    }

    Ok(())
}

#[tokio::test]
async fn late_response_is_not_delivered_to_the_next_caller() -> Result<()> {
    let (correlator, _connector, _links, mut device) = scripted().await?;

    let slow = {
        let correlator = correlator.clone();
        tokio::spawn(async move {
            correlator
                .execute(r#"{"get":"slow"}"#, true, Duration::from_millis(100))
                .await
        })
    };

    assert_eq!(device.next_line().await?, r#"{"get":"slow"}"#);

    let timed_out = slow.await?;
    assert_eq!(timed_out, Err(Error::Timeout(100)));

    // The device gets around to answering after all.
    device.send(r#"{"answer":"slow"}"#).await?;

    let fast = {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.execute(r#"{"get":"fast"}"#, true, LONG).await })
    };

    assert_eq!(device.next_line().await?, r#"{"get":"fast"}"#);
    device.send(r#"{"answer":"fast"}"#).await?;

    assert_eq!(fast.await??, r#"{"answer":"fast"}"#);

    Ok(())
}

#[tokio::test]
async fn link_failure_fails_every_pending_command() -> Result<()> {
    let (correlator, _connector, mut links, mut device) = scripted().await?;
    let status = correlator.status().clone();
    let mut transitions = status.subscribe();

    let callers = (0..3)
        .map(|i| {
            let correlator = correlator.clone();
            tokio::spawn(
                async move { correlator.execute(format!("{{\"n\":{i}}}"), true, LONG).await },
            )
        })
        .collect::<Vec<_>>();

    device.next_line().await?;
    // Let the others queue up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(device);

    for caller in callers {
        assert_eq!(caller.await?, Err(Error::LinkDown));
    }

    // The worker reconnects on its own.
    let _device = ScriptedDevice::new(
        tokio::time::timeout(LONG, links.recv())
            .await?
            .ok_or_else(|| color_eyre::eyre::eyre!("No reconnect"))?,
    );
    eventually("reconnected", || status.get() == ConnectionState::Connected).await;

    let mut disconnects = 0;
    while let Ok(event) = transitions.try_recv() {
        if event.state == ConnectionState::Disconnected {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);

    Ok(())
}

#[tokio::test]
async fn blind_command_resolves_once_written() -> Result<()> {
    let (correlator, _connector, _links, mut device) = scripted().await?;

    let response = correlator.execute(r#"{"set":{"d1":1}}"#, false, LONG).await?;

    assert_eq!(response, "");
    assert_eq!(device.next_line().await?, r#"{"set":{"d1":1}}"#);

    Ok(())
}

#[tokio::test]
async fn chatter_is_skipped_and_device_errors_are_reported() -> Result<()> {
    let (correlator, _connector, _links, mut device) = scripted().await?;

    let caller = {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.execute(r#"{"get":"status"}"#, true, LONG).await })
    };

    device.next_line().await?;
    device.send("Heater PID tick").await?;
    device.send(r#"{"ps":{"d1":0}}"#).await?;

    assert_eq!(caller.await??, r#"{"ps":{"d1":0}}"#);

    let caller = {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.execute(r#"{"get":"nope"}"#, true, LONG).await })
    };

    device.next_line().await?;
    device.send(r#"{"error":"unknown get"}"#).await?;

    assert!(matches!(caller.await?, Err(Error::Protocol(_))));

    Ok(())
}

#[tokio::test]
async fn commands_fail_fast_while_the_device_is_missing() -> Result<()> {
    let (connector, _links) = MockConnector::scripted();
    connector.set_available(false);

    let (correlator, _) =
        CorrelatorHandle::spawn(connector.clone(), ConnectionStatus::new(), settings());

    let started = tokio::time::Instant::now();
    let result = correlator.execute(r#"{"get":"status"}"#, true, LONG).await;

    assert_eq!(result, Err(Error::LinkDown));
    assert!(started.elapsed() < LONG);
    assert_ne!(correlator.status().get(), ConnectionState::Connected);

    Ok(())
}

#[tokio::test]
async fn abandoned_command_does_not_block_the_queue() -> Result<()> {
    let (correlator, _connector, _links, mut device) = scripted().await?;

    let abandoned = {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.execute(r#"{"get":"a"}"#, true, LONG).await })
    };

    device.next_line().await?;
    abandoned.abort();
    let _ = abandoned.await;

    let next = {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.execute(r#"{"get":"b"}"#, true, LONG).await })
    };

    assert_eq!(device.next_line().await?, r#"{"get":"b"}"#);
    device.send(r#"{"b":1}"#).await?;

    assert_eq!(next.await??, r#"{"b":1}"#);

    Ok(())
}

#[tokio::test]
async fn expired_command_is_never_written_after_chatter() -> Result<()> {
    let (correlator, _connector, _links, mut device) = scripted().await?;

    // Leaves a response owed.
    let first = correlator
        .execute(r#"{"get":"slow"}"#, true, Duration::from_millis(100))
        .await;
    assert_eq!(first, Err(Error::Timeout(100)));
    assert_eq!(device.next_line().await?, r#"{"get":"slow"}"#);

    let set = {
        let correlator = correlator.clone();
        tokio::spawn(async move {
            correlator
                .execute(r#"{"set":{"d1":1}}"#, true, Duration::from_millis(200))
                .await
        })
    };

    // The heater controller prints faster than the link can go quiet.
    let chatty_until = tokio::time::Instant::now() + Duration::from_millis(800);
    while tokio::time::Instant::now() < chatty_until {
        device.send("PID tick").await?;
        assert!(
            device.is_quiet_for(Duration::from_millis(30)).await,
            "Command written while the device was still talking"
        );
    }

    assert_eq!(set.await?, Err(Error::Timeout(200)));
    assert!(device.is_quiet_for(Duration::from_millis(300)).await);

    // Once things calm down commands go through again.
    let next = {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.execute(r#"{"get":"status"}"#, true, LONG).await })
    };

    assert_eq!(device.next_line().await?, r#"{"get":"status"}"#);
    device.send(r#"{"ps":{"d1":0}}"#).await?;

    assert_eq!(next.await??, r#"{"ps":{"d1":0}}"#);

    Ok(())
}
