//! The Alpaca `switch` device, number 0.
//!
//! Members are routed by name, see [`get_member`] and [`put_member`].

use std::collections::HashMap;

use axum::{
    extract::{Form, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension,
};
use tracing::debug;

use super::{params::AlpacaParams, DEVICE_NAME, INTERFACE_VERSION};
use crate::{
    error::Error,
    gateway::Gateway,
    status::ConnectionState,
    topology::{Switch, SwitchKind},
};

/// The only device number served.
pub const DEVICE_NUMBER: u32 = 0;

fn check_device(device_number: u32) -> Result<(), Response> {
    if device_number == DEVICE_NUMBER {
        Ok(())
    } else {
        Err((
            StatusCode::BAD_REQUEST,
            format!("No switch device with number {device_number}"),
        )
            .into_response())
    }
}

fn unknown_member(member: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        format!("Unknown switch member `{member}`"),
    )
        .into_response()
}

fn description(switch: &Switch) -> String {
    match switch.kind {
        SwitchKind::Power => format!("Power output `{}`", switch.short_key),
        SwitchKind::DewHeater => format!("Dew heater `{}`, value in percent", switch.short_key),
        SwitchKind::MasterPower => "Switches every output at once".into(),
    }
}

pub(crate) async fn get_handler(
    Path((device_number, member)): Path<(u32, String)>,
    Extension(gateway): Extension<Gateway>,
    Query(raw): Query<HashMap<String, String>>,
) -> Response {
    if let Err(response) = check_device(device_number) {
        return response;
    }

    get_member(&gateway, &member, AlpacaParams::from(raw)).await
}

pub(crate) async fn put_handler(
    Path((device_number, member)): Path<(u32, String)>,
    Extension(gateway): Extension<Gateway>,
    Form(raw): Form<HashMap<String, String>>,
) -> Response {
    if let Err(response) = check_device(device_number) {
        return response;
    }

    put_member(&gateway, &member, AlpacaParams::from(raw)).await
}

/// Answer a GET of a switch member.
pub async fn get_member(gateway: &Gateway, member: &str, params: AlpacaParams) -> Response {
    let counters = gateway.counters();

    if let Some(id) = params.client_transaction_id() {
        counters.observe_client(id);
    }

    debug!(%member, "GET");

    match member.to_lowercase().as_str() {
        "connected" => counters
            .envelope(Ok(gateway.connection_state() == ConnectionState::Connected))
            .into_response(),
        "name" => counters.envelope(Ok(DEVICE_NAME)).into_response(),
        "description" => counters
            .envelope(Ok("SV241 power box, served over Alpaca"))
            .into_response(),
        "driverinfo" => counters
            .envelope(Ok(format!(
                "{} v{}, a gateway from Alpaca to the SV241 serial protocol",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )))
            .into_response(),
        "driverversion" => counters
            .envelope(Ok(env!("CARGO_PKG_VERSION")))
            .into_response(),
        "interfaceversion" => counters.envelope(Ok(INTERFACE_VERSION)).into_response(),
        "supportedactions" => counters
            .envelope(Ok(Vec::<String>::new()))
            .into_response(),
        "maxswitch" => counters
            .envelope(Ok(gateway.table().load().len() as i32))
            .into_response(),
        "canwrite" => counters
            .envelope(with_switch(gateway, &params).map(|_| true))
            .into_response(),
        "getswitchname" => counters
            .envelope(with_switch(gateway, &params).map(|switch| gateway.display_name(&switch)))
            .into_response(),
        "getswitchdescription" => counters
            .envelope(with_switch(gateway, &params).map(|switch| description(&switch)))
            .into_response(),
        "minswitchvalue" => counters
            .envelope(with_switch(gateway, &params).map(|_| 0.0))
            .into_response(),
        "maxswitchvalue" => counters
            .envelope(with_switch(gateway, &params).map(|switch| switch.max_value()))
            .into_response(),
        "switchstep" => counters
            .envelope(with_switch(gateway, &params).map(|_| 1.0))
            .into_response(),
        "getswitch" => {
            let result = match with_switch(gateway, &params) {
                Ok(switch) => gateway.switch_value(&switch).await.map(|value| value > 0.0),
                Err(e) => Err(e),
            };

            counters.envelope(result).into_response()
        }
        "getswitchvalue" => {
            let result = match with_switch(gateway, &params) {
                Ok(switch) => gateway.switch_value(&switch).await,
                Err(e) => Err(e),
            };

            counters.envelope(result).into_response()
        }
        other => unknown_member(other),
    }
}

/// Answer a PUT of a switch member.
pub async fn put_member(gateway: &Gateway, member: &str, params: AlpacaParams) -> Response {
    let counters = gateway.counters();

    if let Some(id) = params.client_transaction_id() {
        counters.observe_client(id);
    }

    debug!(%member, "PUT");

    match member.to_lowercase().as_str() {
        "connected" => {
            let result = params.bool("Connected").and_then(|connect| {
                // Disconnecting is a no-op, the link is shared by every client.
                if connect && gateway.connection_state() != ConnectionState::Connected {
                    Err(Error::LinkDown)
                } else {
                    Ok(())
                }
            });

            counters.empty(result).into_response()
        }
        "action" | "commandbool" => counters
            .empty(Err(Error::NotImplemented(member.to_string())))
            .into_response(),
        "commandblind" => {
            let result = match params.string("Command") {
                Ok(command) => gateway.command(command, false).await.map(|_| ()),
                Err(e) => Err(e),
            };

            counters.empty(result).into_response()
        }
        "commandstring" => {
            let result = match params.string("Command") {
                Ok(command) => gateway.command(command, true).await,
                Err(e) => Err(e),
            };

            counters.envelope(result).into_response()
        }
        "setswitchname" => {
            let result = with_switch(gateway, &params).and_then(|switch| {
                let name = params.string("Name")?;
                gateway.set_display_name(&switch, name);

                Ok(())
            });

            counters.empty(result).into_response()
        }
        "setswitch" => {
            let result = match with_switch(gateway, &params).and_then(|switch| {
                let state = params.bool("State")?;
                Ok((switch, state))
            }) {
                Ok((switch, state)) => {
                    let value = if state { switch.max_value() } else { 0.0 };
                    gateway.set_switch_value(&switch, value).await
                }
                Err(e) => Err(e),
            };

            counters.empty(result).into_response()
        }
        "setswitchvalue" => {
            let result = match with_switch(gateway, &params).and_then(|switch| {
                let value = params.f64("Value")?;
                Ok((switch, value))
            }) {
                Ok((switch, value)) => gateway.set_switch_value(&switch, value).await,
                Err(e) => Err(e),
            };

            counters.empty(result).into_response()
        }
        other => unknown_member(other),
    }
}

fn with_switch(gateway: &Gateway, params: &AlpacaParams) -> Result<Switch, Error> {
    gateway.switch(params.id()?)
}
