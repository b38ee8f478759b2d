use std::sync::atomic::{AtomicU32, Ordering};

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Error;

/// The wrapper every Alpaca device response comes in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Echo of the last transaction id a client sent.
    #[serde(rename = "ClientTransactionID")]
    pub client_transaction_id: u32,

    /// Counts responses.
    #[serde(rename = "ServerTransactionID")]
    pub server_transaction_id: u32,

    /// Zero for success, an ASCOM error number otherwise.
    #[serde(rename = "ErrorNumber")]
    pub error_number: i32,

    /// Empty for success.
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,

    /// The response value. Absent for errors and for methods without a value.
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none", default)]
    pub value: Option<T>,
}

impl<T> Envelope<T> {
    /// A response with transaction ids 0, as management responses have.
    pub fn unsequenced(value: T) -> Self {
        Self {
            client_transaction_id: 0,
            server_transaction_id: 0,
            error_number: 0,
            error_message: String::new(),
            value: Some(value),
        }
    }

    /// Whether this carries an error.
    pub fn is_error(&self) -> bool {
        self.error_number != 0
    }
}

impl Envelope<bool> {
    /// Show an example of a successful response.
    pub fn example() -> Self {
        Self {
            client_transaction_id: 17,
            server_transaction_id: 42,
            error_number: 0,
            error_message: String::new(),
            value: Some(true),
        }
    }
}

impl Envelope<()> {
    /// Show an example of an error response.
    pub fn example_error() -> Self {
        let error = Error::Timeout(2000);

        Self {
            client_transaction_id: 17,
            server_transaction_id: 43,
            error_number: error.error_number(),
            error_message: error.to_string(),
            value: None,
        }
    }
}

/// Errors are reported in the envelope, so every envelope is HTTP 200.
impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// The transaction ids that go into envelopes.
///
/// Alpaca clients send a `ClientTransactionID` with their requests.
/// The gateway echoes the last one seen from any client, which is not necessarily
/// the one that sent the request being answered.
#[derive(Debug, Default)]
pub struct TransactionCounters {
    server: AtomicU32,
    last_client: AtomicU32,
}

impl TransactionCounters {
    /// Remember a client's transaction id.
    pub fn observe_client(&self, id: u32) {
        self.last_client.store(id, Ordering::SeqCst);
    }

    /// The last client transaction id seen.
    pub fn last_client(&self) -> u32 {
        self.last_client.load(Ordering::SeqCst)
    }

    /// Take the next server transaction id. The first one is 1.
    pub fn next_server(&self) -> u32 {
        self.server.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Wrap a result which has a value.
    pub fn envelope<T>(&self, result: Result<T, Error>) -> Envelope<T> {
        let client_transaction_id = self.last_client();
        let server_transaction_id = self.next_server();

        match result {
            Ok(value) => Envelope {
                client_transaction_id,
                server_transaction_id,
                error_number: 0,
                error_message: String::new(),
                value: Some(value),
            },
            Err(e) => {
                let error_number = e.error_number();
                error!("Alpaca error {error_number:#x}: {e}");

                Envelope {
                    client_transaction_id,
                    server_transaction_id,
                    error_number,
                    error_message: e.to_string(),
                    value: None,
                }
            }
        }
    }

    /// Wrap a result of a method which has no value.
    pub fn empty(&self, result: Result<(), Error>) -> Envelope<()> {
        let mut envelope = self.envelope(result);
        envelope.value = None;

        envelope
    }
}
