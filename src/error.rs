use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::types::ErrorDetails;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Everything a caller can see go wrong.
///
/// Malformed inbound frames are deliberately absent: those are logged and
/// dropped inside the read path and never surface as an error value.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The dial retry budget was exhausted without establishing a connection.
    #[error("Failed to connect to {url} after {attempts} attempt(s)")]
    Connect {
        url: String,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// A call was made while disconnected and auto-reconnect is disabled.
    #[error("Not connected")]
    NotConnected,

    /// The server answered a call with a JSON-RPC error object.
    #[error("Method '{method}' failed with code {}: {}", error.code.code(), error.message)]
    Remote { method: String, error: ErrorDetails },

    /// The connection dropped (or the client shut down) before a response to a
    /// tracked request arrived.
    #[error("Connection lost before a response was received")]
    ConnectionLost,

    /// No response arrived within the configured per-request window.
    #[error("Method '{method}' timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    #[error("Error serializing {type_name} to JSON")]
    SerRequest {
        #[source]
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("Error deserializing response into {type_name}")]
    DeserResponse {
        #[source]
        source: serde_json::Error,
        type_name: &'static str,
        response: JsonValue,
    },

    #[error("Transport error")]
    Transport {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Client shutdown was signaled while the operation was in progress.
    #[error("Operation cancelled by client shutdown")]
    Cancelled,
}
