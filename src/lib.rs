//! Async client for a music server's JSON-RPC 2.0 API over a persistent
//! WebSocket connection.
//!
//! One connection carries two kinds of traffic at once: request/response
//! pairs correlated by numeric ID, and unsolicited server events fanned out
//! to registered handlers.  [`Client`] is the entry point; namespaced methods
//! are exposed through its controller accessors ([`Client::playback`],
//! [`Client::mixer`], ...) and events through [`Client::on`] and the typed
//! `on_*` variants.
//!
//! ```no_run
//! # async fn example() -> mopidy_ws::Result<()> {
//! let client = mopidy_ws::Client::builder("ws://localhost:6680/mopidy/ws").build();
//!
//! let _sub = client.on_volume_changed(|volume| async move {
//!     println!("volume is now {volume}");
//! });
//!
//! client.connect().await?;
//! client.tracklist().add(&["local:track:a.flac"]).await?;
//! client.playback().play().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
pub mod controllers;
mod error;
mod events;
mod models;
#[cfg(test)]
pub mod testing;
mod transport;
mod types;
mod ws;

pub use client::{Client, ClientBuilder};
pub use connection::ConnectionState;
pub use error::{ClientError, Result};
pub use events::{CoreEvent, Subscription};
pub use models::{IdentityDecoder, ModelDecoder};
pub use transport::{Connector, Transport};
pub use types::{ErrorCode, ErrorDetails, InboundMessage, JsonValue, Request, TwoPointZero, decode};
pub use ws::{WsConnector, WsTransport};
