//! The connection event loop and the handle used to drive it.
//!
//! All connection state lives in a single task: the socket, the map of
//! requests awaiting replies, and the reconnect policy.  Callers interact with
//! it exclusively through [`ConnectionHandle`], which pushes commands into an
//! mpsc channel; replies and connect results travel back over per-command
//! oneshot channels.  One loop owning everything means request correlation
//! never needs a lock and a reconnect can never race a concurrent dial.
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, trace, warn};

use crate::error::{ClientError, Result};
use crate::events::EventDispatcher;
use crate::models::ModelDecoder;
use crate::transport::{BoxedConnector, Peer};
use crate::types::{ErrorDetails, InboundMessage, JsonValue, Request};

/// If the event loop falls this many commands behind, callers block.
const COMMAND_CHANNEL_BOUNDS: usize = 16;

/// Request IDs are drawn from a process-wide counter so that two client
/// instances in the same process can never issue the same ID.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Where the connection currently stands, observable via [`ConnectionHandle::state`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Knobs controlling dialing and request behavior, set via the client builder.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionConfig {
    /// Dial attempts per connect or reconnect cycle.
    pub(crate) retries: u32,

    /// Delay before the second dial attempt; doubles per attempt after that.
    pub(crate) retry_delay: Duration,

    /// Cap on the doubling backoff delay.
    pub(crate) max_retry_delay: Duration,

    /// Re-dial automatically when an established connection drops, and dial
    /// lazily when a call is made while disconnected.
    pub(crate) auto_reconnect: bool,

    /// Fail calls whose reply does not arrive within this window.
    pub(crate) request_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(250),
            max_retry_delay: Duration::from_secs(5),
            auto_reconnect: true,
            request_timeout: None,
        }
    }
}

/// Successful or error reply to a single request, before interpretation.
#[derive(Debug)]
pub(crate) enum ReplyPayload {
    Success(JsonValue),
    Error(ErrorDetails),
}

enum Command {
    Connect {
        done_tx: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        done_tx: oneshot::Sender<()>,
    },
    Call {
        request: Request,
        response_tx: oneshot::Sender<Result<ReplyPayload>>,
    },
}

type EventLoopFuture = Shared<Pin<Box<dyn Future<Output = Result<(), String>> + Send>>>;

/// Spawn the connection event loop, returning the handle used to drive it.
///
/// Must be called within the context of a tokio runtime.
pub(crate) fn spawn_connection(
    config: ConnectionConfig,
    connector: Box<dyn BoxedConnector>,
    decoder: Arc<dyn ModelDecoder>,
    dispatcher: EventDispatcher,
    cancellation_token: CancellationToken,
) -> ConnectionHandle {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_BOUNDS);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let request_timeout = config.request_timeout;

    let connection = Connection {
        config,
        connector,
        decoder,
        dispatcher,
        peer: None,
        state_tx,
        pending: HashMap::new(),
        dispatches: JoinSet::new(),
        commands: commands_rx,
        cancellation_token: cancellation_token.clone(),
    };

    // Panics in the loop (or in buggy decoder hooks it invokes) are captured
    // into the shared result so every handle observes the failure.
    let event_loop_fut = std::panic::AssertUnwindSafe(connection.run_loop())
        .catch_unwind()
        .map(|result| match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "connection event loop exited with error");
                Err(e.to_string())
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "(non-string panic payload)".to_string());
                error!(message, "connection event loop panicked");
                Err(message)
            }
        })
        .instrument(Span::current())
        .boxed()
        .shared();

    tokio::spawn(event_loop_fut.clone());

    ConnectionHandle {
        commands: commands_tx,
        state_rx,
        cancellation_token,
        event_loop_fut,
        request_timeout,
    }
}

struct Connection {
    config: ConnectionConfig,
    connector: Box<dyn BoxedConnector>,
    decoder: Arc<dyn ModelDecoder>,
    dispatcher: EventDispatcher,
    peer: Option<Peer>,
    state_tx: watch::Sender<ConnectionState>,
    pending: HashMap<u64, oneshot::Sender<Result<ReplyPayload>>>,
    dispatches: JoinSet<()>,
    commands: mpsc::Receiver<Command>,
    cancellation_token: CancellationToken,
}

impl Connection {
    async fn run_loop(mut self) -> Result<()> {
        debug!(target = %self.connector.boxed_target(), "connection event loop starting");

        let result = loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        // Every handle is gone; nothing can reach us anymore.
                        None => break Ok(()),
                    }
                }
                frame = Self::receive_frame(self.peer.as_ref()) => {
                    match frame {
                        Ok(Some(frame)) => self.handle_frame(&frame),
                        Ok(None) => {
                            debug!("remote peer closed the connection");
                            self.handle_disconnect().await;
                        }
                        Err(e) => {
                            warn!(error = %e, "transport error reading from remote peer");
                            self.handle_disconnect().await;
                        }
                    }
                }
                Some(result) = self.dispatches.join_next(), if !self.dispatches.is_empty() => {
                    if let Err(e) = result {
                        // publish() already isolates handler panics, so this
                        // only fires on task cancellation.
                        debug!(error = %e, "event dispatch task did not complete");
                    }
                }
                _ = self.cancellation_token.cancelled() => {
                    debug!("connection event loop cancelled");
                    break Err(ClientError::Cancelled);
                }
            }
        };

        self.shutdown().await;

        match result {
            // Cancellation is the normal way a client shuts down.
            Err(ClientError::Cancelled) => Ok(()),
            other => other,
        }
    }

    /// Read the next frame from the peer, or pend forever when disconnected
    /// so the other select arms stay live.
    async fn receive_frame(peer: Option<&Peer>) -> Result<Option<String>> {
        match peer {
            Some(peer) => peer.receive_message().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { done_tx } => {
                let result = if self.peer.is_some() {
                    Ok(())
                } else {
                    self.dial_with_retry().await
                };
                let _ = done_tx.send(result);
            }
            Command::Disconnect { done_tx } => {
                if let Some(peer) = self.peer.take() {
                    if let Err(e) = peer.close().await {
                        debug!(error = %e, "error closing transport on disconnect");
                    }
                }
                let _ = self.state_tx.send(ConnectionState::Disconnected);
                self.fail_pending();
                let _ = done_tx.send(());
            }
            Command::Call { request, response_tx } => {
                self.handle_call(request, response_tx).await;
            }
        }
    }

    async fn handle_call(
        &mut self,
        request: Request,
        response_tx: oneshot::Sender<Result<ReplyPayload>>,
    ) {
        if self.peer.is_none() {
            if !self.config.auto_reconnect {
                let _ = response_tx.send(Err(ClientError::NotConnected));
                return;
            }
            if let Err(e) = self.dial_with_retry().await {
                let _ = response_tx.send(Err(e));
                return;
            }
        }
        let Some(peer) = self.peer.as_ref() else {
            let _ = response_tx.send(Err(ClientError::NotConnected));
            return;
        };

        let id = request.id;
        let method = request.method.clone();
        let frame = match request.into_string() {
            Ok(frame) => frame,
            Err(e) => {
                let _ = response_tx.send(Err(e));
                return;
            }
        };

        trace!(id, method, "sending request");
        match peer.send_message(frame).await {
            Ok(()) => {
                self.pending.insert(id, response_tx);
            }
            Err(e) => {
                warn!(id, method, error = %e, "failed to send request");
                let _ = response_tx.send(Err(e));
            }
        }
    }

    /// Dial the target up to `retries` times with doubling backoff in between.
    async fn dial_with_retry(&mut self) -> Result<()> {
        let target = self.connector.boxed_target();
        let _ = self.state_tx.send(ConnectionState::Connecting);

        let attempts = self.config.retries.max(1);
        let mut delay = self.config.retry_delay;
        let mut last_error: Option<ClientError> = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancellation_token.cancelled() => {
                        let _ = self.state_tx.send(ConnectionState::Disconnected);
                        return Err(ClientError::Cancelled);
                    }
                }
                delay = (delay * 2).min(self.config.max_retry_delay);
            }

            debug!(%target, attempt, attempts, "dialing");
            match self.connector.boxed_connect().await {
                Ok(peer) => {
                    debug!(%target, attempt, remote_peer = peer.remote_peer(), "connected");
                    self.peer = Some(peer);
                    let _ = self.state_tx.send(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    warn!(%target, attempt, error = %e, "dial attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let _ = self.state_tx.send(ConnectionState::Disconnected);
        Err(ClientError::Connect {
            url: target.into_owned(),
            attempts,
            source: Box::new(
                last_error.unwrap_or(ClientError::NotConnected),
            ),
        })
    }

    fn handle_frame(&mut self, frame: &str) {
        match crate::types::decode(frame, self.decoder.as_ref()) {
            InboundMessage::Response { id, result } => {
                self.resolve(id, Ok(ReplyPayload::Success(result)));
            }
            InboundMessage::Error { id, error } => {
                self.resolve(id, Ok(ReplyPayload::Error(error)));
            }
            InboundMessage::Event(event) => {
                trace!(event = event.name(), "dispatching event");
                self.dispatches
                    .spawn(self.dispatcher.publish(event).instrument(Span::current()));
            }
            // Already logged by the decoder; a broken frame fails no requests.
            InboundMessage::Malformed { .. } => {}
        }
    }

    fn resolve(&mut self, id: u64, reply: Result<ReplyPayload>) {
        match self.pending.remove(&id) {
            Some(response_tx) => {
                let _ = response_tx.send(reply);
            }
            // Timed-out or abandoned request; the reply has no taker.
            None => {
                debug!(id, "dropping reply with no matching pending request");
            }
        }
    }

    /// The established connection dropped out from under us.
    async fn handle_disconnect(&mut self) {
        self.peer = None;
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        self.fail_pending();

        if self.config.auto_reconnect && !self.cancellation_token.is_cancelled() {
            if let Err(e) = self.dial_with_retry().await {
                warn!(error = %e, "reconnect failed; will retry on next call");
            }
        }
    }

    /// Every in-flight request fails when the connection is lost; the reply
    /// can never arrive because a reconnected server has no memory of it.
    fn fail_pending(&mut self) {
        for (id, response_tx) in self.pending.drain() {
            trace!(id, "failing pending request");
            let _ = response_tx.send(Err(ClientError::ConnectionLost));
        }
    }

    async fn shutdown(&mut self) {
        debug!("connection shutting down");

        self.commands.close();
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Connect { done_tx } => {
                    let _ = done_tx.send(Err(ClientError::Cancelled));
                }
                Command::Disconnect { done_tx } => {
                    let _ = done_tx.send(());
                }
                Command::Call { response_tx, .. } => {
                    let _ = response_tx.send(Err(ClientError::ConnectionLost));
                }
            }
        }

        self.fail_pending();

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                debug!(error = %e, "error closing transport at shutdown");
            }
        }
        let _ = self.state_tx.send(ConnectionState::Disconnected);

        // Let in-flight event handlers finish.
        while self.dispatches.join_next().await.is_some() {}
    }
}

/// Cheaply cloneable handle to the connection event loop.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    cancellation_token: CancellationToken,
    event_loop_fut: EventLoopFuture,
    request_timeout: Option<Duration>,
}

impl ConnectionHandle {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub(crate) async fn connect(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { done_tx })
            .await
            .map_err(|_| ClientError::Cancelled)?;
        done_rx.await.map_err(|_| ClientError::Cancelled)?
    }

    pub(crate) async fn disconnect(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { done_tx })
            .await
            .map_err(|_| ClientError::Cancelled)?;
        done_rx.await.map_err(|_| ClientError::Cancelled)
    }

    /// Issue one request and wait for its reply.
    pub(crate) async fn call_raw(
        &self,
        method: impl Into<String>,
        params: Option<JsonValue>,
    ) -> Result<JsonValue> {
        let method = method.into();
        let request = Request::new(next_request_id(), method.clone(), params);

        let (response_tx, response_rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                request,
                response_tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionLost)?;

        let reply = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, response_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    return Err(ClientError::RequestTimeout { method, timeout });
                }
            },
            None => response_rx.await,
        };

        match reply {
            Ok(Ok(ReplyPayload::Success(result))) => Ok(result),
            Ok(Ok(ReplyPayload::Error(error))) => Err(ClientError::Remote { method, error }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                error!(method, "response channel dropped without a reply");
                Err(ClientError::ConnectionLost)
            }
        }
    }

    /// Stop the event loop and wait for it to wind down.
    pub(crate) async fn shutdown(&self) -> Result<(), String> {
        self.cancellation_token.cancel();
        self.event_loop_fut.clone().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_strictly_increase() {
        let first = next_request_id();
        let second = next_request_id();
        let third = next_request_id();
        assert!(first < second && second < third);
    }

    #[test]
    fn default_config_matches_documented_behavior() {
        let config = ConnectionConfig::default();
        assert_eq!(config.retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert!(config.auto_reconnect);
        assert!(config.request_timeout.is_none());
    }
}
