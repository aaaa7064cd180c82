//! Transport abstraction for the persistent connection.
//!
//! At this level a transport is nothing more than a bidirectional stream of
//! text frames: the connection logic neither knows nor cares whether the other
//! end is a real WebSocket (see [`crate::ws`]) or an in-memory channel pair in
//! a test.  A [`Connector`] is the piece that can establish such a transport,
//! which is what lets the connection re-dial the same target on reconnect.
use std::borrow::Cow;
use std::pin::Pin;

use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt, TryFutureExt};

use crate::error::{ClientError, Result};

/// A source and sink of text frames over one established connection.
pub trait Transport: Send + Sized + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Transport-specific identifier of the remote peer, for logging.
    fn remote_peer(&self) -> Cow<'static, str>;

    /// Send one frame.  Completes once the frame has been handed off to the
    /// underlying stream.
    fn send_message(
        &mut self,
        message: String,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` once the stream is closed and no more frames can
    /// arrive.  Must be cancellation-safe: dropping the future before it
    /// completes must not lose or truncate frames.
    fn receive_message(
        &mut self,
    ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + '_;

    /// Close the underlying stream.
    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

/// Something that can establish a [`Transport`] to a fixed target, repeatedly.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Human-readable dial target, used in logs and connect errors.
    fn target(&self) -> Cow<'static, str>;

    /// Attempt to establish a single connection.  Retry policy lives with the
    /// caller, not here.
    fn connect(&self) -> impl Future<Output = Result<Self::Transport, Self::Error>> + Send + '_;
}

/// Internal dyn-compatible wrapper around [`Transport`] to erase the types and
/// allow dynamic dispatch.
trait BoxedTransport: Send + 'static {
    fn boxed_remote_peer(&self) -> Cow<'static, str>;
    fn boxed_send_message(
        &mut self,
        message: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
    fn boxed_receive_message(&mut self)
    -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>>;
    fn boxed_close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

impl<T> BoxedTransport for T
where
    T: Transport + 'static,
{
    fn boxed_remote_peer(&self) -> Cow<'static, str> {
        <Self as Transport>::remote_peer(self)
    }

    fn boxed_send_message(
        &mut self,
        message: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        <Self as Transport>::send_message(self, message)
            .map_err(|e| ClientError::Transport { source: Box::new(e) })
            .boxed()
    }

    fn boxed_receive_message(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        <Self as Transport>::receive_message(self)
            .map_err(|e| ClientError::Transport { source: Box::new(e) })
            .boxed()
    }

    fn boxed_close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        <Self as Transport>::close(self)
            .map_err(|e| ClientError::Transport { source: Box::new(e) })
            .boxed()
    }
}

/// Dyn-compatible wrapper around [`Connector`], mirroring [`BoxedTransport`].
pub(crate) trait BoxedConnector: Send + Sync + 'static {
    fn boxed_target(&self) -> Cow<'static, str>;
    fn boxed_connect(&self) -> Pin<Box<dyn Future<Output = Result<Peer>> + Send + '_>>;
}

impl<C> BoxedConnector for C
where
    C: Connector + 'static,
{
    fn boxed_target(&self) -> Cow<'static, str> {
        <Self as Connector>::target(self)
    }

    fn boxed_connect(&self) -> Pin<Box<dyn Future<Output = Result<Peer>> + Send + '_>> {
        async move {
            let transport = self
                .connect()
                .await
                .map_err(|e| ClientError::Transport { source: Box::new(e) })?;
            Ok(Peer::new(transport))
        }
        .boxed()
    }
}

/// Box a connector for storage behind dynamic dispatch.
pub(crate) fn boxed(connector: impl Connector) -> Box<dyn BoxedConnector> {
    Box::new(connector)
}

/// Implement transport on a stream/sink pair, mainly for testing with
/// in-memory channels.  Production connections come from [`crate::ws`].
impl<In, InErr, Out> Transport for (In, Out)
where
    In: Stream<Item = Result<String, InErr>> + Unpin + Send + 'static,
    InErr: std::error::Error + Send + Sync + 'static,
    Out: Sink<String> + Unpin + Send + 'static,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    type Error = ClientError;

    fn remote_peer(&self) -> Cow<'static, str> {
        format!(
            "({}, {})",
            std::any::type_name::<In>(),
            std::any::type_name::<Out>(),
        )
        .into()
    }

    fn send_message(
        &mut self,
        message: String,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        self.1
            .send(message)
            .map_err(|e| ClientError::Transport { source: Box::new(e) })
    }

    fn receive_message(
        &mut self,
    ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + '_ {
        self.0.next().map(|opt_result: Option<Result<_, InErr>>| {
            opt_result
                .transpose()
                .map_err(|e| ClientError::Transport { source: Box::new(e) })
        })
    }

    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        self.1
            .close()
            .map_err(|e| ClientError::Transport { source: Box::new(e) })
    }
}

/// Higher-level wrapper around a boxed [`Transport`].
///
/// Provides a `Sync` surface (send and receive through `&self`) so the
/// connection event loop can select over reads while holding the peer in a
/// plain struct field.
pub(crate) struct Peer {
    remote_peer: String,
    transport: tokio::sync::Mutex<Box<dyn BoxedTransport>>,
}

impl Peer {
    pub(crate) fn new(transport: impl Transport) -> Self {
        Self {
            remote_peer: transport.remote_peer().to_string(),
            transport: tokio::sync::Mutex::new(Box::new(transport)),
        }
    }

    pub(crate) fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    /// Send one already-serialized frame to the remote peer.
    pub(crate) async fn send_message(&self, message: String) -> Result<()> {
        self.transport.lock().await.boxed_send_message(message).await
    }

    /// Receive the next frame, or `None` once the peer has closed the stream.
    pub(crate) async fn receive_message(&self) -> Result<Option<String>> {
        self.transport.lock().await.boxed_receive_message().await
    }

    pub(crate) async fn close(&self) -> Result<()> {
        self.transport.lock().await.boxed_close().await
    }
}
