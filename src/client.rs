//! The public client: builder, request API, and event subscriptions.
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::warn;

use crate::connection::{
    ConnectionConfig, ConnectionHandle, ConnectionState, spawn_connection,
};
use crate::controllers::{
    HistoryController, LibraryController, MixerController, PlaybackController,
    PlaylistsController, TracklistController,
};
use crate::error::{ClientError, Result};
use crate::events::{CoreEvent, EventDispatcher, Subscription};
use crate::models::{IdentityDecoder, ModelDecoder};
use crate::transport::{BoxedConnector, Connector, boxed};
use crate::types::JsonValue;
use crate::ws::WsConnector;

/// Client for a remote music server's JSON-RPC-over-WebSocket API.
///
/// Clones share one connection.  The connection shuts down when the last
/// clone is dropped, or eagerly via [`Client::shutdown`].
///
/// ```no_run
/// # async fn example() -> mopidy_ws::Result<()> {
/// let client = mopidy_ws::Client::builder("ws://localhost:6680/mopidy/ws").build();
/// client.connect().await?;
/// println!("server version {}", client.version().await?);
/// client.playback().play().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    handle: ConnectionHandle,
    dispatcher: EventDispatcher,
    _drop_guard: Arc<DropGuard>,
}

impl Client {
    /// Start building a client that will dial the given `ws://` or `wss://`
    /// URL.
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            url: url.into(),
            headers: Vec::new(),
            connector: None,
            config: ConnectionConfig::default(),
            decoder: Arc::new(IdentityDecoder),
        }
    }

    /// Establish the connection now rather than on first call.
    ///
    /// Succeeds immediately if already connected.
    pub async fn connect(&self) -> Result<()> {
        self.handle.connect().await
    }

    /// Close the connection.  In-flight requests fail with
    /// [`ClientError::ConnectionLost`]; the connection will not be re-dialed
    /// until [`Client::connect`] or the next call.
    pub async fn disconnect(&self) -> Result<()> {
        self.handle.disconnect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Tear down the connection for every clone of this client and wait for
    /// the event loop to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await.map_err(|message| {
            warn!(message, "connection event loop reported failure at shutdown");
            ClientError::Cancelled
        })
    }

    /// Invoke a server method that takes no parameters.
    pub async fn call<Resp>(&self, method: impl Into<String>) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        let method = method.into();
        let result = self.handle.call_raw(method, None).await?;
        deserialize_result(result)
    }

    /// Invoke a server method with parameters, serialized as the JSON-RPC
    /// `params` member.
    pub async fn call_with_params<Req, Resp>(
        &self,
        method: impl Into<String>,
        params: Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let method = method.into();
        let params =
            serde_json::to_value(params).map_err(|e| ClientError::SerRequest {
                source: e,
                type_name: std::any::type_name::<Req>(),
            })?;
        let result = self.handle.call_raw(method, Some(params)).await?;
        deserialize_result(result)
    }

    /// Version of the server's core API.
    pub async fn version(&self) -> Result<String> {
        self.call("core.get_version").await
    }

    /// Subscribe to a server event by name, e.g. `"volume_changed"`.
    ///
    /// The handler runs for every matching event until the returned
    /// [`Subscription`] is explicitly unsubscribed.  Merely dropping the
    /// subscription keeps the handler registered.
    pub fn on<H, Fut>(&self, event: impl Into<String>, handler: H) -> Subscription
    where
        H: Fn(CoreEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.dispatcher
            .subscribe(&event.into(), Arc::new(move |event| handler(event).boxed()))
    }

    /// Subscribe to volume changes, receiving the new volume.
    pub fn on_volume_changed<H, Fut>(&self, handler: H) -> Subscription
    where
        H: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on("volume_changed", move |event| -> BoxFuture<'static, ()> {
            let CoreEvent::VolumeChanged { volume } = event else {
                return futures::future::ready(()).boxed();
            };
            handler(volume).boxed()
        })
    }

    /// Subscribe to mute changes, receiving the new mute flag.
    pub fn on_mute_changed<H, Fut>(&self, handler: H) -> Subscription
    where
        H: Fn(bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on("mute_changed", move |event| -> BoxFuture<'static, ()> {
            let CoreEvent::MuteChanged { mute } = event else {
                return futures::future::ready(()).boxed();
            };
            handler(mute).boxed()
        })
    }

    /// Subscribe to playback state transitions, receiving `(old, new)` state
    /// names.
    pub fn on_playback_state_changed<H, Fut>(&self, handler: H) -> Subscription
    where
        H: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(
            "playback_state_changed",
            move |event| -> BoxFuture<'static, ()> {
                let CoreEvent::PlaybackStateChanged { old_state, new_state } = event else {
                    return futures::future::ready(()).boxed();
                };
                handler(old_state, new_state).boxed()
            },
        )
    }

    /// Subscribe to seeks, receiving the new position in milliseconds.
    pub fn on_seeked<H, Fut>(&self, handler: H) -> Subscription
    where
        H: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on("seeked", move |event| -> BoxFuture<'static, ()> {
            let CoreEvent::Seeked { time_position } = event else {
                return futures::future::ready(()).boxed();
            };
            handler(time_position).boxed()
        })
    }

    /// Subscribe to stream title changes.
    pub fn on_stream_title_changed<H, Fut>(&self, handler: H) -> Subscription
    where
        H: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(
            "stream_title_changed",
            move |event| -> BoxFuture<'static, ()> {
                let CoreEvent::StreamTitleChanged { title } = event else {
                    return futures::future::ready(()).boxed();
                };
                handler(title).boxed()
            },
        )
    }

    /// Subscribe to track playback starts, receiving the tracklist track.
    pub fn on_track_playback_started<H, Fut>(&self, handler: H) -> Subscription
    where
        H: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(
            "track_playback_started",
            move |event| -> BoxFuture<'static, ()> {
                let CoreEvent::TrackPlaybackStarted { tl_track } = event else {
                    return futures::future::ready(()).boxed();
                };
                handler(tl_track).boxed()
            },
        )
    }

    /// Subscribe to playlist deletions, receiving the deleted playlist's URI.
    pub fn on_playlist_deleted<H, Fut>(&self, handler: H) -> Subscription
    where
        H: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on("playlist_deleted", move |event| -> BoxFuture<'static, ()> {
            let CoreEvent::PlaylistDeleted { uri } = event else {
                return futures::future::ready(()).boxed();
            };
            handler(uri).boxed()
        })
    }

    /// Methods under `core.playback`.
    pub fn playback(&self) -> PlaybackController<'_> {
        PlaybackController { client: self }
    }

    /// Methods under `core.mixer`.
    pub fn mixer(&self) -> MixerController<'_> {
        MixerController { client: self }
    }

    /// Methods under `core.tracklist`.
    pub fn tracklist(&self) -> TracklistController<'_> {
        TracklistController { client: self }
    }

    /// Methods under `core.library`.
    pub fn library(&self) -> LibraryController<'_> {
        LibraryController { client: self }
    }

    /// Methods under `core.playlists`.
    pub fn playlists(&self) -> PlaylistsController<'_> {
        PlaylistsController { client: self }
    }

    /// Methods under `core.history`.
    pub fn history(&self) -> HistoryController<'_> {
        HistoryController { client: self }
    }
}

fn deserialize_result<Resp>(result: JsonValue) -> Result<Resp>
where
    Resp: DeserializeOwned,
{
    serde_json::from_value(result.clone()).map_err(|e| ClientError::DeserResponse {
        source: e,
        type_name: std::any::type_name::<Resp>(),
        response: result,
    })
}

/// Builder for [`Client`], configuring the dial target and connection policy.
pub struct ClientBuilder {
    url: String,
    headers: Vec<(String, String)>,
    connector: Option<Box<dyn BoxedConnector>>,
    config: ConnectionConfig,
    decoder: Arc<dyn ModelDecoder>,
}

impl ClientBuilder {
    /// Add a header to the WebSocket handshake request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Dial attempts per connect or reconnect cycle (default 3).
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Delay before the second dial attempt, doubling per attempt after that
    /// (default 250ms).
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Cap on the doubling backoff delay (default 5s).
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay = delay;
        self
    }

    /// Whether to re-dial automatically after a dropped connection and on
    /// calls made while disconnected (default true).
    pub fn auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.config.auto_reconnect = auto_reconnect;
        self
    }

    /// Fail calls whose reply does not arrive within this window (default
    /// none).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Hook that rewrites typed model objects in results and event payloads
    /// before they are handed to callers.
    pub fn decoder(mut self, decoder: impl ModelDecoder) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Replace the WebSocket connector entirely, mainly for tests that run
    /// against in-memory transports.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(boxed(connector));
        self
    }

    /// Build the client and spawn its connection event loop.
    ///
    /// Must be called within the context of a tokio runtime.  The connection
    /// is not dialed until [`Client::connect`] or the first call.
    pub fn build(self) -> Client {
        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                let mut ws = WsConnector::new(self.url);
                for (name, value) in self.headers {
                    ws = ws.with_header(name, value);
                }
                boxed(ws)
            }
        };

        let dispatcher = EventDispatcher::new();
        let cancellation_token = CancellationToken::new();
        let handle = spawn_connection(
            self.config,
            connector,
            self.decoder,
            dispatcher.clone(),
            cancellation_token.clone(),
        );

        Client {
            handle,
            dispatcher,
            _drop_guard: Arc::new(cancellation_token.drop_guard()),
        }
    }
}
