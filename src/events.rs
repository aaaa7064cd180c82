//! Typed server event payloads and the subscriber fan-out machinery.
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

/// One event pushed by the Mopidy server.
///
/// The wire shape is a JSON object with an `event` field naming the event and
/// the remaining fields forming its payload.  Events in the core catalog get a
/// typed variant here; anything else is carried through as [`Self::Unknown`]
/// with the raw payload mapping intact.  Model-valued fields (tracks,
/// playlists) stay as [`JsonValue`] because reconstructing those is the job of
/// the injected [`crate::ModelDecoder`].
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    VolumeChanged { volume: u32 },
    MuteChanged { mute: bool },
    PlaybackStateChanged { old_state: String, new_state: String },
    Seeked { time_position: u64 },
    StreamTitleChanged { title: String },
    TrackPlaybackStarted { tl_track: JsonValue },
    TrackPlaybackPaused { tl_track: JsonValue, time_position: u64 },
    TrackPlaybackResumed { tl_track: JsonValue, time_position: u64 },
    TrackPlaybackEnded { tl_track: JsonValue, time_position: u64 },
    TracklistChanged,
    OptionsChanged,
    PlaylistsLoaded,
    PlaylistChanged { playlist: JsonValue },
    PlaylistDeleted { uri: String },
    /// An event outside the catalog above, payload delivered untyped.
    #[serde(skip)]
    Unknown {
        name: String,
        payload: Map<String, JsonValue>,
    },
}

impl CoreEvent {
    /// The wire name of this event, which is also the dispatch key.
    pub fn name(&self) -> &str {
        match self {
            CoreEvent::VolumeChanged { .. } => "volume_changed",
            CoreEvent::MuteChanged { .. } => "mute_changed",
            CoreEvent::PlaybackStateChanged { .. } => "playback_state_changed",
            CoreEvent::Seeked { .. } => "seeked",
            CoreEvent::StreamTitleChanged { .. } => "stream_title_changed",
            CoreEvent::TrackPlaybackStarted { .. } => "track_playback_started",
            CoreEvent::TrackPlaybackPaused { .. } => "track_playback_paused",
            CoreEvent::TrackPlaybackResumed { .. } => "track_playback_resumed",
            CoreEvent::TrackPlaybackEnded { .. } => "track_playback_ended",
            CoreEvent::TracklistChanged => "tracklist_changed",
            CoreEvent::OptionsChanged => "options_changed",
            CoreEvent::PlaylistsLoaded => "playlists_loaded",
            CoreEvent::PlaylistChanged { .. } => "playlist_changed",
            CoreEvent::PlaylistDeleted { .. } => "playlist_deleted",
            CoreEvent::Unknown { name, .. } => name,
        }
    }
}

/// Boxed async event handler as stored in the dispatcher.
pub(crate) type EventHandler = Arc<dyn Fn(CoreEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handlers per event name, in subscription order.
type HandlersMap = Arc<Mutex<HashMap<String, Vec<(u64, EventHandler)>>>>;

/// Registry mapping event names to subscribed handlers, and the fan-out logic
/// that delivers one published event to all of them.
#[derive(Clone, Default)]
pub(crate) struct EventDispatcher {
    handlers: HandlersMap,
    next_subscription_id: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events named `event` and return a guard that
    /// removes exactly this registration.
    pub(crate) fn subscribe(&self, event: &str, handler: EventHandler) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        tracing::debug!(event, subscription_id = id, "Handler subscribed");
        Subscription {
            event: event.to_string(),
            id,
            handlers: self.handlers.clone(),
        }
    }

    /// Build the fan-out future for one published event.
    ///
    /// The handler list is snapshotted synchronously, here; registrations added
    /// or removed afterwards do not affect the returned fan-out.  Handlers run
    /// concurrently and a panic in one does not suppress its siblings.  The
    /// future completes when every handler has.
    pub(crate) fn publish(&self, event: CoreEvent) -> impl Future<Output = ()> + Send + 'static {
        let snapshot: Vec<EventHandler> = self
            .handlers
            .lock()
            .unwrap()
            .get(event.name())
            .map(|subs| subs.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        let name = event.name().to_string();
        async move {
            if snapshot.is_empty() {
                return;
            }
            tracing::debug!(event = %name, handlers = snapshot.len(), "Dispatching event");
            let invocations = snapshot.into_iter().map(|handler| {
                let event = event.clone();
                let name = name.clone();
                async move {
                    if AssertUnwindSafe(handler(event)).catch_unwind().await.is_err() {
                        tracing::error!(event = %name, "Event handler panicked");
                    }
                }
            });
            futures::future::join_all(invocations).await;
        }
    }
}

/// Guard for one handler registration, returned by subscribe operations.
///
/// Dropping the guard does NOT unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    event: String,
    id: u64,
    handlers: HandlersMap,
}

impl Subscription {
    /// Remove the handler this subscription registered.
    ///
    /// Fan-outs that already snapshotted the handler still run it to
    /// completion.
    pub fn unsubscribe(self) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(subs) = handlers.get_mut(&self.event) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                handlers.remove(&self.event);
            }
        }
        tracing::debug!(event = %self.event, subscription_id = self.id, "Handler unsubscribed");
    }
}
