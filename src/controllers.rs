//! Typed wrappers over the server's `core.*` method namespaces.
//!
//! Each controller is a borrowed view on a [`Client`] exposing one namespace
//! as plain async methods.  Model-bearing results (tracks, playlists) are
//! surfaced as [`JsonValue`] so a [`crate::ModelDecoder`] hook can substitute
//! richer types without this module knowing about them.
use serde_json::json;

use crate::client::Client;
use crate::error::Result;
use crate::types::JsonValue;

/// `core.playback`: start, stop and position control.
pub struct PlaybackController<'a> {
    pub(crate) client: &'a Client,
}

impl PlaybackController<'_> {
    /// Play the current track, or the first track if none is current.
    pub async fn play(&self) -> Result<()> {
        self.client.call("core.playback.play").await
    }

    pub async fn pause(&self) -> Result<()> {
        self.client.call("core.playback.pause").await
    }

    pub async fn resume(&self) -> Result<()> {
        self.client.call("core.playback.resume").await
    }

    pub async fn stop(&self) -> Result<()> {
        self.client.call("core.playback.stop").await
    }

    /// Skip to the next track in the tracklist.
    pub async fn next(&self) -> Result<()> {
        self.client.call("core.playback.next").await
    }

    /// Return to the previous track in the tracklist.
    pub async fn previous(&self) -> Result<()> {
        self.client.call("core.playback.previous").await
    }

    /// Seek to the given position in milliseconds.  Returns whether the seek
    /// was performed.
    pub async fn seek(&self, time_position: u64) -> Result<bool> {
        self.client
            .call_with_params(
                "core.playback.seek",
                json!({ "time_position": time_position }),
            )
            .await
    }

    /// Current playback state: `"playing"`, `"paused"` or `"stopped"`.
    pub async fn get_state(&self) -> Result<String> {
        self.client.call("core.playback.get_state").await
    }

    /// Position within the current track in milliseconds, if any track is
    /// current.
    pub async fn get_time_position(&self) -> Result<Option<u64>> {
        self.client.call("core.playback.get_time_position").await
    }

    /// The currently playing or selected tracklist track, if any.
    pub async fn get_current_tl_track(&self) -> Result<Option<JsonValue>> {
        self.client.call("core.playback.get_current_tl_track").await
    }
}

/// `core.mixer`: volume and mute.
pub struct MixerController<'a> {
    pub(crate) client: &'a Client,
}

impl MixerController<'_> {
    /// Current volume in the range 0..=100, or `None` if unknown.
    pub async fn get_volume(&self) -> Result<Option<u32>> {
        self.client.call("core.mixer.get_volume").await
    }

    /// Set the volume (0..=100).  Returns whether the mixer accepted it.
    pub async fn set_volume(&self, volume: u32) -> Result<bool> {
        self.client
            .call_with_params("core.mixer.set_volume", json!({ "volume": volume }))
            .await
    }

    /// Current mute state, or `None` if unknown.
    pub async fn get_mute(&self) -> Result<Option<bool>> {
        self.client.call("core.mixer.get_mute").await
    }

    /// Mute or unmute.  Returns whether the mixer accepted it.
    pub async fn set_mute(&self, mute: bool) -> Result<bool> {
        self.client
            .call_with_params("core.mixer.set_mute", json!({ "mute": mute }))
            .await
    }
}

/// `core.tracklist`: the queue of tracks scheduled for playback.
pub struct TracklistController<'a> {
    pub(crate) client: &'a Client,
}

impl TracklistController<'_> {
    /// Add tracks by URI to the end of the tracklist.  Returns the tracklist
    /// tracks that were added.
    pub async fn add(&self, uris: &[&str]) -> Result<Vec<JsonValue>> {
        self.client
            .call_with_params("core.tracklist.add", json!({ "uris": uris }))
            .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.client.call("core.tracklist.clear").await
    }

    pub async fn get_length(&self) -> Result<u32> {
        self.client.call("core.tracklist.get_length").await
    }

    /// All tracklist tracks, in order.
    pub async fn get_tl_tracks(&self) -> Result<Vec<JsonValue>> {
        self.client.call("core.tracklist.get_tl_tracks").await
    }

    /// Index of the current track within the tracklist, if any.
    pub async fn index(&self) -> Result<Option<u32>> {
        self.client.call("core.tracklist.index").await
    }

    pub async fn shuffle(&self) -> Result<()> {
        self.client.call("core.tracklist.shuffle").await
    }
}

/// `core.library`: browsing and searching the music library.
pub struct LibraryController<'a> {
    pub(crate) client: &'a Client,
}

impl LibraryController<'_> {
    /// Browse the directory at `uri`, or the root directories when `None`.
    pub async fn browse(&self, uri: Option<&str>) -> Result<Vec<JsonValue>> {
        self.client
            .call_with_params("core.library.browse", json!({ "uri": uri }))
            .await
    }

    /// Search the library.  `query` maps search fields (`"artist"`,
    /// `"album"`, `"any"`, ...) to lists of search terms.
    pub async fn search(&self, query: JsonValue) -> Result<Vec<JsonValue>> {
        self.client
            .call_with_params("core.library.search", json!({ "query": query }))
            .await
    }

    /// Look up tracks by URI.  Returns a map from URI to matching tracks.
    pub async fn lookup(&self, uris: &[&str]) -> Result<JsonValue> {
        self.client
            .call_with_params("core.library.lookup", json!({ "uris": uris }))
            .await
    }

    /// Refresh the library, or just the part rooted at `uri`.
    pub async fn refresh(&self, uri: Option<&str>) -> Result<()> {
        self.client
            .call_with_params("core.library.refresh", json!({ "uri": uri }))
            .await
    }
}

/// `core.playlists`: stored playlists.
pub struct PlaylistsController<'a> {
    pub(crate) client: &'a Client,
}

impl PlaylistsController<'_> {
    /// Summaries (name and URI) of all stored playlists.
    pub async fn as_list(&self) -> Result<Vec<JsonValue>> {
        self.client.call("core.playlists.as_list").await
    }

    /// The full playlist at `uri`, or `None` if it does not exist.
    pub async fn lookup(&self, uri: &str) -> Result<Option<JsonValue>> {
        self.client
            .call_with_params("core.playlists.lookup", json!({ "uri": uri }))
            .await
    }

    /// Create a new empty playlist, optionally in a specific backend's
    /// URI scheme.
    pub async fn create(&self, name: &str, uri_scheme: Option<&str>) -> Result<JsonValue> {
        self.client
            .call_with_params(
                "core.playlists.create",
                json!({ "name": name, "uri_scheme": uri_scheme }),
            )
            .await
    }

    /// Save a modified playlist.  Returns the saved playlist, or `None` if
    /// the backend refused it.
    pub async fn save(&self, playlist: JsonValue) -> Result<Option<JsonValue>> {
        self.client
            .call_with_params("core.playlists.save", json!({ "playlist": playlist }))
            .await
    }

    /// Delete the playlist at `uri`.  Returns whether a playlist was deleted.
    pub async fn delete(&self, uri: &str) -> Result<bool> {
        self.client
            .call_with_params("core.playlists.delete", json!({ "uri": uri }))
            .await
    }

    /// Reload playlists from all backends, or just the one owning
    /// `uri_scheme`.
    pub async fn refresh(&self, uri_scheme: Option<&str>) -> Result<()> {
        self.client
            .call_with_params(
                "core.playlists.refresh",
                json!({ "uri_scheme": uri_scheme }),
            )
            .await
    }
}

/// `core.history`: tracks played during this server session.
pub struct HistoryController<'a> {
    pub(crate) client: &'a Client,
}

impl HistoryController<'_> {
    /// Playback history, most recent first, as `(timestamp, track ref)`
    /// pairs.
    pub async fn get_history(&self) -> Result<JsonValue> {
        self.client.call("core.history.get_history").await
    }

    pub async fn get_length(&self) -> Result<u32> {
        self.client.call("core.history.get_length").await
    }
}
