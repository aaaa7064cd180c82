//! Hook through which domain objects embedded in server payloads are decoded.
//!
//! Mopidy tags its data objects (tracks, playlists, tracklist entries) with a
//! discriminator field inside ordinary JSON objects.  Reconstructing those into
//! richer values is the business of whoever consumes the client, not of the
//! message codec, so the codec only promises to run every JSON object it parses
//! through an injected [`ModelDecoder`] before classification.
use serde_json::{Map, Value as JsonValue};

/// Rewrites JSON objects into domain-specific substitutes during parse.
///
/// Given an object, an implementation returns either the same object or a
/// replacement value.  The hook is applied bottom-up (children before their
/// parent), and must be idempotent and side-effect-free for identical input.
pub trait ModelDecoder: Send + Sync + 'static {
    fn decode(&self, object: Map<String, JsonValue>) -> JsonValue;
}

/// Default hook that leaves every object untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDecoder;

impl ModelDecoder for IdentityDecoder {
    fn decode(&self, object: Map<String, JsonValue>) -> JsonValue {
        JsonValue::Object(object)
    }
}

impl<F> ModelDecoder for F
where
    F: Fn(Map<String, JsonValue>) -> JsonValue + Send + Sync + 'static,
{
    fn decode(&self, object: Map<String, JsonValue>) -> JsonValue {
        self(object)
    }
}
