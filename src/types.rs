//! Wire structs for the JSON-RPC protocol Mopidy speaks, and the classifier
//! that turns raw inbound frames into [`InboundMessage`] values.
//!
//! Mopidy's dialect is narrower than full JSON-RPC 2.0: request ids are always
//! integers, there are no batches, and server pushes are not notifications but
//! plain objects keyed by an `event` field.  The classifier below is therefore
//! key-presence based rather than an untagged serde enum, which also lets it
//! implement the tolerant edge cases (null-result replies, unmatchable frames
//! logged and dropped) without fighting the deserializer.
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::error::{ClientError, Result};
use crate::events::CoreEvent;
use crate::models::ModelDecoder;

/// Re-export the protocol primitives we share with the wider JSON-RPC
/// ecosystem rather than re-inventing them.
pub use jsonrpsee_types::{error::ErrorCode, params::TwoPointZero};
pub use serde_json::Value as JsonValue;

/// Serializable [JSON-RPC request object](https://www.jsonrpc.org/specification#request-object).
///
/// `params` is always present on the wire (an empty object when the caller
/// passed no arguments), matching what the server's own clients send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// JSON-RPC version marker.
    pub jsonrpc: TwoPointZero,
    /// Request id; strictly increasing, never reused within a process.
    pub id: u64,
    /// Fully qualified method name, e.g. `core.playback.play`.
    pub method: String,
    /// Keyword arguments for the method.
    pub params: JsonValue,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            id,
            method: method.into(),
            params: params
                .into()
                .unwrap_or_else(|| JsonValue::Object(Map::new())),
        }
    }

    /// Serialize this request into one outgoing text frame.
    pub fn into_string(self) -> Result<String> {
        serde_json::to_string(&self).map_err(|e| ClientError::SerRequest {
            source: e,
            type_name: std::any::type_name::<Self>(),
        })
    }
}

/// [JSON-RPC error details](https://www.jsonrpc.org/specification#error_object)
/// as returned by the server, including Mopidy's structured `data` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    /// The remote traceback Mopidy embeds in the error data, if present.
    pub fn traceback(&self) -> Option<&str> {
        self.data.as_ref()?.get("traceback")?.as_str()
    }
}

/// Every shape an inbound frame can classify into.
///
/// Each value is consumed exactly once: replies go to the request correlation
/// map, events go to the dispatcher, malformed frames go nowhere.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// Successful reply to a tracked request.
    Response { id: u64, result: JsonValue },
    /// Error reply to a tracked request.
    Error { id: u64, error: ErrorDetails },
    /// Server-pushed event.
    Event(CoreEvent),
    /// A frame that matched no recognized shape.  Logged, never raised.
    Malformed { raw: String },
}

/// Classify one raw text frame.
///
/// Every JSON object in the parsed value is first run through the injected
/// `decoder` hook, bottom-up, so domain objects are already rewritten by the
/// time the frame is classified.
pub fn decode(raw: &str, decoder: &dyn ModelDecoder) -> InboundMessage {
    let value: JsonValue = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(err = %e, "Discarding frame that is not valid JSON");
            return InboundMessage::Malformed {
                raw: raw.to_string(),
            };
        }
    };

    let JsonValue::Object(object) = apply_decoder(value, decoder) else {
        tracing::warn!(%raw, "Discarding frame that is not a JSON object");
        return InboundMessage::Malformed {
            raw: raw.to_string(),
        };
    };

    if object.contains_key("jsonrpc") {
        classify_reply(object, raw)
    } else if object.contains_key("event") {
        classify_event(object, raw)
    } else {
        tracing::warn!(%raw, "Discarding frame that is neither a JSON-RPC reply nor an event");
        InboundMessage::Malformed {
            raw: raw.to_string(),
        }
    }
}

fn classify_reply(mut object: Map<String, JsonValue>, raw: &str) -> InboundMessage {
    let Some(id) = object.get("id").and_then(JsonValue::as_u64) else {
        tracing::warn!(%raw, "Discarding JSON-RPC reply without a usable integer id");
        return InboundMessage::Malformed {
            raw: raw.to_string(),
        };
    };

    if let Some(error) = object.remove("error") {
        match serde_json::from_value::<ErrorDetails>(error) {
            Ok(error) => InboundMessage::Error { id, error },
            Err(e) => {
                tracing::warn!(request_id = id, err = %e,
                    "Discarding reply whose error object does not parse");
                InboundMessage::Malformed {
                    raw: raw.to_string(),
                }
            }
        }
    } else {
        let result = object.remove("result").unwrap_or_else(|| {
            // Off-protocol, but not worth stranding the caller over.
            tracing::warn!(request_id = id,
                "Reply carries neither result nor error; assuming null result");
            JsonValue::Null
        });
        InboundMessage::Response { id, result }
    }
}

fn classify_event(mut object: Map<String, JsonValue>, raw: &str) -> InboundMessage {
    match serde_json::from_value::<CoreEvent>(JsonValue::Object(object.clone())) {
        Ok(event) => InboundMessage::Event(event),
        Err(_) => {
            let name = match object.remove("event") {
                Some(JsonValue::String(name)) => name,
                _ => {
                    tracing::warn!(%raw, "Discarding event frame whose event name is not a string");
                    return InboundMessage::Malformed {
                        raw: raw.to_string(),
                    };
                }
            };
            InboundMessage::Event(CoreEvent::Unknown {
                name,
                payload: object,
            })
        }
    }
}

/// Run `decoder` over every object in `value`, children before parents.
fn apply_decoder(value: JsonValue, decoder: &dyn ModelDecoder) -> JsonValue {
    match value {
        JsonValue::Array(items) => JsonValue::Array(
            items
                .into_iter()
                .map(|item| apply_decoder(item, decoder))
                .collect(),
        ),
        JsonValue::Object(object) => {
            let object = object
                .into_iter()
                .map(|(key, value)| (key, apply_decoder(value, decoder)))
                .collect();
            decoder.decode(object)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IdentityDecoder;
    use assert_matches::assert_matches;
    use serde_json::{Value, json};

    #[test]
    fn request_serialization_matches_the_wire_format() {
        let known_good_json =
            r#"{"jsonrpc":"2.0","id":7,"method":"core.playback.play","params":{}}"#;
        let known_good_value: Value = serde_json::from_str(known_good_json).unwrap();

        let our_request = Request::new(7, "core.playback.play", None);
        let our_value: Value =
            serde_json::from_str(&our_request.clone().into_string().unwrap()).unwrap();

        assert_eq!(known_good_value, our_value);

        // Params are carried verbatim when supplied.
        let with_params = Request::new(8, "core.mixer.set_volume", json!({"volume": 150}));
        let our_value: Value = serde_json::from_str(&with_params.into_string().unwrap()).unwrap();
        assert_eq!(our_value["params"], json!({"volume": 150}));
        assert_eq!(our_value["id"], json!(8));
    }

    #[test]
    fn success_reply_classifies_as_response() {
        let message = decode(r#"{"jsonrpc":"2.0","id":7,"result":null}"#, &IdentityDecoder);
        assert_matches!(
            message,
            InboundMessage::Response { id: 7, result } if result == Value::Null
        );
    }

    #[test]
    fn error_reply_classifies_as_error_with_details() {
        let raw = concat!(
            r#"{"jsonrpc":"2.0","id":8,"error":{"code":-32602,"message":"Invalid params","#,
            r#""data":{"traceback":"Traceback (most recent call last): ..."}}}"#
        );
        let message = decode(raw, &IdentityDecoder);
        assert_matches!(
            message,
            InboundMessage::Error { id: 8, error } => {
                assert_eq!(error.code, ErrorCode::InvalidParams);
                assert_eq!(error.message, "Invalid params");
                assert!(error.traceback().unwrap().starts_with("Traceback"));
            }
        );
    }

    #[test]
    fn reply_with_id_but_no_result_or_error_is_a_null_response() {
        let message = decode(r#"{"jsonrpc":"2.0","id":9}"#, &IdentityDecoder);
        assert_matches!(
            message,
            InboundMessage::Response { id: 9, result } if result == Value::Null
        );
    }

    #[test]
    fn reply_without_id_is_malformed() {
        let message = decode(r#"{"jsonrpc":"2.0","result":19}"#, &IdentityDecoder);
        assert_matches!(message, InboundMessage::Malformed { .. });
    }

    #[test]
    fn catalog_event_classifies_typed() {
        let message = decode(r#"{"event":"volume_changed","volume":42}"#, &IdentityDecoder);
        assert_matches!(
            message,
            InboundMessage::Event(CoreEvent::VolumeChanged { volume: 42 })
        );
    }

    #[test]
    fn unknown_event_keeps_name_and_payload() {
        let message = decode(
            r#"{"event":"audio_scan_finished","uri":"local:track:a.flac"}"#,
            &IdentityDecoder,
        );
        assert_matches!(
            message,
            InboundMessage::Event(CoreEvent::Unknown { name, payload }) => {
                assert_eq!(name, "audio_scan_finished");
                assert_eq!(payload.get("uri"), Some(&json!("local:track:a.flac")));
                // The `event` field itself is not part of the payload.
                assert!(payload.get("event").is_none());
            }
        );
    }

    #[test]
    fn garbage_frames_are_malformed_not_fatal() {
        assert_matches!(
            decode("not json at all", &IdentityDecoder),
            InboundMessage::Malformed { .. }
        );
        assert_matches!(decode("[1,2,3]", &IdentityDecoder), InboundMessage::Malformed { .. });
        assert_matches!(
            decode(r#"{"neither":"fish","nor":"fowl"}"#, &IdentityDecoder),
            InboundMessage::Malformed { .. }
        );
    }

    #[test]
    fn decoder_hook_is_applied_bottom_up() {
        // Rewrites any object tagged `__model__` into its uri string.  If the
        // hook runs bottom-up, the nested track inside tl_track is rewritten
        // before the tl_track object itself is offered to the hook.
        let hook = |object: Map<String, Value>| {
            if let Some(uri) = object.get("uri").filter(|_| object.contains_key("__model__")) {
                uri.clone()
            } else {
                Value::Object(object)
            }
        };

        let raw = concat!(
            r#"{"jsonrpc":"2.0","id":3,"result":"#,
            r#"{"__model__":"TlTrack","uri":"tl:1","track":{"__model__":"Track","uri":"local:track:a.flac"}}}"#
        );
        let message = decode(raw, &hook);
        assert_matches!(
            message,
            InboundMessage::Response { id: 3, result } if result == json!("tl:1")
        );
    }
}
