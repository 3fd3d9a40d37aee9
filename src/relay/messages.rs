//! Wire types shared by the relay session, the WebSocket actor and the headless client.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One piece of a generation reply, in the order the API returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyFragment {
    Text(String),
    AudioBytes(Bytes),
}

/// Structured text frames sent from the relay to the client.
///
/// Audio replies are not represented here; they travel as raw binary frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Text part of a generation reply
    Text { text: String },
    /// A chunk could not be relayed; the session keeps going
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk: Option<usize>,
    },
}

/// Everything the relay pushes to a client, text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Json(ServerMessage),
    Binary(Bytes),
}

impl From<ReplyFragment> for Outbound {
    fn from(fragment: ReplyFragment) -> Self {
        match fragment {
            ReplyFragment::Text(text) => Outbound::Json(ServerMessage::Text { text }),
            ReplyFragment::AudioBytes(bytes) => Outbound::Binary(bytes),
        }
    }
}

/// Optional text control frames a client may send. Unknown or malformed frames are
/// logged and dropped by the session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping {
        #[serde(default)]
        timestamp: Option<u64>,
    },
    /// The client cleared its playback queue (barge-in)
    Interrupt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message_shape() {
        let msg = ServerMessage::Text {
            text: "hello".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "hello"}));
    }

    #[test]
    fn test_error_message_omits_missing_chunk() {
        let msg = ServerMessage::Error {
            message: "rate limited".to_string(),
            chunk: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"rate limited"}"#);

        let parsed: ServerMessage =
            serde_json::from_str(r#"{"type":"error","message":"x","chunk":2}"#).unwrap();
        assert_eq!(
            parsed,
            ServerMessage::Error {
                message: "x".to_string(),
                chunk: Some(2)
            }
        );
    }

    #[test]
    fn test_fragment_into_outbound() {
        let audio = Bytes::from_static(b"RIFF");
        assert_eq!(
            Outbound::from(ReplyFragment::AudioBytes(audio.clone())),
            Outbound::Binary(audio)
        );
        assert!(matches!(
            Outbound::from(ReplyFragment::Text("hi".into())),
            Outbound::Json(ServerMessage::Text { .. })
        ));
    }

    #[test]
    fn test_control_message_parsing() {
        assert_eq!(
            serde_json::from_str::<ControlMessage>(r#"{"type":"interrupt"}"#).unwrap(),
            ControlMessage::Interrupt
        );
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"dance"}"#).is_err());
        assert!(serde_json::from_str::<ControlMessage>("{not json").is_err());
    }
}
