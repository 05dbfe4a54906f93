//! The gossip envelope. Field names are part of the wire format.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A message on either gossip channel. `message` carries hex-sealed
/// ciphertext on the private channel and cleartext on the public one.
/// `sender` is always filled by the receiver from transport metadata,
/// never trusted from the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "SenderID", default)]
    pub sender: String,
    #[serde(rename = "Annotations", default)]
    pub annotations: Option<Annotations>,
}

impl Message {
    pub fn new(message: impl Into<String>) -> Message {
        Message {
            message: message.into(),
            sender: String::new(),
            annotations: None,
        }
    }

    pub fn with_annotations(mut self, annotations: Annotations) -> Message {
        self.annotations = Some(annotations);
        self
    }
}

/// Typed annotation carrier: the known keys are fields, anything else
/// lands in `extras` so unknown annotations survive a round-trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(rename = "sigs", default, skip_serializing_if = "Option::is_none")]
    pub sigs: Option<String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl Annotations {
    pub fn signed(sigs: impl Into<String>) -> Annotations {
        Annotations {
            sigs: Some(sigs.into()),
            extras: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_are_pinned() {
        let msg = Message::new("payload").with_annotations(Annotations::signed("sig"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["Message"], "payload");
        assert!(json.get("SenderID").is_some());
        assert_eq!(json["Annotations"]["sigs"], "sig");
    }

    #[test]
    fn unknown_annotations_survive() {
        let json = r#"{"Message":"m","SenderID":"","Annotations":{"sigs":"s","future":42}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        let ann = msg.annotations.clone().unwrap();
        assert_eq!(ann.sigs.as_deref(), Some("s"));
        assert_eq!(ann.extras["future"], 42);
        let back = serde_json::to_string(&msg).unwrap();
        assert!(back.contains("\"future\":42"));
    }

    #[test]
    fn missing_annotations_decode_as_none() {
        let msg: Message = serde_json::from_str(r#"{"Message":"m"}"#).unwrap();
        assert!(msg.annotations.is_none());
        assert!(msg.sender.is_empty());
    }
}
