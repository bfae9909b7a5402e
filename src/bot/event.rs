//! Chat gateway event model
//!
//! Frames arrive as loosely typed JSON. Known segment kinds get tagged
//! variants, everything else is carried opaquely; ids show up as numbers or
//! strings depending on the gateway build, so extraction never trusts field
//! types blindly.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Wire shape of one message segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSegment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Decoded segment: the kinds the dispatcher understands plus passthrough.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    At { qq: String },
    Text { text: String },
    Other(String),
}

impl Segment {
    pub fn from_raw(raw: &RawSegment) -> Segment {
        match raw.kind.as_str() {
            "at" => Segment::At {
                qq: id_string(raw.data.get("qq")).unwrap_or_default(),
            },
            "text" => Segment::Text {
                text: raw
                    .data
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            other => Segment::Other(other.to_string()),
        }
    }

    pub fn at(qq: &str) -> Value {
        json!({ "type": "at", "data": { "qq": qq } })
    }

    pub fn text(text: &str) -> Value {
        json!({ "type": "text", "data": { "text": text } })
    }
}

/// Accept a number or a string as an id.
pub fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A group message event, normalized from the raw frame.
#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub self_id: String,
    pub group_id: String,
    pub user_id: String,
    pub sender_name: String,
    pub segments: Vec<Segment>,
}

/// Parse a `post_type == "message"` frame with `message_type == "group"`.
/// Anything malformed or non-group yields `None`.
pub fn parse_group_message(frame: &Value) -> Option<GroupMessage> {
    if frame.get("post_type").and_then(|v| v.as_str()) != Some("message") {
        return None;
    }
    if frame.get("message_type").and_then(|v| v.as_str()) != Some("group") {
        return None;
    }

    let self_id = id_string(frame.get("self_id"))?;
    let group_id = id_string(frame.get("group_id"))?;
    let user_id = id_string(frame.get("user_id"))?;

    let sender = frame.get("sender");
    let sender_name = sender
        .and_then(|s| s.get("card"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            sender
                .and_then(|s| s.get("nickname"))
                .and_then(|v| v.as_str())
        })
        .unwrap_or(&user_id)
        .to_string();

    let raw_segments: Vec<RawSegment> = frame
        .get("message")
        .and_then(|m| serde_json::from_value(m.clone()).ok())
        .unwrap_or_default();
    let segments = raw_segments.iter().map(Segment::from_raw).collect();

    Some(GroupMessage {
        self_id,
        group_id,
        user_id,
        sender_name,
        segments,
    })
}

/// Extract the command body addressed to `self_id`: everything textual after
/// the first `at` segment that targets us. `None` when we are not addressed.
pub fn command_body(msg: &GroupMessage, self_id: &str) -> Option<String> {
    let at_index = msg
        .segments
        .iter()
        .position(|s| matches!(s, Segment::At { qq } if qq == self_id))?;
    let body = msg.segments[at_index + 1..]
        .iter()
        .filter_map(|s| match s {
            Segment::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");
    Some(body.trim().to_string())
}
