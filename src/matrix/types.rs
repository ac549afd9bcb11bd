//! Matrix client-server API types.
//!
//! Only the slices of the event model the bridge touches are typed; all
//! remaining content rides along as raw JSON so unknown keys survive.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Message type constants from the `m.room.message` event schema.
pub mod msgtype {
    pub const TEXT: &str = "m.text";
    pub const EMOTE: &str = "m.emote";
    pub const NOTICE: &str = "m.notice";
    pub const IMAGE: &str = "m.image";
    pub const FILE: &str = "m.file";
    pub const AUDIO: &str = "m.audio";
    pub const VIDEO: &str = "m.video";

    /// Media message types, relayed as a single URL line.
    pub const MEDIA: [&str; 4] = [IMAGE, FILE, AUDIO, VIDEO];
}

/// Content of an `m.room.message` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub msgtype: String,

    #[serde(default)]
    pub body: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,

    /// Media content URI (`mxc://...`) for media message types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(rename = "m.new_content", skip_serializing_if = "Option::is_none")]
    pub new_content: Option<Box<MessageContent>>,

    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<RelatesTo>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: msgtype::TEXT.to_string(),
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            msgtype: msgtype::NOTICE.to_string(),
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn emote(body: impl Into<String>) -> Self {
        Self {
            msgtype: msgtype::EMOTE.to_string(),
            body: body.into(),
            ..Self::default()
        }
    }

    /// Attach an HTML body in the custom-html format.
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.format = Some("org.matrix.custom.html".to_string());
        self.formatted_body = Some(html.into());
        self
    }

    /// Whether this content is an edit (`m.replace` relation with new content).
    pub fn is_edit(&self) -> bool {
        self.new_content.is_some()
    }

    /// The event id this edit replaces, when this content is an edit.
    pub fn replaces(&self) -> Option<&str> {
        let rel = self.relates_to.as_ref()?;
        if rel.rel_type.as_deref() == Some("m.replace") {
            rel.event_id.as_deref()
        } else {
            None
        }
    }

    /// The event id this message replies to, when it is a reply.
    pub fn in_reply_to(&self) -> Option<&str> {
        self.relates_to
            .as_ref()?
            .in_reply_to
            .as_ref()
            .map(|r| r.event_id.as_str())
    }

    /// The effective content: the replacement for edits, `self` otherwise.
    pub fn effective(&self) -> &MessageContent {
        self.new_content.as_deref().unwrap_or(self)
    }
}

/// The `m.relates_to` block of an event content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelatesTo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(rename = "m.in_reply_to", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<InReplyTo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: String,
}

/// An `m.room.message` event as the bridge sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub event_id: String,

    #[serde(default)]
    pub sender: String,

    #[serde(default)]
    pub content: MessageContent,
}

/// An `m.room.redaction` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedactionEvent {
    #[serde(default)]
    pub event_id: String,

    #[serde(default)]
    pub sender: String,

    #[serde(default)]
    pub redacts: String,
}

/// One member entry from `GET /rooms/{id}/joined_members`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemberInfo {
    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A timeline or state event from the sync stream, with only the envelope
/// typed; handlers deserialize `content` once the type is known.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub event_id: String,

    #[serde(default)]
    pub sender: String,

    #[serde(default)]
    pub state_key: Option<String>,

    #[serde(default)]
    pub content: Value,

    #[serde(default)]
    pub redacts: Option<String>,
}

impl RawEvent {
    /// Interpret this event as an `m.room.message`.
    pub fn to_message(&self) -> Option<MessageEvent> {
        let content: MessageContent = serde_json::from_value(self.content.clone()).ok()?;
        Some(MessageEvent {
            event_id: self.event_id.clone(),
            sender: self.sender.clone(),
            content,
        })
    }

    /// Interpret this event as an `m.room.redaction`.
    pub fn to_redaction(&self) -> Option<RedactionEvent> {
        Some(RedactionEvent {
            event_id: self.event_id.clone(),
            sender: self.sender.clone(),
            redacts: self.redacts.clone()?,
        })
    }
}

/// Response to `GET /sync`, trimmed to the parts the bridge consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub next_batch: String,

    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoomSync>,

    #[serde(default)]
    pub leave: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoomSync {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<RawEvent>,
}
