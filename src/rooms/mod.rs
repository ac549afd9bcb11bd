//! Room state management.
//!
//! Every bridged Matrix room runs as its own task owning all of its mutable
//! state; interactions arrive as [`RoomInput`] messages through the room's
//! mailbox. The mailbox doubles as the per-room FIFO: fabric calls are
//! awaited inline by the task, so outbound event order matches handling
//! order and a read-receipt never overtakes its message.

pub mod channel;
pub mod direct;
pub mod network;
pub mod plumbed;

use crate::bridge::Bridge;
use crate::config::MemberSync;
use crate::error::{BridgeError, BridgeResult};
use crate::format::PillMap;
use crate::irc::{IrcEvent, IrcSender};
use crate::matrix::{MessageContent, MessageEvent, RedactionEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How many media log entries survive persistence.
pub const MEDIA_LOG_PERSISTED: usize = 5;

// =============================================================================
// Mailbox
// =============================================================================

/// Everything a room task can be asked to do.
#[derive(Clone)]
pub enum RoomInput {
    /// An IRC event routed here by the owning network room.
    Irc(IrcEvent),
    /// An `m.room.message` from the sync stream.
    MxMessage(MessageEvent),
    /// An `m.room.redaction` from the sync stream.
    MxRedaction(RedactionEvent),
    /// An `m.room.member` state change from the sync stream.
    Membership {
        user_id: String,
        membership: String,
        displayname: Option<String>,
    },
    /// The network connection came up; carries the live sender handle.
    LinkUp(Arc<dyn IrcSender>),
    /// The network connection went down.
    LinkDown,
    /// A notice forwarded into a network room, already prefixed.
    Notice {
        text: String,
        formatted: Option<String>,
    },
    /// Child room bookkeeping, consumed by network rooms.
    ChildOpened { key: String, handle: RoomHandle },
    ChildClosed { key: String },
    /// Ask a network room to (re)connect its IRC link.
    Connect,
}

/// Cheap handle to a room task.
#[derive(Clone)]
pub struct RoomHandle {
    pub id: String,
    pub tx: mpsc::UnboundedSender<RoomInput>,
}

impl RoomHandle {
    /// Deliver an input; a closed mailbox means the room is gone, which is
    /// fine for fire-and-forget routing.
    pub fn send(&self, input: RoomInput) {
        if self.tx.send(input).is_err() {
            debug!(room = %self.id, "dropping input for closed room");
        }
    }
}

/// Behavior of one room kind, driven by its task.
#[async_trait]
pub trait RoomLogic: Send + 'static {
    fn room_id(&self) -> &str;

    /// Handle one input. Returning `false` stops the room task.
    async fn handle(&mut self, input: RoomInput) -> bool;
}

/// Spawn a room task around its state and return the mailbox handle.
pub fn spawn_room<R: RoomLogic>(room: R) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_room_on(room, tx, rx)
}

/// Spawn a room task on a pre-built mailbox; network rooms need their own
/// sender before the task exists.
pub fn spawn_room_on<R: RoomLogic>(
    mut room: R,
    tx: mpsc::UnboundedSender<RoomInput>,
    mut rx: mpsc::UnboundedReceiver<RoomInput>,
) -> RoomHandle {
    let id = room.room_id().to_string();
    let handle = RoomHandle { id: id.clone(), tx };

    tokio::spawn(async move {
        while let Some(input) = rx.recv().await {
            if !room.handle(input).await {
                break;
            }
        }
        debug!(room = %id, "room task finished");
    });

    handle
}

// =============================================================================
// Shared state
// =============================================================================

/// A sender's last relayed message, kept for edit reconstruction.
#[derive(Debug, Clone)]
pub struct TrackedMessage {
    pub event_id: String,
    pub content: MessageContent,
}

/// One entry in the media log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub event_id: String,
    pub url: String,
}

/// State every room kind carries.
pub struct RoomCore {
    /// Matrix room id; empty until lazily created rooms exist server-side.
    pub id: String,
    /// The operating user.
    pub user_id: String,
    pub members: HashSet<String>,
    pub displaynames: HashMap<String, String>,
    /// Last message per sender, for edit diffing.
    pub last_messages: HashMap<String, TrackedMessage>,
    pub media: Vec<MediaEntry>,
    pub bridge: Bridge,
}

impl RoomCore {
    pub fn new(id: &str, bridge: Bridge) -> Self {
        Self {
            id: id.to_string(),
            user_id: bridge.owner().to_string(),
            members: HashSet::new(),
            displaynames: HashMap::new(),
            last_messages: HashMap::new(),
            media: Vec::new(),
            bridge,
        }
    }

    pub fn in_room(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    /// Pull current membership and displaynames from the homeserver.
    pub async fn sync_members(&mut self) -> BridgeResult<()> {
        let joined = self.bridge.api().get_joined_members(&self.id).await?;
        self.members = joined.keys().cloned().collect();
        self.displaynames = joined
            .into_iter()
            .filter_map(|(user_id, info)| info.display_name.map(|name| (user_id, name)))
            .collect();
        Ok(())
    }

    /// Apply an `m.room.member` state change.
    pub fn apply_membership(
        &mut self,
        user_id: &str,
        membership: &str,
        displayname: Option<String>,
    ) {
        match membership {
            "join" => {
                self.members.insert(user_id.to_string());
                match displayname {
                    Some(name) => {
                        self.displaynames.insert(user_id.to_string(), name);
                    }
                    None => {
                        self.displaynames.remove(user_id);
                    }
                }
            }
            "leave" | "ban" => {
                self.members.remove(user_id);
                self.displaynames.remove(user_id);
            }
            _ => {}
        }
    }

    /// Post a message, impersonating `puppet` when it is in the room and
    /// falling back to the bot with `fallback_html` otherwise.
    pub async fn send_message(
        &self,
        puppet: Option<&str>,
        plain: &str,
        formatted: Option<String>,
        fallback_html: Option<String>,
    ) -> BridgeResult<String> {
        self.post(MessageContent::text(plain), puppet, formatted, fallback_html)
            .await
    }

    pub async fn send_emote(
        &self,
        puppet: Option<&str>,
        plain: &str,
        fallback_html: Option<String>,
    ) -> BridgeResult<String> {
        self.post(MessageContent::emote(plain), puppet, None, fallback_html)
            .await
    }

    pub async fn send_notice(
        &self,
        text: &str,
        puppet: Option<&str>,
        formatted: Option<String>,
        fallback_html: Option<String>,
    ) -> BridgeResult<String> {
        self.post(MessageContent::notice(text), puppet, formatted, fallback_html)
            .await
    }

    /// Post a notice whose body is HTML; the plain body is the tag-stripped
    /// variant.
    pub async fn send_notice_html(&self, html: &str) -> BridgeResult<String> {
        let plain = strip_tags(html);
        let content = MessageContent::notice(plain).with_html(html);
        Ok(self
            .bridge
            .api()
            .send_message(&self.id, None, &content)
            .await?)
    }

    async fn post(
        &self,
        mut content: MessageContent,
        puppet: Option<&str>,
        formatted: Option<String>,
        fallback_html: Option<String>,
    ) -> BridgeResult<String> {
        let impersonate = puppet.filter(|user_id| self.in_room(user_id));

        if let Some(html) = formatted {
            content = content.with_html(html);
        } else if impersonate.is_none() {
            if let (Some(_), Some(html)) = (puppet, fallback_html) {
                // The puppet is not in the room; label the message instead
                // of impersonating.
                content = content.with_html(html);
            }
        }

        Ok(self
            .bridge
            .api()
            .send_message(&self.id, impersonate, &content)
            .await?)
    }

    /// React to an event with an emoji annotation.
    pub async fn react(&self, event_id: &str, key: &str) -> BridgeResult<()> {
        self.bridge
            .api()
            .send_reaction(&self.id, event_id, key)
            .await?;
        Ok(())
    }

    /// Media log for persistence: most recent entries only.
    pub fn media_tail(&self) -> Vec<MediaEntry> {
        let skip = self.media.len().saturating_sub(MEDIA_LOG_PERSISTED);
        self.media[skip..].to_vec()
    }

    /// Log a handler error and surface it to the owner when actionable.
    pub async fn report(&self, err: &BridgeError) {
        warn!(room = %self.id, code = err.error_code(), error = %err, "event handling failed");
        if err.is_user_visible() && !self.id.is_empty() {
            let _ = self.send_notice(&err.to_string(), None, None, None).await;
        }
    }
}

/// Minimal tag stripper for notice fallbacks.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

// =============================================================================
// Network back-reference
// =============================================================================

/// Non-owning handle a child room keeps to its network room. The network
/// owns its children by key; children only hold the mailbox and the pills
/// policy, so dropping the network tears the children down cleanly.
#[derive(Debug, Clone)]
pub struct NetworkRef {
    /// Network name, used in puppet ids and persisted config.
    pub name: String,
    /// The network room's mailbox.
    pub tx: mpsc::UnboundedSender<RoomInput>,
    pub pills_length: usize,
    pub pills_ignore: Vec<String>,
}

impl NetworkRef {
    /// Forward a notice into the network room, prefixed with the child
    /// room's name.
    pub fn forward_notice(&self, room_name: &str, text: &str, formatted: Option<String>) {
        let prefixed = format!("{room_name}: {text}");
        let formatted = formatted.map(|html| format!("{}: {html}", crate::format::escape_html(room_name)));
        let _ = self.tx.send(RoomInput::Notice {
            text: prefixed,
            formatted,
        });
    }

    pub fn child_closed(&self, key: &str) {
        let _ = self.tx.send(RoomInput::ChildClosed {
            key: key.to_string(),
        });
    }
}

/// Build the pills map for a room: the operator's own nick first, then
/// every puppet member, all subject to the minimum-length and ignore-list
/// policy of the network.
pub fn build_pills(
    core: &RoomCore,
    network: &NetworkRef,
    sender: Option<&Arc<dyn IrcSender>>,
) -> Option<PillMap> {
    if network.pills_length < 1 {
        return None;
    }

    let mut pills = PillMap::new();
    let ignore: Vec<String> = network
        .pills_ignore
        .iter()
        .map(|nick| nick.to_lowercase())
        .collect();

    if let Some(sender) = sender {
        let own = sender.real_nickname().to_lowercase();
        if core.displaynames.contains_key(&core.user_id)
            && own.len() >= network.pills_length
            && !ignore.contains(&own)
        {
            pills.insert(
                own,
                (
                    core.user_id.clone(),
                    core.displaynames[&core.user_id].clone(),
                ),
            );
        }
    }

    // Puppet displaynames are assumed to match nicks.
    for member in &core.members {
        if !core.bridge.is_puppet(member) {
            continue;
        }
        if let Some(nick) = core.displaynames.get(member) {
            let lower = nick.to_lowercase();
            if nick.len() >= network.pills_length && !ignore.contains(&lower) {
                pills.insert(lower, (member.clone(), nick.clone()));
            }
        }
    }

    Some(pills)
}

// =============================================================================
// Persisted configuration
// =============================================================================

/// Per-room persisted configuration, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomConfig {
    Network(NetworkRoomConfig),
    Direct(DirectRoomConfig),
    Channel(ChannelRoomConfig),
    Plumbed(PlumbedRoomConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRoomConfig {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub nick: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectRoomConfig {
    /// The peer's nick; `name` for consistency with the other kinds.
    pub name: String,
    pub network: String,
    #[serde(default)]
    pub media: Vec<MediaEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRoomConfig {
    pub name: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlumbedRoomConfig {
    #[serde(flatten)]
    pub channel: ChannelRoomConfig,
    pub max_lines: usize,
    pub use_pastebin: bool,
    pub use_displaynames: bool,
    pub use_disambiguation: bool,
    pub use_zwsp: bool,
    pub allow_notice: bool,
    #[serde(default)]
    pub need_invite: bool,
    /// Global policy snapshot frozen at plumb time.
    #[serde(default)]
    pub member_sync: MemberSync,
}
