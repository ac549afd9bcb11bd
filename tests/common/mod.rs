//! Integration test common infrastructure.
//!
//! The relay core talks to two collaborators: the homeserver API and the
//! IRC connection. Both get in-process fakes here - a recording Matrix
//! client with canned responses and a collecting IRC sender - so room
//! logic can be driven end to end without sockets.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use slirc_bridge::bridge::Bridge;
use slirc_bridge::config::BridgeConfig;
use slirc_bridge::irc::IrcSender;
use slirc_bridge::matrix::{
    MatrixClient, MatrixError, MatrixResult, MemberInfo, MessageContent, MessageEvent,
    SyncResponse,
};
use slirc_bridge::persistence::SaveOp;
use slirc_bridge::rooms::{NetworkRef, RoomInput};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// =============================================================================
// Recording Matrix client
// =============================================================================

/// One observed API call, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SendMessage {
        room_id: String,
        user_id: Option<String>,
        content: MessageContent,
    },
    Reaction {
        room_id: String,
        event_id: String,
        key: String,
    },
    Receipt {
        room_id: String,
        event_id: String,
    },
    Upload {
        content_type: String,
        bytes: usize,
    },
    Invite {
        room_id: String,
        user_id: String,
    },
    Join {
        room: String,
        user_id: Option<String>,
    },
    Leave {
        room_id: String,
        user_id: Option<String>,
    },
    Register {
        localpart: String,
    },
    Displayname {
        user_id: String,
        displayname: String,
    },
    StateEvent {
        room_id: String,
        event_type: String,
        content: Value,
    },
    AccountDataPut,
    Quarantine {
        server_name: String,
        media_id: String,
    },
    CreateRoom {
        name: String,
    },
    Redact {
        room_id: String,
        event_id: String,
    },
}

#[derive(Default)]
pub struct RecordingMatrix {
    pub calls: Mutex<Vec<Call>>,
    /// Canned `get_room_event` responses by event id.
    pub events: Mutex<HashMap<String, MessageEvent>>,
    /// Canned joined members by room id.
    pub members: Mutex<HashMap<String, HashMap<String, MemberInfo>>>,
    /// Canned account data; `None` responds 404.
    pub account_data: Mutex<Option<Value>>,
    /// Canned state events by (room id, event type).
    pub state: Mutex<HashMap<(String, String), Value>>,
    counter: AtomicUsize,
}

impl RecordingMatrix {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_member(&self, room_id: &str, user_id: &str, displayname: Option<&str>) {
        self.members
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .insert(
                user_id.to_string(),
                MemberInfo {
                    display_name: displayname.map(String::from),
                    avatar_url: None,
                },
            );
    }

    pub fn put_event(&self, event: MessageEvent) {
        self.events.lock().insert(event.event_id.clone(), event);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Message contents posted to a room, with the impersonated user.
    pub fn sent_messages(&self, room: &str) -> Vec<(Option<String>, MessageContent)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::SendMessage {
                    room_id,
                    user_id,
                    content,
                } if room_id == room => Some((user_id, content)),
                _ => None,
            })
            .collect()
    }

    pub fn reactions(&self, room: &str) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Reaction {
                    room_id,
                    event_id,
                    key,
                } if room_id == room => Some((event_id, key)),
                _ => None,
            })
            .collect()
    }

    pub fn receipts(&self, room: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Receipt { room_id, event_id } if room_id == room => Some(event_id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}{n}")
    }
}

#[async_trait]
impl MatrixClient for RecordingMatrix {
    async fn create_room(
        &self,
        name: &str,
        _topic: &str,
        _invite: &[String],
    ) -> MatrixResult<String> {
        self.record(Call::CreateRoom {
            name: name.to_string(),
        });
        Ok(self.next_id("!room"))
    }

    async fn join_room(&self, room: &str, user_id: Option<&str>) -> MatrixResult<String> {
        self.record(Call::Join {
            room: room.to_string(),
            user_id: user_id.map(String::from),
        });
        Ok(room.to_string())
    }

    async fn invite_user(&self, room_id: &str, user_id: &str) -> MatrixResult<()> {
        self.record(Call::Invite {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    async fn leave_room(&self, room_id: &str, user_id: Option<&str>) -> MatrixResult<()> {
        self.record(Call::Leave {
            room_id: room_id.to_string(),
            user_id: user_id.map(String::from),
        });
        Ok(())
    }

    async fn kick_user(&self, _room_id: &str, _user_id: &str, _reason: &str) -> MatrixResult<()> {
        Ok(())
    }

    async fn get_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        _state_key: &str,
    ) -> MatrixResult<Value> {
        self.state
            .lock()
            .get(&(room_id.to_string(), event_type.to_string()))
            .cloned()
            .ok_or(MatrixError::NotFound)
    }

    async fn put_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        _state_key: &str,
        content: Value,
    ) -> MatrixResult<String> {
        self.record(Call::StateEvent {
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            content,
        });
        Ok(self.next_id("$state"))
    }

    async fn get_room_event(&self, _room_id: &str, event_id: &str) -> MatrixResult<MessageEvent> {
        self.events
            .lock()
            .get(event_id)
            .cloned()
            .ok_or(MatrixError::NotFound)
    }

    async fn get_joined_members(
        &self,
        room_id: &str,
    ) -> MatrixResult<HashMap<String, MemberInfo>> {
        Ok(self.members.lock().get(room_id).cloned().unwrap_or_default())
    }

    async fn send_message(
        &self,
        room_id: &str,
        user_id: Option<&str>,
        content: &MessageContent,
    ) -> MatrixResult<String> {
        self.record(Call::SendMessage {
            room_id: room_id.to_string(),
            user_id: user_id.map(String::from),
            content: content.clone(),
        });
        Ok(self.next_id("$ev"))
    }

    async fn send_reaction(
        &self,
        room_id: &str,
        event_id: &str,
        key: &str,
    ) -> MatrixResult<String> {
        self.record(Call::Reaction {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
            key: key.to_string(),
        });
        Ok(self.next_id("$react"))
    }

    async fn send_receipt(&self, room_id: &str, event_id: &str) -> MatrixResult<()> {
        self.record(Call::Receipt {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
        });
        Ok(())
    }

    async fn redact_event(
        &self,
        room_id: &str,
        event_id: &str,
        _reason: Option<&str>,
    ) -> MatrixResult<String> {
        self.record(Call::Redact {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
        });
        Ok(self.next_id("$redact"))
    }

    async fn upload_media(
        &self,
        data: Vec<u8>,
        content_type: &str,
        _filename: Option<&str>,
    ) -> MatrixResult<String> {
        self.record(Call::Upload {
            content_type: content_type.to_string(),
            bytes: data.len(),
        });
        Ok(format!("mxc://test/{}", self.next_id("blob")))
    }

    fn media_url(&self, mxc_uri: &str, _filename: Option<&str>) -> String {
        match mxc_uri.strip_prefix("mxc://") {
            Some(rest) => format!("https://hs.test/_matrix/media/v3/download/{rest}"),
            None => mxc_uri.to_string(),
        }
    }

    async fn get_account_data(&self, _user_id: &str, _key: &str) -> MatrixResult<Value> {
        self.account_data.lock().clone().ok_or(MatrixError::NotFound)
    }

    async fn put_account_data(
        &self,
        _user_id: &str,
        _key: &str,
        data: &Value,
    ) -> MatrixResult<()> {
        self.record(Call::AccountDataPut);
        *self.account_data.lock() = Some(data.clone());
        Ok(())
    }

    async fn register_user(&self, localpart: &str) -> MatrixResult<()> {
        self.record(Call::Register {
            localpart: localpart.to_string(),
        });
        Ok(())
    }

    async fn set_displayname(&self, user_id: &str, displayname: &str) -> MatrixResult<()> {
        self.record(Call::Displayname {
            user_id: user_id.to_string(),
            displayname: displayname.to_string(),
        });
        Ok(())
    }

    async fn get_displayname(&self, _user_id: &str) -> MatrixResult<Option<String>> {
        Ok(None)
    }

    async fn quarantine_media(&self, server_name: &str, media_id: &str) -> MatrixResult<()> {
        self.record(Call::Quarantine {
            server_name: server_name.to_string(),
            media_id: media_id.to_string(),
        });
        Ok(())
    }

    async fn sync(&self, _since: Option<&str>, _timeout_ms: u64) -> MatrixResult<SyncResponse> {
        Ok(SyncResponse::default())
    }
}

// =============================================================================
// Collecting IRC sender
// =============================================================================

/// One line handed to the IRC connection.
#[derive(Debug, Clone, PartialEq)]
pub struct IrcLine {
    pub kind: &'static str,
    pub target: String,
    pub text: String,
}

pub struct CollectingIrc {
    pub lines: Mutex<Vec<IrcLine>>,
    pub nickname: Mutex<String>,
    pub username: String,
    pub host: String,
    pub up: AtomicBool,
}

impl CollectingIrc {
    pub fn new(nick: &str) -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(Vec::new()),
            nickname: Mutex::new(nick.to_string()),
            username: nick.to_string(),
            host: "host.example".to_string(),
            up: AtomicBool::new(true),
        })
    }

    pub fn lines(&self) -> Vec<IrcLine> {
        self.lines.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.lines().into_iter().map(|line| line.text).collect()
    }

    fn push(&self, kind: &'static str, target: &str, text: &str) {
        self.lines.lock().push(IrcLine {
            kind,
            target: target.to_string(),
            text: text.to_string(),
        });
    }
}

impl IrcSender for CollectingIrc {
    fn privmsg(&self, target: &str, text: &str) {
        self.push("privmsg", target, text);
    }

    fn notice(&self, target: &str, text: &str) {
        self.push("notice", target, text);
    }

    fn action(&self, target: &str, text: &str) {
        self.push("action", target, text);
    }

    fn whois(&self, query: &str) {
        self.push("whois", query, "");
    }

    fn join(&self, channel: &str, _key: Option<&str>) {
        self.push("join", channel, "");
    }

    fn part(&self, channel: &str, reason: Option<&str>) {
        self.push("part", channel, reason.unwrap_or_default());
    }

    fn real_nickname(&self) -> String {
        self.nickname.lock().clone()
    }

    fn username(&self) -> String {
        self.username.clone()
    }

    fn real_host(&self) -> String {
        self.host.clone()
    }

    fn connected(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Test bed
// =============================================================================

pub const OWNER: &str = "@op:example.com";
pub const BOT: &str = "@slircb:example.com";
pub const NETWORK: &str = "oftc";

pub fn test_config() -> BridgeConfig {
    toml::from_str(
        r#"
        [homeserver]
        url = "https://hs.test"
        token = "secret"
        admin = true

        [bridge]
        owner = "@op:example.com"
        server_name = "example.com"
        "#,
    )
    .expect("test config")
}

/// Everything a room test needs: the fakes, a bridge wired to them, and a
/// network back-reference whose mailbox we hold the other end of.
pub struct TestBed {
    pub api: Arc<RecordingMatrix>,
    pub bridge: Bridge,
    pub irc: Arc<CollectingIrc>,
    pub network: NetworkRef,
    pub network_rx: mpsc::UnboundedReceiver<RoomInput>,
    pub save_rx: mpsc::UnboundedReceiver<SaveOp>,
}

impl TestBed {
    pub fn new() -> Self {
        let api = RecordingMatrix::new();
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let client: Arc<dyn MatrixClient> = api.clone();
        let bridge = Bridge::new(client, &test_config(), save_tx);
        let irc = CollectingIrc::new("op");
        let (network_tx, network_rx) = mpsc::unbounded_channel();

        TestBed {
            api,
            bridge,
            irc,
            network: NetworkRef {
                name: NETWORK.to_string(),
                tx: network_tx,
                pills_length: 2,
                pills_ignore: Vec::new(),
            },
            network_rx,
            save_rx,
        }
    }

    pub fn irc_sender(&self) -> Arc<dyn IrcSender> {
        self.irc.clone()
    }

    /// Drain queued save ops into their configs.
    pub fn saved_configs(&mut self) -> Vec<slirc_bridge::rooms::RoomConfig> {
        let mut configs = Vec::new();
        while let Ok(op) = self.save_rx.try_recv() {
            if let SaveOp::Room { config, .. } = op {
                configs.push(config);
            }
        }
        configs
    }
}

/// A plain text message event.
pub fn text_event(event_id: &str, sender: &str, body: &str) -> MessageEvent {
    MessageEvent {
        event_id: event_id.to_string(),
        sender: sender.to_string(),
        content: MessageContent::text(body),
    }
}

/// An edit of `replaces` with the given new body.
pub fn edit_event(event_id: &str, sender: &str, replaces: &str, new_body: &str) -> MessageEvent {
    let mut content = MessageContent::text(format!("* {new_body}"));
    content.new_content = Some(Box::new(MessageContent::text(new_body)));
    content.relates_to = Some(slirc_bridge::matrix::RelatesTo {
        rel_type: Some("m.replace".to_string()),
        event_id: Some(replaces.to_string()),
        in_reply_to: None,
    });
    MessageEvent {
        event_id: event_id.to_string(),
        sender: sender.to_string(),
        content,
    }
}
