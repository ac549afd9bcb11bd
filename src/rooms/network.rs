//! The network room.
//!
//! One per IRC network: owns the IRC link, routes incoming IRC events to
//! child rooms by target (creating direct rooms on demand), and collects
//! forwarded notices from children. Children hold only a [`NetworkRef`]
//! back here; the network owns them by key.

use super::direct::DirectRoom;
use super::{spawn_room_on, NetworkRef, RoomCore, RoomHandle, RoomInput, RoomLogic};
use crate::bridge::Bridge;
use crate::error::BridgeResult;
use crate::irc::{IrcEvent, IrcLink, IrcSender, LinkConfig, Source};
use crate::format::escape_html;
use async_trait::async_trait;
use slirc_proto::{irc_to_lower, ChannelExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delay before an automatic reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Numerics surfaced to the owner as notices (WHOIS output and common
/// errors); everything else is log-only.
const SURFACED_REPLIES: &[u16] = &[301, 311, 312, 313, 318, 319, 330, 401, 402, 406, 433];

/// Render a unix timestamp from a WHOIS reply, tolerating garbage input.
fn unix_to_local(timestamp: &str) -> String {
    let Ok(secs) = timestamp.parse::<i64>() else {
        return timestamp.to_string();
    };
    match chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0) {
        Some(when) => when.format("%c %Z").to_string(),
        None => timestamp.to_string(),
    }
}

pub struct NetworkRoom {
    core: RoomCore,
    name: String,
    link_config: Option<LinkConfig>,
    autoconnect: bool,
    sender: Option<Arc<dyn IrcSender>>,
    /// Child rooms by case-folded nick or channel name.
    children: HashMap<String, RoomHandle>,
    pills_length: usize,
    pills_ignore: Vec<String>,
    /// Our own mailbox, for reconnect scheduling and child back-references.
    self_tx: mpsc::UnboundedSender<RoomInput>,
}

impl NetworkRoom {
    /// Bring up a network room and its task.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        bridge: Bridge,
        room_id: &str,
        name: &str,
        link_config: Option<LinkConfig>,
        autoconnect: bool,
        pills_length: usize,
        pills_ignore: Vec<String>,
    ) -> BridgeResult<(RoomHandle, NetworkRef)> {
        let mut core = RoomCore::new(room_id, bridge);
        core.sync_members().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let network_ref = NetworkRef {
            name: name.to_string(),
            tx: tx.clone(),
            pills_length,
            pills_ignore: pills_ignore.clone(),
        };

        let room = NetworkRoom {
            core,
            name: name.to_string(),
            link_config,
            autoconnect,
            sender: None,
            children: HashMap::new(),
            pills_length,
            pills_ignore,
            self_tx: tx.clone(),
        };

        let handle = spawn_room_on(room, tx, rx);
        Ok((handle, network_ref))
    }

    fn network_ref(&self) -> NetworkRef {
        NetworkRef {
            name: self.name.clone(),
            tx: self.self_tx.clone(),
            pills_length: self.pills_length,
            pills_ignore: self.pills_ignore.clone(),
        }
    }

    async fn notice(&self, text: &str, formatted: Option<String>) {
        if let Err(e) = self.core.send_notice(text, None, formatted, None).await {
            self.core.report(&e).await;
        }
    }

    async fn connect(&mut self) {
        if self.sender.as_ref().is_some_and(|sender| sender.connected()) {
            return;
        }
        let Some(config) = self.link_config.clone() else {
            self.notice("No connection configuration for this network.", None)
                .await;
            return;
        };

        // Bridge link events into our own mailbox.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if self_tx.send(RoomInput::Irc(event)).is_err() {
                    break;
                }
            }
        });

        self.notice(&format!("Connecting to {}...", config.address), None)
            .await;

        match IrcLink::connect(config, event_tx).await {
            Ok(sender) => {
                self.sender = Some(Arc::clone(&sender));
                for child in self.children.values() {
                    child.send(RoomInput::LinkUp(Arc::clone(&sender)));
                }
            }
            Err(e) => {
                self.notice(&format!("Failed to connect: {e}"), None).await;
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&self) {
        if !self.autoconnect {
            return;
        }
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            let _ = tx.send(RoomInput::Connect);
        });
    }

    fn our_nick(&self) -> String {
        self.sender
            .as_ref()
            .map(|s| s.real_nickname())
            .unwrap_or_default()
    }

    fn child(&self, key: &str) -> Option<&RoomHandle> {
        self.children.get(&irc_to_lower(key))
    }

    fn broadcast(&self, event: &IrcEvent) {
        for child in self.children.values() {
            child.send(RoomInput::Irc(event.clone()));
        }
    }

    /// Route a message-carrying event addressed to a nick (not a channel).
    ///
    /// The room key is the peer: the source nick normally, the target when
    /// this is our own message echoed back by the server.
    async fn route_private(&mut self, source: &Source, target: &str, event: IrcEvent) {
        let ours = irc_to_lower(&self.our_nick());
        let key = if irc_to_lower(&source.nick) == ours {
            irc_to_lower(target)
        } else {
            irc_to_lower(&source.nick)
        };

        if let Some(child) = self.children.get(&key) {
            child.send(RoomInput::Irc(event));
            return;
        }

        match &event {
            IrcEvent::Privmsg { .. } | IrcEvent::Ctcp { .. } => {
                // First private message from this nick: create the room.
                let peer = if key == irc_to_lower(target) {
                    target
                } else {
                    source.nick.as_str()
                };
                match DirectRoom::create(
                    self.core.bridge.clone(),
                    self.network_ref(),
                    self.sender.clone(),
                    peer,
                )
                .await
                {
                    Ok(handle) => {
                        info!(network = %self.name, nick = %peer, "created direct room");
                        self.children.insert(key, handle.clone());
                        handle.send(RoomInput::Irc(event));
                    }
                    Err(e) => {
                        self.notice(&format!("Failed to create room for {peer}: {e}"), None)
                            .await;
                    }
                }
            }
            IrcEvent::Notice { text, .. } => {
                // Roomless private notices surface here instead.
                self.notice(
                    &format!("Notice from {source}: {text}"),
                    Some(format!(
                        "Notice from <b>{}</b>: {}",
                        escape_html(&source.to_string()),
                        escape_html(text)
                    )),
                )
                .await;
            }
            IrcEvent::CtcpReply { command, params, .. } => {
                let detail = match params {
                    Some(params) => format!("{command} {params}"),
                    None => command.clone(),
                };
                self.notice(&format!("CTCP reply from {source}: {detail}"), None)
                    .await;
            }
            _ => {}
        }
    }

    async fn on_irc(&mut self, event: IrcEvent) {
        match &event {
            IrcEvent::Registered { nickname } => {
                self.notice(&format!("Connected, nickname is {nickname}"), None)
                    .await;
                self.broadcast(&event);
            }
            IrcEvent::Disconnected { reason } => {
                self.notice(&format!("Disconnected: {reason}"), None).await;
                for child in self.children.values() {
                    child.send(RoomInput::LinkDown);
                }
                self.schedule_reconnect();
            }
            IrcEvent::Privmsg { source, target, .. }
            | IrcEvent::Notice { source, target, .. }
            | IrcEvent::Ctcp { source, target, .. }
            | IrcEvent::CtcpReply { source, target, .. } => {
                if target.as_str().is_channel_name() {
                    match self.child(target) {
                        Some(child) => child.send(RoomInput::Irc(event)),
                        None => debug!(channel = %target, "message for unbridged channel"),
                    }
                } else {
                    let (source, target) = (source.clone(), target.clone());
                    self.route_private(&source, &target, event).await;
                }
            }
            IrcEvent::Join { source, channel } => {
                if let Some(child) = self.child(channel) {
                    child.send(RoomInput::Irc(event));
                } else if irc_to_lower(&source.nick) == irc_to_lower(&self.our_nick()) {
                    // We joined a channel nothing is bridged to yet; follow.
                    let (channel, source) = (channel.clone(), source.clone());
                    match super::channel::ChannelRoom::create(
                        self.core.bridge.clone(),
                        self.network_ref(),
                        self.sender.clone(),
                        &channel,
                        None,
                    )
                    .await
                    {
                        Ok(handle) => {
                            info!(network = %self.name, channel = %channel, "created channel room");
                            self.children.insert(irc_to_lower(&channel), handle.clone());
                            handle.send(RoomInput::Irc(IrcEvent::Join { source, channel }));
                        }
                        Err(e) => {
                            self.notice(
                                &format!("Failed to create room for {channel}: {e}"),
                                None,
                            )
                            .await;
                        }
                    }
                } else {
                    debug!(channel, "join for unbridged channel");
                }
            }
            IrcEvent::Part { channel, .. }
            | IrcEvent::Kick { channel, .. }
            | IrcEvent::Topic { channel, .. } => match self.child(channel) {
                Some(child) => child.send(RoomInput::Irc(event)),
                None => debug!(channel, "event for unbridged channel"),
            },
            IrcEvent::Mode { target, .. } => {
                if target.as_str().is_channel_name() {
                    if let Some(child) = self.child(target) {
                        child.send(RoomInput::Irc(event));
                    }
                }
            }
            IrcEvent::Quit { .. } => self.broadcast(&event),
            IrcEvent::NickChange { source, new_nick } => {
                // Direct rooms are keyed by nick; follow the rename.
                let old_key = irc_to_lower(&source.nick);
                let new_key = irc_to_lower(new_nick);
                if let Some(handle) = self.children.remove(&old_key) {
                    handle.send(RoomInput::Irc(event.clone()));
                    self.children.insert(new_key, handle);
                }
                self.broadcast(&event);
            }
            IrcEvent::ServerReply { code, params } => {
                // NAMES replies belong to their channel room.
                let channel_param = match code {
                    353 => params.get(2),
                    366 => params.get(1),
                    _ => None,
                };
                if let Some(channel) = channel_param {
                    if let Some(child) = self.child(channel) {
                        child.send(RoomInput::Irc(event.clone()));
                    }
                    return;
                }

                if *code == 317 && params.len() >= 4 {
                    // RPL_WHOISIDLE: <nick> <idle> <signon> :seconds idle...
                    self.notice(
                        &format!(
                            "{} has been idle {} seconds, signed on {}",
                            params[1],
                            params[2],
                            unix_to_local(&params[3])
                        ),
                        None,
                    )
                    .await;
                } else if SURFACED_REPLIES.contains(code) && params.len() > 1 {
                    self.notice(&params[1..].join(" "), None).await;
                } else {
                    debug!(code, "unrouted server reply");
                }
            }
        }
    }
}

#[async_trait]
impl RoomLogic for NetworkRoom {
    fn room_id(&self) -> &str {
        &self.core.id
    }

    async fn handle(&mut self, input: RoomInput) -> bool {
        match input {
            RoomInput::Irc(event) => self.on_irc(event).await,
            RoomInput::Connect => self.connect().await,
            RoomInput::Notice { text, formatted } => self.notice(&text, formatted).await,
            RoomInput::ChildOpened { key, handle } => {
                if let Some(sender) = &self.sender {
                    handle.send(RoomInput::LinkUp(Arc::clone(sender)));
                }
                self.children.insert(irc_to_lower(&key), handle);
            }
            RoomInput::ChildClosed { key } => {
                self.children.remove(&irc_to_lower(&key));
            }
            RoomInput::Membership {
                user_id,
                membership,
                displayname,
            } => {
                self.core.apply_membership(&user_id, &membership, displayname);
            }
            RoomInput::MxMessage(_) | RoomInput::MxRedaction(_) => {
                // The control-surface command shell owns this room's
                // messages; the relay core has nothing to do here.
            }
            RoomInput::LinkUp(_) | RoomInput::LinkDown => {
                warn!(room = %self.core.id, "unexpected link input for network room");
            }
        }
        true
    }
}
