//! Channel rooms.
//!
//! A channel room mirrors one IRC channel into Matrix: membership is
//! reflected through puppets according to the member-sync policy, topic and
//! mode changes are surfaced, and the owner's messages relay out. The
//! plumbed flavor shares this state machine with its policies applied; the
//! plumbed-specific behavior lives in [`super::plumbed`].

use super::direct::quarantine_media;
use super::{
    build_pills, plumbed, ChannelRoomConfig, MediaEntry, NetworkRef, PlumbedRoomConfig,
    RoomConfig, RoomCore, RoomInput, RoomLogic,
};
use crate::bridge::Bridge;
use crate::commands::{command_trigger, CommandSet};
use crate::config::MemberSync;
use crate::error::BridgeResult;
use crate::format::{escape_html, parse_irc_formatting};
use crate::irc::{IrcEvent, IrcSender, Source};
use crate::matrix::{msgtype, MessageEvent, RedactionEvent};
use crate::relay::{self, LineKind, RelayPolicy, REACT_MEDIA};
use async_trait::async_trait;
use serde_json::json;
use slirc_proto::irc_to_lower;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Relay policy of one channel room. For mirrored channels this is all
/// defaults; plumbed rooms carry the persisted policy set and
/// `plumbed = true` (which also makes local notices forward to the
/// network room).
#[derive(Debug, Clone)]
pub struct ChannelPolicy {
    pub plumbed: bool,
    pub max_lines: usize,
    pub use_pastebin: bool,
    pub use_displaynames: bool,
    pub use_disambiguation: bool,
    pub use_zwsp: bool,
    pub allow_notice: bool,
    pub need_invite: bool,
    pub member_sync: MemberSync,
}

impl ChannelPolicy {
    pub fn mirrored(member_sync: MemberSync) -> Self {
        Self {
            plumbed: false,
            max_lines: 0,
            use_pastebin: false,
            use_displaynames: false,
            use_disambiguation: false,
            use_zwsp: false,
            allow_notice: true,
            need_invite: false,
            member_sync,
        }
    }

    /// Defaults for a fresh plumb.
    pub fn plumbed(member_sync: MemberSync) -> Self {
        Self {
            plumbed: true,
            max_lines: 5,
            use_pastebin: true,
            use_displaynames: false,
            use_disambiguation: true,
            use_zwsp: false,
            allow_notice: false,
            need_invite: false,
            member_sync,
        }
    }

    pub fn relay(&self) -> RelayPolicy {
        RelayPolicy {
            max_lines: self.max_lines,
            use_pastebin: self.use_pastebin,
        }
    }
}

pub struct ChannelRoom {
    pub(super) core: RoomCore,
    /// Case-folded channel name.
    pub(super) name: String,
    pub(super) key: Option<String>,
    pub(super) network: NetworkRef,
    pub(super) sender: Option<Arc<dyn IrcSender>>,
    pub(super) policy: ChannelPolicy,
    pub(super) commands: CommandSet,
    /// Nicks currently in the IRC channel, case-folded.
    pub(super) irc_members: HashSet<String>,
    /// NAMES accumulation between 353 and 366.
    names_buffer: HashSet<String>,
    pub(super) joined: bool,
}

impl ChannelRoom {
    pub(super) fn assemble(
        core: RoomCore,
        name: &str,
        key: Option<String>,
        network: NetworkRef,
        sender: Option<Arc<dyn IrcSender>>,
        policy: ChannelPolicy,
    ) -> Self {
        let commands = if policy.plumbed {
            plumbed::commands()
        } else {
            CommandSet::new()
        };
        Self {
            core,
            name: irc_to_lower(name),
            key,
            network,
            sender,
            policy,
            commands,
            irc_members: HashSet::new(),
            names_buffer: HashSet::new(),
            joined: false,
        }
    }

    /// Create the Matrix room for a channel we joined on IRC.
    pub async fn create(
        bridge: Bridge,
        network: NetworkRef,
        sender: Option<Arc<dyn IrcSender>>,
        channel: &str,
        key: Option<String>,
    ) -> BridgeResult<super::RoomHandle> {
        let room_id = bridge
            .api()
            .create_room(
                &format!("{channel} ({})", network.name),
                &format!("{channel} on {}", network.name),
                &[bridge.owner().to_string()],
            )
            .await?;

        let mut core = RoomCore::new(&room_id, bridge.clone());
        core.members.insert(core.user_id.clone());
        core.members.insert(bridge.bot_user_id().to_string());

        let member_sync = bridge.member_sync();
        let room = Self::assemble(
            core,
            channel,
            key,
            network,
            sender,
            ChannelPolicy::mirrored(member_sync),
        );
        room.save();

        let handle = super::spawn_room(room);
        bridge.register_room(handle.clone());
        Ok(handle)
    }

    /// Restore a persisted mirrored channel room.
    pub async fn restore(
        bridge: Bridge,
        room_id: &str,
        config: ChannelRoomConfig,
        network: NetworkRef,
        sender: Option<Arc<dyn IrcSender>>,
    ) -> BridgeResult<Self> {
        let member_sync = bridge.member_sync();
        let mut core = RoomCore::new(room_id, bridge);
        core.sync_members().await?;
        core.media = config.media.clone();

        Ok(Self::assemble(
            core,
            &config.name,
            config.key.clone(),
            network,
            sender,
            ChannelPolicy::mirrored(member_sync),
        ))
    }

    /// Restore a persisted plumbed room.
    pub async fn restore_plumbed(
        bridge: Bridge,
        room_id: &str,
        config: PlumbedRoomConfig,
        network: NetworkRef,
        sender: Option<Arc<dyn IrcSender>>,
    ) -> BridgeResult<Self> {
        let mut core = RoomCore::new(room_id, bridge);
        core.sync_members().await?;
        core.media = config.channel.media.clone();

        let policy = ChannelPolicy {
            plumbed: true,
            max_lines: config.max_lines,
            use_pastebin: config.use_pastebin,
            use_displaynames: config.use_displaynames,
            use_disambiguation: config.use_disambiguation,
            use_zwsp: config.use_zwsp,
            allow_notice: config.allow_notice,
            need_invite: config.need_invite,
            member_sync: config.member_sync,
        };

        Ok(Self::assemble(
            core,
            &config.channel.name,
            config.channel.key.clone(),
            network,
            sender,
            policy,
        ))
    }

    pub fn is_valid(&self) -> bool {
        if self.core.id.is_empty() || self.name.is_empty() {
            return false;
        }
        if self.policy.plumbed {
            // Valid for as long as the bridge itself is in the room.
            self.core.in_room(self.core.bridge.bot_user_id())
        } else {
            self.core.in_room(&self.core.user_id)
        }
    }

    pub(super) fn to_config(&self) -> RoomConfig {
        let channel = ChannelRoomConfig {
            name: self.name.clone(),
            network: self.network.name.clone(),
            key: self.key.clone(),
            media: self.core.media_tail(),
        };

        if self.policy.plumbed {
            RoomConfig::Plumbed(PlumbedRoomConfig {
                channel,
                max_lines: self.policy.max_lines,
                use_pastebin: self.policy.use_pastebin,
                use_displaynames: self.policy.use_displaynames,
                use_disambiguation: self.policy.use_disambiguation,
                use_zwsp: self.policy.use_zwsp,
                allow_notice: self.policy.allow_notice,
                need_invite: self.policy.need_invite,
                member_sync: self.policy.member_sync,
            })
        } else {
            RoomConfig::Channel(channel)
        }
    }

    pub(super) fn save(&self) {
        self.core.bridge.save_room(&self.core.id, self.to_config());
    }

    pub(super) fn connected_sender(&self) -> Option<&Arc<dyn IrcSender>> {
        self.sender.as_ref().filter(|sender| sender.connected())
    }

    fn is_self(&self, source: &Source) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| irc_to_lower(&source.nick) == irc_to_lower(&sender.real_nickname()))
    }

    /// Local notice, forwarded to the network room when plumbed.
    pub(super) async fn notice(&self, text: &str, formatted: Option<String>) {
        if self.policy.plumbed {
            self.network.forward_notice(&self.name, text, formatted);
            return;
        }
        if let Err(e) = self.core.send_notice(text, None, formatted, None).await {
            self.core.report(&e).await;
        }
    }

    pub(super) fn pills(&self) -> Option<crate::format::PillMap> {
        let mut pills = build_pills(&self.core, &self.network, self.sender.as_ref())?;
        if self.policy.plumbed {
            // Self-mentions on the Matrix side only cause confusion.
            if let Some(sender) = &self.sender {
                pills.remove(&sender.real_nickname().to_lowercase());
            }
        }
        Some(pills)
    }

    async fn puppet_join(&mut self, nick: &str) -> BridgeResult<()> {
        let puppet = self
            .core
            .bridge
            .ensure_puppet(&self.network.name, nick)
            .await?;
        if !self.core.in_room(&puppet) {
            let api = self.core.bridge.api();
            // An already-pending invite is fine.
            let _ = api.invite_user(&self.core.id, &puppet).await;
            api.join_room(&self.core.id, Some(&puppet)).await?;
            self.core.members.insert(puppet.clone());
            self.core.displaynames.insert(puppet, nick.to_string());
        }
        Ok(())
    }

    async fn puppet_leave(&mut self, nick: &str) {
        let puppet = self.core.bridge.puppet_user_id(&self.network.name, nick);
        if self.core.in_room(&puppet) {
            let _ = self
                .core
                .bridge
                .api()
                .leave_room(&self.core.id, Some(&puppet))
                .await;
            self.core.members.remove(&puppet);
            self.core.displaynames.remove(&puppet);
        }
    }

    /// Make sure the puppet for a speaker exists in the room; under `half`
    /// sync this is what populates membership.
    async fn ensure_speaker(&mut self, nick: &str) -> BridgeResult<Option<String>> {
        match self.policy.member_sync {
            MemberSync::Off => Ok(None),
            MemberSync::Half | MemberSync::Full => {
                self.puppet_join(nick).await?;
                Ok(Some(
                    self.core.bridge.puppet_user_id(&self.network.name, nick),
                ))
            }
        }
    }

    async fn on_privmsg(&mut self, source: &Source, text: &str) -> BridgeResult<()> {
        if self.is_self(source) {
            // Our own line echoed back; the Matrix side already has it.
            return Ok(());
        }

        let pills = self.pills();
        let (plain, formatted) = parse_irc_formatting(text, pills.as_ref());
        let puppet = self.ensure_speaker(&source.nick).await?;
        let fallback = format!(
            "<b>Message from {}</b>: {}",
            escape_html(&source.to_string()),
            escape_html(&plain)
        );
        self.core
            .send_message(puppet.as_deref(), &plain, formatted, Some(fallback))
            .await?;
        Ok(())
    }

    async fn on_privnotice(&mut self, source: &Source, text: &str) -> BridgeResult<()> {
        if self.is_self(source) {
            return Ok(());
        }

        let pills = self.pills();
        let (plain, formatted) = parse_irc_formatting(text, pills.as_ref());
        let puppet = self.ensure_speaker(&source.nick).await?;
        let fallback = format!(
            "<b>Notice from {}</b>: {}",
            escape_html(&source.to_string()),
            escape_html(&plain)
        );
        self.core
            .send_notice(&plain, puppet.as_deref(), formatted, Some(fallback))
            .await?;
        Ok(())
    }

    async fn on_ctcp(
        &mut self,
        source: &Source,
        command: &str,
        params: Option<&str>,
    ) -> BridgeResult<()> {
        if command != "ACTION" {
            debug!(command, "ignoring channel CTCP");
            return Ok(());
        }
        if self.is_self(source) {
            return Ok(());
        }

        let (plain, _) = parse_irc_formatting(params.unwrap_or_default(), None);
        let puppet = self.ensure_speaker(&source.nick).await?;
        let fallback = format!(
            "<b>Emote from {}</b>: {}",
            escape_html(&source.to_string()),
            escape_html(&plain)
        );
        self.core
            .send_emote(puppet.as_deref(), &plain, Some(fallback))
            .await?;
        Ok(())
    }

    async fn on_join(&mut self, source: &Source) -> BridgeResult<()> {
        if self.is_self(source) {
            info!(channel = %self.name, "joined channel");
            self.joined = true;
            self.irc_members.clear();
            return Ok(());
        }

        self.irc_members.insert(irc_to_lower(&source.nick));
        if self.policy.member_sync == MemberSync::Full {
            self.puppet_join(&source.nick).await?;
        }
        Ok(())
    }

    async fn on_part(&mut self, source: &Source, _reason: Option<&str>) -> BridgeResult<()> {
        if self.is_self(source) {
            self.joined = false;
            self.notice("You have left the channel.", None).await;
            return Ok(());
        }

        self.irc_members.remove(&irc_to_lower(&source.nick));
        self.puppet_leave(&source.nick).await;
        Ok(())
    }

    async fn on_quit(&mut self, source: &Source) -> BridgeResult<()> {
        if self.irc_members.remove(&irc_to_lower(&source.nick)) {
            self.puppet_leave(&source.nick).await;
        }
        Ok(())
    }

    async fn on_kick(
        &mut self,
        source: &Source,
        nick: &str,
        reason: Option<&str>,
    ) -> BridgeResult<()> {
        let reason = reason.unwrap_or("no reason");
        let ours = self
            .sender
            .as_ref()
            .is_some_and(|sender| irc_to_lower(nick) == irc_to_lower(&sender.real_nickname()));

        if ours {
            self.joined = false;
            self.notice(
                &format!("You were kicked from {} by {} ({reason})", self.name, source.nick),
                None,
            )
            .await;
            return Ok(());
        }

        self.irc_members.remove(&irc_to_lower(nick));
        self.puppet_leave(nick).await;
        self.notice(
            &format!("{nick} was kicked by {} ({reason})", source.nick),
            Some(format!(
                "<b>{}</b> was kicked by <b>{}</b> ({})",
                escape_html(nick),
                escape_html(&source.nick),
                escape_html(reason)
            )),
        )
        .await;
        Ok(())
    }

    async fn on_nick_change(&mut self, source: &Source, new_nick: &str) -> BridgeResult<()> {
        if !self.irc_members.remove(&irc_to_lower(&source.nick)) {
            return Ok(());
        }
        self.irc_members.insert(irc_to_lower(new_nick));

        self.puppet_leave(&source.nick).await;
        if self.policy.member_sync == MemberSync::Full {
            self.puppet_join(new_nick).await?;
        }
        Ok(())
    }

    async fn set_topic(&mut self, _source: &Source, topic: &str) -> BridgeResult<()> {
        if self.policy.plumbed {
            // Plumbed rooms never touch the Matrix topic state.
            self.notice(&format!("New topic is: '{topic}'"), None).await;
            return Ok(());
        }

        self.core
            .bridge
            .api()
            .put_state_event(&self.core.id, "m.room.topic", "", json!({"topic": topic}))
            .await?;
        Ok(())
    }

    async fn on_names(&mut self, code: u16, params: &[String]) -> BridgeResult<()> {
        match code {
            353 => {
                if let Some(names) = params.last() {
                    let ours = self
                        .sender
                        .as_ref()
                        .map(|sender| irc_to_lower(&sender.real_nickname()))
                        .unwrap_or_default();
                    for name in names.split_whitespace() {
                        let nick = name.trim_start_matches(['@', '+', '%', '&', '~']);
                        if irc_to_lower(nick) != ours {
                            self.names_buffer.insert(nick.to_string());
                        }
                    }
                }
            }
            366 => {
                self.irc_members = self
                    .names_buffer
                    .iter()
                    .map(|nick| irc_to_lower(nick))
                    .collect();
                let names: Vec<String> = self.names_buffer.drain().collect();
                if self.policy.member_sync == MemberSync::Full {
                    for nick in names {
                        self.puppet_join(&nick).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// The owner's message in a mirrored channel room: relay like a direct
    /// room does, with no sender prefix.
    async fn on_mx_message_mirrored(&mut self, event: MessageEvent) -> BridgeResult<()> {
        if event.sender != self.core.user_id {
            return Ok(());
        }

        let content = &event.content;

        if content.msgtype == msgtype::TEXT && !content.is_edit() {
            if let Some(line) = command_trigger(&content.body, self.core.bridge.bot_localpart()) {
                let line = line.to_string();
                match self.commands.parse(&line) {
                    Ok(invocation) => {
                        if invocation.name == "HELP" {
                            let help = self.commands.help_text();
                            self.core.send_notice(&help, None, None, None).await?;
                        }
                    }
                    Err(e) => {
                        self.core.send_notice(&e.to_string(), None, None, None).await?;
                    }
                }
                return Ok(());
            }
        }

        let Some(sender) = self.connected_sender().cloned() else {
            self.core
                .send_notice("Not connected to network.", None, None, None)
                .await?;
            return Ok(());
        };

        let target = self.name.clone();
        let mut media_changed = false;

        if msgtype::MEDIA.contains(&content.msgtype.as_str()) {
            if let Some(url) = &content.url {
                let link = self.core.bridge.api().media_url(url, Some(&content.body));
                sender.privmsg(&target, &link);
                self.core.react(&event.event_id, REACT_MEDIA).await?;
                self.core.media.push(MediaEntry {
                    event_id: event.event_id.clone(),
                    url: url.clone(),
                });
                media_changed = true;
            }
        } else if content.effective().msgtype == msgtype::EMOTE {
            media_changed = relay::relay_mx_message(
                &mut self.core,
                &self.policy.relay(),
                &event,
                LineKind::Action,
                "",
                &sender,
                &target,
            )
            .await?;
        } else if content.effective().msgtype == msgtype::TEXT {
            media_changed = relay::relay_mx_message(
                &mut self.core,
                &self.policy.relay(),
                &event,
                LineKind::Privmsg,
                "",
                &sender,
                &target,
            )
            .await?;
        }

        if media_changed {
            self.save();
        }

        self.core
            .bridge
            .api()
            .send_receipt(&self.core.id, &event.event_id)
            .await?;
        Ok(())
    }

    async fn on_mx_redaction(&mut self, event: RedactionEvent) -> BridgeResult<()> {
        let Some(entry) = self
            .core
            .media
            .iter()
            .find(|entry| entry.event_id == event.redacts)
            .cloned()
        else {
            return Ok(());
        };

        let notice = quarantine_media(&self.core, &self.name, &entry, &event.redacts).await;
        let _ = self.network.tx.send(RoomInput::Notice {
            text: notice,
            formatted: None,
        });
        Ok(())
    }

    async fn cleanup(&mut self) {
        info!(room = %self.core.id, channel = %self.name, "channel room closed");
        if let Some(sender) = self.connected_sender() {
            if self.joined && !self.policy.plumbed {
                sender.part(&self.name, Some("room closed"));
            }
        }
        self.core.bridge.remove_room(&self.core.id);
        self.network.child_closed(&self.name);
        if !self.policy.plumbed {
            let _ = self
                .core
                .bridge
                .api()
                .leave_room(&self.core.id, None)
                .await;
        }
    }
}

#[async_trait]
impl RoomLogic for ChannelRoom {
    fn room_id(&self) -> &str {
        &self.core.id
    }

    async fn handle(&mut self, input: RoomInput) -> bool {
        let result = match input {
            RoomInput::Irc(event) => match event {
                IrcEvent::Registered { .. } => {
                    if let Some(sender) = &self.sender {
                        sender.join(&self.name, self.key.as_deref());
                    }
                    Ok(())
                }
                IrcEvent::Privmsg { source, text, .. } => self.on_privmsg(&source, &text).await,
                IrcEvent::Notice { source, text, .. } => self.on_privnotice(&source, &text).await,
                IrcEvent::Ctcp {
                    source,
                    command,
                    params,
                    ..
                } => self.on_ctcp(&source, &command, params.as_deref()).await,
                IrcEvent::CtcpReply { .. } => Ok(()),
                IrcEvent::Join { source, .. } => self.on_join(&source).await,
                IrcEvent::Part { source, reason, .. } => {
                    self.on_part(&source, reason.as_deref()).await
                }
                IrcEvent::Quit { source, .. } => self.on_quit(&source).await,
                IrcEvent::Kick {
                    source,
                    nick,
                    reason,
                    ..
                } => self.on_kick(&source, &nick, reason.as_deref()).await,
                IrcEvent::NickChange { source, new_nick } => {
                    self.on_nick_change(&source, &new_nick).await
                }
                IrcEvent::Topic { source, topic, .. } => self.set_topic(&source, &topic).await,
                IrcEvent::Mode { source, modes, .. } => {
                    self.notice(
                        &format!("{} set modes {modes}", source.nick),
                        Some(format!(
                            "<b>{}</b> set modes <b>{}</b>",
                            escape_html(&source.nick),
                            escape_html(&modes)
                        )),
                    )
                    .await;
                    Ok(())
                }
                IrcEvent::ServerReply { code, params } => self.on_names(code, &params).await,
                IrcEvent::Disconnected { .. } => Ok(()),
            },
            RoomInput::MxMessage(event) => {
                if self.policy.plumbed {
                    plumbed::on_mx_message(self, event).await
                } else {
                    self.on_mx_message_mirrored(event).await
                }
            }
            RoomInput::MxRedaction(event) => self.on_mx_redaction(event).await,
            RoomInput::Membership {
                user_id,
                membership,
                displayname,
            } => {
                self.core.apply_membership(&user_id, &membership, displayname);

                let bot_gone = self.policy.plumbed
                    && user_id == self.core.bridge.bot_user_id()
                    && matches!(membership.as_str(), "leave" | "ban");
                let owner_gone = !self.policy.plumbed
                    && user_id == self.core.user_id
                    && membership == "leave";

                if bot_gone || owner_gone {
                    self.cleanup().await;
                    return false;
                }
                Ok(())
            }
            RoomInput::LinkUp(sender) => {
                if sender.connected() {
                    sender.join(&self.name, self.key.as_deref());
                }
                self.sender = Some(sender);
                Ok(())
            }
            RoomInput::LinkDown => {
                self.joined = false;
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            self.core.report(&e).await;
        }
        true
    }
}
