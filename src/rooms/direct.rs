//! Direct (one-to-one) rooms.
//!
//! Each direct room pairs the owner with a single IRC nickname. The first
//! private message from a nick creates the room; the owner leaving
//! destroys it.

use super::{
    build_pills, spawn_room, DirectRoomConfig, NetworkRef, RoomConfig, RoomCore, RoomHandle,
    RoomInput, RoomLogic,
};
use crate::bridge::Bridge;
use crate::commands::{command_trigger, ArgSpec, CommandSet, Invocation};
use crate::error::BridgeResult;
use crate::format::{escape_html, parse_irc_formatting};
use crate::irc::{IrcEvent, IrcSender, Source};
use crate::matrix::{msgtype, MessageEvent, RedactionEvent};
use crate::relay::{self, LineKind, RelayPolicy, REACT_MEDIA};
use async_trait::async_trait;
use slirc_proto::irc_to_lower;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DirectRoom {
    core: RoomCore,
    /// The peer's nick, case-folded; `name` for consistency with channels.
    name: String,
    network: NetworkRef,
    sender: Option<Arc<dyn IrcSender>>,
    commands: CommandSet,
}

impl DirectRoom {
    fn commands() -> CommandSet {
        let mut commands = CommandSet::new();
        commands.register("WHOIS", ArgSpec::None, "WHOIS the other user");
        commands
    }

    /// Restore a persisted direct room.
    pub async fn restore(
        bridge: Bridge,
        room_id: &str,
        config: DirectRoomConfig,
        network: NetworkRef,
        sender: Option<Arc<dyn IrcSender>>,
    ) -> BridgeResult<Self> {
        let mut core = RoomCore::new(room_id, bridge);
        core.sync_members().await?;
        core.media = config.media;

        Ok(Self {
            core,
            name: irc_to_lower(&config.name),
            network,
            sender,
            commands: Self::commands(),
        })
    }

    /// Create the Matrix room for a previously unseen nick and spawn the
    /// room task.
    pub async fn create(
        bridge: Bridge,
        network: NetworkRef,
        sender: Option<Arc<dyn IrcSender>>,
        nick: &str,
    ) -> BridgeResult<RoomHandle> {
        let puppet = bridge.ensure_puppet(&network.name, nick).await?;

        let room_id = bridge
            .api()
            .create_room(
                &format!("{nick} ({})", network.name),
                &format!("Private chat with {nick} on {}", network.name),
                &[bridge.owner().to_string(), puppet.clone()],
            )
            .await?;
        bridge.api().join_room(&room_id, Some(&puppet)).await?;

        let mut core = RoomCore::new(&room_id, bridge.clone());
        // The owner's join will arrive through sync; starting optimistic
        // keeps the room valid meanwhile.
        core.members.insert(core.user_id.clone());
        core.members.insert(puppet.clone());
        core.members.insert(bridge.bot_user_id().to_string());
        core.displaynames.insert(puppet, nick.to_string());

        let room = Self {
            core,
            name: irc_to_lower(nick),
            network,
            sender,
            commands: Self::commands(),
        };
        room.save();

        let handle = spawn_room(room);
        bridge.register_room(handle.clone());
        Ok(handle)
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
            && !self.network.name.is_empty()
            && !self.core.id.is_empty()
            && self.core.in_room(&self.core.user_id)
    }

    fn to_config(&self) -> RoomConfig {
        RoomConfig::Direct(DirectRoomConfig {
            name: self.name.clone(),
            network: self.network.name.clone(),
            media: self.core.media_tail(),
        })
    }

    fn save(&self) {
        self.core.bridge.save_room(&self.core.id, self.to_config());
    }

    fn connected_sender(&self) -> Option<&Arc<dyn IrcSender>> {
        self.sender.as_ref().filter(|sender| sender.connected())
    }

    fn is_self(&self, source: &Source) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| irc_to_lower(&source.nick) == irc_to_lower(&sender.real_nickname()))
    }

    fn puppet(&self, source: &Source) -> String {
        self.core
            .bridge
            .puppet_user_id(&self.network.name, &source.nick)
    }

    /// Queue an asynchronous puppet displayname refresh when the nick we
    /// just saw does not match the cached profile.
    fn refresh_displayname(&self, source: &Source) {
        let puppet = self.puppet(source);
        if self.core.bridge.is_user_cached(&puppet, &source.nick) || !self.core.in_room(&puppet) {
            return;
        }
        let bridge = self.core.bridge.clone();
        let network = self.network.name.clone();
        let nick = source.nick.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge.ensure_puppet(&network, &nick).await {
                debug!(nick = %nick, error = %e, "displayname refresh failed");
            }
        });
    }

    async fn on_privmsg(&mut self, source: &Source, text: &str) -> BridgeResult<()> {
        let pills = build_pills(&self.core, &self.network, self.sender.as_ref());
        let (plain, formatted) = parse_irc_formatting(text, pills.as_ref());

        if self.is_self(source) {
            self.core
                .send_message(
                    None,
                    &format!("You said: {plain}"),
                    formatted.map(|html| format!("You said: {html}")),
                    None,
                )
                .await?;
            return Ok(());
        }

        let puppet = self.puppet(source);
        let fallback = format!(
            "<b>Message from {}</b>: {}",
            escape_html(&source.to_string()),
            escape_html(&plain)
        );
        self.core
            .send_message(Some(&puppet), &plain, formatted, Some(fallback))
            .await?;

        // The owner left but the peer is still talking: invite them back.
        if !self.core.in_room(&self.core.user_id) {
            self.core
                .bridge
                .api()
                .invite_user(&self.core.id, &self.core.user_id)
                .await?;
        }

        self.refresh_displayname(source);
        Ok(())
    }

    async fn on_privnotice(&mut self, source: &Source, text: &str) -> BridgeResult<()> {
        let (plain, formatted) = parse_irc_formatting(text, None);

        if self.is_self(source) {
            self.core
                .send_notice(
                    &format!("You noticed: {plain}"),
                    None,
                    formatted.map(|html| format!("You noticed: {html}")),
                    None,
                )
                .await?;
            return Ok(());
        }

        if !self.core.in_room(&self.core.user_id) {
            // The owner is not here; surface in the network room instead.
            let html = format!(
                "Notice from <b>{}</b>: {}",
                escape_html(&source.to_string()),
                formatted.unwrap_or_else(|| escape_html(&plain))
            );
            let _ = self.network.tx.send(RoomInput::Notice {
                text: format!("Notice from {source}: {plain}"),
                formatted: Some(html),
            });
            return Ok(());
        }

        let puppet = self.puppet(source);
        let fallback = format!(
            "<b>Notice from {}</b>: {}",
            escape_html(&source.to_string()),
            escape_html(&plain)
        );
        self.core
            .send_notice(&plain, Some(&puppet), formatted, Some(fallback))
            .await?;
        Ok(())
    }

    async fn on_ctcp(
        &mut self,
        source: &Source,
        command: &str,
        params: Option<&str>,
    ) -> BridgeResult<()> {
        if command == "ACTION" {
            let (plain, _) = parse_irc_formatting(params.unwrap_or_default(), None);

            if self.is_self(source) {
                self.core.send_emote(None, &format!("(you) {plain}"), None).await?;
                return Ok(());
            }

            let puppet = self.puppet(source);
            let fallback = format!(
                "<b>Emote from {}</b>: {}",
                escape_html(&source.to_string()),
                escape_html(&plain)
            );
            self.core.send_emote(Some(&puppet), &plain, Some(fallback)).await?;
            return Ok(());
        }

        let detail = match params {
            Some(params) => format!("{command} {params}"),
            None => command.to_string(),
        };
        self.core
            .send_notice_html(&format!(
                "<b>{}</b> requested <b>CTCP {}</b> (ignored)",
                escape_html(&source.to_string()),
                escape_html(&detail)
            ))
            .await?;
        Ok(())
    }

    async fn on_ctcpreply(
        &mut self,
        source: &Source,
        command: &str,
        params: Option<&str>,
    ) -> BridgeResult<()> {
        let detail = match params {
            Some(params) => format!("{command} {params}"),
            None => command.to_string(),
        };
        self.core
            .send_notice_html(&format!(
                "<b>{}</b> sent <b>CTCP REPLY {}</b> (ignored)",
                escape_html(&source.to_string()),
                escape_html(&detail)
            ))
            .await?;
        Ok(())
    }

    async fn run_command(&mut self, invocation: Invocation) -> BridgeResult<()> {
        match invocation.name {
            "WHOIS" => match self.connected_sender() {
                Some(sender) => sender.whois(&format!("{0} {0}", self.name)),
                None => {
                    self.core
                        .send_notice("Need to be connected to use this command.", None, None, None)
                        .await?;
                }
            },
            "HELP" => {
                let help = self.commands.help_text();
                self.core.send_notice(&help, None, None, None).await?;
            }
            other => debug!(command = other, "unhandled command"),
        }
        Ok(())
    }

    async fn on_mx_message(&mut self, event: MessageEvent) -> BridgeResult<()> {
        if event.sender != self.core.user_id {
            return Ok(());
        }

        let content = &event.content;

        if content.msgtype == msgtype::TEXT && !content.is_edit() {
            if let Some(line) = command_trigger(&content.body, self.core.bridge.bot_localpart()) {
                let line = line.to_string();
                match self.commands.parse(&line) {
                    Ok(invocation) => self.run_command(invocation).await?,
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

        let mut media_changed = false;

        if msgtype::MEDIA.contains(&content.msgtype.as_str()) {
            let Some(url) = &content.url else {
                return Ok(());
            };
            let link = self.core.bridge.api().media_url(url, Some(&content.body));
            sender.privmsg(&self.name, &link);
            self.core.react(&event.event_id, REACT_MEDIA).await?;
            self.core.media.push(super::MediaEntry {
                event_id: event.event_id.clone(),
                url: url.clone(),
            });
            media_changed = true;
        } else if content.msgtype == msgtype::EMOTE
            || content.effective().msgtype == msgtype::EMOTE
        {
            media_changed = relay::relay_mx_message(
                &mut self.core,
                &RelayPolicy::UNLIMITED,
                &event,
                LineKind::Action,
                "",
                &sender,
                &self.name.clone(),
            )
            .await?;
        } else if content.msgtype == msgtype::TEXT || content.effective().msgtype == msgtype::TEXT
        {
            media_changed = relay::relay_mx_message(
                &mut self.core,
                &RelayPolicy::UNLIMITED,
                &event,
                LineKind::Privmsg,
                "",
                &sender,
                &self.name.clone(),
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
        info!(room = %self.core.id, nick = %self.name, "direct room closed");
        self.core.bridge.remove_room(&self.core.id);
        self.network.child_closed(&self.name);
        let _ = self
            .core
            .bridge
            .api()
            .leave_room(&self.core.id, None)
            .await;
    }
}

/// Try to quarantine redacted media; the outcome text goes to the network
/// room either way.
pub(super) async fn quarantine_media(
    core: &RoomCore,
    room_name: &str,
    entry: &super::MediaEntry,
    redacts: &str,
) -> String {
    if !core.bridge.admin() {
        return format!(
            "No permission to quarantine media! Associated media {} for redacted event {redacts} in room {room_name} is left available.",
            entry.url
        );
    }

    let Some((server, media_id)) = entry
        .url
        .strip_prefix("mxc://")
        .and_then(|rest| rest.split_once('/'))
    else {
        return format!(
            "Could not parse media URI {} for redacted event {redacts} in room {room_name}.",
            entry.url
        );
    };

    match core.bridge.api().quarantine_media(server, media_id).await {
        Ok(()) => format!(
            "Associated media {} for redacted event {redacts} in room {room_name} was quarantined.",
            entry.url
        ),
        Err(_) => format!(
            "Failed to quarantine media! Associated media {} for redacted event {redacts} in room {room_name} is left available.",
            entry.url
        ),
    }
}

#[async_trait]
impl RoomLogic for DirectRoom {
    fn room_id(&self) -> &str {
        &self.core.id
    }

    async fn handle(&mut self, input: RoomInput) -> bool {
        let result = match input {
            RoomInput::Irc(event) => match event {
                IrcEvent::Privmsg { source, text, .. } => self.on_privmsg(&source, &text).await,
                IrcEvent::Notice { source, text, .. } => self.on_privnotice(&source, &text).await,
                IrcEvent::Ctcp {
                    source,
                    command,
                    params,
                    ..
                } => self.on_ctcp(&source, &command, params.as_deref()).await,
                IrcEvent::CtcpReply {
                    source,
                    command,
                    params,
                    ..
                } => self.on_ctcpreply(&source, &command, params.as_deref()).await,
                IrcEvent::NickChange { new_nick, .. } => {
                    self.name = irc_to_lower(&new_nick);
                    self.save();
                    Ok(())
                }
                IrcEvent::Quit { source, reason } => {
                    if irc_to_lower(&source.nick) == self.name {
                        let reason = reason.unwrap_or_default();
                        self.core
                            .send_notice_html(&format!(
                                "<b>{}</b> has quit ({})",
                                escape_html(&source.to_string()),
                                escape_html(&reason)
                            ))
                            .await
                            .map(|_| ())
                    } else {
                        Ok(())
                    }
                }
                _ => Ok(()),
            },
            RoomInput::MxMessage(event) => self.on_mx_message(event).await,
            RoomInput::MxRedaction(event) => self.on_mx_redaction(event).await,
            RoomInput::Membership {
                user_id,
                membership,
                displayname,
            } => {
                self.core.apply_membership(&user_id, &membership, displayname);
                if user_id == self.core.user_id && membership == "leave" {
                    self.cleanup().await;
                    return false;
                }
                Ok(())
            }
            RoomInput::LinkUp(sender) => {
                self.sender = Some(sender);
                Ok(())
            }
            RoomInput::LinkDown => Ok(()),
            _ => Ok(()),
        };

        if let Err(e) = result {
            self.core.report(&e).await;
        }
        true
    }
}
