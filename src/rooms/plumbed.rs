//! Plumbed room behavior.
//!
//! A plumbed room is an existing shared Matrix room attached to an IRC
//! channel: every member's messages relay out with a rendered sender
//! prefix, subject to the per-room policies, and local notices forward to
//! the network room. The state machine itself is [`ChannelRoom`]; this
//! module holds what differs.

use super::channel::{ChannelPolicy, ChannelRoom};
use super::{MediaEntry, NetworkRef, RoomCore, RoomHandle, RoomInput};
use crate::bridge::Bridge;
use crate::commands::{command_trigger, ArgSpec, CommandSet, Invocation};
use crate::error::BridgeResult;
use crate::irc::IrcSender;
use crate::matrix::{msgtype, MessageEvent};
use crate::relay::{self, ConnIdentity, LineKind, REACT_MEDIA};
use slirc_proto::irc_to_lower;
use std::sync::Arc;
use tracing::info;

/// Longest sender prefix we will put on the wire.
const SENDER_MAX_CHARS: usize = 100;

pub(super) fn commands() -> CommandSet {
    let mut commands = CommandSet::new();
    commands.register(
        "MAXLINES",
        ArgSpec::Count,
        "maximum lines per message until truncation or pastebin",
    );
    commands.register(
        "PASTEBIN",
        ArgSpec::Toggle,
        "automatic pastebin of long messages",
    );
    commands.register(
        "DISPLAYNAMES",
        ArgSpec::Toggle,
        "use displaynames in relayed messages",
    );
    commands.register(
        "DISAMBIGUATION",
        ArgSpec::Toggle,
        "disambiguate conflicting displaynames",
    );
    commands.register("ZWSP", ArgSpec::Toggle, "Zero-Width-Space anti-ping");
    commands.register(
        "NOTICERELAY",
        ArgSpec::Toggle,
        "relay Matrix notices to IRC",
    );
    commands
}

/// Attach the bridge to an existing shared room.
///
/// Joins by id or alias, probes the join rules (a non-public room means
/// later puppet joins need invites), snapshots the membership and freezes
/// the global member-sync policy into the room.
pub async fn plumb(
    bridge: Bridge,
    network: NetworkRef,
    sender: Option<Arc<dyn IrcSender>>,
    room: &str,
    channel: &str,
    key: Option<String>,
) -> BridgeResult<RoomHandle> {
    let api = bridge.api();

    let room_id = match api.join_room(room, None).await {
        Ok(room_id) => room_id,
        Err(e) => {
            let _ = network.tx.send(RoomInput::Notice {
                text: format!("Failed to join room: {e}"),
                formatted: None,
            });
            return Err(e.into());
        }
    };

    let need_invite = match api.get_state_event(&room_id, "m.room.join_rules", "").await {
        Ok(rules) => rules.get("join_rule").and_then(|rule| rule.as_str()) != Some("public"),
        Err(_) => true,
    };

    let joined = api.get_joined_members(&room_id).await?;

    let mut core = RoomCore::new(&room_id, bridge.clone());
    core.members = joined.keys().cloned().collect();
    core.members.insert(bridge.bot_user_id().to_string());
    core.displaynames = joined
        .into_iter()
        .filter_map(|(user_id, info)| info.display_name.map(|name| (user_id, name)))
        .collect();

    let mut policy = ChannelPolicy::plumbed(bridge.member_sync());
    policy.need_invite = need_invite;

    let room_struct = ChannelRoom::assemble(
        core,
        channel,
        key.clone(),
        network.clone(),
        sender.clone(),
        policy,
    );
    room_struct.save();

    if let Some(sender) = sender.as_ref().filter(|sender| sender.connected()) {
        sender.join(&irc_to_lower(channel), key.as_deref());
    }

    let handle = super::spawn_room(room_struct);
    bridge.register_room(handle.clone());
    let _ = network.tx.send(RoomInput::ChildOpened {
        key: irc_to_lower(channel),
        handle: handle.clone(),
    });
    let _ = network.tx.send(RoomInput::Notice {
        text: format!("Plumbed {room_id} to {channel}, to unplumb just kick me out."),
        formatted: None,
    });

    info!(room = %room_id, channel, "room plumbed");
    Ok(handle)
}

fn split_chars(s: &str, n: usize) -> (String, String) {
    let mut chars = s.chars();
    let head: String = chars.by_ref().take(n).collect();
    (head, chars.collect())
}

/// Render the outbound sender prefix for a plumbed room.
///
/// The base is the Matrix user id; ZWSP insertion keeps it visually intact
/// while defeating nickname pings, displaynames (optionally disambiguated
/// with the raw user id) take precedence, and the result is capped at 100
/// characters.
pub(super) fn render_sender(room: &ChannelRoom, sender_id: &str) -> String {
    let (name, server) = sender_id.split_once(':').unwrap_or((sender_id, ""));

    let mut sender = if room.policy.use_zwsp {
        let (name_head, name_tail) = split_chars(name, 2);
        let (server_head, server_tail) = split_chars(server, 1);
        format!("{name_head}\u{200B}{name_tail}:{server_head}\u{200B}{server_tail}")
    } else {
        sender_id.to_string()
    };

    if room.policy.use_displaynames {
        if let Some(displayname) = room.core.displaynames.get(sender_id) {
            let mut display = displayname.clone();

            if room.policy.use_disambiguation {
                let clash = room
                    .core
                    .displaynames
                    .iter()
                    .any(|(user_id, name)| user_id != sender_id && name == displayname);
                if clash {
                    display.push_str(&format!(" ({sender_id})"));
                }
            }

            if room.policy.use_zwsp && display.chars().count() > 1 {
                let (head, tail) = split_chars(&display, 1);
                display = format!("{head}\u{200B}{tail}");
            }

            sender = display;
        }
    }

    sender.chars().take(SENDER_MAX_CHARS).collect()
}

async fn run_command(room: &mut ChannelRoom, invocation: Invocation) -> BridgeResult<()> {
    fn state(on: bool) -> &'static str {
        if on { "enabled" } else { "disabled" }
    }

    // Mutations persist before the confirmation goes out.
    match invocation.name {
        "MAXLINES" => {
            if let Some(count) = invocation.count {
                room.policy.max_lines = count;
                room.save();
            }
            room.notice(&format!("Max lines is {}", room.policy.max_lines), None)
                .await;
        }
        "PASTEBIN" => {
            if let Some(on) = invocation.toggle {
                room.policy.use_pastebin = on;
                room.save();
            }
            room.notice(&format!("Pastebin is {}", state(room.policy.use_pastebin)), None)
                .await;
        }
        "DISPLAYNAMES" => {
            if let Some(on) = invocation.toggle {
                room.policy.use_displaynames = on;
                room.save();
            }
            room.notice(
                &format!("Displaynames are {}", state(room.policy.use_displaynames)),
                None,
            )
            .await;
        }
        "DISAMBIGUATION" => {
            if let Some(on) = invocation.toggle {
                room.policy.use_disambiguation = on;
                room.save();
            }
            room.notice(
                &format!(
                    "Disambiguation is {}",
                    state(room.policy.use_disambiguation)
                ),
                None,
            )
            .await;
        }
        "ZWSP" => {
            if let Some(on) = invocation.toggle {
                room.policy.use_zwsp = on;
                room.save();
            }
            room.notice(
                &format!(
                    "Zero-Width-Space anti-ping is {}",
                    state(room.policy.use_zwsp)
                ),
                None,
            )
            .await;
        }
        "NOTICERELAY" => {
            if let Some(on) = invocation.toggle {
                room.policy.allow_notice = on;
                room.save();
            }
            room.notice(
                &format!("Notice relay is {}", state(room.policy.allow_notice)),
                None,
            )
            .await;
        }
        "HELP" => {
            let help = room.commands.help_text();
            room.notice(&help, None).await;
        }
        _ => {}
    }
    Ok(())
}

/// Relay any member's message out to the channel.
pub(super) async fn on_mx_message(room: &mut ChannelRoom, event: MessageEvent) -> BridgeResult<()> {
    let content = event.content.clone();

    // Policy toggles are operator-owned; a shared room must not let any
    // member flip them.
    if event.sender == room.core.user_id
        && content.msgtype == msgtype::TEXT
        && !content.is_edit()
    {
        if let Some(line) = command_trigger(&content.body, room.core.bridge.bot_localpart()) {
            let line = line.to_string();
            match room.commands.parse(&line) {
                Ok(invocation) => run_command(room, invocation).await?,
                Err(e) => room.notice(&e.to_string(), None).await,
            }
            return Ok(());
        }
    }

    let Some(sender) = room.connected_sender().cloned() else {
        return Ok(());
    };

    // Never echo ourselves, and never re-send what a puppet already
    // carried over from IRC; that would loop the message.
    if event.sender == room.core.bridge.bot_user_id() {
        return Ok(());
    }
    if room.core.bridge.is_puppet(&event.sender) {
        return Ok(());
    }

    let rendered = render_sender(room, &event.sender);
    let target = room.name.clone();
    let mut media_changed = false;

    if msgtype::MEDIA.contains(&content.msgtype.as_str()) {
        if let Some(url) = &content.url {
            let link = room.core.bridge.api().media_url(url, Some(&content.body));
            // Media goes out as a single line through the normal renderer.
            let lines = relay::render_content(
                &crate::matrix::MessageContent::text(link),
                &event.sender,
                false,
                None,
                &room.core.displaynames,
                &format!("<{rendered}> "),
                &ConnIdentity::of(&sender),
                &target,
            );
            if let Some(first) = lines.first() {
                sender.privmsg(&target, first);
            }

            room.core.react(&event.event_id, REACT_MEDIA).await?;
            room.core.media.push(MediaEntry {
                event_id: event.event_id.clone(),
                url: url.clone(),
            });
            media_changed = true;
        }
    } else if content.effective().msgtype == msgtype::EMOTE {
        media_changed = relay::relay_mx_message(
            &mut room.core,
            &room.policy.relay(),
            &event,
            LineKind::Action,
            &format!("{rendered} "),
            &sender,
            &target,
        )
        .await?;
    } else if content.effective().msgtype == msgtype::TEXT {
        media_changed = relay::relay_mx_message(
            &mut room.core,
            &room.policy.relay(),
            &event,
            LineKind::Privmsg,
            &format!("<{rendered}> "),
            &sender,
            &target,
        )
        .await?;
    } else if content.effective().msgtype == msgtype::NOTICE && room.policy.allow_notice {
        media_changed = relay::relay_mx_message(
            &mut room.core,
            &room.policy.relay(),
            &event,
            LineKind::Notice,
            &format!("<{rendered}> "),
            &sender,
            &target,
        )
        .await?;
    }

    if media_changed {
        room.save();
    }

    room.core
        .bridge
        .api()
        .send_receipt(&room.core.id, &event.event_id)
        .await?;
    Ok(())
}
