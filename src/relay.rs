//! The relay engine.
//!
//! Given a Matrix message event and a target on the IRC side, decides and
//! dispatches the side effects: rendered PRIVMSG/NOTICE/ACTION lines, edit
//! diffs, truncation with scissors reactions, pastebin offloading. The
//! IRC-to-Matrix direction lives with the room kinds; this module owns the
//! harder Matrix-to-IRC path.

use crate::error::{BridgeError, BridgeResult};
use crate::format::{line_diff, render_html, split_long};
use crate::irc::IrcSender;
use crate::matrix::{MessageContent, MessageEvent};
use crate::rooms::{MediaEntry, RoomCore, TrackedMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Scissors, marking truncation.
pub const REACT_TRUNCATED: &str = "\u{2702}";
/// Memo, marking a pastebin upload.
pub const REACT_PASTEBIN: &str = "\u{1F4DD}";
/// Link, marking relayed media.
pub const REACT_MEDIA: &str = "\u{1F517}";

/// Which IRC verb carries the rendered lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Privmsg,
    Notice,
    Action,
}

/// Per-room line budget policy.
#[derive(Debug, Clone, Copy)]
pub struct RelayPolicy {
    /// Maximum lines per message; 0 is unlimited.
    pub max_lines: usize,
    /// Offload over-budget messages to an uploaded text blob.
    pub use_pastebin: bool,
}

impl RelayPolicy {
    pub const UNLIMITED: RelayPolicy = RelayPolicy {
        max_lines: 0,
        use_pastebin: false,
    };
}

/// Connection identity needed to compute the wire framing budget.
#[derive(Debug, Clone)]
pub struct ConnIdentity {
    pub nick: String,
    pub user: String,
    pub host: String,
}

impl ConnIdentity {
    pub fn of(sender: &Arc<dyn IrcSender>) -> Self {
        Self {
            nick: sender.real_nickname(),
            user: sender.username(),
            host: sender.real_host(),
        }
    }
}

/// Unicode control-ish characters that never belong on the wire. This
/// covers Cc and the format (Cf) code points seen in chat traffic; ZWSP is
/// exempt because the anti-ping feature depends on it.
fn is_stripped_control(c: char) -> bool {
    if c == '\u{200B}' {
        return false;
    }
    c.is_control()
        || matches!(c,
            '\u{00AD}'
            | '\u{0600}'..='\u{0605}'
            | '\u{061C}'
            | '\u{06DD}'
            | '\u{070F}'
            | '\u{08E2}'
            | '\u{180E}'
            | '\u{200C}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{206F}'
            | '\u{FEFF}'
            | '\u{FFF9}'..='\u{FFFB}'
            | '\u{E000}'..='\u{F8FF}'
        )
}

/// Render event content into wire-ready IRC lines.
///
/// `content` is the effective content (the replacement for edits). The
/// reply-quote fallback is only stripped when the event actually carried a
/// reply relation; `reply_to` adds the `nick: ` prefix when someone else's
/// message is being answered.
#[allow(clippy::too_many_arguments)]
pub fn render_content(
    content: &MessageContent,
    event_sender: &str,
    had_reply_relation: bool,
    reply_to: Option<&MessageEvent>,
    displaynames: &HashMap<String, String>,
    prefix: &str,
    identity: &ConnIdentity,
    target: &str,
) -> Vec<String> {
    let mut lines: Vec<String> = if let Some(html) = &content.formatted_body {
        render_html(html, displaynames)
            .split('\n')
            .map(String::from)
            .collect()
    } else {
        let mut body = content.body.clone();
        for (user_id, displayname) in displaynames {
            body = body.replace(user_id, displayname);
            // Some clients prefix mention fallbacks with '@'.
            body = body.replace(&format!("@{displayname}"), displayname);
        }

        let mut lines: Vec<String> = body.split('\n').map(String::from).collect();

        if had_reply_relation {
            // Skip the quoted fallback; this consumes the (expectedly
            // blank) line right after it as well.
            while !lines.is_empty() {
                if !lines.remove(0).starts_with('>') {
                    break;
                }
            }
        }

        lines
    };

    lines.retain(|line| !line.trim().is_empty());

    if let Some(reply_to) = reply_to {
        if reply_to.sender != event_sender && !lines.is_empty() {
            let nick = displaynames
                .get(&reply_to.sender)
                .cloned()
                .unwrap_or_else(|| reply_to.sender.clone());
            lines[0] = format!("{nick}: {}", lines[0]);
        }
    }

    let mut messages = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let line = if i == 0 && !prefix.is_empty() {
            format!("{prefix}{line}")
        } else {
            line.clone()
        };

        let line: String = line.chars().filter(|c| !is_stripped_control(*c)).collect();

        messages.extend(split_long(
            &identity.nick,
            &identity.user,
            &identity.host,
            target,
            &line,
        ));
    }

    messages
}

/// Resolve the event this one replies to, chasing `m.replace` edit chains
/// back to the original first.
pub async fn resolve_reply(
    core: &RoomCore,
    event: &MessageEvent,
) -> BridgeResult<Option<MessageEvent>> {
    if event.content.relates_to.is_none() {
        return Ok(None);
    }

    let api = core.bridge.api();
    let mut current = event.clone();

    while let Some(replaced) = current.content.replaces() {
        current = api.get_room_event(&core.id, replaced).await?;
    }

    match current.content.in_reply_to() {
        Some(parent) => Ok(Some(api.get_room_event(&core.id, parent).await?)),
        None => Ok(None),
    }
}

/// Relay one Matrix message out to IRC.
///
/// Handles edit-vs-fresh tracking, line budgeting, pastebin offloading and
/// the observability reactions. Returns `true` when the media log changed
/// and the caller should persist.
#[allow(clippy::too_many_arguments)]
pub async fn relay_mx_message(
    core: &mut RoomCore,
    policy: &RelayPolicy,
    event: &MessageEvent,
    kind: LineKind,
    prefix: &str,
    sender: &Arc<dyn IrcSender>,
    target: &str,
) -> BridgeResult<bool> {
    let reply_to = resolve_reply(core, event).await?;
    let identity = ConnIdentity::of(sender);
    let had_reply_relation = event.content.in_reply_to().is_some();

    let mut messages;

    if let Some(new_content) = &event.content.new_content {
        let replaced = event
            .content
            .replaces()
            .ok_or_else(|| BridgeError::Invariant("edit without m.replace target".into()))?
            .to_string();

        messages = render_content(
            new_content,
            &event.sender,
            had_reply_relation,
            reply_to.as_ref(),
            &core.displaynames,
            prefix,
            &identity,
            target,
        );

        let matches_last = core
            .last_messages
            .get(&event.sender)
            .is_some_and(|last| last.event_id == replaced);

        if matches_last {
            let previous = &core.last_messages[&event.sender];
            let old_messages = render_content(
                previous.content.effective(),
                &event.sender,
                previous.content.in_reply_to().is_some(),
                reply_to.as_ref(),
                &core.displaynames,
                prefix,
                &identity,
                target,
            );

            let mut edits = Vec::new();
            for i in 0..messages.len().max(old_messages.len()) {
                let old = old_messages.get(i).map(String::as_str).unwrap_or("");
                let new = messages.get(i).map(String::as_str).unwrap_or("");
                if let Some(edit) = line_diff(old, new) {
                    edits.push(format!("{prefix}{edit}"));
                }
            }

            // A compact edit only works when exactly one line changed.
            if edits.len() == 1 {
                messages = edits;
            }

            // Track the newest content so re-edits keep diffing.
            core.last_messages.insert(
                event.sender.clone(),
                TrackedMessage {
                    event_id: replaced,
                    content: event.content.clone(),
                },
            );
        } else {
            // The edit target is not what we last relayed; resend in full
            // and reconstruct the tracking entry from the edit itself.
            core.last_messages.insert(
                event.sender.clone(),
                TrackedMessage {
                    event_id: replaced,
                    content: (**new_content).clone(),
                },
            );
        }
    } else {
        core.last_messages.insert(
            event.sender.clone(),
            TrackedMessage {
                event_id: event.event_id.clone(),
                content: event.content.clone(),
            },
        );

        messages = render_content(
            &event.content,
            &event.sender,
            had_reply_relation,
            reply_to.as_ref(),
            &core.displaynames,
            prefix,
            &identity,
            target,
        );
    }

    for (i, message) in messages.iter().enumerate() {
        let over_budget =
            policy.max_lines > 0 && i == policy.max_lines - 1 && messages.len() > policy.max_lines;

        if over_budget {
            core.react(&event.event_id, REACT_TRUNCATED).await?;

            if policy.use_pastebin {
                let blob = messages.join("\n").into_bytes();
                let mxc = core
                    .bridge
                    .api()
                    .upload_media(blob, "text/plain; charset=UTF-8", None)
                    .await?;
                let url = core.bridge.api().media_url(&mxc, None);

                let line = if policy.max_lines == 1 {
                    format!("{prefix}{url} (long message, {} lines)", messages.len())
                } else {
                    format!(
                        "... long message truncated: {url} ({} lines)",
                        messages.len()
                    )
                };
                dispatch(sender, kind, target, &line);

                core.react(&event.event_id, REACT_PASTEBIN).await?;
                core.media.push(MediaEntry {
                    event_id: event.event_id.clone(),
                    url: mxc,
                });
                return Ok(true);
            }

            if policy.max_lines == 1 {
                // Best effort: send the first line and give up.
                dispatch(sender, kind, target, message);
            } else {
                dispatch(sender, kind, target, "... long message truncated");
            }
            return Ok(false);
        }

        dispatch(sender, kind, target, message);
    }

    // Surface multi-line sends on the Matrix side for observability.
    if policy.max_lines == 0 && messages.len() > 1 {
        core.react(
            &event.event_id,
            &format!("{REACT_TRUNCATED} {} lines", messages.len()),
        )
        .await?;
    }

    debug!(irc_target = %target, lines = messages.len(), "relayed message to IRC");
    Ok(false)
}

fn dispatch(sender: &Arc<dyn IrcSender>, kind: LineKind, target: &str, line: &str) {
    match kind {
        LineKind::Privmsg => sender.privmsg(target, line),
        LineKind::Notice => sender.notice(target, line),
        LineKind::Action => sender.action(target, line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ConnIdentity {
        ConnIdentity {
            nick: "op".into(),
            user: "op".into(),
            host: "host.example".into(),
        }
    }

    fn render_simple(content: &MessageContent) -> Vec<String> {
        render_content(
            content,
            "@op:example.com",
            content.in_reply_to().is_some(),
            None,
            &HashMap::new(),
            "",
            &identity(),
            "#chan",
        )
    }

    #[test]
    fn plain_body_renders_one_line() {
        let content = MessageContent::text("hello world");
        assert_eq!(render_simple(&content), vec!["hello world"]);
    }

    #[test]
    fn whitespace_only_lines_are_dropped() {
        let content = MessageContent::text("one\n   \n\ntwo");
        assert_eq!(render_simple(&content), vec!["one", "two"]);
    }

    #[test]
    fn empty_body_renders_nothing() {
        let content = MessageContent::text("");
        assert!(render_simple(&content).is_empty());
    }

    #[test]
    fn reply_fallback_is_stripped() {
        let mut content = MessageContent::text("> alice: old stuff\n> more quote\n\nactual reply");
        content.relates_to = Some(crate::matrix::RelatesTo {
            in_reply_to: Some(crate::matrix::InReplyTo {
                event_id: "$parent".into(),
            }),
            ..Default::default()
        });
        assert_eq!(render_simple(&content), vec!["actual reply"]);
    }

    #[test]
    fn quote_only_body_renders_nothing() {
        let mut content = MessageContent::text("> just quotes\n> nothing else");
        content.relates_to = Some(crate::matrix::RelatesTo {
            in_reply_to: Some(crate::matrix::InReplyTo {
                event_id: "$parent".into(),
            }),
            ..Default::default()
        });
        assert!(render_simple(&content).is_empty());
    }

    #[test]
    fn reply_prefixes_first_line_with_sender() {
        let content = MessageContent::text("sure thing");
        let mut displaynames = HashMap::new();
        displaynames.insert("@alice:x".to_string(), "alice".to_string());

        let reply_to = MessageEvent {
            event_id: "$parent".into(),
            sender: "@alice:x".into(),
            content: MessageContent::text("can you?"),
        };

        let out = render_content(
            &content,
            "@op:example.com",
            false,
            Some(&reply_to),
            &displaynames,
            "",
            &identity(),
            "#chan",
        );
        assert_eq!(out, vec!["alice: sure thing"]);
    }

    #[test]
    fn own_reply_gets_no_prefix() {
        let content = MessageContent::text("follow-up");
        let reply_to = MessageEvent {
            event_id: "$parent".into(),
            sender: "@op:example.com".into(),
            content: MessageContent::text("first"),
        };
        let out = render_content(
            &content,
            "@op:example.com",
            false,
            Some(&reply_to),
            &HashMap::new(),
            "",
            &identity(),
            "#chan",
        );
        assert_eq!(out, vec!["follow-up"]);
    }

    #[test]
    fn prefix_applies_to_first_line_only() {
        let content = MessageContent::text("one\ntwo");
        let out = render_content(
            &content,
            "@op:example.com",
            false,
            None,
            &HashMap::new(),
            "<Bob> ",
            &identity(),
            "#chan",
        );
        assert_eq!(out, vec!["<Bob> one", "two"]);
    }

    #[test]
    fn user_ids_become_displaynames_in_plain_body() {
        let content = MessageContent::text("thanks @alice, and @op:example.com too");
        let mut displaynames = HashMap::new();
        displaynames.insert("@op:example.com".to_string(), "op".to_string());
        displaynames.insert("@a:x".to_string(), "alice".to_string());

        let out = render_content(
            &content,
            "@op:example.com",
            false,
            None,
            &displaynames,
            "",
            &identity(),
            "#chan",
        );
        assert_eq!(out, vec!["thanks alice, and op too"]);
    }

    #[test]
    fn control_characters_are_stripped_except_zwsp() {
        let content = MessageContent::text("a\u{0007}b\u{200B}c\u{202E}d");
        assert_eq!(render_simple(&content), vec!["ab\u{200B}cd"]);
    }

    #[test]
    fn formatted_body_takes_precedence() {
        let content =
            MessageContent::text("fallback").with_html("<b>rich</b><br>second");
        assert_eq!(render_simple(&content), vec!["\u{2}rich\u{2}", "second"]);
    }
}
