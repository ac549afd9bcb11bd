//! Socket task for one IRC network connection.
//!
//! The link owns the TCP stream in a dedicated task: outbound [`Message`]s
//! arrive over an mpsc channel, inbound lines are parsed by
//! `slirc_proto::Transport` and fanned out to the owning network room as
//! [`IrcEvent`]s. PING is answered here; everything else is routing.

use super::{IrcEvent, IrcSender, Source};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use slirc_proto::{Command, CtcpOwned, IrcCodec, Message, Prefix, Response, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

/// Connection parameters for one network.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// `host:port` to dial.
    pub address: String,
    pub nick: String,
    pub username: String,
    pub realname: String,
}

struct LinkShared {
    nickname: RwLock<String>,
    username: String,
    real_host: RwLock<String>,
    connected: AtomicBool,
    tx: mpsc::UnboundedSender<Message>,
}

/// Cheap cloneable handle implementing [`IrcSender`] over the socket task.
#[derive(Clone)]
pub struct LinkSender {
    shared: Arc<LinkShared>,
}

impl LinkSender {
    fn send(&self, message: Message) {
        // A closed channel means the socket task is gone; the network room
        // learns that through the Disconnected event.
        let _ = self.shared.tx.send(message);
    }
}

impl IrcSender for LinkSender {
    fn privmsg(&self, target: &str, text: &str) {
        self.send(Message::privmsg(target, text));
    }

    fn notice(&self, target: &str, text: &str) {
        self.send(Message::notice(target, text));
    }

    fn action(&self, target: &str, text: &str) {
        self.send(Message::privmsg(target, CtcpOwned::action(text).to_string()));
    }

    fn whois(&self, query: &str) {
        self.send(Message {
            tags: None,
            prefix: None,
            command: Command::Raw("WHOIS".to_string(), vec![query.to_string()]),
        });
    }

    fn join(&self, channel: &str, key: Option<&str>) {
        match key {
            Some(key) => self.send(Message::join_with_key(channel, key)),
            None => self.send(Message::join(channel)),
        }
    }

    fn part(&self, channel: &str, reason: Option<&str>) {
        match reason {
            Some(reason) => self.send(Message::part_with_message(channel, reason)),
            None => self.send(Message::part(channel)),
        }
    }

    fn real_nickname(&self) -> String {
        self.shared.nickname.read().clone()
    }

    fn username(&self) -> String {
        self.shared.username.clone()
    }

    fn real_host(&self) -> String {
        self.shared.real_host.read().clone()
    }

    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }
}

/// One live connection attempt to an IRC network.
pub struct IrcLink;

impl IrcLink {
    /// Dial the network and spawn the socket task.
    ///
    /// Returns immediately after the TCP connect with a sender handle; the
    /// task reports registration and disconnection through `events`.
    pub async fn connect(
        config: LinkConfig,
        events: mpsc::UnboundedSender<IrcEvent>,
    ) -> anyhow::Result<Arc<dyn IrcSender>> {
        let stream = TcpStream::connect(&config.address).await?;
        let mut transport = Transport::tcp(stream)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let shared = Arc::new(LinkShared {
            nickname: RwLock::new(config.nick.clone()),
            username: config.username.clone(),
            real_host: RwLock::new("unknown.host".to_string()),
            connected: AtomicBool::new(false),
            tx,
        });

        transport.write_message(&Message::nick(&config.nick)).await?;
        transport
            .write_message(&Message::user(&config.username, &config.realname))
            .await?;

        // Registration done, split into halves so reads and writes can
        // interleave in one select loop. Nothing has been read yet, so the
        // read buffer carried by the parts is empty.
        let parts = transport
            .into_parts()
            .map_err(|_| anyhow::anyhow!("transport cannot be split"))?;
        let (read_half, write_half) = parts.split();
        let mut reader = FramedRead::new(read_half.half, IrcCodec::new("utf-8")?);
        let mut writer = FramedWrite::new(write_half.half, write_half.codec);

        info!(address = %config.address, nick = %config.nick, "IRC link established");

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    outgoing = rx.recv() => match outgoing {
                        Some(message) => {
                            if let Err(e) = writer.send(message).await {
                                break format!("write failed: {e}");
                            }
                        }
                        None => break "link closed".to_string(),
                    },
                    incoming = reader.next() => match incoming {
                        Some(Ok(message)) => {
                            if let Some(reply) = handle_message(&task_shared, &message) {
                                if let Err(e) = writer.send(reply).await {
                                    break format!("write failed: {e}");
                                }
                                continue;
                            }
                            if let Some(event) = event_from(&message) {
                                if events.send(event).is_err() {
                                    break "network room gone".to_string();
                                }
                            }
                        }
                        Some(Err(e)) => break format!("read failed: {e}"),
                        None => break "connection closed by server".to_string(),
                    },
                }
            };

            task_shared.connected.store(false, Ordering::Relaxed);
            warn!(reason = %reason, "IRC link down");
            let _ = events.send(IrcEvent::Disconnected { reason });
        });

        Ok(shared_sender(shared))
    }
}

fn shared_sender(shared: Arc<LinkShared>) -> Arc<dyn IrcSender> {
    Arc::new(LinkSender { shared })
}

/// Protocol housekeeping the rooms never see. Returns a reply to write.
fn handle_message(shared: &LinkShared, message: &Message) -> Option<Message> {
    match &message.command {
        Command::PING(server, _) => Some(Message::pong(server)),
        Command::Response(Response::RPL_WELCOME, params) => {
            if let Some(nick) = params.first() {
                *shared.nickname.write() = nick.clone();
            }
            // "Welcome to ... nick!user@host" carries our visible mask.
            if let Some(mask) = params
                .last()
                .and_then(|trailing| trailing.rsplit(' ').next())
                .filter(|mask| mask.contains('@'))
            {
                if let Some((_, host)) = mask.rsplit_once('@') {
                    *shared.real_host.write() = host.to_string();
                }
            }
            shared.connected.store(true, Ordering::Relaxed);
            None
        }
        Command::Response(Response::RPL_HOSTHIDDEN, params) => {
            if params.len() >= 2 {
                *shared.real_host.write() = params[1].clone();
            }
            None
        }
        Command::NICK(new_nick) => {
            // Track our own nick changes; others' pass through as events.
            if message
                .source_nickname()
                .is_some_and(|nick| nick == *shared.nickname.read())
            {
                *shared.nickname.write() = new_nick.clone();
            }
            None
        }
        _ => None,
    }
}

fn source_of(message: &Message) -> Source {
    match &message.prefix {
        Some(Prefix::Nickname(nick, user, host)) => Source::new(nick, user, host),
        Some(Prefix::ServerName(name)) => Source {
            nick: name.clone(),
            ..Source::default()
        },
        None => Source::default(),
    }
}

/// Map a wire message onto the event the rooms consume.
fn event_from(message: &Message) -> Option<IrcEvent> {
    let source = source_of(message);

    let event = match &message.command {
        Command::PRIVMSG(target, text) => match CtcpOwned::parse(text) {
            Some(ctcp) => IrcEvent::Ctcp {
                source,
                target: target.clone(),
                command: ctcp.kind.as_str().to_string(),
                params: ctcp.params,
            },
            None => IrcEvent::Privmsg {
                source,
                target: target.clone(),
                text: text.clone(),
            },
        },
        Command::NOTICE(target, text) => match CtcpOwned::parse(text) {
            Some(ctcp) => IrcEvent::CtcpReply {
                source,
                target: target.clone(),
                command: ctcp.kind.as_str().to_string(),
                params: ctcp.params,
            },
            None => IrcEvent::Notice {
                source,
                target: target.clone(),
                text: text.clone(),
            },
        },
        Command::JOIN(channel, _, _) => IrcEvent::Join {
            source,
            channel: channel.clone(),
        },
        Command::PART(channel, reason) => IrcEvent::Part {
            source,
            channel: channel.clone(),
            reason: reason.clone(),
        },
        Command::QUIT(reason) => IrcEvent::Quit {
            source,
            reason: reason.clone(),
        },
        Command::KICK(channel, nick, reason) => IrcEvent::Kick {
            source,
            channel: channel.clone(),
            nick: nick.clone(),
            reason: reason.clone(),
        },
        Command::NICK(new_nick) => IrcEvent::NickChange {
            source,
            new_nick: new_nick.clone(),
        },
        Command::TOPIC(channel, topic) => IrcEvent::Topic {
            source,
            channel: channel.clone(),
            topic: topic.clone().unwrap_or_default(),
        },
        Command::ChannelMODE(target, modes) => IrcEvent::Mode {
            source,
            target: target.clone(),
            modes: modes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" "),
        },
        Command::Response(response, params) => {
            debug!(code = response.code(), "server reply");
            IrcEvent::ServerReply {
                code: response.code(),
                params: params.clone(),
            }
        }
        Command::ERROR(reason) => {
            // The server closes right after ERROR; the read loop reports
            // the disconnect, this would double it up.
            debug!(reason = %reason, "server error");
            return None;
        }
        _ => return None,
    };

    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn privmsg(prefix: &str, target: &str, text: &str) -> Message {
        Message::privmsg(target, text).with_prefix(Prefix::new_from_str(prefix))
    }

    #[test]
    fn privmsg_maps_to_event() {
        let msg = privmsg("alice!a@host", "#chan", "hello");
        match event_from(&msg) {
            Some(IrcEvent::Privmsg { source, target, text }) => {
                assert_eq!(source.nick, "alice");
                assert_eq!(target, "#chan");
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn ctcp_action_is_split_out() {
        let msg = privmsg("alice!a@host", "bob", "\x01ACTION waves\x01");
        match event_from(&msg) {
            Some(IrcEvent::Ctcp { command, params, .. }) => {
                assert_eq!(command, "ACTION");
                assert_eq!(params.as_deref(), Some("waves"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
