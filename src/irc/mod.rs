//! IRC network collaborator.
//!
//! Rooms talk to the network through the [`IrcSender`] handle and receive
//! [`IrcEvent`]s routed by their network room. The production
//! implementation in [`link`] owns the socket in its own task; tests
//! substitute a collecting fake.

pub mod link;

pub use link::{IrcLink, LinkConfig};

use std::fmt;

/// Who an IRC event came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Source {
    pub nick: String,
    pub user: String,
    pub host: String,
}

impl Source {
    pub fn new(nick: &str, user: &str, host: &str) -> Self {
        Self {
            nick: nick.to_string(),
            user: user.to_string(),
            host: host.to_string(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() && self.host.is_empty() {
            write!(f, "{}", self.nick)
        } else {
            write!(f, "{}!{}@{}", self.nick, self.user, self.host)
        }
    }
}

/// Network events the rooms care about, already line-parsed.
#[derive(Debug, Clone)]
pub enum IrcEvent {
    /// Registration completed (RPL_WELCOME).
    Registered { nickname: String },
    /// The connection dropped.
    Disconnected { reason: String },
    Privmsg {
        source: Source,
        target: String,
        text: String,
    },
    Notice {
        source: Source,
        target: String,
        text: String,
    },
    /// CTCP request embedded in a PRIVMSG (including ACTION).
    Ctcp {
        source: Source,
        target: String,
        command: String,
        params: Option<String>,
    },
    /// CTCP reply embedded in a NOTICE.
    CtcpReply {
        source: Source,
        target: String,
        command: String,
        params: Option<String>,
    },
    Join {
        source: Source,
        channel: String,
    },
    Part {
        source: Source,
        channel: String,
        reason: Option<String>,
    },
    Quit {
        source: Source,
        reason: Option<String>,
    },
    Kick {
        source: Source,
        channel: String,
        nick: String,
        reason: Option<String>,
    },
    NickChange {
        source: Source,
        new_nick: String,
    },
    Topic {
        source: Source,
        channel: String,
        topic: String,
    },
    Mode {
        source: Source,
        target: String,
        modes: String,
    },
    /// Numeric server reply (WHOIS output and friends), surfaced in the
    /// network room.
    ServerReply { code: u16, params: Vec<String> },
}

/// Outbound side of a network connection.
///
/// Sends are fire-and-forget into the socket task; delivery ordering per
/// connection follows call order. Callers check [`IrcSender::connected`]
/// before relaying and report `"Not connected to network."` themselves.
pub trait IrcSender: Send + Sync {
    fn privmsg(&self, target: &str, text: &str);
    fn notice(&self, target: &str, text: &str);
    /// CTCP ACTION ("/me").
    fn action(&self, target: &str, text: &str);
    fn whois(&self, query: &str);
    fn join(&self, channel: &str, key: Option<&str>);
    fn part(&self, channel: &str, reason: Option<&str>);

    /// Nickname the server currently knows us by.
    fn real_nickname(&self) -> String;
    fn username(&self) -> String;
    /// Our visible host, as learned during login.
    fn real_host(&self) -> String;
    fn connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_displays_as_hostmask() {
        let source = Source::new("alice", "ali", "host.example");
        assert_eq!(source.to_string(), "alice!ali@host.example");
    }

    #[test]
    fn server_source_displays_bare() {
        let source = Source {
            nick: "irc.example.net".to_string(),
            ..Source::default()
        };
        assert_eq!(source.to_string(), "irc.example.net");
    }
}
