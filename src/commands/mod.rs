//! Per-room runtime commands.
//!
//! Rooms register a small command set at init; the owner triggers them by
//! addressing the bridge bot at the start of a message. A command without
//! an argument reports the current value, with an argument it mutates and
//! persists before confirming.

use crate::error::{BridgeError, BridgeResult};
use regex::Regex;
use std::fmt::Write as _;
use std::sync::LazyLock;

// "botname: rest", "@botname rest", "botname, rest" all trigger.
static TRIGGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*@?([^:,\s]+)[\s:,]*(.+)$").expect("static regex"));

/// What a command accepts as its argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSpec {
    /// No argument at all.
    None,
    /// A non-negative line count.
    Count,
    /// `on`/`off` (also accepts enable/disable/true/false).
    Toggle,
}

/// One registered command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub args: ArgSpec,
    pub help: &'static str,
}

/// A parsed command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub name: &'static str,
    pub count: Option<usize>,
    pub toggle: Option<bool>,
}

/// The command set of one room.
#[derive(Debug, Default)]
pub struct CommandSet {
    commands: Vec<CommandSpec>,
}

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, args: ArgSpec, help: &'static str) {
        self.commands.push(CommandSpec { name, args, help });
    }

    /// Parse one command line. Errors carry the exact text shown to the
    /// owner.
    pub fn parse(&self, line: &str) -> BridgeResult<Invocation> {
        let mut words = line.split_whitespace();
        let Some(word) = words.next() else {
            return Err(BridgeError::Parse("No command given, try HELP".into()));
        };
        let name = word.to_ascii_uppercase();

        if name == "HELP" {
            return Ok(Invocation {
                name: "HELP",
                count: None,
                toggle: None,
            });
        }

        let Some(spec) = self
            .commands
            .iter()
            .find(|spec| spec.name == name)
        else {
            return Err(BridgeError::Parse(format!(
                "Unknown command: {name} (try HELP)"
            )));
        };

        let arg = words.next();
        if let Some(extra) = words.next() {
            return Err(BridgeError::Parse(format!(
                "{}: unexpected argument '{extra}'",
                spec.name
            )));
        }

        let mut invocation = Invocation {
            name: spec.name,
            count: None,
            toggle: None,
        };

        match (spec.args, arg) {
            (_, None) => {}
            (ArgSpec::None, Some(arg)) => {
                return Err(BridgeError::Parse(format!(
                    "{} takes no arguments, got '{arg}'",
                    spec.name
                )));
            }
            (ArgSpec::Count, Some(arg)) => match arg.parse::<usize>() {
                Ok(count) => invocation.count = Some(count),
                Err(_) => {
                    return Err(BridgeError::Parse(format!(
                        "{}: '{arg}' is not a non-negative number",
                        spec.name
                    )));
                }
            },
            (ArgSpec::Toggle, Some(arg)) => match arg.to_ascii_lowercase().as_str() {
                "on" | "enable" | "true" | "yes" => invocation.toggle = Some(true),
                "off" | "disable" | "false" | "no" => invocation.toggle = Some(false),
                other => {
                    return Err(BridgeError::Parse(format!(
                        "{}: expected on or off, got '{other}'",
                        spec.name
                    )));
                }
            },
        }

        Ok(invocation)
    }

    /// Formatted command list for HELP.
    pub fn help_text(&self) -> String {
        let mut out = String::from("Commands:\n");
        for spec in &self.commands {
            let arg = match spec.args {
                ArgSpec::None => "",
                ArgSpec::Count => " [lines]",
                ArgSpec::Toggle => " [on|off]",
            };
            let _ = writeln!(out, "  {}{} - {}", spec.name, arg, spec.help);
        }
        out.push_str("  HELP - show this list");
        out
    }
}

/// If `body` addresses the bot, return the command line after the address.
pub fn command_trigger<'a>(body: &'a str, bot_localpart: &str) -> Option<&'a str> {
    let caps = TRIGGER.captures(body)?;
    let addressed = caps.get(1)?.as_str();
    if addressed.eq_ignore_ascii_case(bot_localpart) {
        Some(caps.get(2)?.as_str())
    } else {
        None
    }
}
