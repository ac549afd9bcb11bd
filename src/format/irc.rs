//! IRC formatting codes to Matrix HTML.
//!
//! IRC text formatting is in-band: `0x02` toggles bold, `0x1D` italic,
//! `0x1F` underline, `0x03` starts a color sequence and `0x0F` resets
//! everything. See <https://modern.ircdocs.horse/formatting>.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Lowercased nickname to `(user_id, displayname)`, used to turn nick
/// mentions into matrix.to pills.
pub type PillMap = HashMap<String, (String, String)>;

// Deliberately loose so that pillification fails open on tokens that carry
// trailing punctuation; kept bug-compatible with existing bridged rooms.
static PILL_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\s\?!:;,\.]+(\.[A-Za-z0-9])?").expect("static regex"));

/// Inline formatting state, tracked as a stack so tags can always be closed
/// in reverse order of opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Bold,
    Italic,
    Underline,
}

impl Tag {
    fn open(self) -> &'static str {
        match self {
            Tag::Bold => "<b>",
            Tag::Italic => "<i>",
            Tag::Underline => "<u>",
        }
    }

    fn close(self) -> &'static str {
        match self {
            Tag::Bold => "</b>",
            Tag::Italic => "</i>",
            Tag::Underline => "</u>",
        }
    }
}

/// Escape text for inclusion in an HTML fragment.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Parse a raw IRC line into `(plain, formatted)`.
///
/// `plain` is the text with all control codes stripped. `formatted` is an
/// HTML fragment and is only present when the line carried formatting or a
/// pill was produced. The fragment is always balanced: a toggle that closes
/// a tag below the top of the stack closes and reopens the tags above it,
/// and any tags still open at the end of input are closed in reverse order.
pub fn parse_irc_formatting(input: &str, pills: Option<&PillMap>) -> (String, Option<String>) {
    let mut plain = String::with_capacity(input.len());
    let mut formatted = String::with_capacity(input.len());
    let mut have_formatting = false;
    let mut stack: Vec<Tag> = Vec::new();
    let mut text = String::new();

    let mut chars = input.chars().peekable();

    let flush =
        |text: &mut String, plain: &mut String, formatted: &mut String, have: &mut bool| {
            if text.is_empty() {
                return;
            }
            plain.push_str(text);
            let mut escaped = escape_html(text);
            if let Some(pills) = pills {
                escaped = pillify(&escaped, pills);
                if escaped.contains("<a href") {
                    *have = true;
                }
            }
            formatted.push_str(&escaped);
            text.clear();
        };

    while let Some(c) = chars.next() {
        match c {
            '\x02' => {
                flush(&mut text, &mut plain, &mut formatted, &mut have_formatting);
                have_formatting = true;
                toggle(&mut formatted, &mut stack, Tag::Bold);
            }
            '\x1D' => {
                flush(&mut text, &mut plain, &mut formatted, &mut have_formatting);
                have_formatting = true;
                toggle(&mut formatted, &mut stack, Tag::Italic);
            }
            '\x1F' => {
                flush(&mut text, &mut plain, &mut formatted, &mut have_formatting);
                have_formatting = true;
                toggle(&mut formatted, &mut stack, Tag::Underline);
            }
            '\x03' => {
                flush(&mut text, &mut plain, &mut formatted, &mut have_formatting);
                have_formatting = true;
                // Consume "NN" or "NN,NN"; the color values themselves are
                // dropped. The comma is only part of the sequence when a
                // digit follows it.
                consume_digits(&mut chars, 2);
                if chars.peek() == Some(&',') {
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    if lookahead.peek().is_some_and(|c| c.is_ascii_digit()) {
                        chars.next();
                        consume_digits(&mut chars, 2);
                    }
                }
            }
            '\x16' => {
                // Reverse video has no HTML counterpart.
                flush(&mut text, &mut plain, &mut formatted, &mut have_formatting);
                have_formatting = true;
            }
            '\x0F' => {
                flush(&mut text, &mut plain, &mut formatted, &mut have_formatting);
                have_formatting = true;
                while let Some(tag) = stack.pop() {
                    formatted.push_str(tag.close());
                }
            }
            _ => text.push(c),
        }
    }

    flush(&mut text, &mut plain, &mut formatted, &mut have_formatting);

    // Balance requirement: close anything still open.
    while let Some(tag) = stack.pop() {
        formatted.push_str(tag.close());
    }

    let formatted = have_formatting.then_some(formatted);
    (plain, formatted)
}

fn toggle(out: &mut String, stack: &mut Vec<Tag>, tag: Tag) {
    match stack.iter().rposition(|t| *t == tag) {
        None => {
            out.push_str(tag.open());
            stack.push(tag);
        }
        Some(pos) => {
            // Close the tags opened after this one, close it, then reopen
            // the others so nesting stays proper.
            let reopen: Vec<Tag> = stack[pos + 1..].to_vec();
            for t in stack[pos..].iter().rev() {
                out.push_str(t.close());
            }
            stack.truncate(pos);
            for t in reopen {
                out.push_str(t.open());
                stack.push(t);
            }
        }
    }
}

fn consume_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, max: usize) {
    for _ in 0..max {
        if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            chars.next();
        } else {
            break;
        }
    }
}

/// Replace nickname tokens in already-escaped text with matrix.to links.
fn pillify(escaped: &str, pills: &PillMap) -> String {
    PILL_WORD
        .replace_all(escaped, |caps: &regex::Captures<'_>| {
            let word = &caps[0];
            match pills.get(&word.to_lowercase()) {
                Some((user_id, displayname)) => format!(
                    "<a href=\"https://matrix.to/#/{}\">{}</a>",
                    escape_html(user_id),
                    escape_html(displayname)
                ),
                None => word.to_string(),
            }
        })
        .into_owned()
}
