//! Matrix HTML subset to IRC control codes.
//!
//! Renders the `formatted_body` of a Matrix message into a single string of
//! IRC text. Inline formatting becomes the matching control codes, block
//! elements become newlines, matrix.to user links collapse to displaynames
//! and the `<mx-reply>` fallback block is dropped entirely (replies are
//! reconstructed separately from the event relation).

use std::collections::HashMap;

const BOLD: char = '\x02';
const MONOSPACE: char = '\x11';
const ITALIC: char = '\x1D';
const STRIKETHROUGH: char = '\x1E';
const UNDERLINE: char = '\x1F';

/// Render a Matrix HTML fragment to IRC text.
///
/// `displaynames` maps user ids to displaynames for matrix.to link
/// collapsing. Unknown tags are ignored and their children rendered.
pub fn render_html(html: &str, displaynames: &HashMap<String, String>) -> String {
    let mut renderer = Renderer {
        displaynames,
        out: vec![String::new()],
        hrefs: Vec::new(),
    };
    renderer.run(html);
    renderer.out.pop().unwrap_or_default()
}

struct Renderer<'a> {
    displaynames: &'a HashMap<String, String>,
    /// Output buffers; anchors capture their children into a fresh buffer
    /// so the link text can be rewritten on close.
    out: Vec<String>,
    hrefs: Vec<String>,
}

impl Renderer<'_> {
    fn run(&mut self, html: &str) {
        let mut rest = html;

        while !rest.is_empty() {
            if let Some(lt) = rest.find('<') {
                self.text(&rest[..lt]);
                rest = &rest[lt..];

                let Some(gt) = rest.find('>') else {
                    // Dangling "<" with no closing bracket, emit as text.
                    self.text(rest);
                    return;
                };

                let tag = &rest[1..gt];
                rest = &rest[gt + 1..];

                let closing = tag.starts_with('/');
                let name_part = tag.trim_start_matches('/');
                let name = name_part
                    .split([' ', '\t', '\n', '/'])
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();

                if name == "mx-reply" && !closing {
                    // Reply fallback block, skip it wholesale.
                    match rest.find("</mx-reply>") {
                        Some(end) => rest = &rest[end + "</mx-reply>".len()..],
                        None => return,
                    }
                    continue;
                }

                if closing {
                    self.close_tag(&name);
                } else {
                    self.open_tag(&name, name_part);
                }
            } else {
                self.text(rest);
                return;
            }
        }
    }

    fn open_tag(&mut self, name: &str, raw: &str) {
        match name {
            "b" | "strong" => self.push(BOLD),
            "i" | "em" => self.push(ITALIC),
            "u" => self.push(UNDERLINE),
            "s" | "del" | "strike" => self.push(STRIKETHROUGH),
            "code" | "pre" => self.push(MONOSPACE),
            "br" => self.push('\n'),
            "li" => {
                self.push('\n');
                self.push_str("* ");
            }
            "blockquote" => self.push_str("> "),
            "a" => {
                self.hrefs.push(attr_value(raw, "href").unwrap_or_default());
                self.out.push(String::new());
            }
            _ => {}
        }
    }

    fn close_tag(&mut self, name: &str) {
        match name {
            "b" | "strong" => self.push(BOLD),
            "i" | "em" => self.push(ITALIC),
            "u" => self.push(UNDERLINE),
            "s" | "del" | "strike" => self.push(STRIKETHROUGH),
            "code" | "pre" => self.push(MONOSPACE),
            "p" | "div" | "blockquote" | "ul" | "ol" | "h1" | "h2" | "h3" | "h4" | "h5"
            | "h6" => self.push('\n'),
            "a" => {
                let text = if self.out.len() > 1 {
                    self.out.pop().unwrap_or_default()
                } else {
                    String::new()
                };
                let href = self.hrefs.pop().unwrap_or_default();
                let rendered = self.render_anchor(&text, &href);
                self.push_str(&rendered);
            }
            _ => {}
        }
    }

    /// Collapse matrix.to user links to displaynames; keep other links as
    /// `text (url)` unless the text already is the url.
    fn render_anchor(&self, text: &str, href: &str) -> String {
        if let Some(target) = href.strip_prefix("https://matrix.to/#/") {
            let user_id = target.split('?').next().unwrap_or(target);
            let user_id = user_id.replace("%40", "@").replace("%3A", ":");
            if user_id.starts_with('@') {
                return match self.displaynames.get(&user_id) {
                    Some(displayname) => displayname.clone(),
                    None if !text.is_empty() => text.to_string(),
                    None => user_id,
                };
            }
        }

        if href.is_empty() || text == href {
            text.to_string()
        } else if text.is_empty() {
            href.to_string()
        } else {
            format!("{text} ({href})")
        }
    }

    fn text(&mut self, raw: &str) {
        let decoded = decode_entities(raw);
        self.push_str(&decoded);
    }

    fn push(&mut self, c: char) {
        self.out.last_mut().expect("output buffer").push(c);
    }

    fn push_str(&mut self, s: &str) {
        self.out.last_mut().expect("output buffer").push_str(s);
    }
}

/// Extract a (single- or double-quoted) attribute value from a raw tag.
fn attr_value(raw_tag: &str, attr: &str) -> Option<String> {
    let mut rest = raw_tag;
    while let Some(pos) = rest.find(attr) {
        let after = &rest[pos + attr.len()..];
        let after = after.trim_start();
        if let Some(after) = after.strip_prefix('=') {
            let after = after.trim_start();
            let quote = after.chars().next()?;
            if quote == '"' || quote == '\'' {
                let inner = &after[1..];
                return inner.find(quote).map(|end| inner[..end].to_string());
            }
            // Unquoted value, read until whitespace.
            let end = after.find([' ', '\t', '>']).unwrap_or(after.len());
            return Some(after[..end].to_string());
        }
        rest = &rest[pos + attr.len()..];
    }
    None
}

/// Decode the HTML entities that appear in Matrix formatted bodies.
fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        // Entities are short; look at most a dozen chars ahead.
        let semi = rest
            .char_indices()
            .take(12)
            .find(|(_, c)| *c == ';')
            .map(|(i, _)| i);
        let Some(semi) = semi else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };

        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{A0}'),
            _ => entity
                .strip_prefix('#')
                .and_then(|num| {
                    if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        num.parse::<u32>().ok()
                    }
                })
                .and_then(char::from_u32),
        };

        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }

    out.push_str(rest);
    out
}
