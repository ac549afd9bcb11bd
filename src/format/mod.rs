//! Message format translation between IRC and Matrix.
//!
//! Three concerns live here:
//! - [`irc`]: IRC control codes (bold, color, ...) to Matrix HTML, with
//!   nickname pillification.
//! - [`html`]: the Matrix HTML subset back to IRC control codes.
//! - [`split`]/[`diff`]: wire framing against the 512-byte IRC line limit
//!   and compact edit lines in the usual IRC convention.

pub mod diff;
pub mod html;
pub mod irc;
pub mod split;

pub use diff::line_diff;
pub use html::render_html;
pub use irc::{escape_html, parse_irc_formatting, PillMap};
pub use split::split_long;
