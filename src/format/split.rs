//! Wire framing against the 512-byte IRC line limit.

/// Continuation marker used when a logical line spans several wire lines.
const DOTS: &str = "...";

/// Maximum IRC frame size including prefix, command and CR-LF.
const MAX_FRAME: usize = 512;

/// Split one logical line into wire-sized pieces.
///
/// The payload budget is what remains of 512 bytes once the full prefix
/// `:nick!user@host PRIVMSG target :` and the trailing CR-LF are accounted
/// for. Words are packed greedily; a line that overflows is emitted with a
/// trailing `...` and the next piece starts with a leading `...`. Word
/// order is preserved and the last piece has no trailing marker.
pub fn split_long(nick: &str, user: &str, host: &str, target: &str, message: &str) -> Vec<String> {
    let template = format!(":{nick}!{user}@{host} PRIVMSG {target} :\r\n");
    let budget = MAX_FRAME.saturating_sub(template.len());

    let mut out = Vec::new();
    let mut words: Vec<&str> = Vec::new();

    for word in message.split(' ') {
        words.push(word);
        let line_len: usize =
            words.iter().map(|w| w.len()).sum::<usize>() + words.len().saturating_sub(1);

        if line_len + DOTS.len() > budget {
            words.pop();
            out.push(format!("{}{}", words.join(" "), DOTS));
            words = vec![DOTS, word];
        }
    }

    out.push(words.join(" "));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_len(nick: &str, user: &str, host: &str, target: &str, line: &str) -> usize {
        format!(":{nick}!{user}@{host} PRIVMSG {target} :{line}\r\n").len()
    }

    #[test]
    fn short_line_is_untouched() {
        let out = split_long("n", "u", "h", "#c", "hello world");
        assert_eq!(out, vec!["hello world"]);
    }

    #[test]
    fn long_line_splits_with_markers() {
        // 600 chars in 10-char words
        let message = vec!["abcdefghij"; 55].join(" ");
        assert!(message.len() > 512);

        let out = split_long("n", "u", "h", "#c", &message);
        assert_eq!(out.len(), 2);
        assert!(out[0].ends_with("..."));
        assert!(out[1].starts_with("..."));
        assert!(!out[1].ends_with("..."));

        for line in &out {
            assert!(frame_len("n", "u", "h", "#c", line) <= 512);
        }
    }

    #[test]
    fn split_reconstructs_original_tokens() {
        let message = (0..120).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let out = split_long("longnick", "user", "some.host.example", "#channel", &message);
        assert!(out.len() > 1);

        let mut tokens = Vec::new();
        for line in &out {
            let stripped = line.trim_end_matches("...").trim_start_matches("...");
            tokens.extend(stripped.split(' ').filter(|w| !w.is_empty()).map(String::from));
        }
        let original: Vec<String> = message.split(' ').map(String::from).collect();
        assert_eq!(tokens, original);
    }

    #[test]
    fn multibyte_text_counts_bytes_not_chars() {
        // Each word is 30 bytes of UTF-8 (10 three-byte chars).
        let message = vec!["ありがとうありがとう"; 30].join(" ");
        let out = split_long("n", "u", "h", "#c", &message);
        assert!(out.len() > 1);
        for line in &out {
            assert!(frame_len("n", "u", "h", "#c", line) <= 512);
        }
    }
}
