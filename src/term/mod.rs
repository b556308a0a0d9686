//! Terminal sharing: write proxies, the message spinner, and the console
//! facility that composes them.

mod console;
mod proxy;
mod spinner;

pub use console::{ConsoleSpinner, ConsoleStream};
pub use proxy::StreamWriteProxy;
pub use spinner::MessageSpinner;

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// CSI sequences (`ESC [ params final`). Captures the final byte so SGR (`m`)
/// can be told apart from cursor movement and erase sequences.
static CSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*([@-~])").unwrap());

/// Remove every CSI escape sequence except SGR color codes.
pub fn strip_non_color_escapes(text: &str) -> Cow<'_, str> {
    CSI_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        if &caps[1] == "m" {
            caps[0].to_string()
        } else {
            String::new()
        }
    })
}

/// True when `text` holds at least one non-color escape sequence and nothing
/// else but whitespace.
pub fn is_cursor_escape_only(text: &str) -> bool {
    let has_control = CSI_RE.captures_iter(text).any(|caps| &caps[1] != "m");
    has_control && strip_non_color_escapes(text).trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_sgr_and_drops_cursor_codes() {
        let input = "\x1b[2K\x1b[1A\x1b[31mred\x1b[0m text\x1b[?25l";
        assert_eq!(strip_non_color_escapes(input), "\x1b[31mred\x1b[0m text");
    }

    #[test]
    fn plain_text_is_borrowed() {
        assert!(matches!(strip_non_color_escapes("hello"), Cow::Borrowed(_)));
    }

    #[test]
    fn detects_cursor_only_lines() {
        assert!(is_cursor_escape_only("\x1b[1A\x1b[2K"));
        assert!(is_cursor_escape_only("  \x1b[K \n"));
        assert!(!is_cursor_escape_only("\x1b[31m\x1b[0m"));
        assert!(!is_cursor_escape_only("\x1b[2Kdone"));
        assert!(!is_cursor_escape_only(""));
    }
}
