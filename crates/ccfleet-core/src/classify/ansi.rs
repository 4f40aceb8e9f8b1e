//! ANSI escape sequence removal.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// CSI, OSC, two-byte escapes, charset selection, and stray C0 controls
/// other than newline and tab.
#[allow(clippy::expect_used)]
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-?]*[ -/]*[@-~]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[()][0-9A-Za-z]",
        r"|\x1b[@-Z\\-_]",
        r"|[\x00-\x08\x0b-\x1a\x1c-\x1f\x7f]",
    ))
    .expect("static regex is valid")
});

/// Strip terminal escape sequences and control characters.
///
/// Carriage returns are dropped so spinner redraws read as plain text.
pub fn strip_ansi(input: &str) -> Cow<'_, str> {
    ANSI_RE.replace_all(input, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[0m done"), "ok done");
    }

    #[test]
    fn strips_cursor_movement_and_carriage_returns() {
        assert_eq!(strip_ansi("\x1b[2K\r\x1b[1Aworking"), "working");
    }

    #[test]
    fn strips_osc_title() {
        assert_eq!(strip_ansi("\x1b]0;claude\x07hello"), "hello");
        assert_eq!(strip_ansi("\x1b]0;claude\x1b\\hello"), "hello");
    }

    #[test]
    fn keeps_newlines_tabs_and_unicode() {
        assert_eq!(strip_ansi("a\tb\n✻ c…"), "a\tb\n✻ c…");
    }

    #[test]
    fn plain_text_is_borrowed() {
        assert!(matches!(strip_ansi("plain"), Cow::Borrowed(_)));
    }
}
