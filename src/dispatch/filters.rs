//! Predicates over raw output lines. Returning `false` drops the line.

use regex::Regex;
use std::sync::LazyLock;

use crate::term::is_cursor_escape_only;

/// A composable keep/drop predicate.
pub type LineFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Trailing `| NN%` as drawn by package-manager download bars.
static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\|\s*(\d{1,3})%\s*$").unwrap());

/// Drop intermediate progress-bar updates, keeping the completed `100%` line.
pub fn progress_bars() -> LineFilter {
    Box::new(|line| match PROGRESS_RE.captures(line.trim_end()) {
        Some(caps) => &caps[1] == "100",
        None => true,
    })
}

/// Drop lines that only reposition the cursor or erase.
pub fn cursor_escapes() -> LineFilter {
    Box::new(|line| !is_cursor_escape_only(line))
}

/// Combine filters so a line is kept only when every filter keeps it.
pub fn all_of(filters: Vec<LineFilter>) -> LineFilter {
    Box::new(move |line| filters.iter().all(|keep| keep(line)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_updates_dropped_until_complete() {
        let keep = progress_bars();
        assert!(!keep("python-3.12.1 | 30.8 MB | #####      |  45% "));
        assert!(!keep("python-3.12.1 | 30.8 MB |            |   0%\n"));
        assert!(keep("python-3.12.1 | 30.8 MB | ########## | 100% \n"));
        assert!(keep("Preparing transaction: done"));
        assert!(keep("disk usage at 45%"));
    }

    #[test]
    fn cursor_only_lines_dropped() {
        let keep = cursor_escapes();
        assert!(!keep("\x1b[A\x1b[2K\n"));
        assert!(keep("\x1b[2KExtracting packages"));
    }

    #[test]
    fn all_of_requires_every_filter() {
        let keep = all_of(vec![progress_bars(), cursor_escapes()]);
        assert!(!keep("\x1b[1A"));
        assert!(!keep("pkg | 1 MB | ## | 20%"));
        assert!(keep("Executing transaction: done"));
    }
}
