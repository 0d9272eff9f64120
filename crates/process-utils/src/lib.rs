//! Helpers for spawning external media tools (ffmpeg, ffprobe, the separation CLI).
//!
//! - [`tool_path`] resolves a binary from an environment override.
//! - [`tokio_command`] builds a child command that never opens a console window on Windows.
//! - [`OutputTail`] keeps the last N output lines of a child for error reporting.

use std::collections::VecDeque;
use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Default number of lines kept by [`OutputTail::default`].
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Resolve the path of an external tool.
///
/// Returns the value of `env_key` when it is set and non-blank, otherwise `fallback`.
pub fn tool_path(env_key: &str, fallback: &str) -> String {
    match std::env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => fallback.to_string(),
    }
}

/// Create a `tokio::process::Command` for a media tool.
///
/// The child gets `LC_ALL=C` so progress and error output is not localised,
/// is killed when the handle is dropped, and has `CREATE_NO_WINDOW` on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.env("LC_ALL", "C").kill_on_drop(true);
    cmd.no_window();
    cmd
}

/// Bounded buffer of the most recent output lines of a child process.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    /// Create a tail that keeps at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a line. Blank lines are ignored; the oldest line is evicted when full.
    pub fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(trimmed.to_string());
    }

    /// Number of retained lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Whether any retained line contains `needle` (ASCII case-insensitive).
    pub fn contains_ignore_case(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        self.lines
            .iter()
            .any(|l| l.to_ascii_lowercase().contains(&needle))
    }

    /// Retained lines joined with newlines, oldest first.
    pub fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// The most recent line, if any.
    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_most_recent_lines() {
        let mut tail = OutputTail::new(2);
        tail.push("one");
        tail.push("  ");
        tail.push("two");
        tail.push("three ");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.joined(), "two\nthree");
        assert_eq!(tail.last(), Some("three"));
    }

    #[test]
    fn tail_case_insensitive_search() {
        let mut tail = OutputTail::default();
        tail.push("RuntimeError: CUDA out of memory");
        assert!(tail.contains_ignore_case("out of memory"));
        assert!(!tail.contains_ignore_case("corrupt"));
    }

    #[test]
    fn tool_path_falls_back_when_unset() {
        assert_eq!(
            tool_path("PROCESS_UTILS_TEST_UNSET_TOOL", "ffmpeg"),
            "ffmpeg"
        );
    }
}
