//! Spawning ffmpeg/ffprobe and collecting their output.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use process_utils::{OutputTail, tokio_command, tool_path};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Error, Result};

/// Output of a finished child process.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub duration: f64,
    /// Last lines of combined stdout/stderr.
    pub tail: OutputTail,
}

impl CommandOutput {
    /// Human-readable failure detail: the lines mentioning an error, else the last line.
    pub fn failure_detail(&self) -> String {
        let mut error_lines = OutputTail::new(self.tail.len().max(1));
        for line in self.tail.joined().lines() {
            if line.to_ascii_lowercase().contains("error") {
                error_lines.push(line);
            }
        }
        if !error_lines.is_empty() {
            return error_lines.joined();
        }
        match self.tail.last() {
            Some(line) => line.to_string(),
            None => format!("exited with {}", self.status),
        }
    }
}

fn forward_lines<R>(reader: R, stream: &'static str, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Progress bars redraw with `\r`, so both CR and LF end a line.
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let emit = |line: &mut Vec<u8>| {
            if line.is_empty() {
                return true;
            }
            let text = String::from_utf8_lossy(line).into_owned();
            line.clear();
            debug!("{}: {}", stream, text);
            tx.send(text).is_ok()
        };

        loop {
            let chunk = match reader.fill_buf().await {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if chunk.is_empty() {
                emit(&mut line);
                break;
            }
            let len = chunk.len();
            let mut open = true;
            for &byte in chunk {
                if byte == b'\n' || byte == b'\r' {
                    open = emit(&mut line);
                    if !open {
                        break;
                    }
                } else {
                    line.push(byte);
                }
            }
            if !open {
                break;
            }
            reader.consume(len);
        }
    });
}

/// Run a command to completion, keeping the last `tail_lines` output lines.
///
/// `on_line` sees every stdout/stderr line as it arrives. Dropping the returned
/// future kills the child when the command was built with [`tokio_command`].
pub async fn run_command_with_tail<F>(
    command: &mut Command,
    tail_lines: usize,
    mut on_line: F,
) -> Result<CommandOutput>
where
    F: FnMut(&str),
{
    let start = std::time::Instant::now();

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let program = command.as_std().get_program().to_os_string();
    let mut child = command
        .spawn()
        .map_err(|e| Error::io_path("spawning", Path::new(&program), e))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, "stdout", tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, "stderr", tx.clone());
    }
    drop(tx);

    // The channel closes once both pipes reach EOF.
    let mut tail = OutputTail::new(tail_lines);
    while let Some(line) = rx.recv().await {
        on_line(&line);
        tail.push(line);
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::io_path("waiting for", Path::new(&program), e))?;

    Ok(CommandOutput {
        status,
        duration: start.elapsed().as_secs_f64(),
        tail,
    })
}

/// Locations of the ffmpeg and ffprobe binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegTools {
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for FfmpegTools {
    fn default() -> Self {
        Self {
            ffmpeg: tool_path("FFMPEG_PATH", "ffmpeg"),
            ffprobe: tool_path("FFPROBE_PATH", "ffprobe"),
        }
    }
}

impl FfmpegTools {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Arguments every ffmpeg invocation starts with.
    pub fn base_args() -> Vec<String> {
        ["-y", "-hide_banner", "-nostats", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Run ffmpeg with `args`. A non-zero exit is returned as `Ok` for the caller to classify.
    pub async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        debug!("FFmpeg args: {:?}", args);
        let mut cmd = tokio_command(&self.ffmpeg);
        cmd.args(args);
        run_command_with_tail(&mut cmd, process_utils::DEFAULT_TAIL_LINES, |_| {}).await
    }

    /// Whether `path` has at least one video stream.
    pub async fn has_video_stream(&self, path: &Path) -> Result<bool> {
        let mut cmd = tokio_command(&self.ffprobe);
        cmd.args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=codec_type", "-of", "csv=p=0"])
            .arg(path);
        let mut stdout = String::new();
        let output = run_command_with_tail(&mut cmd, 4, |line| {
            if stdout.is_empty() {
                stdout = line.trim().to_string();
            }
        })
        .await?;
        if !output.status.success() {
            return Err(Error::UnsupportedFormat(output.failure_detail()));
        }
        Ok(stdout == "video")
    }

    /// First line of `ffmpeg -version`.
    pub async fn version(&self) -> Result<String> {
        let mut cmd = tokio_command(&self.ffmpeg);
        cmd.arg("-version");
        let output = run_command_with_tail(&mut cmd, 64, |_| {}).await?;
        let first = output
            .tail
            .joined()
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        if output.status.success() {
            Ok(first)
        } else {
            Err(Error::Other(format!("ffmpeg -version failed: {}", first)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_args() {
        let args = FfmpegTools::base_args();
        assert_eq!(args[0], "-y");
        assert!(args.contains(&"-hide_banner".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_collects_tail() {
        let mut cmd = tokio_command("sh");
        cmd.args(["-c", "echo one; echo two 1>&2; echo three; exit 3"]);
        let mut seen = 0;
        let output = run_command_with_tail(&mut cmd, 2, |_| seen += 1).await.unwrap();
        assert_eq!(seen, 3);
        assert_eq!(output.tail.len(), 2);
        assert!(!output.status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_detail_prefers_error_lines() {
        let mut cmd = tokio_command("sh");
        cmd.args(["-c", "echo 'Error opening input' 1>&2; echo done; exit 1"]);
        let output = run_command_with_tail(&mut cmd, 20, |_| {}).await.unwrap();
        assert_eq!(output.failure_detail(), "Error opening input");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_io() {
        let mut cmd = tokio_command("definitely-not-a-real-binary-4242");
        let err = run_command_with_tail(&mut cmd, 2, |_| {}).await.unwrap_err();
        assert_eq!(err.kind(), "IO_FAILURE");
    }
}
