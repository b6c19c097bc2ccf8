use anyhow::{Context, Result};
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use super::error::AttemptError;
use super::types::MediaMetadata;

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloader program plus any fixed leading arguments.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    leading_args: Vec<String>,
}

impl ToolCommand {
    pub fn from_parts(parts: &[String]) -> Option<Self> {
        let (program, rest) = parts.split_first()?;
        Some(Self {
            program: program.clone(),
            leading_args: rest.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args).kill_on_drop(true);
        // Own group, so helpers the downloader spawns (ffmpeg) can be killed with it
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stderr: String,
}

/// Runs the downloader to completion, keeping at most `stderr_limit` bytes of
/// its error output. The process is killed on timeout or if this future is dropped.
pub async fn run_tool(
    tool: &ToolCommand,
    args: &[String],
    timeout: Duration,
    stderr_limit: usize,
) -> Result<ToolOutput, AttemptError> {
    debug!("{} {}", tool.program, args.join(" "));

    let mut child = tool
        .command()
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(AttemptError::Spawn)?;

    let mut group = ProcessGroup::of(&child);
    let stderr = child.stderr.take();
    let run = async {
        let (status, stderr) = tokio::join!(child.wait(), read_bounded(stderr, stderr_limit));
        status.map(|status| ToolOutput { status, stderr })
    };
    let outcome = tokio::time::timeout(timeout, run).await;

    match outcome {
        Ok(result) => {
            group.release();
            result.map_err(AttemptError::Io)
        }
        Err(_) => {
            group.kill();
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed out {}: {}", tool.program, e);
            }
            Err(AttemptError::Timeout(timeout))
        }
    }
}

/// Process group led by a spawned downloader. Killed on drop until released,
/// which covers both the timeout path and a dropped request future.
struct ProcessGroup {
    #[cfg(unix)]
    leader: Option<i32>,
}

impl ProcessGroup {
    #[cfg(unix)]
    fn of(child: &tokio::process::Child) -> Self {
        Self {
            leader: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    #[cfg(not(unix))]
    fn of(_child: &tokio::process::Child) -> Self {
        Self {}
    }

    /// The leader exited on its own; its group id may be reused from here on.
    fn release(&mut self) {
        #[cfg(unix)]
        {
            self.leader = None;
        }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.leader.take() {
            // SAFETY: killpg takes plain integers and touches no memory.
            let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if rc != 0 {
                debug!(
                    "killpg({}) failed: {}",
                    pgid,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Drains `pipe` so the child never blocks on a full pipe, but only keeps the head.
async fn read_bounded<R: AsyncRead + Unpin>(pipe: Option<R>, limit: usize) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };

    let mut kept = Vec::with_capacity(limit.min(8192));
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!("Stopped reading downloader stderr: {}", e);
                break;
            }
        }
    }

    String::from_utf8_lossy(&kept).into_owned()
}

pub async fn extract_metadata(tool: &ToolCommand, url: &Url) -> Result<MediaMetadata> {
    debug!("Extracting metadata with {} for: {}", tool.program, url);

    let output = tokio::time::timeout(
        METADATA_TIMEOUT,
        tool.command()
            .arg("--dump-json")
            .arg("--no-download")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg(url.as_str())
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .context("Media metadata extraction timed out")?
    .context("Failed to extract media metadata")?;

    if !output.status.success() {
        let error = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!(
            "Media metadata extraction failed: {}",
            error.trim()
        ));
    }

    let json: Value =
        serde_json::from_slice(&output.stdout).context("Failed to parse media metadata")?;

    Ok(parse_metadata(&json))
}

fn parse_metadata(json: &Value) -> MediaMetadata {
    MediaMetadata {
        title: json["title"]
            .as_str()
            .unwrap_or("Unknown Title")
            .to_string(),
        id: json["id"].as_str().unwrap_or("video").to_string(),
        thumbnail: json["thumbnail"].as_str().map(|s| s.to_string()),
        duration: json["duration"].as_f64().map(|d| d as u64),
        author: json["uploader"].as_str().map(|s| s.to_string()),
        likes: json["like_count"].as_u64(),
        format_ext: json["ext"].as_str().unwrap_or("mp4").to_string(),
    }
}

pub async fn test_availability(tool: &ToolCommand) -> bool {
    let downloader_available = match tool
        .command()
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) => {
            if output.status.success() {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ {} is available, version: {}", tool.program, version.trim());
                true
            } else {
                warn!("❌ {} --version failed", tool.program);
                false
            }
        }
        Err(e) => {
            warn!("❌ {} not found: {}", tool.program, e);
            false
        }
    };

    // The downloader shells out to ffmpeg for merging and audio extraction
    let ffmpeg_available = match Command::new("ffmpeg")
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) => {
            if output.status.success() {
                let version_line = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .unwrap_or("unknown")
                    .to_string();
                info!("✅ ffmpeg is available: {}", version_line);
                true
            } else {
                warn!("❌ ffmpeg command failed");
                false
            }
        }
        Err(e) => {
            warn!(
                "❌ ffmpeg not found: {} (required for merging and mp3 extraction)",
                e
            );
            false
        }
    };

    if downloader_available && !ffmpeg_available {
        warn!("⚠️  Downloads will work but mp3 extraction and stream merging will fail");
    }

    downloader_available
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::from_parts(&[
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "yt-dlp".to_string(),
        ])
        .unwrap()
    }

    #[test]
    fn test_from_parts() {
        assert!(ToolCommand::from_parts(&[]).is_none());
        let tool = ToolCommand::from_parts(&[
            "python3".to_string(),
            "-m".to_string(),
            "yt_dlp".to_string(),
        ])
        .unwrap();
        assert_eq!(tool.program(), "python3");
        assert_eq!(tool.leading_args, vec!["-m", "yt_dlp"]);
    }

    #[test]
    fn test_parse_metadata_defaults() {
        let meta = parse_metadata(&json!({
            "title": "Clip",
            "id": "abc",
            "duration": 12.7,
            "uploader": "someone",
            "like_count": 5
        }));
        assert_eq!(meta.title, "Clip");
        assert_eq!(meta.duration, Some(12));
        assert_eq!(meta.author.as_deref(), Some("someone"));
        assert_eq!(meta.format_ext, "mp4");
        assert!(meta.thumbnail.is_none());

        let empty = parse_metadata(&json!({}));
        assert_eq!(empty.title, "Unknown Title");
        assert_eq!(empty.id, "video");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tool_captures_bounded_stderr() {
        let tool = sh("printf 'abcdefghijklmnopqrstuvwxyz' >&2; exit 3");
        let output = run_tool(&tool, &[], Duration::from_secs(10), 5).await.unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stderr, "abcde");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tool_passes_arguments() {
        let tool = sh("[ \"$1\" = \"https://example.com/v\" ] && [ \"$2\" = \"-f\" ]");
        let args = vec!["https://example.com/v".to_string(), "-f".to_string()];
        let output = run_tool(&tool, &args, Duration::from_secs(10), 100).await.unwrap();
        assert!(output.status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tool_times_out() {
        let tool = sh("exec sleep 5");
        let started = std::time::Instant::now();
        let err = run_tool(&tool, &[], Duration::from_millis(200), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, AttemptError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_spawned_helpers() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("helper-finished");
        let tool = sh(r#"(sleep 1; touch "$1") & exec sleep 5"#);
        let args = vec![marker.to_string_lossy().into_owned()];

        let err = run_tool(&tool, &args, Duration::from_millis(200), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, AttemptError::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_run_kills_spawned_helpers() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("helper-finished");
        let tool = sh(r#"(sleep 1; touch "$1") & exec sleep 5"#);
        let args = vec![marker.to_string_lossy().into_owned()];

        let run = run_tool(&tool, &args, Duration::from_secs(10), 100);
        assert!(tokio::time::timeout(Duration::from_millis(200), run)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_run_tool_missing_binary() {
        let tool = ToolCommand::from_parts(&["/nonexistent/clipdrop-no-such-tool".to_string()]).unwrap();
        let err = run_tool(&tool, &[], Duration::from_secs(1), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, AttemptError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_metadata_from_dump_json() {
        let tool = sh(r#"printf '{"title":"Demo","id":"x1","thumbnail":"https://img/x1.jpg","ext":"webm"}'"#);
        let url = Url::parse("https://example.com/watch").unwrap();
        let meta = extract_metadata(&tool, &url).await.unwrap();
        assert_eq!(meta.title, "Demo");
        assert_eq!(meta.thumbnail.as_deref(), Some("https://img/x1.jpg"));
        assert_eq!(meta.format_ext, "webm");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_metadata_failure() {
        let tool = sh("echo 'ERROR: Unsupported URL' >&2; exit 1");
        let url = Url::parse("https://example.com/watch").unwrap();
        let err = extract_metadata(&tool, &url).await.unwrap_err();
        assert!(err.to_string().contains("Unsupported URL"));
    }

    #[tokio::test]
    #[ignore] // Requires yt-dlp and ffmpeg to be installed
    async fn test_real_tool_availability() {
        let tool = ToolCommand::from_parts(&["yt-dlp".to_string()]).unwrap();
        assert!(test_availability(&tool).await);
    }
}
