pub mod janitor;

mod error;
mod platform;
mod staging;
mod strategy;
mod types;
mod ytdlp;

pub use error::{DownloadError, FailureReason};
pub use platform::Platform;
pub use staging::StagedStream;
pub use types::{DownloadRequest, DownloadResult, MediaMetadata, OutputFormat};

use anyhow::{Context, Result};
use chrono::Local;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::utils::truncate;
use error::AttemptError;
use staging::AttemptFiles;
use strategy::{build_chain, Strategy};
use types::DownloadAttempt;
use ytdlp::ToolCommand;

/// Everything the orchestrator needs to build and run a fallback chain.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Program followed by fixed leading arguments, e.g. `["python3", "-m", "yt_dlp"]`.
    pub command: Vec<String>,
    pub scratch_dir: PathBuf,
    pub timeout: Duration,
    pub strategy_delay: Duration,
    pub stderr_limit: usize,
    pub youtube_clients: Vec<String>,
    pub mirror_endpoint: Option<String>,
    pub impersonate_target: String,
    pub user_agent: String,
}

pub struct MediaDownloader {
    settings: DownloadSettings,
    tool: ToolCommand,
}

impl MediaDownloader {
    pub fn new(settings: DownloadSettings) -> Result<Self> {
        let tool = ToolCommand::from_parts(&settings.command)
            .context("Download command must name a program")?;

        info!(
            "Media downloader initialized - using {} with scratch dir {}",
            tool.program(),
            settings.scratch_dir.display()
        );

        Ok(Self { settings, tool })
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.settings.scratch_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create scratch dir {}",
                    self.settings.scratch_dir.display()
                )
            })
    }

    pub async fn test_setup(&self) -> bool {
        ytdlp::test_availability(&self.tool).await
    }

    pub async fn probe(&self, url: &Url) -> Result<MediaMetadata> {
        ytdlp::extract_metadata(&self.tool, url).await
    }

    /// Walks the fallback chain for `request` and returns the first staged result.
    pub async fn download(&self, request: &DownloadRequest) -> Result<DownloadResult, DownloadError> {
        let chain = build_chain(request.platform, &self.settings);
        info!(
            platform = %request.platform,
            strategies = chain.len(),
            "Starting download for URL: {}",
            request.source_url
        );

        let mut reason = FailureReason::Unknown;
        let mut last_error = String::new();
        let mut launched = 0;
        let mut spawn_failures = 0;

        for (index, strategy) in chain.iter().enumerate() {
            let files = AttemptFiles::new(&self.settings.scratch_dir, request.platform);
            let Some(args) = strategy.arguments(request, &files.output_template()) else {
                debug!(strategy = %strategy.label(), "Strategy does not apply, skipping");
                files.discard().await;
                continue;
            };

            if launched > 0 && !self.settings.strategy_delay.is_zero() {
                tokio::time::sleep(self.settings.strategy_delay).await;
            }
            launched += 1;
            debug!(
                strategy = %strategy.label(),
                stem = files.stem(),
                "Launching strategy {} of {}",
                index + 1,
                chain.len()
            );

            match self.attempt(request, index, strategy, files, args).await {
                Ok(result) => {
                    info!(
                        platform = %request.platform,
                        strategy = %strategy.label(),
                        size = result.size,
                        path = ?result.stream.path(),
                        "Successfully downloaded as {}",
                        result.filename
                    );
                    return Ok(result);
                }
                Err(e) => {
                    let attempt_reason = e.reason();
                    if matches!(e, AttemptError::Spawn(_)) {
                        spawn_failures += 1;
                        error!(
                            strategy = %strategy.label(),
                            "Could not launch {}: {}",
                            self.tool.program(),
                            e
                        );
                    } else {
                        warn!(
                            platform = %request.platform,
                            strategy = %strategy.label(),
                            reason = attempt_reason.code(),
                            "Strategy failed: {}",
                            e
                        );
                    }

                    if !reason.is_specific() && attempt_reason.is_specific() {
                        reason = attempt_reason;
                    }
                    last_error = truncate(&e.to_string(), self.settings.stderr_limit);
                }
            }
        }

        if launched > 0 && spawn_failures == launched {
            return Err(DownloadError::ToolUnavailable(format!(
                "{}: {}",
                self.tool.program(),
                last_error
            )));
        }

        Err(DownloadError::AllStrategiesFailed {
            reason,
            attempts: launched,
            last_error,
        })
    }

    async fn attempt(
        &self,
        request: &DownloadRequest,
        index: usize,
        strategy: &Strategy,
        files: AttemptFiles,
        args: Vec<String>,
    ) -> Result<DownloadResult, AttemptError> {
        let extension = request.format.extension();
        let mut record = DownloadAttempt {
            strategy: index,
            label: strategy.label(),
            temp_path: files.expected_path(extension),
            exit_code: None,
            error_output: String::new(),
        };

        let located: Result<(PathBuf, u64), AttemptError> = async {
            let output = ytdlp::run_tool(
                &self.tool,
                &args,
                self.settings.timeout,
                self.settings.stderr_limit,
            )
            .await?;
            record.exit_code = output.status.code();
            record.error_output = output.stderr;

            if !output.status.success() {
                return Err(AttemptError::Exited {
                    code: record.exit_code,
                    stderr: record.error_output.trim().to_string(),
                });
            }

            files
                .locate_output(extension)
                .await?
                .ok_or(AttemptError::MissingOutput)
        }
        .await;
        debug!(
            strategy = record.strategy,
            label = %record.label,
            temp_path = %record.temp_path.display(),
            exit_code = ?record.exit_code,
            stderr = %record.error_output.trim(),
            "Strategy attempt finished"
        );

        let (output, size) = match located {
            Ok(found) => found,
            Err(e) => {
                files.discard().await;
                return Err(e);
            }
        };

        let staged = files.into_staged(output).await;
        let stream = StagedStream::open(staged).await?;

        Ok(DownloadResult {
            stream,
            filename: suggested_filename(request.platform, request.format),
            platform: request.platform,
            format: request.format,
            size,
        })
    }
}

fn suggested_filename(platform: Platform, format: OutputFormat) -> String {
    format!(
        "{}_{}.{}",
        platform.tag(),
        Local::now().format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}
