use serde::Serialize;
use std::path::PathBuf;
use url::Url;

use super::platform::Platform;
use super::staging::StagedStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Video,
    Audio,
}

impl OutputFormat {
    /// Accepts the query-string spellings; absent means video.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("mp4") | Some("video") => Some(OutputFormat::Video),
            Some("mp3") | Some("audio") => Some(OutputFormat::Audio),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Video => "mp4",
            OutputFormat::Audio => "mp3",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Video => "video/mp4",
            OutputFormat::Audio => "audio/mpeg",
        }
    }

    pub fn selector(self) -> &'static str {
        match self {
            OutputFormat::Video => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/bestvideo+bestaudio/best",
            OutputFormat::Audio => "bestaudio/best",
        }
    }

    /// Post-processing flags; audio extraction is handed to ffmpeg by the downloader.
    pub fn extra_args(self) -> &'static [&'static str] {
        match self {
            OutputFormat::Video => &["--merge-output-format", "mp4"],
            OutputFormat::Audio => &["-x", "--audio-format", "mp3", "--audio-quality", "0"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub source_url: Url,
    pub format: OutputFormat,
    pub platform: Platform,
}

impl DownloadRequest {
    pub fn new(source_url: Url, format: OutputFormat) -> Self {
        let platform = Platform::detect(&source_url);
        Self {
            source_url,
            format,
            platform,
        }
    }
}

/// Record of one strategy run, kept for diagnostics.
#[derive(Debug)]
pub struct DownloadAttempt {
    pub strategy: usize,
    pub label: String,
    pub temp_path: PathBuf,
    pub exit_code: Option<i32>,
    pub error_output: String,
}

pub struct DownloadResult {
    pub stream: StagedStream,
    pub filename: String,
    pub platform: Platform,
    pub format: OutputFormat,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct MediaMetadata {
    pub title: String,
    pub id: String,
    pub thumbnail: Option<String>,
    pub duration: Option<u64>,
    pub author: Option<String>,
    pub likes: Option<u64>,
    pub format_ext: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(OutputFormat::parse(None), Some(OutputFormat::Video));
        assert_eq!(OutputFormat::parse(Some("mp4")), Some(OutputFormat::Video));
        assert_eq!(OutputFormat::parse(Some(" MP3 ")), Some(OutputFormat::Audio));
        assert_eq!(OutputFormat::parse(Some("audio")), Some(OutputFormat::Audio));
        assert_eq!(OutputFormat::parse(Some("flac")), None);
    }

    #[test]
    fn test_format_properties() {
        assert_eq!(OutputFormat::Video.content_type(), "video/mp4");
        assert_eq!(OutputFormat::Audio.content_type(), "audio/mpeg");
        assert_eq!(OutputFormat::Audio.extension(), "mp3");
        assert!(OutputFormat::Audio.extra_args().contains(&"-x"));
        assert_eq!(OutputFormat::Audio.selector(), "bestaudio/best");
    }

    #[test]
    fn test_request_detects_platform() {
        let url = Url::parse("https://www.tiktok.com/@a/video/1").unwrap();
        let request = DownloadRequest::new(url, OutputFormat::Video);
        assert_eq!(request.platform, Platform::TikTok);
    }
}
