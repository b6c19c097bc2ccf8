use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use super::platform::Platform;

/// Why a download failed, as far as the downloader's stderr tells us.
/// Only used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    LoginRequired,
    GeoOrIpBlocked,
    Unknown,
}

/// Lowercased substrings, first match wins.
const FAILURE_PATTERNS: &[(&str, FailureReason)] = &[
    ("sign in", FailureReason::LoginRequired),
    ("login required", FailureReason::LoginRequired),
    ("log in to", FailureReason::LoginRequired),
    ("login to", FailureReason::LoginRequired),
    ("use --cookies", FailureReason::LoginRequired),
    ("authentication", FailureReason::LoginRequired),
    ("private video", FailureReason::LoginRequired),
    ("http error 403", FailureReason::GeoOrIpBlocked),
    ("403: forbidden", FailureReason::GeoOrIpBlocked),
    ("forbidden", FailureReason::GeoOrIpBlocked),
    ("not available in your country", FailureReason::GeoOrIpBlocked),
    ("geo restrict", FailureReason::GeoOrIpBlocked),
    ("blocked", FailureReason::GeoOrIpBlocked),
    ("ip address", FailureReason::GeoOrIpBlocked),
];

pub fn classify(stderr: &str) -> FailureReason {
    let lower = stderr.to_lowercase();
    FAILURE_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, reason)| *reason)
        .unwrap_or(FailureReason::Unknown)
}

impl FailureReason {
    pub fn code(self) -> &'static str {
        match self {
            FailureReason::LoginRequired => "LOGIN_REQUIRED",
            FailureReason::GeoOrIpBlocked => "GEO_OR_IP_BLOCKED",
            FailureReason::Unknown => "DOWNLOAD_FAILED",
        }
    }

    pub fn is_specific(self) -> bool {
        !matches!(self, FailureReason::Unknown)
    }

    pub fn hint(self, platform: Platform) -> String {
        match self {
            FailureReason::LoginRequired => format!(
                "{} requires a login for this content. Try a link from a different platform.",
                platform.display_name()
            ),
            FailureReason::GeoOrIpBlocked => format!(
                "{} blocked the request from our server. Try again later or use a different platform.",
                platform.display_name()
            ),
            FailureReason::Unknown => {
                "The download failed. Check that the link is public and correct.".to_string()
            }
        }
    }
}

/// Failure of a single strategy attempt. Never leaves the orchestrator.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("failed to launch downloader: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("downloader timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(
        "downloader exited with {}: {stderr}",
        .code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
    )]
    Exited { code: Option<i32>, stderr: String },

    #[error("downloader finished but produced no output file")]
    MissingOutput,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AttemptError {
    pub fn reason(&self) -> FailureReason {
        match self {
            AttemptError::Exited { stderr, .. } => classify(stderr),
            _ => FailureReason::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("all {attempts} download strategies failed ({}): {last_error}", .reason.code())]
    AllStrategiesFailed {
        reason: FailureReason,
        attempts: usize,
        last_error: String,
    },

    #[error("downloader tool could not be launched: {0}")]
    ToolUnavailable(String),
}

impl DownloadError {
    pub fn reason(&self) -> FailureReason {
        match self {
            DownloadError::AllStrategiesFailed { reason, .. } => *reason,
            DownloadError::ToolUnavailable(_) => FailureReason::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_login() {
        assert_eq!(
            classify("ERROR: [youtube] abc: Sign in to confirm you're not a bot"),
            FailureReason::LoginRequired
        );
        assert_eq!(
            classify("ERROR: [instagram] xyz: Requested content is not available, rate-limit reached or login required"),
            FailureReason::LoginRequired
        );
        assert_eq!(
            classify("Use --cookies-from-browser or --cookies for the authentication"),
            FailureReason::LoginRequired
        );
    }

    #[test]
    fn test_classify_blocked() {
        assert_eq!(
            classify("ERROR: unable to download video data: HTTP Error 403: Forbidden"),
            FailureReason::GeoOrIpBlocked
        );
        assert_eq!(
            classify("This video is not available in your country"),
            FailureReason::GeoOrIpBlocked
        );
        assert_eq!(
            classify("Your IP address is blocked from accessing this post"),
            FailureReason::GeoOrIpBlocked
        );
    }

    #[test]
    fn test_login_outranks_blocked_in_same_output() {
        assert_eq!(
            classify("HTTP Error 403\nSign in to confirm your age"),
            FailureReason::LoginRequired
        );
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify(""), FailureReason::Unknown);
        assert_eq!(
            classify("ERROR: Unsupported URL: https://example.com"),
            FailureReason::Unknown
        );
    }

    #[test]
    fn test_ids_and_words_do_not_trip_sentinels() {
        assert_eq!(
            classify("ERROR: [TikTok] 7340312403950012345: Unable to extract webpage video data"),
            FailureReason::Unknown
        );
        assert_eq!(
            classify("ERROR: [generic] The catalog in this region is under maintenance"),
            FailureReason::Unknown
        );
        assert_eq!(
            classify("ERROR: [twitter] 1784031403002: You need to log in to view this post"),
            FailureReason::LoginRequired
        );
    }

    #[test]
    fn test_attempt_reason_only_from_exit_output() {
        let exited = AttemptError::Exited {
            code: Some(1),
            stderr: "Sign in required".to_string(),
        };
        assert_eq!(exited.reason(), FailureReason::LoginRequired);
        assert_eq!(
            AttemptError::Timeout(Duration::from_secs(5)).reason(),
            FailureReason::Unknown
        );
        assert_eq!(AttemptError::MissingOutput.reason(), FailureReason::Unknown);
    }

    #[test]
    fn test_hints_name_platform() {
        let hint = FailureReason::LoginRequired.hint(Platform::Instagram);
        assert!(hint.contains("Instagram"));
        assert!(hint.contains("different platform"));
        assert!(FailureReason::GeoOrIpBlocked
            .hint(Platform::YouTube)
            .contains("YouTube"));
    }

    #[test]
    fn test_download_error_display() {
        let err = DownloadError::AllStrategiesFailed {
            reason: FailureReason::LoginRequired,
            attempts: 3,
            last_error: "exit 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "all 3 download strategies failed (LOGIN_REQUIRED): exit 1"
        );
        assert_eq!(err.reason(), FailureReason::LoginRequired);
    }
}
