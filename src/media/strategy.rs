//! Strategy descriptors and the per-platform fallback chain.

use url::Url;

use super::platform::Platform;
use super::types::DownloadRequest;
use super::DownloadSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// YouTube extractor pinned to one player client identity.
    PlayerClient { client: String },
    /// Plain downloader run, optionally with platform flags.
    External { flags: Vec<String> },
    /// Same request routed through an alternate public frontend.
    Mirror { endpoint: String },
}

impl Strategy {
    pub fn label(&self) -> String {
        match self {
            Strategy::PlayerClient { client } => format!("player_client={client}"),
            Strategy::External { flags } if flags.is_empty() => "generic".to_string(),
            Strategy::External { flags } => format!("generic+{}", flags.join(" ")),
            Strategy::Mirror { endpoint } => format!("mirror={endpoint}"),
        }
    }

    /// Full downloader argument list, or `None` if the strategy can't handle this URL.
    pub fn arguments(&self, request: &DownloadRequest, output_template: &str) -> Option<Vec<String>> {
        let url = match self {
            Strategy::Mirror { endpoint } => mirror_url(&request.source_url, endpoint)?,
            _ => request.source_url.clone(),
        };

        let mut args = vec![
            url.to_string(),
            "-f".to_string(),
            request.format.selector().to_string(),
            "-o".to_string(),
            output_template.to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        args.extend(request.format.extra_args().iter().map(|a| a.to_string()));

        match self {
            Strategy::PlayerClient { client } => {
                args.push("--extractor-args".to_string());
                args.push(format!("youtube:player_client={client}"));
            }
            Strategy::External { flags } => args.extend(flags.iter().cloned()),
            Strategy::Mirror { .. } => {}
        }

        Some(args)
    }
}

pub fn build_chain(platform: Platform, settings: &DownloadSettings) -> Vec<Strategy> {
    let mut chain = Vec::new();

    if platform == Platform::YouTube {
        chain.extend(
            settings
                .youtube_clients
                .iter()
                .map(|client| Strategy::PlayerClient {
                    client: client.clone(),
                }),
        );
    }

    let flags = platform_flags(platform, settings);
    if !flags.is_empty() {
        chain.push(Strategy::External { flags });
    }
    chain.push(Strategy::External { flags: Vec::new() });

    if platform == Platform::YouTube {
        if let Some(endpoint) = &settings.mirror_endpoint {
            chain.push(Strategy::Mirror {
                endpoint: endpoint.clone(),
            });
        }
    }

    chain
}

fn platform_flags(platform: Platform, settings: &DownloadSettings) -> Vec<String> {
    match platform {
        Platform::TikTok | Platform::Twitter => {
            vec!["--impersonate".to_string(), settings.impersonate_target.clone()]
        }
        Platform::Instagram => browser_headers(settings, "https://www.instagram.com/"),
        Platform::Facebook => browser_headers(settings, "https://www.facebook.com/"),
        _ => Vec::new(),
    }
}

fn browser_headers(settings: &DownloadSettings, referer: &str) -> Vec<String> {
    vec![
        "--user-agent".to_string(),
        settings.user_agent.clone(),
        "--add-header".to_string(),
        format!("Referer:{referer}"),
    ]
}

/// Rewrites a YouTube URL onto a mirror frontend, e.g. `https://yewtu.be`.
pub fn mirror_url(source: &Url, endpoint: &str) -> Option<Url> {
    let mut target = Url::parse(endpoint).ok()?;
    let host = source.host_str()?.to_ascii_lowercase();

    if host == "youtu.be" {
        let id = source
            .path_segments()?
            .next()
            .filter(|segment| !segment.is_empty())?
            .to_string();
        target.set_path("/watch");
        target.query_pairs_mut().clear().append_pair("v", &id);
    } else {
        target.set_path(source.path());
        target.set_query(source.query());
    }

    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::types::OutputFormat;
    use std::path::PathBuf;
    use std::time::Duration;

    fn settings() -> DownloadSettings {
        DownloadSettings {
            command: vec!["yt-dlp".to_string()],
            scratch_dir: PathBuf::from("/tmp/clipdrop-test"),
            timeout: Duration::from_secs(60),
            strategy_delay: Duration::ZERO,
            stderr_limit: 500,
            youtube_clients: vec!["android_vr".to_string(), "web_safari".to_string()],
            mirror_endpoint: Some("https://yewtu.be".to_string()),
            impersonate_target: "chrome".to_string(),
            user_agent: "TestAgent/1.0".to_string(),
        }
    }

    fn request(raw: &str, format: OutputFormat) -> DownloadRequest {
        DownloadRequest::new(Url::parse(raw).unwrap(), format)
    }

    #[test]
    fn test_youtube_chain_order() {
        let chain = build_chain(Platform::YouTube, &settings());
        assert_eq!(
            chain,
            vec![
                Strategy::PlayerClient {
                    client: "android_vr".to_string()
                },
                Strategy::PlayerClient {
                    client: "web_safari".to_string()
                },
                Strategy::External { flags: vec![] },
                Strategy::Mirror {
                    endpoint: "https://yewtu.be".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_youtube_chain_without_mirror() {
        let mut settings = settings();
        settings.mirror_endpoint = None;
        settings.youtube_clients.clear();
        let chain = build_chain(Platform::YouTube, &settings);
        assert_eq!(chain, vec![Strategy::External { flags: vec![] }]);
    }

    #[test]
    fn test_short_video_chain_impersonates_first() {
        let chain = build_chain(Platform::TikTok, &settings());
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain[0],
            Strategy::External {
                flags: vec!["--impersonate".to_string(), "chrome".to_string()]
            }
        );
        assert_eq!(chain[1], Strategy::External { flags: vec![] });
    }

    #[test]
    fn test_instagram_chain_sends_browser_headers() {
        let chain = build_chain(Platform::Instagram, &settings());
        let Strategy::External { flags } = &chain[0] else {
            panic!("expected external strategy");
        };
        assert!(flags.contains(&"TestAgent/1.0".to_string()));
        assert!(flags.contains(&"Referer:https://www.instagram.com/".to_string()));
    }

    #[test]
    fn test_unknown_chain_is_generic_only() {
        let chain = build_chain(Platform::Unknown, &settings());
        assert_eq!(chain, vec![Strategy::External { flags: vec![] }]);
    }

    #[test]
    fn test_arguments_layout() {
        let req = request("https://www.tiktok.com/@a/video/1", OutputFormat::Video);
        let strategy = Strategy::External {
            flags: vec!["--impersonate".to_string(), "chrome".to_string()],
        };
        let args = strategy.arguments(&req, "/scratch/x.%(ext)s").unwrap();

        assert_eq!(args[0], "https://www.tiktok.com/@a/video/1");
        assert_eq!(&args[1..5], &["-f", OutputFormat::Video.selector(), "-o", "/scratch/x.%(ext)s"]);
        assert_eq!(&args[5..7], &["--no-playlist", "--no-warnings"]);
        assert!(args.ends_with(&["--impersonate".to_string(), "chrome".to_string()]));
        assert!(args.contains(&"--merge-output-format".to_string()));
    }

    #[test]
    fn test_audio_arguments_request_extraction() {
        let req = request("https://www.youtube.com/watch?v=abc", OutputFormat::Audio);
        let strategy = Strategy::PlayerClient {
            client: "android".to_string(),
        };
        let args = strategy.arguments(&req, "/scratch/x.%(ext)s").unwrap();

        assert_eq!(args[2], "bestaudio/best");
        assert!(args.contains(&"-x".to_string()));
        assert!(args.contains(&"mp3".to_string()));
        assert!(args.ends_with(&[
            "--extractor-args".to_string(),
            "youtube:player_client=android".to_string()
        ]));
    }

    #[test]
    fn test_mirror_url_rewrites() {
        let watch = Url::parse("https://www.youtube.com/watch?v=abc&t=10").unwrap();
        assert_eq!(
            mirror_url(&watch, "https://yewtu.be").unwrap().as_str(),
            "https://yewtu.be/watch?v=abc&t=10"
        );

        let short = Url::parse("https://youtu.be/xyz?si=track").unwrap();
        assert_eq!(
            mirror_url(&short, "https://yewtu.be").unwrap().as_str(),
            "https://yewtu.be/watch?v=xyz"
        );

        let bare = Url::parse("https://youtu.be/").unwrap();
        assert!(mirror_url(&bare, "https://yewtu.be").is_none());
        assert!(mirror_url(&watch, "not a url").is_none());
    }

    #[test]
    fn test_mirror_strategy_uses_rewritten_url() {
        let req = request("https://youtu.be/xyz", OutputFormat::Video);
        let strategy = Strategy::Mirror {
            endpoint: "https://yewtu.be".to_string(),
        };
        let args = strategy.arguments(&req, "/scratch/x.%(ext)s").unwrap();
        assert_eq!(args[0], "https://yewtu.be/watch?v=xyz");
        assert_eq!(strategy.label(), "mirror=https://yewtu.be");
    }
}
