//! Fire-and-forget activity notices posted to Discord.
//!
//! A notice is rendered once into an embed and handed to every configured sink
//! on a spawned task. Delivery failures are logged and never reach the caller.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use twilight_http::Client as HttpClient;
use twilight_model::channel::message::Embed;
use twilight_model::id::{marker::ChannelMarker, Id};
use twilight_model::util::Timestamp;
use twilight_util::builder::embed::{EmbedBuilder, EmbedFieldBuilder, EmbedFooterBuilder};

use crate::config::Config;
use crate::media::{FailureReason, OutputFormat, Platform};
use crate::utils::truncate;

const FIELD_LIMIT: usize = 1024;

const COLOR_OK: u32 = 0x2ecc71;
const COLOR_INFO: u32 = 0x3498db;
const COLOR_PENDING: u32 = 0xf1c40f;
const COLOR_FAILED: u32 = 0xe74c3c;
const COLOR_ERROR: u32 = 0x992d22;

#[derive(Debug, Clone, Copy)]
pub struct NoticeSettings {
    pub log_downloads: bool,
    pub log_visits: bool,
    pub log_errors: bool,
}

impl Default for NoticeSettings {
    fn default() -> Self {
        Self {
            log_downloads: true,
            log_visits: true,
            log_errors: true,
        }
    }
}

/// Who triggered a notice.
#[derive(Debug, Clone)]
pub struct Visitor {
    pub ip: String,
    pub device: String,
}

#[derive(Debug, Clone)]
pub enum Notice {
    Startup {
        version: String,
        bind: String,
    },
    Visit {
        visitor: Visitor,
        user_agent: String,
    },
    DownloadStarted {
        visitor: Visitor,
        platform: Platform,
        url: String,
        format: OutputFormat,
    },
    DownloadCompleted {
        visitor: Visitor,
        platform: Platform,
        filename: String,
        size: u64,
    },
    DownloadFailed {
        visitor: Visitor,
        platform: Platform,
        reason: FailureReason,
        error: String,
    },
    Error {
        context: String,
        message: String,
    },
}

impl Notice {
    fn enabled(&self, settings: &NoticeSettings) -> bool {
        match self {
            Notice::Startup { .. } => true,
            Notice::Visit { .. } => settings.log_visits,
            Notice::DownloadStarted { .. }
            | Notice::DownloadCompleted { .. }
            | Notice::DownloadFailed { .. } => settings.log_downloads,
            Notice::Error { .. } => settings.log_errors,
        }
    }

    pub fn embed(&self) -> Embed {
        let builder = match self {
            Notice::Startup { version, bind } => EmbedBuilder::new()
                .title("🚀 Server started")
                .color(COLOR_OK)
                .field(field("Version", version, true))
                .field(field("Listening on", bind, true)),
            Notice::Visit {
                visitor,
                user_agent,
            } => visitor_fields(EmbedBuilder::new(), visitor)
                .title("👀 New visitor")
                .color(COLOR_INFO)
                .field(field("User agent", user_agent, false)),
            Notice::DownloadStarted {
                visitor,
                platform,
                url,
                format,
            } => visitor_fields(EmbedBuilder::new(), visitor)
                .title("⬇️ Download started")
                .color(COLOR_PENDING)
                .field(field("Platform", platform.display_name(), true))
                .field(field("Format", format.extension(), true))
                .field(field("URL", url, false)),
            Notice::DownloadCompleted {
                visitor,
                platform,
                filename,
                size,
            } => visitor_fields(EmbedBuilder::new(), visitor)
                .title("✅ Download completed")
                .color(COLOR_OK)
                .field(field("Platform", platform.display_name(), true))
                .field(field(
                    "Size",
                    &format!("{:.1}MB", *size as f64 / 1_000_000.0),
                    true,
                ))
                .field(field("File", filename, false)),
            Notice::DownloadFailed {
                visitor,
                platform,
                reason,
                error,
            } => visitor_fields(EmbedBuilder::new(), visitor)
                .title("❌ Download failed")
                .color(COLOR_FAILED)
                .field(field("Platform", platform.display_name(), true))
                .field(field("Reason", reason.code(), true))
                .field(field("Error", error, false)),
            Notice::Error { context, message } => EmbedBuilder::new()
                .title("⚠️ Server error")
                .color(COLOR_ERROR)
                .field(field("Context", context, false))
                .field(field("Message", message, false)),
        };

        let builder = builder.footer(EmbedFooterBuilder::new("clipdrop"));
        match Timestamp::from_secs(chrono::Utc::now().timestamp()) {
            Ok(timestamp) => builder.timestamp(timestamp).build(),
            Err(_) => builder.build(),
        }
    }
}

fn visitor_fields(builder: EmbedBuilder, visitor: &Visitor) -> EmbedBuilder {
    builder
        .field(field("IP", &visitor.ip, true))
        .field(field("Device", &visitor.device, true))
}

fn field(name: &str, value: &str, inline: bool) -> EmbedFieldBuilder {
    let value = if value.is_empty() { "-" } else { value };
    let field = EmbedFieldBuilder::new(name, truncate(value, FIELD_LIMIT - 1));
    if inline {
        field.inline()
    } else {
        field
    }
}

#[async_trait]
pub trait NoticeSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, embed: &Embed) -> Result<()>;
}

pub struct DiscordBotSink {
    http: HttpClient,
    channel_id: Id<ChannelMarker>,
}

impl DiscordBotSink {
    pub fn new(token: String, channel_id: Id<ChannelMarker>) -> Self {
        Self {
            http: HttpClient::new(token),
            channel_id,
        }
    }
}

#[async_trait]
impl NoticeSink for DiscordBotSink {
    fn name(&self) -> &'static str {
        "discord-bot"
    }

    async fn deliver(&self, embed: &Embed) -> Result<()> {
        self.http
            .create_message(self.channel_id)
            .embeds(std::slice::from_ref(embed))
            .await
            .context("Failed to post notice to Discord channel")?;
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    embeds: &'a [Embed],
}

pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl NoticeSink for WebhookSink {
    fn name(&self) -> &'static str {
        "discord-webhook"
    }

    async fn deliver(&self, embed: &Embed) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&WebhookPayload {
                embeds: std::slice::from_ref(embed),
            })
            .send()
            .await
            .context("Failed to reach Discord webhook")?
            .error_for_status()
            .context("Discord webhook rejected notice")?;
        Ok(())
    }
}

fn parse_channel_id(raw: &str) -> Result<Id<ChannelMarker>> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .and_then(Id::new_checked)
        .with_context(|| format!("Invalid Discord channel id: {raw:?}"))
}

#[derive(Clone)]
pub struct Notifier {
    sinks: Arc<Vec<Arc<dyn NoticeSink>>>,
    settings: NoticeSettings,
}

impl Notifier {
    pub fn new(settings: NoticeSettings, sinks: Vec<Arc<dyn NoticeSink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
            settings,
        }
    }

    pub fn disabled() -> Self {
        Self::new(NoticeSettings::default(), Vec::new())
    }

    /// Builds the sinks named by the `[discord]` section.
    pub fn from_config(config: &Config) -> Result<Self> {
        let discord = &config.discord;
        let mut sinks: Vec<Arc<dyn NoticeSink>> = Vec::new();

        match (&discord.token, &discord.channel_id) {
            (Some(token), Some(channel)) => {
                let channel_id = parse_channel_id(channel)?;
                sinks.push(Arc::new(DiscordBotSink::new(token.clone(), channel_id)));
                info!("Discord bot notices enabled for channel {}", channel_id);
            }
            (Some(_), None) => warn!("Discord token set without channel_id, bot notices disabled"),
            _ => {}
        }

        if let Some(url) = &discord.webhook_url {
            sinks.push(Arc::new(WebhookSink::new(url.clone())));
            info!("Discord webhook notices enabled");
        }

        if sinks.is_empty() {
            info!("No Discord credentials configured, notices disabled");
        }

        Ok(Self::new(config.notice_settings(), sinks))
    }

    pub fn is_enabled(&self) -> bool {
        !self.sinks.is_empty()
    }

    /// Delivers `notice` in the background. The handle is only useful to tests.
    pub fn notify(&self, notice: Notice) -> Option<JoinHandle<()>> {
        if !self.is_enabled() || !notice.enabled(&self.settings) {
            return None;
        }

        let sinks = Arc::clone(&self.sinks);
        Some(tokio::spawn(async move {
            let embed = notice.embed();
            for sink in sinks.iter() {
                match sink.deliver(&embed).await {
                    Ok(()) => debug!("Delivered notice via {}", sink.name()),
                    Err(e) => warn!("Notice delivery via {} failed: {:#}", sink.name(), e),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Embed>>,
    }

    #[async_trait]
    impl NoticeSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn deliver(&self, embed: &Embed) -> Result<()> {
            self.delivered.lock().unwrap().push(embed.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NoticeSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn deliver(&self, _embed: &Embed) -> Result<()> {
            Err(anyhow::anyhow!("webhook returned 500"))
        }
    }

    fn visitor() -> Visitor {
        Visitor {
            ip: "203.0.113.7".to_string(),
            device: "Mobile (Android)".to_string(),
        }
    }

    fn field_value<'a>(embed: &'a Embed, name: &str) -> Option<&'a str> {
        embed
            .fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    #[test]
    fn test_failed_download_embed() {
        let embed = Notice::DownloadFailed {
            visitor: visitor(),
            platform: Platform::Instagram,
            reason: FailureReason::LoginRequired,
            error: "x".repeat(3000),
        }
        .embed();

        assert_eq!(embed.title.as_deref(), Some("❌ Download failed"));
        assert_eq!(embed.color, Some(COLOR_FAILED));
        assert_eq!(field_value(&embed, "IP"), Some("203.0.113.7"));
        assert_eq!(field_value(&embed, "Platform"), Some("Instagram"));
        assert_eq!(field_value(&embed, "Reason"), Some("LOGIN_REQUIRED"));
        assert_eq!(
            field_value(&embed, "Error").unwrap().chars().count(),
            FIELD_LIMIT
        );
    }

    #[test]
    fn test_empty_values_are_placeholders() {
        let embed = Notice::Visit {
            visitor: visitor(),
            user_agent: String::new(),
        }
        .embed();
        assert_eq!(field_value(&embed, "User agent"), Some("-"));
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_others() {
        let recording = Arc::new(RecordingSink::default());
        let sinks: Vec<Arc<dyn NoticeSink>> = vec![Arc::new(FailingSink), recording.clone()];
        let notifier = Notifier::new(NoticeSettings::default(), sinks);

        let handle = notifier
            .notify(Notice::Error {
                context: "download".to_string(),
                message: "boom".to_string(),
            })
            .unwrap();
        handle.await.unwrap();

        let delivered = recording.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(field_value(&delivered[0], "Message"), Some("boom"));
    }

    #[tokio::test]
    async fn test_switched_off_kinds_are_skipped() {
        let recording = Arc::new(RecordingSink::default());
        let settings = NoticeSettings {
            log_downloads: true,
            log_visits: false,
            log_errors: true,
        };
        let sinks: Vec<Arc<dyn NoticeSink>> = vec![recording.clone()];
        let notifier = Notifier::new(settings, sinks);

        assert!(notifier
            .notify(Notice::Visit {
                visitor: visitor(),
                user_agent: "curl/8".to_string(),
            })
            .is_none());

        notifier
            .notify(Notice::Startup {
                version: "0.1.0".to_string(),
                bind: "0.0.0.0:3000".to_string(),
            })
            .unwrap()
            .await
            .unwrap();

        assert_eq!(recording.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_notifier_spawns_nothing() {
        let notifier = Notifier::disabled();
        assert!(!notifier.is_enabled());
        // No runtime needed because nothing is spawned
        assert!(notifier
            .notify(Notice::Error {
                context: "x".to_string(),
                message: "y".to_string(),
            })
            .is_none());
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        assert!(!Notifier::from_config(&config).unwrap().is_enabled());

        config.discord.token = Some("token".to_string());
        config.discord.channel_id = Some("not-a-number".to_string());
        assert!(Notifier::from_config(&config).is_err());

        config.discord.token = None;
        config.discord.webhook_url = Some("https://discord.com/api/webhooks/1/abc".to_string());
        assert!(Notifier::from_config(&config).unwrap().is_enabled());
    }

    #[test]
    fn test_parse_channel_id() {
        assert_eq!(parse_channel_id(" 1234 ").unwrap().get(), 1234);
        assert!(parse_channel_id("0").is_err());
    }
}
