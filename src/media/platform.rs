use serde::{Serialize, Serializer};
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    YouTube,
    TikTok,
    Instagram,
    Twitter,
    Facebook,
    Reddit,
    Vimeo,
    SoundCloud,
    Unknown,
}

/// Checked in order; the first matching domain decides.
const PLATFORM_HOSTS: &[(&str, Platform)] = &[
    ("youtube.com", Platform::YouTube),
    ("youtu.be", Platform::YouTube),
    ("youtube-nocookie.com", Platform::YouTube),
    ("tiktok.com", Platform::TikTok),
    ("instagram.com", Platform::Instagram),
    ("twitter.com", Platform::Twitter),
    ("x.com", Platform::Twitter),
    ("facebook.com", Platform::Facebook),
    ("fb.watch", Platform::Facebook),
    ("reddit.com", Platform::Reddit),
    ("redd.it", Platform::Reddit),
    ("vimeo.com", Platform::Vimeo),
    ("soundcloud.com", Platform::SoundCloud),
];

impl Platform {
    pub fn detect(url: &Url) -> Self {
        url.host_str()
            .map(Self::from_host)
            .unwrap_or(Platform::Unknown)
    }

    pub fn from_host(host: &str) -> Self {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        PLATFORM_HOSTS
            .iter()
            .find(|(domain, _)| host_matches(&host, domain))
            .map(|(_, platform)| *platform)
            .unwrap_or(Platform::Unknown)
    }

    pub fn tag(self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::TikTok => "tiktok",
            Platform::Instagram => "instagram",
            Platform::Twitter => "twitter",
            Platform::Facebook => "facebook",
            Platform::Reddit => "reddit",
            Platform::Vimeo => "vimeo",
            Platform::SoundCloud => "soundcloud",
            Platform::Unknown => "unknown",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Platform::YouTube => "YouTube",
            Platform::TikTok => "TikTok",
            Platform::Instagram => "Instagram",
            Platform::Twitter => "X / Twitter",
            Platform::Facebook => "Facebook",
            Platform::Reddit => "Reddit",
            Platform::Vimeo => "Vimeo",
            Platform::SoundCloud => "SoundCloud",
            Platform::Unknown => "this site",
        }
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}
