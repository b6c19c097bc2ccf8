/// Keeps at most `max_chars` characters of `text`, marking the cut with an ellipsis.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let mut result: String = text.chars().take(max_chars).collect();
    result.push('…');
    result
}

/// Reduces a filename to characters that are safe inside a quoted header value.
pub fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim_matches('_');
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

/// Coarse device description from a `User-Agent` header, used in activity notices.
pub fn describe_device(user_agent: &str) -> String {
    let ua = user_agent.to_lowercase();

    let os = if ua.contains("android") {
        "Android"
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        "iOS"
    } else if ua.contains("windows") {
        "Windows"
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        "macOS"
    } else if ua.contains("linux") {
        "Linux"
    } else {
        "Unknown OS"
    };

    let kind = if ua.contains("bot") || ua.contains("crawler") || ua.contains("spider") {
        "Bot"
    } else if ua.contains("ipad") || ua.contains("tablet") {
        // Checked first: iPad agents carry "Mobile/<build>" too
        "Tablet"
    } else if ua.contains("mobile") || ua.contains("iphone") || ua.contains("android") {
        "Mobile"
    } else if ua.is_empty() {
        "Unknown"
    } else {
        "Desktop"
    };

    format!("{kind} ({os})")
}
