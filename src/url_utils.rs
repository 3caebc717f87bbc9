use std::collections::HashSet;

use regex::Regex;
use url::Url;

use crate::error::AppError;
use crate::models::SourceKind;

const YOUTUBE_HOSTS: [&str; 4] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
];

/// Channel tabs that yt-dlp can enumerate directly.
const CHANNEL_TABS: [&str; 5] = ["videos", "shorts", "streams", "playlists", "featured"];

/// A validated YouTube URL with its detected kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YoutubeUrl {
    pub kind: SourceKind,
    /// Video id, playlist id, channel id, user name or `@handle`.
    pub id: String,
    /// Canonical form handed to the engine.
    pub url: String,
}

/// Pulls every http(s) URL out of pasted text, in order of first appearance.
///
/// Trailing punctuation is peeled off and each hit is normalized through
/// [`normalize_http_url`], so `https://youtu.be/x` and `https://YOUTU.BE/x#t=3`
/// count as the same link.
pub fn extract_urls(text: &str) -> Vec<String> {
    let Ok(candidates) = Regex::new(r"https?://\S+") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    candidates
        .find_iter(text)
        .filter_map(|m| normalize_http_url(trim_trailing_punct(m.as_str())))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// True when a pasted line carries more than one link.
pub fn contains_multiple_urls(text: &str) -> bool {
    extract_urls(text).len() > 1
}

/// Parses an http(s) URL and returns it without its fragment.
///
/// `Url::parse` already lowercases the scheme and host and drops default ports.
pub fn normalize_http_url(input: &str) -> Option<String> {
    let mut url = Url::parse(input.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.into())
}

/// Strips punctuation that prose and chat messages leave glued to a URL,
/// e.g. `https://youtu.be/abc),` -> `https://youtu.be/abc`.
fn trim_trailing_punct(s: &str) -> &str {
    s.trim_end_matches(|ch: char| {
        matches!(ch, ')' | ']' | '}' | '>' | ',' | '.' | ';' | ':' | '!' | '?' | '"' | '\'')
    })
}

/// Classify a YouTube URL as a video, playlist or channel.
///
/// Accepted shapes:
/// - `youtube.com/watch?v=<11 chars>`, `youtu.be/<11 chars>`, `youtube.com/shorts/<11 chars>`
/// - `youtube.com/playlist?list=<id>`
/// - `youtube.com/channel/<id>`, `youtube.com/user/<name>`, `youtube.com/@handle`
///
/// A missing scheme is assumed to be https.
pub fn classify_youtube_url(input: &str) -> Option<YoutubeUrl> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&normalize_http_url(&with_scheme)?).ok()?;
    let host = url.host_str()?;

    if host == "youtu.be" {
        let id = url.path_segments()?.next()?;
        return is_video_id(id).then(|| video(id));
    }
    if !YOUTUBE_HOSTS.contains(&host) {
        return None;
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    let query = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };

    match segments.as_slice() {
        ["watch"] => query("v").filter(|id| is_video_id(id)).map(|id| video(&id)),
        ["shorts", id] if is_video_id(id) => Some(video(id)),
        ["playlist"] => query("list").filter(|id| is_list_id(id)).map(|id| YoutubeUrl {
            kind: SourceKind::Playlist,
            url: format!("https://www.youtube.com/playlist?list={id}"),
            id,
        }),
        ["channel", id, rest @ ..] if is_list_id(id) => Some(channel(&format!("channel/{id}"), id, rest)),
        ["user", name, rest @ ..] if is_list_id(name) => Some(channel(&format!("user/{name}"), name, rest)),
        [handle, rest @ ..] if handle.starts_with('@') && handle.len() > 1 => {
            Some(channel(handle, handle, rest))
        }
        _ => None,
    }
}

/// Validate user input for download. Rejections carry a message for the user.
pub fn validate_download_url(input: &str) -> Result<YoutubeUrl, AppError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Please enter a URL.".to_string()));
    }
    if trimmed.contains("://") && normalize_http_url(trimmed).is_none() {
        return Err(AppError::Validation(format!(
            "Invalid URL: {trimmed}. Example: https://www.youtube.com/watch?v=VIDEO_ID"
        )));
    }
    classify_youtube_url(trimmed).ok_or_else(|| {
        AppError::Validation(format!(
            "Not a supported YouTube URL: {trimmed}. Only YouTube videos, playlists and channels are supported."
        ))
    })
}

pub fn is_youtube_url(input: &str) -> bool {
    classify_youtube_url(input).is_some()
}

fn video(id: &str) -> YoutubeUrl {
    YoutubeUrl {
        kind: SourceKind::Video,
        id: id.to_string(),
        url: format!("https://www.youtube.com/watch?v={id}"),
    }
}

fn channel(base: &str, id: &str, rest: &[&str]) -> YoutubeUrl {
    // The bare channel page lists tabs, not videos; point at the uploads tab.
    let tab = rest
        .first()
        .filter(|t| CHANNEL_TABS.contains(*t))
        .copied()
        .unwrap_or("videos");
    YoutubeUrl {
        kind: SourceKind::Channel,
        id: id.to_string(),
        url: format!("https://www.youtube.com/{base}/{tab}"),
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_video_id(s: &str) -> bool {
    s.len() == 11 && s.chars().all(is_id_char)
}

fn is_list_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_id_char)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paste_keeps_order_and_drops_duplicates() {
        let pasted = "queue these:\nhttps://youtu.be/dQw4w9WgXcQ\n\
                      https://www.youtube.com/watch?v=9bZkp7q1VTk and again https://youtu.be/dQw4w9WgXcQ";
        assert_eq!(
            extract_urls(pasted),
            vec![
                "https://youtu.be/dQw4w9WgXcQ".to_string(),
                "https://www.youtube.com/watch?v=9bZkp7q1VTk".to_string(),
            ]
        );
        assert!(contains_multiple_urls(pasted));
        assert!(!contains_multiple_urls("just https://youtu.be/dQw4w9WgXcQ"));
    }

    #[test]
    fn chat_punctuation_is_peeled_off() {
        let urls = extract_urls("(see https://youtu.be/dQw4w9WgXcQ), thanks!");
        assert_eq!(urls, vec!["https://youtu.be/dQw4w9WgXcQ".to_string()]);
    }

    #[test]
    fn normalization_folds_case_ports_and_fragments() {
        assert_eq!(
            normalize_http_url("HTTPS://WWW.YouTube.com:443/watch?v=dQw4w9WgXcQ#t=42").as_deref(),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
        assert_eq!(
            normalize_http_url("http://youtube.com:80/").as_deref(),
            Some("http://youtube.com/")
        );
    }

    #[test]
    fn classifies_video_urls() {
        for input in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ#comments",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
        ] {
            let parsed = classify_youtube_url(input).unwrap_or_else(|| panic!("{input}"));
            assert_eq!(parsed.kind, SourceKind::Video);
            assert_eq!(parsed.id, "dQw4w9WgXcQ");
            assert_eq!(parsed.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        }
    }

    #[test]
    fn classifies_playlists_and_channels() {
        let pl = classify_youtube_url("https://www.youtube.com/playlist?list=PLabc_123-x").unwrap();
        assert_eq!(pl.kind, SourceKind::Playlist);
        assert_eq!(pl.id, "PLabc_123-x");

        let ch = classify_youtube_url("https://www.youtube.com/channel/UC123abc").unwrap();
        assert_eq!(ch.kind, SourceKind::Channel);
        assert_eq!(ch.url, "https://www.youtube.com/channel/UC123abc/videos");

        let user = classify_youtube_url("https://www.youtube.com/user/someone/shorts").unwrap();
        assert_eq!(user.url, "https://www.youtube.com/user/someone/shorts");

        let handle = classify_youtube_url("https://www.youtube.com/@SomeCreator").unwrap();
        assert_eq!(handle.kind, SourceKind::Channel);
        assert_eq!(handle.id, "@SomeCreator");
    }

    #[test]
    fn rejects_non_youtube_and_malformed_ids() {
        assert!(classify_youtube_url("https://vimeo.com/12345").is_none());
        assert!(classify_youtube_url("https://youtu.be/short").is_none());
        assert!(classify_youtube_url("https://www.youtube.com/watch?v=").is_none());
        assert!(classify_youtube_url("https://notyoutube.com/watch?v=dQw4w9WgXcQ").is_none());
        assert!(!is_youtube_url("ftp://youtube.com/watch?v=dQw4w9WgXcQ"));
    }

    #[test]
    fn validation_messages() {
        assert!(matches!(validate_download_url("   "), Err(AppError::Validation(_))));
        let err = validate_download_url("https://example.com/video").unwrap_err();
        assert!(err.to_string().contains("YouTube"));
        assert!(validate_download_url(" https://youtu.be/dQw4w9WgXcQ ").is_ok());
    }

    #[test]
    fn ignores_non_http_schemes() {
        let urls = extract_urls("ftp://example.com/x https://example.com/y");
        assert_eq!(urls, vec!["https://example.com/y".to_string()]);
    }
}
