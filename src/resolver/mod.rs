//! Source resolution: play-command input into a playable stream descriptor.
//!
//! Resolution is side-effect free apart from at most one search-provider
//! call. It never fetches or parses third-party pages: when no direct stream
//! URL can be determined, the result is `NeedsManualOpen` and the caller
//! presents the link for the user to open themselves.

pub mod youtube;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::ChatId;

/// Path fragments accepted as directly playable streams.
const STREAM_EXTS: [&str; 8] = [
    ".m3u8", ".mp3", ".aac", ".m4a", ".ogg", ".opus", ".flac", ".wav",
];

/// URL fragments that identify watch pages. These need a full player and
/// never expose a raw stream, so they always go down the manual-open path.
const WATCH_PAGE_MARKERS: [&str; 3] = ["youtube.com/watch", "youtu.be/", "music.youtube.com/"];

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    DirectUrl,
    SearchQuery,
}

/// A classified play command, before resolution.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub chat_id: ChatId,
    pub requester: String,
    pub raw_input: String,
    pub kind: RequestKind,
}

impl PlayRequest {
    /// Classify raw user input. Anything that starts with an http(s) scheme
    /// is a direct-URL request; everything else is a search query.
    pub fn classify(
        chat_id: ChatId,
        requester: impl Into<String>,
        raw_input: &str,
    ) -> Result<Self, ResolveError> {
        let trimmed = raw_input.trim();
        if trimmed.is_empty() {
            return Err(ResolveError::InvalidInput("empty play input".to_string()));
        }
        let kind = if is_url(trimmed) {
            RequestKind::DirectUrl
        } else {
            RequestKind::SearchQuery
        };
        Ok(Self {
            chat_id,
            requester: requester.into(),
            raw_input: trimmed.to_string(),
            kind,
        })
    }
}

// ============================================================================
// Resolved track
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    DirectStream,
    SearchResult,
}

/// A track ready to hand to the transcoder.
#[derive(Debug, Clone)]
pub struct ResolvedTrack {
    pub title: String,
    pub stream_url: String,
    pub duration_hint: Option<Duration>,
    pub source_kind: SourceKind,
    /// The request this track came from, kept for attribution.
    pub origin: PlayRequest,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid play input: {0}")]
    InvalidInput(String),

    #[error("search provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("no results")]
    NotFound,

    /// No direct stream could be resolved without scraping; the caller
    /// should present the link for the user to open manually.
    #[error("no direct stream; open manually: {link}")]
    NeedsManualOpen { link: String },
}

// ============================================================================
// Search provider seam
// ============================================================================

/// One search hit. `direct_stream_url` is set only when the provider itself
/// hands back a playable stream, which watch-page providers never do.
#[derive(Debug, Clone)]
pub struct SearchCandidate {
    pub title: String,
    pub link: String,
    pub direct_stream_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned malformed data: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, ProviderError>;
}

// ============================================================================
// Resolver
// ============================================================================

pub struct Resolver {
    provider: Option<Arc<dyn SearchProvider>>,
}

impl Resolver {
    pub fn new(provider: Option<Arc<dyn SearchProvider>>) -> Self {
        Self { provider }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn resolve(&self, request: &PlayRequest) -> Result<ResolvedTrack, ResolveError> {
        match request.kind {
            RequestKind::DirectUrl => self.resolve_direct(request),
            RequestKind::SearchQuery => self.resolve_search(request).await,
        }
    }

    fn resolve_direct(&self, request: &PlayRequest) -> Result<ResolvedTrack, ResolveError> {
        let input = request.raw_input.as_str();
        let parsed = Url::parse(input)
            .map_err(|e| ResolveError::InvalidInput(format!("malformed URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ResolveError::InvalidInput(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        if is_stream_url(input) {
            return Ok(ResolvedTrack {
                title: display_title(&parsed),
                stream_url: input.to_string(),
                duration_hint: None,
                source_kind: SourceKind::DirectStream,
                origin: request.clone(),
            });
        }
        if is_watch_page(input) {
            return Err(ResolveError::NeedsManualOpen {
                link: input.to_string(),
            });
        }
        Err(ResolveError::InvalidInput(
            "URL is not a recognized audio stream format".to_string(),
        ))
    }

    async fn resolve_search(&self, request: &PlayRequest) -> Result<ResolvedTrack, ResolveError> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            ResolveError::ProviderUnavailable("no search provider configured".to_string())
        })?;
        let candidates = provider
            .search(&request.raw_input)
            .await
            .map_err(|e| ResolveError::ProviderUnavailable(e.to_string()))?;
        let top = candidates.into_iter().next().ok_or(ResolveError::NotFound)?;
        match top.direct_stream_url {
            Some(stream_url) => Ok(ResolvedTrack {
                title: top.title,
                stream_url,
                duration_hint: None,
                source_kind: SourceKind::SearchResult,
                origin: request.clone(),
            }),
            None => Err(ResolveError::NeedsManualOpen { link: top.link }),
        }
    }
}

// ============================================================================
// URL classification helpers
// ============================================================================

pub fn is_url(input: &str) -> bool {
    let lower = input.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

pub fn is_stream_url(input: &str) -> bool {
    if !is_url(input) {
        return false;
    }
    let lower = input.to_ascii_lowercase();
    STREAM_EXTS.iter().any(|ext| lower.contains(ext))
}

pub fn is_watch_page(input: &str) -> bool {
    let lower = input.to_ascii_lowercase();
    WATCH_PAGE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Human-readable title for a bare stream URL: last path segment, falling
/// back to the host.
fn display_title(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .or_else(|| url.host_str().map(|host| host.to_string()))
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider {
        candidates: Vec<SearchCandidate>,
    }

    #[async_trait]
    impl SearchProvider for StaticProvider {
        async fn search(&self, _query: &str) -> Result<Vec<SearchCandidate>, ProviderError> {
            Ok(self.candidates.clone())
        }
    }

    fn request(input: &str) -> PlayRequest {
        PlayRequest::classify(1, "tester", input).unwrap()
    }

    #[test]
    fn classifies_urls_and_queries() {
        assert_eq!(request("https://a.com/x.mp3").kind, RequestKind::DirectUrl);
        assert_eq!(request("HTTP://a.com/x.mp3").kind, RequestKind::DirectUrl);
        assert_eq!(request("never gonna give you up").kind, RequestKind::SearchQuery);
        assert_eq!(request("ftp://a.com/x.mp3").kind, RequestKind::SearchQuery);
    }

    #[test]
    fn rejects_empty_input() {
        let err = PlayRequest::classify(1, "tester", "   ").unwrap_err();
        assert!(matches!(err, ResolveError::InvalidInput(_)));
    }

    #[test]
    fn stream_url_detection() {
        assert!(is_stream_url("https://radio.example/live.m3u8"));
        assert!(is_stream_url("https://cdn.example/song.MP3?token=abc"));
        assert!(!is_stream_url("https://example.com/page"));
        assert!(!is_stream_url("song.mp3"));
    }

    #[tokio::test]
    async fn direct_stream_resolves_with_title() {
        let resolver = Resolver::new(None);
        let track = resolver
            .resolve(&request("https://cdn.example/albums/song.mp3"))
            .await
            .unwrap();
        assert_eq!(track.title, "song.mp3");
        assert_eq!(track.source_kind, SourceKind::DirectStream);
        assert_eq!(track.origin.requester, "tester");
    }

    #[tokio::test]
    async fn watch_page_url_needs_manual_open() {
        let resolver = Resolver::new(None);
        let err = resolver
            .resolve(&request("https://www.youtube.com/watch?v=abc123"))
            .await
            .unwrap_err();
        match err {
            ResolveError::NeedsManualOpen { link } => {
                assert_eq!(link, "https://www.youtube.com/watch?v=abc123");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrecognized_url_is_invalid() {
        let resolver = Resolver::new(None);
        let err = resolver
            .resolve(&request("https://example.com/article"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn search_without_provider_is_unavailable() {
        let resolver = Resolver::new(None);
        let err = resolver.resolve(&request("lofi beats")).await.unwrap_err();
        assert!(matches!(err, ResolveError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn search_with_no_hits_is_not_found() {
        let resolver = Resolver::new(Some(Arc::new(StaticProvider { candidates: vec![] })));
        let err = resolver.resolve(&request("lofi beats")).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound));
    }

    #[tokio::test]
    async fn top_candidate_without_stream_needs_manual_open() {
        let provider = StaticProvider {
            candidates: vec![SearchCandidate {
                title: "Lofi Mix".to_string(),
                link: "https://www.youtube.com/watch?v=xyz".to_string(),
                direct_stream_url: None,
            }],
        };
        let resolver = Resolver::new(Some(Arc::new(provider)));
        let err = resolver.resolve(&request("lofi beats")).await.unwrap_err();
        match err {
            ResolveError::NeedsManualOpen { link } => {
                assert_eq!(link, "https://www.youtube.com/watch?v=xyz");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn top_candidate_with_stream_resolves() {
        let provider = StaticProvider {
            candidates: vec![
                SearchCandidate {
                    title: "Net Radio".to_string(),
                    link: "https://radio.example/about".to_string(),
                    direct_stream_url: Some("https://radio.example/live.m3u8".to_string()),
                },
                SearchCandidate {
                    title: "Second Hit".to_string(),
                    link: "https://other.example".to_string(),
                    direct_stream_url: None,
                },
            ],
        };
        let resolver = Resolver::new(Some(Arc::new(provider)));
        let track = resolver.resolve(&request("net radio")).await.unwrap();
        assert_eq!(track.title, "Net Radio");
        assert_eq!(track.stream_url, "https://radio.example/live.m3u8");
        assert_eq!(track.source_kind, SourceKind::SearchResult);
    }
}
