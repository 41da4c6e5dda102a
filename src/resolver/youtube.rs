//! YouTube Data API v3 search provider.
//!
//! Metadata only: the Data API returns titles and video ids, never playable
//! streams, so every candidate from this provider carries
//! `direct_stream_url: None` and ends up as a manual-open link.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{ProviderError, SearchCandidate, SearchProvider};

const DEFAULT_ENDPOINT: &str = "https://www.googleapis.com/youtube/v3/search";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct YouTubeSearch {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    max_results: u8,
}

impl YouTubeSearch {
    /// Returns `None` when no API key is configured. The resolver then
    /// reports `ProviderUnavailable` and play commands fall back to
    /// manual-open search links.
    pub fn from_key(
        api_key: Option<String>,
        endpoint: Option<String>,
        max_results: u8,
    ) -> Option<Self> {
        let api_key = api_key.filter(|key| !key.trim().is_empty())?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .ok()?;
        Some(Self {
            client,
            api_key,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            max_results: max_results.max(1),
        })
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: ItemId,
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
struct ItemId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    title: String,
}

fn to_candidates(response: SearchResponse) -> Vec<SearchCandidate> {
    response
        .items
        .into_iter()
        .filter_map(|item| {
            let video_id = item.id.video_id?;
            Some(SearchCandidate {
                title: item.snippet.title,
                link: format!("https://www.youtube.com/watch?v={video_id}"),
                direct_stream_url: None,
            })
        })
        .collect()
}

#[async_trait]
impl SearchProvider for YouTubeSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>, ProviderError> {
        let mut url =
            Url::parse(&self.endpoint).map_err(|e| ProviderError::Request(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("part", "snippet")
            .append_pair("q", query)
            .append_pair("type", "video")
            .append_pair("maxResults", &self.max_results.to_string())
            .append_pair("key", &self.api_key);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::Request(format!(
                "search API returned {}",
                response.status()
            )));
        }
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let candidates = to_candidates(body);
        debug!(count = candidates.len(), "search complete");
        Ok(candidates)
    }
}
