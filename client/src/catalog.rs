use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::constants::{VERSION, YOUTUBE_SEARCH_API};
use crate::error::SyncError;

/// Source of a substitute stream once the current one ends
#[async_trait]
pub trait StreamCatalog: Send + Sync {
    /// Failures collapse to `None`
    async fn fetch_replacement(&self) -> Option<String>;
}

/// Catalog used when no lookup is configured
pub struct NoCatalog;

#[async_trait]
impl StreamCatalog for NoCatalog {
    async fn fetch_replacement(&self) -> Option<String> {
        None
    }
}

/// Finds the live broadcast currently running on a YouTube channel
pub struct YouTubeCatalog {
    client: reqwest::Client,
    api_key: String,
    channel_id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
}

#[derive(Debug, Deserialize)]
struct SearchItemId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

impl YouTubeCatalog {
    pub fn new(api_key: String, channel_id: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("SyncRoom-Client/{VERSION}"))
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key,
            channel_id,
        })
    }

    fn search_url(&self) -> Result<Url> {
        Url::parse_with_params(
            YOUTUBE_SEARCH_API,
            &[
                ("part", "snippet"),
                ("channelId", self.channel_id.as_str()),
                ("eventType", "live"),
                ("type", "video"),
                ("key", self.api_key.as_str()),
            ],
        )
        .context("Failed to build search URL")
    }

    async fn search_live(&self) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.search_url()?)
            .send()
            .await
            .context("Failed to query live broadcasts")?;

        if !response.status().is_success() {
            anyhow::bail!("YouTube API returned status: {}", response.status());
        }

        let results: SearchResponse = response
            .json()
            .await
            .context("Failed to parse search results")?;
        Ok(first_live_video(results))
    }
}

#[async_trait]
impl StreamCatalog for YouTubeCatalog {
    async fn fetch_replacement(&self) -> Option<String> {
        match self.search_live().await {
            Ok(Some(video_id)) => Some(video_id),
            Ok(None) => {
                tracing::info!("No live broadcast found: {}", SyncError::ReplacementStreamUnavailable);
                None
            }
            Err(e) => {
                tracing::warn!("Error fetching new live video: {:#}", e);
                None
            }
        }
    }
}

fn first_live_video(results: SearchResponse) -> Option<String> {
    results
        .items
        .into_iter()
        .find_map(|item| item.id.video_id.filter(|id| !id.is_empty()))
}
