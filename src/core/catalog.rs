use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::mcp::McpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FragmentType {
    Song,
    Advertisement,
    Jingle,
}

impl FragmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            FragmentType::Song => "SONG",
            FragmentType::Advertisement => "ADVERTISEMENT",
            FragmentType::Jingle => "JINGLE",
        }
    }
}

impl Default for FragmentType {
    fn default() -> Self {
        FragmentType::Song
    }
}

/// A playable catalog item plus the scratch fields one pipeline run fills
/// in. The scratch fields never travel over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoundFragment {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub fragment_type: FragmentType,
    #[serde(rename = "playedCount", default)]
    pub played_count: u64,
    #[serde(rename = "lastTimePlayed", default)]
    pub last_played: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub draft: Option<String>,
    #[serde(skip)]
    pub intro_text: Option<String>,
    #[serde(skip)]
    pub audio: Option<Bytes>,
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
}

/// A scheduled happening the backend wants worked into the show.
#[derive(Debug, Clone, Deserialize)]
pub struct BrandEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl BrandEvent {
    pub fn is_ad(&self) -> bool {
        self.kind == "AD"
    }
}

/// Brand-scoped content lookups, abstracted so the pipeline can be driven
/// against a scripted source in tests.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn fetch_fragments(
        &self,
        brand: &str,
        fragment_type: FragmentType,
        size: usize,
    ) -> Result<Vec<SoundFragment>>;

    async fn pending_events(&self, brand: &str) -> Result<Vec<BrandEvent>>;
}

/// Catalog access over the MCP tools server.
pub struct McpCatalogClient {
    client: Arc<McpClient>,
}

impl McpCatalogClient {
    pub fn new(client: Arc<McpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CatalogClient for McpCatalogClient {
    async fn fetch_fragments(
        &self,
        brand: &str,
        fragment_type: FragmentType,
        size: usize,
    ) -> Result<Vec<SoundFragment>> {
        let result = self
            .client
            .call_tool(
                "get_brand_sound_fragments",
                json!({
                    "brand": brand,
                    "page": 1,
                    "size": size,
                    "types": fragment_type.as_str(),
                }),
            )
            .await
            .with_context(|| format!("Failed to fetch {} fragments for '{}'", fragment_type.as_str(), brand))?;

        let fragments = match result.get("fragments") {
            Some(raw) => serde_json::from_value::<Vec<SoundFragment>>(raw.clone())
                .context("Malformed fragment list from catalog")?,
            None => {
                warn!("Catalog response for '{}' carried no fragments", brand);
                Vec::new()
            }
        };
        debug!(
            "Fetched {} {} fragment(s) for '{}'",
            fragments.len(),
            fragment_type.as_str(),
            brand
        );
        Ok(fragments)
    }

    async fn pending_events(&self, brand: &str) -> Result<Vec<BrandEvent>> {
        let result = self
            .client
            .call_tool(
                "get_memory_by_type",
                json!({ "brand": brand, "types": ["EVENT"] }),
            )
            .await
            .with_context(|| format!("Failed to fetch events for '{}'", brand))?;

        let events = match result.get("EVENT") {
            Some(raw) => serde_json::from_value::<Vec<BrandEvent>>(raw.clone())
                .context("Malformed event list from memory")?,
            None => Vec::new(),
        };
        Ok(events)
    }
}

struct CacheEntry {
    fragments: Vec<SoundFragment>,
    hits: u32,
}

/// Per-(brand, type) fragment cache. Data is refreshed when absent or when
/// the entry has served `refresh_after_hits` lookups; the counter resets to
/// 1 on every refresh. Candidates are kept sorted least-played first, then
/// longest-unplayed (never-played sorts before everything).
pub struct RotationCache {
    entries: Mutex<HashMap<(String, FragmentType), CacheEntry>>,
    refresh_after_hits: u32,
    page_size: usize,
}

impl RotationCache {
    pub fn new(refresh_after_hits: u32, page_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            refresh_after_hits,
            page_size,
        }
    }

    pub async fn get(
        &self,
        brand: &str,
        fragment_type: FragmentType,
        source: &dyn CatalogClient,
    ) -> Result<Vec<SoundFragment>> {
        let mut entries = self.entries.lock().await;
        let key = (brand.to_string(), fragment_type);

        if let Some(entry) = entries.get_mut(&key) {
            entry.hits += 1;
            if entry.hits >= self.refresh_after_hits {
                info!(
                    "Rotation cache for '{}'/{} served {} hits, refreshing",
                    brand,
                    fragment_type.as_str(),
                    entry.hits
                );
                entry.fragments =
                    Self::fetch_sorted(source, brand, fragment_type, self.page_size).await?;
                entry.hits = 1;
            }
            return Ok(entry.fragments.clone());
        }

        let fragments = Self::fetch_sorted(source, brand, fragment_type, self.page_size).await?;
        entries.insert(
            key,
            CacheEntry {
                fragments: fragments.clone(),
                hits: 1,
            },
        );
        Ok(fragments)
    }

    async fn fetch_sorted(
        source: &dyn CatalogClient,
        brand: &str,
        fragment_type: FragmentType,
        size: usize,
    ) -> Result<Vec<SoundFragment>> {
        let mut fragments = source.fetch_fragments(brand, fragment_type, size).await?;
        // The backend already orders for rotation; re-sorting keeps the
        // guarantee when a server predates it.
        fragments.sort_by_key(|f| (f.played_count, f.last_played));
        Ok(fragments)
    }
}

#[derive(Debug, Clone)]
pub struct PlayedEntry {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub intro: Option<String>,
}

/// Per-brand FIFO of recently selected fragments, bounded by the song
/// cooldown window. Selection filters candidates against it so a fragment
/// re-enters rotation only after eviction.
pub struct PlayHistory {
    entries: Mutex<HashMap<String, VecDeque<PlayedEntry>>>,
    capacity: usize,
}

impl PlayHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Most recently selected fragment for the brand, if any.
    pub async fn last(&self, brand: &str) -> Option<PlayedEntry> {
        let entries = self.entries.lock().await;
        entries.get(brand).and_then(|h| h.back().cloned())
    }

    /// Picks up to `count` candidates not in the cooldown window and records
    /// them. When every candidate is in cooldown the unfiltered list is used
    /// instead so a small catalog never starves the brand.
    pub async fn select(
        &self,
        brand: &str,
        candidates: &[SoundFragment],
        count: usize,
    ) -> Vec<SoundFragment> {
        let mut entries = self.entries.lock().await;
        let history = entries.entry(brand.to_string()).or_default();

        let recent: Vec<String> = history.iter().map(|e| e.id.clone()).collect();
        let mut picked: Vec<SoundFragment> = candidates
            .iter()
            .filter(|f| !recent.contains(&f.id))
            .take(count)
            .cloned()
            .collect();

        if picked.is_empty() && !candidates.is_empty() {
            debug!(
                "All {} candidate(s) for '{}' are cooling down, reusing rotation head",
                candidates.len(),
                brand
            );
            picked = candidates.iter().take(count).cloned().collect();
        }

        for fragment in &picked {
            history.push_back(PlayedEntry {
                id: fragment.id.clone(),
                title: fragment.title.clone(),
                artist: fragment.artist.clone(),
                intro: None,
            });
            while history.len() > self.capacity {
                history.pop_front();
            }
        }
        picked
    }

    /// Attaches the spoken intro to the newest history entry for the
    /// fragment, so the next draft can reference what was just said.
    pub async fn record_intro(&self, brand: &str, fragment_id: &str, text: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(history) = entries.get_mut(brand)
            && let Some(entry) = history.iter_mut().rev().find(|e| e.id == fragment_id)
        {
            entry.intro = Some(text.to_string());
        }
    }
}
