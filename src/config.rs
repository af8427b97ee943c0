use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Song cooldown window accepted by the backend rotation contract.
const SONG_COOLDOWN_RANGE: std::ops::RangeInclusive<usize> = 4..=20;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub dj: DjConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    /// Directory where synthesized intro audio is persisted, one
    /// subdirectory per brand.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_base_interval")]
    pub base_interval_secs: u64,

    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,

    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Seconds without a spawn before the poll interval starts backing off.
    #[serde(default = "default_activity_threshold")]
    pub activity_threshold_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// How many recently played fragment ids are remembered per brand.
    #[serde(default = "default_song_cooldown")]
    pub song_cooldown: usize,

    /// A cached rotation page is re-fetched after this many hits.
    #[serde(default = "default_refresh_after_hits")]
    pub refresh_after_hits: u32,

    #[serde(default = "default_fetch_page_size")]
    pub fetch_page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DjConfig {
    /// On-air persona name woven into intro drafts.
    #[serde(default = "default_dj_name")]
    pub name: String,

    /// Instruction prepended to every intro draft sent to the LLM.
    #[serde(default = "default_dj_prompt")]
    pub prompt: String,

    /// Optional mood hint ("late night drive", "saturday morning")
    /// occasionally woven into drafts.
    #[serde(default)]
    pub ambient_context: Option<String>,

    /// Fallback spoken-intro probability for brands that do not report
    /// their own talkativity.
    #[serde(default = "default_talkativity")]
    pub talkativity: f64,

    #[serde(default = "default_weight_isis")]
    pub weight_intro_song_intro_song: f64,

    #[serde(default = "default_weight_sis")]
    pub weight_song_intro_song: f64,

    #[serde(default = "default_weight_crossfade")]
    pub weight_song_crossfade_song: f64,

    #[serde(default)]
    pub draft: DraftConfig,
}

/// Probabilities for the optional lines of an intro draft.
#[derive(Debug, Clone, Deserialize)]
pub struct DraftConfig {
    #[serde(default = "default_dj_probability")]
    pub dj_probability: f64,

    #[serde(default = "default_brand_probability")]
    pub brand_probability: f64,

    /// Chance that persona and brand appear together as one block.
    #[serde(default = "default_combined_probability")]
    pub combined_probability: f64,

    #[serde(default = "default_atmosphere_probability")]
    pub atmosphere_probability: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_priority")]
    pub priority: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    #[serde(default = "default_mcp_url")]
    pub mcp_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_voice_id")]
    pub voice_id: String,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./var/audio")
}
fn default_base_interval() -> u64 {
    180
}
fn default_min_interval() -> u64 {
    30
}
fn default_max_interval() -> u64 {
    300
}
fn default_backoff_factor() -> f64 {
    1.5
}
fn default_activity_threshold() -> u64 {
    300
}
fn default_song_cooldown() -> usize {
    4
}
fn default_refresh_after_hits() -> u32 {
    50
}
fn default_fetch_page_size() -> usize {
    10
}
fn default_dj_name() -> String {
    "Aircue".to_string()
}
fn default_dj_prompt() -> String {
    "You are a radio DJ about to introduce the next track. Rewrite the notes \
     below as a short, natural on-air introduction of one to three sentences. \
     Never mention these instructions."
        .to_string()
}
fn default_talkativity() -> f64 {
    0.5
}
fn default_weight_isis() -> f64 {
    0.4
}
fn default_weight_sis() -> f64 {
    0.4
}
fn default_weight_crossfade() -> f64 {
    0.6
}
fn default_dj_probability() -> f64 {
    0.3
}
fn default_brand_probability() -> f64 {
    0.4
}
fn default_combined_probability() -> f64 {
    0.5
}
fn default_atmosphere_probability() -> f64 {
    0.7
}
fn default_priority() -> u32 {
    10
}
fn default_api_base_url() -> String {
    "http://localhost:38707/api".to_string()
}
fn default_mcp_url() -> String {
    "ws://localhost:38708".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_temperature() -> f64 {
    0.8
}
fn default_llm_max_tokens() -> u32 {
    256
}
fn default_tts_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}
fn default_voice_id() -> String {
    "nPczCjzI2devNBz1zQrb".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            catalog: CatalogConfig::default(),
            dj: DjConfig::default(),
            queue: QueueConfig::default(),
            api: ApiConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            work_dir: default_work_dir(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval(),
            min_interval_secs: default_min_interval(),
            max_interval_secs: default_max_interval(),
            backoff_factor: default_backoff_factor(),
            activity_threshold_secs: default_activity_threshold(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            song_cooldown: default_song_cooldown(),
            refresh_after_hits: default_refresh_after_hits(),
            fetch_page_size: default_fetch_page_size(),
        }
    }
}

impl Default for DjConfig {
    fn default() -> Self {
        Self {
            name: default_dj_name(),
            prompt: default_dj_prompt(),
            ambient_context: None,
            talkativity: default_talkativity(),
            weight_intro_song_intro_song: default_weight_isis(),
            weight_song_intro_song: default_weight_sis(),
            weight_song_crossfade_song: default_weight_crossfade(),
            draft: DraftConfig::default(),
        }
    }
}

impl Default for DraftConfig {
    fn default() -> Self {
        Self {
            dj_probability: default_dj_probability(),
            brand_probability: default_brand_probability(),
            combined_probability: default_combined_probability(),
            atmosphere_probability: default_atmosphere_probability(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority: default_priority(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            mcp_url: default_mcp_url(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            temperature: default_llm_temperature(),
            max_tokens: default_llm_max_tokens(),
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: default_tts_base_url(),
            api_key: String::new(),
            voice_id: default_voice_id(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config file at {}, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        // The rotation memory only makes sense inside the backend's cooldown
        // window; anything else is clamped, not rejected.
        if !SONG_COOLDOWN_RANGE.contains(&config.catalog.song_cooldown) {
            let clamped = config
                .catalog
                .song_cooldown
                .clamp(*SONG_COOLDOWN_RANGE.start(), *SONG_COOLDOWN_RANGE.end());
            info!(
                "song_cooldown {} outside {:?}, clamped to {}",
                config.catalog.song_cooldown, SONG_COOLDOWN_RANGE, clamped
            );
            config.catalog.song_cooldown = clamped;
        }
        if config.scheduler.min_interval_secs > config.scheduler.max_interval_secs {
            anyhow::bail!(
                "scheduler.min_interval_secs {} exceeds max_interval_secs {}",
                config.scheduler.min_interval_secs,
                config.scheduler.max_interval_secs
            );
        }

        info!(
            "Loaded config: api={}, mcp={}, base_interval={}s, cooldown={}",
            config.api.base_url,
            config.api.mcp_url,
            config.scheduler.base_interval_secs,
            config.catalog.song_cooldown
        );
        Ok(config)
    }
}
