use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle states reported by the station backend. Only a subset counts
/// as live for scheduling purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrandStatus {
    WaitingForCurator,
    OnLine,
    WarmingUp,
    Idle,
    QueueSaturated,
}

impl BrandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BrandStatus::WaitingForCurator => "WAITING_FOR_CURATOR",
            BrandStatus::OnLine => "ON_LINE",
            BrandStatus::WarmingUp => "WARMING_UP",
            BrandStatus::Idle => "IDLE",
            BrandStatus::QueueSaturated => "QUEUE_SATURATED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Brand {
    #[serde(rename = "radioStationName")]
    pub slug: String,
    #[serde(rename = "radioStationStatus")]
    pub status: BrandStatus,
    #[serde(default)]
    pub talkativity: Option<f64>,
}

/// Source of truth for which brands need a worker right now.
#[async_trait]
pub trait BrandDirectory: Send + Sync {
    async fn live_brands(&self) -> Result<Vec<Brand>>;
}

pub struct RestBrandDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl RestBrandDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BrandDirectory for RestBrandDirectory {
    async fn live_brands(&self) -> Result<Vec<Brand>> {
        let url = format!("{}/ai/brands/status", self.base_url);
        let res = self
            .client
            .get(&url)
            .timeout(POLL_TIMEOUT)
            .query(&[
                ("status", BrandStatus::WaitingForCurator.as_str()),
                ("status", BrandStatus::OnLine.as_str()),
                ("status", BrandStatus::WarmingUp.as_str()),
            ])
            .send()
            .await
            .context("Failed to query brand statuses")?;

        if !res.status().is_success() {
            anyhow::bail!("Brand status endpoint returned {}", res.status());
        }

        let brands: Vec<Brand> = res
            .json()
            .await
            .context("Failed to parse brand status response")?;
        debug!("Brand directory reports {} live brand(s)", brands.len());
        Ok(brands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_wire_names() {
        let s: BrandStatus = serde_json::from_str("\"WAITING_FOR_CURATOR\"").unwrap();
        assert_eq!(s, BrandStatus::WaitingForCurator);
        assert_eq!(
            serde_json::to_string(&BrandStatus::WarmingUp).unwrap(),
            "\"WARMING_UP\""
        );
    }

    #[test]
    fn brand_parses_backend_fields() {
        let raw = r#"{
            "radioStationName": "aizoo",
            "radioStationStatus": "ON_LINE",
            "talkativity": 0.6
        }"#;
        let brand: Brand = serde_json::from_str(raw).unwrap();
        assert_eq!(brand.slug, "aizoo");
        assert_eq!(brand.status, BrandStatus::OnLine);
        assert_eq!(brand.talkativity, Some(0.6));
    }

    #[test]
    fn talkativity_is_optional() {
        let raw = r#"{"radioStationName": "beta", "radioStationStatus": "WARMING_UP"}"#;
        let brand: Brand = serde_json::from_str(raw).unwrap();
        assert!(brand.talkativity.is_none());
    }
}
