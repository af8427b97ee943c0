use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueuePayload<'a> {
    merging_method: &'a str,
    sound_fragments: &'a BTreeMap<String, String>,
    file_paths: &'a BTreeMap<String, String>,
    priority: u32,
}

/// Hands a finished merge plan to the broadcast queue. Both operations
/// collapse every failure to `false`; nothing here retries.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Multi-slot enqueue: slot name -> fragment id plus slot name -> local
    /// audio path, merged server-side according to `merging_method`.
    async fn enqueue(
        &self,
        brand: &str,
        merging_method: &str,
        sound_fragments: &BTreeMap<String, String>,
        file_paths: &BTreeMap<String, String>,
        priority: u32,
    ) -> bool;

    /// Brand/song-scoped enqueue used for a single fragment, optionally
    /// preceded by a spoken intro uploaded alongside it.
    async fn enqueue_single(&self, brand: &str, fragment_id: &str, intro_audio: Option<Bytes>)
    -> bool;
}

/// REST side of the broadcast queue. One call per run, no retries here;
/// every failure mode is logged distinctly and collapses to `false`.
pub struct QueueGateway {
    client: reqwest::Client,
    base_url: String,
}

impl QueueGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn classify(
        &self,
        brand: &str,
        subject: &str,
        url: &str,
        outcome: reqwest::Result<reqwest::Response>,
    ) -> bool {
        match outcome {
            Ok(res) if res.status().is_success() => {
                info!("Queue accepted {} for '{}'", subject, brand);
                true
            }
            Ok(res) => {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                error!(
                    "Queue HTTP error for '{}' ({}): status {}, body: {}",
                    brand, subject, status, body
                );
                false
            }
            Err(e) if e.is_timeout() => {
                error!("Queue timeout for '{}' ({}): {}", brand, subject, e);
                false
            }
            Err(e) if e.is_connect() => {
                error!(
                    "Queue connection error for '{}' ({}) at {}: {}",
                    brand, subject, url, e
                );
                false
            }
            Err(e) => {
                error!("Queue request error for '{}' ({}): {}", brand, subject, e);
                false
            }
        }
    }
}

#[async_trait]
impl Broadcaster for QueueGateway {
    async fn enqueue(
        &self,
        brand: &str,
        merging_method: &str,
        sound_fragments: &BTreeMap<String, String>,
        file_paths: &BTreeMap<String, String>,
        priority: u32,
    ) -> bool {
        let process_id = Uuid::new_v4().simple().to_string();
        let url = format!("{}/{}/queue/add", self.base_url, brand);
        let payload = EnqueuePayload {
            merging_method,
            sound_fragments,
            file_paths,
            priority,
        };
        info!(
            "Enqueueing {} for '{}' (process {}, {} fragment slot(s))",
            merging_method,
            brand,
            process_id,
            sound_fragments.len()
        );

        let outcome = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .query(&[("processId", process_id.as_str())])
            .json(&payload)
            .send()
            .await;
        self.classify(brand, merging_method, &url, outcome).await
    }

    async fn enqueue_single(
        &self,
        brand: &str,
        fragment_id: &str,
        intro_audio: Option<Bytes>,
    ) -> bool {
        let url = format!("{}/{}/queue/{}", self.base_url, brand, fragment_id);
        info!("Enqueueing fragment {} for '{}'", fragment_id, brand);

        let mut form = multipart::Form::new().text("song_uuid", fragment_id.to_string());
        if let Some(audio) = intro_audio {
            let part = match multipart::Part::stream(audio)
                .file_name("intro.mp3")
                .mime_str("audio/mpeg")
            {
                Ok(part) => part,
                Err(e) => {
                    error!("Failed to build intro part for {}: {}", fragment_id, e);
                    return false;
                }
            };
            form = form.part("intro_audio", part);
        }

        let outcome = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .multipart(form)
            .send()
            .await;
        self.classify(brand, fragment_id, &url, outcome).await
    }
}
