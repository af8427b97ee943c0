//! The DJ content pipeline: everything that happens between a wake-up and
//! a broadcast for one brand.
//!
//! A run is a small state machine ([Step]); each wake-up fetches rotation
//! candidates, picks a merge shape, writes and voices the intro text, and
//! hands the result to the broadcast queue. Runs never propagate errors
//! upward: every failure either downgrades the merge plan to whatever is
//! still broadcastable or ends the run with `broadcast_success = false`.

mod draft;
mod types;

pub use types::{MergeType, RunState, Step, next_step};

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, DjConfig};
use crate::core::brands::Brand;
use crate::core::catalog::{
    CatalogClient, FragmentType, PlayHistory, RotationCache, SoundFragment,
};
use crate::core::llm::{ChatMessage, LlmProvider};
use crate::core::queue::Broadcaster;
use crate::core::tts::SpeechSynthesizer;
use types::intro_targets;

/// What a worker reports when its run finishes. `subject` names the brand
/// on success and the lead fragment title when the run fell short.
#[derive(Debug)]
pub struct RunOutcome {
    pub broadcast_success: bool,
    pub subject: String,
    pub artist: String,
}

/// Picks the merge shape for a run. One fragment always ships as a plain
/// intro+song; quiet runs never speak, so two fragments crossfade. Everything
/// else is drawn from the configured weights.
pub(crate) fn choose_merge_type<R: Rng>(
    rng: &mut R,
    config: &DjConfig,
    fragment_count: usize,
    quiet: bool,
) -> MergeType {
    if fragment_count < 2 {
        return MergeType::IntroSong;
    }
    if quiet {
        return MergeType::SongCrossfadeSong;
    }

    const CHOICES: [MergeType; 3] = [
        MergeType::IntroSongIntroSong,
        MergeType::SongIntroSong,
        MergeType::SongCrossfadeSong,
    ];
    let weights = [
        config.weight_intro_song_intro_song,
        config.weight_song_intro_song,
        config.weight_song_crossfade_song,
    ];
    match WeightedIndex::new(weights) {
        Ok(dist) => CHOICES[dist.sample(rng)],
        Err(e) => {
            warn!("Unusable merge weights ({}), falling back to crossfade", e);
            MergeType::SongCrossfadeSong
        }
    }
}

/// What actually goes to the queue once we know which intros made it to
/// disk. Two-fragment plans use the slot-map endpoint; single fragments use
/// the brand/song endpoint with the audio uploaded alongside.
#[derive(Debug, PartialEq)]
pub(crate) enum BroadcastPlan {
    Merge {
        method: MergeType,
        songs: BTreeMap<String, String>,
        files: BTreeMap<String, String>,
    },
    Single {
        fragment_id: String,
        intro_audio: Option<Bytes>,
    },
}

/// Maps the chosen merge type onto the material the run actually produced.
/// Missing intro audio downgrades the plan rather than failing the run:
/// SONG_INTRO_SONG without its intro becomes a crossfade, and a half-voiced
/// INTRO_SONG_INTRO_SONG keeps whichever shape its surviving audio allows.
/// `None` means nothing broadcastable came out of this run.
pub(crate) fn broadcast_plan(state: &RunState) -> Option<BroadcastPlan> {
    let merge = state.merge?;
    let first = state.fragments.first()?;

    // A plan that wants two fragments but only has one collapses to the
    // single-fragment shape instead of indexing out of range.
    if state.fragments.len() < 2 {
        return single_plan(first, merge == MergeType::IntroSong, state.quiet);
    }
    let second = &state.fragments[1];

    let path = |f: &SoundFragment| f.file_path.as_ref().map(|p| p.display().to_string());
    let crossfade = || BroadcastPlan::Merge {
        method: MergeType::SongCrossfadeSong,
        songs: song_slots(first, second),
        files: BTreeMap::new(),
    };

    let plan = match merge {
        MergeType::IntroSong => return single_plan(first, true, state.quiet),
        MergeType::SongCrossfadeSong => crossfade(),
        MergeType::SongIntroSong => match path(second) {
            Some(p2) => BroadcastPlan::Merge {
                method: MergeType::SongIntroSong,
                songs: song_slots(first, second),
                files: BTreeMap::from([("audio2".to_string(), p2)]),
            },
            None => crossfade(),
        },
        MergeType::IntroSongIntroSong => match (path(first), path(second)) {
            (Some(p1), Some(p2)) => BroadcastPlan::Merge {
                method: MergeType::IntroSongIntroSong,
                songs: song_slots(first, second),
                files: BTreeMap::from([
                    ("audio1".to_string(), p1),
                    ("audio2".to_string(), p2),
                ]),
            },
            (None, Some(p2)) => BroadcastPlan::Merge {
                method: MergeType::SongIntroSong,
                songs: song_slots(first, second),
                files: BTreeMap::from([("audio2".to_string(), p2)]),
            },
            _ => crossfade(),
        },
    };
    Some(plan)
}

fn song_slots(first: &SoundFragment, second: &SoundFragment) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("song1".to_string(), first.id.clone()),
        ("song2".to_string(), second.id.clone()),
    ])
}

fn single_plan(
    fragment: &SoundFragment,
    intro_wanted: bool,
    quiet: bool,
) -> Option<BroadcastPlan> {
    if fragment.audio.is_some() {
        return Some(BroadcastPlan::Single {
            fragment_id: fragment.id.clone(),
            intro_audio: fragment.audio.clone(),
        });
    }
    // Quiet runs (and shapes that never wanted speech) ship the fragment
    // bare; a talky run whose only intro never materialized has nothing.
    if quiet || !intro_wanted {
        return Some(BroadcastPlan::Single {
            fragment_id: fragment.id.clone(),
            intro_audio: None,
        });
    }
    None
}

/// Synthesis output is untyped bytes; the container decides the extension.
pub(crate) fn sniff_extension(audio: &[u8]) -> &'static str {
    if audio.len() >= 12 && &audio[..4] == b"RIFF" && &audio[8..12] == b"WAVE" {
        "wav"
    } else {
        "mp3"
    }
}

/// One brand's run, from rotation fetch to the broadcast queue. The worker
/// builds a pipeline per wake-up; all collaborators are shared services.
pub struct DjPipeline {
    config: Config,
    catalog: Arc<dyn CatalogClient>,
    cache: Arc<RotationCache>,
    history: Arc<PlayHistory>,
    queue: Arc<dyn Broadcaster>,
    llm: Arc<dyn LlmProvider>,
    tts: Arc<dyn SpeechSynthesizer>,
}

impl DjPipeline {
    pub fn new(
        config: Config,
        catalog: Arc<dyn CatalogClient>,
        cache: Arc<RotationCache>,
        history: Arc<PlayHistory>,
        queue: Arc<dyn Broadcaster>,
        llm: Arc<dyn LlmProvider>,
        tts: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            config,
            catalog,
            cache,
            history,
            queue,
            llm,
            tts,
        }
    }

    /// Drives one run through the step machine and reports the outcome.
    pub async fn run(&self, brand: &Brand) -> RunOutcome {
        let run_id = Uuid::new_v4().simple().to_string();
        let talkativity = brand.talkativity.unwrap_or(self.config.dj.talkativity);
        let mut rng = StdRng::from_entropy();
        let quiet = rng.r#gen::<f64>() >= talkativity;
        info!(
            "'{}' run {} starting ({})",
            brand.slug,
            run_id,
            if quiet { "quiet" } else { "spoken" }
        );

        let mut state = RunState::new(brand.slug.clone(), run_id, quiet);
        let mut step = Step::FetchFragments;
        loop {
            match step {
                Step::FetchFragments => self.fetch_fragments(&mut state).await,
                Step::ChooseMergeStrategy => {
                    let merge = choose_merge_type(
                        &mut rng,
                        &self.config.dj,
                        state.fragments.len(),
                        state.quiet,
                    );
                    debug!(
                        "'{}' run {} merges as {}",
                        state.brand,
                        state.run_id,
                        merge.as_str()
                    );
                    state.merge = Some(merge);
                }
                Step::GenerateIntroText => self.generate_intro_text(&mut state, &mut rng).await,
                Step::SynthesizeAudio => self.synthesize_audio(&mut state).await,
                Step::Broadcast => self.broadcast(&mut state).await,
                Step::End => break,
            }
            step = next_step(step, &state);
        }
        self.finish(state).await
    }

    /// Fills the run with material. An ad event claims the whole run;
    /// otherwise up to two songs come out of rotation, skipping whatever is
    /// still cooling down. Fetch trouble leaves the run empty, which ends it.
    async fn fetch_fragments(&self, state: &mut RunState) {
        match self.catalog.pending_events(&state.brand).await {
            Ok(events) => state.ad_slot = events.iter().any(|e| e.is_ad()),
            Err(e) => debug!("Event lookup for '{}' failed: {:#}", state.brand, e),
        }

        if state.ad_slot {
            match self
                .cache
                .get(&state.brand, FragmentType::Advertisement, self.catalog.as_ref())
                .await
            {
                Ok(ads) => {
                    if let Some(mut ad) = ads.into_iter().next() {
                        ad.draft = Some(draft::build_ad_line(&ad.title, &ad.artist));
                        state.fragments.push(ad);
                    } else {
                        warn!(
                            "Ad slot flagged for '{}' but no advertisement is available",
                            state.brand
                        );
                    }
                }
                Err(e) => warn!("Advertisement fetch for '{}' failed: {:#}", state.brand, e),
            }
            return;
        }

        // Snapshot the newest history entry before selection appends to it,
        // so the draft can reference what actually played last.
        state.previous = self.history.last(&state.brand).await;

        let candidates = match self
            .cache
            .get(&state.brand, FragmentType::Song, self.catalog.as_ref())
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Song fetch for '{}' failed: {:#}", state.brand, e);
                return;
            }
        };
        if candidates.is_empty() {
            info!("No songs in rotation for '{}'", state.brand);
            return;
        }
        state.fragments = self.history.select(&state.brand, &candidates, 2).await;
    }

    /// Writes the on-air text for every fragment the merge shape wants
    /// spoken. The LLM rewrites a note-sheet draft; if it fails, the draft
    /// itself goes on air rather than losing the slot.
    async fn generate_intro_text(&self, state: &mut RunState, rng: &mut StdRng) {
        for idx in intro_targets(state.merge, state.fragments.len()) {
            let draft = match &state.fragments[idx].draft {
                Some(existing) => existing.clone(),
                None => draft::build_draft(
                    rng,
                    &self.config.dj.draft,
                    &self.config.dj.name,
                    &state.brand,
                    &state.fragments[idx],
                    state.previous.as_ref(),
                    self.config.dj.ambient_context.as_deref(),
                ),
            };

            // Sparse metadata is the one case where letting the model search
            // the web beats hallucinating facts about an unknown track.
            let fragment = &state.fragments[idx];
            let has_description = fragment
                .description
                .as_deref()
                .is_some_and(|d| !d.is_empty());
            let allow_search = fragment.fragment_type != FragmentType::Advertisement
                && fragment.genres.is_empty()
                && !has_description;

            let messages = [
                ChatMessage {
                    role: "system".to_string(),
                    content: "Generate plain text".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("{}\n\nInput:\n{}", self.config.dj.prompt, draft),
                },
            ];
            let generated = self.llm.generate(&messages, allow_search).await;

            let fragment = &mut state.fragments[idx];
            match generated {
                Ok(text) => fragment.intro_text = Some(text),
                Err(e) => {
                    error!(
                        "Intro generation for \"{}\" failed, using the draft: {:#}",
                        fragment.title, e
                    );
                    if !draft.trim().is_empty() {
                        fragment.intro_text = Some(draft.clone());
                    }
                }
            }
            fragment.draft = Some(draft);
        }
    }

    /// Voices each generated intro and persists it next to the run. A failed
    /// or empty synthesis leaves the fragment without a file path, which the
    /// broadcast plan later treats as "this intro does not exist".
    async fn synthesize_audio(&self, state: &mut RunState) {
        for idx in intro_targets(state.merge, state.fragments.len()) {
            let Some(text) = state.fragments[idx].intro_text.clone() else {
                continue;
            };
            match self.tts.synthesize(&text).await {
                Ok(audio) if audio.is_empty() => {
                    warn!(
                        "Synthesis for \"{}\" returned no audio",
                        state.fragments[idx].title
                    );
                }
                Ok(audio) => {
                    match self
                        .persist_audio(&state.brand, &state.run_id, idx, &audio)
                        .await
                    {
                        Ok(path) => {
                            let fragment = &mut state.fragments[idx];
                            fragment.file_path = Some(path);
                            fragment.audio = Some(audio);
                        }
                        Err(e) => error!(
                            "Could not persist intro audio for \"{}\": {:#}",
                            state.fragments[idx].title, e
                        ),
                    }
                }
                Err(e) => error!(
                    "Synthesis for \"{}\" failed: {:#}",
                    state.fragments[idx].title, e
                ),
            }
        }
    }

    async fn persist_audio(
        &self,
        brand: &str,
        run_id: &str,
        slot: usize,
        audio: &Bytes,
    ) -> Result<PathBuf> {
        let dir = self.config.work_dir.join(brand);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(format!(
            "{}_intro{}.{}",
            run_id,
            slot + 1,
            sniff_extension(audio)
        ));
        tokio::fs::write(&path, audio)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(
            "Persisted {} byte(s) of intro audio to {}",
            audio.len(),
            path.display()
        );
        Ok(path)
    }

    /// Hands the run to the queue. The gateway reports plain success or
    /// failure; this step never errors out of the pipeline.
    async fn broadcast(&self, state: &mut RunState) {
        let chosen = state.merge;
        match broadcast_plan(state) {
            Some(BroadcastPlan::Merge {
                method,
                songs,
                files,
            }) => {
                if chosen != Some(method) {
                    info!(
                        "'{}' run {} downgraded to {} (missing intro audio)",
                        state.brand,
                        state.run_id,
                        method.as_str()
                    );
                }
                state.broadcast_success = self
                    .queue
                    .enqueue(
                        &state.brand,
                        method.as_str(),
                        &songs,
                        &files,
                        self.config.queue.priority,
                    )
                    .await;
            }
            Some(BroadcastPlan::Single {
                fragment_id,
                intro_audio,
            }) => {
                state.broadcast_success = self
                    .queue
                    .enqueue_single(&state.brand, &fragment_id, intro_audio)
                    .await;
            }
            None => {
                warn!(
                    "'{}' run {} produced nothing broadcastable",
                    state.brand, state.run_id
                );
            }
        }
    }

    /// Settles the run: successful broadcasts write their intros back into
    /// the play history so the next draft can quote them.
    async fn finish(&self, state: RunState) -> RunOutcome {
        if state.broadcast_success {
            for fragment in &state.fragments {
                if let Some(text) = fragment.intro_text.as_deref() {
                    self.history
                        .record_intro(&state.brand, &fragment.id, text)
                        .await;
                }
            }
        }

        let lead = state.fragments.first();
        let artist = lead.map(|f| f.artist.clone()).unwrap_or_default();
        if state.broadcast_success {
            info!("'{}' run {} is on air", state.brand, state.run_id);
            RunOutcome {
                broadcast_success: true,
                subject: state.brand.clone(),
                artist,
            }
        } else {
            warn!(
                "'{}' run {} ended without a broadcast",
                state.brand, state.run_id
            );
            RunOutcome {
                broadcast_success: false,
                subject: lead
                    .map(|f| f.title.clone())
                    .unwrap_or_else(|| state.brand.clone()),
                artist,
            }
        }
    }
}

#[cfg(test)]
mod tests;
