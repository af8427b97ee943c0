use serde::{Deserialize, Serialize};

use crate::core::catalog::{PlayedEntry, SoundFragment};

/// How the backend stitches the enqueued pieces together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeType {
    IntroSong,
    SongIntroSong,
    IntroSongIntroSong,
    SongCrossfadeSong,
}

impl MergeType {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeType::IntroSong => "INTRO_SONG",
            MergeType::SongIntroSong => "SONG_INTRO_SONG",
            MergeType::IntroSongIntroSong => "INTRO_SONG_INTRO_SONG",
            MergeType::SongCrossfadeSong => "SONG_CROSSFADE_SONG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    FetchFragments,
    ChooseMergeStrategy,
    GenerateIntroText,
    SynthesizeAudio,
    Broadcast,
    End,
}

/// Everything one pipeline run mutates. Dropped at end of run.
#[derive(Debug)]
pub struct RunState {
    pub brand: String,
    pub run_id: String,
    /// Quiet runs skip text and speech and ship songs as-is.
    pub quiet: bool,
    pub ad_slot: bool,
    /// Last entry of the brand's play history before this run selected
    /// anything, for the draft's recap line.
    pub previous: Option<PlayedEntry>,
    pub fragments: Vec<SoundFragment>,
    pub merge: Option<MergeType>,
    pub broadcast_success: bool,
}

impl RunState {
    pub fn new(brand: String, run_id: String, quiet: bool) -> Self {
        Self {
            brand,
            run_id,
            quiet,
            ad_slot: false,
            previous: None,
            fragments: Vec::new(),
            merge: None,
            broadcast_success: false,
        }
    }
}

/// The transition table. Crossfade and quiet runs skip straight from merge
/// choice to broadcast; an empty fetch ends the run.
pub fn next_step(step: Step, state: &RunState) -> Step {
    match step {
        Step::FetchFragments => {
            if state.fragments.is_empty() {
                Step::End
            } else {
                Step::ChooseMergeStrategy
            }
        }
        Step::ChooseMergeStrategy => {
            if state.merge == Some(MergeType::SongCrossfadeSong) || state.quiet {
                Step::Broadcast
            } else {
                Step::GenerateIntroText
            }
        }
        Step::GenerateIntroText => Step::SynthesizeAudio,
        Step::SynthesizeAudio => Step::Broadcast,
        Step::Broadcast => Step::End,
        Step::End => Step::End,
    }
}

/// Which fragment positions receive a spoken introduction. Guards against
/// merge types that need more fragments than the run actually holds.
pub(crate) fn intro_targets(merge: Option<MergeType>, fragment_count: usize) -> Vec<usize> {
    match merge {
        Some(MergeType::IntroSong) if fragment_count >= 1 => vec![0],
        Some(MergeType::SongIntroSong) if fragment_count >= 2 => vec![1],
        Some(MergeType::IntroSongIntroSong) if fragment_count >= 2 => vec![0, 1],
        _ => Vec::new(),
    }
}
