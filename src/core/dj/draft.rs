use rand::Rng;

use crate::config::DraftConfig;
use crate::core::catalog::{PlayedEntry, SoundFragment};

/// Assembles the raw note sheet the language model rewrites into an on-air
/// intro. Optional lines are drawn independently so consecutive intros do
/// not all sound alike.
pub(crate) fn build_draft<R: Rng>(
    rng: &mut R,
    config: &DraftConfig,
    dj_name: &str,
    brand: &str,
    fragment: &SoundFragment,
    previous: Option<&PlayedEntry>,
    ambient: Option<&str>,
) -> String {
    let mut draft = String::new();
    let mut added = false;

    if rng.gen_range(0.0..1.0) < config.combined_probability {
        draft.push_str(&format!("DJ Persona: {}\nStation Brand: {}", dj_name, brand));
        added = true;
    } else {
        if rng.gen_range(0.0..1.0) < config.dj_probability {
            draft.push_str(&format!("DJ Persona: {}", dj_name));
            added = true;
        }
        if rng.gen_range(0.0..1.0) < config.brand_probability {
            if added {
                draft.push('\n');
            }
            draft.push_str(&format!("Station Brand: {}", brand));
        }
    }

    draft.push_str(&format!(
        "\nNow playing: \"{}\" by {}",
        fragment.title, fragment.artist
    ));

    if let Some(description) = fragment.description.as_deref().filter(|d| !d.is_empty()) {
        draft.push_str(&format!("\nDescription: {}", description));
    }
    if !fragment.genres.is_empty() {
        draft.push_str(&format!("\nGenres: {}", fragment.genres.join(", ")));
    }
    if let Some(prev) = previous {
        draft.push_str(&format!(
            "\nHistory: Played \"{}\" by {}.",
            prev.title, prev.artist
        ));
        if let Some(intro) = prev.intro.as_deref().filter(|i| !i.is_empty()) {
            draft.push_str(&format!(" Last intro speech was: {}", intro));
        }
    }
    if let Some(hint) = ambient
        && rng.gen_range(0.0..1.0) < config.atmosphere_probability
    {
        draft.push_str(&format!("\nAtmosphere hint: {}", hint));
    }
    draft
}

/// Advertisements get a fixed break line instead of the full note sheet.
pub(crate) fn build_ad_line(title: &str, artist: &str) -> String {
    format!("\nAdvertisement: Break — \"{}\" by {}", title, artist)
}
