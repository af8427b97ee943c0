use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::DjConfig;
use crate::core::dj::{MergeType, choose_merge_type};

fn weights(isis: f64, sis: f64, cross: f64) -> DjConfig {
    DjConfig {
        weight_intro_song_intro_song: isis,
        weight_song_intro_song: sis,
        weight_song_crossfade_song: cross,
        ..DjConfig::default()
    }
}

#[test]
fn single_fragment_always_gets_a_plain_intro() {
    let mut rng = StdRng::seed_from_u64(7);
    let config = weights(0.0, 0.0, 1.0);
    for _ in 0..50 {
        assert_eq!(
            choose_merge_type(&mut rng, &config, 1, false),
            MergeType::IntroSong
        );
    }
}

#[test]
fn quiet_runs_always_crossfade() {
    let mut rng = StdRng::seed_from_u64(7);
    let config = weights(1.0, 1.0, 0.0);
    for _ in 0..50 {
        assert_eq!(
            choose_merge_type(&mut rng, &config, 2, true),
            MergeType::SongCrossfadeSong
        );
    }
}

#[test]
fn zero_weight_shapes_are_never_drawn() {
    let mut rng = StdRng::seed_from_u64(7);
    let config = weights(1.0, 0.0, 0.0);
    for _ in 0..50 {
        assert_eq!(
            choose_merge_type(&mut rng, &config, 2, false),
            MergeType::IntroSongIntroSong
        );
    }
}

#[test]
fn default_weights_reach_every_two_fragment_shape() {
    let mut rng = StdRng::seed_from_u64(42);
    let config = DjConfig::default();

    let (mut isis, mut sis, mut cross) = (0usize, 0usize, 0usize);
    for _ in 0..1000 {
        match choose_merge_type(&mut rng, &config, 2, false) {
            MergeType::IntroSongIntroSong => isis += 1,
            MergeType::SongIntroSong => sis += 1,
            MergeType::SongCrossfadeSong => cross += 1,
            MergeType::IntroSong => panic!("plain intro is not in the two-fragment draw"),
        }
    }
    assert!(isis > 0 && sis > 0 && cross > 0);
    // 0.6 out of 1.4 total weight: the crossfade leads the draw.
    assert!(cross > isis && cross > sis);
}

#[test]
fn all_zero_weights_fall_back_to_crossfade() {
    let mut rng = StdRng::seed_from_u64(7);
    let config = weights(0.0, 0.0, 0.0);
    assert_eq!(
        choose_merge_type(&mut rng, &config, 2, false),
        MergeType::SongCrossfadeSong
    );
}
