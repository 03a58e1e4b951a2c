//! Character animation during speech.
//!
//! The orchestrator only knows three calls on [`AnimationDriver`]. The
//! shipped [`TrackAnimator`] keeps a small model of the skeletal animation
//! state's tracks (talk mouth, talk motion, idle) that a renderer polls via
//! [`TrackAnimator::snapshot`].

use crate::config::AvatarConfig;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

/// Drives talk/idle animation.
pub trait AnimationDriver: Send + Sync {
    /// Start the looping talk animation.
    fn play_talk(&self);
    /// Fade the talk animation out.
    fn stop_talk(&self);
    /// Put the character back in its idle loop.
    fn return_to_idle(&self);
}

/// What one track is doing.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackState {
    /// Playing `name`.
    Playing { name: String, looping: bool },
    /// Emptied, mixing out over `mix_secs`.
    Empty { mix_secs: f32 },
}

/// In-memory animation track model.
#[derive(Debug)]
pub struct TrackAnimator {
    config: AvatarConfig,
    tracks: Mutex<BTreeMap<usize, TrackState>>,
}

impl TrackAnimator {
    pub fn new(config: AvatarConfig) -> Self {
        let mut tracks = BTreeMap::new();
        tracks.insert(
            config.idle_track,
            TrackState::Playing {
                name: config.idle_animation.clone(),
                looping: true,
            },
        );
        Self {
            config,
            tracks: Mutex::new(tracks),
        }
    }

    /// Current state of every touched track, by index.
    pub fn snapshot(&self) -> BTreeMap<usize, TrackState> {
        match self.tracks.lock() {
            Ok(tracks) => tracks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// True while either talk track is playing.
    #[cfg(test)]
    pub(crate) fn is_talking(&self) -> bool {
        let tracks = self.snapshot();
        [self.config.mouth_track, self.config.motion_track]
            .iter()
            .any(|t| matches!(tracks.get(t), Some(TrackState::Playing { .. })))
    }

    fn with_tracks(&self, f: impl FnOnce(&mut BTreeMap<usize, TrackState>)) {
        match self.tracks.lock() {
            Ok(mut tracks) => f(&mut tracks),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl AnimationDriver for TrackAnimator {
    fn play_talk(&self) {
        let c = &self.config;
        self.with_tracks(|tracks| {
            tracks.insert(
                c.mouth_track,
                TrackState::Playing {
                    name: c.talk_mouth.clone(),
                    looping: true,
                },
            );
            tracks.insert(
                c.motion_track,
                TrackState::Playing {
                    name: c.talk_motion.clone(),
                    looping: true,
                },
            );
        });
        debug!("talk animation started");
    }

    fn stop_talk(&self) {
        let c = &self.config;
        self.with_tracks(|tracks| {
            for track in [c.mouth_track, c.motion_track] {
                tracks.insert(
                    track,
                    TrackState::Empty {
                        mix_secs: c.talk_fade_secs,
                    },
                );
            }
        });
        debug!("talk animation stopped");
    }

    fn return_to_idle(&self) {
        let c = &self.config;
        self.with_tracks(|tracks| {
            tracks.insert(
                c.idle_track,
                TrackState::Playing {
                    name: c.idle_animation.clone(),
                    looping: true,
                },
            );
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn talk_cycle_drives_tracks_seven_and_eight() {
        let animator = TrackAnimator::new(AvatarConfig::default());
        assert!(!animator.is_talking());

        animator.play_talk();
        let tracks = animator.snapshot();
        assert_eq!(
            tracks.get(&7),
            Some(&TrackState::Playing {
                name: "Talk_01_A".into(),
                looping: true
            })
        );
        assert_eq!(
            tracks.get(&8),
            Some(&TrackState::Playing {
                name: "Talk_01_M".into(),
                looping: true
            })
        );
        assert!(animator.is_talking());

        animator.stop_talk();
        animator.return_to_idle();
        let tracks = animator.snapshot();
        assert_eq!(tracks.get(&7), Some(&TrackState::Empty { mix_secs: 0.25 }));
        assert!(!animator.is_talking());
        assert_eq!(
            tracks.get(&0),
            Some(&TrackState::Playing {
                name: "Idle_01".into(),
                looping: true
            })
        );
    }
}
