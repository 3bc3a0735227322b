//! Beat-bounded segment planning.
//!
//! The planner maps a beat timeline onto an ordered list of segments that
//! partitions `[0, audio_duration]`. The first segment is the intro and is
//! assigned to a dedicated clip; the rest cycle through the clip pool.

use std::num::NonZeroUsize;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{BeatCutError, Result};

/// Direction in which the clip pool is traversed for a whole plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipOrder {
    Forward,
    Reversed,
}

impl ClipOrder {
    /// Picks a direction uniformly at random.
    pub fn choose<R: Rng + ?Sized>(rng: &mut R) -> Self {
        if rng.gen_bool(0.5) {
            Self::Forward
        } else {
            Self::Reversed
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            Self::Forward => Self::Reversed,
            Self::Reversed => Self::Forward,
        }
    }

    /// Pool index used for the `step`-th round-robin segment.
    pub fn pool_index(self, step: usize, clip_count: NonZeroUsize) -> usize {
        let clip_count = clip_count.get();
        let position = step % clip_count;
        match self {
            Self::Forward => position,
            Self::Reversed => clip_count - 1 - position,
        }
    }
}

/// Which clip fills a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "lowercase")]
pub enum ClipSlot {
    Intro,
    Pool(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub clip: ClipSlot,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Output of a planning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPlan {
    pub audio_duration: f64,
    pub intro_boundary: f64,
    pub order: ClipOrder,
    pub segments: Vec<Segment>,
}

impl SegmentPlan {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segments after the intro, in playback order.
    pub fn pool_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(|segment| matches!(segment.clip, ClipSlot::Pool(_)))
    }

    /// Checks that the segments start at zero, touch end to start and finish
    /// exactly at the audio duration.
    pub fn is_contiguous(&self) -> bool {
        let (Some(first), Some(last)) = (self.segments.first(), self.segments.last()) else {
            return false;
        };

        first.start == 0.0
            && last.end == self.audio_duration
            && self.segments.iter().all(|segment| segment.end >= segment.start)
            && self
                .segments
                .windows(2)
                .all(|pair| pair[0].end == pair[1].start)
    }
}

/// Stateless planner holding the minimum intro length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatPlanner {
    min_intro_seconds: f64,
}

impl BeatPlanner {
    pub fn new(min_intro_seconds: f64) -> Self {
        Self { min_intro_seconds }
    }

    pub fn min_intro_seconds(&self) -> f64 {
        self.min_intro_seconds
    }

    /// Chooses a clip order from `rng` and plans with it.
    pub fn plan_with_rng<R: Rng + ?Sized>(
        &self,
        beats: &[f64],
        audio_duration: f64,
        clip_count: usize,
        rng: &mut R,
    ) -> Result<SegmentPlan> {
        let order = ClipOrder::choose(rng);
        self.plan(beats, audio_duration, clip_count, order)
    }

    /// Splits `[0, audio_duration]` at the beats.
    ///
    /// The intro runs up to the first beat at or after the minimum intro
    /// length. Every later beat opens a new segment whose clip is picked
    /// round-robin from the pool in `order`; the last segment closes at the
    /// audio duration. Beats at or past the audio duration are ignored. When
    /// no beat follows the intro boundary the intro covers the whole track.
    pub fn plan(
        &self,
        beats: &[f64],
        audio_duration: f64,
        clip_count: usize,
        order: ClipOrder,
    ) -> Result<SegmentPlan> {
        if !audio_duration.is_finite() || audio_duration <= 0.0 {
            return Err(BeatCutError::InvalidInput(
                "audio duration must be positive",
            ));
        }
        if !self.min_intro_seconds.is_finite() || self.min_intro_seconds < 0.0 {
            return Err(BeatCutError::InvalidInput(
                "minimum intro duration must be non-negative",
            ));
        }
        if beats.is_empty() {
            return Err(BeatCutError::NoBeats);
        }
        if beats.iter().any(|beat| !beat.is_finite() || *beat < 0.0)
            || beats.windows(2).any(|pair| pair[1] <= pair[0])
        {
            return Err(BeatCutError::InvalidInput(
                "beat timestamps must be non-negative and strictly increasing",
            ));
        }
        let pool_size = NonZeroUsize::new(clip_count).ok_or(BeatCutError::EmptyClipPool)?;

        let usable = &beats[..beats.partition_point(|beat| *beat < audio_duration)];
        let intro_index = usable
            .iter()
            .position(|beat| *beat >= self.min_intro_seconds)
            .ok_or(BeatCutError::NoIntroBoundary {
                min_intro_seconds: self.min_intro_seconds,
            })?;
        let intro_boundary = usable[intro_index];
        let cuts = &usable[intro_index..];

        if cuts.len() == 1 {
            return Ok(SegmentPlan {
                audio_duration,
                intro_boundary,
                order,
                segments: vec![Segment {
                    start: 0.0,
                    end: audio_duration,
                    clip: ClipSlot::Intro,
                }],
            });
        }

        let mut segments = Vec::with_capacity(cuts.len() + 1);
        segments.push(Segment {
            start: 0.0,
            end: intro_boundary,
            clip: ClipSlot::Intro,
        });

        let ends = cuts[1..].iter().copied().chain(std::iter::once(audio_duration));
        for (step, (start, end)) in cuts.iter().copied().zip(ends).enumerate() {
            segments.push(Segment {
                start,
                end,
                clip: ClipSlot::Pool(order.pool_index(step, pool_size)),
            });
        }

        Ok(SegmentPlan {
            audio_duration,
            intro_boundary,
            order,
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn spans(plan: &SegmentPlan) -> Vec<(f64, f64, ClipSlot)> {
        plan.segments
            .iter()
            .map(|segment| (segment.start, segment.end, segment.clip))
            .collect()
    }

    #[test]
    fn empty_timeline_has_no_beats() {
        let err = BeatPlanner::new(2.0)
            .plan(&[], 10.0, 2, ClipOrder::Forward)
            .unwrap_err();
        assert!(matches!(err, BeatCutError::NoBeats));
    }

    #[test]
    fn intro_threshold_beyond_every_beat() {
        let err = BeatPlanner::new(10.0)
            .plan(&[5.0], 20.0, 1, ClipOrder::Forward)
            .unwrap_err();
        assert!(matches!(err, BeatCutError::NoIntroBoundary { .. }));
    }

    #[test]
    fn zero_clips_is_an_empty_pool() {
        let err = BeatPlanner::new(0.0)
            .plan(&[1.0], 2.0, 0, ClipOrder::Forward)
            .unwrap_err();
        assert!(matches!(err, BeatCutError::EmptyClipPool));
    }

    #[test]
    fn plans_round_robin_after_intro() {
        let plan = BeatPlanner::new(2.0)
            .plan(&[1.0, 3.0, 6.0, 9.0], 10.0, 2, ClipOrder::Forward)
            .unwrap();

        assert_eq!(plan.intro_boundary, 3.0);
        assert_eq!(
            spans(&plan),
            vec![
                (0.0, 3.0, ClipSlot::Intro),
                (3.0, 6.0, ClipSlot::Pool(0)),
                (6.0, 9.0, ClipSlot::Pool(1)),
                (9.0, 10.0, ClipSlot::Pool(0)),
            ]
        );
        assert!(plan.is_contiguous());
    }

    #[test]
    fn reversed_order_mirrors_assignment() {
        let beats = [0.5, 2.0, 2.5, 3.0, 4.0, 5.5, 7.0];
        let planner = BeatPlanner::new(1.0);
        let mut rng = StdRng::seed_from_u64(42);
        let order = ClipOrder::choose(&mut rng);

        let plan = planner.plan(&beats, 8.0, 3, order).unwrap();
        let mirrored = planner.plan(&beats, 8.0, 3, order.reversed()).unwrap();

        for (a, b) in plan.segments.iter().zip(&mirrored.segments) {
            assert_eq!((a.start, a.end), (b.start, b.end));
            match (a.clip, b.clip) {
                (ClipSlot::Intro, ClipSlot::Intro) => {}
                (ClipSlot::Pool(x), ClipSlot::Pool(y)) => assert_eq!(x + y, 2),
                other => panic!("mismatched slots {other:?}"),
            }
        }
    }

    #[test]
    fn identical_inputs_give_identical_plans() {
        let beats = [1.0, 2.5, 4.0];
        let planner = BeatPlanner::new(2.0);
        let first = planner
            .plan_with_rng(&beats, 6.0, 4, &mut StdRng::seed_from_u64(9))
            .unwrap();
        let second = planner
            .plan_with_rng(&beats, 6.0, 4, &mut StdRng::seed_from_u64(9))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn intro_extends_to_end_without_later_beats() {
        let plan = BeatPlanner::new(2.0)
            .plan(&[1.0, 4.0], 12.0, 3, ClipOrder::Forward)
            .unwrap();
        assert_eq!(spans(&plan), vec![(0.0, 12.0, ClipSlot::Intro)]);
        assert_eq!(plan.intro_boundary, 4.0);
        assert!(plan.is_contiguous());
    }

    #[test]
    fn beats_past_the_audio_end_are_ignored() {
        let plan = BeatPlanner::new(1.0)
            .plan(&[1.0, 2.0, 3.0, 5.0, 7.0], 4.0, 2, ClipOrder::Reversed)
            .unwrap();
        assert_eq!(
            spans(&plan),
            vec![
                (0.0, 1.0, ClipSlot::Intro),
                (1.0, 2.0, ClipSlot::Pool(1)),
                (2.0, 3.0, ClipSlot::Pool(0)),
                (3.0, 4.0, ClipSlot::Pool(1)),
            ]
        );
    }

    #[test]
    fn boundary_at_audio_end_is_not_an_intro() {
        let err = BeatPlanner::new(3.0)
            .plan(&[1.0, 5.0], 5.0, 1, ClipOrder::Forward)
            .unwrap_err();
        assert!(matches!(err, BeatCutError::NoIntroBoundary { .. }));
    }

    #[test]
    fn rejects_invalid_arguments() {
        let planner = BeatPlanner::new(1.0);
        assert!(matches!(
            planner.plan(&[1.0], 0.0, 1, ClipOrder::Forward),
            Err(BeatCutError::InvalidInput(_))
        ));
        assert!(matches!(
            planner.plan(&[2.0, 1.0], 3.0, 1, ClipOrder::Forward),
            Err(BeatCutError::InvalidInput(_))
        ));
        assert!(matches!(
            BeatPlanner::new(-1.0).plan(&[1.0], 3.0, 1, ClipOrder::Forward),
            Err(BeatCutError::InvalidInput(_))
        ));
    }

    #[test]
    fn pool_index_wraps() {
        let three = NonZeroUsize::new(3).unwrap();
        assert_eq!(ClipOrder::Forward.pool_index(5, three), 2);
        assert_eq!(ClipOrder::Reversed.pool_index(0, three), 2);
        assert_eq!(ClipOrder::Reversed.pool_index(4, three), 1);
    }
}
