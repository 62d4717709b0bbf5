//! Stage 4: Detector / Clusterer
//!
//! Implements the cohort clustering algorithm of spec §4.4 exactly:
//! bucket fingerprints by Hamming-distance equivalence, keep buckets
//! common to ≥ τ of the cohort, classify by median timestamp, merge
//! adjacent buckets, and emit per-episode `DetectionResult`s.

use std::collections::HashMap;

use uuid::Uuid;

use crate::config::PipelineTunables;
use crate::db::detection_results::{ApprovalStatus, Interval, Segment, SegmentLabel, UpsertDetectionResult};
use crate::pipeline::fingerprinter::is_equivalent;

/// One episode's fingerprint timeline, as the detector needs it.
#[derive(Debug, Clone)]
pub struct EpisodeFingerprints {
    pub episode_file_id: Uuid,
    pub episode_number: i32,
    pub windows: Vec<(f64, Vec<u8>)>,
}

impl EpisodeFingerprints {
    /// Episode duration read from the fingerprint timeline: the last
    /// window's end (spec §4.4 "Tie-breaks and edge policies").
    fn duration(&self, window_secs: f64) -> f64 {
        self.windows.iter().map(|(start, _)| start + window_secs).fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    representative: Vec<u8>,
    entries: Vec<(Uuid, f64)>, // (episode_file_id, window_start)
}

impl Bucket {
    fn episode_count(&self) -> usize {
        self.entries.iter().map(|(id, _)| id).collect::<std::collections::HashSet<_>>().len()
    }

    fn median_start(&self) -> f64 {
        let mut starts: Vec<f64> = self.entries.iter().map(|(_, s)| *s).collect();
        starts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        starts[starts.len() / 2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Intro,
    Credits,
    Stinger,
}

/// One cohort-level detection result, before per-episode filtering.
#[derive(Debug, Clone)]
pub struct CohortDetection {
    pub intro: Option<(f64, f64, usize)>, // start, end, episode_count
    pub credits: Option<(f64, f64, usize)>,
    pub stingers: Vec<(f64, f64, usize)>,
    pub confidence_score: f64,
    pub processing_notes: Option<String>,
    /// The set of episode_file_ids participating in each emitted segment,
    /// keyed by segment index within its category (0 for intro/credits,
    /// index within vec for stingers).
    pub intro_members: Vec<Uuid>,
    pub credits_members: Vec<Uuid>,
    pub stinger_members: Vec<Vec<Uuid>>,
}

pub struct Detector;

impl Detector {
    /// Run the full clustering algorithm over one cohort's fingerprints.
    pub fn detect(episodes: &[EpisodeFingerprints], tunables: &PipelineTunables) -> CohortDetection {
        let cohort_size = episodes.len();

        let durations: Vec<f64> = episodes.iter().map(|e| e.duration(tunables.window_secs)).collect();
        let max_duration = durations.iter().cloned().fold(0.0, f64::max);
        let avg_duration = if durations.is_empty() { 0.0 } else { durations.iter().sum::<f64>() / durations.len() as f64 };
        let duration_variance = if avg_duration > 0.0 {
            durations.iter().any(|d| ((d - avg_duration).abs() / avg_duration) > 0.10)
        } else {
            false
        };

        // Step 1: bucket all windows from all episodes by Hamming equivalence.
        let mut buckets: Vec<Bucket> = Vec::new();
        for episode in episodes {
            for (start, hash) in &episode.windows {
                match buckets.iter_mut().find(|b| is_equivalent(&b.representative, hash, tunables.hamming_delta)) {
                    Some(bucket) => bucket.entries.push((episode.episode_file_id, *start)),
                    None => buckets.push(Bucket { representative: hash.clone(), entries: vec![(episode.episode_file_id, *start)] }),
                }
            }
        }

        // Step 2: keep buckets common to >= tau * |cohort|.
        let threshold = (tunables.cohort_tau * cohort_size as f64).ceil() as usize;
        let common: Vec<Bucket> = buckets.into_iter().filter(|b| b.episode_count() >= threshold.max(1)).collect();

        // Step 3: classify by median timestamp relative to episode duration.
        let intro_window = (tunables.intro_search_fraction * max_duration).min(tunables.intro_search_cap_secs);
        let credits_window = (tunables.credits_search_fraction * max_duration).min(tunables.credits_search_cap_secs);

        let mut intro_candidates = Vec::new();
        let mut credits_candidates = Vec::new();
        let mut stinger_candidates = Vec::new();

        for bucket in common {
            let median = bucket.median_start();
            if median < intro_window {
                intro_candidates.push(bucket);
            } else if max_duration - median < credits_window {
                credits_candidates.push(bucket);
            } else {
                stinger_candidates.push(bucket);
            }
        }

        // Step 4: merge temporally adjacent buckets within each partition.
        let merge_gap = tunables.merge_gap_secs;
        let merged_intros = merge_adjacent(intro_candidates, merge_gap, tunables.window_secs);
        let merged_credits = merge_adjacent(credits_candidates, merge_gap, tunables.window_secs);
        let merged_stingers = merge_adjacent(stinger_candidates, merge_gap, tunables.window_secs);

        // Discard segments shorter than min_segment_seconds.
        let min_len = tunables.min_segment_secs;
        let merged_intros: Vec<_> = merged_intros.into_iter().filter(|s| s.end - s.start >= min_len).collect();
        let merged_credits: Vec<_> = merged_credits.into_iter().filter(|s| s.end - s.start >= min_len).collect();
        let merged_stingers: Vec<_> = merged_stingers.into_iter().filter(|s| s.end - s.start >= min_len).collect();

        // Step 5: at most one intro (longest, tie -> earliest start), one
        // credits (longest); all surviving stingers.
        let intro = longest_preferring_earliest(&merged_intros);
        let credits = longest_preferring_earliest(&merged_credits);

        let mut confidences = Vec::new();
        let mut intro_members = Vec::new();
        let mut credits_members = Vec::new();

        let mut intro_result = intro.map(|m| {
            confidences.push(m.episode_count as f64 / cohort_size as f64);
            intro_members = m.members.clone();
            (m.start, m.end, m.episode_count)
        });
        let mut credits_result = credits.map(|m| {
            confidences.push(m.episode_count as f64 / cohort_size as f64);
            credits_members = m.members.clone();
            (m.start, m.end, m.episode_count)
        });

        // Spec §4.4: segments overlapping >50% after classification merge,
        // with intro's label winning the earlier portion and credits the
        // later — in practice this only fires for very short episodes
        // where the intro and credits search windows overlap.
        if let (Some((i_start, i_end, _)), Some((c_start, c_end, _))) = (intro_result, credits_result) {
            let overlap = (i_end.min(c_end) - c_start.max(i_start)).max(0.0);
            let shorter = (i_end - i_start).min(c_end - c_start);
            if shorter > 0.0 && overlap / shorter > 0.5 {
                intro_result = Some((i_start, c_start.max(i_start), intro_result.unwrap().2));
                credits_result = Some((c_start, c_end, credits_result.unwrap().2));
            }
        }

        let mut stingers = Vec::new();
        let mut stinger_members = Vec::new();
        for m in &merged_stingers {
            confidences.push(m.episode_count as f64 / cohort_size as f64);
            stingers.push((m.start, m.end, m.episode_count));
            stinger_members.push(m.members.clone());
        }

        let mut confidence_score = if confidences.is_empty() { 0.0 } else { confidences.iter().sum::<f64>() / confidences.len() as f64 };

        let mut notes = None;
        if duration_variance {
            confidence_score = (confidence_score - 0.1).max(0.0);
            notes = Some("duration_variance".to_string());
        }
        if cohort_size <= 2 {
            confidence_score = confidence_score.min(0.5);
            notes = Some(match notes {
                Some(existing) => format!("{existing},single_episode_cohort"),
                None => "single_episode_cohort".to_string(),
            });
        }

        CohortDetection {
            intro: intro_result,
            credits: credits_result,
            stingers,
            confidence_score,
            processing_notes: notes,
            intro_members,
            credits_members,
            stinger_members,
        }
    }

    /// Filter the cohort-level detection to the subset relevant to one
    /// episode, producing the row the orchestrator upserts (spec §4.4
    /// "Per-episode output").
    pub fn per_episode_result(
        detection: &CohortDetection,
        show_id: Uuid,
        season_number: i32,
        episode: &EpisodeFingerprints,
        tunables: &PipelineTunables,
        auto_process_verified: bool,
        min_confidence_threshold: f64,
    ) -> UpsertDetectionResult {
        let (intro_start, intro_end) = match detection.intro {
            Some((s, e, _)) if detection.intro_members.contains(&episode.episode_file_id) => (Some(s), Some(e)),
            _ => (None, None),
        };
        let (credits_start, credits_end) = match detection.credits {
            Some((s, e, _)) if detection.credits_members.contains(&episode.episode_file_id) => (Some(s), Some(e)),
            _ => (None, None),
        };

        let stingers: Vec<Interval> = detection
            .stingers
            .iter()
            .zip(detection.stinger_members.iter())
            .filter(|(_, members)| members.contains(&episode.episode_file_id))
            .map(|((s, e, _), _)| Interval { start: *s, end: *e })
            .collect();

        let mut segments = Vec::new();
        if let (Some(s), Some(e)) = (intro_start, intro_end) {
            segments.push(Segment { label: SegmentLabel::Intro, start: s, end: e, episode_count: detection.intro.unwrap().2 });
        }
        if let (Some(s), Some(e)) = (credits_start, credits_end) {
            segments.push(Segment { label: SegmentLabel::Credits, start: s, end: e, episode_count: detection.credits.unwrap().2 });
        }
        for interval in &stingers {
            segments.push(Segment { label: SegmentLabel::Stinger, start: interval.start, end: interval.end, episode_count: 0 });
        }

        let approval_status = if auto_process_verified && detection.confidence_score >= min_confidence_threshold {
            ApprovalStatus::AutoApproved
        } else {
            ApprovalStatus::Pending
        };

        let _ = tunables;
        UpsertDetectionResult {
            show_id,
            season_number,
            episode_number: episode.episode_number,
            intro_start,
            intro_end,
            credits_start,
            credits_end,
            stingers,
            segments,
            confidence_score: detection.confidence_score,
            detection_method: "hamming_cluster".to_string(),
            approval_status,
            processing_notes: detection.processing_notes.clone(),
        }
    }

    /// Cohort-ready predicate (spec §4.4): at least K episodes have
    /// reached `awaiting_cohort` and none has been modified within the
    /// debounce window.
    pub fn is_cohort_ready(cohort_size: usize, ready_count: usize, seconds_since_last_update: u64, tunables: &PipelineTunables) -> bool {
        let k = tunables.cohort_min_episodes.min(cohort_size.max(1));
        ready_count >= k && seconds_since_last_update >= tunables.cohort_debounce_secs
    }
}

#[derive(Debug, Clone)]
struct MergedSegment {
    start: f64,
    end: f64,
    episode_count: usize,
    members: Vec<Uuid>,
}

/// Merge buckets whose median times are within `merge_gap` of each other
/// into contiguous segments spanning `[min_start, max_start + window]`.
fn merge_adjacent(mut buckets: Vec<Bucket>, merge_gap: f64, window_secs: f64) -> Vec<MergedSegment> {
    buckets.sort_by(|a, b| a.median_start().partial_cmp(&b.median_start()).unwrap());

    let mut merged: Vec<Vec<Bucket>> = Vec::new();
    for bucket in buckets {
        match merged.last_mut() {
            Some(group) if (bucket.median_start() - group.last().unwrap().median_start()).abs() <= merge_gap => {
                group.push(bucket);
            }
            _ => merged.push(vec![bucket]),
        }
    }

    merged
        .into_iter()
        .map(|group| {
            let min_start = group.iter().map(|b| b.median_start()).fold(f64::MAX, f64::min);
            let max_start = group.iter().map(|b| b.median_start()).fold(f64::MIN, f64::max);
            let members: Vec<Uuid> = group
                .iter()
                .flat_map(|b| b.entries.iter().map(|(id, _)| *id))
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect();
            let episode_count = members.len();
            MergedSegment { start: min_start, end: max_start + window_secs, episode_count, members }
        })
        .collect()
}

/// Longest segment wins; ties prefer the earlier start (spec §4.4
/// "Tie-breaks").
fn longest_preferring_earliest(segments: &[MergedSegment]) -> Option<MergedSegment> {
    segments
        .iter()
        .cloned()
        .max_by(|a, b| {
            let len_a = a.end - a.start;
            let len_b = b.end - b.start;
            len_a.partial_cmp(&len_b).unwrap().then_with(|| b.start.partial_cmp(&a.start).unwrap())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode(id: Uuid, number: i32, windows: Vec<(f64, Vec<u8>)>) -> EpisodeFingerprints {
        EpisodeFingerprints { episode_file_id: id, episode_number: number, windows }
    }

    fn hash(byte: u8) -> Vec<u8> {
        vec![byte; 8]
    }

    #[test]
    fn scenario_identical_intro_and_credits_across_three_episodes() {
        let tunables = PipelineTunables::default();
        let mut episodes = Vec::new();
        for n in 1..=3 {
            let mut windows = Vec::new();
            // 30s intro: windows at 0, 5, 10, 15, 20 share hash 0xAA
            for t in [0.0, 5.0, 10.0, 15.0, 20.0] {
                windows.push((t, hash(0xAA)));
            }
            // body: unique filler per episode so it never clusters
            windows.push((700.0, hash(n as u8 + 100)));
            // 60s credits near the end (episode duration ~1440s): windows at 1380..1430
            for t in [1380.0, 1385.0, 1390.0, 1395.0, 1400.0] {
                windows.push((t, hash(0xBB)));
            }
            episodes.push(episode(Uuid::new_v4(), n, windows));
        }

        let detection = Detector::detect(&episodes, &tunables);
        assert!(detection.intro.is_some());
        assert!(detection.credits.is_some());
        assert_eq!(detection.confidence_score, 1.0);
    }

    #[test]
    fn cohort_of_one_caps_confidence_and_notes() {
        let tunables = PipelineTunables::default();
        let windows = vec![(0.0, hash(0xAA)); 1];
        let episodes = vec![episode(Uuid::new_v4(), 1, windows)];

        let detection = Detector::detect(&episodes, &tunables);
        assert!(detection.confidence_score <= 0.5);
    }

    #[test]
    fn merge_adjacent_combines_close_buckets() {
        let buckets = vec![
            Bucket { representative: hash(1), entries: vec![(Uuid::nil(), 0.0)] },
            Bucket { representative: hash(2), entries: vec![(Uuid::nil(), 5.0)] },
        ];
        let merged = merge_adjacent(buckets, 10.0, 10.0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start, 0.0);
        assert_eq!(merged[0].end, 15.0);
    }

    #[test]
    fn cohort_ready_requires_debounce_elapsed() {
        let tunables = PipelineTunables::default();
        assert!(!Detector::is_cohort_ready(5, 3, 10, &tunables));
        assert!(Detector::is_cohort_ready(5, 3, 30, &tunables));
    }
}
