//! End-to-end exercise of Stage 4 (detector) feeding Stage 5 (trimmer)
//! without a database, covering the "detect cohort, then trim survivors"
//! path described in spec §8.

use cliparr::config::PipelineTunables;
use cliparr::db::detection_results::{ApprovalStatus, DetectionResultRecord};
use cliparr::pipeline::detector::{Detector, EpisodeFingerprints};
use cliparr::pipeline::trimmer::Trimmer;
use time::OffsetDateTime;
use uuid::Uuid;

fn hash(byte: u8) -> Vec<u8> {
    vec![byte; 8]
}

fn episode(number: i32, duration_secs: f64) -> EpisodeFingerprints {
    let id = Uuid::new_v4();
    let mut windows = Vec::new();

    // Shared 20s intro.
    for t in [0.0, 5.0, 10.0, 15.0] {
        windows.push((t, hash(0xAA)));
    }
    // Unique body filler so it never clusters with other episodes.
    windows.push((duration_secs / 2.0, hash(number as u8 + 100)));
    // Shared 20s credits tail.
    let tail_start = duration_secs - 20.0;
    for t in [tail_start, tail_start + 5.0, tail_start + 10.0, tail_start + 15.0] {
        windows.push((t, hash(0xBB)));
    }

    EpisodeFingerprints { episode_file_id: id, episode_number: number, windows }
}

#[test]
fn cohort_detection_feeds_trimmer_surviving_ranges() {
    let tunables = PipelineTunables::default();
    let show_id = Uuid::new_v4();
    let season_number = 1;

    let episodes: Vec<_> = (1..=4).map(|n| episode(n, 1200.0)).collect();
    let detection = Detector::detect(&episodes, &tunables);

    assert!(detection.intro.is_some(), "shared intro should cluster across the cohort");
    assert!(detection.credits.is_some(), "shared credits should cluster across the cohort");
    assert_eq!(detection.confidence_score, 1.0, "every episode contributed to both segments");

    let per_episode = Detector::per_episode_result(
        &detection,
        show_id,
        season_number,
        &episodes[0],
        &tunables,
        true,
        0.5,
    );
    assert_eq!(per_episode.approval_status, ApprovalStatus::AutoApproved);
    assert!(per_episode.intro_start.is_some());
    assert!(per_episode.credits_start.is_some());

    let record = DetectionResultRecord {
        id: Uuid::new_v4(),
        show_id,
        season_number,
        episode_number: per_episode.episode_number,
        intro_start: per_episode.intro_start,
        intro_end: per_episode.intro_end,
        credits_start: per_episode.credits_start,
        credits_end: per_episode.credits_end,
        stingers: serde_json::to_value(&per_episode.stingers).unwrap(),
        segments: serde_json::to_value(&per_episode.segments).unwrap(),
        confidence_score: per_episode.confidence_score,
        detection_method: per_episode.detection_method.clone(),
        approval_status: per_episode.approval_status,
        processing_notes: per_episode.processing_notes.clone(),
        created_at: OffsetDateTime::UNIX_EPOCH,
        updated_at: OffsetDateTime::UNIX_EPOCH,
    };

    let ranges = Trimmer::surviving_ranges(&record, 1200.0, false);
    assert_eq!(ranges.len(), 1, "only the middle body should survive");
    let (start, end) = ranges[0];
    assert!(start > 15.0 && start < 25.0, "survivor should start just after the intro, got {start}");
    assert!(end > 1175.0 && end < 1185.0, "survivor should end just before credits, got {end}");
}

#[test]
fn sparse_cohort_never_auto_approves_below_threshold() {
    let tunables = PipelineTunables::default();
    let episodes: Vec<_> = (1..=2).map(|n| episode(n, 900.0)).collect();
    let detection = Detector::detect(&episodes, &tunables);

    // Cohorts of two or fewer episodes are confidence-capped at 0.5
    // (spec §4.4 "single_episode_cohort" penalty applies at cohort_size <= 2).
    assert!(detection.confidence_score <= 0.5);

    let per_episode = Detector::per_episode_result(
        &detection,
        Uuid::new_v4(),
        1,
        &episodes[0],
        &tunables,
        true,
        0.6,
    );
    assert_eq!(per_episode.approval_status, ApprovalStatus::Pending);
}
