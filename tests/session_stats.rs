//! Session statistics invariants over longer runs

mod test_utils;

use chrono::Duration;
use onair::data::PlatformSnapshot;
use onair::engine::stats::{Segment, SessionStats, UNKNOWN_LABEL};
use test_utils::{live, off, t};

fn max_gap() -> Duration {
    Duration::seconds(90)
}

fn assert_well_formed(timeline: &[Segment]) {
    for segment in timeline {
        assert!(segment.start < segment.end, "empty segment {:?}", segment);
    }
    for pair in timeline.windows(2) {
        assert!(pair[0].end <= pair[1].start, "overlap: {:?}", pair);
        assert!(
            !(pair[0].end == pair[1].start && pair[0].label == pair[1].label),
            "unmerged neighbours: {:?}",
            pair
        );
    }
}

fn timeline_total(timeline: &[Segment]) -> u64 {
    timeline.iter().map(Segment::seconds).sum()
}

mod timelines {
    use super::*;

    #[test]
    fn test_segments_ordered_merged_and_summing_to_live_time() {
        let categories = ["A", "A", "B", "B", "B", "A", "C", "C", "A", "A"];
        let mut stats = SessionStats::new("s".to_string(), Some(t(0)), t(0));
        let mut clock = 0;
        for (i, category) in categories.iter().enumerate() {
            // Vk flaps on and off to exercise per-platform attribution
            let vk = if i % 3 == 0 { live("IRL", "walk") } else { off() };
            stats.tick(&live(category, "title"), &vk, max_gap(), t(clock));
            clock += 30;
        }
        stats.tick(&off(), &off(), max_gap(), t(clock));

        for ps in [&stats.platforms.kick, &stats.platforms.vk] {
            assert_well_formed(&ps.category_timeline);
            assert_well_formed(&ps.title_timeline);
            assert_eq!(timeline_total(&ps.category_timeline), ps.live_seconds);
            assert_eq!(timeline_total(&ps.title_timeline), ps.live_seconds);
            let by_label: u64 = ps.category_duration.values().sum();
            assert_eq!(by_label, ps.live_seconds);
        }

        let kick = &stats.platforms.kick;
        assert_eq!(kick.live_seconds, 300);
        let labels: Vec<&str> = kick.category_timeline.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["A", "B", "A", "C", "A"]);
    }

    #[test]
    fn test_clamped_gap_splits_segments() {
        let mut stats = SessionStats::new("s".to_string(), None, t(0));
        stats.tick(&live("A", "X"), &off(), max_gap(), t(0));
        stats.tick(&live("A", "X"), &off(), max_gap(), t(30));
        // Monitoring outage of ten minutes
        stats.tick(&live("A", "X"), &off(), max_gap(), t(630));
        stats.tick(&live("A", "X"), &off(), max_gap(), t(660));

        let kick = &stats.platforms.kick;
        assert_eq!(kick.live_seconds, 30 + 90 + 30);
        assert_well_formed(&kick.category_timeline);
        assert_eq!(kick.category_timeline.len(), 2);
        assert_eq!(timeline_total(&kick.category_timeline), kick.live_seconds);
    }

    #[test]
    fn test_missing_category_recorded_as_unknown() {
        let mut no_category = live("A", "X");
        no_category.category = None;
        let mut stats = SessionStats::new("s".to_string(), None, t(0));
        stats.tick(&no_category, &off(), max_gap(), t(0));
        stats.tick(&no_category, &off(), max_gap(), t(30));
        assert_eq!(stats.platforms.kick.category_duration.get(UNKNOWN_LABEL), Some(&30));
    }
}

mod viewers {
    use super::*;

    #[test]
    fn test_only_concrete_counts_are_sampled() {
        let mut stats = SessionStats::new("s".to_string(), None, t(0));
        stats.tick(&live("A", "X").with_viewers(100), &off(), max_gap(), t(0));
        stats.tick(&live("A", "X"), &off(), max_gap(), t(30));
        stats.tick(&live("A", "X").with_viewers(300), &off(), max_gap(), t(60));
        stats.tick(&PlatformSnapshot { viewer_count: Some(999), ..off() }, &off(), max_gap(), t(90));

        let v = &stats.platforms.kick.viewers;
        assert_eq!(v.sample_count, 2);
        assert_eq!(v.max, Some(300));
        assert_eq!(v.peak_at, Some(t(60)));
        assert_eq!(v.average(), Some(200.0));
    }
}

mod change_counters {
    use super::*;

    #[test]
    fn test_counters_follow_label_changes() {
        let mut stats = SessionStats::new("s".to_string(), None, t(0));
        let ticks = [("A", "X"), ("A", "Y"), ("B", "Y"), ("B", "Y"), ("A", "Z")];
        for (i, (category, title)) in ticks.iter().enumerate() {
            stats.tick(&live(category, title), &off(), max_gap(), t(i as i64 * 30));
        }
        assert_eq!(stats.platforms.kick.title_change_count, 2);
        assert_eq!(stats.platforms.kick.category_change_count, 2);
    }
}
