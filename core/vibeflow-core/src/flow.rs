//! Flow classification.
//!
//! A session's timeline `[started_at, as_of]` is split into idle gaps and the
//! active blocks between them. Blocks are then bucketed:
//!
//! ```text
//! block >= 15m            -> deep-flow
//! 30s <= block <= 5m      -> drift
//! anything else           -> unclassified (includes 5m..15m)
//! ```
//!
//! Session label, first match wins:
//!
//! ```text
//! deep-flow     >= 1 deep block and >= 20m of deep flow in total
//! context-loss  any idle gap >= 5m
//! drift         >= 3 drift blocks
//! steady        otherwise
//! ```
//!
//! The 5–15 minute band is intentionally unlabeled; see DESIGN.md.

use chrono::{DateTime, Duration, Utc};

use crate::types::{FlowLabel, FlowSummary, IdleGap, Session};

pub const DEEP_FLOW_BLOCK_MS: i64 = 15 * 60 * 1000;
pub const DEEP_FLOW_SESSION_MS: i64 = 20 * 60 * 1000;
pub const DRIFT_BLOCK_MIN_MS: i64 = 30 * 1000;
pub const DRIFT_BLOCK_MAX_MS: i64 = 5 * 60 * 1000;
pub const CONTEXT_LOSS_GAP_MS: i64 = 5 * 60 * 1000;
pub const DRIFT_BLOCKS_FOR_LABEL: u32 = 3;

/// A maximal interval containing no idle gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveBlock {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ActiveBlock {
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

/// Summarises `session` as of `as_of` using its recorded gaps.
pub fn compute_flow_summary(session: &Session, as_of: DateTime<Utc>) -> FlowSummary {
    summarize(session.started_at, &session.idle_gaps, as_of)
}

/// Classifies an arbitrary timeline. Gap order does not matter.
pub fn summarize(started_at: DateTime<Utc>, gaps: &[IdleGap], as_of: DateTime<Utc>) -> FlowSummary {
    let as_of = as_of.max(started_at);
    let mut sorted: Vec<&IdleGap> = gaps.iter().collect();
    sorted.sort_by_key(|gap| gap.start_at);

    let (blocks, total_idle_ms) = sweep(started_at, &sorted, as_of);
    let total_active_ms: i64 = blocks.iter().map(ActiveBlock::duration_ms).sum();

    let mut deep_flow_blocks = 0;
    let mut total_deep_flow_ms = 0;
    let mut longest_deep_flow_ms = 0;
    let mut drift_blocks = 0;

    for block in &blocks {
        let duration = block.duration_ms();
        if duration >= DEEP_FLOW_BLOCK_MS {
            deep_flow_blocks += 1;
            total_deep_flow_ms += duration;
            longest_deep_flow_ms = longest_deep_flow_ms.max(duration);
        } else if (DRIFT_BLOCK_MIN_MS..=DRIFT_BLOCK_MAX_MS).contains(&duration) {
            drift_blocks += 1;
        }
    }

    let context_loss_gaps = sorted
        .iter()
        .filter(|gap| gap.duration_ms >= CONTEXT_LOSS_GAP_MS)
        .count() as u32;

    let label = if deep_flow_blocks > 0 && total_deep_flow_ms >= DEEP_FLOW_SESSION_MS {
        FlowLabel::DeepFlow
    } else if context_loss_gaps > 0 {
        FlowLabel::ContextLoss
    } else if drift_blocks >= DRIFT_BLOCKS_FOR_LABEL {
        FlowLabel::Drift
    } else {
        FlowLabel::Steady
    };

    FlowSummary {
        session_duration_ms: (as_of - started_at).num_milliseconds(),
        total_active_ms,
        total_idle_ms,
        deep_flow_blocks,
        total_deep_flow_ms,
        longest_deep_flow_ms,
        drift_blocks,
        context_loss_gaps,
        label,
    }
}

/// Walks `[started_at, as_of]` subtracting gaps. Gaps are clipped to the window
/// and overlaps are absorbed by the cursor, so active + idle == window.
fn sweep(
    started_at: DateTime<Utc>,
    sorted_gaps: &[&IdleGap],
    as_of: DateTime<Utc>,
) -> (Vec<ActiveBlock>, i64) {
    let mut blocks = Vec::new();
    let mut idle = Duration::zero();
    let mut cursor = started_at;

    for gap in sorted_gaps {
        let gap_start = gap.start_at.clamp(started_at, as_of);
        let gap_end = gap.end_at.clamp(started_at, as_of);
        if gap_end <= cursor {
            continue;
        }
        if gap_start > cursor {
            blocks.push(ActiveBlock {
                start: cursor,
                end: gap_start,
            });
            idle += gap_end - gap_start;
        } else {
            idle += gap_end - cursor;
        }
        cursor = gap_end;
    }

    if as_of > cursor {
        blocks.push(ActiveBlock {
            start: cursor,
            end: as_of,
        });
    }

    (blocks, idle.num_milliseconds())
}

/// The active blocks of `session` as of `as_of`.
pub fn active_blocks(session: &Session, as_of: DateTime<Utc>) -> Vec<ActiveBlock> {
    let as_of = as_of.max(session.started_at);
    let mut sorted: Vec<&IdleGap> = session.idle_gaps.iter().collect();
    sorted.sort_by_key(|gap| gap.start_at);
    sweep(session.started_at, &sorted, as_of).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 31, 9, 0, 0).unwrap()
    }

    fn at_secs(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn at(min: i64) -> DateTime<Utc> {
        at_secs(min * 60)
    }

    fn gap(from_secs: i64, to_secs: i64) -> IdleGap {
        IdleGap::new(at_secs(from_secs), at_secs(to_secs)).expect("valid gap")
    }

    fn assert_partition(summary: &FlowSummary) {
        assert_eq!(
            summary.total_active_ms + summary.total_idle_ms,
            summary.session_duration_ms
        );
    }

    #[test]
    fn empty_timeline_is_steady() {
        let summary = summarize(t0(), &[], t0());
        assert_eq!(summary.session_duration_ms, 0);
        assert_eq!(summary.label, FlowLabel::Steady);
        assert_partition(&summary);
    }

    #[test]
    fn continuous_25_minutes_is_deep_flow() {
        let summary = summarize(t0(), &[], at(25));
        assert_eq!(summary.deep_flow_blocks, 1);
        assert_eq!(summary.longest_deep_flow_ms, 25 * 60 * 1000);
        assert_eq!(summary.label, FlowLabel::DeepFlow);
        assert_partition(&summary);
    }

    #[test]
    fn single_deep_block_under_twenty_minutes_is_not_deep_flow() {
        let summary = summarize(t0(), &[], at(16));
        assert_eq!(summary.deep_flow_blocks, 1);
        assert_eq!(summary.label, FlowLabel::Steady);
    }

    #[test]
    fn six_minute_gap_is_context_loss() {
        // active 0-2, idle 2-8, active 8-10
        let summary = summarize(t0(), &[gap(120, 480)], at(10));
        assert_eq!(summary.context_loss_gaps, 1);
        assert_eq!(summary.total_idle_ms, 6 * 60 * 1000);
        assert_eq!(summary.total_active_ms, 4 * 60 * 1000);
        assert_eq!(summary.label, FlowLabel::ContextLoss);
        assert_partition(&summary);
    }

    #[test]
    fn deep_flow_wins_over_context_loss() {
        // 25m deep block, then a 10m gap, then 1m
        let summary = summarize(t0(), &[gap(25 * 60, 35 * 60)], at(36));
        assert_eq!(summary.context_loss_gaps, 1);
        assert_eq!(summary.label, FlowLabel::DeepFlow);
    }

    #[test]
    fn three_short_blocks_are_drift() {
        // 90s active, 3m idle, repeated three times
        let gaps = [gap(90, 270), gap(360, 540), gap(630, 810)];
        let summary = summarize(t0(), &gaps, at_secs(900));
        assert_eq!(summary.drift_blocks, 4);
        assert_eq!(summary.context_loss_gaps, 0);
        assert_eq!(summary.label, FlowLabel::Drift);
        assert_partition(&summary);
    }

    #[test]
    fn blocks_between_five_and_fifteen_minutes_stay_unclassified() {
        // 10m active, 2m idle, 10m active
        let summary = summarize(t0(), &[gap(600, 720)], at(22));
        assert_eq!(summary.deep_flow_blocks, 0);
        assert_eq!(summary.drift_blocks, 0);
        assert_eq!(summary.label, FlowLabel::Steady);
    }

    #[test]
    fn blocks_shorter_than_thirty_seconds_are_ignored() {
        let gaps = [gap(10, 130), gap(140, 260), gap(270, 390)];
        let summary = summarize(t0(), &gaps, at_secs(400));
        assert_eq!(summary.drift_blocks, 0);
        assert_eq!(summary.label, FlowLabel::Steady);
    }

    #[test]
    fn gap_order_does_not_matter() {
        let ordered = [gap(60, 120), gap(300, 420), gap(600, 660)];
        let shuffled = [ordered[2].clone(), ordered[0].clone(), ordered[1].clone()];
        assert_eq!(
            summarize(t0(), &ordered, at(12)),
            summarize(t0(), &shuffled, at(12))
        );
    }

    #[test]
    fn zero_deep_blocks_never_label_deep_flow() {
        for minutes in [1, 5, 10, 14] {
            let gaps: Vec<IdleGap> = (0..6)
                .map(|i| {
                    let start = (i * (minutes + 1) + minutes) * 60;
                    gap(start, start + 60)
                })
                .collect();
            let summary = summarize(t0(), &gaps, at(6 * (minutes + 1)));
            assert_eq!(summary.deep_flow_blocks, 0);
            assert_ne!(summary.label, FlowLabel::DeepFlow);
        }
    }

    #[test]
    fn partition_holds_for_every_as_of() {
        let gaps = [gap(60, 400), gap(900, 1000), gap(1500, 2400)];
        for secs in (0..3000).step_by(37) {
            let summary = summarize(t0(), &gaps, at_secs(secs));
            assert_partition(&summary);
        }
    }

    #[test]
    fn overlapping_and_out_of_window_gaps_keep_the_partition() {
        let gaps = [gap(60, 300), gap(200, 400), gap(-100, 30), gap(500, 9_000)];
        let summary = summarize(t0(), &gaps, at(10));
        assert_partition(&summary);
        // active: 30s..60s and 400s..500s
        assert_eq!(summary.total_active_ms, 130_000);
        assert_eq!(summary.total_idle_ms, 470_000);
    }

    #[test]
    fn as_of_before_start_is_clamped() {
        let summary = summarize(at(5), &[], t0());
        assert_eq!(summary.session_duration_ms, 0);
        assert_partition(&summary);
    }

    #[test]
    fn active_blocks_follow_gaps() {
        let mut session = Session::new("tab", "/repo".into(), "/repo".into(), t0(), None);
        session.idle_gaps.push(gap(120, 480));
        let blocks = active_blocks(&session, at(10));
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].duration_ms(), 120_000);
        assert_eq!(blocks[1].duration_ms(), 120_000);
    }
}
