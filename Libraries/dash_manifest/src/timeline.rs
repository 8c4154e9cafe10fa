//! Expansion of segment timelines into the set of expected segment offsets.

use crate::mpd::SegmentRun;
use std::collections::BTreeSet;

/// All start offsets a run covers: `start, start+duration, ..., start+repeat*duration`.
pub fn expand_run(run: &SegmentRun) -> impl Iterator<Item = u64> + '_ {
    (0..=run.repeat).map(move |i| run.start.saturating_add(run.duration.saturating_mul(i)))
}

/// The full expected-offset set for a representation's timeline.
pub fn expected_offsets(timeline: &[SegmentRun]) -> BTreeSet<u64> {
    timeline.iter().flat_map(expand_run).collect()
}
