//! Collapse a raw position batch into an ordered, duplicate-free sequence.
//!
//! A tracker may report the same fix many times (e.g. 30 records sharing a
//! `fixTime` of 12:01:01Z). Only the first report per distinct primary time
//! is kept, where "first" is decided by `deviceTime`. The filter depends only
//! on the lower bound passed in, so re-fetching the same window and running
//! it again with the last emitted time as the bound yields nothing new.

use chrono::{DateTime, Utc};

use super::models::{RecordedAtField, TraccarPosition};

#[derive(Debug, Default)]
pub struct Sequenced {
    pub positions: Vec<TraccarPosition>,
    /// Records dropped as duplicates, stale backfill or missing a primary time.
    pub dropped: usize,
}

pub fn sequence_positions(
    positions: Vec<TraccarPosition>,
    lower_bound: Option<DateTime<Utc>>,
    field: RecordedAtField,
) -> Sequenced {
    let total = positions.len();

    let mut keyed: Vec<(DateTime<Utc>, TraccarPosition)> = positions
        .into_iter()
        .filter_map(|p| p.primary_time(field).map(|t| (t, p)))
        .collect();
    keyed.sort_by(|(ta, a), (tb, b)| ta.cmp(tb).then(a.device_time.cmp(&b.device_time)));

    let mut cursor = lower_bound.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut emitted = Vec::new();

    for (time, position) in keyed {
        if time > cursor {
            cursor = time;
            emitted.push(position);
        }
    }

    Sequenced {
        dropped: total - emitted.len(),
        positions: emitted,
    }
}
