//! Time-range cache bookkeeping: coverage checks, invalidation and the stale
//! sweep. Pure functions over `StoreState`; the reducer and the store both
//! call into these.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::model::*;

use super::state::{ErrorKey, LoadedRange, StoreState};

/// Whether every day of `range` lies inside some fresh loaded range. Coverage
/// may be stitched together from several adjacent or overlapping loads.
pub fn is_date_range_loaded(ranges: &[LoadedRange], range: DateRange, now: Ms) -> bool {
    let mut fresh: Vec<DateRange> = ranges
        .iter()
        .filter(|r| r.is_fresh(now) && r.range.overlaps(&range))
        .map(|r| r.range)
        .collect();
    fresh.sort_by_key(|r| r.start);

    let mut cursor = range.start;
    for r in fresh {
        if r.start > cursor {
            return false;
        }
        if r.end >= range.end {
            return true;
        }
        match r.end.succ_opt() {
            Some(next) => cursor = cursor.max(next),
            None => return true,
        }
    }
    false
}

/// Appointments dated within `range`, ordered by date, start time, then id.
pub fn appointments_in(state: &StoreState, range: DateRange) -> Vec<Appointment> {
    let mut out: Vec<Appointment> = state
        .appointments
        .values()
        .filter(|a| range.contains_date(a.date))
        .cloned()
        .collect();
    out.sort_by(|a, b| {
        (a.date, a.start_time)
            .cmp(&(b.date, b.start_time))
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

/// Drop loaded ranges fully inside `range`, forcing a refetch.
pub fn invalidate_range(state: &mut StoreState, range: DateRange) {
    if state.loaded_ranges.iter().any(|r| range.contains_range(&r.range)) {
        Arc::make_mut(&mut state.loaded_ranges).retain(|r| !range.contains_range(&r.range));
    }
}

/// Record a successful load: ranges it contains are superseded by it.
pub fn record_loaded(state: &mut StoreState, range: DateRange, now: Ms) {
    let ranges = Arc::make_mut(&mut state.loaded_ranges);
    ranges.retain(|r| !range.contains_range(&r.range));
    ranges.push(LoadedRange {
        range,
        loaded_at: now,
        stale_at: now + state.stale_window,
    });
}

/// The periodic sweep.
///
/// A loaded range survives while fresh, while it overlaps `keep`, or while an
/// appointment dated inside it has an outstanding optimistic marker. An
/// appointment survives while it has a marker, or while its date is covered by
/// a surviving range or by `keep`. Errors go with what they describe: an
/// appointment error outlives its appointment by one sweep at most, and a
/// failed load is only remembered while its range overlaps `keep`.
pub fn clear_stale(state: &mut StoreState, keep: Option<DateRange>, now: Ms) {
    let pinned_dates: HashSet<_> = state
        .optimistic
        .keys()
        .filter_map(|id| state.appointments.get(id))
        .map(|a| a.date)
        .collect();

    let survives = |r: &LoadedRange| {
        r.is_fresh(now)
            || keep.is_some_and(|k| k.overlaps(&r.range))
            || pinned_dates.iter().any(|d| r.range.contains_date(*d))
    };
    if !state.loaded_ranges.iter().all(survives) {
        let before = state.loaded_ranges.len();
        Arc::make_mut(&mut state.loaded_ranges).retain(survives);
        debug!("dropped {} stale ranges", before - state.loaded_ranges.len());
    }

    let covered = |a: &Appointment| {
        keep.is_some_and(|k| k.contains_date(a.date))
            || state.loaded_ranges.iter().any(|r| r.range.contains_date(a.date))
    };
    let evict: Vec<AppointmentId> = state
        .appointments
        .iter()
        .filter(|(id, a)| !state.optimistic.contains_key(*id) && !covered(a))
        .map(|(id, _)| id.clone())
        .collect();
    if !evict.is_empty() {
        let appointments = Arc::make_mut(&mut state.appointments);
        for id in &evict {
            appointments.remove(id);
        }
        debug!("evicted {} uncovered appointments", evict.len());
    }

    let appointments = state.appointments.clone();
    state.retain_errors(|key| match key {
        ErrorKey::Appointment(id) => appointments.contains_key(id),
        ErrorKey::Request { range, .. } => keep.is_some_and(|k| k.overlaps(range)),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    fn loaded(a: u32, b: u32, stale_at: Ms) -> LoadedRange {
        LoadedRange {
            range: DateRange::new(d(a), d(b)),
            loaded_at: 0,
            stale_at,
        }
    }

    #[test]
    fn coverage_stitches_adjacent_ranges() {
        let ranges = vec![loaded(8, 14, 100), loaded(1, 7, 100)];
        assert!(is_date_range_loaded(&ranges, DateRange::new(d(3), d(12)), 50));
        assert!(is_date_range_loaded(&ranges, DateRange::new(d(1), d(14)), 50));
        assert!(!is_date_range_loaded(&ranges, DateRange::new(d(1), d(15)), 50));
    }

    #[test]
    fn coverage_detects_gaps() {
        let ranges = vec![loaded(1, 5, 100), loaded(7, 10, 100)];
        assert!(!is_date_range_loaded(&ranges, DateRange::new(d(4), d(8)), 50));
        assert!(is_date_range_loaded(&ranges, DateRange::single(d(7)), 50));
    }

    #[test]
    fn coverage_ignores_stale_ranges() {
        let ranges = vec![loaded(1, 7, 100)];
        assert!(is_date_range_loaded(&ranges, DateRange::single(d(2)), 99));
        assert!(!is_date_range_loaded(&ranges, DateRange::single(d(2)), 100));
    }

    #[test]
    fn invalidate_drops_only_contained_ranges() {
        let mut state = StoreState::new(100);
        Arc::make_mut(&mut state.loaded_ranges).extend([loaded(1, 7, 100), loaded(5, 20, 100)]);
        invalidate_range(&mut state, DateRange::new(d(1), d(10)));
        assert_eq!(*state.loaded_ranges, vec![loaded(5, 20, 100)]);
    }

    #[test]
    fn record_loaded_supersedes_contained_ranges() {
        let mut state = StoreState::new(100);
        Arc::make_mut(&mut state.loaded_ranges).extend([loaded(2, 3, 10), loaded(20, 25, 10)]);
        record_loaded(&mut state, DateRange::new(d(1), d(7)), 40);
        assert_eq!(*state.loaded_ranges, vec![loaded(20, 25, 10), LoadedRange {
            range: DateRange::new(d(1), d(7)),
            loaded_at: 40,
            stale_at: 140,
        }]);
    }
}
