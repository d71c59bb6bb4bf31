use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, ShopState};

pub(crate) fn validate_slot(start: NaiveTime, end: NaiveTime) -> Result<TimeSlot, EngineError> {
    TimeSlot::try_new(start, end).ok_or_else(|| {
        EngineError::Invalid(format!(
            "start time {} must be before end time {}",
            start.format("%H:%M"),
            end.format("%H:%M")
        ))
    })
}

pub(crate) fn validate_window(range: &DateRange) -> Result<(), EngineError> {
    if range.days() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_text(title: &str, notes: Option<&str>) -> Result<(), EngineError> {
    if title.trim().is_empty() {
        return Err(EngineError::Invalid("title must not be empty".into()));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

/// The slot must sit inside the shop's opening window for that weekday, as
/// the hours stand under the caller's lock.
pub(crate) fn check_hours(ss: &ShopState, date: NaiveDate, slot: TimeSlot) -> Result<(), EngineError> {
    if ss.hours.allows(date, &slot) {
        return Ok(());
    }
    Err(EngineError::OutOfHours {
        date,
        slot,
        window: ss.hours.window(date),
    })
}

/// Fails with the first active appointment on `date` intersecting `slot`.
/// Cancelled appointments never block; `exclude` skips the appointment being moved.
pub(crate) fn check_no_overlap(
    ss: &ShopState,
    date: NaiveDate,
    slot: TimeSlot,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for existing in ss.overlapping(date, slot) {
        if !existing.is_active() {
            continue;
        }
        let Some(existing_id) = existing.id.saved() else { continue };
        if exclude == Some(existing_id) {
            continue;
        }
        return Err(EngineError::Conflict {
            existing: existing_id,
            date,
            slot,
        });
    }
    Ok(())
}

/// `updated_at` strictly increases per appointment even if the clock stalls.
pub(crate) fn next_updated_at(previous: Ms, now: Ms) -> Ms {
    now.max(previous + 1)
}
