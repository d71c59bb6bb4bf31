use chrono::{NaiveDate, TimeDelta};

use crate::model::*;

// ── Free slot computation ─────────────────────────────────────────

/// Bookable gaps on `date`: the day's working-hours window minus every active
/// appointment, optionally dropping gaps shorter than `min_duration`.
///
/// `booked` may be in any order and may include cancelled appointments; they
/// are skipped. A closed day yields nothing.
pub fn free_slots<'a>(
    hours: &WorkingHours,
    date: NaiveDate,
    booked: impl IntoIterator<Item = &'a Appointment>,
    min_duration: Option<TimeDelta>,
) -> Vec<TimeSlot> {
    let Some(window) = hours.window(date) else {
        return Vec::new();
    };

    let mut busy: Vec<TimeSlot> = booked
        .into_iter()
        .filter(|a| a.is_active() && a.date == date)
        .map(|a| a.slot())
        .collect();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    let free = subtract_slots(&[window], &busy);
    match min_duration {
        Some(min) => free.into_iter().filter(|s| s.duration() >= min).collect(),
        None => free,
    }
}

/// Merge sorted overlapping/adjacent slots into disjoint slots.
pub fn merge_overlapping(sorted: &[TimeSlot]) -> Vec<TimeSlot> {
    let mut merged: Vec<TimeSlot> = Vec::new();
    for &slot in sorted {
        if let Some(last) = merged.last_mut()
            && slot.start <= last.end
        {
            last.end = last.end.max(slot.end);
            continue;
        }
        merged.push(slot);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start and disjoint.
pub fn subtract_slots(base: &[TimeSlot], to_remove: &[TimeSlot]) -> Vec<TimeSlot> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(TimeSlot::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(TimeSlot::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};
    use ulid::Ulid;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn s(h1: u32, m1: u32, h2: u32, m2: u32) -> TimeSlot {
        TimeSlot::new(t(h1, m1), t(h2, m2))
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
    }

    fn booked(date: NaiveDate, slot: TimeSlot, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: AppointmentId::Saved(Ulid::new()),
            shop_id: Ulid::new(),
            client_id: None,
            order_id: None,
            title: "x".into(),
            date,
            start_time: slot.start,
            end_time: slot.end,
            kind: AppointmentType::Consultation,
            status,
            notes: None,
            reminder_sent: false,
            client: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn subtract_no_overlap() {
        let base = vec![s(9, 0, 12, 0)];
        let remove = vec![s(13, 0, 14, 0)];
        assert_eq!(subtract_slots(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![s(10, 0, 11, 0)];
        let remove = vec![s(9, 0, 12, 0)];
        assert!(subtract_slots(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![s(9, 0, 17, 0)];
        let remove = vec![s(12, 0, 13, 0)];
        assert_eq!(
            subtract_slots(&base, &remove),
            vec![s(9, 0, 12, 0), s(13, 0, 17, 0)]
        );
    }

    #[test]
    fn subtract_multiple_punches_across_bases() {
        let base = vec![s(9, 0, 12, 0), s(13, 0, 17, 0)];
        let remove = vec![s(9, 0, 9, 30), s(11, 0, 13, 30), s(16, 0, 18, 0)];
        assert_eq!(
            subtract_slots(&base, &remove),
            vec![s(9, 30, 11, 0), s(13, 30, 16, 0)]
        );
    }

    #[test]
    fn merge_overlapping_and_adjacent() {
        let input = vec![s(9, 0, 10, 0), s(9, 30, 11, 0), s(11, 0, 11, 30), s(14, 0, 15, 0)];
        assert_eq!(
            merge_overlapping(&input),
            vec![s(9, 0, 11, 30), s(14, 0, 15, 0)]
        );
    }

    #[test]
    fn free_slots_skips_cancelled_and_other_dates() {
        let hours = WorkingHours::uniform(t(9, 0), t(17, 0));
        let day = monday();
        let apts = vec![
            booked(day, s(10, 0, 11, 0), AppointmentStatus::Scheduled),
            booked(day, s(12, 0, 13, 0), AppointmentStatus::Cancelled),
            booked(day.succ_opt().unwrap(), s(14, 0, 15, 0), AppointmentStatus::Confirmed),
            booked(day, s(16, 0, 17, 0), AppointmentStatus::Completed),
        ];
        assert_eq!(
            free_slots(&hours, day, &apts, None),
            vec![s(9, 0, 10, 0), s(11, 0, 16, 0)]
        );
    }

    #[test]
    fn free_slots_min_duration_filters_gaps() {
        let hours = WorkingHours::uniform(t(9, 0), t(12, 0));
        let day = monday();
        let apts = vec![
            booked(day, s(9, 20, 10, 0), AppointmentStatus::Scheduled),
            booked(day, s(11, 0, 11, 45), AppointmentStatus::Scheduled),
        ];
        let free = free_slots(&hours, day, &apts, Some(TimeDelta::minutes(30)));
        assert_eq!(free, vec![s(10, 0, 11, 0)]);
    }

    #[test]
    fn free_slots_closed_day_is_empty() {
        let hours = WorkingHours::uniform(t(9, 0), t(17, 0)).with_day(Weekday::Mon, None);
        assert!(free_slots(&hours, monday(), &[], None).is_empty());
    }

    #[test]
    fn free_slots_fully_booked() {
        let hours = WorkingHours::uniform(t(9, 0), t(10, 0));
        let apts = vec![booked(monday(), s(9, 0, 10, 0), AppointmentStatus::Scheduled)];
        assert!(free_slots(&hours, monday(), &apts, None).is_empty());
    }
}
