//! Booking error taxonomy shared by the service, the optimistic store and the
//! wire layer.
//!
//! Conflict and out-of-hours failures are expected, recoverable user errors;
//! their messages are written to be shown as-is.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{AppointmentId, TimeSlot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    /// Another non-cancelled appointment already holds part of the slot.
    #[error("this time slot is already booked ({date} {slot})")]
    Conflict {
        date: NaiveDate,
        slot: TimeSlot,
        existing: Option<Ulid>,
    },

    /// The requested slot falls outside the shop's working hours.
    #[error("{date} {slot} is outside shop working hours{}", hours_hint(.window))]
    OutOfHours {
        date: NaiveDate,
        slot: TimeSlot,
        window: Option<TimeSlot>,
    },

    /// Missing, or not owned by the caller.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: no valid caller identity")]
    Unauthorized,

    #[error("invalid input: {0}")]
    Validation(String),

    /// Transport or storage failure during a round trip.
    #[error("network error: {0}")]
    Network(String),

    /// A round trip for this appointment is still outstanding.
    #[error("a change to appointment {0} is still being saved")]
    MutationPending(AppointmentId),
}

fn hours_hint(window: &Option<TimeSlot>) -> String {
    match window {
        Some(w) => format!(" (open {w})"),
        None => " (closed that day)".to_string(),
    }
}

impl BookingError {
    /// PostgreSQL SQLSTATE reported to wire clients for this kind.
    pub const fn sqlstate(&self) -> &'static str {
        match self {
            BookingError::Conflict { .. } => "23P01",
            BookingError::OutOfHours { .. } => "23514",
            BookingError::NotFound(_) => "P0002",
            BookingError::Unauthorized => "28000",
            BookingError::Validation(_) => "22023",
            BookingError::Network(_) => "08006",
            BookingError::MutationPending(_) => "55006",
        }
    }

    /// Short label for metrics and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            BookingError::Conflict { .. } => "conflict",
            BookingError::OutOfHours { .. } => "out_of_hours",
            BookingError::NotFound(_) => "not_found",
            BookingError::Unauthorized => "unauthorized",
            BookingError::Validation(_) => "validation",
            BookingError::Network(_) => "network",
            BookingError::MutationPending(_) => "pending",
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        BookingError::NotFound(what.to_string())
    }
}

impl From<EngineError> for BookingError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(id) => BookingError::NotFound(id.to_string()),
            EngineError::AlreadyExists(id) => {
                BookingError::Validation(format!("already exists: {id}"))
            }
            EngineError::Conflict { existing, date, slot } => BookingError::Conflict {
                date,
                slot,
                existing: Some(existing),
            },
            EngineError::OutOfHours { date, slot, window } => BookingError::OutOfHours { date, slot, window },
            EngineError::Invalid(msg) => BookingError::Validation(msg),
            EngineError::LimitExceeded(msg) => BookingError::Validation(format!("limit exceeded: {msg}")),
            EngineError::WalError(msg) => BookingError::Network(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn slot(h1: u32, h2: u32) -> TimeSlot {
        TimeSlot::new(
            NaiveTime::from_hms_opt(h1, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(h2, 0, 0).unwrap(),
        )
    }

    #[test]
    fn conflict_message_is_user_facing() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let err = BookingError::Conflict { date, slot: slot(10, 11), existing: None };
        assert_eq!(err.to_string(), "this time slot is already booked (2024-05-06 10:00–11:00)");
        assert_eq!(err.sqlstate(), "23P01");
    }

    #[test]
    fn out_of_hours_mentions_window() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let err = BookingError::OutOfHours {
            date,
            slot: slot(7, 8),
            window: Some(slot(9, 17)),
        };
        assert!(err.to_string().contains("outside shop working hours (open 09:00–17:00)"));

        let closed = BookingError::OutOfHours { date, slot: slot(10, 11), window: None };
        assert!(closed.to_string().ends_with("(closed that day)"));
    }

    #[test]
    fn engine_errors_map_to_kinds() {
        let id = Ulid::new();
        assert_eq!(BookingError::from(EngineError::NotFound(id)).kind(), "not_found");
        assert_eq!(BookingError::from(EngineError::WalError("disk".into())).kind(), "network");
        assert_eq!(
            BookingError::from(EngineError::LimitExceeded("title too long")).kind(),
            "validation"
        );
    }

    #[test]
    fn sqlstates_are_distinct() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let all = [
            BookingError::Conflict { date, slot: slot(1, 2), existing: None },
            BookingError::OutOfHours { date, slot: slot(1, 2), window: None },
            BookingError::NotFound("x".into()),
            BookingError::Unauthorized,
            BookingError::Validation("x".into()),
            BookingError::Network("x".into()),
            BookingError::MutationPending(AppointmentId::temp(1)),
        ];
        let mut codes: Vec<_> = all.iter().map(|e| e.sqlstate()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }
}
