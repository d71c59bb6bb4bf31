use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::TimeSlot;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("conflict with appointment {existing} on {date} {slot}")]
    Conflict {
        existing: Ulid,
        date: NaiveDate,
        slot: TimeSlot,
    },
    #[error("{slot} on {date} is outside working hours")]
    OutOfHours {
        date: NaiveDate,
        slot: TimeSlot,
        window: Option<TimeSlot>,
    },
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
