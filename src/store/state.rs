use std::collections::HashMap;
use std::sync::Arc;

use ulid::Ulid;

use crate::error::BookingError;
use crate::model::*;

/// Identifies one range fetch.
pub type RequestId = Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Create,
    Update,
}

/// An outstanding round trip for one appointment id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimisticMarker {
    pub kind: MarkerKind,
    pub at: Ms,
}

/// A fetched window and when it stops being trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedRange {
    pub range: DateRange,
    pub loaded_at: Ms,
    pub stale_at: Ms,
}

impl LoadedRange {
    pub fn is_fresh(&self, now: Ms) -> bool {
        now < self.stale_at
    }
}

/// Where a failure is reported: against an appointment, or against the fetch
/// of a range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKey {
    Appointment(AppointmentId),
    Request { id: RequestId, range: DateRange },
}

impl ErrorKey {
    pub fn load_overlaps(&self, other: &DateRange) -> bool {
        matches!(self, ErrorKey::Request { range, .. } if range.overlaps(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadStatus {
    #[default]
    Idle,
    Pending,
    Loaded,
    Failed,
}

/// Five minutes.
pub const DEFAULT_STALE_WINDOW_MS: Ms = 5 * 60 * 1000;

/// Immutable snapshot of the client-side appointment cache.
///
/// Every collection sits behind an `Arc`; transitions go through
/// `Arc::make_mut`, so cloning a snapshot is cheap and untouched collections
/// stay shared between successive states.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreState {
    pub appointments: Arc<HashMap<AppointmentId, Appointment>>,
    pub loaded_ranges: Arc<Vec<LoadedRange>>,
    pub in_flight: Arc<HashMap<RequestId, DateRange>>,
    pub optimistic: Arc<HashMap<AppointmentId, OptimisticMarker>>,
    pub errors: Arc<HashMap<ErrorKey, BookingError>>,
    pub loading: LoadStatus,
    pub last_sync: Option<Ms>,
    pub stale_window: Ms,
}

impl Default for StoreState {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_WINDOW_MS)
    }
}

impl StoreState {
    pub fn new(stale_window: Ms) -> Self {
        Self {
            appointments: Arc::default(),
            loaded_ranges: Arc::default(),
            in_flight: Arc::default(),
            optimistic: Arc::default(),
            errors: Arc::default(),
            loading: LoadStatus::Idle,
            last_sync: None,
            stale_window,
        }
    }

    pub fn appointment(&self, id: &AppointmentId) -> Option<&Appointment> {
        self.appointments.get(id)
    }

    pub fn marker(&self, id: &AppointmentId) -> Option<&OptimisticMarker> {
        self.optimistic.get(id)
    }

    pub fn has_marker(&self, id: &AppointmentId) -> bool {
        self.optimistic.contains_key(id)
    }

    pub fn error_for(&self, key: &ErrorKey) -> Option<&BookingError> {
        self.errors.get(key)
    }

    /// Every collection is the same allocation and the scalars match. Reducer
    /// branches that leave a collection alone keep sharing it, so this spots
    /// a no-op transition without walking the maps.
    pub fn shares_all(&self, other: &StoreState) -> bool {
        Arc::ptr_eq(&self.appointments, &other.appointments)
            && Arc::ptr_eq(&self.loaded_ranges, &other.loaded_ranges)
            && Arc::ptr_eq(&self.in_flight, &other.in_flight)
            && Arc::ptr_eq(&self.optimistic, &other.optimistic)
            && Arc::ptr_eq(&self.errors, &other.errors)
            && self.loading == other.loading
            && self.last_sync == other.last_sync
            && self.stale_window == other.stale_window
    }

    /// Drop the error entries for which `keep` is false. The map is only
    /// copied when something actually goes.
    pub fn retain_errors(&mut self, mut keep: impl FnMut(&ErrorKey) -> bool) {
        if !self.errors.keys().all(&mut keep) {
            Arc::make_mut(&mut self.errors).retain(|key, _| keep(key));
        }
    }

    /// Same state ignoring the error map. Rollbacks restore everything else.
    pub fn eq_ignoring_errors(&self, other: &StoreState) -> bool {
        self.appointments == other.appointments
            && self.loaded_ranges == other.loaded_ranges
            && self.in_flight == other.in_flight
            && self.optimistic == other.optimistic
            && self.loading == other.loading
            && self.last_sync == other.last_sync
            && self.stale_window == other.stale_window
    }
}
