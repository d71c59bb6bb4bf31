use crate::error::BookingError;
use crate::model::*;

use super::state::RequestId;

/// Every state transition of the store. Local call results and remote pushes
/// arrive as the same kind of value and go through the same reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    LoadStart {
        range: DateRange,
        request_id: RequestId,
    },
    LoadSuccess {
        appointments: Vec<Appointment>,
        range: DateRange,
        request_id: RequestId,
    },
    LoadError {
        error: BookingError,
        range: DateRange,
        request_id: RequestId,
    },
    CreateOptimistic {
        appointment: Appointment,
        temp_id: AppointmentId,
    },
    CreateSuccess {
        appointment: Appointment,
        temp_id: AppointmentId,
    },
    CreateError {
        temp_id: AppointmentId,
        error: BookingError,
    },
    UpdateOptimistic {
        id: AppointmentId,
        updates: AppointmentPatch,
    },
    UpdateSuccess {
        appointment: Appointment,
    },
    UpdateError {
        id: AppointmentId,
        previous: Appointment,
        error: BookingError,
    },
    CancelOptimistic {
        id: AppointmentId,
        previous: Appointment,
    },
    CancelSuccess {
        appointment: Appointment,
    },
    CancelError {
        id: AppointmentId,
        previous: Appointment,
        error: BookingError,
    },
    RemoteUpdated {
        appointment: Appointment,
    },
    RemoteCreated {
        appointment: Appointment,
    },
    InvalidateRange {
        range: DateRange,
    },
    ClearStale {
        keep: Option<DateRange>,
    },
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::LoadStart { .. } => "load_start",
            Action::LoadSuccess { .. } => "load_success",
            Action::LoadError { .. } => "load_error",
            Action::CreateOptimistic { .. } => "create_optimistic",
            Action::CreateSuccess { .. } => "create_success",
            Action::CreateError { .. } => "create_error",
            Action::UpdateOptimistic { .. } => "update_optimistic",
            Action::UpdateSuccess { .. } => "update_success",
            Action::UpdateError { .. } => "update_error",
            Action::CancelOptimistic { .. } => "cancel_optimistic",
            Action::CancelSuccess { .. } => "cancel_success",
            Action::CancelError { .. } => "cancel_error",
            Action::RemoteUpdated { .. } => "remote_updated",
            Action::RemoteCreated { .. } => "remote_created",
            Action::InvalidateRange { .. } => "invalidate_range",
            Action::ClearStale { .. } => "clear_stale",
        }
    }
}

impl From<ChangeNotice> for Action {
    /// Cancellations are status transitions, merged like any other update.
    fn from(notice: ChangeNotice) -> Self {
        match notice {
            ChangeNotice::Created(appointment) => Action::RemoteCreated { appointment },
            ChangeNotice::Updated(appointment) | ChangeNotice::Cancelled(appointment) => {
                Action::RemoteUpdated { appointment }
            }
        }
    }
}
