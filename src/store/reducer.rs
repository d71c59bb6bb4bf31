use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::BookingError;
use crate::model::*;
use crate::observability;

use super::action::Action;
use super::cache;
use super::state::*;

/// The store's only transition function. Never suspends, never fails; an
/// action whose precondition does not hold leaves the state unchanged.
pub fn reduce(state: &StoreState, action: Action, now: Ms) -> StoreState {
    let mut next = state.clone();
    match action {
        Action::LoadStart { range, request_id } => {
            let in_flight = Arc::make_mut(&mut next.in_flight);
            // Only the newest fetch for an overlapping window stays current.
            in_flight.retain(|_, r| !r.overlaps(&range));
            in_flight.insert(request_id, range);
            // A retry replaces whatever failure the window last showed.
            next.retain_errors(|key| !key.load_overlaps(&range));
            next.loading = LoadStatus::Pending;
        }

        Action::LoadSuccess { appointments, range, request_id } => {
            if next.in_flight.get(&request_id) != Some(&range) {
                return discard_stale_response(state, "success", request_id);
            }
            Arc::make_mut(&mut next.in_flight).remove(&request_id);
            merge_loaded(&mut next, appointments, range);
            cache::record_loaded(&mut next, range, now);
            next.retain_errors(|key| !key.load_overlaps(&range));
            next.last_sync = Some(now);
            next.loading = settled(&next, LoadStatus::Loaded);
        }

        Action::LoadError { error, range, request_id } => {
            if next.in_flight.get(&request_id) != Some(&range) {
                return discard_stale_response(state, "error", request_id);
            }
            Arc::make_mut(&mut next.in_flight).remove(&request_id);
            set_error(&mut next, ErrorKey::Request { id: request_id, range }, error);
            next.loading = settled(&next, LoadStatus::Failed);
        }

        Action::CreateOptimistic { mut appointment, temp_id } => {
            if next.has_marker(&temp_id) {
                return state.clone();
            }
            appointment.id = temp_id.clone();
            Arc::make_mut(&mut next.appointments).insert(temp_id.clone(), appointment);
            set_marker(&mut next, temp_id.clone(), MarkerKind::Create, now);
            clear_error(&mut next, &temp_id);
        }

        Action::CreateSuccess { appointment, temp_id } => {
            Arc::make_mut(&mut next.appointments).remove(&temp_id);
            Arc::make_mut(&mut next.optimistic).remove(&temp_id);
            Arc::make_mut(&mut next.appointments).insert(appointment.id.clone(), appointment);
        }

        Action::CreateError { temp_id, error } => {
            Arc::make_mut(&mut next.appointments).remove(&temp_id);
            Arc::make_mut(&mut next.optimistic).remove(&temp_id);
            record_rollback("create", &temp_id);
            set_error(&mut next, ErrorKey::Appointment(temp_id), error);
        }

        Action::UpdateOptimistic { id, updates } => {
            if next.has_marker(&id) {
                return state.clone();
            }
            let Some(current) = next.appointments.get(&id) else {
                return state.clone();
            };
            let mut updated = current.clone();
            updates.apply_to(&mut updated);
            updated.updated_at = now;
            Arc::make_mut(&mut next.appointments).insert(id.clone(), updated);
            set_marker(&mut next, id.clone(), MarkerKind::Update, now);
            clear_error(&mut next, &id);
        }

        Action::CancelOptimistic { id, previous: _ } => {
            if next.has_marker(&id) {
                return state.clone();
            }
            let Some(current) = next.appointments.get(&id) else {
                return state.clone();
            };
            let mut cancelled = current.clone();
            cancelled.status = AppointmentStatus::Cancelled;
            cancelled.updated_at = now;
            Arc::make_mut(&mut next.appointments).insert(id.clone(), cancelled);
            set_marker(&mut next, id.clone(), MarkerKind::Update, now);
            clear_error(&mut next, &id);
        }

        Action::UpdateSuccess { appointment } | Action::CancelSuccess { appointment } => {
            Arc::make_mut(&mut next.optimistic).remove(&appointment.id);
            Arc::make_mut(&mut next.appointments).insert(appointment.id.clone(), appointment);
        }

        Action::UpdateError { id, previous, error } => {
            restore(&mut next, id, previous, error, "update");
        }

        Action::CancelError { id, previous, error } => {
            restore(&mut next, id, previous, error, "cancel");
        }

        Action::RemoteUpdated { appointment } | Action::RemoteCreated { appointment } => {
            if next.has_marker(&appointment.id) {
                metrics::counter!(observability::REMOTE_PUSHES_SUPPRESSED_TOTAL).increment(1);
                debug!("remote change for {} suppressed: local mutation in flight", appointment.id);
                return state.clone();
            }
            if let Some(local) = next.appointments.get(&appointment.id)
                && local.updated_at > appointment.updated_at
            {
                metrics::counter!(observability::REMOTE_PUSHES_SUPPRESSED_TOTAL).increment(1);
                debug!("remote change for {} is older than local copy, ignored", appointment.id);
                return state.clone();
            }
            Arc::make_mut(&mut next.appointments).insert(appointment.id.clone(), appointment);
        }

        Action::InvalidateRange { range } => cache::invalidate_range(&mut next, range),

        Action::ClearStale { keep } => cache::clear_stale(&mut next, keep, now),
    }
    next
}

/// Replace what the store holds for `range` with the server's answer. Local
/// appointments in the range that the server did not return are gone
/// server-side. Ids with a marker are left alone either way, and so is a local
/// copy newer than the one in the payload (a push that overtook the fetch).
fn merge_loaded(next: &mut StoreState, payload: Vec<Appointment>, range: DateRange) {
    let returned: HashSet<AppointmentId> = payload.iter().map(|a| a.id.clone()).collect();
    let optimistic = next.optimistic.clone();
    let appointments = Arc::make_mut(&mut next.appointments);
    appointments.retain(|id, a| {
        optimistic.contains_key(id) || !range.contains_date(a.date) || returned.contains(id)
    });
    for appointment in payload {
        if optimistic.contains_key(&appointment.id) {
            continue;
        }
        if let Some(local) = appointments.get(&appointment.id)
            && local.updated_at > appointment.updated_at
        {
            debug!("loaded copy of {} is older than local one, kept local", appointment.id);
            continue;
        }
        appointments.insert(appointment.id.clone(), appointment);
    }
}

fn discard_stale_response(state: &StoreState, outcome: &str, request_id: RequestId) -> StoreState {
    metrics::counter!(observability::STALE_RESPONSES_DISCARDED_TOTAL).increment(1);
    debug!("discarding load {outcome} for superseded request {request_id}");
    state.clone()
}

fn settled(next: &StoreState, done: LoadStatus) -> LoadStatus {
    if next.in_flight.is_empty() {
        done
    } else {
        LoadStatus::Pending
    }
}

fn set_marker(next: &mut StoreState, id: AppointmentId, kind: MarkerKind, now: Ms) {
    Arc::make_mut(&mut next.optimistic).insert(id, OptimisticMarker { kind, at: now });
}

fn clear_error(next: &mut StoreState, id: &AppointmentId) {
    next.retain_errors(|key| !matches!(key, ErrorKey::Appointment(other) if other == id));
}

fn set_error(next: &mut StoreState, key: ErrorKey, error: BookingError) {
    Arc::make_mut(&mut next.errors).insert(key, error);
}

/// Put back the pre-mutation record verbatim.
fn restore(next: &mut StoreState, id: AppointmentId, previous: Appointment, error: BookingError, kind: &'static str) {
    Arc::make_mut(&mut next.appointments).insert(id.clone(), previous);
    Arc::make_mut(&mut next.optimistic).remove(&id);
    record_rollback(kind, &id);
    set_error(next, ErrorKey::Appointment(id), error);
}

fn record_rollback(kind: &'static str, id: &AppointmentId) {
    metrics::counter!(observability::STORE_ROLLBACKS_TOTAL, "kind" => kind).increment(1);
    debug!("rolled back optimistic {kind} of {id}");
}
