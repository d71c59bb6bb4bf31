use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::error::BookingError;
use crate::model::*;
use crate::service::{AppointmentRepository, BookingService, Caller, ShopDirectory};

use super::action::Action;
use super::cache;
use super::reducer::reduce;
use super::state::{ErrorKey, StoreState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long a loaded range is trusted.
    pub stale_window: Duration,
    /// Upper bound on every round trip; expiry counts as a network failure.
    pub request_timeout: Duration,
    /// Period of the background `ClearStale` sweep.
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            stale_window: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// The network boundary the store talks through.
#[async_trait]
pub trait BookingApi: Send + Sync {
    /// Every appointment of `shop_id` dated inside `range`, cancelled ones
    /// included, so a load reflects cancellations precisely.
    async fn fetch_range(&self, shop_id: Ulid, range: DateRange) -> Result<Vec<Appointment>, BookingError>;

    async fn create(&self, draft: NewAppointment) -> Result<Appointment, BookingError>;

    async fn update(&self, id: Ulid, patch: AppointmentPatch) -> Result<Appointment, BookingError>;

    async fn cancel(&self, id: Ulid) -> Result<Appointment, BookingError>;
}

/// In-process transport: calls a `BookingService` directly as `caller`.
pub struct LocalBookingApi<S> {
    service: Arc<BookingService<S>>,
    caller: Caller,
}

impl<S> LocalBookingApi<S> {
    pub fn new(service: Arc<BookingService<S>>, caller: Caller) -> Self {
        Self { service, caller }
    }
}

#[async_trait]
impl<S> BookingApi for LocalBookingApi<S>
where
    S: AppointmentRepository + ShopDirectory + 'static,
{
    async fn fetch_range(&self, shop_id: Ulid, range: DateRange) -> Result<Vec<Appointment>, BookingError> {
        self.service
            .get_appointments_by_time_range(&self.caller, shop_id, range, true)
            .await
    }

    async fn create(&self, draft: NewAppointment) -> Result<Appointment, BookingError> {
        self.service.create_appointment(&self.caller, draft).await
    }

    async fn update(&self, id: Ulid, patch: AppointmentPatch) -> Result<Appointment, BookingError> {
        self.service.update_appointment(&self.caller, id, patch).await
    }

    async fn cancel(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.service.cancel_appointment(&self.caller, id).await
    }
}

/// One session's view of one shop's calendar.
///
/// State lives in a `watch` channel: every transition runs `reduce` under the
/// channel's lock and subscribers see each resulting snapshot. Round trips run
/// outside the lock and report back through `dispatch`.
pub struct AppointmentStore<A> {
    api: A,
    shop_id: Ulid,
    config: StoreConfig,
    state: watch::Sender<StoreState>,
    temp_seq: AtomicU64,
}

impl<A: BookingApi> AppointmentStore<A> {
    pub fn new(api: A, shop_id: Ulid, config: StoreConfig) -> Self {
        let stale_window = config.stale_window.as_millis() as Ms;
        Self {
            api,
            shop_id,
            config,
            state: watch::Sender::new(StoreState::new(stale_window)),
            temp_seq: AtomicU64::new(0),
        }
    }

    pub fn shop_id(&self) -> Ulid {
        self.shop_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Run one action through the reducer. Subscribers are only woken when
    /// the state actually changed.
    pub fn dispatch(&self, action: Action) {
        let now = now_ms();
        let label = action.label();
        let changed = self.state.send_if_modified(|state| {
            let next = reduce(state, action, now);
            if next.shares_all(state) {
                return false;
            }
            *state = next;
            true
        });
        if !changed {
            debug!("{label} left store for shop {} unchanged", self.shop_id);
        }
    }

    pub fn snapshot(&self) -> StoreState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreState> {
        self.state.subscribe()
    }

    pub fn error_for(&self, key: &ErrorKey) -> Option<BookingError> {
        self.state.borrow().error_for(key).cloned()
    }

    pub fn get_appointments_for_date_range(&self, range: DateRange) -> Vec<Appointment> {
        cache::appointments_in(&self.state.borrow(), range)
    }

    pub fn is_date_range_loaded(&self, range: DateRange) -> bool {
        cache::is_date_range_loaded(&self.state.borrow().loaded_ranges, range, now_ms())
    }

    /// Fetch `range` and merge it. A response overtaken by a newer
    /// overlapping load is dropped by the reducer; the caller still gets the
    /// store's current view of the range.
    pub async fn load_appointments(&self, range: DateRange) -> Result<Vec<Appointment>, BookingError> {
        let request_id = Ulid::new();
        self.dispatch(Action::LoadStart { range, request_id });

        match self.bounded(self.api.fetch_range(self.shop_id, range)).await {
            Ok(appointments) => {
                self.dispatch(Action::LoadSuccess { appointments, range, request_id });
                Ok(self.get_appointments_for_date_range(range))
            }
            Err(error) => {
                warn!("loading {range} for shop {} failed: {error}", self.shop_id);
                self.dispatch(Action::LoadError { error: error.clone(), range, request_id });
                Err(error)
            }
        }
    }

    /// Serve from cache while the range is fresh, otherwise load it.
    pub async fn ensure_loaded(&self, range: DateRange) -> Result<Vec<Appointment>, BookingError> {
        if self.is_date_range_loaded(range) {
            return Ok(self.get_appointments_for_date_range(range));
        }
        self.load_appointments(range).await
    }

    /// Shows the draft under a `temp-N` id at once, then swaps in the saved
    /// record or removes the placeholder again.
    pub async fn create_appointment(&self, draft: NewAppointment) -> Result<Appointment, BookingError> {
        if draft.shop_id != self.shop_id {
            return Err(BookingError::Validation(format!(
                "appointment belongs to shop {}, store tracks shop {}",
                draft.shop_id, self.shop_id
            )));
        }
        let temp_id = AppointmentId::temp(self.temp_seq.fetch_add(1, Ordering::Relaxed) + 1);
        self.dispatch(Action::CreateOptimistic {
            appointment: placeholder(&draft, now_ms()),
            temp_id: temp_id.clone(),
        });
        let guard = self.rollback_on_drop(Action::CreateError {
            temp_id: temp_id.clone(),
            error: abandoned(),
        });

        let result = self.bounded(self.api.create(draft)).await;
        guard.disarm();
        match result {
            Ok(appointment) => {
                self.dispatch(Action::CreateSuccess {
                    appointment: appointment.clone(),
                    temp_id,
                });
                Ok(appointment)
            }
            Err(error) => {
                self.dispatch(Action::CreateError { temp_id, error: error.clone() });
                Err(error)
            }
        }
    }

    pub async fn update_appointment(
        &self,
        id: &AppointmentId,
        patch: AppointmentPatch,
    ) -> Result<Appointment, BookingError> {
        let (server_id, previous) = self.begin_mutation(id, |_| Action::UpdateOptimistic {
            id: id.clone(),
            updates: patch.clone(),
        })?;

        let guard = self.rollback_on_drop(Action::UpdateError {
            id: id.clone(),
            previous: previous.clone(),
            error: abandoned(),
        });

        let result = self.bounded(self.api.update(server_id, patch)).await;
        guard.disarm();
        match result {
            Ok(appointment) => {
                self.dispatch(Action::UpdateSuccess { appointment: appointment.clone() });
                Ok(appointment)
            }
            Err(error) => {
                self.dispatch(Action::UpdateError {
                    id: id.clone(),
                    previous,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    pub async fn cancel_appointment(&self, id: &AppointmentId) -> Result<Appointment, BookingError> {
        let (server_id, previous) = self.begin_mutation(id, |previous| Action::CancelOptimistic {
            id: id.clone(),
            previous: previous.clone(),
        })?;

        let guard = self.rollback_on_drop(Action::CancelError {
            id: id.clone(),
            previous: previous.clone(),
            error: abandoned(),
        });

        let result = self.bounded(self.api.cancel(server_id)).await;
        guard.disarm();
        match result {
            Ok(appointment) => {
                self.dispatch(Action::CancelSuccess { appointment: appointment.clone() });
                Ok(appointment)
            }
            Err(error) => {
                self.dispatch(Action::CancelError {
                    id: id.clone(),
                    previous,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Merge a pushed change. Notices for other shops are ignored.
    pub fn apply_notice(&self, notice: ChangeNotice) {
        let shop_id = notice.appointment().shop_id;
        if shop_id != self.shop_id {
            debug!("ignoring notice for shop {shop_id} in store for {}", self.shop_id);
            return;
        }
        self.dispatch(Action::from(notice));
    }

    pub fn invalidate_range(&self, range: DateRange) {
        self.dispatch(Action::InvalidateRange { range });
    }

    pub fn clear_stale(&self, keep: Option<DateRange>) {
        self.dispatch(Action::ClearStale { keep });
    }

    /// Check that `id` may be mutated and apply the optimistic action, as one
    /// step under the state lock so two callers cannot both get through.
    /// Returns the server id and the record as it was before.
    fn begin_mutation(
        &self,
        id: &AppointmentId,
        optimistic: impl FnOnce(&Appointment) -> Action,
    ) -> Result<(Ulid, Appointment), BookingError> {
        let now = now_ms();
        let mut outcome = Err(BookingError::not_found(format!("appointment {id}")));
        self.state.send_if_modified(|state| {
            let Some(previous) = state.appointment(id) else {
                return false;
            };
            // A temp id always carries its create marker until it resolves.
            let server_id = match id.saved() {
                Some(server_id) if !state.has_marker(id) => server_id,
                _ => {
                    outcome = Err(BookingError::MutationPending(id.clone()));
                    return false;
                }
            };
            let previous = previous.clone();
            *state = reduce(state, optimistic(&previous), now);
            outcome = Ok((server_id, previous));
            true
        });
        outcome
    }

    fn rollback_on_drop(&self, undo: Action) -> RollbackGuard<'_, A> {
        RollbackGuard {
            store: self,
            undo: Some(undo),
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, BookingError>>) -> Result<T, BookingError> {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BookingError::Network(format!(
                "request timed out after {} ms",
                self.config.request_timeout.as_millis()
            ))),
        }
    }
}

/// Dispatches the rollback for an optimistic action unless disarmed. Covers a
/// round trip whose future is dropped before it reports back, so the marker
/// never outlives the request.
struct RollbackGuard<'a, A: BookingApi> {
    store: &'a AppointmentStore<A>,
    undo: Option<Action>,
}

impl<A: BookingApi> RollbackGuard<'_, A> {
    fn disarm(mut self) {
        self.undo = None;
    }
}

impl<A: BookingApi> Drop for RollbackGuard<'_, A> {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            warn!("round trip abandoned in store for shop {}, dispatching {}", self.store.shop_id, undo.label());
            self.store.dispatch(undo);
        }
    }
}

fn abandoned() -> BookingError {
    BookingError::Network("request abandoned".into())
}

/// What the UI shows while the create is in flight.
fn placeholder(draft: &NewAppointment, now: Ms) -> Appointment {
    Appointment {
        id: AppointmentId::temp("pending"),
        shop_id: draft.shop_id,
        client_id: draft.client_id,
        order_id: draft.order_id,
        title: draft.title.clone(),
        date: draft.date,
        start_time: draft.start_time,
        end_time: draft.end_time,
        kind: draft.kind,
        status: AppointmentStatus::Scheduled,
        notes: draft.notes.clone(),
        reminder_sent: false,
        client: None,
        created_at: now,
        updated_at: now,
    }
}
