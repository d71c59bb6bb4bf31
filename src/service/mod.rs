//! Booking rules on top of an atomic appointment store: caller ownership,
//! working hours, and the cached per-date counts that every mutation
//! invalidates.

mod counts_cache;
mod repository;

pub use counts_cache::{CountsCache, DateCounts};
pub use repository::{AppointmentRepository, ShopDirectory};

use std::sync::Arc;

use chrono::{NaiveDate, TimeDelta};
use tracing::{info, warn};
use ulid::Ulid;

use crate::error::BookingError;
use crate::limits::MAX_PRINCIPAL_LEN;
use crate::model::*;
use crate::observability;

/// Authenticated principal on whose behalf a request runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caller {
    principal: String,
}

impl Caller {
    /// Fails with `Unauthorized` for a missing or blank principal.
    pub fn resolve(principal: Option<&str>) -> Result<Self, BookingError> {
        match principal.map(str::trim) {
            Some(p) if !p.is_empty() && p.len() <= MAX_PRINCIPAL_LEN => Ok(Self {
                principal: p.to_string(),
            }),
            _ => Err(BookingError::Unauthorized),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }
}

pub struct BookingService<S> {
    store: Arc<S>,
    counts: CountsCache,
}

impl<S> BookingService<S>
where
    S: AppointmentRepository + ShopDirectory,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            counts: CountsCache::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn counts_cache(&self) -> &CountsCache {
        &self.counts
    }

    /// The shop, if it exists and belongs to the caller. Foreign shops are
    /// reported exactly like missing ones.
    async fn owned_shop(&self, caller: &Caller, shop_id: Ulid) -> Result<ShopInfo, BookingError> {
        match self.store.shop(shop_id).await {
            Some(shop) if shop.owner == caller.principal() => Ok(shop),
            _ => Err(BookingError::not_found(format!("shop {shop_id}"))),
        }
    }

    async fn owned_appointment(&self, caller: &Caller, id: Ulid) -> Result<(ShopInfo, Appointment), BookingError> {
        let not_found = || BookingError::not_found(format!("appointment {id}"));
        let appointment = self.store.get(id).await.ok_or_else(not_found)?;
        let shop = self
            .owned_shop(caller, appointment.shop_id)
            .await
            .map_err(|_| not_found())?;
        Ok((shop, appointment))
    }

    fn record_outcome<T>(&self, op: &'static str, shop_id: Ulid, result: &Result<T, BookingError>) {
        match result {
            Ok(_) => self.counts.invalidate_shop(shop_id),
            Err(e @ BookingError::Conflict { .. }) => {
                metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                info!("{op} rejected for shop {shop_id}: {e}");
            }
            Err(e @ BookingError::OutOfHours { .. }) => {
                metrics::counter!(observability::OUT_OF_HOURS_TOTAL).increment(1);
                info!("{op} rejected for shop {shop_id}: {e}");
            }
            Err(e) => warn!("{op} failed for shop {shop_id}: {e}"),
        }
    }

    // ── Appointments ─────────────────────────────────────

    pub async fn create_appointment(
        &self,
        caller: &Caller,
        draft: NewAppointment,
    ) -> Result<Appointment, BookingError> {
        let shop = self.owned_shop(caller, draft.shop_id).await?;
        let result = self.store.insert_if_no_overlap(&draft).await;
        self.record_outcome("create", shop.id, &result);
        result
    }

    /// Applies a partial update. Hours and overlap are re-validated whenever
    /// the appointment moves or comes back from cancellation; it never
    /// conflicts with itself.
    pub async fn update_appointment(
        &self,
        caller: &Caller,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, BookingError> {
        let (shop, _) = self.owned_appointment(caller, id).await?;
        let result = self.store.update_if_no_overlap(id, &patch, true).await;
        self.record_outcome("update", shop.id, &result);
        result
    }

    /// Soft cancel. Cancelling twice succeeds both times.
    pub async fn cancel_appointment(&self, caller: &Caller, id: Ulid) -> Result<Appointment, BookingError> {
        let (shop, _) = self.owned_appointment(caller, id).await?;
        let result = self.store.cancel(id).await;
        self.record_outcome("cancel", shop.id, &result);
        result
    }

    pub async fn get_appointment(&self, caller: &Caller, id: Ulid) -> Result<Appointment, BookingError> {
        self.owned_appointment(caller, id).await.map(|(_, a)| a)
    }

    /// One round trip for the whole window, ordered by date then start time.
    pub async fn get_appointments_by_time_range(
        &self,
        caller: &Caller,
        shop_id: Ulid,
        range: DateRange,
        include_cancelled: bool,
    ) -> Result<Vec<Appointment>, BookingError> {
        self.owned_shop(caller, shop_id).await?;
        self.store.query_in_range(shop_id, range, include_cancelled).await
    }

    pub async fn get_appointment_counts(
        &self,
        caller: &Caller,
        shop_id: Ulid,
        range: DateRange,
    ) -> Result<Arc<DateCounts>, BookingError> {
        self.owned_shop(caller, shop_id).await?;
        if let Some(hit) = self.counts.get(shop_id, range) {
            metrics::counter!(observability::COUNTS_CACHE_HITS_TOTAL).increment(1);
            return Ok(hit);
        }
        let generation = self.counts.generation(shop_id);
        let counts = Arc::new(self.store.count_by_date(shop_id, range).await?);
        self.counts.insert(shop_id, range, generation, counts.clone());
        Ok(counts)
    }

    pub async fn free_slots(
        &self,
        caller: &Caller,
        shop_id: Ulid,
        date: NaiveDate,
        min_duration: Option<TimeDelta>,
    ) -> Result<Vec<TimeSlot>, BookingError> {
        self.owned_shop(caller, shop_id).await?;
        self.store.free_slots(shop_id, date, min_duration).await
    }

    // ── Shop administration ──────────────────────────────

    pub async fn register_shop(
        &self,
        caller: &Caller,
        id: Ulid,
        name: Option<String>,
        hours: WorkingHours,
    ) -> Result<ShopInfo, BookingError> {
        let shop = self
            .store
            .create_shop(id, caller.principal(), name, hours)
            .await?;
        info!("shop {id} registered by {}", caller.principal());
        Ok(shop)
    }

    pub async fn set_working_hours(
        &self,
        caller: &Caller,
        shop_id: Ulid,
        hours: WorkingHours,
    ) -> Result<(), BookingError> {
        self.owned_shop(caller, shop_id).await?;
        self.store.set_hours(shop_id, hours).await
    }

    pub async fn register_client(
        &self,
        caller: &Caller,
        shop_id: Ulid,
        client: ClientSummary,
    ) -> Result<ClientSummary, BookingError> {
        self.owned_shop(caller, shop_id).await?;
        self.store.register_client(shop_id, client).await
    }

    pub async fn list_shops(&self, caller: &Caller) -> Vec<ShopInfo> {
        self.store.shops_owned_by(caller.principal()).await
    }
}
