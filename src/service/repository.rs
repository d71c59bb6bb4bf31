use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeDelta};
use ulid::Ulid;

use crate::engine::Engine;
use crate::error::BookingError;
use crate::model::*;

/// Durable appointment storage. Both conditional writes must check working
/// hours and overlap, and write, as one atomic step.
#[async_trait]
pub trait AppointmentRepository: Send + Sync {
    async fn insert_if_no_overlap(&self, draft: &NewAppointment) -> Result<Appointment, BookingError>;

    async fn update_if_no_overlap(
        &self,
        id: Ulid,
        patch: &AppointmentPatch,
        exclude_self: bool,
    ) -> Result<Appointment, BookingError>;

    async fn cancel(&self, id: Ulid) -> Result<Appointment, BookingError>;

    async fn query_in_range(
        &self,
        shop_id: Ulid,
        range: DateRange,
        include_cancelled: bool,
    ) -> Result<Vec<Appointment>, BookingError>;

    async fn count_by_date(
        &self,
        shop_id: Ulid,
        range: DateRange,
    ) -> Result<BTreeMap<NaiveDate, u32>, BookingError>;

    async fn get(&self, id: Ulid) -> Option<Appointment>;

    async fn free_slots(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        min_duration: Option<TimeDelta>,
    ) -> Result<Vec<TimeSlot>, BookingError>;
}

/// Shop records and ownership.
#[async_trait]
pub trait ShopDirectory: Send + Sync {
    async fn shop(&self, shop_id: Ulid) -> Option<ShopInfo>;

    async fn create_shop(
        &self,
        id: Ulid,
        owner: &str,
        name: Option<String>,
        hours: WorkingHours,
    ) -> Result<ShopInfo, BookingError>;

    async fn set_hours(&self, shop_id: Ulid, hours: WorkingHours) -> Result<(), BookingError>;

    async fn register_client(
        &self,
        shop_id: Ulid,
        client: ClientSummary,
    ) -> Result<ClientSummary, BookingError>;

    async fn shops_owned_by(&self, owner: &str) -> Vec<ShopInfo>;
}

#[async_trait]
impl AppointmentRepository for Engine {
    async fn insert_if_no_overlap(&self, draft: &NewAppointment) -> Result<Appointment, BookingError> {
        Ok(self.insert_appointment_if_no_overlap(draft).await?)
    }

    async fn update_if_no_overlap(
        &self,
        id: Ulid,
        patch: &AppointmentPatch,
        exclude_self: bool,
    ) -> Result<Appointment, BookingError> {
        Ok(self.update_appointment_if_no_overlap(id, patch, exclude_self).await?)
    }

    async fn cancel(&self, id: Ulid) -> Result<Appointment, BookingError> {
        Ok(self.cancel_appointment(id).await?)
    }

    async fn query_in_range(
        &self,
        shop_id: Ulid,
        range: DateRange,
        include_cancelled: bool,
    ) -> Result<Vec<Appointment>, BookingError> {
        Ok(self
            .query_appointments_in_range(shop_id, range, include_cancelled)
            .await?)
    }

    async fn count_by_date(
        &self,
        shop_id: Ulid,
        range: DateRange,
    ) -> Result<BTreeMap<NaiveDate, u32>, BookingError> {
        Ok(self.count_appointments_by_date(shop_id, range).await?)
    }

    async fn get(&self, id: Ulid) -> Option<Appointment> {
        self.get_appointment(id).await
    }

    async fn free_slots(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        min_duration: Option<TimeDelta>,
    ) -> Result<Vec<TimeSlot>, BookingError> {
        Ok(Engine::free_slots(self, shop_id, date, min_duration).await?)
    }
}

#[async_trait]
impl ShopDirectory for Engine {
    async fn shop(&self, shop_id: Ulid) -> Option<ShopInfo> {
        self.shop_info(shop_id).await
    }

    async fn create_shop(
        &self,
        id: Ulid,
        owner: &str,
        name: Option<String>,
        hours: WorkingHours,
    ) -> Result<ShopInfo, BookingError> {
        Engine::create_shop(self, id, owner.to_string(), name.clone(), hours.clone()).await?;
        Ok(ShopInfo {
            id,
            owner: owner.to_string(),
            name,
            hours,
        })
    }

    async fn set_hours(&self, shop_id: Ulid, hours: WorkingHours) -> Result<(), BookingError> {
        Ok(self.update_shop_hours(shop_id, hours).await?)
    }

    async fn register_client(
        &self,
        shop_id: Ulid,
        client: ClientSummary,
    ) -> Result<ClientSummary, BookingError> {
        Ok(Engine::register_client(self, shop_id, client).await?)
    }

    async fn shops_owned_by(&self, owner: &str) -> Vec<ShopInfo> {
        self.list_shops(Some(owner)).await
    }
}
