use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeDelta};
use ulid::Ulid;

use crate::model::*;

use super::availability::free_slots;
use super::conflict::validate_window;
use super::{Engine, EngineError};

impl Engine {
    /// Appointments dated within `range` with client summaries joined,
    /// ordered by date then start time. An unknown shop has no appointments.
    pub async fn query_appointments_in_range(
        &self,
        shop_id: Ulid,
        range: DateRange,
        include_cancelled: bool,
    ) -> Result<Vec<Appointment>, EngineError> {
        validate_window(&range)?;
        let Some(ss) = self.get_shop(&shop_id) else {
            return Ok(vec![]);
        };
        let guard = ss.read().await;
        Ok(guard
            .in_range(range)
            .filter(|a| include_cancelled || a.is_active())
            .map(|a| guard.joined(a))
            .collect())
    }

    /// Non-cancelled appointments per date. Dates with none are omitted.
    pub async fn count_appointments_by_date(
        &self,
        shop_id: Ulid,
        range: DateRange,
    ) -> Result<BTreeMap<NaiveDate, u32>, EngineError> {
        validate_window(&range)?;
        let mut counts = BTreeMap::new();
        let Some(ss) = self.get_shop(&shop_id) else {
            return Ok(counts);
        };
        let guard = ss.read().await;
        for a in guard.in_range(range).filter(|a| a.is_active()) {
            *counts.entry(a.date).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub async fn get_appointment(&self, id: Ulid) -> Option<Appointment> {
        let shop_id = self.get_shop_for_entity(&id)?;
        let ss = self.get_shop(&shop_id)?;
        let guard = ss.read().await;
        guard.get(id).map(|a| guard.joined(a))
    }

    pub async fn shop_info(&self, shop_id: Ulid) -> Option<ShopInfo> {
        let ss = self.get_shop(&shop_id)?;
        let guard = ss.read().await;
        Some(guard.info())
    }

    pub async fn client_summary(&self, client_id: Ulid) -> Option<ClientSummary> {
        let shop_id = self.get_shop_for_entity(&client_id)?;
        let ss = self.get_shop(&shop_id)?;
        let guard = ss.read().await;
        guard.clients.get(&client_id).cloned()
    }

    pub async fn list_clients(&self, shop_id: Ulid) -> Result<Vec<ClientSummary>, EngineError> {
        let ss = self.get_shop(&shop_id).ok_or(EngineError::NotFound(shop_id))?;
        let guard = ss.read().await;
        let mut clients: Vec<_> = guard.clients.values().cloned().collect();
        clients.sort_by_key(|c| c.id);
        Ok(clients)
    }

    /// Free gaps inside the shop's working hours on `date`.
    pub async fn free_slots(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        min_duration: Option<TimeDelta>,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let ss = self.get_shop(&shop_id).ok_or(EngineError::NotFound(shop_id))?;
        let guard = ss.read().await;
        let day = guard.days.get(&date).map(Vec::as_slice).unwrap_or(&[]);
        Ok(free_slots(&guard.hours, date, day, min_duration))
    }

    /// Every shop, ordered by id. `owner` restricts to one principal's shops.
    pub async fn list_shops(&self, owner: Option<&str>) -> Vec<ShopInfo> {
        let shops: Vec<_> = self.shops.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shops.len());
        for ss in shops {
            let guard = ss.read().await;
            if owner.is_none_or(|o| guard.owner == o) {
                out.push(guard.info());
            }
        }
        out.sort_by_key(|s| s.id);
        out
    }
}
