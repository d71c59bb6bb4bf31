use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// Everything the engine knows about one shop. Guarded by a per-shop lock.
#[derive(Debug, Clone)]
pub struct ShopState {
    pub id: Ulid,
    pub owner: String,
    pub name: Option<String>,
    pub hours: WorkingHours,
    pub clients: HashMap<Ulid, ClientSummary>,
    /// Appointments per date, each day sorted by `start_time`. Cancelled ones stay.
    pub days: BTreeMap<NaiveDate, Vec<Appointment>>,
    /// Appointment id → date, for locating an appointment inside `days`.
    dates: HashMap<Ulid, NaiveDate>,
}

impl ShopState {
    pub fn new(id: Ulid, owner: String, name: Option<String>, hours: WorkingHours) -> Self {
        Self {
            id,
            owner,
            name,
            hours,
            clients: HashMap::new(),
            days: BTreeMap::new(),
            dates: HashMap::new(),
        }
    }

    pub fn info(&self) -> ShopInfo {
        ShopInfo {
            id: self.id,
            owner: self.owner.clone(),
            name: self.name.clone(),
            hours: self.hours.clone(),
        }
    }

    pub fn appointment_count(&self) -> usize {
        self.dates.len()
    }

    /// Insert keeping the day sorted by start time. Only server ids are stored.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let Some(id) = appointment.id.saved() else {
            debug_assert!(false, "temporary id reached the engine");
            return;
        };
        let day = self.days.entry(appointment.date).or_default();
        let pos = day.partition_point(|a| a.start_time <= appointment.start_time);
        self.dates.insert(id, appointment.date);
        day.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let date = self.dates.remove(&id)?;
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|a| a.id.saved() == Some(id))?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(removed)
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        let date = self.dates.get(&id)?;
        self.days
            .get(date)?
            .iter()
            .find(|a| a.id.saved() == Some(id))
    }

    /// Appointments on `date` whose slot intersects `slot`, any status.
    /// Binary search skips everything starting at or after `slot.end`.
    pub fn overlapping(&self, date: NaiveDate, slot: TimeSlot) -> impl Iterator<Item = &Appointment> {
        let day = self.days.get(&date).map(Vec::as_slice).unwrap_or(&[]);
        let right_bound = day.partition_point(|a| a.start_time < slot.end);
        day[..right_bound]
            .iter()
            .filter(move |a| a.end_time > slot.start)
    }

    /// All appointments dated within `range`, ordered by date then start time.
    pub fn in_range(&self, range: DateRange) -> impl Iterator<Item = &Appointment> {
        self.days
            .range(range.start..=range.end)
            .flat_map(|(_, day)| day.iter())
    }

    /// Copy of `appointment` with its client summary attached.
    pub fn joined(&self, appointment: &Appointment) -> Appointment {
        let mut out = appointment.clone();
        out.client = appointment
            .client_id
            .and_then(|cid| self.clients.get(&cid).cloned());
        out
    }
}
