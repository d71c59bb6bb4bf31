use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_hours, check_no_overlap, next_updated_at, validate_slot, validate_text};
use super::{Engine, EngineError, ShopState, WalCommand};

impl Engine {
    pub async fn create_shop(
        &self,
        id: Ulid,
        owner: String,
        name: Option<String>,
        hours: WorkingHours,
    ) -> Result<(), EngineError> {
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("shop name too long"));
        }
        if owner.len() > MAX_PRINCIPAL_LEN {
            return Err(EngineError::LimitExceeded("owner name too long"));
        }
        let _creating = self.shop_creation.lock().await;
        if self.shops.len() >= MAX_SHOPS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many shops"));
        }
        if self.shops.contains_key(&id) {
            warn!("shop {id} already exists, registration by {owner} refused");
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ShopCreated {
            id,
            owner: owner.clone(),
            name: name.clone(),
            hours: hours.clone(),
        };
        self.wal_append(&event).await?;
        let ss = ShopState::new(id, owner, name, hours);
        self.shops.insert(id, Arc::new(RwLock::new(ss)));
        Ok(())
    }

    pub async fn update_shop_hours(&self, id: Ulid, hours: WorkingHours) -> Result<(), EngineError> {
        let ss = self.get_shop(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;
        let event = Event::ShopHoursUpdated { id, hours };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn register_client(
        &self,
        shop_id: Ulid,
        client: ClientSummary,
    ) -> Result<ClientSummary, EngineError> {
        if client.name.trim().is_empty() {
            return Err(EngineError::Invalid("client name must not be empty".into()));
        }
        if client.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("client name too long"));
        }
        let ss = self.get_shop(&shop_id).ok_or(EngineError::NotFound(shop_id))?;
        let mut guard = ss.write().await;
        if guard.clients.len() >= MAX_CLIENTS_PER_SHOP {
            return Err(EngineError::LimitExceeded("too many clients in shop"));
        }
        if self.entity_to_shop.contains_key(&client.id) {
            return Err(EngineError::AlreadyExists(client.id));
        }

        let event = Event::ClientRegistered {
            shop_id,
            client: client.clone(),
        };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        Ok(client)
    }

    /// Atomic check-and-insert: the hours and overlap checks, the WAL append
    /// and the in-memory apply all happen under the shop's write lock.
    pub async fn insert_appointment_if_no_overlap(
        &self,
        draft: &NewAppointment,
    ) -> Result<Appointment, EngineError> {
        let slot = validate_slot(draft.start_time, draft.end_time)?;
        validate_text(&draft.title, draft.notes.as_deref())?;
        let shop_id = draft.shop_id;
        let ss = self.get_shop(&shop_id).ok_or(EngineError::NotFound(shop_id))?;
        let mut guard = ss.write().await;
        if guard.appointment_count() >= MAX_APPOINTMENTS_PER_SHOP {
            return Err(EngineError::LimitExceeded("too many appointments in shop"));
        }
        if let Some(cid) = draft.client_id
            && !guard.clients.contains_key(&cid)
        {
            return Err(EngineError::NotFound(cid));
        }

        check_hours(&guard, draft.date, slot)?;
        check_no_overlap(&guard, draft.date, slot, None)?;

        let now = now_ms();
        let appointment = Appointment {
            id: AppointmentId::Saved(Ulid::new()),
            shop_id,
            client_id: draft.client_id,
            order_id: draft.order_id,
            title: draft.title.clone(),
            date: draft.date,
            start_time: slot.start,
            end_time: slot.end,
            kind: draft.kind,
            status: AppointmentStatus::Scheduled,
            notes: draft.notes.clone(),
            reminder_sent: false,
            client: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        Ok(guard.joined(&appointment))
    }

    /// Atomic check-and-update. Hours and overlap are re-checked only when the
    /// patch moves the appointment in time or reactivates a cancelled one;
    /// `exclude_self` keeps the appointment from conflicting with its own
    /// current row.
    pub async fn update_appointment_if_no_overlap(
        &self,
        id: Ulid,
        patch: &AppointmentPatch,
        exclude_self: bool,
    ) -> Result<Appointment, EngineError> {
        let (shop_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;

        let mut next = current.clone();
        patch.apply_to(&mut next);
        next.client = None;
        let slot = validate_slot(next.start_time, next.end_time)?;
        validate_text(&next.title, next.notes.as_deref())?;
        if let Some(cid) = next.client_id
            && next.client_id != current.client_id
            && !guard.clients.contains_key(&cid)
        {
            return Err(EngineError::NotFound(cid));
        }

        let mut unchanged = next.clone();
        unchanged.client = current.client.clone();
        if unchanged == current {
            debug!("update of {id} changes nothing, skipping WAL");
            return Ok(guard.joined(&current));
        }

        let moved = next.date != current.date || slot != current.slot();
        let reactivated = !current.is_active() && next.is_active();
        if next.is_active() && (moved || reactivated) {
            check_hours(&guard, next.date, slot)?;
            check_no_overlap(&guard, next.date, slot, exclude_self.then_some(id))?;
        }

        next.updated_at = next_updated_at(current.updated_at, now_ms());
        let event = Event::AppointmentUpdated {
            appointment: next.clone(),
        };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        Ok(guard.joined(&next))
    }

    /// Soft cancel. Cancelling an already-cancelled appointment is a no-op
    /// success and writes nothing.
    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let (shop_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.is_active() {
            return Ok(guard.joined(&current));
        }

        let event = Event::AppointmentCancelled {
            id,
            shop_id,
            updated_at: next_updated_at(current.updated_at, now_ms()),
        };
        self.persist_and_apply(shop_id, &mut guard, &event).await?;
        let cancelled = guard.get(id).ok_or(EngineError::NotFound(id))?;
        Ok(guard.joined(cancelled))
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let shops: Vec<_> = self.shops.iter().map(|e| e.value().clone()).collect();
        // Read guards stay held until the swap so no mutation lands in between.
        let mut guards = Vec::with_capacity(shops.len());
        for ss in shops {
            let guard = ss.read_owned().await;
            events.push(Event::ShopCreated {
                id: guard.id,
                owner: guard.owner.clone(),
                name: guard.name.clone(),
                hours: guard.hours.clone(),
            });
            for client in guard.clients.values() {
                events.push(Event::ClientRegistered {
                    shop_id: guard.id,
                    client: client.clone(),
                });
            }
            for appointment in guard.days.values().flatten() {
                events.push(Event::AppointmentBooked {
                    appointment: appointment.clone(),
                });
            }
            guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
