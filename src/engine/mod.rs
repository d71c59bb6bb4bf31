mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod shop;

pub use availability::{free_slots, merge_overlapping, subtract_slots};
pub use error::EngineError;
pub use shop::ShopState;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedShopState = Arc<RwLock<ShopState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first Append, drains whatever else is already queued,
/// then does a single fsync for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;

        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Commit what we have before compaction or stats see the log.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

pub struct Engine {
    pub(super) shops: DashMap<Ulid, SharedShopState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: appointment/client id → shop id
    pub(super) entity_to_shop: DashMap<Ulid, Ulid>,
    /// Held from the existence check through the WAL append of a new shop,
    /// so one id can only ever be claimed by one owner.
    pub(super) shop_creation: Mutex<()>,
}

/// Apply an event directly to a ShopState. The caller holds the lock.
fn apply_to_shop(ss: &mut ShopState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ShopHoursUpdated { hours, .. } => {
            ss.hours = hours.clone();
        }
        Event::ClientRegistered { shop_id, client } => {
            ss.clients.insert(client.id, client.clone());
            entity_map.insert(client.id, *shop_id);
        }
        Event::AppointmentBooked { appointment } => {
            if let Some(id) = appointment.id.saved() {
                entity_map.insert(id, appointment.shop_id);
            }
            ss.insert_appointment(appointment.clone());
        }
        Event::AppointmentUpdated { appointment } => {
            if let Some(id) = appointment.id.saved() {
                ss.remove_appointment(id);
                entity_map.insert(id, appointment.shop_id);
            }
            ss.insert_appointment(appointment.clone());
        }
        Event::AppointmentCancelled { id, updated_at, .. } => {
            if let Some(mut appointment) = ss.remove_appointment(*id) {
                appointment.status = AppointmentStatus::Cancelled;
                appointment.updated_at = *updated_at;
                ss.insert_appointment(appointment);
            }
        }
        // ShopCreated is handled at the DashMap level, not here
        Event::ShopCreated { .. } => {}
    }
}

/// The push notice an applied event produces, if any.
fn notice_for(ss: &ShopState, event: &Event) -> Option<ChangeNotice> {
    let joined = |id: Ulid| ss.get(id).map(|a| ss.joined(a));
    match event {
        Event::AppointmentBooked { appointment } => {
            joined(appointment.id.saved()?).map(ChangeNotice::Created)
        }
        Event::AppointmentUpdated { appointment } => {
            joined(appointment.id.saved()?).map(ChangeNotice::Updated)
        }
        Event::AppointmentCancelled { id, .. } => joined(*id).map(ChangeNotice::Cancelled),
        Event::ShopCreated { .. } | Event::ShopHoursUpdated { .. } | Event::ClientRegistered { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            shops: DashMap::new(),
            wal_tx,
            notify,
            entity_to_shop: DashMap::new(),
            shop_creation: Mutex::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds instantly. Never use blocking_write here: this may run inside
        // an async context (lazy tenant creation).
        for event in &events {
            match event {
                Event::ShopCreated { id, owner, name, hours } => {
                    let ss = ShopState::new(*id, owner.clone(), name.clone(), hours.clone());
                    engine.shops.insert(*id, Arc::new(RwLock::new(ss)));
                }
                other => {
                    let Some(shop_id) = event_shop_id(other) else { continue };
                    let Some(entry) = engine.shops.get(&shop_id) else { continue };
                    let ss_arc = entry.clone();
                    drop(entry);
                    let Ok(mut guard) = ss_arc.try_write() else { continue };
                    apply_to_shop(&mut guard, other, &engine.entity_to_shop);
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_shop(&self, id: &Ulid) -> Option<SharedShopState> {
        self.shops.get(id).map(|e| e.value().clone())
    }

    pub fn get_shop_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_shop.get(entity_id).map(|e| *e.value())
    }

    pub fn shop_count(&self) -> usize {
        self.shops.len()
    }

    /// WAL-append + apply + notify, in that order, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        shop_id: Ulid,
        ss: &mut ShopState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_shop(ss, event, &self.entity_to_shop);
        if let Some(notice) = notice_for(ss, event) {
            self.notify.send(shop_id, &notice);
        }
        Ok(())
    }

    /// Lookup appointment → shop, get shop, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ShopState>), EngineError> {
        let shop_id = self
            .get_shop_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ss = self
            .get_shop(&shop_id)
            .ok_or(EngineError::NotFound(shop_id))?;
        let guard = ss.write_owned().await;
        Ok((shop_id, guard))
    }
}

/// Extract the shop id from an event (for everything but ShopCreated).
fn event_shop_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ShopHoursUpdated { id, .. } => Some(*id),
        Event::ClientRegistered { shop_id, .. } | Event::AppointmentCancelled { shop_id, .. } => {
            Some(*shop_id)
        }
        Event::AppointmentBooked { appointment } | Event::AppointmentUpdated { appointment } => {
            Some(appointment.shop_id)
        }
        Event::ShopCreated { .. } => None,
    }
}
