use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::DateRange;
use crate::store::{AppointmentStore, BookingApi};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a tenant's WAL once enough appends have
/// piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if compact_if_due(&engine, threshold).await {
            info!("compacted WAL after reaching {threshold} appends");
        }
    }
    debug!("compactor stopped");
}

/// One compaction check. Returns whether the log was rewritten.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("WAL compaction failed after {appends} appends: {e}");
            false
        }
    }
}

/// Periodic `ClearStale` sweep over one store. `keep` is asked on every tick
/// for the range the user is currently looking at.
pub async fn run_stale_sweep<A, K>(
    store: Arc<AppointmentStore<A>>,
    interval: Duration,
    keep: K,
    cancel: CancellationToken,
) where
    A: BookingApi,
    K: Fn() -> Option<DateRange>,
{
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; nothing can be stale yet.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => store.clear_stale(keep()),
        }
    }
    debug!("stale sweep for shop {} stopped", store.shop_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::store::{Action, StoreConfig};
    use crate::wal::Wal;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveTime};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("shopbook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let shop = Ulid::new();
        engine
            .create_shop(shop, "ana".into(), None, WorkingHours::uniform(t(9), t(17)))
            .await
            .unwrap();
        for hours in [(8, 18), (10, 16), (9, 17)] {
            engine
                .update_shop_hours(shop, WorkingHours::uniform(t(hours.0), t(hours.1)))
                .await
                .unwrap();
        }

        assert!(!compact_if_due(&engine, 10).await);
        assert_eq!(Wal::replay(&path).unwrap().len(), 4);

        assert!(compact_if_due(&engine, 4).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        // Shop creation already carries the latest hours.
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }

    struct OfflineApi;

    #[async_trait]
    impl BookingApi for OfflineApi {
        async fn fetch_range(&self, _: Ulid, _: DateRange) -> Result<Vec<Appointment>, crate::error::BookingError> {
            Err(crate::error::BookingError::Network("offline".into()))
        }
        async fn create(&self, _: NewAppointment) -> Result<Appointment, crate::error::BookingError> {
            Err(crate::error::BookingError::Network("offline".into()))
        }
        async fn update(&self, _: Ulid, _: AppointmentPatch) -> Result<Appointment, crate::error::BookingError> {
            Err(crate::error::BookingError::Network("offline".into()))
        }
        async fn cancel(&self, _: Ulid) -> Result<Appointment, crate::error::BookingError> {
            Err(crate::error::BookingError::Network("offline".into()))
        }
    }

    #[tokio::test]
    async fn sweep_evicts_stale_ranges_until_cancelled() {
        let shop = Ulid::new();
        let config = StoreConfig {
            stale_window: Duration::from_millis(1),
            ..Default::default()
        };
        let store = Arc::new(AppointmentStore::new(OfflineApi, shop, config));
        let range = DateRange::single(day());
        let request_id = Ulid::new();
        store.dispatch(Action::LoadStart { range, request_id });
        store.dispatch(Action::LoadSuccess {
            appointments: vec![Appointment {
                id: AppointmentId::Saved(Ulid::new()),
                shop_id: shop,
                client_id: None,
                order_id: None,
                title: "Pickup".into(),
                date: day(),
                start_time: t(9),
                end_time: t(10),
                kind: AppointmentType::Pickup,
                status: AppointmentStatus::Scheduled,
                notes: None,
                reminder_sent: false,
                client: None,
                created_at: 0,
                updated_at: 0,
            }],
            range,
            request_id,
        });
        assert_eq!(store.snapshot().appointments.len(), 1);

        let cancel = CancellationToken::new();
        let mut changes = store.subscribe();
        let sweep = tokio::spawn(run_stale_sweep(
            store.clone(),
            Duration::from_millis(10),
            || None,
            cancel.clone(),
        ));
        changes.changed().await.unwrap();
        let state = store.snapshot();
        assert!(state.appointments.is_empty());
        assert!(state.loaded_ranges.is_empty());

        cancel.cancel();
        sweep.await.unwrap();
    }
}
