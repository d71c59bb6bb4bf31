use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use shopbook::engine::Engine;
use shopbook::error::BookingError;
use shopbook::model::*;
use shopbook::notify::NotifyHub;
use shopbook::service::{BookingService, Caller};
use shopbook::store::{AppointmentStore, ErrorKey, LocalBookingApi, StoreConfig, spawn_push_listener};

// ── Test infrastructure ──────────────────────────────────────

type Service = BookingService<Engine>;
type Store = AppointmentStore<LocalBookingApi<Engine>>;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("shopbook_int_flow");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    let _ = std::fs::remove_file(&path);
    path
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
}

fn draft(shop: Ulid, start: NaiveTime, end: NaiveTime) -> NewAppointment {
    NewAppointment {
        shop_id: shop,
        client_id: None,
        order_id: None,
        title: "Suit fitting".into(),
        date: monday(),
        start_time: start,
        end_time: end,
        kind: AppointmentType::Fitting,
        notes: None,
    }
}

/// Engine + service with one shop open 09:00–17:00, owned by "tailor".
async fn open_shop(name: &str) -> (Arc<Engine>, Arc<Service>, Caller, Ulid, PathBuf) {
    let path = test_wal_path(name);
    let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap());
    let service = Arc::new(BookingService::new(engine.clone()));
    let owner = Caller::resolve(Some("tailor")).unwrap();
    let shop = Ulid::new();
    service
        .register_shop(&owner, shop, Some("Main St".into()), WorkingHours::uniform(t(9, 0), t(17, 0)))
        .await
        .unwrap();
    (engine, service, owner, shop, path)
}

fn store_for(service: &Arc<Service>, owner: &Caller, shop: Ulid) -> Arc<Store> {
    Arc::new(AppointmentStore::new(
        LocalBookingApi::new(service.clone(), owner.clone()),
        shop,
        StoreConfig::default(),
    ))
}

/// Wait until `check` holds on the store, or fail after a second.
async fn wait_for(store: &Store, check: impl Fn(&Store) -> bool) {
    let mut changes = store.subscribe();
    tokio::time::timeout(Duration::from_secs(1), async {
        while !check(store) {
            changes.changed().await.unwrap();
        }
    })
    .await
    .expect("store never reached the expected state");
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn conflict_hours_and_cancellation_scenario() {
    let (_engine, service, owner, shop, _) = open_shop("scenario").await;

    let first = assert_ok!(
        service
            .create_appointment(&owner, draft(shop, t(10, 0), t(11, 0)))
            .await
    );

    let overlap = assert_err!(
        service
            .create_appointment(&owner, draft(shop, t(10, 30), t(11, 30)))
            .await
    );
    assert!(matches!(overlap, BookingError::Conflict { .. }), "{overlap:?}");
    assert!(overlap.to_string().contains("already booked"));

    let early = assert_err!(
        service
            .create_appointment(&owner, draft(shop, t(8, 0), t(8, 30)))
            .await
    );
    assert!(matches!(early, BookingError::OutOfHours { .. }), "{early:?}");

    let first_id = first.id.saved().unwrap();
    let cancelled = assert_ok!(service.cancel_appointment(&owner, first_id).await);
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);

    assert_ok!(
        service
            .create_appointment(&owner, draft(shop, t(10, 30), t(11, 30)))
            .await
    );

    // Cancelling again is a success with the same record.
    let again = assert_ok!(service.cancel_appointment(&owner, first_id).await);
    assert_eq!(again, cancelled);
}

#[tokio::test]
async fn store_replaces_placeholder_with_saved_record() {
    let (_engine, service, owner, shop, _) = open_shop("placeholder").await;
    let store = store_for(&service, &owner, shop);
    let day = DateRange::single(monday());
    assert!(store.ensure_loaded(day).await.unwrap().is_empty());
    assert!(store.is_date_range_loaded(day));

    let saved = store
        .create_appointment(draft(shop, t(10, 0), t(11, 0)))
        .await
        .unwrap();

    let shown = store.get_appointments_for_date_range(day);
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].id, saved.id);
    assert!(!shown[0].id.is_temp());
    assert!(store.snapshot().optimistic.is_empty());
}

#[tokio::test]
async fn rejected_update_rolls_back_and_records_error() {
    let (_engine, service, owner, shop, _) = open_shop("rollback").await;
    let store = store_for(&service, &owner, shop);
    let day = DateRange::single(monday());
    store.ensure_loaded(day).await.unwrap();

    let morning = store.create_appointment(draft(shop, t(9, 0), t(10, 0))).await.unwrap();
    store.create_appointment(draft(shop, t(10, 0), t(11, 0))).await.unwrap();
    let before = store.snapshot();

    let moved = AppointmentPatch {
        start_time: Some(t(10, 30)),
        end_time: Some(t(11, 30)),
        ..Default::default()
    };
    let err = store.update_appointment(&morning.id, moved).await.unwrap_err();
    assert!(matches!(err, BookingError::Conflict { .. }));

    let after = store.snapshot();
    assert!(after.eq_ignoring_errors(&before));
    assert_eq!(
        store.error_for(&ErrorKey::Appointment(morning.id.clone())),
        Some(err)
    );

    // Moving to itself never conflicts.
    let same = AppointmentPatch {
        start_time: Some(t(9, 0)),
        end_time: Some(t(10, 0)),
        ..Default::default()
    };
    store.update_appointment(&morning.id, same).await.unwrap();
}

#[tokio::test]
async fn cancelled_slot_is_bookable_from_the_store() {
    let (_engine, service, owner, shop, _) = open_shop("store_cancel").await;
    let store = store_for(&service, &owner, shop);
    let day = DateRange::single(monday());
    store.ensure_loaded(day).await.unwrap();

    let first = store.create_appointment(draft(shop, t(10, 0), t(11, 0))).await.unwrap();
    store.cancel_appointment(&first.id).await.unwrap();
    store.create_appointment(draft(shop, t(10, 0), t(11, 0))).await.unwrap();

    let shown = store.get_appointments_for_date_range(day);
    assert_eq!(shown.len(), 2);
    assert_eq!(shown.iter().filter(|a| a.is_active()).count(), 1);
}

#[tokio::test]
async fn pushes_reach_other_sessions() {
    let (engine, service, owner, shop, _) = open_shop("push").await;
    let day = DateRange::single(monday());

    let writer = store_for(&service, &owner, shop);
    let watcher = store_for(&service, &owner, shop);
    watcher.ensure_loaded(day).await.unwrap();

    let cancel = CancellationToken::new();
    let listener = spawn_push_listener(watcher.clone(), engine.notify.subscribe(shop), cancel.clone());

    let created = writer.create_appointment(draft(shop, t(13, 0), t(14, 0))).await.unwrap();
    wait_for(&watcher, |s| s.snapshot().appointment(&created.id).is_some()).await;

    writer.ensure_loaded(day).await.unwrap();
    writer.cancel_appointment(&created.id).await.unwrap();
    wait_for(&watcher, |s| {
        s.snapshot()
            .appointment(&created.id)
            .is_some_and(|a| a.status == AppointmentStatus::Cancelled)
    })
    .await;

    cancel.cancel();
    listener.await.unwrap();
}

#[tokio::test]
async fn concurrent_bookings_for_one_slot_admit_exactly_one() {
    let (_engine, service, owner, shop, _) = open_shop("race").await;

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let service = service.clone();
        let owner = owner.clone();
        tasks.push(tokio::spawn(async move {
            service
                .create_appointment(&owner, draft(shop, t(14, 0), t(15, 0)))
                .await
        }));
    }

    let mut booked = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => booked += 1,
            Err(BookingError::Conflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(booked, 1);

    let day = DateRange::single(monday());
    let active = service
        .get_appointments_by_time_range(&owner, shop, day, false)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn bookings_survive_restart() {
    let (engine, service, owner, shop, path) = open_shop("restart").await;
    let kept = service
        .create_appointment(&owner, draft(shop, t(10, 0), t(11, 0)))
        .await
        .unwrap();
    drop(service);
    drop(engine);

    let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());
    let service = BookingService::new(engine);
    let day = DateRange::single(monday());
    let found = service
        .get_appointments_by_time_range(&owner, shop, day, true)
        .await
        .unwrap();
    assert_eq!(found, vec![kept]);

    // The restored schedule still blocks the slot.
    let err = service
        .create_appointment(&owner, draft(shop, t(10, 15), t(10, 45)))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Conflict { .. }));
}

#[tokio::test]
async fn other_owners_see_nothing() {
    let (_engine, service, owner, shop, _) = open_shop("ownership").await;
    let created = service
        .create_appointment(&owner, draft(shop, t(10, 0), t(11, 0)))
        .await
        .unwrap();

    let stranger = Caller::resolve(Some("someone-else")).unwrap();
    let err = service
        .get_appointment(&stranger, created.id.saved().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::NotFound(_)));
    assert!(matches!(
        service.create_appointment(&stranger, draft(shop, t(12, 0), t(13, 0))).await,
        Err(BookingError::NotFound(_))
    ));
    assert_eq!(Caller::resolve(Some("  ")), Err(BookingError::Unauthorized));
}
