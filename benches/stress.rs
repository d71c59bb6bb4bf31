use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime, TimeDelta};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use shopbook::tenant::TenantManager;
use shopbook::wire;

const USER: &str = "bench";
const PASSWORD: &str = "shopbook";
/// Half-hour slots between 09:00 and 17:00.
const SLOTS_PER_DAY: u32 = 16;

/// Serve an in-process instance unless SHOPBOOK_HOST/SHOPBOOK_PORT point
/// at a running server.
async fn target() -> (String, u16) {
    if let (Ok(host), Ok(port)) = (std::env::var("SHOPBOOK_HOST"), std::env::var("SHOPBOOK_PORT")) {
        return (host, port.parse().expect("invalid SHOPBOOK_PORT"));
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let dir = std::env::temp_dir().join(format!("shopbook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 10_000));
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });
    (addr.ip().to_string(), addr.port())
}

async fn connect(host: &str, port: u16, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(db)
        .user(USER)
        .password(PASSWORD);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        ms(avg),
        ms(percentile(latencies, 50.0)),
        ms(percentile(latencies, 95.0)),
        ms(percentile(latencies, 99.0)),
        ms(latencies[latencies.len() - 1]),
    );
}

fn first_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
}

fn slot(index: u32) -> (NaiveTime, NaiveTime) {
    let start = NaiveTime::from_hms_opt(9, 0, 0).unwrap() + TimeDelta::minutes(30 * i64::from(index));
    (start, start + TimeDelta::minutes(30))
}

fn booking_sql(shop: Ulid, date: NaiveDate, index: u32) -> String {
    let (start, end) = slot(index);
    format!(
        r#"INSERT INTO appointments (shop_id, title, "date", start_time, end_time, "type") VALUES ('{shop}', 'Bench', '{date}', '{start}', '{end}', 'consultation')"#
    )
}

async fn open_shop(client: &Client) -> Ulid {
    let shop = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO shops (id, name, opens_at, closes_at) VALUES ('{shop}', 'Bench', '09:00', '17:00')"
        ))
        .await
        .unwrap();
    shop
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &format!("bench_{}", Ulid::new())).await;
    let shop = open_shop(&client).await;

    let n = 2000u32;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let date = first_day() + TimeDelta::days(i64::from(i / SLOTS_PER_DAY));
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(shop, date, i % SLOTS_PER_DAY))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = f64::from(n) / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same few days of one shop. Every slot must end
/// up with at most one active appointment.
async fn phase2_contended(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &db).await;
    let shop = open_shop(&setup).await;

    let n_tasks = 16u32;
    let attempts = 200u32;
    let days = 3u32;
    let booked = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for task in 0..n_tasks {
        let host = host.to_string();
        let db = db.clone();
        let booked = booked.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut latencies = Vec::with_capacity(attempts as usize);
            for j in 0..attempts {
                let date = first_day() + TimeDelta::days(i64::from((task + j) % days));
                let index = (task * 7 + j * 13) % SLOTS_PER_DAY;
                let t = Instant::now();
                match client.batch_execute(&booking_sql(shop, date, index)).await {
                    Ok(()) => booked.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        let code = e.as_db_error().map(|db| db.code().code().to_string());
                        assert_eq!(code.as_deref(), Some("23P01"), "unexpected error: {e}");
                        conflicts.fetch_add(1, Ordering::Relaxed)
                    }
                };
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();
    let booked = booked.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {attempts} attempts in {:.2}s: {booked} booked, {} conflicts",
        elapsed.as_secs_f64(),
        conflicts.load(Ordering::Relaxed),
    );
    print_latency("contended write latency", &mut all);

    let last_day = first_day() + TimeDelta::days(i64::from(days - 1));
    let messages = setup
        .simple_query(&format!(
            r#"SELECT * FROM appointments WHERE shop_id = '{shop}' AND "date" BETWEEN '{}' AND '{last_day}'"#,
            first_day()
        ))
        .await
        .unwrap();
    let mut taken: Vec<(String, String, String)> = messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some((
                row.get("date")?.to_string(),
                row.get("start_time")?.to_string(),
                row.get("end_time")?.to_string(),
            )),
            _ => None,
        })
        .collect();
    taken.sort();
    for pair in taken.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(a.0 != b.0 || a.2 <= b.1, "overlap: {a:?} and {b:?}");
    }
    assert_eq!(taken.len(), booked);
    assert!(booked <= (SLOTS_PER_DAY * days) as usize);
    println!("  no-overlap check passed over {} appointments", taken.len());
}

async fn phase3_reads_under_load(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &db).await;
    let shop = open_shop(&setup).await;
    for i in 0..200u32 {
        let date = first_day() + TimeDelta::days(i64::from(i / SLOTS_PER_DAY));
        setup.batch_execute(&booking_sql(shop, date, i % SLOTS_PER_DAY)).await.unwrap();
    }

    // Writers keep booking further out while readers query the first month.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..4u32 {
        let host = host.to_string();
        let db = db.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut i = 0u32;
            while !stop.load(Ordering::Relaxed) {
                let date = first_day() + TimeDelta::days(i64::from(60 + w * 1000 + i / SLOTS_PER_DAY));
                let _ = client.batch_execute(&booking_sql(shop, date, i % SLOTS_PER_DAY)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 8usize;
    let reads_per_reader = 300;
    let mut readers = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let db = db.clone();
        readers.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let end = first_day() + TimeDelta::days(30);
            let mut counts = Vec::with_capacity(reads_per_reader);
            let mut free = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM appointment_counts WHERE shop_id = '{shop}' AND "date" BETWEEN '{}' AND '{end}'"#,
                        first_day()
                    ))
                    .await
                    .unwrap();
                counts.push(t.elapsed());

                let day = first_day() + TimeDelta::days(((r + i) % 14) as i64);
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM availability WHERE shop_id = '{shop}' AND "date" = '{day}'"#
                    ))
                    .await
                    .unwrap();
                free.push(t.elapsed());
            }
            (counts, free)
        }));
    }

    let mut counts = Vec::new();
    let mut free = Vec::new();
    for h in readers {
        let (c, f) = h.await.unwrap();
        counts.extend(c);
        free.extend(f);
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }

    print_latency("appointment_counts (cached view)", &mut counts);
    print_latency("availability", &mut free);
}

#[tokio::main]
async fn main() {
    let (host, port) = target().await;

    println!("=== shopbook stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended bookings on one shop");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_reads_under_load(&host, port).await;

    println!("\n=== benchmark complete ===");
}
