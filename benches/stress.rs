use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let password = std::env::var("PARKLINE_PASSWORD").unwrap_or_else(|_| "parkline".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("parkline")
        .user("bench")
        .password(password);

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
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Start of the first bookable hour, a day out so the lead-time rule never bites.
fn base_time() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    (now / HOUR + 24) * HOUR
}

struct Lot {
    facility: Ulid,
    floor: Ulid,
    user: Ulid,
}

impl Lot {
    async fn create(client: &tokio_postgres::Client) -> Self {
        let lot = Self {
            facility: Ulid::new(),
            floor: Ulid::new(),
            user: Ulid::new(),
        };
        client
            .batch_execute(&format!(
                "INSERT INTO facilities (id, name) VALUES ('{}', 'bench-{}');
                 INSERT INTO floors (id, facility_id, name) VALUES ('{}', '{}', 'L1')",
                lot.facility, lot.facility, lot.floor, lot.facility
            ))
            .await
            .unwrap();
        lot
    }

    async fn spot(&self, client: &tokio_postgres::Client, label: &str) -> Ulid {
        let id = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO spots (id, floor_id, label, vehicle_type, hourly_price, reservable)
                 VALUES ('{id}', '{}', '{label}', 'car', 2.50, true)",
                self.floor
            ))
            .await
            .unwrap();
        id
    }

    async fn car(&self, client: &tokio_postgres::Client) -> Ulid {
        let id = Ulid::new();
        let plate = &id.to_string()[16..];
        client
            .batch_execute(&format!(
                "INSERT INTO vehicles (id, owner_id, plate, vehicle_type) VALUES ('{id}', '{}', '{plate}', 'car')",
                self.user
            ))
            .await
            .unwrap();
        id
    }
}

fn booking_sql(user: Ulid, car: Ulid, spot: Ulid, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO reservations (id, user_id, vehicle_id, spot_id, start, "end")
           VALUES ('{}', '{user}', '{car}', '{spot}', {start}, {end})"#,
        Ulid::new()
    )
}

async fn phase1_sequential(host: &str, port: u16, base: i64) {
    let client = connect(host, port).await;
    let lot = Lot::create(&client).await;
    let spot = lot.spot(&client, "SEQ").await;
    let car = lot.car(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = base + (i as i64) * HOUR;
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(lot.user, car, spot, s, s + HOUR))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent_disjoint(host: &str, port: u16, base: i64) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let lot = Lot::create(&client).await;
            let spot = lot.spot(&client, &format!("D{t}")).await;
            let car = lot.car(&client).await;
            for j in 0..n_per_task {
                let s = base + (j as i64) * HOUR;
                client
                    .batch_execute(&booking_sql(lot.user, car, spot, s, s + HOUR))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Many cars race for the same spot and window; exactly one may win each round.
async fn phase3_contended(host: &str, port: u16, base: i64) {
    let rounds = 20;
    let racers = 32;

    let setup = connect(host, port).await;
    let lot = Arc::new(Lot::create(&setup).await);
    let spot = lot.spot(&setup, "HOT").await;
    let mut cars = Vec::with_capacity(racers);
    for _ in 0..racers {
        cars.push(lot.car(&setup).await);
    }
    let cars = Arc::new(cars);

    let mut clients = Vec::with_capacity(racers);
    for _ in 0..racers {
        clients.push(Arc::new(connect(host, port).await));
    }

    let mut violations = 0;
    let start = Instant::now();
    for round in 0..rounds {
        let s = base + (round as i64) * 2 * HOUR;
        let winners = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(racers);
        for (i, client) in clients.iter().enumerate() {
            let client = client.clone();
            let winners = winners.clone();
            let sql = booking_sql(lot.user, cars[i], spot, s, s + HOUR);
            handles.push(tokio::spawn(async move {
                if client.batch_execute(&sql).await.is_ok() {
                    winners.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        if winners.load(Ordering::Relaxed) != 1 {
            violations += 1;
        }
    }

    println!(
        "  {rounds} rounds x {racers} racers in {:.2}s, rounds without exactly one winner: {violations}",
        start.elapsed().as_secs_f64()
    );
}

async fn phase4_read_under_load(host: &str, port: u16, base: i64) {
    let setup = connect(host, port).await;
    let lot = Arc::new(Lot::create(&setup).await);
    for i in 0..50 {
        lot.spot(&setup, &format!("R{i}")).await;
    }
    let facility = lot.facility;

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        let lot = lot.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let spot = lot.spot(&client, &format!("WR{w}")).await;
            let car = lot.car(&client).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = base + i * HOUR;
                let _ = client
                    .batch_execute(&booking_sql(lot.user, car, spot, s, s + HOUR))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for k in 0..reads_per_reader {
                let sql = if (r + k) % 2 == 0 {
                    format!("SELECT * FROM spots WHERE facility_id = '{facility}'")
                } else {
                    format!("SELECT * FROM occupancy WHERE facility_id = '{facility}'")
                };
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("spot / occupancy query", &mut all_latencies);
}

async fn phase5_connection_storm(host: &str, port: u16, base: i64) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let lot = Lot::create(&client).await;
            let spot = lot.spot(&client, "S").await;
            let car = lot.car(&client).await;
            for i in 0..ops_per_conn {
                let s = base + (i as i64) * HOUR;
                client
                    .batch_execute(&booking_sql(lot.user, car, spot, s, s + HOUR))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("PARKLINE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("PARKLINE_PORT")
        .unwrap_or_else(|_| "5434".into())
        .parse()
        .expect("invalid PARKLINE_PORT");
    let base = base_time();

    println!("=== parkline stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port, base).await;

    println!("\n[phase 2] concurrent disjoint bookings");
    phase2_concurrent_disjoint(&host, port, base).await;

    println!("\n[phase 3] contended identical bookings");
    phase3_contended(&host, port, base).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&host, port, base).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port, base).await;

    println!("\n=== benchmark complete ===");
}
