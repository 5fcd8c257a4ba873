use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("lendit")
        .user("lendit")
        .password(std::env::var("LENDIT_PASSWORD").unwrap_or_else(|_| "lendit".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as i64
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

/// First column of the first returned row.
async fn insert_returning_id(client: &tokio_postgres::Client, sql: &str) -> String {
    let messages = client.simple_query(sql).await.expect("insert failed");
    messages
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
            _ => None,
        })
        .expect("insert returned no row")
}

/// An owner with one item and a renter, all unique to the caller.
struct Party {
    owner: String,
    renter: String,
    item: String,
}

async fn setup_party(client: &tokio_postgres::Client) -> Party {
    let tag = Ulid::new().to_string().to_lowercase();
    let owner = insert_returning_id(
        client,
        &format!("INSERT INTO users (name, email) VALUES ('owner', 'owner-{tag}@bench.local')"),
    )
    .await;
    let renter = insert_returning_id(
        client,
        &format!("INSERT INTO users (name, email) VALUES ('renter', 'renter-{tag}@bench.local')"),
    )
    .await;
    let item = insert_returning_id(
        client,
        &format!(
            "INSERT INTO items (owner_id, name, description, available) VALUES ('{owner}', 'ladder', 'aluminium', true)"
        ),
    )
    .await;
    Party { owner, renter, item }
}

async fn request_booking(client: &tokio_postgres::Client, party: &Party, slot: i64) -> String {
    let start = now_ms() + (slot + 1) * HOUR;
    let end = start + HOUR;
    insert_returning_id(
        client,
        &format!(
            r#"INSERT INTO bookings (booker_id, item_id, start, "end") VALUES ('{}', '{}', {start}, {end})"#,
            party.renter, party.item
        ),
    )
    .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let party = setup_party(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        request_booking(&client, &party, i as i64).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} booking requests in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("request latency", &mut latencies);
}

async fn phase2_request_and_decide(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let party = setup_party(&client).await;
            for j in 0..n_per_task {
                let id = request_booking(&client, &party, j).await;
                let approved = j % 3 != 0;
                client
                    .batch_execute(&format!(
                        "INSERT INTO booking_decisions (booking_id, user_id, approved) VALUES ('{id}', '{}', {approved})",
                        party.owner
                    ))
                    .await
                    .expect("decision failed");
            }
        }));
    }
    for h in handles {
        h.await.expect("task panicked");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = (total * 2) as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} request+decide = {total} bookings in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_listings_under_load(host: &str, port: u16) {
    let setup_client = connect(host, port).await;
    let party = Arc::new(setup_party(&setup_client).await);
    for i in 0..200 {
        request_booking(&setup_client, &party, i).await;
    }
    drop(setup_client);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let own = setup_party(&client).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                request_booking(&client, &own, i).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 300;
    let states = ["ALL", "FUTURE", "WAITING", "PAST", "CURRENT", "REJECTED"];
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let party = party.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for k in 0..reads_per_reader {
                let state = states[(r + k) % states.len()];
                let (column, user) = if k % 2 == 0 {
                    ("booker_id", &party.renter)
                } else {
                    ("owner_id", &party.owner)
                };
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM bookings WHERE {column} = '{user}' AND state = '{state}'"
                    ))
                    .await
                    .expect("listing failed");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.expect("reader panicked"));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("listing query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let party = setup_party(&client).await;
            for i in 0..ops_per_conn {
                request_booking(&client, &party, i).await;
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
    let host = std::env::var("LENDIT_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("LENDIT_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid LENDIT_PORT");

    println!("=== lendit stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking requests");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent request + decide");
    phase2_request_and_decide(&host, port).await;

    println!("\n[phase 3] listing latency under write load");
    phase3_listings_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== done ===");
}
