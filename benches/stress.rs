use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const PIN: &str = "9090";

async fn connect(host: &str, port: u16, site: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(site)
        .user("clubdesk")
        .password("clubdesk");

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

/// A fresh site with one admin and `lockers` clean lockers.
struct Site {
    name: String,
    admin: Ulid,
    lockers: Vec<Ulid>,
}

async fn setup_site(host: &str, port: u16, lockers: usize) -> Site {
    let name = format!("bench_{}", Ulid::new());
    let client = connect(host, port, &name).await;
    let admin = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO staff (id, name, role, pin) VALUES ('{admin}', 'Bench', 'admin', '{PIN}')"
        ))
        .await
        .unwrap();
    login(&client, admin).await;

    let mut ids = Vec::with_capacity(lockers);
    for n in 0..lockers {
        let rid = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO resources (id, number, tier) VALUES ('{rid}', 'L{n}', 'locker')"
            ))
            .await
            .unwrap();
        ids.push(rid);
    }
    Site {
        name,
        admin,
        lockers: ids,
    }
}

async fn login(client: &Client, staff: Ulid) {
    client
        .batch_execute(&format!(
            "INSERT INTO staff_sessions (id, staff_id, pin) VALUES ('{}', '{staff}', '{PIN}')",
            Ulid::new()
        ))
        .await
        .unwrap();
}

/// Open a lane, check in, check out, then turn the unit back to clean.
async fn cycle(client: &Client, lane: &str) -> Result<(), tokio_postgres::Error> {
    let visit = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO lane_sessions (lane, customer_id, tier) VALUES ('{lane}', '{}', 'locker')",
            Ulid::new()
        ))
        .await?;
    client
        .batch_execute(&format!(
            "INSERT INTO visits (id, lane) VALUES ('{visit}', '{lane}')"
        ))
        .await?;
    let rid = client
        .simple_query("SELECT * FROM visits")
        .await?
        .into_iter()
        .find_map(|m| match m {
            tokio_postgres::SimpleQueryMessage::Row(row)
                if row.get("id") == Some(visit.to_string().as_str()) =>
            {
                row.get("resource_id").map(str::to_string)
            }
            _ => None,
        });
    client
        .batch_execute(&format!("DELETE FROM visits WHERE id = '{visit}'"))
        .await?;
    if let Some(rid) = rid {
        for status in ["cleaning", "clean"] {
            client
                .batch_execute(&format!(
                    "INSERT INTO status_changes (resource_id, status) VALUES ('{rid}', '{status}')"
                ))
                .await?;
        }
    }
    Ok(())
}

async fn phase1_sequential(host: &str, port: u16) {
    let site = setup_site(host, port, 1).await;
    let client = connect(host, port, &site.name).await;
    login(&client, site.admin).await;

    let n = 300;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for _ in 0..n {
        let t = Instant::now();
        cycle(&client, "front").await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} visit cycles on {} locker in {:.2}s = {ops:.0} cycles/sec",
        site.lockers.len(),
        elapsed.as_secs_f64()
    );
    print_latency("cycle latency", &mut latencies);
}

async fn phase2_contended_lanes(host: &str, port: u16) {
    let site = Arc::new(setup_site(host, port, 5).await);
    let n_lanes = 20;
    let n_per_lane = 50;
    let completed = Arc::new(AtomicUsize::new(0));
    let turned_away = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for lane in 0..n_lanes {
        let host = host.to_string();
        let site = site.clone();
        let completed = completed.clone();
        let turned_away = turned_away.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &site.name).await;
            login(&client, site.admin).await;
            let lane = format!("lane-{lane}");
            for _ in 0..n_per_lane {
                match cycle(&client, &lane).await {
                    Ok(()) => completed.fetch_add(1, Ordering::Relaxed),
                    Err(_) => {
                        // Lost the race for a locker; free the lane and try again.
                        let _ = client
                            .batch_execute(&format!("DELETE FROM lane_sessions WHERE lane = '{lane}'"))
                            .await;
                        turned_away.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let done = completed.load(Ordering::Relaxed);
    println!(
        "  {n_lanes} lanes x {n_per_lane} attempts over {} lockers: {done} completed, {} turned away in {:.2}s = {:.0} cycles/sec",
        site.lockers.len(),
        turned_away.load(Ordering::Relaxed),
        elapsed.as_secs_f64(),
        done as f64 / elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let site = Arc::new(setup_site(host, port, 50).await);
    let stop = Arc::new(AtomicBool::new(false));

    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let site = site.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &site.name).await;
            login(&client, site.admin).await;
            let lane = format!("writer-{w}");
            while !stop.load(Ordering::Relaxed) {
                if cycle(&client, &lane).await.is_err() {
                    let _ = client
                        .batch_execute(&format!("DELETE FROM lane_sessions WHERE lane = '{lane}'"))
                        .await;
                }
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let site = site.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &site.name).await;
            let table = if r % 2 == 0 { "availability" } else { "inventory" };
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!("SELECT * FROM {table}"))
                    .await
                    .unwrap();
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

    print_latency("inventory/availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let site = Arc::new(setup_site(host, port, 10).await);
    let n_conns = 50;
    let reads_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let host = host.to_string();
        let site = site.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &site.name).await;
            for _ in 0..reads_per_conn {
                client
                    .batch_execute("SELECT * FROM availability")
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
        "  {n_conns} connections, {reads_per_conn} reads each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("CLUBDESK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("CLUBDESK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid CLUBDESK_PORT");

    println!("=== clubdesk stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase runs against its own site (unique dbname).

    println!("[phase 1] sequential visit cycles");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] lanes contending for lockers");
    phase2_contended_lanes(&host, port).await;

    println!("\n[phase 3] read latency under lane load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
