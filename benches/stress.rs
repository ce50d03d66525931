use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

impl Client {
    async fn connect(host: &str, port: u16, token: &str) -> Client {
        let stream = TcpStream::connect((host, port)).await.expect("connect failed");
        let (r, w) = stream.into_split();
        let mut client = Client {
            reader: BufReader::new(r),
            writer: w,
            line: String::new(),
        };
        let auth = client.call(json!({"op": "auth", "token": token})).await;
        assert_eq!(auth["ok"], true, "auth failed: {auth}");
        client
    }

    async fn call(&mut self, request: Value) -> Value {
        let mut out = request.to_string();
        out.push('\n');
        self.writer.write_all(out.as_bytes()).await.expect("write failed");
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await.expect("read failed");
            assert!(n > 0, "server closed the connection");
            let msg: Value = serde_json::from_str(&self.line).expect("bad response line");
            if msg.get("event").is_none() {
                return msg;
            }
        }
    }

    async fn create_bay(&mut self) -> String {
        let key = Ulid::new().to_string();
        let r = self
            .call(json!({"op": "create_bay", "key": key, "name": format!("bench {key}")}))
            .await;
        assert_eq!(r["ok"], true, "create_bay failed: {r}");
        r["data"]["id"].as_str().unwrap().to_string()
    }

    async fn book(&mut self, bay_id: &str, start: i64, end: Option<i64>) -> Value {
        self.call(json!({
            "op": "create_booking",
            "bay_id": bay_id,
            "vehicle_id": "bench",
            "start": start,
            "end": end,
        }))
        .await
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    token: String,
}

impl Target {
    async fn client(&self) -> Client {
        Client::connect(&self.host, self.port, &self.token).await
    }
}

async fn phase1_sequential(target: &Target) {
    let mut client = target.client().await;
    let bay = client.create_bay().await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = (i as i64) * HOUR;
        let t = Instant::now();
        let r = client.book(&bay, s, Some(s + HOUR)).await;
        assert_eq!(r["ok"], true, "back-to-back booking rejected: {r}");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same slots on one bay. Each slot must be won exactly once.
async fn phase2_contention(target: &Target) {
    let n_tasks = 20;
    let n_slots = 100;

    let bay = target.client().await.create_bay().await;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let target = target.clone();
        let bay = bay.clone();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let mut client = target.client().await;
            for slot in 0..n_slots {
                let s = (slot as i64) * HOUR;
                let r = client.book(&bay, s, Some(s + HOUR)).await;
                if r["ok"] == true {
                    won.fetch_add(1, Ordering::Relaxed);
                } else {
                    assert_eq!(r["error"]["code"], "conflict", "unexpected failure: {r}");
                    lost.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots: {won} won, {lost} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, n_slots, "every slot must be booked exactly once");

    let mut client = target.client().await;
    let agenda = client
        .call(json!({"op": "agenda", "from": 0, "to": (n_slots as i64) * HOUR}))
        .await;
    let mut spans: Vec<(i64, i64)> = agenda["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|b| b["bay_id"] == bay.as_str())
        .map(|b| (b["start"].as_i64().unwrap(), b["end"].as_i64().unwrap()))
        .collect();
    spans.sort();
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "double booking: {pair:?}");
    }
    println!("  verified {} non-overlapping bookings", spans.len());
}

async fn phase3_read_under_load(target: &Target) {
    let mut setup = target.client().await;
    let bay = setup.create_bay().await;
    for i in 0..200 {
        let s = (i as i64) * HOUR;
        setup.book(&bay, s, Some(s + HOUR)).await;
    }
    drop(setup);

    // Writers keep booking on their own bays in the background
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let target = target.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut client = target.client().await;
            let bay = client.create_bay().await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = i * HOUR;
                client.book(&bay, s, Some(s + HOUR)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let target = target.clone();
        reader_handles.push(tokio::spawn(async move {
            let mut client = target.client().await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let request = if (r + i) % 2 == 0 {
                    json!({"op": "agenda", "from": 0, "to": 200 * HOUR})
                } else {
                    json!({"op": "occupancy", "at": ((i as i64) % 200) * HOUR})
                };
                let t = Instant::now();
                let resp = client.call(request).await;
                assert_eq!(resp["ok"], true, "{resp}");
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

    print_latency("agenda/occupancy query", &mut all_latencies);
}

async fn phase4_connection_storm(target: &Target) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..n_conns {
        let target = target.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let mut client = target.client().await;
            let bay = client.create_bay().await;
            for i in 0..ops_per_conn {
                let s = (i as i64) * HOUR;
                client.book(&bay, s, Some(s + HOUR)).await;
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
    let host = std::env::var("BAYBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("BAYBOOK_PORT")
        .unwrap_or_else(|_| "7433".into())
        .parse()
        .expect("invalid BAYBOOK_PORT");
    let token = std::env::var("BAYBOOK_BENCH_TOKEN").expect("BAYBOOK_BENCH_TOKEN must name a dispatcher or admin token");
    let target = Target { host, port, token };

    println!("=== baybook stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    // Each phase books on freshly created bays to avoid interference

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] same-bay contention");
    phase2_contention(&target).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== benchmark complete ===");
}
