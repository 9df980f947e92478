//! End-to-end throughput benchmark for Beacon.
//!
//! Every client joins one dashboard room and broadcasts collaboration
//! signals as fast as it can; the benchmark counts delivered events.
//!
//! The server must accept the tokens `{prefix}0 .. {prefix}{n-1}`, all in
//! one organization, through `[[auth.tokens]]` entries.

use beacon_protocol::{codec, ClientMessage, ServerMessage};
use bytes::BytesMut;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const DASHBOARD: &str = "load";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Reader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let token_prefix = args.get(2).cloned().unwrap_or_else(|| "bench-".to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Beacon End-to-End Throughput Benchmark               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_collaboration_benchmark(num_clients, token_prefix).await;
}

async fn run_collaboration_benchmark(num_clients: usize, token_prefix: String) {
    println!("📊 Collaboration Benchmark: {} clients", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let delivered = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let delivered = Arc::clone(&delivered);
        let barrier = Arc::clone(&barrier);
        let token = format!("{token_prefix}{client_id}");

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &token, delivered, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("✓ All {} clients joined dashboard {}", num_clients, DASHBOARD);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Delivered Events:     {:>10}                           ║",
        total
    );
    println!(
        "║  Throughput:           {:>10.0} events/s                 ║",
        per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} events/s                 ║",
        per_sec / num_clients as f64
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

/// Read until a complete server message is available.
async fn next_message(
    reader: &mut Reader,
    buffer: &mut BytesMut,
) -> Result<Option<ServerMessage>, BoxError> {
    loop {
        if let Some(message) = codec::decode_from::<ServerMessage>(buffer)? {
            return Ok(Some(message));
        }
        match reader.next().await {
            Some(Ok(Message::Binary(data))) => buffer.extend_from_slice(&data),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        }
    }
}

async fn run_client(
    client_id: usize,
    token: &str,
    delivered: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let url = format!("{SERVER_URL}?token={token}&format=binary");
    let (ws, _) = connect_async(url.as_str()).await?;
    let (mut sender, mut receiver) = ws.split();
    let mut buffer = BytesMut::with_capacity(65536);

    let organization = match next_message(&mut receiver, &mut buffer).await? {
        Some(ServerMessage::Connected {
            organization_id, ..
        }) => organization_id,
        Some(ServerMessage::Error { code, message }) => {
            return Err(format!("rejected: {code} {message}").into())
        }
        other => return Err(format!("unexpected first message: {other:?}").into()),
    };

    let join = ClientMessage::join_room(format!("dashboard:{organization}:{DASHBOARD}"));
    sender
        .send(Message::Binary(codec::encode(&join)?.to_vec()))
        .await?;
    loop {
        match next_message(&mut receiver, &mut buffer).await? {
            Some(ServerMessage::RoomJoinResult { success: true, .. }) => break,
            Some(ServerMessage::RoomJoinResult { error, .. }) => {
                return Err(format!("join failed: {error:?}").into())
            }
            Some(_) => continue,
            None => return Err("connection closed before join".into()),
        }
    }

    barrier.wait().await;

    let recv_count = Arc::clone(&delivered);
    let recv_task = tokio::spawn(async move {
        while let Ok(Some(message)) = next_message(&mut receiver, &mut buffer).await {
            if matches!(message, ServerMessage::Event { .. }) {
                recv_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    // Each signal carries a sequence number so none is deduplicated.
    let mut seq = 0u64;
    loop {
        seq += 1;
        let signal = ClientMessage::CollaborateDashboard {
            dashboard_id: DASHBOARD.to_string(),
            action: "cursor".to_string(),
            collaborative_data: json!({ "client": client_id, "seq": seq }),
        };
        let frame = Message::Binary(codec::encode(&signal)?.to_vec());
        if sender.send(frame).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
