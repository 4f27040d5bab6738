//! End-to-end relay benchmark for Duet.
//!
//! Opens pairs of WebSocket clients against a running server. One side of
//! each pair sends chat messages as fast as it can; the other counts the
//! `receive_message` frames it is pushed.

use bytes::BytesMut;
use duet_protocol::{codec, ChatMessage, Frame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_pairs = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            Duet End-to-End Relay Benchmark                   ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Start the server first: DUET_STORE__BACKEND=memory duet     ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_relay_benchmark(num_pairs).await;
}

async fn run_relay_benchmark(num_pairs: usize) {
    println!("Relay benchmark: {} pairs", num_pairs);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(2 * num_pairs + 1));
    let mut handles = Vec::new();

    for pair in 0..num_pairs {
        let sender_id = format!("bench-a-{pair}");
        let receiver_id = format!("bench-b-{pair}");

        let counter = Arc::clone(&received);
        let ready = Arc::clone(&barrier);
        let (me, peer) = (receiver_id.clone(), sender_id.clone());
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_receiver(&me, &peer, counter, ready).await {
                eprintln!("Receiver {} error: {}", me, e);
            }
        }));

        let ready = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_sender(&sender_id, &receiver_id, ready).await {
                eprintln!("Sender {} error: {}", sender_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("All {} pairs joined", num_pairs);

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = received.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Pairs:                {:>10}                           ║",
        num_pairs
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Messages Relayed:     {:>10}                           ║",
        total
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        per_sec
    );
    println!(
        "║  Per-Pair:             {:>10.0} msg/s                    ║",
        per_sec / num_pairs as f64
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

/// Connect, join the pair's room and wait for the join ack.
async fn connect_and_join(user: &str, peer: &str) -> Result<(WsSink, WsStream), BoxError> {
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    // Connected frame
    receiver.next().await;

    let join = codec::encode(&Frame::join(Some(1), user, peer))?;
    sender.send(Message::Binary(join.to_vec())).await?;

    // Join ack
    receiver.next().await;

    Ok((sender, receiver))
}

async fn run_receiver(
    user: &str,
    peer: &str,
    counter: Arc<AtomicU64>,
    ready: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (_sender, mut receiver) = connect_and_join(user, peer).await?;
    ready.wait().await;

    let mut recv_buf = BytesMut::with_capacity(65536);
    while let Some(result) = receiver.next().await {
        if let Ok(Message::Binary(data)) = result {
            recv_buf.extend_from_slice(&data);
            while let Ok(Some(frame)) = codec::decode_from(&mut recv_buf) {
                if matches!(frame, Frame::ReceiveMessage { .. }) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
    Ok(())
}

async fn run_sender(user: &str, peer: &str, ready: Arc<Barrier>) -> Result<(), BoxError> {
    let (mut sender, mut receiver) = connect_and_join(user, peer).await?;
    ready.wait().await;

    // Acks are not requested; drain whatever else the server pushes.
    let drain = tokio::spawn(async move { while receiver.next().await.is_some() {} });

    let message = ChatMessage::new(user, peer, "x".repeat(64), "text", "10:00", "2024-01-01");
    let frame = codec::encode(&Frame::send_message(None, message))?;
    let msg = Message::Binary(frame.to_vec());

    while sender.send(msg.clone()).await.is_ok() {
        tokio::task::yield_now().await;
    }

    drain.abort();
    Ok(())
}
