//! Soak-style load harness for the VeloxMQ transport
//!
//! Starts a local sink acceptor, then drives batched writes at it for a
//! configured duration (or indefinitely), logging throughput
//! periodically and reconnecting whenever the transport reports a fatal
//! error.
//!
//! Environment:
//! - `SOAK_SECONDS`: run duration in seconds, `0` for indefinite (default 10)
//! - `SOAK_MESSAGE_BYTES`: payload size per write (default 1024)

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{info, warn};
use veloxmq::{
    Acceptor, BatchFlusher, Connector, ConnectorConfig, ReadyListener, TransportConfig,
};

const LOG_EVERY_MESSAGES: u64 = 10_000;
const FLUSH_EVERY_MESSAGES: u64 = 1_000;

/// Backpressure gate: pauses the write loop while the transport reports
/// not-ready
struct ReadyGate {
    ready: AtomicBool,
    notify: Notify,
}

impl ReadyGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(true),
            notify: Notify::new(),
        })
    }

    async fn wait_until_ready(&self) {
        while !self.ready.load(Ordering::Acquire) {
            self.notify.notified().await;
        }
    }
}

impl ReadyListener for ReadyGate {
    fn ready_for_writing(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
        if ready {
            self.notify.notify_one();
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> veloxmq::Result<()> {
    tracing_subscriber::fmt::init();

    let run_seconds = env_u64("SOAK_SECONDS", 10);
    let message_bytes = env_u64("SOAK_MESSAGE_BYTES", 1024) as usize;

    println!("🚀 VeloxMQ transport soak harness");
    println!("=================================");

    let config = TransportConfig::default();

    // Sink side: accept connections and count every byte that arrives
    let acceptor = Acceptor::bind("127.0.0.1:0", config.clone()).await?;
    let addr = acceptor.local_addr()?;
    let received_bytes = Arc::new(AtomicU64::new(0));

    let sink_counter = Arc::clone(&received_bytes);
    tokio::spawn(async move {
        loop {
            let (connection, mut inbound) = match acceptor.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let counter = Arc::clone(&sink_counter);
            tokio::spawn(async move {
                while let Some(chunk) = inbound.recv().await {
                    counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                connection.close().await;
            });
        }
    });

    let connector = Connector::new(config.clone());
    let flusher = BatchFlusher::start(config.batch_delay);
    let mut target = ConnectorConfig::new("127.0.0.1", addr.port());

    println!("✅ Sink listening on {}", addr);

    let payload = Bytes::from(vec![0x56; message_bytes]);
    let deadline = (run_seconds > 0).then(|| Instant::now() + Duration::from_secs(run_seconds));
    let start = Instant::now();
    let mut sent_messages: u64 = 0;
    let mut window_start = Instant::now();

    'soak: loop {
        // (Re)connect, register for batch maintenance, then pump writes
        let (connection, _inbound) = match connector.connect(&target).await {
            Ok(connected) => connected,
            Err(e) if e.is_retryable() => {
                warn!("connect failed, retrying: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            Err(e) => return Err(e),
        };
        flusher.register(&connection);

        let gate = ReadyGate::new();
        connection.add_ready_listener(gate.clone() as Arc<dyn ReadyListener>);

        loop {
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                connection.close().await;
                break 'soak;
            }

            gate.wait_until_ready().await;

            // A periodic flush write doubles as a liveness checkpoint:
            // fire-and-forget writes cannot observe a dead peer
            let flush = (sent_messages + 1) % FLUSH_EVERY_MESSAGES == 0;
            if let Err(e) = connection.write_ext(payload.clone(), flush, true).await {
                warn!("write failed, reconnecting: {}", e);

                // Rebuild an equivalent target from the dead connection
                if let Some(descriptor) = connection.connector_config() {
                    target = descriptor;
                }
                connection.close().await;
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue 'soak;
            }

            sent_messages += 1;
            if sent_messages % LOG_EVERY_MESSAGES == 0 {
                let window = window_start.elapsed().as_secs_f64();
                window_start = Instant::now();
                info!(
                    "sent {} messages in {:.2}s ({:.0} msg/s, total {:.0}s)",
                    LOG_EVERY_MESSAGES,
                    window,
                    LOG_EVERY_MESSAGES as f64 / window,
                    start.elapsed().as_secs_f64(),
                );
            }
        }
    }

    // Let the sink drain what the last batch flush put on the wire
    tokio::time::sleep(2 * config.batch_delay).await;

    let total = start.elapsed().as_secs_f64();
    let received = received_bytes.load(Ordering::Relaxed);
    println!(
        "✅ Sent {} messages ({} bytes) in {:.2}s; sink received {} bytes",
        sent_messages,
        sent_messages * message_bytes as u64,
        total,
        received,
    );
    info!("soak run complete");

    Ok(())
}
