//! Synchronous management request/reply over the transport
//!
//! Demonstrates the request/reply shape management clients use:
//! attribute-get and operation-invoke calls are framed onto a dedicated
//! connection, correlated by id, and awaited synchronously; a reply
//! flagged as failed raises an error to the caller.
//!
//! Framing is demo-local (length prefix, correlation id, status byte,
//! `|`-separated fields); the transport itself treats payloads as
//! opaque bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use veloxmq::{Acceptor, Connection, Connector, ConnectorConfig, TransportConfig, VeloxmqError};

const STATUS_OK: u8 = 0;
const STATUS_FAILED: u8 = 1;

/// Errors surfaced by the management proxy
#[derive(Debug, thiserror::Error)]
enum ManagementError {
    /// The reply indicated the call failed on the resource
    #[error("management call failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Transport(#[from] VeloxmqError),
}

/// Frame: u32 payload length, then payload
fn encode_frame(correlation_id: u32, status: u8, body: &str) -> Bytes {
    let mut frame = BytesMut::with_capacity(4 + 4 + 1 + body.len());
    frame.put_u32((4 + 1 + body.len()) as u32);
    frame.put_u32(correlation_id);
    frame.put_u8(status);
    frame.put_slice(body.as_bytes());
    frame.freeze()
}

/// Accumulates inbound chunks and yields complete frames
struct FrameReader {
    buffer: BytesMut,
}

impl FrameReader {
    fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn next_frame(&mut self) -> Option<(u32, u8, String)> {
        if self.buffer.len() < 4 {
            return None;
        }
        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if self.buffer.len() < 4 + length {
            return None;
        }
        self.buffer.advance(4);
        let mut payload = self.buffer.split_to(length);
        let correlation_id = payload.get_u32();
        let status = payload.get_u8();
        let body = String::from_utf8_lossy(&payload).into_owned();
        Some((correlation_id, status, body))
    }
}

/// Synchronous request/reply proxy against a named management resource
struct ManagementProxy {
    resource_name: String,
    connection: Arc<Connection>,
    correlation_counter: AtomicU32,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<(u8, String)>>>>,
}

impl ManagementProxy {
    fn new(
        resource_name: &str,
        connection: Arc<Connection>,
        mut inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Arc<Self> {
        let pending: Arc<Mutex<HashMap<u32, oneshot::Sender<(u8, String)>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Reply dispatcher: match each reply to its waiting request
        let matcher = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut frames = FrameReader::new();
            while let Some(chunk) = inbound.recv().await {
                frames.push(&chunk);
                while let Some((correlation_id, status, body)) = frames.next_frame() {
                    match matcher.lock().remove(&correlation_id) {
                        Some(reply) => {
                            let _ = reply.send((status, body));
                        }
                        None => warn!("reply with no pending request: {}", correlation_id),
                    }
                }
            }
        });

        Arc::new(Self {
            resource_name: resource_name.to_string(),
            connection,
            correlation_counter: AtomicU32::new(0),
            pending,
        })
    }

    async fn request(&self, body: String) -> Result<(u8, String), ManagementError> {
        let correlation_id = self.correlation_counter.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, reply_tx);

        let frame = encode_frame(correlation_id, STATUS_OK, &body);
        self.connection.write_ext(frame, true, false).await?;

        reply_rx
            .await
            .map_err(|_| ManagementError::Transport(VeloxmqError::Interrupted))
    }

    async fn retrieve_attribute_value(&self, attribute: &str) -> Result<String, ManagementError> {
        let (status, body) = self
            .request(format!("get|{}|{}", self.resource_name, attribute))
            .await?;
        if status == STATUS_OK {
            Ok(body)
        } else {
            Err(ManagementError::Failed(body))
        }
    }

    async fn invoke_operation(
        &self,
        operation: &str,
        args: &[&str],
    ) -> Result<String, ManagementError> {
        let (status, body) = self
            .request(format!(
                "invoke|{}|{}|{}",
                self.resource_name,
                operation,
                args.join(",")
            ))
            .await?;
        if status == STATUS_OK {
            Ok(body)
        } else {
            Err(ManagementError::Failed(body))
        }
    }
}

/// Demo responder: serves a couple of attributes and operations for one
/// named resource
async fn run_responder(acceptor: Acceptor) {
    loop {
        let (connection, mut inbound) = match acceptor.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };

        tokio::spawn(async move {
            let mut frames = FrameReader::new();
            while let Some(chunk) = inbound.recv().await {
                frames.push(&chunk);
                while let Some((correlation_id, _status, body)) = frames.next_frame() {
                    let (status, reply) = handle_management_request(&body);
                    let frame = encode_frame(correlation_id, status, &reply);
                    if connection.write(frame).await.is_err() {
                        return;
                    }
                }
            }
        });
    }
}

fn handle_management_request(body: &str) -> (u8, String) {
    let fields: Vec<&str> = body.split('|').collect();
    match fields.as_slice() {
        ["get", "queue.orders", "message-count"] => (STATUS_OK, "42".to_string()),
        ["get", "queue.orders", "consumer-count"] => (STATUS_OK, "3".to_string()),
        ["invoke", "queue.orders", "remove-messages", _filter] => (STATUS_OK, "5".to_string()),
        ["get", resource, attribute] => (
            STATUS_FAILED,
            format!("no attribute {} on {}", attribute, resource),
        ),
        ["invoke", resource, operation, ..] => (
            STATUS_FAILED,
            format!("no operation {} on {}", operation, resource),
        ),
        _ => (STATUS_FAILED, format!("malformed request: {}", body)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("🚀 VeloxMQ management request/reply example");
    println!("===========================================");

    let config = TransportConfig {
        batching_enabled: false,
        ..Default::default()
    };

    let acceptor = Acceptor::bind("127.0.0.1:0", config.clone()).await?;
    let addr = acceptor.local_addr()?;
    tokio::spawn(run_responder(acceptor));

    let connector = Connector::new(config);
    let target = ConnectorConfig::new("127.0.0.1", addr.port());
    let (connection, inbound) = connector.connect(&target).await?;
    let proxy = ManagementProxy::new("queue.orders", connection.clone(), inbound);

    let message_count = proxy.retrieve_attribute_value("message-count").await?;
    println!("✅ message-count = {}", message_count);

    let consumer_count = proxy.retrieve_attribute_value("consumer-count").await?;
    println!("✅ consumer-count = {}", consumer_count);

    let removed = proxy
        .invoke_operation("remove-messages", &["color = 'red'"])
        .await?;
    println!("✅ remove-messages removed {} messages", removed);

    match proxy.retrieve_attribute_value("no-such-attribute").await {
        Err(e) => println!("✅ failed reply surfaced as error: {}", e),
        Ok(value) => println!("unexpected success: {}", value),
    }

    connection.close().await;
    info!("management proxy example finished");
    Ok(())
}
