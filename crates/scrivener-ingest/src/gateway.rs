//! Live gateway session: WebSocket handshake, heartbeat, event dispatch.
//!
//! The session is a small state machine over the upstream's opcodes:
//! connect, receive HELLO (op 10), send IDENTIFY (op 2), then dispatch
//! frames (op 0) until the server requests a reconnect (op 7), invalidates
//! the session (op 9), or the socket closes. A separate heartbeat task
//! sends `{op:1, d:last_sequence}` every `heartbeat_interval` ms, starting
//! after a random fraction of the interval; there is no ack tracking - a
//! dead link surfaces as a server-initiated close.
//!
//! There is no resume: after any disconnect the supervisor loop sleeps a
//! fixed 5 s and re-identifies cold. Messages delivered during the gap are
//! recovered by backfill where the owning channel is not yet done.
//!
//! Only `MESSAGE_CREATE` dispatches are consumed; their `d` payload is
//! handed to the caller-supplied handler.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::{Error, Result};

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

/// How long to wait for the server's HELLO after connecting.
const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed delay between session teardown and the next connection attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection parameters for the gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub url: String,
    pub token: String,
    pub intents: u64,
}

/// A raw gateway frame. `d` stays opaque; dispatch payloads go to the
/// handler (and ultimately the store) verbatim.
#[derive(Debug, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Deserialize)]
struct HelloData {
    heartbeat_interval: u64,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server asked for a reconnect (op 7) or invalidated the session (op 9).
    Reconnect,
    /// Socket closed or the protocol broke.
    Closed,
    /// The process is shutting down.
    Shutdown,
}

fn identify_payload(token: &str, intents: u64) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": intents,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "scrivener",
                "device": "scrivener",
            },
        },
    })
}

fn heartbeat_payload(last_sequence: i64) -> Value {
    let d = if last_sequence < 0 {
        Value::Null
    } else {
        json!(last_sequence)
    };
    json!({ "op": OP_HEARTBEAT, "d": d })
}

async fn send_json(sink: &Arc<tokio::sync::Mutex<WsSink>>, payload: &Value) -> Result<()> {
    sink.lock()
        .await
        .send(Message::Text(payload.to_string()))
        .await?;
    Ok(())
}

/// Wait for the next text frame, skipping control frames.
async fn next_text_frame(stream: &mut WsStream, deadline: Duration) -> Result<Option<String>> {
    let wait = tokio::time::timeout(deadline, async {
        while let Some(frame) = stream.next().await {
            let frame = frame?;
            if frame.is_close() {
                return Ok(None);
            }
            if let Message::Text(text) = frame {
                return Ok(Some(text));
            }
        }
        Ok(None)
    });
    match wait.await {
        Ok(result) => result,
        Err(_) => Err(Error::Gateway(format!(
            "no frame received within {:?}",
            deadline
        ))),
    }
}

/// Run the gateway under its reconnect supervisor until shutdown.
///
/// The handler receives each `MESSAGE_CREATE` dispatch payload. Any
/// session failure is logged and followed by a fixed 5 s backoff and a
/// cold re-identify.
pub async fn run_gateway<F, Fut>(
    settings: &GatewaySettings,
    running: Arc<AtomicBool>,
    mut handler: F,
) where
    F: FnMut(Value) -> Fut,
    Fut: Future<Output = ()>,
{
    while running.load(Ordering::SeqCst) {
        counter!("gateway_sessions_total").increment(1);
        match run_session(settings, &running, &mut handler).await {
            Ok(SessionEnd::Shutdown) => break,
            Ok(end) => tracing::info!("gateway session ended: {:?}", end),
            Err(e) => tracing::warn!("gateway session failed: {}", e),
        }
        gauge!("gateway_connected").set(0.0);
        counter!("gateway_reconnects_total").increment(1);
        sleep_while_running(RECONNECT_DELAY, &running).await;
    }
    gauge!("gateway_connected").set(0.0);
}

/// Run a single session from connect to teardown.
pub async fn run_session<F, Fut>(
    settings: &GatewaySettings,
    running: &AtomicBool,
    handler: &mut F,
) -> Result<SessionEnd>
where
    F: FnMut(Value) -> Fut,
    Fut: Future<Output = ()>,
{
    tracing::info!(url = %settings.url, "connecting to gateway");
    let (ws, _response) = connect_async(settings.url.as_str()).await?;
    let (sink, mut stream) = ws.split();
    let sink = Arc::new(tokio::sync::Mutex::new(sink));

    // HELLO must be the first meaningful frame.
    let hello_text = next_text_frame(&mut stream, HELLO_TIMEOUT)
        .await?
        .ok_or_else(|| Error::Gateway("socket closed before HELLO".to_string()))?;
    let hello: GatewayFrame = serde_json::from_str(&hello_text)?;
    if hello.op != OP_HELLO {
        return Err(Error::Gateway(format!(
            "expected HELLO (op {}), got op {}",
            OP_HELLO, hello.op
        )));
    }
    let hello_data: HelloData = serde_json::from_value(hello.d)?;
    let interval = Duration::from_millis(hello_data.heartbeat_interval);
    tracing::info!(heartbeat_interval_ms = hello_data.heartbeat_interval, "gateway said hello");

    send_json(&sink, &identify_payload(&settings.token, settings.intents)).await?;
    gauge!("gateway_connected").set(1.0);

    let last_sequence = Arc::new(AtomicI64::new(-1));

    // The heartbeat runs as its own task so a slow dispatch handler never
    // starves it. The first beat lands after a random fraction of the
    // interval, as the protocol asks.
    let heartbeat = {
        let sink = Arc::clone(&sink);
        let last_sequence = Arc::clone(&last_sequence);
        tokio::spawn(async move {
            tokio::time::sleep(interval.mul_f64(rand::random::<f64>())).await;
            loop {
                let payload = heartbeat_payload(last_sequence.load(Ordering::SeqCst));
                if send_json(&sink, &payload).await.is_err() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        })
    };

    let end = read_loop(&mut stream, &last_sequence, running, handler).await;

    heartbeat.abort();
    gauge!("gateway_connected").set(0.0);

    Ok(end)
}

async fn read_loop<F, Fut>(
    stream: &mut WsStream,
    last_sequence: &AtomicI64,
    running: &AtomicBool,
    handler: &mut F,
) -> SessionEnd
where
    F: FnMut(Value) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if !running.load(Ordering::SeqCst) {
            return SessionEnd::Shutdown;
        }

        // Short timeout so the shutdown flag is polled even on a quiet link.
        let frame = match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
            Err(_) => continue,
            Ok(None) => return SessionEnd::Closed,
            Ok(Some(Err(e))) => {
                tracing::warn!("gateway socket error: {}", e);
                return SessionEnd::Closed;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        if frame.is_close() {
            tracing::info!("gateway closed the connection");
            return SessionEnd::Closed;
        }
        let text = match frame {
            Message::Text(text) => text,
            _ => continue,
        };

        let frame: GatewayFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("unparseable gateway frame, ending session: {}", e);
                return SessionEnd::Closed;
            }
        };

        if let Some(s) = frame.s {
            last_sequence.store(s as i64, Ordering::SeqCst);
        }

        match frame.op {
            OP_DISPATCH => {
                if frame.t.as_deref() == Some("MESSAGE_CREATE") {
                    counter!("live_messages_total").increment(1);
                    handler(frame.d).await;
                }
            }
            OP_RECONNECT => {
                tracing::info!("server requested reconnect");
                return SessionEnd::Reconnect;
            }
            OP_INVALID_SESSION => {
                tracing::warn!("server invalidated the session");
                return SessionEnd::Reconnect;
            }
            OP_HEARTBEAT_ACK => {}
            other => {
                tracing::debug!(op = other, "ignoring gateway frame");
            }
        }
    }
}

/// Sleep for `total`, waking early if the shutdown flag flips.
async fn sleep_while_running(total: Duration, running: &AtomicBool) {
    let mut remaining = total;
    let step = Duration::from_millis(250);
    while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
        let chunk = remaining.min(step);
        tokio::time::sleep(chunk).await;
        remaining = remaining.saturating_sub(chunk);
    }
}
