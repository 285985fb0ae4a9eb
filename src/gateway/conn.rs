// =============================================================================
// Connection task — keeps one WebSocket alive, forever
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::PushGateway;
use crate::types::{now_ms, ConnStatus};

pub const PING_INTERVAL_MS: u64 = 5_000;
pub const WATCHDOG_TIMEOUT_MS: u64 = 20_000;
pub const RECONNECT_DELAY_MS: u64 = 500;
pub const SLOW_RETRY_DELAY_MS: u64 = 30_000;
pub const CONNECT_TIMEOUT_MS: u64 = 3_000;
pub const MAX_MISSED_PONGS: u32 = 3;

const ERROR_THRESHOLD: usize = 5;
const ERROR_WINDOW_MS: i64 = 10_000;

/// Structurally broken frames tolerated per window before the socket is
/// recycled.
const MAX_FRAME_ERRORS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Public,
    Private,
}

impl std::fmt::Display for ConnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Private => write!(f, "private"),
        }
    }
}

// =============================================================================
// Error-rate circuit breaker
// =============================================================================

/// Sliding-window counter over connection failures. While tripped, reconnects
/// back off to the slow-retry delay and the stream reports degraded status.
struct ErrorBreaker {
    events: VecDeque<i64>,
    threshold: usize,
    window_ms: i64,
}

impl ErrorBreaker {
    fn new(threshold: usize, window_ms: i64) -> Self {
        Self {
            events: VecDeque::new(),
            threshold,
            window_ms,
        }
    }

    fn record(&mut self, now: i64) {
        self.events.push_back(now);
        self.prune(now);
    }

    fn tripped(&mut self, now: i64) -> bool {
        self.prune(now);
        self.events.len() >= self.threshold
    }

    fn prune(&mut self, now: i64) {
        while let Some(&oldest) = self.events.front() {
            if now - oldest > self.window_ms {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

// =============================================================================
// Connection loop
// =============================================================================

/// Connect, drive, reconnect. Never returns while the gateway is alive; the
/// loop exits only when the outbound op channel closes.
pub(super) async fn run_connection(
    gateway: Arc<PushGateway>,
    kind: ConnKind,
    mut ops_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut breaker = ErrorBreaker::new(ERROR_THRESHOLD, ERROR_WINDOW_MS);
    loop {
        gateway.set_status(kind, ConnStatus::Connecting);
        let url = gateway.url(kind).to_string();

        match tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((ws, _))) => {
                info!(kind = %kind, url = %url, "stream connected");
                gateway.set_status(kind, ConnStatus::Connected);
                gateway.on_open(kind);
                let reason = drive_socket(&gateway, kind, ws, &mut ops_rx).await;
                match reason {
                    CloseReason::OpsChannelClosed => {
                        info!(kind = %kind, "gateway dropped, connection task exiting");
                        return;
                    }
                    other => warn!(kind = %kind, reason = %other, "stream lost"),
                }
            }
            Ok(Err(err)) => warn!(kind = %kind, error = %err, "connect failed"),
            Err(_) => warn!(kind = %kind, "connect timed out"),
        }

        breaker.record(now_ms());
        let (status, delay_ms) = if breaker.tripped(now_ms()) {
            (ConnStatus::Error, SLOW_RETRY_DELAY_MS)
        } else {
            (ConnStatus::Reconnecting, RECONNECT_DELAY_MS)
        };
        gateway.set_status(kind, status);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

#[derive(Debug, Clone, Copy)]
enum CloseReason {
    ReadError,
    StreamEnded,
    ServerClosed,
    Watchdog,
    MissedPongs,
    TooManyBadFrames,
    WriteError,
    OpsChannelClosed,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ReadError => "read error",
            Self::StreamEnded => "stream ended",
            Self::ServerClosed => "server closed",
            Self::Watchdog => "inbound watchdog expired",
            Self::MissedPongs => "missed pongs",
            Self::TooManyBadFrames => "too many invalid frames",
            Self::WriteError => "write error",
            Self::OpsChannelClosed => "ops channel closed",
        };
        write!(f, "{s}")
    }
}

async fn drive_socket(
    gateway: &Arc<PushGateway>,
    kind: ConnKind,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ops_rx: &mut mpsc::UnboundedReceiver<String>,
) -> CloseReason {
    let (mut write, mut read) = ws.split();

    let mut ping_tick = tokio::time::interval(Duration::from_millis(PING_INTERVAL_MS));
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so the first ping waits a full
    // interval.
    ping_tick.tick().await;

    let mut last_inbound = tokio::time::Instant::now();
    let mut awaiting_pong = false;
    let mut missed_pongs: u32 = 0;
    let mut frame_errors: u32 = 0;
    let mut frame_error_window_start = now_ms();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    // Any inbound traffic proves the link is alive.
                    last_inbound = tokio::time::Instant::now();
                    awaiting_pong = false;
                    missed_pongs = 0;

                    if gateway.handle_frame(kind, &text).is_err() {
                        let now = now_ms();
                        if now - frame_error_window_start > ERROR_WINDOW_MS {
                            frame_errors = 0;
                            frame_error_window_start = now;
                        }
                        frame_errors += 1;
                        if frame_errors > MAX_FRAME_ERRORS {
                            return CloseReason::TooManyBadFrames;
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    last_inbound = tokio::time::Instant::now();
                    if write.send(Message::Pong(payload)).await.is_err() {
                        return CloseReason::WriteError;
                    }
                }
                Some(Ok(Message::Close(_))) => return CloseReason::ServerClosed,
                Some(Ok(_)) => {
                    last_inbound = tokio::time::Instant::now();
                }
                Some(Err(err)) => {
                    debug!(kind = %kind, error = %err, "websocket read error");
                    return CloseReason::ReadError;
                }
                None => return CloseReason::StreamEnded,
            },
            _ = ping_tick.tick() => {
                if last_inbound.elapsed() >= Duration::from_millis(WATCHDOG_TIMEOUT_MS) {
                    return CloseReason::Watchdog;
                }
                if awaiting_pong {
                    missed_pongs += 1;
                    if missed_pongs >= MAX_MISSED_PONGS {
                        return CloseReason::MissedPongs;
                    }
                }
                let ping = format!("{{\"op\":\"ping\",\"ping\":{}}}", now_ms() / 1000);
                if write.send(Message::Text(ping)).await.is_err() {
                    return CloseReason::WriteError;
                }
                awaiting_pong = true;
            },
            op = ops_rx.recv() => match op {
                Some(frame) => {
                    if write.send(Message::Text(frame)).await.is_err() {
                        return CloseReason::WriteError;
                    }
                }
                None => return CloseReason::OpsChannelClosed,
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
