//! Polymarket CLOB market-channel client.
//!
//! Blocking websocket subscriber for a single asset id. A session sends the
//! subscribe payload, keeps the connection alive with `PING` text frames,
//! and forwards parsed book messages over a channel; the connection loop
//! reconnects with doubling, jittered backoff.
//!
//! Frame parsing is a pure function over the server's JSON so it can be
//! tested offline. Only the two book-shaped event types feed the codec:
//! `book` (full re-statement, sent after every connect) and `price_change`
//! (incremental deltas). Trade prints, tick-size changes and `PONG` replies
//! are logged at debug level and dropped.

use anyhow::{Context, Result, bail};
use crossbeam_channel::Sender;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::Value;
use std::io;
use std::net::TcpStream;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::record::{LevelChange, PriceLevel, RawUpdateEvent, Side};

pub const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

const PING_INTERVAL: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A parsed market-channel message relevant to the book codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketMessage {
    /// Full book re-statement; the encoder reconciles it into a delta.
    Snapshot {
        timestamp_ms: u64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    },
    /// Incremental level changes.
    Update(RawUpdateEvent),
}

pub struct MarketClient {
    url: String,
    asset_id: String,
    stop: Arc<AtomicBool>,
}

impl MarketClient {
    pub fn new(url: impl Into<String>, asset_id: impl Into<String>, stop: Arc<AtomicBool>) -> Self {
        Self { url: url.into(), asset_id: asset_id.into(), stop }
    }

    /// Connect-and-read loop. Returns when the stop flag is set or the
    /// receiving side goes away; transport errors trigger a reconnect.
    pub fn run(&self, tx: Sender<MarketMessage>) {
        let mut backoff = Duration::from_secs(1);
        while !self.stop.load(Ordering::Relaxed) {
            match self.session(&tx) {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Closed) => {
                    backoff = Duration::from_secs(1);
                }
                Err(e) => warn!("session error: {e:#}"),
            }
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1_000));
            let sleep_for = backoff.min(MAX_BACKOFF) + jitter;
            info!("reconnecting in {:.1}s", sleep_for.as_secs_f64());
            std::thread::sleep(sleep_for);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn session(&self, tx: &Sender<MarketMessage>) -> Result<SessionEnd> {
        info!(url = %self.url, "connecting");
        let (mut socket, _response) =
            tungstenite::connect(self.url.as_str()).context("websocket connect")?;
        set_read_timeout(&mut socket, PING_INTERVAL)?;

        let subscribe =
            serde_json::json!({ "assets_ids": [self.asset_id], "type": "market" }).to_string();
        socket.send(Message::Text(subscribe)).context("send subscribe")?;
        info!("subscribed");

        let mut last_ping = Instant::now();
        loop {
            if self.stop.load(Ordering::Relaxed) {
                let _ = socket.close(None);
                return Ok(SessionEnd::Stopped);
            }
            match socket.read() {
                Ok(Message::Text(text)) => {
                    let received_ms = now_unix_ms();
                    for msg in parse_frame(&text, &self.asset_id, received_ms) {
                        if tx.send(msg).is_err() {
                            // recorder side is gone; nothing left to do
                            let _ = socket.close(None);
                            return Ok(SessionEnd::Stopped);
                        }
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "server closed connection");
                    return Ok(SessionEnd::Closed);
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e).context("websocket read"),
            }
            if last_ping.elapsed() >= PING_INTERVAL {
                socket.send(Message::Text("PING".into())).context("send ping")?;
                last_ping = Instant::now();
            }
        }
    }
}

enum SessionEnd {
    /// Stop flag observed; do not reconnect.
    Stopped,
    /// Server closed; reconnect with fresh backoff.
    Closed,
}

fn set_read_timeout(
    socket: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    timeout: Duration,
) -> Result<()> {
    let stream = match socket.get_mut() {
        MaybeTlsStream::Plain(s) => s,
        MaybeTlsStream::NativeTls(t) => t.get_mut(),
        _ => bail!("unsupported tls backend"),
    };
    stream.set_read_timeout(Some(timeout)).context("set read timeout")?;
    Ok(())
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Parse one server frame (a JSON object or an array of objects) into the
/// messages relevant to `asset_id`.
///
/// `fallback_ts_ms` (normally local receive time) is used when an event
/// carries no parseable timestamp; the venue sends timestamps as decimal
/// strings of epoch milliseconds.
pub fn parse_frame(text: &str, asset_id: &str, fallback_ts_ms: u64) -> Vec<MarketMessage> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            // PONG replies and other non-JSON text
            debug!(frame = %text, "ignoring non-json frame");
            return Vec::new();
        }
    };

    let events: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![&value],
        _ => return Vec::new(),
    };

    let mut out = Vec::new();
    for ev in events {
        let event_type = ev.get("event_type").and_then(Value::as_str).unwrap_or("");
        if let Some(id) = ev.get("asset_id").and_then(Value::as_str) {
            if id != asset_id {
                warn!(got = %id, "event for unexpected asset, skipping");
                continue;
            }
        }
        let timestamp_ms = ev
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(fallback_ts_ms);

        match event_type {
            "book" => {
                // older payloads spell the sides buys/sells
                let bids = parse_levels(ev.get("bids").or_else(|| ev.get("buys")));
                let asks = parse_levels(ev.get("asks").or_else(|| ev.get("sells")));
                out.push(MarketMessage::Snapshot { timestamp_ms, bids, asks });
            }
            "price_change" => {
                let changes = parse_changes(ev.get("changes"));
                out.push(MarketMessage::Update(RawUpdateEvent {
                    asset_id: asset_id.to_string(),
                    timestamp_ms,
                    changes,
                }));
            }
            other => {
                debug!(event_type = %other, "ignoring non-book event");
            }
        }
    }
    out
}

fn parse_levels(levels: Option<&Value>) -> Vec<PriceLevel> {
    let Some(Value::Array(items)) = levels else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|lv| {
            let price = decimal_field(lv, "price")?;
            let size = decimal_field(lv, "size")?;
            Some(PriceLevel { price, size })
        })
        .collect()
}

fn parse_changes(changes: Option<&Value>) -> Vec<LevelChange> {
    let Some(Value::Array(items)) = changes else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|ch| {
            let side = match ch.get("side").and_then(Value::as_str) {
                Some("BUY") => Side::Bid,
                Some("SELL") => Side::Ask,
                other => {
                    debug!(?other, "change with unknown side, skipping");
                    return None;
                }
            };
            let price = decimal_field(ch, "price")?;
            let size = decimal_field(ch, "size")?;
            Some(LevelChange { side, price, size })
        })
        .collect()
}

fn decimal_field(obj: &Value, key: &str) -> Option<Decimal> {
    let raw = obj.get(key).and_then(Value::as_str)?;
    match Decimal::from_str(raw) {
        Ok(d) => Some(d),
        Err(_) => {
            debug!(key, raw, "unparseable decimal field, skipping entry");
            None
        }
    }
}
