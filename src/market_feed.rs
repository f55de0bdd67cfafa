// =============================================================================
// Market Feed — single persistent websocket per exchange, multiplexing a
// ticker + closed-candle stream out to every subscribed symbol, with
// reconnect and full resubscription.
//
// Grounded on the kline-stream consumer in market_data/candle_buffer.rs
// (Candle shape, ring-buffer-per-key, fault-tolerant JSON parsing) but
// redesigned around one shared connection instead of one per (symbol,
// interval) pair.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443/ws";
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const MAX_CANDLES: usize = 200;

/// Immutable OHLCV candle. Feeds retain the last 200 closed candles per
/// symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

struct FeedState {
    prices: RwLock<HashMap<String, f64>>,
    candles: RwLock<HashMap<String, VecDeque<Candle>>>,
    candle_versions: RwLock<HashMap<String, u64>>,
    subscribed_pairs: RwLock<HashSet<String>>,
    pair_timeframes: RwLock<HashMap<String, String>>,
    control_tx: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    running: AtomicBool,
    next_id: AtomicU64,
}

/// One feed per exchange; started lazily by the bot manager on first
/// subscribe and shared by every pair worker on that exchange.
pub struct MarketFeed {
    state: Arc<FeedState>,
}

impl MarketFeed {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FeedState {
                prices: RwLock::new(HashMap::new()),
                candles: RwLock::new(HashMap::new()),
                candle_versions: RwLock::new(HashMap::new()),
                subscribed_pairs: RwLock::new(HashSet::new()),
                pair_timeframes: RwLock::new(HashMap::new()),
                control_tx: RwLock::new(None),
                running: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Spawn the connection task. Safe to call once; the task loops
    /// reconnect-with-3s-sleep for as long as `shutdown` has not been called.
    pub fn start(&self) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move { run(state).await });
    }

    pub async fn subscribe(&self, symbol: &str, timeframe: &str) {
        let symbol = symbol.to_uppercase();
        self.state.subscribed_pairs.write().insert(symbol.clone());
        self.state
            .pair_timeframes
            .write()
            .insert(symbol.clone(), timeframe.to_string());

        let streams = self.all_desired_streams();
        self.send_control("SUBSCRIBE", streams).await;
    }

    pub async fn unsubscribe(&self, symbol: &str) {
        let symbol = symbol.to_uppercase();
        let timeframe = self
            .state
            .pair_timeframes
            .write()
            .remove(&symbol)
            .unwrap_or_else(|| "1m".to_string());
        self.state.subscribed_pairs.write().remove(&symbol);
        self.state.prices.write().remove(&symbol);
        self.state.candles.write().remove(&symbol);
        self.state.candle_versions.write().remove(&symbol);

        let streams = pair_streams(&symbol, &timeframe);
        self.send_control("UNSUBSCRIBE", streams).await;
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.state.prices.read().get(&symbol.to_uppercase()).copied()
    }

    /// Most recent `count` closed candles, oldest-first.
    pub fn candles(&self, symbol: &str, count: usize) -> Vec<Candle> {
        let map = self.state.candles.read();
        match map.get(&symbol.to_uppercase()) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn candle_version(&self, symbol: &str) -> u64 {
        self.state
            .candle_versions
            .read()
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.state.subscribed_pairs.read().iter().cloned().collect()
    }

    pub fn shutdown(&self) {
        self.state.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.state.control_tx.write().take() {
            drop(tx);
        }
    }

    fn all_desired_streams(&self) -> Vec<String> {
        let timeframes = self.state.pair_timeframes.read();
        self.state
            .subscribed_pairs
            .read()
            .iter()
            .flat_map(|sym| {
                let tf = timeframes.get(sym).cloned().unwrap_or_else(|| "1m".to_string());
                pair_streams(sym, &tf)
            })
            .collect()
    }

    async fn send_control(&self, method: &str, streams: Vec<String>) {
        if streams.is_empty() {
            return;
        }
        let tx = self.state.control_tx.read().clone();
        let Some(tx) = tx else { return };
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::json!({ "method": method, "params": streams, "id": id });
        if tx.send(Message::Text(payload.to_string())).is_err() {
            warn!(method, "market feed control channel closed; reconnect in progress");
        }
    }
}

impl Default for MarketFeed {
    fn default() -> Self {
        Self::new()
    }
}

fn pair_streams(symbol: &str, timeframe: &str) -> Vec<String> {
    let lower = symbol.to_lowercase();
    vec![format!("{lower}@miniTicker"), format!("{lower}@kline_{timeframe}")]
}

async fn run(state: Arc<FeedState>) {
    while state.running.load(Ordering::SeqCst) {
        if let Err(e) = connect_and_listen(&state).await {
            warn!(error = %e, "market feed connection lost");
        }
        if !state.running.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_and_listen(state: &Arc<FeedState>) -> Result<()> {
    info!(url = BINANCE_WS_BASE, "connecting to market feed");
    let (ws, _resp) = connect_async(BINANCE_WS_BASE)
        .await
        .context("failed to connect to market feed websocket")?;
    let (mut write, mut read) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *state.control_tx.write() = Some(tx.clone());

    // Replay the full subscription set on every (re)connect.
    let desired: Vec<String> = {
        let timeframes = state.pair_timeframes.read();
        state
            .subscribed_pairs
            .read()
            .iter()
            .flat_map(|sym| {
                let tf = timeframes.get(sym).cloned().unwrap_or_else(|| "1m".to_string());
                pair_streams(sym, &tf)
            })
            .collect()
    };
    if !desired.is_empty() {
        let id = state.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::json!({ "method": "SUBSCRIBE", "params": desired, "id": id });
        write
            .send(Message::Text(payload.to_string()))
            .await
            .context("failed to replay subscription set")?;
        info!("replayed full subscription set after connect");
    }

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(msg) => {
                        write.send(msg).await.context("failed to send control message")?;
                    }
                    None => return Ok(()),
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_payload(state, &text),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        warn!("market feed stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn handle_payload(state: &Arc<FeedState>, text: &str) {
    let Ok(root) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };

    let Some(event) = root.get("e").and_then(|v| v.as_str()) else {
        // Subscription ack ({"result":null,"id":...}) — nothing to do.
        return;
    };

    match event {
        "24hrMiniTicker" => {
            let Some(symbol) = root.get("s").and_then(|v| v.as_str()) else { return };
            let Some(price) = root.get("c").and_then(parse_f64) else { return };
            state.prices.write().insert(symbol.to_uppercase(), price);
        }
        "kline" => {
            let Some(symbol) = root.get("s").and_then(|v| v.as_str()).map(str::to_uppercase) else {
                return;
            };
            let Some(k) = root.get("k") else { return };
            let Some(is_closed) = k.get("x").and_then(|v| v.as_bool()) else { return };
            if !is_closed {
                return;
            }
            let Some(candle) = parse_candle(k) else {
                debug!(symbol = %symbol, "dropping malformed kline payload");
                return;
            };

            // A closed candle also carries an authoritative last price.
            state.prices.write().insert(symbol.clone(), candle.close);

            let mut candles = state.candles.write();
            let ring = candles.entry(symbol.clone()).or_insert_with(VecDeque::new);
            ring.push_back(candle);
            while ring.len() > MAX_CANDLES {
                ring.pop_front();
            }
            drop(candles);

            *state.candle_versions.write().entry(symbol).or_insert(0) += 1;
        }
        _ => {}
    }
}

fn parse_candle(k: &serde_json::Value) -> Option<Candle> {
    Some(Candle {
        open_time: k.get("t")?.as_i64()?,
        close_time: k.get("T")?.as_i64()?,
        open: parse_f64(k.get("o")?)?,
        high: parse_f64(k.get("h")?)?,
        low: parse_f64(k.get("l")?)?,
        close: parse_f64(k.get("c")?)?,
        volume: parse_f64(k.get("v")?)?,
    })
}

fn parse_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_candle_event_updates_price_and_version() {
        let state = Arc::new(FeedState {
            prices: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            candle_versions: RwLock::new(HashMap::new()),
            subscribed_pairs: RwLock::new(HashSet::new()),
            pair_timeframes: RwLock::new(HashMap::new()),
            control_tx: RwLock::new(None),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        });

        let closed = serde_json::json!({
            "e": "kline", "s": "BTCUSDT",
            "k": {"t": 0, "T": 59999, "o": "100", "h": "101", "l": "99", "c": "100.5", "v": "10", "x": true}
        });
        handle_payload(&state, &closed.to_string());

        assert_eq!(*state.candle_versions.read().get("BTCUSDT").unwrap(), 1);
        assert_eq!(*state.prices.read().get("BTCUSDT").unwrap(), 100.5);
        assert_eq!(state.candles.read().get("BTCUSDT").unwrap().len(), 1);
    }

    #[test]
    fn in_progress_candle_does_not_advance_version() {
        let state = Arc::new(FeedState {
            prices: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            candle_versions: RwLock::new(HashMap::new()),
            subscribed_pairs: RwLock::new(HashSet::new()),
            pair_timeframes: RwLock::new(HashMap::new()),
            control_tx: RwLock::new(None),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        });

        let open = serde_json::json!({
            "e": "kline", "s": "BTCUSDT",
            "k": {"t": 0, "T": 59999, "o": "100", "h": "101", "l": "99", "c": "100.5", "v": "10", "x": false}
        });
        handle_payload(&state, &open.to_string());
        assert!(state.candle_versions.read().get("BTCUSDT").is_none());
    }

    #[test]
    fn mini_ticker_updates_price_only() {
        let state = Arc::new(FeedState {
            prices: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            candle_versions: RwLock::new(HashMap::new()),
            subscribed_pairs: RwLock::new(HashSet::new()),
            pair_timeframes: RwLock::new(HashMap::new()),
            control_tx: RwLock::new(None),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        });

        let ticker = serde_json::json!({ "e": "24hrMiniTicker", "s": "ETHUSDT", "c": "3000.1" });
        handle_payload(&state, &ticker.to_string());
        assert_eq!(*state.prices.read().get("ETHUSDT").unwrap(), 3000.1);
        assert!(state.candle_versions.read().get("ETHUSDT").is_none());
    }

    #[test]
    fn pair_streams_includes_ticker_and_kline() {
        let streams = pair_streams("BTCUSDT", "5m");
        assert_eq!(streams, vec!["btcusdt@miniTicker".to_string(), "btcusdt@kline_5m".to_string()]);
    }
}
