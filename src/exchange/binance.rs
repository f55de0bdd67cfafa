// =============================================================================
// Binance-like exchange adapter — HMAC-SHA256 signed REST calls against the
// spot (api.binance.com) and USD-M futures (fapi.binance.com) surfaces.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimiter;
use super::{ExchangeClient, ExchangeError, ExchangeResult, OrderAck, OrderStatusReport, PositionInfo};
use crate::types::{Market, OrderStatus, OrderType, Side};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;
const SPOT_BASE: &str = "https://api.binance.com";
const FUTURES_BASE: &str = "https://fapi.binance.com";

pub struct BinanceClient {
    api_key: String,
    secret: String,
    http: reqwest::Client,
    limiter: RateLimiter,
}

impl BinanceClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_rate_limit(api_key, secret, 8)
    }

    pub fn with_rate_limit(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        max_requests_per_second: u32,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            http,
            limiter: RateLimiter::new(max_requests_per_second),
        }
    }

    fn base_url(market: Market) -> &'static str {
        match market {
            Market::Spot => SPOT_BASE,
            Market::Futures => FUTURES_BASE,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn signed_get(&self, market: Market, path: &str, params: &str) -> ExchangeResult<serde_json::Value> {
        self.limiter.acquire().await;
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", Self::base_url(market), path, qs);
        self.send(self.http.get(&url)).await
    }

    async fn signed_post(&self, market: Market, path: &str, params: &str) -> ExchangeResult<serde_json::Value> {
        self.limiter.acquire().await;
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", Self::base_url(market), path, qs);
        self.send(self.http.post(&url)).await
    }

    async fn signed_delete(&self, market: Market, path: &str, params: &str) -> ExchangeResult<serde_json::Value> {
        self.limiter.acquire().await;
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", Self::base_url(market), path, qs);
        self.send(self.http.delete(&url)).await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> ExchangeResult<serde_json::Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(anyhow::anyhow!(e)))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(anyhow::anyhow!(e)))?;

        if status.is_success() {
            return Ok(body);
        }

        // Binance returns -4046 ("No need to change margin type") and
        // -4028-family "no need to change leverage" style codes; treat these
        // as success since the desired state already holds.
        if let Some(msg) = body.get("msg").and_then(|m| m.as_str()) {
            if msg.to_lowercase().contains("no need to change") {
                debug!(msg, "exchange reports desired state already set, treating as success");
                return Ok(body);
            }
        }

        Err(ExchangeError::Exchange(format!("{status}: {body}")))
    }

    /// Fetch up to 1000 klines starting at `start_time_ms` (unsigned public
    /// endpoint). Used by the backtest history loader, not by live trading.
    pub async fn fetch_klines(
        &self,
        market: Market,
        symbol: &str,
        interval: &str,
        start_time_ms: i64,
    ) -> ExchangeResult<Vec<crate::market_feed::Candle>> {
        self.limiter.acquire().await;
        let path = match market {
            Market::Spot => "/api/v3/klines",
            Market::Futures => "/fapi/v1/klines",
        };
        let url = format!(
            "{}{}?symbol={symbol}&interval={interval}&startTime={start_time_ms}&limit=1000",
            Self::base_url(market),
            path
        );
        let body = self.send(self.http.get(&url)).await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Exchange("klines response was not an array".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let row = row
                .as_array()
                .ok_or_else(|| ExchangeError::Exchange("kline row was not an array".into()))?;
            let parse_f64 = |v: &serde_json::Value| -> f64 {
                v.as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| v.as_f64())
                    .unwrap_or(0.0)
            };
            candles.push(crate::market_feed::Candle {
                open_time: row[0].as_i64().unwrap_or(0),
                open: parse_f64(&row[1]),
                high: parse_f64(&row[2]),
                low: parse_f64(&row[3]),
                close: parse_f64(&row[4]),
                volume: parse_f64(&row[5]),
                close_time: row[6].as_i64().unwrap_or(0),
            });
        }
        Ok(candles)
    }

    fn parse_order_ack(body: &serde_json::Value) -> ExchangeResult<OrderAck> {
        let order_id = body["orderId"]
            .as_u64()
            .ok_or_else(|| ExchangeError::Exchange("order response missing orderId".into()))?;
        let client_order_id = body["clientOrderId"].as_str().map(str::to_string);
        let status = body["status"]
            .as_str()
            .and_then(OrderStatus::from_binance)
            .unwrap_or(OrderStatus::New);
        Ok(OrderAck {
            order_id,
            client_order_id,
            status,
        })
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    #[instrument(skip(self), name = "binance::check_connection")]
    async fn check_connection(&self) -> bool {
        self.limiter.acquire().await;
        self.http
            .get(format!("{SPOT_BASE}/api/v3/ping"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    #[instrument(skip(self), name = "binance::get_balance")]
    async fn get_balance(&self, asset: &str) -> ExchangeResult<Option<f64>> {
        let account = self.signed_get(Market::Spot, "/api/v3/account", "").await?;
        let balances = account["balances"].as_array().cloned().unwrap_or_default();
        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                let free: f64 = b["free"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                return Ok(Some(free));
            }
        }
        warn!(asset, "asset not found in balances");
        Ok(None)
    }

    #[instrument(skip(self), name = "binance::place_order")]
    async fn place_order(
        &self,
        market: Market,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        qty: f64,
        price: Option<f64>,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        if order_type == OrderType::Limit && price.is_none() {
            return Err(ExchangeError::Validation("LIMIT order requires a price".into()));
        }

        let mut params = format!("symbol={symbol}&side={side}&type={order_type}&quantity={qty}");
        if let Some(p) = price {
            params.push_str(&format!("&price={p}"));
        }
        if order_type == OrderType::Limit {
            params.push_str("&timeInForce=GTC");
        }
        if market == Market::Futures && reduce_only {
            params.push_str("&reduceOnly=true");
        }

        let path = match market {
            Market::Spot => "/api/v3/order",
            Market::Futures => "/fapi/v1/order",
        };
        let body = self.signed_post(market, path, &params).await?;
        Self::parse_order_ack(&body)
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, market: Market, symbol: &str, order_id: u64) -> ExchangeResult<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let path = match market {
            Market::Spot => "/api/v3/order",
            Market::Futures => "/fapi/v1/order",
        };
        self.signed_delete(market, path, &params).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "binance::cancel_open_orders")]
    async fn cancel_open_orders(&self, market: Market, symbol: &str) -> ExchangeResult<()> {
        let params = format!("symbol={symbol}");
        let path = match market {
            Market::Spot => "/api/v3/openOrders",
            Market::Futures => "/fapi/v1/allOpenOrders",
        };
        self.signed_delete(market, path, &params).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "binance::get_order_status")]
    async fn get_order_status(
        &self,
        market: Market,
        symbol: &str,
        order_id: u64,
    ) -> ExchangeResult<OrderStatusReport> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let path = match market {
            Market::Spot => "/api/v3/order",
            Market::Futures => "/fapi/v1/order",
        };
        let body = self.signed_get(market, path, &params).await?;
        let status = body["status"]
            .as_str()
            .and_then(OrderStatus::from_binance)
            .unwrap_or(OrderStatus::New);
        let executed_qty: f64 = body["executedQty"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let cumulative_quote_or_avg_price: f64 = match market {
            Market::Spot => body["cummulativeQuoteQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            Market::Futures => body["avgPrice"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
        };
        Ok(OrderStatusReport {
            status,
            executed_qty,
            cumulative_quote_or_avg_price,
        })
    }

    #[instrument(skip(self), name = "binance::get_position")]
    async fn get_position(&self, market: Market, symbol: &str) -> ExchangeResult<PositionInfo> {
        if market == Market::Spot {
            return Ok(PositionInfo::default());
        }
        let params = format!("symbol={symbol}");
        let body = self.signed_get(Market::Futures, "/fapi/v2/positionRisk", &params).await?;
        let entry = body
            .as_array()
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or_default();
        let position_amt: f64 = entry["positionAmt"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let entry_price: f64 = entry["entryPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        Ok(PositionInfo { position_amt, entry_price })
    }

    #[instrument(skip(self), name = "binance::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.signed_post(Market::Futures, "/fapi/v1/leverage", &params).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "binance::set_margin_type")]
    async fn set_margin_type(&self, symbol: &str, isolated: bool) -> ExchangeResult<()> {
        let margin_type = if isolated { "ISOLATED" } else { "CROSSED" };
        let params = format!("symbol={symbol}&marginType={margin_type}");
        self.signed_post(Market::Futures, "/fapi/v1/marginType", &params).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "binance::place_tp")]
    async fn place_tp(&self, symbol: &str, side: Side, stop_price: f64, qty: f64) -> ExchangeResult<OrderAck> {
        let params = format!(
            "symbol={symbol}&side={side}&type=TAKE_PROFIT_MARKET&stopPrice={stop_price}&quantity={qty}&reduceOnly=true&workingType=MARK_PRICE"
        );
        let body = self.signed_post(Market::Futures, "/fapi/v1/order", &params).await?;
        Self::parse_order_ack(&body)
    }

    #[instrument(skip(self), name = "binance::place_sl")]
    async fn place_sl(&self, symbol: &str, side: Side, stop_price: f64, qty: f64) -> ExchangeResult<OrderAck> {
        let params = format!(
            "symbol={symbol}&side={side}&type=STOP_MARKET&stopPrice={stop_price}&quantity={qty}&reduceOnly=true&workingType=MARK_PRICE"
        );
        let body = self.signed_post(Market::Futures, "/fapi/v1/order", &params).await?;
        Self::parse_order_ack(&body)
    }

    #[instrument(skip(self), name = "binance::mark_price")]
    async fn mark_price(&self, symbol: &str) -> ExchangeResult<f64> {
        self.limiter.acquire().await;
        let url = format!("{FUTURES_BASE}/fapi/v1/premiumIndex?symbol={symbol}");
        let body = self.send(self.http.get(&url)).await?;
        body["markPrice"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExchangeError::Exchange("premiumIndex response missing markPrice".into()))
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}
