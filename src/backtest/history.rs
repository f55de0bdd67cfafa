// =============================================================================
// Historical kline loader — paginates GET /api/v3/klines (or /fapi/v1/klines
// for futures) by `open_time + 1`, stopping once a page comes back short of
// the exchange's 1000-row page size.
// =============================================================================

use tracing::info;

use crate::exchange::binance::BinanceClient;
use crate::market_feed::Candle;
use crate::types::Market;

const PAGE_SIZE: usize = 1000;

/// Fetch every candle from `start_time_ms` through now (or until the
/// exchange stops returning full pages).
pub async fn fetch_history(
    client: &BinanceClient,
    market: Market,
    symbol: &str,
    interval: &str,
    start_time_ms: i64,
) -> anyhow::Result<Vec<Candle>> {
    let mut all = Vec::new();
    let mut cursor = start_time_ms;

    loop {
        let page = client
            .fetch_klines(market, symbol, interval, cursor)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let page_len = page.len();
        if page_len == 0 {
            break;
        }
        let last_open_time = page.last().map(|c| c.open_time).unwrap_or(cursor);
        all.extend(page);

        if page_len < PAGE_SIZE {
            break;
        }
        cursor = last_open_time + 1;
    }

    info!(symbol, candles = all.len(), "historical klines loaded");
    Ok(all)
}

#[cfg(test)]
mod tests {
    // fetch_history talks to the live exchange and has no pure-function
    // surface worth a unit test here; pagination termination logic is
    // exercised indirectly via the optimizer/engine tests, which drive
    // fixed in-memory candle vectors instead of network pages.
}
