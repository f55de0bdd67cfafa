// =============================================================================
// Bot Manager (C9) — owns every pair worker, the state store, and the global
// risk manager; handles startup/resync, add/start/stop pair, trade-result
// intake, emergency stop, and debounced persistence.
//
// Grounded on app_state.rs's role as the single hub tying subsystems
// together (HashMap-of-engines behind RwLock, Arc fan-out to async tasks),
// narrowed from "one AppState for everything" down to the pairs/tasks
// bookkeeping this engine actually needs.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::domain::{AppStateRecord, ExchangeCredentials, PairConfig, PairRecord, StrategySettings, TradeResult};
use crate::exchange::ExchangeClient;
use crate::market_feed::MarketFeed;
use crate::pair_worker::{PairWorker, WorkerCallbacks};
use crate::risk::RiskManager;
use crate::store::StateStore;
use crate::types::RunMode;

const MAX_ACTIVE_PAIRS_WARNING: usize = 15;
const PERSIST_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq)]
pub enum AddPairError {
    AlreadyExists,
    BacktestRunModeForbidden,
    UnknownExchange(String),
}

impl std::fmt::Display for AddPairError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "pair already exists"),
            Self::BacktestRunModeForbidden => write!(f, "pairs cannot be added directly in backtest run mode"),
            Self::UnknownExchange(name) => write!(f, "unknown exchange: {name}"),
        }
    }
}

impl std::error::Error for AddPairError {}

pub struct BotManager {
    store: StateStore,
    risk: Arc<RiskManager>,
    exchanges: RwLock<HashMap<String, Arc<dyn ExchangeClient>>>,
    feeds: RwLock<HashMap<String, Arc<MarketFeed>>>,
    workers: RwLock<HashMap<String, Arc<PairWorker>>>,
    tasks: RwLock<HashMap<String, JoinHandle<()>>>,
    dirty_pairs: RwLock<HashSet<String>>,
    app_state: RwLock<AppStateRecord>,
}

impl BotManager {
    pub fn new(
        store: StateStore,
        exchanges: HashMap<String, Arc<dyn ExchangeClient>>,
        feeds: HashMap<String, Arc<MarketFeed>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            risk: Arc::new(RiskManager::new()),
            exchanges: RwLock::new(exchanges),
            feeds: RwLock::new(feeds),
            workers: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            dirty_pairs: RwLock::new(HashSet::new()),
            app_state: RwLock::new(AppStateRecord::default()),
        })
    }

    /// Load persisted app state and every pair, reconstruct a worker per
    /// pair, and auto-resume pairs that were running when the process last
    /// stopped. Spawns the periodic snapshot/flush background tasks.
    pub async fn startup(self: &Arc<Self>) -> anyhow::Result<()> {
        let app_state = self.store.load_app_state().await?;
        let auto_resume = app_state.auto_resume_running_pairs;
        *self.app_state.write() = app_state;

        let records = self.store.load_all_pairs().await?;
        info!(count = records.len(), "loaded persisted pairs");

        let mut to_resume = Vec::new();
        for record in records {
            let pair_id = record.pair_id.clone();
            if record.runtime.is_running && auto_resume {
                to_resume.push(pair_id);
            }
            self.reconstruct_worker(record).await;
        }

        for pair_id in to_resume {
            self.start_pair_task(&pair_id);
        }

        self.spawn_snapshot_task();
        self.spawn_flush_task();
        Ok(())
    }

    async fn reconstruct_worker(self: &Arc<Self>, record: PairRecord) {
        let pair_id = record.pair_id.clone();
        let mut runtime = record.runtime;
        runtime.needs_resync = true;
        let settings = record.config.settings.clone();

        let Some(exchange) = self.exchanges.read().get(&record.config.exchange).cloned() else {
            warn!(pair = %pair_id, exchange = %record.config.exchange, "dropping pair bound to unknown exchange");
            return;
        };
        let Some(feed) = self.feeds.read().get(&record.config.exchange).cloned() else {
            warn!(pair = %pair_id, exchange = %record.config.exchange, "dropping pair, no feed for exchange");
            return;
        };
        feed.subscribe(&pair_id, &settings.timeframe).await;

        let worker = PairWorker::new(
            pair_id.clone(),
            record.config.exchange.clone(),
            exchange,
            feed,
            settings,
            runtime,
            self.clone(),
        );
        self.workers.write().insert(pair_id, worker);
    }

    /// Add a new pair. Forbidden when `run_mode == Backtest` (backtests run
    /// through the offline engine, not a live worker) or when the named
    /// exchange has no registered client.
    pub async fn add_pair(self: &Arc<Self>, pair_id: &str, exchange_name: &str, settings: StrategySettings) -> Result<(), AddPairError> {
        if self.workers.read().contains_key(pair_id) {
            return Err(AddPairError::AlreadyExists);
        }
        if settings.run_mode == RunMode::Backtest {
            return Err(AddPairError::BacktestRunModeForbidden);
        }
        let exchange = self
            .exchanges
            .read()
            .get(exchange_name)
            .cloned()
            .ok_or_else(|| AddPairError::UnknownExchange(exchange_name.to_string()))?;
        let feed = self
            .feeds
            .read()
            .get(exchange_name)
            .cloned()
            .ok_or_else(|| AddPairError::UnknownExchange(exchange_name.to_string()))?;

        if self.workers.read().len() >= MAX_ACTIVE_PAIRS_WARNING {
            warn!(count = self.workers.read().len() + 1, "active pair count exceeds recommended maximum of 15");
        }

        feed.subscribe(pair_id, &settings.timeframe).await;

        let config = PairConfig {
            pair_id: pair_id.to_string(),
            exchange: exchange_name.to_string(),
            settings: settings.clone(),
        };
        self.store
            .save_pair_config(pair_id, &config)
            .await
            .map_err(|_| AddPairError::UnknownExchange(exchange_name.to_string()))?;

        let worker = PairWorker::new(
            pair_id.to_string(),
            exchange_name.to_string(),
            exchange,
            feed,
            settings,
            crate::domain::PairRuntime::default(),
            self.clone(),
        );
        self.workers.write().insert(pair_id.to_string(), worker);
        Ok(())
    }

    pub fn remove_pair(self: &Arc<Self>, pair_id: &str) {
        self.stop_pair(pair_id);
        self.workers.write().remove(pair_id);
        let store = self.store.clone();
        let pair_id = pair_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.delete_pair(&pair_id).await {
                error!(pair = %pair_id, error = %e, "failed to delete pair row");
            }
        });
    }

    /// Idempotent: starting an already-running pair is a no-op.
    pub fn start_pair(self: &Arc<Self>, pair_id: &str) -> bool {
        let Some(worker) = self.workers.read().get(pair_id).cloned() else {
            return false;
        };
        if worker.is_running() {
            return true;
        }
        self.start_pair_task(pair_id);
        true
    }

    fn start_pair_task(self: &Arc<Self>, pair_id: &str) {
        let Some(worker) = self.workers.read().get(pair_id).cloned() else { return };
        worker.set_running(true);
        let handle = tokio::spawn(async move { worker.run().await });
        self.tasks.write().insert(pair_id.to_string(), handle);
        self.mark_dirty(pair_id);
    }

    /// Idempotent: stopping an already-stopped pair is a no-op.
    pub fn stop_pair(self: &Arc<Self>, pair_id: &str) -> bool {
        let Some(worker) = self.workers.read().get(pair_id).cloned() else {
            return false;
        };
        worker.set_running(false);
        self.tasks.write().remove(pair_id);
        self.mark_dirty(pair_id);
        true
    }

    pub async fn update_pair_settings(&self, pair_id: &str, settings: StrategySettings) -> anyhow::Result<()> {
        let Some(worker) = self.workers.read().get(pair_id).cloned() else {
            anyhow::bail!("unknown pair {pair_id}");
        };
        worker.update_settings(settings.clone());
        let config = PairConfig {
            pair_id: pair_id.to_string(),
            exchange: worker.exchange_name().to_string(),
            settings,
        };
        self.store.save_pair_config(pair_id, &config).await
    }

    pub async fn close_pair_now(&self, pair_id: &str) -> anyhow::Result<()> {
        let Some(worker) = self.workers.read().get(pair_id).cloned() else {
            anyhow::bail!("unknown pair {pair_id}");
        };
        worker.close_now().await
    }

    pub async fn refresh_protection(&self, pair_id: &str) -> anyhow::Result<()> {
        let Some(worker) = self.workers.read().get(pair_id).cloned() else {
            anyhow::bail!("unknown pair {pair_id}");
        };
        let settings = worker.settings();
        worker.refresh_protection(&settings).await
    }

    pub async fn cancel_protection(&self, pair_id: &str) -> anyhow::Result<()> {
        let Some(worker) = self.workers.read().get(pair_id).cloned() else {
            anyhow::bail!("unknown pair {pair_id}");
        };
        worker.cancel_protection().await
    }

    /// Cancel any in-flight entry/safety/exit order for a pair without
    /// touching its exchange-side protection orders or its running state.
    pub async fn cancel_orders(&self, pair_id: &str) -> anyhow::Result<()> {
        let Some(worker) = self.workers.read().get(pair_id).cloned() else {
            anyhow::bail!("unknown pair {pair_id}");
        };
        worker.cancel_in_flight().await;
        Ok(())
    }

    pub fn list_pairs(&self) -> Vec<PairRecord> {
        self.workers
            .read()
            .values()
            .map(|w| PairRecord {
                pair_id: w.pair_id().to_string(),
                config: PairConfig {
                    pair_id: w.pair_id().to_string(),
                    exchange: w.exchange_name().to_string(),
                    settings: w.settings(),
                },
                runtime: w.runtime_snapshot(),
                stats: crate::domain::PairStats::default(),
                updated_at: chrono::Utc::now().timestamp_millis(),
            })
            .collect()
    }

    /// Stop every running worker and cancel in-flight orders, without
    /// deleting any pair's persisted configuration.
    pub async fn emergency_stop_all(self: &Arc<Self>) {
        warn!("emergency stop triggered: halting all pairs");
        let pair_ids: Vec<String> = self.workers.read().keys().cloned().collect();
        for pair_id in &pair_ids {
            self.stop_pair(pair_id);
        }
        for pair_id in &pair_ids {
            if let Some(worker) = self.workers.read().get(pair_id).cloned() {
                worker.cancel_in_flight().await;
            }
        }
        self.risk.reset();
    }

    pub async fn shutdown(self: &Arc<Self>) {
        let pair_ids: Vec<String> = self.workers.read().keys().cloned().collect();
        for pair_id in pair_ids {
            self.stop_pair(&pair_id);
        }
        self.flush_dirty().await;
    }

    fn mark_dirty(&self, pair_id: &str) {
        self.dirty_pairs.write().insert(pair_id.to_string());
    }

    async fn flush_dirty(&self) {
        let dirty: Vec<String> = {
            let mut set = self.dirty_pairs.write();
            let drained = set.iter().cloned().collect();
            set.clear();
            drained
        };
        for pair_id in dirty {
            let Some(worker) = self.workers.read().get(&pair_id).cloned() else { continue };
            let runtime = worker.runtime_snapshot();
            if let Err(e) = self.store.save_pair_runtime(&pair_id, &runtime).await {
                error!(pair = %pair_id, error = %e, "failed to persist runtime");
            }
        }
    }

    fn spawn_flush_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PERSIST_FLUSH_INTERVAL);
            loop {
                interval.tick().await;
                manager.flush_dirty().await;
            }
        });
    }

    fn spawn_snapshot_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                interval.tick().await;
                let pair_ids: Vec<String> = manager.workers.read().keys().cloned().collect();
                for pair_id in pair_ids {
                    manager.mark_dirty(&pair_id);
                }
            }
        });
    }

    pub async fn save_credentials(&self, exchange: &str, key: String, secret: String) -> anyhow::Result<()> {
        let mut state = self.app_state.write().clone();
        state.credentials.insert(exchange.to_string(), ExchangeCredentials { key, secret });
        self.store.save_app_state(&state).await?;
        *self.app_state.write() = state;
        Ok(())
    }

    pub fn risk(&self) -> Arc<RiskManager> {
        Arc::clone(&self.risk)
    }
}

#[async_trait]
impl WorkerCallbacks for BotManager {
    async fn on_trade_closed(&self, result: TradeResult) {
        let tripped = self.risk.register_trade_result(result.pnl);
        info!(pair = %result.pair_id, pnl = result.pnl, tripped, "trade closed");
        if tripped {
            let pair_ids: Vec<String> = self.workers.read().keys().cloned().collect();
            warn!("risk manager tripped after three consecutive losses, stopping all pairs");
            for pair_id in pair_ids {
                let Some(worker) = self.workers.read().get(&pair_id).cloned() else { continue };
                worker.set_running(false);
                self.tasks.write().remove(&pair_id);
            }
        }
    }

    fn on_price_update(&self, _pair_id: &str, _price: f64) {
        // Price snapshots are served on demand from the market feed itself;
        // this hook exists for a future push-based event stream.
    }

    fn total_exposure(&self) -> f64 {
        self.workers.read().values().map(|w| w.runtime_snapshot().total_cost).sum()
    }

    fn schedule_runtime_save(&self, pair_id: &str) {
        self.mark_dirty(pair_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::stub::StubExchange;

    async fn manager() -> Arc<BotManager> {
        let path = format!("{}/meridian-bm-test-{}.sqlite", std::env::temp_dir().display(), uuid::Uuid::new_v4());
        let store = StateStore::init(path).await.unwrap();
        let mut exchanges: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
        exchanges.insert("binance".to_string(), Arc::new(StubExchange::new("binance")));
        let mut feeds = HashMap::new();
        feeds.insert("binance".to_string(), Arc::new(MarketFeed::new()));
        BotManager::new(store, exchanges, feeds)
    }

    #[tokio::test]
    async fn add_pair_rejects_duplicate() {
        let manager = manager().await;
        manager.add_pair("BTCUSDT", "binance", StrategySettings::default()).await.unwrap();
        let err = manager.add_pair("BTCUSDT", "binance", StrategySettings::default()).await.unwrap_err();
        assert_eq!(err, AddPairError::AlreadyExists);
    }

    #[tokio::test]
    async fn add_pair_rejects_backtest_run_mode() {
        let manager = manager().await;
        let settings = StrategySettings { run_mode: RunMode::Backtest, ..StrategySettings::default() };
        let err = manager.add_pair("BTCUSDT", "binance", settings).await.unwrap_err();
        assert_eq!(err, AddPairError::BacktestRunModeForbidden);
    }

    #[tokio::test]
    async fn add_pair_rejects_unknown_exchange() {
        let manager = manager().await;
        let err = manager.add_pair("BTCUSDT", "bybit", StrategySettings::default()).await.unwrap_err();
        assert_eq!(err, AddPairError::UnknownExchange("bybit".to_string()));
    }

    #[tokio::test]
    async fn start_stop_pair_is_idempotent() {
        let manager = manager().await;
        manager.add_pair("BTCUSDT", "binance", StrategySettings::default()).await.unwrap();
        assert!(manager.start_pair("BTCUSDT"));
        assert!(manager.start_pair("BTCUSDT"));
        assert!(manager.stop_pair("BTCUSDT"));
        assert!(manager.stop_pair("BTCUSDT"));
    }

    #[tokio::test]
    async fn unknown_pair_start_returns_false() {
        let manager = manager().await;
        assert!(!manager.start_pair("NOPE"));
    }

    #[tokio::test]
    async fn trade_loss_streak_trips_risk_and_stops_pairs() {
        let manager = manager().await;
        manager.add_pair("BTCUSDT", "binance", StrategySettings::default()).await.unwrap();
        manager.start_pair("BTCUSDT");
        manager
            .on_trade_closed(TradeResult {
                pair_id: "BTCUSDT".to_string(),
                pnl: -1.0,
                mode: crate::types::Mode::Spot,
                direction: crate::types::Direction::Long,
            })
            .await;
        manager
            .on_trade_closed(TradeResult {
                pair_id: "BTCUSDT".to_string(),
                pnl: -1.0,
                mode: crate::types::Mode::Spot,
                direction: crate::types::Direction::Long,
            })
            .await;
        manager
            .on_trade_closed(TradeResult {
                pair_id: "BTCUSDT".to_string(),
                pnl: -1.0,
                mode: crate::types::Mode::Spot,
                direction: crate::types::Direction::Long,
            })
            .await;
        assert!(manager.risk.state().tripped);
        assert!(!manager.workers.read().get("BTCUSDT").unwrap().is_running());
    }
}
