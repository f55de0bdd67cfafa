// =============================================================================
// State Store — durable key/value for per-pair config, per-pair runtime
// snapshot, and app-wide state.
//
// Grounded on the connection-per-operation-on-the-blocking-pool idiom: every
// call opens its own `rusqlite::Connection`, does its work, and drops it, so
// no connection handle is held across an await point. WAL mode lets
// concurrent readers/writers on distinct rows proceed without serializing
// behind each other beyond SQLite's own row-level discipline.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, warn};

use crate::domain::{AppStateRecord, PairConfig, PairRecord, PairRuntime, PairStats};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage corrupted: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct StateStore {
    db_path: String,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl StateStore {
    /// Open (creating if absent) the database at `db_path` and ensure the
    /// schema exists. Does not hold the connection open afterwards.
    pub async fn init(db_path: impl Into<String>) -> Result<Self> {
        let db_path = db_path.into();
        let path = db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_conn(&path)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS pairs_state (
                    pair_id     TEXT PRIMARY KEY,
                    config_json TEXT,
                    runtime_json TEXT,
                    updated_at  INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS app_state (
                    id         INTEGER PRIMARY KEY CHECK (id = 1),
                    data_json  TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );",
            )
            .context("failed to create schema")?;
            Ok(())
        })
        .await
        .context("store init task panicked")??;

        Ok(Self { db_path })
    }

    pub async fn load_all_pairs(&self) -> Result<Vec<PairRecord>> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<PairRecord>> {
            let conn = open_conn(&path)?;
            let mut stmt = conn.prepare(
                "SELECT pair_id, config_json, runtime_json, updated_at FROM pairs_state",
            )?;
            let rows = stmt.query_map([], |row| {
                let pair_id: String = row.get(0)?;
                let config_json: Option<String> = row.get(1)?;
                let runtime_json: Option<String> = row.get(2)?;
                let updated_at: i64 = row.get(3)?;
                Ok((pair_id, config_json, runtime_json, updated_at))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (pair_id, config_json, runtime_json, updated_at) = row?;
                let config: PairConfig = match config_json {
                    Some(raw) => match serde_json::from_str(&raw) {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(pair = %pair_id, error = %e, "dropping pair with corrupt config");
                            continue;
                        }
                    },
                    None => {
                        warn!(pair = %pair_id, "dropping pair row with no config");
                        continue;
                    }
                };
                let runtime: PairRuntime = runtime_json
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or_default();
                out.push(PairRecord {
                    pair_id,
                    config,
                    runtime,
                    stats: PairStats::default(),
                    updated_at,
                });
            }
            Ok(out)
        })
        .await
        .context("load_all_pairs task panicked")?
    }

    pub async fn save_pair_config(&self, pair_id: &str, config: &PairConfig) -> Result<()> {
        let path = self.db_path.clone();
        let pair_id = pair_id.to_string();
        let config_json = serde_json::to_string(config)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_conn(&path)?;
            conn.execute(
                "INSERT INTO pairs_state (pair_id, config_json, runtime_json, updated_at)
                 VALUES (?1, ?2, NULL, ?3)
                 ON CONFLICT(pair_id) DO UPDATE SET
                    config_json = excluded.config_json,
                    runtime_json = COALESCE(pairs_state.runtime_json, excluded.runtime_json),
                    updated_at = excluded.updated_at",
                params![pair_id, config_json, now_ms()],
            )?;
            Ok(())
        })
        .await
        .context("save_pair_config task panicked")?
    }

    pub async fn save_pair_runtime(&self, pair_id: &str, runtime: &PairRuntime) -> Result<()> {
        let path = self.db_path.clone();
        let pair_id = pair_id.to_string();
        let runtime_json = serde_json::to_string(runtime)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_conn(&path)?;
            conn.execute(
                "INSERT INTO pairs_state (pair_id, config_json, runtime_json, updated_at)
                 VALUES (?1, NULL, ?2, ?3)
                 ON CONFLICT(pair_id) DO UPDATE SET
                    runtime_json = excluded.runtime_json,
                    config_json = COALESCE(pairs_state.config_json, excluded.config_json),
                    updated_at = excluded.updated_at",
                params![pair_id, runtime_json, now_ms()],
            )?;
            Ok(())
        })
        .await
        .context("save_pair_runtime task panicked")?
    }

    pub async fn delete_pair(&self, pair_id: &str) -> Result<()> {
        let path = self.db_path.clone();
        let pair_id = pair_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_conn(&path)?;
            conn.execute("DELETE FROM pairs_state WHERE pair_id = ?1", params![pair_id])?;
            Ok(())
        })
        .await
        .context("delete_pair task panicked")?
    }

    pub async fn save_app_state(&self, state: &AppStateRecord) -> Result<()> {
        let path = self.db_path.clone();
        let data_json = serde_json::to_string(state)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_conn(&path)?;
            conn.execute(
                "INSERT INTO app_state (id, data_json, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET data_json = excluded.data_json, updated_at = excluded.updated_at",
                params![data_json, now_ms()],
            )?;
            Ok(())
        })
        .await
        .context("save_app_state task panicked")?
    }

    pub async fn load_app_state(&self) -> Result<AppStateRecord> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<AppStateRecord> {
            let conn = open_conn(&path)?;
            let raw: Option<String> = conn
                .query_row("SELECT data_json FROM app_state WHERE id = 1", [], |row| row.get(0))
                .optional()?;
            match raw {
                Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                    error!(error = %e, "app_state row corrupt, falling back to defaults");
                    anyhow::anyhow!("corrupt app_state row: {e}")
                }),
                None => Ok(AppStateRecord::default()),
            }
        })
        .await
        .context("load_app_state task panicked")?
    }
}

fn open_conn(path: &str) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("failed to open store at {path}"))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StrategySettings;

    async fn temp_store() -> StateStore {
        let path = format!("{}/meridian-test-{}.sqlite", std::env::temp_dir().display(), uuid::Uuid::new_v4());
        StateStore::init(path).await.unwrap()
    }

    #[tokio::test]
    async fn save_config_then_runtime_then_load_round_trips() {
        let store = temp_store().await;
        let config = PairConfig {
            pair_id: "BTCUSDT".into(),
            exchange: "binance".into(),
            settings: StrategySettings::default(),
        };
        store.save_pair_config("BTCUSDT", &config).await.unwrap();
        let mut runtime = PairRuntime::default();
        runtime.position_open = true;
        runtime.total_qty = 1.5;
        store.save_pair_runtime("BTCUSDT", &runtime).await.unwrap();

        let all = store.load_all_pairs().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].pair_id, "BTCUSDT");
        assert!(all[0].runtime.position_open);
        assert_eq!(all[0].runtime.total_qty, 1.5);
    }

    #[tokio::test]
    async fn config_save_preserves_existing_runtime() {
        let store = temp_store().await;
        let config = PairConfig {
            pair_id: "ETHUSDT".into(),
            exchange: "binance".into(),
            settings: StrategySettings::default(),
        };
        store.save_pair_config("ETHUSDT", &config).await.unwrap();
        let mut runtime = PairRuntime::default();
        runtime.total_qty = 3.0;
        store.save_pair_runtime("ETHUSDT", &runtime).await.unwrap();

        // Re-saving config must not wipe the runtime column.
        store.save_pair_config("ETHUSDT", &config).await.unwrap();
        let all = store.load_all_pairs().await.unwrap();
        assert_eq!(all[0].runtime.total_qty, 3.0);
    }

    #[tokio::test]
    async fn delete_pair_removes_row() {
        let store = temp_store().await;
        let config = PairConfig {
            pair_id: "SOLUSDT".into(),
            exchange: "binance".into(),
            settings: StrategySettings::default(),
        };
        store.save_pair_config("SOLUSDT", &config).await.unwrap();
        store.delete_pair("SOLUSDT").await.unwrap();
        let all = store.load_all_pairs().await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn app_state_round_trips() {
        let store = temp_store().await;
        let mut state = AppStateRecord::default();
        state.auto_resume_running_pairs = true;
        store.save_app_state(&state).await.unwrap();
        let loaded = store.load_app_state().await.unwrap();
        assert!(loaded.auto_resume_running_pairs);
    }

    #[tokio::test]
    async fn load_app_state_defaults_when_absent() {
        let store = temp_store().await;
        let loaded = store.load_app_state().await.unwrap();
        assert!(!loaded.auto_resume_running_pairs);
    }
}
