//! SQLite state store.
//!
//! Persists named JSON snapshots of the trading meta-data plus two capped
//! append-only logs (transactions and notifications). Writers never touch
//! SQLite directly: mutations mark keys dirty and a background task
//! coalesces them into one flush 100 ms later.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::model::{MetaData, Transaction};

/// Delay before a dirty set is written out, so bursts coalesce.
const FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Current schema/snapshot version.
pub const STORE_VERSION: u32 = 2;

/// Named snapshot slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKey {
    Strategies,
    TradesOpen,
    VirtualBalances,
    BalanceHistory,
    PublicStrategies,
    Version,
}

impl SnapshotKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKey::Strategies => "strategies",
            SnapshotKey::TradesOpen => "trades_open",
            SnapshotKey::VirtualBalances => "virtual_balances",
            SnapshotKey::BalanceHistory => "balance_history",
            SnapshotKey::PublicStrategies => "public_strategies",
            SnapshotKey::Version => "version",
        }
    }
}

/// SQLite-backed store with a dirty-set write path.
pub struct StateStore {
    conn: Mutex<Connection>,
    max_rows: u32,
    dirty: Mutex<HashSet<SnapshotKey>>,
    changed: Notify,
}

impl StateStore {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, max_rows: u32) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", path.as_ref()))?;
        let store = Self {
            conn: Mutex::new(conn),
            max_rows,
            dirty: Mutex::new(HashSet::new()),
            changed: Notify::new(),
        };
        store.init_schema()?;
        info!("State store initialized at {:?}", path.as_ref());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(max_rows: u32) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            max_rows,
            dirty: Mutex::new(HashSet::new()),
            changed: Notify::new(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute_batch(
            r#"
            -- Named JSON snapshots of the meta-data
            CREATE TABLE IF NOT EXISTS snapshots (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated TEXT NOT NULL
            );

            -- Append-only transaction log (capped)
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                value TEXT NOT NULL
            );

            -- Append-only notification log (capped)
            CREATE TABLE IF NOT EXISTS log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                value TEXT NOT NULL
            );
            "#,
        )?;
        debug!("Database schema initialized");
        Ok(())
    }

    /// Write one snapshot immediately.
    pub fn save_snapshot<T: Serialize>(&self, key: SnapshotKey, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute(
            r#"
            INSERT INTO snapshots (key, value, updated)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = ?2, updated = ?3
            "#,
            params![key.as_str(), json, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Load one snapshot, `None` when never written.
    pub fn load_snapshot<T: DeserializeOwned>(&self, key: SnapshotKey) -> Result<Option<T>> {
        let conn = self.conn.lock().expect("store poisoned");
        let json: Option<String> = conn
            .query_row(
                "SELECT value FROM snapshots WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json).with_context(|| {
                format!("Failed to decode snapshot {}", key.as_str())
            })?)),
            None => Ok(None),
        }
    }

    /// Mark a snapshot key for the next coalesced flush.
    pub fn mark_dirty(&self, key: SnapshotKey) {
        self.dirty.lock().expect("store poisoned").insert(key);
        self.changed.notify_one();
    }

    /// Append a transaction row, trimming the log to the row cap.
    pub fn append_transaction(&self, tx: &Transaction) -> Result<()> {
        self.append_capped("transactions", &serde_json::to_string(tx)?)
    }

    /// Append a log line, trimming to the row cap.
    pub fn append_log(&self, line: &str) -> Result<()> {
        self.append_capped("log", line)
    }

    fn append_capped(&self, table: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute(
            &format!("INSERT INTO {table} (value) VALUES (?1)"),
            params![value],
        )?;
        if self.max_rows > 0 {
            conn.execute(
                &format!(
                    "DELETE FROM {table} WHERE id <= (SELECT MAX(id) FROM {table}) - ?1"
                ),
                params![self.max_rows],
            )?;
        }
        Ok(())
    }

    /// One page of a capped log, newest first.
    pub fn read_page(&self, table: LogTable, page: u32, page_size: u32) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("store poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT value FROM {} ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            table.as_str()
        ))?;
        let rows = stmt
            .query_map(params![page_size, page.saturating_sub(1) * page_size], |row| {
                row.get::<_, String>(0)
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Flush every dirty snapshot from the meta-data. Returns the number of
    /// keys written.
    pub fn flush_dirty(&self, meta: &MetaData) -> usize {
        let keys: Vec<SnapshotKey> = {
            let mut dirty = self.dirty.lock().expect("store poisoned");
            dirty.drain().collect()
        };
        for key in &keys {
            if let Err(e) = self.write_key(*key, meta) {
                warn!(key = key.as_str(), error = %e, "Snapshot flush failed");
            }
        }
        keys.len()
    }

    /// Persist every snapshot, dirty or not.
    pub fn flush_all(&self, meta: &MetaData) {
        for key in [
            SnapshotKey::Strategies,
            SnapshotKey::TradesOpen,
            SnapshotKey::VirtualBalances,
            SnapshotKey::BalanceHistory,
            SnapshotKey::PublicStrategies,
            SnapshotKey::Version,
        ] {
            if let Err(e) = self.write_key(key, meta) {
                warn!(key = key.as_str(), error = %e, "Snapshot flush failed");
            }
        }
    }

    fn write_key(&self, key: SnapshotKey, meta: &MetaData) -> Result<()> {
        match key {
            SnapshotKey::Strategies => self.save_snapshot(key, &meta.strategies),
            SnapshotKey::TradesOpen => self.save_snapshot(key, &meta.trades_open),
            SnapshotKey::VirtualBalances => self.save_snapshot(key, &meta.virtual_balances),
            SnapshotKey::BalanceHistory => self.save_snapshot(key, &meta.balance_history),
            SnapshotKey::PublicStrategies => self.save_snapshot(key, &meta.public_strategies),
            SnapshotKey::Version => self.save_snapshot(key, &STORE_VERSION),
        }
    }

    /// Run the coalescing flusher until the process exits.
    pub async fn run_flusher(self: Arc<Self>, meta: Arc<tokio::sync::Mutex<MetaData>>) {
        loop {
            self.changed.notified().await;
            tokio::time::sleep(FLUSH_DELAY).await;
            let meta = meta.lock().await;
            let written = self.flush_dirty(&meta);
            if written > 0 {
                debug!(keys = written, "Flushed dirty snapshots");
            }
        }
    }
}

/// Tables readable through the diagnostics surface.
#[derive(Debug, Clone, Copy)]
pub enum LogTable {
    Transactions,
    Log,
}

impl LogTable {
    fn as_str(&self) -> &'static str {
        match self {
            LogTable::Transactions => "transactions",
            LogTable::Log => "log",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceType, TradingMode, TransactionAction, WalletType};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn tx(id: &str) -> Transaction {
        Transaction {
            time: Utc::now(),
            trade_id: id.to_string(),
            action: TransactionAction::Buy,
            symbol: "ETHBTC".to_string(),
            quantity: dec!(1),
            price: Some(dec!(0.05)),
            cost: dec!(0.05),
            wallet: WalletType::Spot,
            trading_mode: TradingMode::Real,
            source: SourceType::Signal,
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = StateStore::open_in_memory(100).unwrap();
        let strategies: std::collections::HashMap<String, crate::model::Strategy> =
            std::collections::HashMap::from([(
                "s1".to_string(),
                crate::model::Strategy {
                    id: "s1".to_string(),
                    name: "momentum".to_string(),
                    trade_amount: dec!(0.01),
                    trading_mode: TradingMode::Real,
                    is_active: true,
                    is_stopped: false,
                    loss_trade_run: 0,
                },
            )]);

        store
            .save_snapshot(SnapshotKey::Strategies, &strategies)
            .unwrap();
        let loaded: Option<std::collections::HashMap<String, crate::model::Strategy>> =
            store.load_snapshot(SnapshotKey::Strategies).unwrap();
        assert_eq!(loaded.unwrap()["s1"].trade_amount, dec!(0.01));
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let store = StateStore::open_in_memory(100).unwrap();
        let loaded: Option<u32> = store.load_snapshot(SnapshotKey::Version).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_transaction_log_is_capped() {
        let store = StateStore::open_in_memory(3).unwrap();
        for i in 0..5 {
            store.append_transaction(&tx(&format!("t{i}"))).unwrap();
        }
        let page = store.read_page(LogTable::Transactions, 1, 10).unwrap();
        assert_eq!(page.len(), 3);
        // Newest first.
        assert!(page[0].contains("t4"));
        assert!(page[2].contains("t2"));
    }

    #[test]
    fn test_dirty_flush_writes_marked_keys() {
        let store = StateStore::open_in_memory(100).unwrap();
        let mut meta = MetaData::new(10);
        meta.strategies.insert(
            "s1".to_string(),
            crate::model::Strategy {
                id: "s1".to_string(),
                name: "momentum".to_string(),
                trade_amount: dec!(0.01),
                trading_mode: TradingMode::Real,
                is_active: true,
                is_stopped: false,
                loss_trade_run: 0,
            },
        );

        store.mark_dirty(SnapshotKey::Strategies);
        assert_eq!(store.flush_dirty(&meta), 1);
        // Second flush has nothing left.
        assert_eq!(store.flush_dirty(&meta), 0);

        let loaded: Option<std::collections::HashMap<String, crate::model::Strategy>> =
            store.load_snapshot(SnapshotKey::Strategies).unwrap();
        assert!(loaded.unwrap().contains_key("s1"));
    }
}
