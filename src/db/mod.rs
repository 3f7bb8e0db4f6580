//! Persistence for ladder state.
//!
//! Stores everything needed to resume after restart:
//! - Full ledger snapshot per symbol (lots, history, audit log, counters)
//! - Equity curve for P&L tracking
//! - Ownership lease, so one process at a time runs a ledger
//! - Control queue for operator commands addressed to that process

mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::warn;

use crate::trading::{BotState, ControlCommand};

/// Load/save port for ledger snapshots, keyed by trading symbol.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Saved snapshot for `symbol`, if any.
    async fn load(&self, symbol: &str) -> Result<Option<BotState>>;

    /// Replace the snapshot for `symbol`.
    async fn save(&self, symbol: &str, state: &BotState) -> Result<()>;

    /// Forget `symbol` entirely.
    async fn clear(&self, symbol: &str) -> Result<()>;
}

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored snapshot row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSnapshot {
    pub symbol: String,
    pub snapshot: String,
    pub updated_at: String,
}

/// Equity curve point for tracking P&L over time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EquityPoint {
    pub id: i64,
    pub symbol: String,
    pub timestamp: String,
    pub equity: f64,
    pub balance: f64,
    pub exposure: f64,
    pub realized_pnl: f64,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // In-memory SQLite is per connection, so keep a single one
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Ledger snapshots
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_state (
                symbol TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Equity curve
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                equity REAL NOT NULL,
                balance REAL NOT NULL DEFAULT 0,
                exposure REAL NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_equity_curve_symbol ON equity_curve(symbol, id)",
        )
        .execute(&self.pool)
        .await?;

        // Which process owns each ledger
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engine_lease (
                symbol TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                heartbeat_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Commands waiting for the owning process
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS control_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                command TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Bot State ====================

    /// Raw snapshot row, for inspection.
    pub async fn get_snapshot(&self, symbol: &str) -> Result<Option<StoredSnapshot>> {
        sqlx::query_as::<_, StoredSnapshot>("SELECT * FROM bot_state WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch bot state")
    }

    /// Symbols with a saved snapshot.
    pub async fn list_symbols(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT symbol FROM bot_state ORDER BY symbol")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    // ==================== Ownership Lease ====================

    /// Take or renew the lease on `symbol`.
    ///
    /// Succeeds when the lease is free, already held by `owner`, or its last
    /// heartbeat is older than `ttl`. Renewing is calling this again.
    pub async fn acquire_lease(&self, symbol: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let stale_before = now_ms - ttl.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO engine_lease (symbol, owner, heartbeat_ms)
            VALUES (?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                owner = excluded.owner,
                heartbeat_ms = excluded.heartbeat_ms
            WHERE engine_lease.owner = excluded.owner
               OR engine_lease.heartbeat_ms < ?
            "#,
        )
        .bind(symbol)
        .bind(owner)
        .bind(now_ms)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .context("Failed to acquire ledger lease")?;

        Ok(result.rows_affected() > 0)
    }

    /// Give the lease back. A lease held by someone else is left alone.
    pub async fn release_lease(&self, symbol: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM engine_lease WHERE symbol = ? AND owner = ?")
            .bind(symbol)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Control Queue ====================

    /// Queue a command for whichever process owns `symbol`.
    pub async fn enqueue_command(&self, symbol: &str, command: ControlCommand) -> Result<()> {
        sqlx::query("INSERT INTO control_queue (symbol, command) VALUES (?, ?)")
            .bind(symbol)
            .bind(command.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to queue control command")?;
        Ok(())
    }

    /// Remove and return queued commands for `symbol`, oldest first.
    pub async fn take_commands(&self, symbol: &str) -> Result<Vec<ControlCommand>> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, command FROM control_queue WHERE symbol = ? ORDER BY id")
                .bind(symbol)
                .fetch_all(&mut *tx)
                .await?;

        if let Some((last_id, _)) = rows.last() {
            sqlx::query("DELETE FROM control_queue WHERE symbol = ? AND id <= ?")
                .bind(symbol)
                .bind(*last_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let mut commands = Vec::with_capacity(rows.len());
        for (id, raw) in rows {
            match raw.parse::<ControlCommand>() {
                Ok(command) => commands.push(command),
                Err(e) => warn!(id, error = %e, "Dropping unreadable control command"),
            }
        }
        Ok(commands)
    }

    // ==================== Equity Curve ====================

    /// Record an equity curve point.
    pub async fn record_equity_point(
        &self,
        symbol: &str,
        equity: Decimal,
        balance: Decimal,
        exposure: Decimal,
        realized_pnl: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO equity_curve (symbol, equity, balance, exposure, realized_pnl)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(equity.to_f64().unwrap_or(0.0))
        .bind(balance.to_f64().unwrap_or(0.0))
        .bind(exposure.to_f64().unwrap_or(0.0))
        .bind(realized_pnl.to_f64().unwrap_or(0.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get recent equity curve points, newest first.
    pub async fn get_equity_curve(&self, symbol: &str, limit: i64) -> Result<Vec<EquityPoint>> {
        sqlx::query_as::<_, EquityPoint>(
            "SELECT * FROM equity_curve WHERE symbol = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch equity curve")
    }

    /// Calculate max drawdown from equity curve.
    pub async fn calculate_max_drawdown(&self, symbol: &str) -> Result<f64> {
        let points = self.get_equity_curve(symbol, 1000).await?;

        if points.is_empty() {
            return Ok(0.0);
        }

        let mut peak = 0.0f64;
        let mut max_dd = 0.0f64;

        // Points are in DESC order, reverse for calculation
        for point in points.into_iter().rev() {
            if point.equity > peak {
                peak = point.equity;
            }
            if peak > 0.0 {
                let dd = (peak - point.equity) / peak;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }

        Ok(max_dd)
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for Database {
    async fn load(&self, symbol: &str) -> Result<Option<BotState>> {
        match self.get_snapshot(symbol).await? {
            Some(row) => {
                let state = serde_json::from_str(&row.snapshot)
                    .with_context(|| format!("Corrupt snapshot for {}", symbol))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, symbol: &str, state: &BotState) -> Result<()> {
        let snapshot = serde_json::to_string(state).context("Failed to serialize bot state")?;

        sqlx::query(
            r#"
            INSERT INTO bot_state (symbol, snapshot, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(symbol) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = datetime('now')
            "#,
        )
        .bind(symbol)
        .bind(snapshot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear(&self, symbol: &str) -> Result<()> {
        // Lease and queue belong to the process, not the ledger
        sqlx::query("DELETE FROM bot_state WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM equity_curve WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditAction, Lot};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    async fn memory_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn sample_state() -> BotState {
        let mut state = BotState::new(dec!(100), 20);
        state
            .open_lot(Lot::open(
                "BTCUSDT",
                "SIM-000001".to_string(),
                Utc::now(),
                dec!(100),
                dec!(0.05),
                dec!(5),
                dec!(2),
                Some(dec!(10)),
            ))
            .unwrap();
        state.current_price = dec!(100);
        state.logs.record(
            Utc::now(),
            "BTCUSDT",
            AuditAction::Buy,
            dec!(100),
            dec!(0.05),
            dec!(5),
            "DCA Buy Executed",
        );
        state
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let db = memory_db().await;
        let state = sample_state();

        assert!(db.load("BTCUSDT").await.unwrap().is_none());
        db.save("BTCUSDT", &state).await.unwrap();

        let loaded = db.load("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(db.list_symbols().await.unwrap(), vec!["BTCUSDT".to_string()]);

        // Saving again overwrites
        let mut updated = state.clone();
        updated.balance = dec!(50);
        db.save("BTCUSDT", &updated).await.unwrap();
        assert_eq!(db.load("BTCUSDT").await.unwrap().unwrap().balance, dec!(50));
    }

    #[tokio::test]
    async fn test_snapshots_keyed_by_symbol() {
        let db = memory_db().await;
        db.save("BTCUSDT", &sample_state()).await.unwrap();
        db.save("ETHUSDT", &BotState::new(dec!(200), 5)).await.unwrap();

        assert_eq!(db.load("ETHUSDT").await.unwrap().unwrap().balance, dec!(200));

        db.clear("BTCUSDT").await.unwrap();
        assert!(db.load("BTCUSDT").await.unwrap().is_none());
        assert!(db.load("ETHUSDT").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_equity_curve_drawdown() {
        let db = memory_db().await;
        for equity in [dec!(100), dec!(120), dec!(90), dec!(110)] {
            db.record_equity_point("BTCUSDT", equity, equity, dec!(0), dec!(0))
                .await
                .unwrap();
        }
        db.record_equity_point("ETHUSDT", dec!(1), dec!(1), dec!(0), dec!(0))
            .await
            .unwrap();

        let curve = db.get_equity_curve("BTCUSDT", 10).await.unwrap();
        assert_eq!(curve.len(), 4);
        assert_eq!(curve[0].equity, 110.0);

        let max_dd = db.calculate_max_drawdown("BTCUSDT").await.unwrap();
        assert!((max_dd - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_on_disk_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("ladder.db").display());

        {
            let db = Database::new(&url).await.unwrap();
            db.save("BTCUSDT", &sample_state()).await.unwrap();
            db.pool().close().await;
        }

        let db = Database::new(&url).await.unwrap();
        let loaded = db.load("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(loaded.positions.len(), 1);
        assert!(db.get_snapshot("BTCUSDT").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lease_has_one_owner() {
        let db = memory_db().await;
        let ttl = Duration::from_secs(30);

        assert!(db.acquire_lease("BTCUSDT", "runner", ttl).await.unwrap());
        assert!(!db.acquire_lease("BTCUSDT", "operator", ttl).await.unwrap());
        // Renewal by the holder
        assert!(db.acquire_lease("BTCUSDT", "runner", ttl).await.unwrap());
        // Other symbols are independent
        assert!(db.acquire_lease("ETHUSDT", "operator", ttl).await.unwrap());

        // Releasing someone else's lease does nothing
        db.release_lease("BTCUSDT", "operator").await.unwrap();
        assert!(!db.acquire_lease("BTCUSDT", "operator", ttl).await.unwrap());

        db.release_lease("BTCUSDT", "runner").await.unwrap();
        assert!(db.acquire_lease("BTCUSDT", "operator", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_lease_can_be_taken_over() {
        let db = memory_db().await;
        assert!(db.acquire_lease("BTCUSDT", "crashed", Duration::from_secs(30)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(db.acquire_lease("BTCUSDT", "runner", Duration::from_millis(5)).await.unwrap());
        assert!(!db.acquire_lease("BTCUSDT", "crashed", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_control_queue_drains_in_order() {
        let db = memory_db().await;
        db.enqueue_command("BTCUSDT", ControlCommand::Pause).await.unwrap();
        db.enqueue_command("ETHUSDT", ControlCommand::Reset).await.unwrap();
        db.enqueue_command("BTCUSDT", ControlCommand::Liquidate).await.unwrap();

        let commands = db.take_commands("BTCUSDT").await.unwrap();
        assert_eq!(commands, vec![ControlCommand::Pause, ControlCommand::Liquidate]);
        assert!(db.take_commands("BTCUSDT").await.unwrap().is_empty());
        assert_eq!(db.take_commands("ETHUSDT").await.unwrap(), vec![ControlCommand::Reset]);
    }
}
