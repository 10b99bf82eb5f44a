//! SQLite persistence for controller state.
//!
//! Persists everything a controller needs to survive a restart:
//! - Strategy config snapshots, versioned by snapshot id
//! - The strategy state row per account
//! - An append-only log of order record changes; the latest row per client
//!   order id is the current record

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::{ConfigSnapshot, StrategyConfig};
use crate::strategy::{OrderRecord, StrategyState, StrategyStatus};

/// SQLite-based persistence manager, shared by every account actor.
pub struct PersistenceManager {
    conn: Mutex<Connection>,
}

impl PersistenceManager {
    /// Create a new persistence manager, initializing the database if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && path != Path::new(":memory:") {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let manager = Self {
            conn: Mutex::new(conn),
        };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", path);
        Ok(manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            -- Config snapshots; the highest snapshot_id is in force
            CREATE TABLE IF NOT EXISTS strategy_configs (
                account_id TEXT NOT NULL,
                snapshot_id INTEGER NOT NULL,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (account_id, snapshot_id)
            );

            -- Strategy state (one row per account)
            CREATE TABLE IF NOT EXISTS strategy_state (
                account_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                cycle_started_at TEXT,
                cycle_trade_count INTEGER NOT NULL,
                cycle_win_count INTEGER NOT NULL,
                cycle_pnl TEXT NOT NULL,
                effective_take_profit_percent TEXT NOT NULL,
                last_transition_at TEXT NOT NULL,
                config_snapshot_id INTEGER NOT NULL
            );

            -- Order record changes, append-only
            CREATE TABLE IF NOT EXISTS order_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                level_index INTEGER NOT NULL,
                config_snapshot_id INTEGER NOT NULL,
                client_order_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_key
                ON order_records(account_id, level_index, config_snapshot_id);
            CREATE INDEX IF NOT EXISTS idx_orders_client
                ON order_records(account_id, client_order_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Store a config snapshot.
    pub fn save_config_snapshot(&self, account_id: &str, snapshot: &ConfigSnapshot) -> Result<()> {
        let config =
            serde_json::to_string(&snapshot.config).context("Failed to serialize config")?;

        self.conn()?.execute(
            r#"
            INSERT INTO strategy_configs (account_id, snapshot_id, config, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(account_id, snapshot_id) DO UPDATE SET config = ?3
            "#,
            params![
                account_id,
                snapshot.id as i64,
                config,
                snapshot.created_at.to_rfc3339(),
            ],
        )?;

        debug!(%account_id, snapshot_id = snapshot.id, "Config snapshot saved");
        Ok(())
    }

    /// Load the config snapshot currently in force.
    pub fn load_latest_config(&self, account_id: &str) -> Result<Option<ConfigSnapshot>> {
        let row: Option<(i64, String, String)> = self
            .conn()?
            .query_row(
                r#"
                SELECT snapshot_id, config, created_at FROM strategy_configs
                WHERE account_id = ?1 ORDER BY snapshot_id DESC LIMIT 1
                "#,
                params![account_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((snapshot_id, config, created_at)) = row else {
            return Ok(None);
        };

        let config: StrategyConfig = serde_json::from_str(&config)
            .with_context(|| format!("Corrupt config snapshot {} for {}", snapshot_id, account_id))?;

        Ok(Some(ConfigSnapshot {
            id: snapshot_id as u64,
            config,
            created_at: parse_time(&created_at),
        }))
    }

    /// Upsert the strategy state row.
    pub fn save_strategy_state(&self, account_id: &str, state: &StrategyState) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO strategy_state (account_id, status, cycle_started_at, cycle_trade_count,
                                        cycle_win_count, cycle_pnl, effective_take_profit_percent,
                                        last_transition_at, config_snapshot_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(account_id) DO UPDATE SET
                status = ?2,
                cycle_started_at = ?3,
                cycle_trade_count = ?4,
                cycle_win_count = ?5,
                cycle_pnl = ?6,
                effective_take_profit_percent = ?7,
                last_transition_at = ?8,
                config_snapshot_id = ?9
            "#,
            params![
                account_id,
                state.status.as_str(),
                state.cycle_started_at.map(|t| t.to_rfc3339()),
                state.cycle_trade_count,
                state.cycle_win_count,
                state.cycle_pnl.to_string(),
                state.effective_take_profit_percent.to_string(),
                state.last_transition_at.to_rfc3339(),
                state.config_snapshot_id as i64,
            ],
        )?;
        Ok(())
    }

    /// Load the strategy state row for an account.
    pub fn load_strategy_state(&self, account_id: &str) -> Result<Option<StrategyState>> {
        type Row = (String, Option<String>, u32, u32, String, String, String, i64);

        let row: Option<Row> = self
            .conn()?
            .query_row(
                r#"
                SELECT status, cycle_started_at, cycle_trade_count, cycle_win_count, cycle_pnl,
                       effective_take_profit_percent, last_transition_at, config_snapshot_id
                FROM strategy_state WHERE account_id = ?1
                "#,
                params![account_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, started, trades, wins, pnl, tp, transition, snapshot_id)) = row else {
            return Ok(None);
        };

        let state = StrategyState {
            status: StrategyStatus::from_str(&status).map_err(|e| anyhow!(e))?,
            cycle_started_at: started.as_deref().map(parse_time),
            cycle_trade_count: trades,
            cycle_win_count: wins,
            cycle_pnl: Decimal::from_str(&pnl).unwrap_or_default(),
            effective_take_profit_percent: Decimal::from_str(&tp).unwrap_or_default(),
            last_transition_at: parse_time(&transition),
            config_snapshot_id: snapshot_id as u64,
        };

        info!(
            %account_id,
            status = %state.status,
            cycle_trades = state.cycle_trade_count,
            "Loaded strategy state from database"
        );
        Ok(Some(state))
    }

    /// Append the current version of each record.
    pub fn append_order_records(&self, account_id: &str, records: &[OrderRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();

        for record in records {
            let body = serde_json::to_string(record).context("Failed to serialize order record")?;
            tx.execute(
                r#"
                INSERT INTO order_records (account_id, level_index, config_snapshot_id,
                                           client_order_id, seq, status, record, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    account_id,
                    record.level_index,
                    record.config_snapshot_id as i64,
                    record.client_order_id,
                    record.seq as i64,
                    record.status.as_str(),
                    body,
                    now,
                ],
            )?;
        }

        tx.commit()?;
        debug!(%account_id, count = records.len(), "Order records appended");
        Ok(())
    }

    /// Latest version of every record that is still pending or filled.
    pub fn load_open_orders(&self, account_id: &str) -> Result<Vec<OrderRecord>> {
        self.load_latest_records(
            account_id,
            "AND r.status IN ('PENDING', 'FILLED') ORDER BY r.id",
            None,
        )
    }

    /// Most recent records regardless of status, newest first.
    pub fn recent_orders(&self, account_id: &str, limit: usize) -> Result<Vec<OrderRecord>> {
        self.load_latest_records(account_id, "ORDER BY r.id DESC LIMIT ?2", Some(limit as i64))
    }

    fn load_latest_records(
        &self,
        account_id: &str,
        tail: &str,
        limit: Option<i64>,
    ) -> Result<Vec<OrderRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            r#"
            SELECT r.record FROM order_records r
            WHERE r.account_id = ?1
              AND r.id = (SELECT MAX(id) FROM order_records
                          WHERE account_id = r.account_id
                            AND client_order_id = r.client_order_id)
            {}
            "#,
            tail
        );
        let mut stmt = conn.prepare(&sql)?;

        let bodies: Vec<String> = match limit {
            Some(limit) => stmt
                .query_map(params![account_id, limit], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map(params![account_id], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?,
        };

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).context("Corrupt order record"))
            .collect()
    }

    /// Make every order record insert fail until unblocked.
    #[cfg(test)]
    pub(crate) fn set_order_writes_blocked(&self, blocked: bool) -> Result<()> {
        let sql = if blocked {
            "CREATE TRIGGER IF NOT EXISTS block_order_writes BEFORE INSERT ON order_records
             BEGIN SELECT RAISE(ABORT, 'order writes blocked'); END;"
        } else {
            "DROP TRIGGER IF EXISTS block_order_writes;"
        };
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    /// Highest client order sequence number used by an account.
    pub fn max_order_seq(&self, account_id: &str) -> Result<u64> {
        let max: Option<i64> = self.conn()?.query_row(
            "SELECT MAX(seq) FROM order_records WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// Accounts with a persisted strategy state.
    pub fn list_accounts(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT account_id FROM strategy_state ORDER BY account_id")?;
        let accounts = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(accounts)
    }
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
