//! SQLite state store for the execution engine.
//!
//! One table per entity, plus append-only sub-tables for `state_transitions`
//! and `session_usage` (array-append semantics stay well-defined under
//! concurrent writers). All timestamps are bound from Rust so every column
//! carries one consistent format and range scans compare correctly.

mod copy;
mod dca;
mod executions;
mod sessions;

pub use executions::TransitionWrite;

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

/// Database connection pool with the full engine schema.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// In-memory database for tests. A single connection, because every
    /// pooled connection to `sqlite::memory:` would otherwise get its own
    /// private database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Execution records: one row per automated action attempt.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_records (
                id TEXT PRIMARY KEY,
                owner_kind TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                wallet_address TEXT NOT NULL,
                current_state TEXT NOT NULL,
                state_entered_at TEXT NOT NULL,
                current_step_index INTEGER NOT NULL DEFAULT 0,
                requires_approval INTEGER NOT NULL DEFAULT 0,
                approval_reason TEXT,
                approved_by TEXT,
                approved_at TEXT,
                recoverable INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // State transitions: append-only, never rewritten.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                "trigger" TEXT NOT NULL,
                reason TEXT,
                context TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (execution_id) REFERENCES execution_records(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Execution steps: replaced as a unit per record.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                description TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                tx_hash TEXT,
                chain_id INTEGER,
                gas_used_usd REAL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                payload TEXT,
                started_at TEXT,
                completed_at TEXT,
                UNIQUE(execution_id, ordinal),
                FOREIGN KEY (execution_id) REFERENCES execution_records(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Decision log: append-only explainability records.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                decision TEXT NOT NULL,
                reasoning TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (execution_id) REFERENCES execution_records(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Session keys: scoped spending grants.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_keys (
                id TEXT PRIMARY KEY,
                wallet_address TEXT NOT NULL,
                label TEXT,
                max_value_per_tx_usd REAL NOT NULL,
                max_total_value_usd REAL NOT NULL,
                max_transactions INTEGER,
                total_value_used_usd REAL NOT NULL DEFAULT 0,
                transaction_count INTEGER NOT NULL DEFAULT 0,
                allowed_chains TEXT NOT NULL DEFAULT '[]',
                allowed_contracts TEXT NOT NULL DEFAULT '[]',
                allowed_tokens TEXT NOT NULL DEFAULT '[]',
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                revoked_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Usage log: append-only, pruned to the last 100 rows per session.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                value_usd REAL NOT NULL,
                action TEXT NOT NULL,
                chain_id INTEGER,
                tx_hash TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES session_keys(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Smart sessions: flattened on-chain-mirrored grants.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS smart_sessions (
                id TEXT PRIMARY KEY,
                wallet_address TEXT NOT NULL,
                spending_limit_usd REAL NOT NULL,
                spent_usd REAL NOT NULL DEFAULT 0,
                transaction_count INTEGER NOT NULL DEFAULT 0,
                allowed_actions TEXT NOT NULL DEFAULT '[]',
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // DCA strategies.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dca_strategies (
                id TEXT PRIMARY KEY,
                owner_wallet TEXT NOT NULL,
                session_id TEXT,
                chain_id INTEGER NOT NULL,
                token_in TEXT NOT NULL,
                token_out TEXT NOT NULL,
                amount_per_execution_usd REAL NOT NULL,
                frequency TEXT NOT NULL,
                next_execution_at TEXT,
                max_slippage_bps INTEGER NOT NULL,
                max_gas_usd REAL,
                skip_if_gas_above_usd REAL,
                pause_if_price_above_usd REAL,
                pause_if_price_below_usd REAL,
                max_total_spend_usd REAL,
                max_executions INTEGER,
                end_date TEXT,
                total_executions INTEGER NOT NULL DEFAULT 0,
                successful_executions INTEGER NOT NULL DEFAULT 0,
                failed_executions INTEGER NOT NULL DEFAULT 0,
                skipped_executions INTEGER NOT NULL DEFAULT 0,
                total_amount_spent_usd REAL NOT NULL DEFAULT 0,
                total_tokens_acquired REAL NOT NULL DEFAULT 0,
                average_price_usd REAL,
                status TEXT NOT NULL DEFAULT 'draft',
                last_executed_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // DCA executions: one row per tick.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dca_executions (
                id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL,
                execution_number INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                skip_reason TEXT,
                token_price_usd REAL,
                gas_price_usd REAL,
                quoted_amount_out REAL,
                spent_usd REAL,
                tokens_acquired REAL,
                actual_price_usd REAL,
                tx_hash TEXT,
                error TEXT,
                execution_record_id TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                UNIQUE(strategy_id, execution_number),
                FOREIGN KEY (strategy_id) REFERENCES dca_strategies(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Copy relationships.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copy_relationships (
                id TEXT PRIMARY KEY,
                follower_wallet TEXT NOT NULL,
                leader_address TEXT NOT NULL,
                session_id TEXT,
                sizing_mode TEXT NOT NULL,
                size_value REAL NOT NULL,
                min_trade_usd REAL NOT NULL,
                max_trade_usd REAL NOT NULL,
                allowed_tokens TEXT NOT NULL DEFAULT '[]',
                blocked_tokens TEXT NOT NULL DEFAULT '[]',
                allowed_actions TEXT NOT NULL DEFAULT '[]',
                delay_seconds INTEGER NOT NULL DEFAULT 0,
                max_delay_seconds INTEGER NOT NULL DEFAULT 300,
                max_slippage_bps INTEGER NOT NULL,
                max_daily_trades INTEGER,
                max_daily_volume_usd REAL,
                daily_trade_count INTEGER NOT NULL DEFAULT 0,
                daily_volume_usd REAL NOT NULL DEFAULT 0,
                daily_reset_at TEXT NOT NULL,
                total_trades INTEGER NOT NULL DEFAULT 0,
                successful_trades INTEGER NOT NULL DEFAULT 0,
                failed_trades INTEGER NOT NULL DEFAULT 0,
                skipped_trades INTEGER NOT NULL DEFAULT 0,
                total_volume_usd REAL NOT NULL DEFAULT 0,
                requires_approval INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_paused INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(follower_wallet, leader_address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Copy executions: one row per replication attempt.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copy_executions (
                id TEXT PRIMARY KEY,
                relationship_id TEXT NOT NULL,
                leader_address TEXT NOT NULL,
                leader_tx_hash TEXT NOT NULL,
                chain_id INTEGER NOT NULL DEFAULT 0,
                action TEXT NOT NULL,
                token_in TEXT NOT NULL,
                token_out TEXT NOT NULL,
                leader_value_usd REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                skip_reason TEXT,
                calculated_size_usd REAL,
                actual_size_usd REAL,
                actual_price_usd REAL,
                gas_used_usd REAL,
                slippage_bps INTEGER,
                execute_after TEXT,
                execution_record_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                FOREIGN KEY (relationship_id) REFERENCES copy_relationships(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes for the scans the engines run every tick.
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transitions_execution ON state_transitions(execution_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_state ON execution_records(current_state, state_entered_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_owner ON execution_records(owner_kind, owner_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_usage_session ON session_usage(session_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_status ON session_keys(status, expires_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dca_due ON dca_strategies(status, next_execution_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dca_exec_strategy ON dca_executions(strategy_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_copy_rel_leader ON copy_relationships(leader_address, is_active)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_copy_exec_due ON copy_executions(status, execute_after)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_copy_exec_leader_tx ON copy_executions(relationship_id, leader_tx_hash)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ==================== Conversion helpers ====================

pub(crate) fn usd(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

pub(crate) fn usd_opt(value: Option<Decimal>) -> Option<f64> {
    value.map(usd)
}

pub(crate) fn decimal(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

pub(crate) fn decimal_opt(value: Option<f64>) -> Option<Decimal> {
    value.map(decimal)
}

pub(crate) fn json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize json column")
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).context("Failed to parse json column")
}
