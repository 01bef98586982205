//! Persistence for DCA strategies and their executions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::models::{
    DcaExecution, DcaExecutionStatus, DcaFrequency, DcaGuards, DcaSkipReason, DcaStats,
    DcaStatus, DcaStopConditions, DcaStrategy,
};

use super::{decimal, decimal_opt, usd, usd_opt, Database};

#[derive(Debug, Clone, sqlx::FromRow)]
struct DcaStrategyRow {
    id: String,
    owner_wallet: String,
    session_id: Option<String>,
    chain_id: i64,
    token_in: String,
    token_out: String,
    amount_per_execution_usd: f64,
    frequency: String,
    next_execution_at: Option<DateTime<Utc>>,
    max_slippage_bps: i64,
    max_gas_usd: Option<f64>,
    skip_if_gas_above_usd: Option<f64>,
    pause_if_price_above_usd: Option<f64>,
    pause_if_price_below_usd: Option<f64>,
    max_total_spend_usd: Option<f64>,
    max_executions: Option<i64>,
    end_date: Option<DateTime<Utc>>,
    total_executions: i64,
    successful_executions: i64,
    failed_executions: i64,
    skipped_executions: i64,
    total_amount_spent_usd: f64,
    total_tokens_acquired: f64,
    average_price_usd: Option<f64>,
    status: String,
    last_executed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DcaStrategyRow {
    fn into_model(self) -> Result<DcaStrategy> {
        Ok(DcaStrategy {
            status: DcaStatus::parse(&self.status)
                .with_context(|| format!("unknown dca status: {}", self.status))?,
            frequency: DcaFrequency::parse(&self.frequency)
                .with_context(|| format!("unknown dca frequency: {}", self.frequency))?,
            guards: DcaGuards {
                max_slippage_bps: self.max_slippage_bps,
                max_gas_usd: decimal_opt(self.max_gas_usd),
                skip_if_gas_above_usd: decimal_opt(self.skip_if_gas_above_usd),
                pause_if_price_above_usd: decimal_opt(self.pause_if_price_above_usd),
                pause_if_price_below_usd: decimal_opt(self.pause_if_price_below_usd),
            },
            stop_conditions: DcaStopConditions {
                max_total_spend_usd: decimal_opt(self.max_total_spend_usd),
                max_executions: self.max_executions,
                end_date: self.end_date,
            },
            stats: DcaStats {
                total_executions: self.total_executions,
                successful_executions: self.successful_executions,
                failed_executions: self.failed_executions,
                skipped_executions: self.skipped_executions,
                total_amount_spent_usd: decimal(self.total_amount_spent_usd),
                total_tokens_acquired: decimal(self.total_tokens_acquired),
                average_price_usd: decimal_opt(self.average_price_usd),
            },
            id: self.id,
            owner_wallet: self.owner_wallet,
            session_id: self.session_id,
            chain_id: self.chain_id,
            token_in: self.token_in,
            token_out: self.token_out,
            amount_per_execution_usd: decimal(self.amount_per_execution_usd),
            next_execution_at: self.next_execution_at,
            last_executed_at: self.last_executed_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct DcaExecutionRow {
    id: String,
    strategy_id: String,
    execution_number: i64,
    status: String,
    skip_reason: Option<String>,
    token_price_usd: Option<f64>,
    gas_price_usd: Option<f64>,
    quoted_amount_out: Option<f64>,
    spent_usd: Option<f64>,
    tokens_acquired: Option<f64>,
    actual_price_usd: Option<f64>,
    tx_hash: Option<String>,
    error: Option<String>,
    execution_record_id: Option<String>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl DcaExecutionRow {
    fn into_model(self) -> Result<DcaExecution> {
        Ok(DcaExecution {
            status: DcaExecutionStatus::parse(&self.status)
                .with_context(|| format!("unknown dca execution status: {}", self.status))?,
            skip_reason: match self.skip_reason.as_deref() {
                Some(raw) => Some(
                    DcaSkipReason::parse(raw)
                        .with_context(|| format!("unknown dca skip reason: {raw}"))?,
                ),
                None => None,
            },
            id: self.id,
            strategy_id: self.strategy_id,
            execution_number: self.execution_number,
            token_price_usd: decimal_opt(self.token_price_usd),
            gas_price_usd: decimal_opt(self.gas_price_usd),
            quoted_amount_out: decimal_opt(self.quoted_amount_out),
            spent_usd: decimal_opt(self.spent_usd),
            tokens_acquired: decimal_opt(self.tokens_acquired),
            actual_price_usd: decimal_opt(self.actual_price_usd),
            tx_hash: self.tx_hash,
            error: self.error,
            execution_record_id: self.execution_record_id,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

impl Database {
    // ==================== DCA strategies ====================

    pub async fn insert_dca_strategy(&self, strategy: &DcaStrategy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dca_strategies (
                id, owner_wallet, session_id, chain_id, token_in, token_out,
                amount_per_execution_usd, frequency, next_execution_at,
                max_slippage_bps, max_gas_usd, skip_if_gas_above_usd,
                pause_if_price_above_usd, pause_if_price_below_usd,
                max_total_spend_usd, max_executions, end_date,
                total_executions, successful_executions, failed_executions,
                skipped_executions, total_amount_spent_usd, total_tokens_acquired,
                average_price_usd, status, last_executed_at, last_error,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&strategy.id)
        .bind(&strategy.owner_wallet)
        .bind(strategy.session_id.as_deref())
        .bind(strategy.chain_id)
        .bind(&strategy.token_in)
        .bind(&strategy.token_out)
        .bind(usd(strategy.amount_per_execution_usd))
        .bind(strategy.frequency.as_str())
        .bind(strategy.next_execution_at)
        .bind(strategy.guards.max_slippage_bps)
        .bind(usd_opt(strategy.guards.max_gas_usd))
        .bind(usd_opt(strategy.guards.skip_if_gas_above_usd))
        .bind(usd_opt(strategy.guards.pause_if_price_above_usd))
        .bind(usd_opt(strategy.guards.pause_if_price_below_usd))
        .bind(usd_opt(strategy.stop_conditions.max_total_spend_usd))
        .bind(strategy.stop_conditions.max_executions)
        .bind(strategy.stop_conditions.end_date)
        .bind(strategy.stats.total_executions)
        .bind(strategy.stats.successful_executions)
        .bind(strategy.stats.failed_executions)
        .bind(strategy.stats.skipped_executions)
        .bind(usd(strategy.stats.total_amount_spent_usd))
        .bind(usd(strategy.stats.total_tokens_acquired))
        .bind(usd_opt(strategy.stats.average_price_usd))
        .bind(strategy.status.as_str())
        .bind(strategy.last_executed_at)
        .bind(strategy.last_error.as_deref())
        .bind(strategy.created_at)
        .bind(strategy.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write back every mutable field. The scheduler is the single writer
    /// for a strategy (per-strategy single-flight), so a full-row update is
    /// race-free here.
    pub async fn update_dca_strategy(&self, strategy: &DcaStrategy) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dca_strategies SET
                session_id = ?,
                amount_per_execution_usd = ?,
                frequency = ?,
                next_execution_at = ?,
                max_slippage_bps = ?,
                max_gas_usd = ?,
                skip_if_gas_above_usd = ?,
                pause_if_price_above_usd = ?,
                pause_if_price_below_usd = ?,
                max_total_spend_usd = ?,
                max_executions = ?,
                end_date = ?,
                total_executions = ?,
                successful_executions = ?,
                failed_executions = ?,
                skipped_executions = ?,
                total_amount_spent_usd = ?,
                total_tokens_acquired = ?,
                average_price_usd = ?,
                status = ?,
                last_executed_at = ?,
                last_error = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(strategy.session_id.as_deref())
        .bind(usd(strategy.amount_per_execution_usd))
        .bind(strategy.frequency.as_str())
        .bind(strategy.next_execution_at)
        .bind(strategy.guards.max_slippage_bps)
        .bind(usd_opt(strategy.guards.max_gas_usd))
        .bind(usd_opt(strategy.guards.skip_if_gas_above_usd))
        .bind(usd_opt(strategy.guards.pause_if_price_above_usd))
        .bind(usd_opt(strategy.guards.pause_if_price_below_usd))
        .bind(usd_opt(strategy.stop_conditions.max_total_spend_usd))
        .bind(strategy.stop_conditions.max_executions)
        .bind(strategy.stop_conditions.end_date)
        .bind(strategy.stats.total_executions)
        .bind(strategy.stats.successful_executions)
        .bind(strategy.stats.failed_executions)
        .bind(strategy.stats.skipped_executions)
        .bind(usd(strategy.stats.total_amount_spent_usd))
        .bind(usd(strategy.stats.total_tokens_acquired))
        .bind(usd_opt(strategy.stats.average_price_usd))
        .bind(strategy.status.as_str())
        .bind(strategy.last_executed_at)
        .bind(strategy.last_error.as_deref())
        .bind(strategy.updated_at)
        .bind(&strategy.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_dca_strategy(&self, id: &str) -> Result<DcaStrategy> {
        sqlx::query_as::<_, DcaStrategyRow>("SELECT * FROM dca_strategies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("dca strategy {id} not found"))?
            .into_model()
    }

    pub async fn list_dca_strategies(&self, status: Option<DcaStatus>) -> Result<Vec<DcaStrategy>> {
        let rows = match status {
            Some(s) => {
                sqlx::query_as::<_, DcaStrategyRow>(
                    "SELECT * FROM dca_strategies WHERE status = ? ORDER BY created_at DESC",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DcaStrategyRow>(
                    "SELECT * FROM dca_strategies ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(DcaStrategyRow::into_model).collect()
    }

    /// Active strategies due at `now`, excluding any with an unresolved
    /// execution (per-strategy single-flight). Bounded batch.
    pub async fn due_dca_strategies(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DcaStrategy>> {
        let rows = sqlx::query_as::<_, DcaStrategyRow>(
            r#"
            SELECT * FROM dca_strategies s
            WHERE s.status = 'active'
              AND s.next_execution_at IS NOT NULL
              AND s.next_execution_at <= ?
              AND NOT EXISTS (
                  SELECT 1 FROM dca_executions e
                  WHERE e.strategy_id = s.id AND e.status IN ('pending', 'running')
              )
            ORDER BY s.next_execution_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DcaStrategyRow::into_model).collect()
    }

    pub async fn touch_strategy_last_executed(
        &self,
        id: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE dca_strategies SET last_executed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(executed_at)
        .bind(executed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_dca_strategies_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM dca_strategies GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows)
    }

    // ==================== DCA executions ====================

    /// Next monotonic execution number for a strategy, skipped ticks
    /// included.
    pub async fn next_dca_execution_number(&self, strategy_id: &str) -> Result<i64> {
        let (max,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(execution_number), 0) FROM dca_executions WHERE strategy_id = ?",
        )
        .bind(strategy_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(max + 1)
    }

    pub async fn insert_dca_execution(&self, execution: &DcaExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dca_executions (
                id, strategy_id, execution_number, status, skip_reason,
                token_price_usd, gas_price_usd, quoted_amount_out, spent_usd,
                tokens_acquired, actual_price_usd, tx_hash, error,
                execution_record_id, created_at, resolved_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.strategy_id)
        .bind(execution.execution_number)
        .bind(execution.status.as_str())
        .bind(execution.skip_reason.map(|r| r.as_str()))
        .bind(usd_opt(execution.token_price_usd))
        .bind(usd_opt(execution.gas_price_usd))
        .bind(usd_opt(execution.quoted_amount_out))
        .bind(usd_opt(execution.spent_usd))
        .bind(usd_opt(execution.tokens_acquired))
        .bind(usd_opt(execution.actual_price_usd))
        .bind(execution.tx_hash.as_deref())
        .bind(execution.error.as_deref())
        .bind(execution.execution_record_id.as_deref())
        .bind(execution.created_at)
        .bind(execution.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_dca_execution(&self, execution: &DcaExecution) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dca_executions SET
                status = ?,
                skip_reason = ?,
                token_price_usd = ?,
                gas_price_usd = ?,
                quoted_amount_out = ?,
                spent_usd = ?,
                tokens_acquired = ?,
                actual_price_usd = ?,
                tx_hash = ?,
                error = ?,
                execution_record_id = ?,
                resolved_at = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.skip_reason.map(|r| r.as_str()))
        .bind(usd_opt(execution.token_price_usd))
        .bind(usd_opt(execution.gas_price_usd))
        .bind(usd_opt(execution.quoted_amount_out))
        .bind(usd_opt(execution.spent_usd))
        .bind(usd_opt(execution.tokens_acquired))
        .bind(usd_opt(execution.actual_price_usd))
        .bind(execution.tx_hash.as_deref())
        .bind(execution.error.as_deref())
        .bind(execution.execution_record_id.as_deref())
        .bind(execution.resolved_at)
        .bind(&execution.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_dca_execution(&self, id: &str) -> Result<DcaExecution> {
        sqlx::query_as::<_, DcaExecutionRow>("SELECT * FROM dca_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("dca execution {id} not found"))?
            .into_model()
    }

    pub async fn list_dca_executions(
        &self,
        strategy_id: &str,
        limit: i64,
    ) -> Result<Vec<DcaExecution>> {
        let rows = sqlx::query_as::<_, DcaExecutionRow>(
            "SELECT * FROM dca_executions WHERE strategy_id = ? ORDER BY execution_number DESC LIMIT ?",
        )
        .bind(strategy_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DcaExecutionRow::into_model).collect()
    }
}
