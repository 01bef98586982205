//! Persistence for copy relationships and replicated executions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::models::{
    ActionClass, CopyExecution, CopyExecutionStatus, CopyRelationship, CopySkipReason,
    SizingMode,
};

use super::{decimal, decimal_opt, from_json, json, usd, usd_opt, Database};

#[derive(Debug, Clone, sqlx::FromRow)]
struct CopyRelationshipRow {
    id: String,
    follower_wallet: String,
    leader_address: String,
    session_id: Option<String>,
    sizing_mode: String,
    size_value: f64,
    min_trade_usd: f64,
    max_trade_usd: f64,
    allowed_tokens: String,
    blocked_tokens: String,
    allowed_actions: String,
    delay_seconds: i64,
    max_delay_seconds: i64,
    max_slippage_bps: i64,
    max_daily_trades: Option<i64>,
    max_daily_volume_usd: Option<f64>,
    daily_trade_count: i64,
    daily_volume_usd: f64,
    daily_reset_at: DateTime<Utc>,
    total_trades: i64,
    successful_trades: i64,
    failed_trades: i64,
    skipped_trades: i64,
    total_volume_usd: f64,
    requires_approval: bool,
    is_active: bool,
    is_paused: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CopyRelationshipRow {
    fn into_model(self) -> Result<CopyRelationship> {
        Ok(CopyRelationship {
            sizing_mode: SizingMode::parse(&self.sizing_mode)
                .with_context(|| format!("unknown sizing mode: {}", self.sizing_mode))?,
            allowed_tokens: from_json(&self.allowed_tokens)?,
            blocked_tokens: from_json(&self.blocked_tokens)?,
            allowed_actions: from_json(&self.allowed_actions)?,
            id: self.id,
            follower_wallet: self.follower_wallet,
            leader_address: self.leader_address,
            session_id: self.session_id,
            size_value: decimal(self.size_value),
            min_trade_usd: decimal(self.min_trade_usd),
            max_trade_usd: decimal(self.max_trade_usd),
            delay_seconds: self.delay_seconds,
            max_delay_seconds: self.max_delay_seconds,
            max_slippage_bps: self.max_slippage_bps,
            max_daily_trades: self.max_daily_trades,
            max_daily_volume_usd: decimal_opt(self.max_daily_volume_usd),
            daily_trade_count: self.daily_trade_count,
            daily_volume_usd: decimal(self.daily_volume_usd),
            daily_reset_at: self.daily_reset_at,
            total_trades: self.total_trades,
            successful_trades: self.successful_trades,
            failed_trades: self.failed_trades,
            skipped_trades: self.skipped_trades,
            total_volume_usd: decimal(self.total_volume_usd),
            requires_approval: self.requires_approval,
            is_active: self.is_active,
            is_paused: self.is_paused,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CopyExecutionRow {
    id: String,
    relationship_id: String,
    leader_address: String,
    leader_tx_hash: String,
    chain_id: i64,
    action: String,
    token_in: String,
    token_out: String,
    leader_value_usd: f64,
    status: String,
    skip_reason: Option<String>,
    calculated_size_usd: Option<f64>,
    actual_size_usd: Option<f64>,
    actual_price_usd: Option<f64>,
    gas_used_usd: Option<f64>,
    slippage_bps: Option<i64>,
    execute_after: Option<DateTime<Utc>>,
    execution_record_id: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl CopyExecutionRow {
    fn into_model(self) -> Result<CopyExecution> {
        Ok(CopyExecution {
            action: ActionClass::parse(&self.action)
                .with_context(|| format!("unknown action class: {}", self.action))?,
            status: CopyExecutionStatus::parse(&self.status)
                .with_context(|| format!("unknown copy execution status: {}", self.status))?,
            skip_reason: match self.skip_reason.as_deref() {
                Some(raw) => Some(
                    CopySkipReason::parse(raw)
                        .with_context(|| format!("unknown copy skip reason: {raw}"))?,
                ),
                None => None,
            },
            id: self.id,
            relationship_id: self.relationship_id,
            leader_address: self.leader_address,
            leader_tx_hash: self.leader_tx_hash,
            chain_id: self.chain_id,
            token_in: self.token_in,
            token_out: self.token_out,
            leader_value_usd: decimal(self.leader_value_usd),
            calculated_size_usd: decimal_opt(self.calculated_size_usd),
            actual_size_usd: decimal_opt(self.actual_size_usd),
            actual_price_usd: decimal_opt(self.actual_price_usd),
            gas_used_usd: decimal_opt(self.gas_used_usd),
            slippage_bps: self.slippage_bps,
            execute_after: self.execute_after,
            execution_record_id: self.execution_record_id,
            error: self.error,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

impl Database {
    // ==================== Copy relationships ====================

    /// Insert or re-follow: a second follow of the same leader updates the
    /// config and reactivates the relationship, keeping its id, counters,
    /// and daily window.
    pub async fn upsert_copy_relationship(&self, rel: &CopyRelationship) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO copy_relationships (
                id, follower_wallet, leader_address, session_id, sizing_mode,
                size_value, min_trade_usd, max_trade_usd, allowed_tokens,
                blocked_tokens, allowed_actions, delay_seconds, max_delay_seconds,
                max_slippage_bps, max_daily_trades, max_daily_volume_usd,
                daily_trade_count, daily_volume_usd, daily_reset_at,
                total_trades, successful_trades, failed_trades, skipped_trades,
                total_volume_usd, requires_approval, is_active, is_paused,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(follower_wallet, leader_address) DO UPDATE SET
                session_id = excluded.session_id,
                sizing_mode = excluded.sizing_mode,
                size_value = excluded.size_value,
                min_trade_usd = excluded.min_trade_usd,
                max_trade_usd = excluded.max_trade_usd,
                allowed_tokens = excluded.allowed_tokens,
                blocked_tokens = excluded.blocked_tokens,
                allowed_actions = excluded.allowed_actions,
                delay_seconds = excluded.delay_seconds,
                max_delay_seconds = excluded.max_delay_seconds,
                max_slippage_bps = excluded.max_slippage_bps,
                max_daily_trades = excluded.max_daily_trades,
                max_daily_volume_usd = excluded.max_daily_volume_usd,
                requires_approval = excluded.requires_approval,
                is_active = 1,
                is_paused = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rel.id)
        .bind(&rel.follower_wallet)
        .bind(&rel.leader_address)
        .bind(rel.session_id.as_deref())
        .bind(rel.sizing_mode.as_str())
        .bind(usd(rel.size_value))
        .bind(usd(rel.min_trade_usd))
        .bind(usd(rel.max_trade_usd))
        .bind(json(&rel.allowed_tokens)?)
        .bind(json(&rel.blocked_tokens)?)
        .bind(json(&rel.allowed_actions)?)
        .bind(rel.delay_seconds)
        .bind(rel.max_delay_seconds)
        .bind(rel.max_slippage_bps)
        .bind(rel.max_daily_trades)
        .bind(usd_opt(rel.max_daily_volume_usd))
        .bind(rel.daily_trade_count)
        .bind(usd(rel.daily_volume_usd))
        .bind(rel.daily_reset_at)
        .bind(rel.total_trades)
        .bind(rel.successful_trades)
        .bind(rel.failed_trades)
        .bind(rel.skipped_trades)
        .bind(usd(rel.total_volume_usd))
        .bind(rel.requires_approval)
        .bind(rel.is_active)
        .bind(rel.is_paused)
        .bind(rel.created_at)
        .bind(rel.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_copy_relationship(&self, rel: &CopyRelationship) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE copy_relationships SET
                session_id = ?,
                sizing_mode = ?,
                size_value = ?,
                min_trade_usd = ?,
                max_trade_usd = ?,
                allowed_tokens = ?,
                blocked_tokens = ?,
                allowed_actions = ?,
                delay_seconds = ?,
                max_delay_seconds = ?,
                max_slippage_bps = ?,
                max_daily_trades = ?,
                max_daily_volume_usd = ?,
                daily_trade_count = ?,
                daily_volume_usd = ?,
                daily_reset_at = ?,
                total_trades = ?,
                successful_trades = ?,
                failed_trades = ?,
                skipped_trades = ?,
                total_volume_usd = ?,
                requires_approval = ?,
                is_active = ?,
                is_paused = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(rel.session_id.as_deref())
        .bind(rel.sizing_mode.as_str())
        .bind(usd(rel.size_value))
        .bind(usd(rel.min_trade_usd))
        .bind(usd(rel.max_trade_usd))
        .bind(json(&rel.allowed_tokens)?)
        .bind(json(&rel.blocked_tokens)?)
        .bind(json(&rel.allowed_actions)?)
        .bind(rel.delay_seconds)
        .bind(rel.max_delay_seconds)
        .bind(rel.max_slippage_bps)
        .bind(rel.max_daily_trades)
        .bind(usd_opt(rel.max_daily_volume_usd))
        .bind(rel.daily_trade_count)
        .bind(usd(rel.daily_volume_usd))
        .bind(rel.daily_reset_at)
        .bind(rel.total_trades)
        .bind(rel.successful_trades)
        .bind(rel.failed_trades)
        .bind(rel.skipped_trades)
        .bind(usd(rel.total_volume_usd))
        .bind(rel.requires_approval)
        .bind(rel.is_active)
        .bind(rel.is_paused)
        .bind(rel.updated_at)
        .bind(&rel.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_copy_relationship_by_pair(
        &self,
        follower_wallet: &str,
        leader_address: &str,
    ) -> Result<CopyRelationship> {
        sqlx::query_as::<_, CopyRelationshipRow>(
            "SELECT * FROM copy_relationships WHERE follower_wallet = ? AND leader_address = ?",
        )
        .bind(follower_wallet)
        .bind(leader_address)
        .fetch_optional(&self.pool)
        .await?
        .with_context(|| format!("no relationship {follower_wallet} -> {leader_address}"))?
        .into_model()
    }

    pub async fn get_copy_relationship(&self, id: &str) -> Result<CopyRelationship> {
        sqlx::query_as::<_, CopyRelationshipRow>("SELECT * FROM copy_relationships WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("copy relationship {id} not found"))?
            .into_model()
    }

    pub async fn list_copy_relationships(&self) -> Result<Vec<CopyRelationship>> {
        let rows = sqlx::query_as::<_, CopyRelationshipRow>(
            "SELECT * FROM copy_relationships ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CopyRelationshipRow::into_model).collect()
    }

    /// Relationships that should react to a leader's trade.
    pub async fn active_relationships_for_leader(
        &self,
        leader_address: &str,
    ) -> Result<Vec<CopyRelationship>> {
        let rows = sqlx::query_as::<_, CopyRelationshipRow>(
            r#"
            SELECT * FROM copy_relationships
            WHERE leader_address = ? AND is_active = 1 AND is_paused = 0
            ORDER BY created_at
            "#,
        )
        .bind(leader_address)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CopyRelationshipRow::into_model).collect()
    }

    // ==================== Copy executions ====================

    /// Dedup: has this relationship already reacted to the leader tx?
    pub async fn has_copied_leader_tx(
        &self,
        relationship_id: &str,
        leader_tx_hash: &str,
    ) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM copy_executions WHERE relationship_id = ? AND leader_tx_hash = ? LIMIT 1",
        )
        .bind(relationship_id)
        .bind(leader_tx_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    pub async fn insert_copy_execution(&self, execution: &CopyExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO copy_executions (
                id, relationship_id, leader_address, leader_tx_hash, chain_id,
                action, token_in, token_out, leader_value_usd, status, skip_reason,
                calculated_size_usd, actual_size_usd, actual_price_usd,
                gas_used_usd, slippage_bps, execute_after, execution_record_id,
                error, created_at, resolved_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.relationship_id)
        .bind(&execution.leader_address)
        .bind(&execution.leader_tx_hash)
        .bind(execution.chain_id)
        .bind(execution.action.as_str())
        .bind(&execution.token_in)
        .bind(&execution.token_out)
        .bind(usd(execution.leader_value_usd))
        .bind(execution.status.as_str())
        .bind(execution.skip_reason.map(|r| r.as_str()))
        .bind(usd_opt(execution.calculated_size_usd))
        .bind(usd_opt(execution.actual_size_usd))
        .bind(usd_opt(execution.actual_price_usd))
        .bind(usd_opt(execution.gas_used_usd))
        .bind(execution.slippage_bps)
        .bind(execution.execute_after)
        .bind(execution.execution_record_id.as_deref())
        .bind(execution.error.as_deref())
        .bind(execution.created_at)
        .bind(execution.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_copy_execution(&self, execution: &CopyExecution) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE copy_executions SET
                status = ?,
                skip_reason = ?,
                calculated_size_usd = ?,
                actual_size_usd = ?,
                actual_price_usd = ?,
                gas_used_usd = ?,
                slippage_bps = ?,
                execute_after = ?,
                execution_record_id = ?,
                error = ?,
                resolved_at = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.skip_reason.map(|r| r.as_str()))
        .bind(usd_opt(execution.calculated_size_usd))
        .bind(usd_opt(execution.actual_size_usd))
        .bind(usd_opt(execution.actual_price_usd))
        .bind(usd_opt(execution.gas_used_usd))
        .bind(execution.slippage_bps)
        .bind(execution.execute_after)
        .bind(execution.execution_record_id.as_deref())
        .bind(execution.error.as_deref())
        .bind(execution.resolved_at)
        .bind(&execution.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_copy_execution(&self, id: &str) -> Result<CopyExecution> {
        sqlx::query_as::<_, CopyExecutionRow>("SELECT * FROM copy_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("copy execution {id} not found"))?
            .into_model()
    }

    pub async fn get_copy_execution_by_record(
        &self,
        execution_record_id: &str,
    ) -> Result<CopyExecution> {
        sqlx::query_as::<_, CopyExecutionRow>(
            "SELECT * FROM copy_executions WHERE execution_record_id = ?",
        )
        .bind(execution_record_id)
        .fetch_optional(&self.pool)
        .await?
        .with_context(|| format!("no copy execution for record {execution_record_id}"))?
        .into_model()
    }

    /// Delayed autonomous executions whose submission time has arrived.
    pub async fn due_copy_executions(&self, now: DateTime<Utc>) -> Result<Vec<CopyExecution>> {
        let rows = sqlx::query_as::<_, CopyExecutionRow>(
            r#"
            SELECT * FROM copy_executions
            WHERE status = 'pending' AND execute_after IS NOT NULL AND execute_after <= ?
            ORDER BY execute_after
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CopyExecutionRow::into_model).collect()
    }

    pub async fn list_copy_executions(
        &self,
        relationship_id: &str,
        limit: i64,
    ) -> Result<Vec<CopyExecution>> {
        let rows = sqlx::query_as::<_, CopyExecutionRow>(
            "SELECT * FROM copy_executions WHERE relationship_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(relationship_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CopyExecutionRow::into_model).collect()
    }

    pub async fn count_copy_executions_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM copy_executions GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows)
    }
}
