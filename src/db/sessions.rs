//! Persistence for session keys, smart sessions, and the usage log.
//!
//! The reserve path is a single guarded UPDATE: the authorization decision
//! and the usage bump happen in one statement, so two concurrent spends for
//! the same wallet can never both pass a stale check (the check-then-spend
//! race from the reference design).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{
    ActionClass, SessionKey, SessionStatus, SmartSession, UsageEntry, ValueLimits,
    USAGE_LOG_LIMIT,
};

use super::{decimal, from_json, json, usd, Database};

#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionKeyRow {
    id: String,
    wallet_address: String,
    label: Option<String>,
    max_value_per_tx_usd: f64,
    max_total_value_usd: f64,
    max_transactions: Option<i64>,
    total_value_used_usd: f64,
    transaction_count: i64,
    allowed_chains: String,
    allowed_contracts: String,
    allowed_tokens: String,
    expires_at: DateTime<Utc>,
    status: String,
    revoked_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionKeyRow {
    fn into_model(self) -> Result<SessionKey> {
        Ok(SessionKey {
            status: SessionStatus::parse(&self.status)
                .with_context(|| format!("unknown session status: {}", self.status))?,
            value_limits: ValueLimits {
                max_value_per_tx_usd: decimal(self.max_value_per_tx_usd),
                max_total_value_usd: decimal(self.max_total_value_usd),
                max_transactions: self.max_transactions,
                total_value_used_usd: decimal(self.total_value_used_usd),
                transaction_count: self.transaction_count,
            },
            allowed_chains: from_json(&self.allowed_chains)?,
            allowed_contracts: from_json(&self.allowed_contracts)?,
            allowed_tokens: from_json(&self.allowed_tokens)?,
            id: self.id,
            wallet_address: self.wallet_address,
            label: self.label,
            expires_at: self.expires_at,
            revoked_reason: self.revoked_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SmartSessionRow {
    id: String,
    wallet_address: String,
    spending_limit_usd: f64,
    spent_usd: f64,
    transaction_count: i64,
    allowed_actions: String,
    expires_at: DateTime<Utc>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SmartSessionRow {
    fn into_model(self) -> Result<SmartSession> {
        Ok(SmartSession {
            status: SessionStatus::parse(&self.status)
                .with_context(|| format!("unknown session status: {}", self.status))?,
            allowed_actions: from_json(&self.allowed_actions)?,
            spending_limit_usd: decimal(self.spending_limit_usd),
            spent_usd: decimal(self.spent_usd),
            id: self.id,
            wallet_address: self.wallet_address,
            transaction_count: self.transaction_count,
            expires_at: self.expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl Database {
    // ==================== Session keys ====================

    pub async fn insert_session_key(&self, key: &SessionKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_keys (
                id, wallet_address, label, max_value_per_tx_usd, max_total_value_usd,
                max_transactions, total_value_used_usd, transaction_count,
                allowed_chains, allowed_contracts, allowed_tokens,
                expires_at, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&key.id)
        .bind(&key.wallet_address)
        .bind(key.label.as_deref())
        .bind(usd(key.value_limits.max_value_per_tx_usd))
        .bind(usd(key.value_limits.max_total_value_usd))
        .bind(key.value_limits.max_transactions)
        .bind(usd(key.value_limits.total_value_used_usd))
        .bind(key.value_limits.transaction_count)
        .bind(json(&key.allowed_chains)?)
        .bind(json(&key.allowed_contracts)?)
        .bind(json(&key.allowed_tokens)?)
        .bind(key.expires_at)
        .bind(key.status.as_str())
        .bind(key.created_at)
        .bind(key.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_session_key(&self, id: &str) -> Result<SessionKey> {
        sqlx::query_as::<_, SessionKeyRow>("SELECT * FROM session_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("session key {id} not found"))?
            .into_model()
    }

    pub async fn list_session_keys(&self, wallet: Option<&str>) -> Result<Vec<SessionKey>> {
        let rows = match wallet {
            Some(w) => {
                sqlx::query_as::<_, SessionKeyRow>(
                    "SELECT * FROM session_keys WHERE wallet_address = ? ORDER BY created_at DESC",
                )
                .bind(w)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SessionKeyRow>(
                    "SELECT * FROM session_keys ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(SessionKeyRow::into_model).collect()
    }

    /// Atomic authorize-and-reserve. The WHERE clause re-checks status,
    /// expiry, and every value limit against current row state; a stale
    /// in-process check can therefore never over-commit the budget.
    /// Returns false when the guard rejected the spend.
    pub async fn try_reserve_session_budget(
        &self,
        id: &str,
        value_usd: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let value = usd(value_usd);
        let result = sqlx::query(
            r#"
            UPDATE session_keys SET
                total_value_used_usd = total_value_used_usd + ?,
                transaction_count = transaction_count + 1,
                updated_at = ?
            WHERE id = ?
              AND status = 'active'
              AND expires_at > ?
              AND ? <= max_value_per_tx_usd
              AND total_value_used_usd + ? <= max_total_value_usd
              AND (max_transactions IS NULL OR transaction_count < max_transactions)
            "#,
        )
        .bind(value)
        .bind(now)
        .bind(id)
        .bind(now)
        .bind(value)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Flip an active key to exhausted once a limit has been met.
    pub async fn mark_exhausted_if_limits_met(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE session_keys SET status = 'exhausted', updated_at = ?
            WHERE id = ? AND status = 'active'
              AND (total_value_used_usd >= max_total_value_usd
                   OR (max_transactions IS NOT NULL AND transaction_count >= max_transactions))
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn set_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE session_keys SET
                status = ?,
                revoked_reason = COALESCE(?, revoked_reason),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_session_expiry(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE session_keys SET expires_at = ?, status = 'active', updated_at = ? WHERE id = ?",
        )
        .bind(expires_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Idempotent batch expiry of overdue active keys. Returns the number
    /// transitioned.
    pub async fn expire_due_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let keys = sqlx::query(
            "UPDATE session_keys SET status = 'expired', updated_at = ? WHERE status = 'active' AND expires_at <= ?",
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let smart = sqlx::query(
            "UPDATE smart_sessions SET status = 'expired', updated_at = ? WHERE status = 'active' AND expires_at <= ?",
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(keys.rows_affected() + smart.rows_affected())
    }

    // ==================== Usage log ====================

    /// Append a usage entry and prune the log to the last
    /// [`USAGE_LOG_LIMIT`] rows for the session.
    pub async fn append_session_usage(
        &self,
        session_id: &str,
        value_usd: Decimal,
        action: ActionClass,
        chain_id: Option<i64>,
        tx_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO session_usage (session_id, value_usd, action, chain_id, tx_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(usd(value_usd))
        .bind(action.as_str())
        .bind(chain_id)
        .bind(tx_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM session_usage
            WHERE session_id = ?
              AND id NOT IN (
                  SELECT id FROM session_usage WHERE session_id = ?
                  ORDER BY id DESC LIMIT ?
              )
            "#,
        )
        .bind(session_id)
        .bind(session_id)
        .bind(USAGE_LOG_LIMIT)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_session_usage(&self, session_id: &str) -> Result<Vec<UsageEntry>> {
        #[derive(sqlx::FromRow)]
        struct UsageRow {
            id: i64,
            session_id: String,
            value_usd: f64,
            action: String,
            chain_id: Option<i64>,
            tx_hash: Option<String>,
            created_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, UsageRow>(
            "SELECT * FROM session_usage WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(UsageEntry {
                    action: ActionClass::parse(&r.action)
                        .with_context(|| format!("unknown action class: {}", r.action))?,
                    id: r.id,
                    session_id: r.session_id,
                    value_usd: decimal(r.value_usd),
                    chain_id: r.chain_id,
                    tx_hash: r.tx_hash,
                    created_at: r.created_at,
                })
            })
            .collect()
    }

    pub async fn count_sessions_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM session_keys GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows)
    }

    // ==================== Smart sessions ====================

    pub async fn insert_smart_session(&self, session: &SmartSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO smart_sessions (
                id, wallet_address, spending_limit_usd, spent_usd, transaction_count,
                allowed_actions, expires_at, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.wallet_address)
        .bind(usd(session.spending_limit_usd))
        .bind(usd(session.spent_usd))
        .bind(session.transaction_count)
        .bind(json(&session.allowed_actions)?)
        .bind(session.expires_at)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_smart_session(&self, id: &str) -> Result<SmartSession> {
        sqlx::query_as::<_, SmartSessionRow>("SELECT * FROM smart_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("smart session {id} not found"))?
            .into_model()
    }

    /// Same compare-and-swap shape as the session-key reserve, against the
    /// flattened aggregate limit.
    pub async fn try_reserve_smart_session(
        &self,
        id: &str,
        value_usd: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let value = usd(value_usd);
        let result = sqlx::query(
            r#"
            UPDATE smart_sessions SET
                spent_usd = spent_usd + ?,
                transaction_count = transaction_count + 1,
                updated_at = ?
            WHERE id = ?
              AND status = 'active'
              AND expires_at > ?
              AND spent_usd + ? <= spending_limit_usd
            "#,
        )
        .bind(value)
        .bind(now)
        .bind(id)
        .bind(now)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_smart_session_exhausted_if_spent(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE smart_sessions SET status = 'exhausted', updated_at = ?
            WHERE id = ? AND status = 'active' AND spent_usd >= spending_limit_usd
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn set_smart_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE smart_sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
