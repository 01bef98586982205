//! Persistence for execution records, transitions, steps, and decisions.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::models::{
    DecisionRecord, ExecutionContext, ExecutionRecord, ExecutionState, ExecutionStep, OwnerKind,
    StateTransition, StepAction, StepStatus,
};

use super::{decimal_opt, from_json, json, usd_opt, Database};

#[derive(Debug, Clone, sqlx::FromRow)]
struct ExecutionRecordRow {
    id: String,
    owner_kind: String,
    owner_id: String,
    wallet_address: String,
    current_state: String,
    state_entered_at: DateTime<Utc>,
    current_step_index: i64,
    requires_approval: bool,
    approval_reason: Option<String>,
    approved_by: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    recoverable: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ExecutionRecordRow {
    fn into_model(self) -> Result<ExecutionRecord> {
        Ok(ExecutionRecord {
            owner_kind: OwnerKind::parse(&self.owner_kind)
                .with_context(|| format!("unknown owner kind: {}", self.owner_kind))?,
            current_state: ExecutionState::parse(&self.current_state)
                .with_context(|| format!("unknown execution state: {}", self.current_state))?,
            id: self.id,
            owner_id: self.owner_id,
            wallet_address: self.wallet_address,
            state_entered_at: self.state_entered_at,
            current_step_index: self.current_step_index,
            requires_approval: self.requires_approval,
            approval_reason: self.approval_reason,
            approved_by: self.approved_by,
            approved_at: self.approved_at,
            recoverable: self.recoverable,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StateTransitionRow {
    id: i64,
    execution_id: String,
    from_state: String,
    to_state: String,
    trigger: String,
    reason: Option<String>,
    context: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl StateTransitionRow {
    fn into_model(self) -> Result<StateTransition> {
        Ok(StateTransition {
            from_state: ExecutionState::parse(&self.from_state)
                .with_context(|| format!("unknown execution state: {}", self.from_state))?,
            to_state: ExecutionState::parse(&self.to_state)
                .with_context(|| format!("unknown execution state: {}", self.to_state))?,
            context: match self.context.as_deref() {
                Some(raw) => Some(from_json::<ExecutionContext>(raw)?),
                None => None,
            },
            id: self.id,
            execution_id: self.execution_id,
            trigger: self.trigger,
            reason: self.reason,
            error: self.error,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ExecutionStepRow {
    ordinal: i64,
    description: String,
    action: String,
    status: String,
    tx_hash: Option<String>,
    chain_id: Option<i64>,
    gas_used_usd: Option<f64>,
    retry_count: i64,
    payload: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl ExecutionStepRow {
    fn into_model(self) -> Result<ExecutionStep> {
        Ok(ExecutionStep {
            action: StepAction::parse(&self.action)
                .with_context(|| format!("unknown step action: {}", self.action))?,
            status: StepStatus::parse(&self.status)
                .with_context(|| format!("unknown step status: {}", self.status))?,
            payload: match self.payload.as_deref() {
                Some(raw) => Some(from_json::<ExecutionContext>(raw)?),
                None => None,
            },
            ordinal: self.ordinal,
            description: self.description,
            tx_hash: self.tx_hash,
            chain_id: self.chain_id,
            gas_used_usd: decimal_opt(self.gas_used_usd),
            retry_count: self.retry_count,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// A validated transition write: guarded state swap plus its audit row,
/// committed as one transaction.
pub struct TransitionWrite<'a> {
    pub to: ExecutionState,
    pub trigger: &'a str,
    pub reason: Option<String>,
    pub context: Option<&'a ExecutionContext>,
    pub error: Option<String>,
    /// Only set when the caller is recording a failure verdict.
    pub recoverable: Option<bool>,
    pub now: DateTime<Utc>,
}

impl Database {
    // ==================== Execution records ====================

    pub async fn insert_execution_record(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_records (
                id, owner_kind, owner_id, wallet_address, current_state,
                state_entered_at, current_step_index, requires_approval,
                recoverable, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.owner_kind.as_str())
        .bind(&record.owner_id)
        .bind(&record.wallet_address)
        .bind(record.current_state.as_str())
        .bind(record.state_entered_at)
        .bind(record.current_step_index)
        .bind(record.requires_approval)
        .bind(record.recoverable)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_execution_record(&self, id: &str) -> Result<ExecutionRecord> {
        sqlx::query_as::<_, ExecutionRecordRow>("SELECT * FROM execution_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("execution record {id} not found"))?
            .into_model()
    }

    /// Apply a transition: swap `current_state` guarded on the expected
    /// previous state and append the audit row, atomically. The guard
    /// serializes concurrent writers on one record.
    pub async fn apply_transition(
        &self,
        record: &ExecutionRecord,
        write: TransitionWrite<'_>,
    ) -> Result<()> {
        let context_json = match write.context {
            Some(ctx) => Some(json(ctx)?),
            None => None,
        };

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE execution_records SET
                current_state = ?,
                state_entered_at = ?,
                last_error = COALESCE(?, last_error),
                recoverable = COALESCE(?, recoverable),
                updated_at = ?
            WHERE id = ? AND current_state = ?
            "#,
        )
        .bind(write.to.as_str())
        .bind(write.now)
        .bind(write.error.as_deref())
        .bind(write.recoverable)
        .bind(write.now)
        .bind(&record.id)
        .bind(record.current_state.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            bail!(
                "execution {} changed state concurrently (expected {})",
                record.id,
                record.current_state
            );
        }

        sqlx::query(
            r#"
            INSERT INTO state_transitions
                (execution_id, from_state, to_state, "trigger", reason, context, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.current_state.as_str())
        .bind(write.to.as_str())
        .bind(write.trigger)
        .bind(write.reason.as_deref())
        .bind(context_json.as_deref())
        .bind(write.error.as_deref())
        .bind(write.now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_transitions(&self, execution_id: &str) -> Result<Vec<StateTransition>> {
        let rows = sqlx::query_as::<_, StateTransitionRow>(
            "SELECT * FROM state_transitions WHERE execution_id = ? ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StateTransitionRow::into_model).collect()
    }

    pub async fn set_approval_requirement(
        &self,
        id: &str,
        required: bool,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE execution_records SET requires_approval = ?, approval_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(required)
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_approved(&self, id: &str, approver: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE execution_records SET approved_by = ?, approved_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(approver)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records stuck in a non-terminal state since before the cutoff.
    pub async fn nonterminal_records_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRecordRow>(
            r#"
            SELECT * FROM execution_records
            WHERE current_state NOT IN ('completed', 'failed', 'cancelled')
              AND state_entered_at <= ?
            ORDER BY state_entered_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ExecutionRecordRow::into_model).collect()
    }

    pub async fn count_records_by_state(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT current_state, COUNT(*) FROM execution_records GROUP BY current_state",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ==================== Steps ====================

    /// Replace the step list as a unit and reset the step cursor.
    pub async fn replace_steps(
        &self,
        execution_id: &str,
        steps: &[ExecutionStep],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM execution_steps WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;

        for step in steps {
            let payload_json = match &step.payload {
                Some(payload) => Some(json(payload)?),
                None => None,
            };
            sqlx::query(
                r#"
                INSERT INTO execution_steps (
                    execution_id, ordinal, description, action, status, tx_hash,
                    chain_id, gas_used_usd, retry_count, payload, started_at, completed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(execution_id)
            .bind(step.ordinal)
            .bind(&step.description)
            .bind(step.action.as_str())
            .bind(step.status.as_str())
            .bind(step.tx_hash.as_deref())
            .bind(step.chain_id)
            .bind(usd_opt(step.gas_used_usd))
            .bind(step.retry_count)
            .bind(payload_json.as_deref())
            .bind(step.started_at)
            .bind(step.completed_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE execution_records SET current_step_index = 0, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>> {
        let rows = sqlx::query_as::<_, ExecutionStepRow>(
            "SELECT * FROM execution_steps WHERE execution_id = ? ORDER BY ordinal",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ExecutionStepRow::into_model).collect()
    }

    pub async fn mark_step_submitted(
        &self,
        execution_id: &str,
        action: StepAction,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE execution_steps SET
                status = 'submitted',
                tx_hash = ?,
                started_at = COALESCE(started_at, ?)
            WHERE execution_id = ? AND action = ?
            "#,
        )
        .bind(tx_hash)
        .bind(now)
        .bind(execution_id)
        .bind(action.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_step_resolved(
        &self,
        execution_id: &str,
        action: StepAction,
        status: StepStatus,
        gas_used_usd: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE execution_steps SET
                status = ?,
                gas_used_usd = COALESCE(?, gas_used_usd),
                completed_at = ?
            WHERE execution_id = ? AND action = ?
            "#,
        )
        .bind(status.as_str())
        .bind(gas_used_usd)
        .bind(now)
        .bind(execution_id)
        .bind(action.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Decisions ====================

    pub async fn insert_decision(
        &self,
        execution_id: &str,
        stage: &str,
        decision: &str,
        reasoning: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_decisions (execution_id, stage, decision, reasoning, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution_id)
        .bind(stage)
        .bind(decision)
        .bind(reasoning)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_decisions(&self, execution_id: &str) -> Result<Vec<DecisionRecord>> {
        #[derive(sqlx::FromRow)]
        struct DecisionRow {
            id: i64,
            execution_id: String,
            stage: String,
            decision: String,
            reasoning: String,
            created_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, DecisionRow>(
            "SELECT * FROM execution_decisions WHERE execution_id = ? ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| DecisionRecord {
                id: r.id,
                execution_id: r.execution_id,
                stage: r.stage,
                decision: r.decision,
                reasoning: r.reasoning,
                created_at: r.created_at,
            })
            .collect())
    }
}
