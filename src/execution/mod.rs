//! Execution record store: the shared state machine behind every automated
//! action.
//!
//! Every mutation goes through `transition`, which rejects illegal edges
//! against the successor table and appends an immutable audit row in the
//! same database transaction. Producers (the DCA scheduler and the copy
//! engine) create records and drive them; the chain-submission service
//! advances `executing` records through the mark_* callbacks.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Database, TransitionWrite};
use crate::models::{
    DecisionRecord, ExecutionContext, ExecutionRecord, ExecutionState, ExecutionStep, OwnerKind,
    StateTransition, StepAction, StepStatus,
};

pub struct ExecutionStore {
    db: Arc<Database>,
}

impl ExecutionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a record in `idle` for a producer.
    pub async fn create(
        &self,
        owner_kind: OwnerKind,
        owner_id: &str,
        wallet_address: &str,
    ) -> Result<ExecutionRecord> {
        let now = Utc::now();
        let record = ExecutionRecord {
            id: Uuid::new_v4().to_string(),
            owner_kind,
            owner_id: owner_id.to_string(),
            wallet_address: wallet_address.to_string(),
            current_state: ExecutionState::Idle,
            state_entered_at: now,
            current_step_index: 0,
            requires_approval: false,
            approval_reason: None,
            approved_by: None,
            approved_at: None,
            recoverable: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_execution_record(&record).await?;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<ExecutionRecord> {
        self.db.get_execution_record(id).await
    }

    pub async fn history(&self, id: &str) -> Result<Vec<StateTransition>> {
        self.db.list_transitions(id).await
    }

    pub async fn steps(&self, id: &str) -> Result<Vec<ExecutionStep>> {
        self.db.get_steps(id).await
    }

    /// Move a record to `to_state`, rejecting edges the successor table does
    /// not allow. Validation failures mutate nothing.
    pub async fn transition(
        &self,
        id: &str,
        to_state: ExecutionState,
        trigger: &str,
        reason: Option<String>,
        context: Option<ExecutionContext>,
    ) -> Result<ExecutionRecord> {
        self.transition_inner(id, to_state, trigger, reason, context, None, None)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn transition_inner(
        &self,
        id: &str,
        to_state: ExecutionState,
        trigger: &str,
        reason: Option<String>,
        context: Option<ExecutionContext>,
        error: Option<String>,
        recoverable: Option<bool>,
    ) -> Result<ExecutionRecord> {
        let record = self.db.get_execution_record(id).await?;

        if record.current_state.is_terminal() {
            bail!(
                "execution {} is terminal ({}) and cannot transition to {}",
                id,
                record.current_state,
                to_state
            );
        }
        if !record.current_state.can_transition_to(to_state) {
            bail!(
                "illegal transition for execution {}: {} -> {}",
                id,
                record.current_state,
                to_state
            );
        }

        let now = Utc::now();
        self.db
            .apply_transition(
                &record,
                TransitionWrite {
                    to: to_state,
                    trigger,
                    reason,
                    context: context.as_ref(),
                    error,
                    recoverable,
                    now,
                },
            )
            .await?;

        // Completion propagates the execution time to a scheduled owner.
        // Recomputing the owner's next run stays with the scheduler, which
        // is the single writer for `next_execution_at`.
        if to_state == ExecutionState::Completed && record.owner_kind == OwnerKind::DcaStrategy {
            self.db
                .touch_strategy_last_executed(&record.owner_id, now)
                .await?;
        }

        self.db.get_execution_record(id).await
    }

    /// Replace the step list as a unit, keeping ordinals and the step cursor
    /// consistent.
    pub async fn set_steps(&self, id: &str, steps: Vec<ExecutionStep>) -> Result<()> {
        let record = self.db.get_execution_record(id).await?;
        if record.is_terminal() {
            bail!("execution {} is terminal; steps are frozen", id);
        }
        self.db.replace_steps(id, &steps, Utc::now()).await
    }

    pub async fn set_approval(
        &self,
        id: &str,
        required: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        self.db
            .set_approval_requirement(id, required, reason, Utc::now())
            .await
    }

    /// Approve a gated record. Legal only while `awaiting_approval`.
    pub async fn approve(&self, id: &str, approver: &str) -> Result<ExecutionRecord> {
        let record = self.db.get_execution_record(id).await?;
        if record.current_state != ExecutionState::AwaitingApproval {
            bail!(
                "execution {} is {}, approval requires awaiting_approval",
                id,
                record.current_state
            );
        }

        self.db.set_approved(id, approver, Utc::now()).await?;
        let updated = self
            .transition_inner(
                id,
                ExecutionState::Executing,
                "approved",
                Some(format!("approved by {approver}")),
                None,
                None,
                None,
            )
            .await?;

        info!(execution = %id, approver = %approver, "Execution approved");
        Ok(updated)
    }

    /// Reject a gated record. Legal only while `awaiting_approval`.
    pub async fn reject(&self, id: &str, reason: &str) -> Result<ExecutionRecord> {
        let record = self.db.get_execution_record(id).await?;
        if record.current_state != ExecutionState::AwaitingApproval {
            bail!(
                "execution {} is {}, rejection requires awaiting_approval",
                id,
                record.current_state
            );
        }

        let updated = self
            .transition_inner(
                id,
                ExecutionState::Cancelled,
                "rejected",
                Some(reason.to_string()),
                None,
                None,
                None,
            )
            .await?;

        info!(execution = %id, reason = %reason, "Execution rejected");
        Ok(updated)
    }

    /// Convenience terminal transition with a synthesized audit row.
    pub async fn complete(&self, id: &str, result: Option<String>) -> Result<ExecutionRecord> {
        self.transition_inner(id, ExecutionState::Completed, "complete", result, None, None, None)
            .await
    }

    /// Terminate the record as failed. `recoverable` is advisory to the
    /// producer, not enforced here.
    pub async fn fail(
        &self,
        id: &str,
        error: &str,
        code: Option<&str>,
        recoverable: bool,
    ) -> Result<ExecutionRecord> {
        let message = match code {
            Some(code) => format!("{code}: {error}"),
            None => error.to_string(),
        };

        self.transition_inner(
            id,
            ExecutionState::Failed,
            "fail",
            Some(message.clone()),
            None,
            Some(message),
            Some(recoverable),
        )
        .await
    }

    /// Append-only explainability record linked to the execution.
    pub async fn add_decision(
        &self,
        id: &str,
        stage: &str,
        decision: &str,
        reasoning: &str,
    ) -> Result<()> {
        self.db
            .insert_decision(id, stage, decision, reasoning, Utc::now())
            .await
    }

    pub async fn decisions(&self, id: &str) -> Result<Vec<DecisionRecord>> {
        self.db.list_decisions(id).await
    }

    // ==================== Chain-submission callbacks ====================

    /// The submission service broadcast the transaction.
    pub async fn mark_submitted(&self, id: &str, tx_hash: &str) -> Result<ExecutionRecord> {
        let updated = self
            .transition_inner(
                id,
                ExecutionState::Monitoring,
                "tx_submitted",
                Some(format!("broadcast as {tx_hash}")),
                None,
                None,
                None,
            )
            .await?;

        self.db
            .mark_step_submitted(id, StepAction::Swap, tx_hash, Utc::now())
            .await?;

        Ok(updated)
    }

    /// The transaction confirmed on-chain.
    pub async fn mark_confirmed(
        &self,
        id: &str,
        gas_used_usd: Option<Decimal>,
    ) -> Result<ExecutionRecord> {
        self.db
            .mark_step_resolved(
                id,
                StepAction::Swap,
                StepStatus::Confirmed,
                gas_used_usd.map(|g| g.to_f64().unwrap_or(0.0)),
                Utc::now(),
            )
            .await?;

        self.complete(id, Some("transaction confirmed".to_string()))
            .await
    }

    /// The transaction failed or reverted.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        recoverable: bool,
    ) -> Result<ExecutionRecord> {
        self.db
            .mark_step_resolved(id, StepAction::Swap, StepStatus::Failed, None, Utc::now())
            .await?;

        self.fail(id, error, None, recoverable).await
    }

    // ==================== Timeout sweep ====================

    /// Force records that have sat in a non-terminal state for longer than
    /// `max_age` to an unrecoverable failure. Returns how many were swept.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>, max_age: Duration) -> Result<u64> {
        let cutoff = now - max_age;
        let stale = self.db.nonterminal_records_older_than(cutoff).await?;

        let mut swept = 0;
        for record in stale {
            let age = now - record.state_entered_at;
            warn!(
                execution = %record.id,
                state = %record.current_state,
                age_secs = age.num_seconds(),
                "Forcing timed-out execution to failed"
            );
            self.fail(
                &record.id,
                &format!(
                    "execution timed out after {}s in {}",
                    age.num_seconds(),
                    record.current_state
                ),
                Some("timeout"),
                false,
            )
            .await?;
            swept += 1;
        }

        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ExecutionStore {
        let db = Arc::new(Database::in_memory().await.expect("db"));
        ExecutionStore::new(db)
    }

    #[tokio::test]
    async fn create_starts_idle_and_history_tracks_state() {
        let store = store().await;
        let record = store
            .create(OwnerKind::Agent, "agent-1", "0xwallet")
            .await
            .unwrap();
        assert_eq!(record.current_state, ExecutionState::Idle);

        let record = store
            .transition(&record.id, ExecutionState::Analyzing, "tick", None, None)
            .await
            .unwrap();
        let record = store
            .transition(&record.id, ExecutionState::Planning, "snapshot_ok", None, None)
            .await
            .unwrap();
        assert_eq!(record.current_state, ExecutionState::Planning);

        // Monotonic history: append-only, last entry agrees with the record.
        let history = store.history(&record.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().unwrap().to_state, record.current_state);
        assert_eq!(history[0].from_state, ExecutionState::Idle);
    }

    #[tokio::test]
    async fn illegal_edges_are_rejected_without_mutation() {
        let store = store().await;
        let record = store
            .create(OwnerKind::Agent, "agent-1", "0xwallet")
            .await
            .unwrap();

        let err = store
            .transition(&record.id, ExecutionState::Monitoring, "bogus", None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("illegal transition"));

        let record = store.get(&record.id).await.unwrap();
        assert_eq!(record.current_state, ExecutionState::Idle);
        assert!(store.history(&record.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_records_are_immutable() {
        let store = store().await;
        let record = store
            .create(OwnerKind::Agent, "agent-1", "0xwallet")
            .await
            .unwrap();
        store
            .transition(&record.id, ExecutionState::Executing, "go", None, None)
            .await
            .unwrap();
        store.complete(&record.id, None).await.unwrap();

        let before = store.history(&record.id).await.unwrap().len();
        let err = store
            .transition(&record.id, ExecutionState::Executing, "retry", None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("terminal"));
        assert_eq!(store.history(&record.id).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn approval_gate_flow() {
        let store = store().await;
        let record = store
            .create(OwnerKind::CopyRelationship, "rel-1", "0xwallet")
            .await
            .unwrap();
        store
            .set_approval(&record.id, true, Some("manual copy mode"))
            .await
            .unwrap();
        store
            .transition(&record.id, ExecutionState::AwaitingApproval, "gated", None, None)
            .await
            .unwrap();

        // Approving anything not awaiting approval fails.
        let other = store
            .create(OwnerKind::Agent, "agent-2", "0xwallet")
            .await
            .unwrap();
        assert!(store.approve(&other.id, "ops").await.is_err());

        let approved = store.approve(&record.id, "ops").await.unwrap();
        assert_eq!(approved.current_state, ExecutionState::Executing);
        assert_eq!(approved.approved_by.as_deref(), Some("ops"));
        assert!(approved.approved_at.is_some());
    }

    #[tokio::test]
    async fn reject_cancels_awaiting_record() {
        let store = store().await;
        let record = store
            .create(OwnerKind::CopyRelationship, "rel-1", "0xwallet")
            .await
            .unwrap();
        store
            .transition(&record.id, ExecutionState::AwaitingApproval, "gated", None, None)
            .await
            .unwrap();

        let rejected = store.reject(&record.id, "too risky").await.unwrap();
        assert_eq!(rejected.current_state, ExecutionState::Cancelled);
        let history = store.history(&record.id).await.unwrap();
        assert_eq!(history.last().unwrap().reason.as_deref(), Some("too risky"));
    }

    #[tokio::test]
    async fn fail_records_error_and_recoverable_flag() {
        let store = store().await;
        let record = store
            .create(OwnerKind::DcaStrategy, "dca-1", "0xwallet")
            .await
            .unwrap();
        store
            .transition(&record.id, ExecutionState::Executing, "go", None, None)
            .await
            .unwrap();

        let failed = store
            .fail(&record.id, "quote expired", Some("quote_expired"), true)
            .await
            .unwrap();
        assert_eq!(failed.current_state, ExecutionState::Failed);
        assert!(failed.recoverable);
        assert_eq!(
            failed.last_error.as_deref(),
            Some("quote_expired: quote expired")
        );
    }

    #[tokio::test]
    async fn submission_callbacks_advance_executing_records() {
        let store = store().await;
        let record = store
            .create(OwnerKind::DcaStrategy, "dca-1", "0xwallet")
            .await
            .unwrap();
        store
            .set_steps(
                &record.id,
                vec![
                    ExecutionStep::new(0, "fetch quote", StepAction::Quote),
                    ExecutionStep::new(1, "swap USDC for WETH", StepAction::Swap),
                ],
            )
            .await
            .unwrap();
        store
            .transition(&record.id, ExecutionState::Executing, "go", None, None)
            .await
            .unwrap();

        let record = store.mark_submitted(&record.id, "0xhash").await.unwrap();
        assert_eq!(record.current_state, ExecutionState::Monitoring);

        let record = store.mark_confirmed(&record.id, None).await.unwrap();
        assert_eq!(record.current_state, ExecutionState::Completed);

        let steps = store.steps(&record.id).await.unwrap();
        let swap = steps.iter().find(|s| s.action == StepAction::Swap).unwrap();
        assert_eq!(swap.status, StepStatus::Confirmed);
        assert_eq!(swap.tx_hash.as_deref(), Some("0xhash"));
    }

    #[tokio::test]
    async fn timeout_sweep_fails_stale_records() {
        let store = store().await;
        let record = store
            .create(OwnerKind::Agent, "agent-1", "0xwallet")
            .await
            .unwrap();
        store
            .transition(&record.id, ExecutionState::Executing, "go", None, None)
            .await
            .unwrap();

        // Nothing is stale yet.
        let swept = store
            .sweep_timeouts(Utc::now(), Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(swept, 0);

        // From two hours in the future, the record has timed out.
        let swept = store
            .sweep_timeouts(Utc::now() + Duration::hours(2), Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(swept, 1);

        let record = store.get(&record.id).await.unwrap();
        assert_eq!(record.current_state, ExecutionState::Failed);
        assert!(!record.recoverable);
    }
}
