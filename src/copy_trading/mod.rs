//! Signal replication engine: fan a leader's on-chain trade out to its
//! followers, re-deriving per-follower order sizes and risk gates in real
//! time.
//!
//! Gates run in a fixed order and the first failure is recorded as the
//! execution's skip reason. Autonomous relationships submit after a
//! configured delay under a session grant; manual relationships park the
//! execution record in `awaiting_approval` for an operator.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ChainSubmitter, SubmitRequest};
use crate::db::Database;
use crate::execution::ExecutionStore;
use crate::models::{
    ActionClass, CopyExecution, CopyExecutionStatus, CopyRelationship, CopySkipReason,
    ExecutionContext, ExecutionState, ExecutionStep, LeaderSignal, OwnerKind, SizingMode,
    SpendScope, StepAction,
};
use crate::rate_limit::RateLimiter;
use crate::session::{ReserveDecision, SessionEnforcer, UsageMetadata};

/// Parameters for creating a follower-to-leader relationship.
#[derive(Debug, Clone)]
pub struct NewCopyRelationship {
    pub follower_wallet: String,
    pub leader_address: String,
    pub session_id: Option<String>,
    pub sizing_mode: SizingMode,
    pub size_value: Decimal,
    pub min_trade_usd: Decimal,
    pub max_trade_usd: Decimal,
    pub allowed_tokens: Vec<String>,
    pub blocked_tokens: Vec<String>,
    pub allowed_actions: Vec<ActionClass>,
    pub delay_seconds: i64,
    pub max_delay_seconds: i64,
    pub max_slippage_bps: i64,
    pub max_daily_trades: Option<i64>,
    pub max_daily_volume_usd: Option<Decimal>,
    pub requires_approval: bool,
}

pub struct CopyEngine<C> {
    db: Arc<Database>,
    executions: Arc<ExecutionStore>,
    sessions: Arc<SessionEnforcer>,
    limiter: Arc<RateLimiter>,
    submitter: C,

    // Follower portfolio values for proportional sizing; fed by an external
    // valuation service.
    portfolio_values: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl<C: ChainSubmitter> CopyEngine<C> {
    pub fn new(
        db: Arc<Database>,
        executions: Arc<ExecutionStore>,
        sessions: Arc<SessionEnforcer>,
        limiter: Arc<RateLimiter>,
        submitter: C,
    ) -> Self {
        Self {
            db,
            executions,
            sessions,
            limiter,
            submitter,
            portfolio_values: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Set a follower's portfolio value for proportional sizing.
    pub async fn set_portfolio_value(&self, wallet: &str, value: Decimal) {
        let mut values = self.portfolio_values.write().await;
        values.insert(wallet.to_string(), value);
    }

    // ==================== Relationship lifecycle ====================

    pub async fn follow(&self, params: NewCopyRelationship) -> Result<CopyRelationship> {
        if params.size_value <= Decimal::ZERO {
            bail!("size_value must be positive");
        }
        if matches!(
            params.sizing_mode,
            SizingMode::Percentage | SizingMode::Proportional
        ) && params.size_value > Decimal::ONE_HUNDRED
        {
            bail!("percentage sizing cannot exceed 100");
        }
        if params.min_trade_usd > params.max_trade_usd {
            bail!("min_trade_usd cannot exceed max_trade_usd");
        }
        if params.delay_seconds < 0 || params.max_delay_seconds < 0 {
            bail!("delays cannot be negative");
        }
        if !(0..=10_000).contains(&params.max_slippage_bps) {
            bail!("max_slippage_bps must be between 0 and 10000");
        }

        let now = Utc::now();
        let relationship = CopyRelationship {
            id: Uuid::new_v4().to_string(),
            follower_wallet: params.follower_wallet,
            leader_address: params.leader_address,
            session_id: params.session_id,
            sizing_mode: params.sizing_mode,
            size_value: params.size_value,
            min_trade_usd: params.min_trade_usd,
            max_trade_usd: params.max_trade_usd,
            allowed_tokens: params.allowed_tokens,
            blocked_tokens: params.blocked_tokens,
            allowed_actions: params.allowed_actions,
            delay_seconds: params.delay_seconds,
            max_delay_seconds: params.max_delay_seconds,
            max_slippage_bps: params.max_slippage_bps,
            max_daily_trades: params.max_daily_trades,
            max_daily_volume_usd: params.max_daily_volume_usd,
            daily_trade_count: 0,
            daily_volume_usd: Decimal::ZERO,
            daily_reset_at: now + chrono::Duration::days(1),
            total_trades: 0,
            successful_trades: 0,
            failed_trades: 0,
            skipped_trades: 0,
            total_volume_usd: Decimal::ZERO,
            requires_approval: params.requires_approval,
            is_active: true,
            is_paused: false,
            created_at: now,
            updated_at: now,
        };

        self.db.upsert_copy_relationship(&relationship).await?;
        // A re-follow keeps the existing row's id and counters; read back
        // whichever row the upsert landed on.
        let relationship = self
            .db
            .get_copy_relationship_by_pair(
                &relationship.follower_wallet,
                &relationship.leader_address,
            )
            .await?;
        info!(
            relationship = %relationship.id,
            follower = %relationship.follower_wallet,
            leader = %relationship.leader_address,
            "Copy relationship saved"
        );
        Ok(relationship)
    }

    pub async fn get(&self, id: &str) -> Result<CopyRelationship> {
        self.db.get_copy_relationship(id).await
    }

    pub async fn list(&self) -> Result<Vec<CopyRelationship>> {
        self.db.list_copy_relationships().await
    }

    pub async fn pause(&self, id: &str) -> Result<CopyRelationship> {
        let mut relationship = self.db.get_copy_relationship(id).await?;
        relationship.is_paused = true;
        relationship.updated_at = Utc::now();
        self.db.update_copy_relationship(&relationship).await?;
        info!(relationship = %id, "Copy relationship paused");
        Ok(relationship)
    }

    pub async fn resume(&self, id: &str) -> Result<CopyRelationship> {
        let mut relationship = self.db.get_copy_relationship(id).await?;
        relationship.is_paused = false;
        relationship.updated_at = Utc::now();
        self.db.update_copy_relationship(&relationship).await?;
        info!(relationship = %id, "Copy relationship resumed");
        Ok(relationship)
    }

    pub async fn unfollow(&self, id: &str) -> Result<CopyRelationship> {
        let mut relationship = self.db.get_copy_relationship(id).await?;
        relationship.is_active = false;
        relationship.updated_at = Utc::now();
        self.db.update_copy_relationship(&relationship).await?;
        info!(relationship = %id, "Copy relationship deactivated");
        Ok(relationship)
    }

    pub async fn executions(&self, relationship_id: &str, limit: i64) -> Result<Vec<CopyExecution>> {
        self.db.list_copy_executions(relationship_id, limit).await
    }

    pub async fn get_execution(&self, id: &str) -> Result<CopyExecution> {
        self.db.get_copy_execution(id).await
    }

    // ==================== Signal ingestion ====================

    /// React to a watched leader trade: fan out to every matching
    /// relationship, recording one CopyExecution per follower.
    pub async fn ingest_signal(
        &self,
        signal: &LeaderSignal,
        now: DateTime<Utc>,
    ) -> Result<Vec<CopyExecution>> {
        let relationships = self
            .db
            .active_relationships_for_leader(&signal.leader_address)
            .await?;

        let mut results = Vec::new();
        for relationship in relationships {
            let id = relationship.id.clone();
            match self.replicate(relationship, signal, now).await {
                Ok(Some(execution)) => results.push(execution),
                Ok(None) => {}
                Err(e) => {
                    // One bad relationship must not halt the fan-out.
                    error!(relationship = %id, error = %e, "Signal replication errored");
                }
            }
        }

        Ok(results)
    }

    async fn replicate(
        &self,
        mut relationship: CopyRelationship,
        signal: &LeaderSignal,
        now: DateTime<Utc>,
    ) -> Result<Option<CopyExecution>> {
        // Dedup: one reaction per leader transaction.
        if self
            .db
            .has_copied_leader_tx(&relationship.id, &signal.tx_hash)
            .await?
        {
            debug!(relationship = %relationship.id, tx = %signal.tx_hash, "Signal already handled");
            return Ok(None);
        }

        if relationship.roll_daily_window(now) {
            self.db.update_copy_relationship(&relationship).await?;
        }

        let portfolio = {
            let values = self.portfolio_values.read().await;
            values
                .get(&relationship.follower_wallet)
                .copied()
                .unwrap_or(Decimal::ZERO)
        };
        let sized = relationship.size_trade(signal.value_usd, portfolio);

        // Gates in order; the first failure wins.
        let gate_verdict = if !relationship.allows_action(signal.action) {
            Some(CopySkipReason::ActionNotAllowed)
        } else if !relationship.allows_token(&signal.token_out)
            || relationship
                .blocked_tokens
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&signal.token_in))
        {
            Some(CopySkipReason::TokenNotAllowed)
        } else if relationship
            .max_daily_trades
            .map_or(false, |max| relationship.daily_trade_count >= max)
        {
            Some(CopySkipReason::DailyTradeCapReached)
        } else if relationship
            .max_daily_volume_usd
            .map_or(false, |max| relationship.daily_volume_usd + sized > max)
        {
            Some(CopySkipReason::DailyVolumeCapReached)
        } else if sized < relationship.min_trade_usd {
            Some(CopySkipReason::TradeSizeOutOfBounds)
        } else {
            None
        };

        let mut execution = CopyExecution {
            id: Uuid::new_v4().to_string(),
            relationship_id: relationship.id.clone(),
            leader_address: signal.leader_address.clone(),
            leader_tx_hash: signal.tx_hash.clone(),
            chain_id: signal.chain_id,
            action: signal.action,
            token_in: signal.token_in.clone(),
            token_out: signal.token_out.clone(),
            leader_value_usd: signal.value_usd,
            status: CopyExecutionStatus::Pending,
            skip_reason: None,
            calculated_size_usd: Some(sized),
            actual_size_usd: None,
            actual_price_usd: None,
            gas_used_usd: None,
            slippage_bps: None,
            execute_after: None,
            execution_record_id: None,
            error: None,
            created_at: now,
            resolved_at: None,
        };

        if let Some(reason) = gate_verdict {
            return self
                .skip_execution(relationship, execution, reason, now)
                .await
                .map(Some);
        }

        // Autonomous mode needs a usable session before anything is queued.
        if !relationship.requires_approval {
            let usable = match &relationship.session_id {
                Some(session_id) => self
                    .sessions
                    .is_usable(session_id, now)
                    .await
                    .unwrap_or(false),
                None => false,
            };
            if !usable {
                return self
                    .skip_execution(relationship, execution, CopySkipReason::SessionExpired, now)
                    .await
                    .map(Some);
            }
        }

        let record = self
            .executions
            .create(
                OwnerKind::CopyRelationship,
                &relationship.id,
                &relationship.follower_wallet,
            )
            .await?;
        execution.execution_record_id = Some(record.id.clone());

        let context = ExecutionContext::CopyTrade {
            relationship_id: relationship.id.clone(),
            leader_tx_hash: signal.tx_hash.clone(),
        };
        self.executions
            .add_decision(
                &record.id,
                "sizing",
                &format!("sized ${sized}"),
                &format!(
                    "{} sizing of leader trade worth ${} (mode value {})",
                    relationship.sizing_mode.as_str(),
                    signal.value_usd,
                    relationship.size_value
                ),
            )
            .await?;
        self.executions
            .set_steps(
                &record.id,
                vec![ExecutionStep::new(
                    0,
                    format!(
                        "copy {} {} -> {} (${sized})",
                        signal.leader_address, signal.token_in, signal.token_out
                    ),
                    StepAction::Swap,
                )],
            )
            .await?;

        if relationship.requires_approval {
            self.executions
                .set_approval(&record.id, true, Some("manual copy-trade mode"))
                .await?;
            self.executions
                .transition(
                    &record.id,
                    ExecutionState::AwaitingApproval,
                    "approval_required",
                    Some(format!(
                        "copying {} trade of ${}",
                        signal.leader_address, signal.value_usd
                    )),
                    Some(context),
                )
                .await?;
            info!(
                relationship = %relationship.id,
                record = %record.id,
                "Copy trade awaiting approval"
            );
        } else {
            execution.execute_after = Some(now + relationship.effective_delay());
            self.executions
                .transition(
                    &record.id,
                    ExecutionState::Planning,
                    "scheduled",
                    Some(format!(
                        "submission delayed {}s",
                        relationship.effective_delay().num_seconds()
                    )),
                    Some(context),
                )
                .await?;
        }

        self.db.insert_copy_execution(&execution).await?;
        Ok(Some(execution))
    }

    async fn skip_execution(
        &self,
        mut relationship: CopyRelationship,
        mut execution: CopyExecution,
        reason: CopySkipReason,
        now: DateTime<Utc>,
    ) -> Result<CopyExecution> {
        execution.status = CopyExecutionStatus::Skipped;
        execution.skip_reason = Some(reason);
        execution.error = Some(reason.human_readable().to_string());
        execution.resolved_at = Some(now);
        self.db.insert_copy_execution(&execution).await?;

        relationship.total_trades += 1;
        relationship.skipped_trades += 1;
        relationship.updated_at = now;
        self.db.update_copy_relationship(&relationship).await?;

        info!(
            relationship = %relationship.id,
            reason = reason.as_str(),
            "Copy signal skipped"
        );
        Ok(execution)
    }

    // ==================== Delayed submission ====================

    /// Submit pending autonomous executions whose delay has elapsed.
    pub async fn execute_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.db.due_copy_executions(now).await?;

        let mut submitted = 0;
        for execution in due {
            let id = execution.id.clone();
            match self.submit_execution(execution, now).await {
                Ok(true) => submitted += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(execution = %id, error = %e, "Copy submission errored");
                }
            }
        }

        Ok(submitted)
    }

    async fn submit_execution(
        &self,
        mut execution: CopyExecution,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut relationship = self.db.get_copy_relationship(&execution.relationship_id).await?;
        let record_id = execution
            .execution_record_id
            .clone()
            .with_context(|| format!("copy execution {} has no execution record", execution.id))?;
        let sized = execution.calculated_size_usd.unwrap_or(Decimal::ZERO);

        // Rate-limit deferral: leave the execution pending and retry on the
        // next cycle.
        if !self
            .limiter
            .try_acquire(&relationship.follower_wallet, ActionClass::Swap, now)
        {
            debug!(execution = %execution.id, "Copy submission deferred by rate limit");
            return Ok(false);
        }

        // Atomic budget reserve under the relationship's session.
        if let Some(session_id) = relationship.session_id.clone() {
            let scope = SpendScope {
                chain_id: Some(execution.chain_id),
                contract: None,
                token: Some(execution.token_out.clone()),
            };
            let metadata = UsageMetadata {
                action: Some(ActionClass::Swap),
                chain_id: Some(execution.chain_id),
                tx_hash: None,
            };
            let decision = self
                .sessions
                .authorize_and_reserve(&session_id, now, sized, &scope, metadata)
                .await?;
            if let ReserveDecision::Denied(denied) = decision {
                warn!(
                    execution = %execution.id,
                    denied = %denied,
                    "Copy budget reserve denied"
                );
                self.executions
                    .transition(
                        &record_id,
                        ExecutionState::Cancelled,
                        "budget_denied",
                        Some(denied.to_string()),
                        None,
                    )
                    .await?;

                execution.status = CopyExecutionStatus::Skipped;
                execution.skip_reason = Some(CopySkipReason::SessionExpired);
                execution.error = Some(denied.to_string());
                execution.resolved_at = Some(now);
                self.db.update_copy_execution(&execution).await?;

                relationship.total_trades += 1;
                relationship.skipped_trades += 1;
                relationship.updated_at = now;
                self.db.update_copy_relationship(&relationship).await?;
                return Ok(false);
            }
        }

        self.executions
            .transition(&record_id, ExecutionState::Executing, "submitting", None, None)
            .await?;

        let request = SubmitRequest {
            execution_record_id: record_id.clone(),
            wallet_address: relationship.follower_wallet.clone(),
            chain_id: execution.chain_id,
            token_in: execution.token_in.clone(),
            token_out: execution.token_out.clone(),
            amount_usd: sized,
            min_amount_out: Decimal::ZERO,
            max_slippage_bps: relationship.max_slippage_bps,
            max_gas_usd: None,
        };
        match self.submitter.submit(&request).await {
            Ok(ack) => {
                execution.status = CopyExecutionStatus::Running;
                execution.execute_after = None;
                self.db.update_copy_execution(&execution).await?;
                info!(
                    execution = %execution.id,
                    reference = %ack.reference,
                    size = %sized,
                    "Copy trade submitted"
                );
                Ok(true)
            }
            Err(e) => {
                self.executions
                    .fail(&record_id, &e.message, Some("submit_failed"), e.recoverable)
                    .await?;
                self.finish_failed(relationship, execution, &e.message, e.recoverable, now)
                    .await?;
                Ok(false)
            }
        }
    }

    // ==================== Approval surface ====================

    /// Approve a manual-mode copy trade and submit it. With a session
    /// attached the budget reserve still applies; otherwise the operator's
    /// approval is the signing authority.
    pub async fn approve(&self, execution_record_id: &str, approver: &str) -> Result<CopyExecution> {
        let mut execution = self
            .db
            .get_copy_execution_by_record(execution_record_id)
            .await?;
        if execution.status != CopyExecutionStatus::Pending {
            bail!(
                "copy execution {} is {}, not pending",
                execution.id,
                execution.status.as_str()
            );
        }
        let relationship = self.db.get_copy_relationship(&execution.relationship_id).await?;
        let now = Utc::now();
        let sized = execution.calculated_size_usd.unwrap_or(Decimal::ZERO);

        if let Some(session_id) = relationship.session_id.clone() {
            let scope = SpendScope {
                chain_id: Some(execution.chain_id),
                contract: None,
                token: Some(execution.token_out.clone()),
            };
            let decision = self
                .sessions
                .authorize_and_reserve(
                    &session_id,
                    now,
                    sized,
                    &scope,
                    UsageMetadata {
                        action: Some(ActionClass::Swap),
                        chain_id: Some(execution.chain_id),
                        tx_hash: None,
                    },
                )
                .await?;
            if let ReserveDecision::Denied(denied) = decision {
                bail!("cannot approve copy trade: {denied}");
            }
        }

        self.executions.approve(execution_record_id, approver).await?;

        let request = SubmitRequest {
            execution_record_id: execution_record_id.to_string(),
            wallet_address: relationship.follower_wallet.clone(),
            chain_id: execution.chain_id,
            token_in: execution.token_in.clone(),
            token_out: execution.token_out.clone(),
            amount_usd: sized,
            min_amount_out: Decimal::ZERO,
            max_slippage_bps: relationship.max_slippage_bps,
            max_gas_usd: None,
        };
        match self.submitter.submit(&request).await {
            Ok(_) => {
                execution.status = CopyExecutionStatus::Running;
                self.db.update_copy_execution(&execution).await?;
                Ok(execution)
            }
            Err(e) => {
                self.executions
                    .fail(execution_record_id, &e.message, Some("submit_failed"), e.recoverable)
                    .await?;
                self.finish_failed(relationship, execution.clone(), &e.message, e.recoverable, now)
                    .await?;
                bail!("approved copy trade failed to submit: {}", e.message);
            }
        }
    }

    /// Reject-skip a manual-mode copy trade. Legal only while the record
    /// awaits approval.
    pub async fn reject(&self, execution_record_id: &str, reason: &str) -> Result<CopyExecution> {
        let mut execution = self
            .db
            .get_copy_execution_by_record(execution_record_id)
            .await?;
        if execution.status != CopyExecutionStatus::Pending {
            bail!(
                "copy execution {} is {}, not pending",
                execution.id,
                execution.status.as_str()
            );
        }

        self.executions.reject(execution_record_id, reason).await?;

        let now = Utc::now();
        execution.status = CopyExecutionStatus::Cancelled;
        execution.error = Some(reason.to_string());
        execution.resolved_at = Some(now);
        self.db.update_copy_execution(&execution).await?;

        let mut relationship = self.db.get_copy_relationship(&execution.relationship_id).await?;
        relationship.total_trades += 1;
        relationship.skipped_trades += 1;
        relationship.updated_at = now;
        self.db.update_copy_relationship(&relationship).await?;

        Ok(execution)
    }

    // ==================== Chain-submission callbacks ====================

    pub async fn on_submitted(&self, copy_execution_id: &str, tx_hash: &str) -> Result<()> {
        let execution = self.db.get_copy_execution(copy_execution_id).await?;
        if execution.status != CopyExecutionStatus::Running {
            bail!(
                "copy execution {} is {}, not running",
                copy_execution_id,
                execution.status.as_str()
            );
        }
        if let Some(record_id) = &execution.execution_record_id {
            self.executions.mark_submitted(record_id, tx_hash).await?;
        }
        Ok(())
    }

    /// The follower's transaction filled: update lifetime and daily
    /// counters.
    pub async fn on_filled(
        &self,
        copy_execution_id: &str,
        actual_size_usd: Decimal,
        actual_price_usd: Option<Decimal>,
        gas_used_usd: Option<Decimal>,
        slippage_bps: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut execution = self.db.get_copy_execution(copy_execution_id).await?;
        if execution.status != CopyExecutionStatus::Running {
            bail!(
                "copy execution {} is {}, not running",
                copy_execution_id,
                execution.status.as_str()
            );
        }

        execution.status = CopyExecutionStatus::Completed;
        execution.actual_size_usd = Some(actual_size_usd);
        execution.actual_price_usd = actual_price_usd;
        execution.gas_used_usd = gas_used_usd;
        execution.slippage_bps = slippage_bps;
        execution.resolved_at = Some(now);
        self.db.update_copy_execution(&execution).await?;

        if let Some(record_id) = &execution.execution_record_id {
            self.executions.mark_confirmed(record_id, gas_used_usd).await?;
        }

        let mut relationship = self.db.get_copy_relationship(&execution.relationship_id).await?;
        relationship.roll_daily_window(now);
        relationship.daily_trade_count += 1;
        relationship.daily_volume_usd += actual_size_usd;
        relationship.total_trades += 1;
        relationship.successful_trades += 1;
        relationship.total_volume_usd += actual_size_usd;
        relationship.updated_at = now;
        self.db.update_copy_relationship(&relationship).await?;

        info!(
            execution = %copy_execution_id,
            size = %actual_size_usd,
            "Copy trade filled"
        );
        Ok(())
    }

    pub async fn on_failed(
        &self,
        copy_execution_id: &str,
        error: &str,
        recoverable: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let execution = self.db.get_copy_execution(copy_execution_id).await?;
        if execution.status != CopyExecutionStatus::Running {
            bail!(
                "copy execution {} is {}, not running",
                copy_execution_id,
                execution.status.as_str()
            );
        }

        if let Some(record_id) = &execution.execution_record_id {
            self.executions.mark_failed(record_id, error, recoverable).await?;
        }

        let relationship = self.db.get_copy_relationship(&execution.relationship_id).await?;
        self.finish_failed(relationship, execution, error, recoverable, now)
            .await
    }

    async fn finish_failed(
        &self,
        mut relationship: CopyRelationship,
        mut execution: CopyExecution,
        error: &str,
        recoverable: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        execution.status = CopyExecutionStatus::Failed;
        execution.error = Some(error.to_string());
        execution.resolved_at = Some(now);
        self.db.update_copy_execution(&execution).await?;

        relationship.total_trades += 1;
        relationship.failed_trades += 1;
        // A non-retryable failure pauses the relationship so it is not
        // reselected until an operator intervenes.
        if !recoverable {
            relationship.is_paused = true;
            warn!(
                relationship = %relationship.id,
                error = %error,
                "Copy relationship paused after unrecoverable failure"
            );
        }
        relationship.updated_at = now;
        self.db.update_copy_relationship(&relationship).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{SimulatedSubmitter, SubmissionAck, SubmitError};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct FailingSubmitter {
        recoverable: bool,
    }

    impl ChainSubmitter for FailingSubmitter {
        async fn submit(&self, _request: &SubmitRequest) -> Result<SubmissionAck, SubmitError> {
            if self.recoverable {
                Err(SubmitError::transient("rpc unavailable"))
            } else {
                Err(SubmitError::fatal("transaction reverted"))
            }
        }
    }

    struct Harness<C> {
        engine: CopyEngine<C>,
        sessions: Arc<SessionEnforcer>,
        executions: Arc<ExecutionStore>,
    }

    async fn harness<C: ChainSubmitter>(submitter: C) -> Harness<C> {
        let db = Arc::new(Database::in_memory().await.expect("db"));
        let executions = Arc::new(ExecutionStore::new(db.clone()));
        let sessions = Arc::new(SessionEnforcer::new(db.clone()));
        let limiter = Arc::new(RateLimiter::new(Default::default()));
        let engine = CopyEngine::new(db, executions.clone(), sessions.clone(), limiter, submitter);
        Harness {
            engine,
            sessions,
            executions,
        }
    }

    async fn make_session(sessions: &SessionEnforcer, total: Decimal) -> String {
        sessions
            .create(crate::session::NewSessionKey {
                wallet_address: "0xfollower".to_string(),
                label: None,
                max_value_per_tx_usd: total,
                max_total_value_usd: total,
                max_transactions: None,
                allowed_chains: vec![],
                allowed_contracts: vec![],
                allowed_tokens: vec![],
                expires_at: Utc::now() + Duration::days(30),
            })
            .await
            .unwrap()
            .id
    }

    fn relationship_params(session_id: Option<String>) -> NewCopyRelationship {
        NewCopyRelationship {
            follower_wallet: "0xfollower".to_string(),
            leader_address: "0xleader".to_string(),
            session_id,
            sizing_mode: SizingMode::Percentage,
            size_value: dec!(10),
            min_trade_usd: dec!(5),
            max_trade_usd: dec!(500),
            allowed_tokens: vec![],
            blocked_tokens: vec![],
            allowed_actions: vec![ActionClass::Swap],
            delay_seconds: 0,
            max_delay_seconds: 300,
            max_slippage_bps: 100,
            max_daily_trades: None,
            max_daily_volume_usd: None,
            requires_approval: false,
        }
    }

    fn signal(tx: &str, value: Decimal) -> LeaderSignal {
        LeaderSignal {
            leader_address: "0xleader".to_string(),
            chain_id: 8453,
            action: ActionClass::Swap,
            token_in: "USDC".to_string(),
            token_out: "WETH".to_string(),
            amount_in: Some(value),
            amount_out: None,
            value_usd: value,
            tx_hash: tx.to_string(),
            observed_at: Utc::now(),
        }
    }

    /// Drive one signal through ingestion, submission, and fill.
    async fn fill_one(
        h: &Harness<impl ChainSubmitter>,
        sig: &LeaderSignal,
        now: DateTime<Utc>,
    ) -> CopyExecution {
        let executions = h.engine.ingest_signal(sig, now).await.unwrap();
        assert_eq!(executions.len(), 1);
        let execution = executions.into_iter().next().unwrap();
        assert_eq!(execution.status, CopyExecutionStatus::Pending);

        assert_eq!(h.engine.execute_due(now).await.unwrap(), 1);
        h.engine
            .on_filled(
                &execution.id,
                execution.calculated_size_usd.unwrap(),
                None,
                None,
                None,
                now,
            )
            .await
            .unwrap();
        h.engine.get_execution(&execution.id).await.unwrap()
    }

    #[tokio::test]
    async fn daily_trade_cap_skips_third_signal() {
        let h = harness(SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let mut params = relationship_params(Some(session_id));
        params.max_daily_trades = Some(2);
        let relationship = h.engine.follow(params).await.unwrap();
        let now = Utc::now();

        for tx in ["0xt1", "0xt2"] {
            let filled = fill_one(&h, &signal(tx, dec!(1000)), now).await;
            assert_eq!(filled.status, CopyExecutionStatus::Completed);
        }

        // Third same-day signal trips the daily cap.
        let third = h
            .engine
            .ingest_signal(&signal("0xt3", dec!(1000)), now)
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].status, CopyExecutionStatus::Skipped);
        assert_eq!(third[0].skip_reason, Some(CopySkipReason::DailyTradeCapReached));

        let relationship = h.engine.get(&relationship.id).await.unwrap();
        assert_eq!(relationship.daily_trade_count, 2);
        assert_eq!(relationship.skipped_trades, 1);
        assert_eq!(relationship.successful_trades, 2);
    }

    #[tokio::test]
    async fn daily_window_rolls_and_cap_resets() {
        let h = harness(SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let mut params = relationship_params(Some(session_id));
        params.max_daily_trades = Some(1);
        let relationship = h.engine.follow(params).await.unwrap();
        let now = Utc::now();

        fill_one(&h, &signal("0xt1", dec!(1000)), now).await;
        let blocked = h
            .engine
            .ingest_signal(&signal("0xt2", dec!(1000)), now)
            .await
            .unwrap();
        assert_eq!(blocked[0].skip_reason, Some(CopySkipReason::DailyTradeCapReached));

        // Past the watermark the counters reset and trading resumes.
        let tomorrow = now + Duration::days(1) + Duration::minutes(1);
        let executions = h
            .engine
            .ingest_signal(&signal("0xt3", dec!(1000)), tomorrow)
            .await
            .unwrap();
        assert_eq!(executions[0].status, CopyExecutionStatus::Pending);

        let relationship = h.engine.get(&relationship.id).await.unwrap();
        assert_eq!(relationship.daily_trade_count, 0);
    }

    #[tokio::test]
    async fn daily_volume_cap_counts_sized_value() {
        let h = harness(SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let mut params = relationship_params(Some(session_id));
        params.max_daily_volume_usd = Some(dec!(100));
        h.engine.follow(params).await.unwrap();
        let now = Utc::now();

        // 10% of $600 = $60 fills and counts toward the daily volume.
        fill_one(&h, &signal("0xt1", dec!(600)), now).await;

        // Another $60 would exceed the $100 cap.
        let second = h
            .engine
            .ingest_signal(&signal("0xt2", dec!(600)), now)
            .await
            .unwrap();
        assert_eq!(second[0].status, CopyExecutionStatus::Skipped);
        assert_eq!(second[0].skip_reason, Some(CopySkipReason::DailyVolumeCapReached));
    }

    #[tokio::test]
    async fn gate_order_and_reasons() {
        let h = harness(SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let now = Utc::now();

        // Action gate.
        let mut params = relationship_params(Some(session_id.clone()));
        params.allowed_actions = vec![ActionClass::Swap];
        h.engine.follow(params).await.unwrap();
        let mut sig = signal("0xa1", dec!(1000));
        sig.action = ActionClass::Transfer;
        let out = h.engine.ingest_signal(&sig, now).await.unwrap();
        assert_eq!(out[0].skip_reason, Some(CopySkipReason::ActionNotAllowed));

        // Token blacklist gate.
        let sig = signal("0xa2", dec!(1000));
        let relationships = h.engine.list().await.unwrap();
        let mut rel = relationships.into_iter().next().unwrap();
        rel.blocked_tokens = vec!["WETH".to_string()];
        h.engine.db.update_copy_relationship(&rel).await.unwrap();
        let out = h.engine.ingest_signal(&sig, now).await.unwrap();
        assert_eq!(out[0].skip_reason, Some(CopySkipReason::TokenNotAllowed));
    }

    #[tokio::test]
    async fn sized_below_minimum_skips() {
        let h = harness(SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let params = relationship_params(Some(session_id));
        h.engine.follow(params).await.unwrap();
        let now = Utc::now();

        // 10% of $20 = $2, below the $5 minimum.
        let out = h
            .engine
            .ingest_signal(&signal("0xs1", dec!(20)), now)
            .await
            .unwrap();
        assert_eq!(out[0].status, CopyExecutionStatus::Skipped);
        assert_eq!(out[0].skip_reason, Some(CopySkipReason::TradeSizeOutOfBounds));
    }

    #[tokio::test]
    async fn autonomous_without_session_skips() {
        let h = harness(SimulatedSubmitter).await;
        h.engine.follow(relationship_params(None)).await.unwrap();
        let now = Utc::now();

        let out = h
            .engine
            .ingest_signal(&signal("0xn1", dec!(1000)), now)
            .await
            .unwrap();
        assert_eq!(out[0].status, CopyExecutionStatus::Skipped);
        assert_eq!(out[0].skip_reason, Some(CopySkipReason::SessionExpired));
    }

    #[tokio::test]
    async fn delay_defers_submission() {
        let h = harness(SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let mut params = relationship_params(Some(session_id));
        params.delay_seconds = 30;
        h.engine.follow(params).await.unwrap();
        let now = Utc::now();

        let out = h
            .engine
            .ingest_signal(&signal("0xd1", dec!(1000)), now)
            .await
            .unwrap();
        assert_eq!(out[0].execute_after, Some(now + Duration::seconds(30)));

        assert_eq!(h.engine.execute_due(now).await.unwrap(), 0);
        assert_eq!(
            h.engine.execute_due(now + Duration::seconds(31)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_leader_tx_is_ignored() {
        let h = harness(SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        h.engine.follow(relationship_params(Some(session_id))).await.unwrap();
        let now = Utc::now();

        let first = h
            .engine
            .ingest_signal(&signal("0xdup", dec!(1000)), now)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = h
            .engine
            .ingest_signal(&signal("0xdup", dec!(1000)), now)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn manual_mode_waits_for_approval_then_fills() {
        let h = harness(SimulatedSubmitter).await;
        let mut params = relationship_params(None);
        params.requires_approval = true;
        let relationship = h.engine.follow(params).await.unwrap();
        let now = Utc::now();

        let out = h
            .engine
            .ingest_signal(&signal("0xm1", dec!(1000)), now)
            .await
            .unwrap();
        let execution = &out[0];
        assert_eq!(execution.status, CopyExecutionStatus::Pending);
        assert!(execution.execute_after.is_none());

        let record_id = execution.execution_record_id.clone().unwrap();
        let record = h.executions.get(&record_id).await.unwrap();
        assert_eq!(record.current_state, ExecutionState::AwaitingApproval);
        assert!(record.requires_approval);

        // Delayed submission never picks up manual executions.
        assert_eq!(h.engine.execute_due(now + Duration::hours(1)).await.unwrap(), 0);

        let approved = h.engine.approve(&record_id, "ops").await.unwrap();
        assert_eq!(approved.status, CopyExecutionStatus::Running);

        h.engine
            .on_filled(&approved.id, dec!(100), None, None, None, now)
            .await
            .unwrap();
        let relationship = h.engine.get(&relationship.id).await.unwrap();
        assert_eq!(relationship.successful_trades, 1);
        assert_eq!(relationship.total_volume_usd, dec!(100));
    }

    #[tokio::test]
    async fn reject_cancels_manual_execution() {
        let h = harness(SimulatedSubmitter).await;
        let mut params = relationship_params(None);
        params.requires_approval = true;
        let relationship = h.engine.follow(params).await.unwrap();
        let now = Utc::now();

        let out = h
            .engine
            .ingest_signal(&signal("0xr1", dec!(1000)), now)
            .await
            .unwrap();
        let record_id = out[0].execution_record_id.clone().unwrap();

        let rejected = h.engine.reject(&record_id, "not today").await.unwrap();
        assert_eq!(rejected.status, CopyExecutionStatus::Cancelled);

        let record = h.executions.get(&record_id).await.unwrap();
        assert_eq!(record.current_state, ExecutionState::Cancelled);

        let relationship = h.engine.get(&relationship.id).await.unwrap();
        assert_eq!(relationship.skipped_trades, 1);
    }

    #[tokio::test]
    async fn unrecoverable_failure_pauses_relationship() {
        let h = harness(FailingSubmitter { recoverable: false }).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let relationship = h.engine.follow(relationship_params(Some(session_id))).await.unwrap();
        let now = Utc::now();

        h.engine
            .ingest_signal(&signal("0xf1", dec!(1000)), now)
            .await
            .unwrap();
        h.engine.execute_due(now).await.unwrap();

        let relationship = h.engine.get(&relationship.id).await.unwrap();
        assert!(relationship.is_paused);
        assert_eq!(relationship.failed_trades, 1);
    }

    #[tokio::test]
    async fn budget_denial_at_submission_skips_and_cancels() {
        let h = harness(SimulatedSubmitter).await;
        // Cap of $150 admits one $100 copy but not two.
        let session_id = make_session(&h.sessions, dec!(150)).await;
        h.engine.follow(relationship_params(Some(session_id))).await.unwrap();
        let now = Utc::now();

        let first = h
            .engine
            .ingest_signal(&signal("0xb1", dec!(1000)), now)
            .await
            .unwrap();
        let second = h
            .engine
            .ingest_signal(&signal("0xb2", dec!(1000)), now)
            .await
            .unwrap();
        assert_eq!(first.len() + second.len(), 2);

        // Both were sized at $100; only the first reserve fits the budget.
        assert_eq!(h.engine.execute_due(now).await.unwrap(), 1);

        let denied = h.engine.get_execution(&second[0].id).await.unwrap();
        assert_eq!(denied.status, CopyExecutionStatus::Skipped);
        assert_eq!(denied.skip_reason, Some(CopySkipReason::SessionExpired));

        let record = h
            .executions
            .get(denied.execution_record_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(record.current_state, ExecutionState::Cancelled);
    }

    #[tokio::test]
    async fn proportional_sizing_uses_portfolio_value() {
        let h = harness(SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let mut params = relationship_params(Some(session_id));
        params.sizing_mode = SizingMode::Proportional;
        params.size_value = dec!(2);
        h.engine.follow(params).await.unwrap();
        h.engine.set_portfolio_value("0xfollower", dec!(5000)).await;
        let now = Utc::now();

        let out = h
            .engine
            .ingest_signal(&signal("0xp1", dec!(999999)), now)
            .await
            .unwrap();
        // 2% of the follower's $5000 portfolio, independent of leader size.
        assert_eq!(out[0].calculated_size_usd, Some(dec!(100)));
    }
}
