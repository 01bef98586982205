//! DCA strategy scheduler: recurring fixed-budget purchases with ordered
//! pre-trade guards, budget reservation, and cumulative cost accounting.
//!
//! The tick cycle is absorb-per-strategy: one bad strategy cannot halt the
//! batch. At most one execution per strategy is in flight at a time; the
//! due-strategy scan excludes strategies with an unresolved execution, and
//! `next_execution_at` only advances once a tick resolves.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ChainSubmitter, MarketDataSource, QuoteRequest, SubmitRequest};
use crate::db::Database;
use crate::execution::ExecutionStore;
use crate::models::{
    ActionClass, DcaExecution, DcaExecutionStatus, DcaFrequency, DcaGuards, DcaSkipReason,
    DcaStats, DcaStatus, DcaStopConditions, DcaStrategy, ExecutionContext, ExecutionState,
    ExecutionStep, OwnerKind, SpendScope, StepAction,
};
use crate::rate_limit::RateLimiter;
use crate::session::{ReserveDecision, SessionEnforcer, UsageMetadata};

#[derive(Debug, Clone)]
pub struct DcaConfig {
    /// Bounded batch per tick cycle.
    pub batch_limit: i64,
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self { batch_limit: 25 }
    }
}

/// Parameters for creating a strategy.
#[derive(Debug, Clone)]
pub struct NewDcaStrategy {
    pub owner_wallet: String,
    pub session_id: Option<String>,
    pub chain_id: i64,
    pub token_in: String,
    pub token_out: String,
    pub amount_per_execution_usd: Decimal,
    pub frequency: DcaFrequency,
    pub guards: DcaGuards,
    pub stop_conditions: DcaStopConditions,
}

/// Config fields that may change while a strategy is draft or paused.
#[derive(Debug, Clone, Default)]
pub struct DcaStrategyPatch {
    pub amount_per_execution_usd: Option<Decimal>,
    pub frequency: Option<DcaFrequency>,
    pub guards: Option<DcaGuards>,
    pub stop_conditions: Option<DcaStopConditions>,
}

/// What a single strategy tick resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Submitted to the chain; resolution arrives via callbacks.
    Submitted,
    Skipped(DcaSkipReason),
    /// Transient failure; the strategy stays active and reschedules.
    FailedRecoverable,
    /// The strategy was disabled.
    FailedFatal,
}

#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub selected: usize,
    pub submitted: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct DcaScheduler<M, C> {
    db: Arc<Database>,
    executions: Arc<ExecutionStore>,
    sessions: Arc<SessionEnforcer>,
    limiter: Arc<RateLimiter>,
    market: M,
    submitter: C,
    config: DcaConfig,
}

impl<M: MarketDataSource, C: ChainSubmitter> DcaScheduler<M, C> {
    pub fn new(
        db: Arc<Database>,
        executions: Arc<ExecutionStore>,
        sessions: Arc<SessionEnforcer>,
        limiter: Arc<RateLimiter>,
        market: M,
        submitter: C,
        config: DcaConfig,
    ) -> Self {
        Self {
            db,
            executions,
            sessions,
            limiter,
            market,
            submitter,
            config,
        }
    }

    // ==================== Strategy lifecycle ====================

    pub async fn create(&self, params: NewDcaStrategy) -> Result<DcaStrategy> {
        if params.amount_per_execution_usd <= Decimal::ZERO {
            bail!("amount_per_execution_usd must be positive");
        }
        if !(0..=10_000).contains(&params.guards.max_slippage_bps) {
            bail!("max_slippage_bps must be between 0 and 10000");
        }
        if let (Some(above), Some(below)) = (
            params.guards.pause_if_price_above_usd,
            params.guards.pause_if_price_below_usd,
        ) {
            if below >= above {
                bail!("price band is empty: below-limit must be under above-limit");
            }
        }
        if params.token_in.eq_ignore_ascii_case(&params.token_out) {
            bail!("token_in and token_out must differ");
        }

        let now = Utc::now();
        let strategy = DcaStrategy {
            id: Uuid::new_v4().to_string(),
            owner_wallet: params.owner_wallet,
            session_id: params.session_id,
            chain_id: params.chain_id,
            token_in: params.token_in,
            token_out: params.token_out,
            amount_per_execution_usd: params.amount_per_execution_usd,
            frequency: params.frequency,
            next_execution_at: None,
            guards: params.guards,
            stop_conditions: params.stop_conditions,
            stats: DcaStats::default(),
            status: DcaStatus::Draft,
            last_executed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_dca_strategy(&strategy).await?;
        info!(strategy = %strategy.id, wallet = %strategy.owner_wallet, "DCA strategy created");
        Ok(strategy)
    }

    pub async fn get(&self, id: &str) -> Result<DcaStrategy> {
        self.db.get_dca_strategy(id).await
    }

    pub async fn list(&self, status: Option<DcaStatus>) -> Result<Vec<DcaStrategy>> {
        self.db.list_dca_strategies(status).await
    }

    pub async fn attach_session(&self, id: &str, session_id: &str) -> Result<DcaStrategy> {
        let mut strategy = self.db.get_dca_strategy(id).await?;
        if !matches!(
            strategy.status,
            DcaStatus::Draft | DcaStatus::PendingSession | DcaStatus::Paused
        ) {
            bail!("cannot attach a session while strategy is {}", strategy.status);
        }
        strategy.session_id = Some(session_id.to_string());
        if strategy.status == DcaStatus::PendingSession {
            strategy.status = DcaStatus::Draft;
        }
        strategy.updated_at = Utc::now();
        self.db.update_dca_strategy(&strategy).await?;
        Ok(strategy)
    }

    /// Activate a draft. Without a usable session the strategy parks in
    /// `pending_session`; with one it goes active and its first tick is due
    /// immediately.
    pub async fn activate(&self, id: &str, now: DateTime<Utc>) -> Result<DcaStrategy> {
        let mut strategy = self.db.get_dca_strategy(id).await?;
        if !matches!(strategy.status, DcaStatus::Draft | DcaStatus::PendingSession) {
            bail!("cannot activate a strategy that is {}", strategy.status);
        }

        let usable = match &strategy.session_id {
            Some(session_id) => self
                .sessions
                .is_usable(session_id, now)
                .await
                .unwrap_or(false),
            None => false,
        };

        if usable {
            strategy.status = DcaStatus::Active;
            strategy.next_execution_at = Some(now);
            info!(strategy = %strategy.id, "DCA strategy activated");
        } else {
            strategy.status = DcaStatus::PendingSession;
            warn!(strategy = %strategy.id, "DCA strategy needs a usable session before activation");
        }
        strategy.updated_at = Utc::now();
        self.db.update_dca_strategy(&strategy).await?;
        Ok(strategy)
    }

    pub async fn pause(&self, id: &str) -> Result<DcaStrategy> {
        let mut strategy = self.db.get_dca_strategy(id).await?;
        if strategy.status != DcaStatus::Active {
            bail!("cannot pause a strategy that is {}", strategy.status);
        }
        strategy.status = DcaStatus::Paused;
        strategy.updated_at = Utc::now();
        self.db.update_dca_strategy(&strategy).await?;
        info!(strategy = %id, "DCA strategy paused");
        Ok(strategy)
    }

    /// Resume a paused strategy. If its session died while paused, the
    /// strategy expires instead of resuming.
    pub async fn resume(&self, id: &str, now: DateTime<Utc>) -> Result<DcaStrategy> {
        let mut strategy = self.db.get_dca_strategy(id).await?;
        if strategy.status != DcaStatus::Paused {
            bail!("cannot resume a strategy that is {}", strategy.status);
        }

        let usable = match &strategy.session_id {
            Some(session_id) => self
                .sessions
                .is_usable(session_id, now)
                .await
                .unwrap_or(false),
            None => false,
        };

        if usable {
            strategy.status = DcaStatus::Active;
            strategy.next_execution_at = Some(strategy.next_execution_at.unwrap_or(now).max(now));
            info!(strategy = %id, "DCA strategy resumed");
        } else {
            strategy.status = DcaStatus::Expired;
            strategy.next_execution_at = None;
            warn!(strategy = %id, "Session expired while paused; strategy expired");
        }
        strategy.updated_at = Utc::now();
        self.db.update_dca_strategy(&strategy).await?;
        Ok(strategy)
    }

    pub async fn stop(&self, id: &str) -> Result<DcaStrategy> {
        let mut strategy = self.db.get_dca_strategy(id).await?;
        if !matches!(strategy.status, DcaStatus::Active | DcaStatus::Paused) {
            bail!("cannot stop a strategy that is {}", strategy.status);
        }
        strategy.status = DcaStatus::Completed;
        strategy.next_execution_at = None;
        strategy.updated_at = Utc::now();
        self.db.update_dca_strategy(&strategy).await?;
        info!(strategy = %id, "DCA strategy stopped");
        Ok(strategy)
    }

    /// Update config; legal only from draft or paused.
    pub async fn update_config(&self, id: &str, patch: DcaStrategyPatch) -> Result<DcaStrategy> {
        let mut strategy = self.db.get_dca_strategy(id).await?;
        if !strategy.status.allows_config_update() {
            bail!(
                "config updates require draft or paused, strategy is {}",
                strategy.status
            );
        }

        if let Some(amount) = patch.amount_per_execution_usd {
            if amount <= Decimal::ZERO {
                bail!("amount_per_execution_usd must be positive");
            }
            strategy.amount_per_execution_usd = amount;
        }
        if let Some(frequency) = patch.frequency {
            strategy.frequency = frequency;
        }
        if let Some(guards) = patch.guards {
            if !(0..=10_000).contains(&guards.max_slippage_bps) {
                bail!("max_slippage_bps must be between 0 and 10000");
            }
            strategy.guards = guards;
        }
        if let Some(stops) = patch.stop_conditions {
            strategy.stop_conditions = stops;
        }

        strategy.updated_at = Utc::now();
        self.db.update_dca_strategy(&strategy).await?;
        Ok(strategy)
    }

    pub async fn executions(&self, id: &str, limit: i64) -> Result<Vec<DcaExecution>> {
        self.db.list_dca_executions(id, limit).await
    }

    // ==================== Tick cycle ====================

    /// Run one scheduler cycle over the due strategies. Guard skips and
    /// recoverable failures are absorbed per strategy.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let due = self
            .db
            .due_dca_strategies(now, self.config.batch_limit)
            .await?;

        let mut summary = TickSummary {
            selected: due.len(),
            ..TickSummary::default()
        };

        for strategy in due {
            let id = strategy.id.clone();
            match self.run_strategy_tick(strategy, now).await {
                Ok(TickOutcome::Submitted) => summary.submitted += 1,
                Ok(TickOutcome::Skipped(reason)) => {
                    summary.skipped += 1;
                    info!(strategy = %id, reason = reason.as_str(), "DCA tick skipped");
                }
                Ok(TickOutcome::FailedRecoverable) | Ok(TickOutcome::FailedFatal) => {
                    summary.failed += 1;
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(strategy = %id, error = %e, "DCA tick errored");
                }
            }
        }

        Ok(summary)
    }

    async fn run_strategy_tick(
        &self,
        strategy: DcaStrategy,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let execution_number = self.db.next_dca_execution_number(&strategy.id).await?;
        let mut execution = DcaExecution {
            id: Uuid::new_v4().to_string(),
            strategy_id: strategy.id.clone(),
            execution_number,
            status: DcaExecutionStatus::Pending,
            skip_reason: None,
            token_price_usd: None,
            gas_price_usd: None,
            quoted_amount_out: None,
            spent_usd: None,
            tokens_acquired: None,
            actual_price_usd: None,
            tx_hash: None,
            error: None,
            execution_record_id: None,
            created_at: now,
            resolved_at: None,
        };
        self.db.insert_dca_execution(&execution).await?;

        // Market snapshot. Unavailable market data is a transient fault.
        let snapshot = match self.market.snapshot(strategy.chain_id, &strategy.token_out).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return self
                    .resolve_recoverable(strategy, execution, format!("market data unavailable: {e}"), now)
                    .await;
            }
        };
        execution.token_price_usd = Some(snapshot.price_usd);
        execution.gas_price_usd = Some(snapshot.gas_price_usd);

        // Guards, in order; the first failure skips the tick.
        if let Some(ceiling) = strategy.guards.skip_if_gas_above_usd {
            if snapshot.gas_price_usd > ceiling {
                return self
                    .resolve_skip(strategy, execution, DcaSkipReason::GasTooHigh, now)
                    .await;
            }
        }
        if let Some(limit) = strategy.guards.pause_if_price_above_usd {
            if snapshot.price_usd > limit {
                return self
                    .resolve_skip(strategy, execution, DcaSkipReason::PriceAboveLimit, now)
                    .await;
            }
        }
        if let Some(limit) = strategy.guards.pause_if_price_below_usd {
            if snapshot.price_usd < limit {
                return self
                    .resolve_skip(strategy, execution, DcaSkipReason::PriceBelowLimit, now)
                    .await;
            }
        }

        let session_usable = match &strategy.session_id {
            Some(session_id) => self
                .sessions
                .is_usable(session_id, now)
                .await
                .unwrap_or(false),
            None => false,
        };
        if !session_usable {
            return self.resolve_session_dead(strategy, execution, now).await;
        }

        // Proceed path.
        execution.status = DcaExecutionStatus::Running;
        self.db.update_dca_execution(&execution).await?;

        let record = self
            .executions
            .create(OwnerKind::DcaStrategy, &strategy.id, &strategy.owner_wallet)
            .await?;
        execution.execution_record_id = Some(record.id.clone());
        self.db.update_dca_execution(&execution).await?;

        let context = ExecutionContext::Dca {
            strategy_id: strategy.id.clone(),
            execution_number,
        };
        self.executions
            .set_steps(
                &record.id,
                vec![
                    ExecutionStep::new(
                        0,
                        format!("quote {} -> {}", strategy.token_in, strategy.token_out),
                        StepAction::Quote,
                    ),
                    ExecutionStep::new(
                        1,
                        format!(
                            "swap {} {} for {}",
                            strategy.amount_per_execution_usd, strategy.token_in, strategy.token_out
                        ),
                        StepAction::Swap,
                    ),
                ],
            )
            .await?;
        self.executions
            .transition(
                &record.id,
                ExecutionState::Analyzing,
                "tick",
                Some(format!("tick #{execution_number}")),
                Some(context.clone()),
            )
            .await?;
        self.executions
            .add_decision(
                &record.id,
                "guards",
                "proceed",
                &format!(
                    "gas {} within ceiling, price {} within band, session usable",
                    snapshot.gas_price_usd, snapshot.price_usd
                ),
            )
            .await?;

        // Quote from the external price service.
        let quote_request = QuoteRequest {
            chain_id: strategy.chain_id,
            token_in: strategy.token_in.clone(),
            token_out: strategy.token_out.clone(),
            amount_in_usd: strategy.amount_per_execution_usd,
            max_slippage_bps: strategy.guards.max_slippage_bps,
        };
        let quote = match self.market.quote(&quote_request).await {
            Ok(quote) => quote,
            Err(e) => {
                let message = format!("quote unavailable: {e}");
                self.executions
                    .fail(&record.id, &message, Some("quote_failed"), true)
                    .await?;
                return self.resolve_recoverable(strategy, execution, message, now).await;
            }
        };
        debug!(
            strategy = %strategy.id,
            quote_id = %quote.quote_id,
            quote_price = %quote.price_usd,
            valid_until = %quote.expires_at,
            "Quote received"
        );
        execution.quoted_amount_out = Some(quote.expected_amount_out);
        self.db.update_dca_execution(&execution).await?;
        self.executions
            .transition(
                &record.id,
                ExecutionState::Planning,
                "quote_received",
                Some(format!("expected out {}", quote.expected_amount_out)),
                Some(context.clone()),
            )
            .await?;

        // Global rate limit; deferral is a transient fault.
        if !self
            .limiter
            .try_acquire(&strategy.owner_wallet, ActionClass::Swap, now)
        {
            let message = "rate limit exceeded for wallet".to_string();
            self.executions
                .fail(&record.id, &message, Some("rate_limited"), true)
                .await?;
            return self.resolve_recoverable(strategy, execution, message, now).await;
        }

        // Atomic budget reserve against the session grant.
        let session_id = strategy.session_id.clone().unwrap_or_default();
        let scope = SpendScope {
            chain_id: Some(strategy.chain_id),
            contract: None,
            token: Some(strategy.token_out.clone()),
        };
        let metadata = UsageMetadata {
            action: Some(ActionClass::Swap),
            chain_id: Some(strategy.chain_id),
            tx_hash: None,
        };
        let decision = self
            .sessions
            .authorize_and_reserve(
                &session_id,
                now,
                strategy.amount_per_execution_usd,
                &scope,
                metadata,
            )
            .await?;
        if let ReserveDecision::Denied(denied) = decision {
            self.executions
                .transition(
                    &record.id,
                    ExecutionState::Cancelled,
                    "budget_denied",
                    Some(denied.to_string()),
                    Some(context.clone()),
                )
                .await?;
            warn!(strategy = %strategy.id, denied = %denied, "DCA budget reserve denied");
            return self.resolve_session_dead(strategy, execution, now).await;
        }

        self.executions
            .transition(
                &record.id,
                ExecutionState::Executing,
                "submitting",
                None,
                Some(context),
            )
            .await?;

        // Hand off to the chain-submission service; confirmation arrives
        // later through the callbacks, the engine holds nothing across it.
        let request = SubmitRequest {
            execution_record_id: record.id.clone(),
            wallet_address: strategy.owner_wallet.clone(),
            chain_id: strategy.chain_id,
            token_in: strategy.token_in.clone(),
            token_out: strategy.token_out.clone(),
            amount_usd: strategy.amount_per_execution_usd,
            min_amount_out: quote.min_amount_out,
            max_slippage_bps: strategy.guards.max_slippage_bps,
            max_gas_usd: strategy.guards.max_gas_usd,
        };
        match self.submitter.submit(&request).await {
            Ok(ack) => {
                info!(
                    strategy = %strategy.id,
                    execution = %execution.id,
                    reference = %ack.reference,
                    "DCA tick submitted"
                );
                Ok(TickOutcome::Submitted)
            }
            Err(e) if e.recoverable => {
                self.executions
                    .fail(&record.id, &e.message, Some("submit_failed"), true)
                    .await?;
                self.resolve_recoverable(strategy, execution, e.message, now).await
            }
            Err(e) => {
                self.executions
                    .fail(&record.id, &e.message, Some("submit_failed"), false)
                    .await?;
                self.resolve_fatal(strategy, execution, e.message, now).await
            }
        }
    }

    // ==================== Resolution paths ====================

    /// Reschedule or complete the strategy after a resolved tick.
    fn finish_schedule(&self, strategy: &mut DcaStrategy, now: DateTime<Utc>) {
        if strategy.stop_condition_met(now) {
            strategy.status = DcaStatus::Completed;
            strategy.next_execution_at = None;
            info!(strategy = %strategy.id, "DCA strategy completed");
        } else {
            strategy.next_execution_at = Some(strategy.frequency.next_from(now));
        }
        strategy.updated_at = now;
    }

    async fn resolve_skip(
        &self,
        mut strategy: DcaStrategy,
        mut execution: DcaExecution,
        reason: DcaSkipReason,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        execution.status = DcaExecutionStatus::Skipped;
        execution.skip_reason = Some(reason);
        execution.error = Some(reason.human_readable().to_string());
        execution.resolved_at = Some(now);
        self.db.update_dca_execution(&execution).await?;

        // Skips keep the schedule running and do not consume the execution
        // budget.
        strategy.stats.total_executions += 1;
        strategy.stats.skipped_executions += 1;
        self.finish_schedule(&mut strategy, now);
        self.db.update_dca_strategy(&strategy).await?;

        Ok(TickOutcome::Skipped(reason))
    }

    /// Session unusable: the tick skips and the strategy itself expires so
    /// it is not reselected.
    async fn resolve_session_dead(
        &self,
        mut strategy: DcaStrategy,
        mut execution: DcaExecution,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        execution.status = DcaExecutionStatus::Skipped;
        execution.skip_reason = Some(DcaSkipReason::SessionExpired);
        execution.error = Some(DcaSkipReason::SessionExpired.human_readable().to_string());
        execution.resolved_at = Some(now);
        self.db.update_dca_execution(&execution).await?;

        strategy.stats.total_executions += 1;
        strategy.stats.skipped_executions += 1;
        strategy.status = DcaStatus::Expired;
        strategy.next_execution_at = None;
        strategy.last_error = Some("session key is no longer usable".to_string());
        strategy.updated_at = now;
        self.db.update_dca_strategy(&strategy).await?;

        warn!(strategy = %strategy.id, "DCA strategy expired with its session");
        Ok(TickOutcome::Skipped(DcaSkipReason::SessionExpired))
    }

    async fn resolve_recoverable(
        &self,
        mut strategy: DcaStrategy,
        mut execution: DcaExecution,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        warn!(strategy = %strategy.id, error = %message, "DCA tick failed (recoverable)");

        execution.status = DcaExecutionStatus::Failed;
        execution.error = Some(message);
        execution.resolved_at = Some(now);
        self.db.update_dca_execution(&execution).await?;

        strategy.stats.total_executions += 1;
        strategy.stats.failed_executions += 1;
        self.finish_schedule(&mut strategy, now);
        self.db.update_dca_strategy(&strategy).await?;

        Ok(TickOutcome::FailedRecoverable)
    }

    async fn resolve_fatal(
        &self,
        mut strategy: DcaStrategy,
        mut execution: DcaExecution,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        error!(strategy = %strategy.id, error = %message, "DCA strategy failed");

        execution.status = DcaExecutionStatus::Failed;
        execution.error = Some(message.clone());
        execution.resolved_at = Some(now);
        self.db.update_dca_execution(&execution).await?;

        strategy.stats.total_executions += 1;
        strategy.stats.failed_executions += 1;
        strategy.status = DcaStatus::Failed;
        strategy.next_execution_at = None;
        strategy.last_error = Some(message);
        strategy.updated_at = now;
        self.db.update_dca_strategy(&strategy).await?;

        Ok(TickOutcome::FailedFatal)
    }

    // ==================== Chain-submission callbacks ====================

    /// The submission service broadcast the tick's transaction.
    pub async fn on_submitted(&self, execution_id: &str, tx_hash: &str) -> Result<()> {
        let mut execution = self.db.get_dca_execution(execution_id).await?;
        if execution.status != DcaExecutionStatus::Running {
            bail!(
                "dca execution {} is {}, not running",
                execution_id,
                execution.status.as_str()
            );
        }
        execution.tx_hash = Some(tx_hash.to_string());
        self.db.update_dca_execution(&execution).await?;

        if let Some(record_id) = &execution.execution_record_id {
            self.executions.mark_submitted(record_id, tx_hash).await?;
        }
        Ok(())
    }

    /// The tick's transaction confirmed: fold actuals into the running
    /// stats and advance or complete the schedule.
    pub async fn on_confirmed(
        &self,
        execution_id: &str,
        spent_usd: Decimal,
        tokens_acquired: Decimal,
        gas_used_usd: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut execution = self.db.get_dca_execution(execution_id).await?;
        if execution.status != DcaExecutionStatus::Running {
            bail!(
                "dca execution {} is {}, not running",
                execution_id,
                execution.status.as_str()
            );
        }

        execution.status = DcaExecutionStatus::Completed;
        execution.spent_usd = Some(spent_usd);
        execution.tokens_acquired = Some(tokens_acquired);
        if !tokens_acquired.is_zero() {
            execution.actual_price_usd = Some(spent_usd / tokens_acquired);
        }
        execution.resolved_at = Some(now);
        self.db.update_dca_execution(&execution).await?;

        if let Some(record_id) = &execution.execution_record_id {
            self.executions.mark_confirmed(record_id, gas_used_usd).await?;
        }

        let mut strategy = self.db.get_dca_strategy(&execution.strategy_id).await?;
        strategy.stats.record_fill(spent_usd, tokens_acquired);
        strategy.last_executed_at = Some(now);
        self.finish_schedule(&mut strategy, now);
        self.db.update_dca_strategy(&strategy).await?;

        info!(
            strategy = %strategy.id,
            execution = %execution_id,
            spent = %spent_usd,
            acquired = %tokens_acquired,
            avg_price = ?strategy.stats.average_price_usd,
            "DCA tick confirmed"
        );
        Ok(())
    }

    /// The tick's transaction failed after submission.
    pub async fn on_failed(
        &self,
        execution_id: &str,
        error: &str,
        recoverable: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let execution = self.db.get_dca_execution(execution_id).await?;
        if execution.status != DcaExecutionStatus::Running {
            bail!(
                "dca execution {} is {}, not running",
                execution_id,
                execution.status.as_str()
            );
        }

        if let Some(record_id) = &execution.execution_record_id {
            self.executions.mark_failed(record_id, error, recoverable).await?;
        }

        let strategy = self.db.get_dca_strategy(&execution.strategy_id).await?;
        if recoverable {
            self.resolve_recoverable(strategy, execution, error.to_string(), now)
                .await?;
        } else {
            self.resolve_fatal(strategy, execution, error.to_string(), now)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MarketSnapshot, SimulatedSubmitter, SubmissionAck, SubmitError, SwapQuote};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct StaticMarket {
        price: Decimal,
        gas: Decimal,
    }

    impl MarketDataSource for StaticMarket {
        async fn snapshot(&self, chain_id: i64, token: &str) -> Result<MarketSnapshot> {
            Ok(MarketSnapshot {
                chain_id,
                token: token.to_string(),
                price_usd: self.price,
                gas_price_usd: self.gas,
                captured_at: Utc::now(),
            })
        }

        async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote> {
            let expected = request.amount_in_usd / self.price;
            Ok(SwapQuote {
                quote_id: "q-1".to_string(),
                expected_amount_out: expected,
                min_amount_out: expected * dec!(0.99),
                price_usd: self.price,
                expires_at: Utc::now() + Duration::minutes(1),
            })
        }
    }

    struct FailingSubmitter {
        recoverable: bool,
    }

    impl ChainSubmitter for FailingSubmitter {
        async fn submit(&self, _request: &SubmitRequest) -> Result<SubmissionAck, SubmitError> {
            if self.recoverable {
                Err(SubmitError::transient("rpc unavailable"))
            } else {
                Err(SubmitError::fatal("nonce permanently burned"))
            }
        }
    }

    struct Harness<C> {
        scheduler: DcaScheduler<StaticMarket, C>,
        sessions: Arc<SessionEnforcer>,
    }

    async fn harness<C: ChainSubmitter>(price: Decimal, gas: Decimal, submitter: C) -> Harness<C> {
        let db = Arc::new(Database::in_memory().await.expect("db"));
        let executions = Arc::new(ExecutionStore::new(db.clone()));
        let sessions = Arc::new(SessionEnforcer::new(db.clone()));
        let limiter = Arc::new(RateLimiter::new(Default::default()));
        let scheduler = DcaScheduler::new(
            db,
            executions,
            sessions.clone(),
            limiter,
            StaticMarket { price, gas },
            submitter,
            DcaConfig::default(),
        );
        Harness {
            scheduler,
            sessions,
        }
    }

    async fn make_session(sessions: &SessionEnforcer, total: Decimal) -> String {
        sessions
            .create(crate::session::NewSessionKey {
                wallet_address: "0xwallet".to_string(),
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

    fn strategy_params(session_id: Option<String>, stops: DcaStopConditions) -> NewDcaStrategy {
        NewDcaStrategy {
            owner_wallet: "0xwallet".to_string(),
            session_id,
            chain_id: 8453,
            token_in: "USDC".to_string(),
            token_out: "WETH".to_string(),
            amount_per_execution_usd: dec!(50),
            frequency: DcaFrequency::Hourly,
            guards: DcaGuards::default(),
            stop_conditions: stops,
        }
    }

    async fn activate(
        h: &Harness<impl ChainSubmitter>,
        params: NewDcaStrategy,
        now: DateTime<Utc>,
    ) -> DcaStrategy {
        let strategy = h.scheduler.create(params).await.unwrap();
        h.scheduler.activate(&strategy.id, now).await.unwrap()
    }

    async fn latest_execution(
        h: &Harness<impl ChainSubmitter>,
        strategy_id: &str,
    ) -> DcaExecution {
        h.scheduler
            .executions(strategy_id, 1)
            .await
            .unwrap()
            .into_iter()
            .next()
            .expect("execution")
    }

    #[tokio::test]
    async fn completes_after_max_executions_and_clears_schedule() {
        let h = harness(dec!(10), dec!(1), SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let mut now = Utc::now();
        let strategy = activate(
            &h,
            strategy_params(
                Some(session_id),
                DcaStopConditions {
                    max_executions: Some(3),
                    ..Default::default()
                },
            ),
            now,
        )
        .await;
        assert_eq!(strategy.status, DcaStatus::Active);

        for tick in 1..=3 {
            let summary = h.scheduler.tick(now).await.unwrap();
            assert_eq!(summary.submitted, 1, "tick {tick} should submit");

            let execution = latest_execution(&h, &strategy.id).await;
            h.scheduler
                .on_submitted(&execution.id, "0xhash")
                .await
                .unwrap();
            h.scheduler
                .on_confirmed(&execution.id, dec!(50), dec!(5), None, now)
                .await
                .unwrap();

            now += Duration::hours(2);
        }

        let strategy = h.scheduler.get(&strategy.id).await.unwrap();
        assert_eq!(strategy.status, DcaStatus::Completed);
        assert!(strategy.next_execution_at.is_none());
        assert_eq!(strategy.stats.successful_executions, 3);
        assert_eq!(strategy.stats.total_amount_spent_usd, dec!(150));

        // Completed strategies are never reselected.
        let summary = h.scheduler.tick(now).await.unwrap();
        assert_eq!(summary.selected, 0);
    }

    #[tokio::test]
    async fn average_price_is_cumulative_across_fills() {
        let h = harness(dec!(10), dec!(1), SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let mut now = Utc::now();
        let strategy =
            activate(&h, strategy_params(Some(session_id), Default::default()), now).await;

        // $100 buys 10 tokens, then $100 buys 40 tokens.
        for (spent, tokens) in [(dec!(100), dec!(10)), (dec!(100), dec!(40))] {
            h.scheduler.tick(now).await.unwrap();
            let execution = latest_execution(&h, &strategy.id).await;
            h.scheduler
                .on_confirmed(&execution.id, spent, tokens, None, now)
                .await
                .unwrap();
            now += Duration::hours(2);
        }

        let strategy = h.scheduler.get(&strategy.id).await.unwrap();
        assert_eq!(strategy.stats.average_price_usd, Some(dec!(4)));
    }

    #[tokio::test]
    async fn gas_guard_skips_and_schedule_continues() {
        let h = harness(dec!(10), dec!(25), SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let now = Utc::now();

        let mut params = strategy_params(Some(session_id), Default::default());
        params.guards.skip_if_gas_above_usd = Some(dec!(20));
        let strategy = activate(&h, params, now).await;

        let summary = h.scheduler.tick(now).await.unwrap();
        assert_eq!(summary.skipped, 1);

        let execution = latest_execution(&h, &strategy.id).await;
        assert_eq!(execution.status, DcaExecutionStatus::Skipped);
        assert_eq!(execution.skip_reason, Some(DcaSkipReason::GasTooHigh));
        assert!(execution.execution_record_id.is_none());

        let strategy = h.scheduler.get(&strategy.id).await.unwrap();
        assert_eq!(strategy.status, DcaStatus::Active);
        assert_eq!(strategy.stats.skipped_executions, 1);
        assert_eq!(strategy.stats.successful_executions, 0);
        // Schedule advanced past now.
        assert!(strategy.next_execution_at.unwrap() > now);
    }

    #[tokio::test]
    async fn price_band_guards_skip_in_both_directions() {
        let now = Utc::now();

        // Price above the band.
        let h = harness(dec!(110), dec!(1), SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let mut params = strategy_params(Some(session_id), Default::default());
        params.guards.pause_if_price_above_usd = Some(dec!(100));
        params.guards.pause_if_price_below_usd = Some(dec!(50));
        let strategy = activate(&h, params, now).await;
        h.scheduler.tick(now).await.unwrap();
        let execution = latest_execution(&h, &strategy.id).await;
        assert_eq!(execution.skip_reason, Some(DcaSkipReason::PriceAboveLimit));

        // Price below the band.
        let h = harness(dec!(40), dec!(1), SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let mut params = strategy_params(Some(session_id), Default::default());
        params.guards.pause_if_price_above_usd = Some(dec!(100));
        params.guards.pause_if_price_below_usd = Some(dec!(50));
        let strategy = activate(&h, params, now).await;
        h.scheduler.tick(now).await.unwrap();
        let execution = latest_execution(&h, &strategy.id).await;
        assert_eq!(execution.skip_reason, Some(DcaSkipReason::PriceBelowLimit));
    }

    #[tokio::test]
    async fn exhausted_session_expires_the_strategy() {
        let h = harness(dec!(10), dec!(1), SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(100)).await;
        let now = Utc::now();
        let strategy =
            activate(&h, strategy_params(Some(session_id.clone()), Default::default()), now).await;

        // Drain the whole budget out-of-band.
        let decision = h
            .sessions
            .authorize_and_reserve(
                &session_id,
                now,
                dec!(100),
                &SpendScope::default(),
                UsageMetadata::default(),
            )
            .await
            .unwrap();
        assert!(decision.is_reserved());

        // The next due tick finds the session exhausted.
        let summary = h.scheduler.tick(now).await.unwrap();
        assert_eq!(summary.skipped, 1);

        let execution = latest_execution(&h, &strategy.id).await;
        assert_eq!(execution.skip_reason, Some(DcaSkipReason::SessionExpired));

        let strategy = h.scheduler.get(&strategy.id).await.unwrap();
        assert_eq!(strategy.status, DcaStatus::Expired);
        assert!(strategy.next_execution_at.is_none());
    }

    #[tokio::test]
    async fn single_flight_blocks_reselection_until_resolution() {
        let h = harness(dec!(10), dec!(1), SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let now = Utc::now();
        let strategy =
            activate(&h, strategy_params(Some(session_id), Default::default()), now).await;

        let summary = h.scheduler.tick(now).await.unwrap();
        assert_eq!(summary.submitted, 1);

        // The execution is unresolved: even far past the due time, the
        // strategy must not be reselected.
        let summary = h.scheduler.tick(now + Duration::days(1)).await.unwrap();
        assert_eq!(summary.selected, 0);

        // Resolution unblocks the schedule.
        let execution = latest_execution(&h, &strategy.id).await;
        h.scheduler
            .on_confirmed(&execution.id, dec!(50), dec!(5), None, now)
            .await
            .unwrap();
        let summary = h.scheduler.tick(now + Duration::days(1)).await.unwrap();
        assert_eq!(summary.selected, 1);
    }

    #[tokio::test]
    async fn unrecoverable_submit_error_fails_the_strategy() {
        let h = harness(dec!(10), dec!(1), FailingSubmitter { recoverable: false }).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let now = Utc::now();
        let strategy =
            activate(&h, strategy_params(Some(session_id), Default::default()), now).await;

        h.scheduler.tick(now).await.unwrap();

        let strategy = h.scheduler.get(&strategy.id).await.unwrap();
        assert_eq!(strategy.status, DcaStatus::Failed);
        assert!(strategy.next_execution_at.is_none());
        assert!(strategy.last_error.as_deref().unwrap().contains("nonce"));
    }

    #[tokio::test]
    async fn recoverable_submit_error_keeps_strategy_active() {
        let h = harness(dec!(10), dec!(1), FailingSubmitter { recoverable: true }).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let now = Utc::now();
        let strategy =
            activate(&h, strategy_params(Some(session_id), Default::default()), now).await;

        h.scheduler.tick(now).await.unwrap();

        let execution = latest_execution(&h, &strategy.id).await;
        assert_eq!(execution.status, DcaExecutionStatus::Failed);

        let strategy = h.scheduler.get(&strategy.id).await.unwrap();
        assert_eq!(strategy.status, DcaStatus::Active);
        assert!(strategy.next_execution_at.is_some());
        assert_eq!(strategy.stats.failed_executions, 1);
    }

    #[tokio::test]
    async fn update_config_requires_draft_or_paused() {
        let h = harness(dec!(10), dec!(1), SimulatedSubmitter).await;
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        let now = Utc::now();

        let strategy = h
            .scheduler
            .create(strategy_params(Some(session_id), Default::default()))
            .await
            .unwrap();

        // Draft: allowed.
        let updated = h
            .scheduler
            .update_config(
                &strategy.id,
                DcaStrategyPatch {
                    amount_per_execution_usd: Some(dec!(75)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.amount_per_execution_usd, dec!(75));

        // Active: rejected.
        h.scheduler.activate(&strategy.id, now).await.unwrap();
        assert!(h
            .scheduler
            .update_config(
                &strategy.id,
                DcaStrategyPatch {
                    amount_per_execution_usd: Some(dec!(80)),
                    ..Default::default()
                },
            )
            .await
            .is_err());

        // Paused: allowed again.
        h.scheduler.pause(&strategy.id).await.unwrap();
        assert!(h
            .scheduler
            .update_config(
                &strategy.id,
                DcaStrategyPatch {
                    frequency: Some(DcaFrequency::Weekly),
                    ..Default::default()
                },
            )
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn activation_without_session_parks_pending() {
        let h = harness(dec!(10), dec!(1), SimulatedSubmitter).await;
        let now = Utc::now();
        let strategy = h
            .scheduler
            .create(strategy_params(None, Default::default()))
            .await
            .unwrap();

        let strategy = h.scheduler.activate(&strategy.id, now).await.unwrap();
        assert_eq!(strategy.status, DcaStatus::PendingSession);
        assert!(strategy.next_execution_at.is_none());

        // Attaching a usable session makes activation succeed.
        let session_id = make_session(&h.sessions, dec!(10000)).await;
        h.scheduler
            .attach_session(&strategy.id, &session_id)
            .await
            .unwrap();
        let strategy = h.scheduler.activate(&strategy.id, now).await.unwrap();
        assert_eq!(strategy.status, DcaStatus::Active);
    }
}
