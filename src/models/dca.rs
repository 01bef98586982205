//! DCA strategy and execution models: recurring fixed-budget purchases.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a DCA strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcaStatus {
    Draft,
    PendingSession,
    Active,
    Paused,
    Completed,
    Failed,
    Expired,
}

impl DcaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DcaStatus::Draft => "draft",
            DcaStatus::PendingSession => "pending_session",
            DcaStatus::Active => "active",
            DcaStatus::Paused => "paused",
            DcaStatus::Completed => "completed",
            DcaStatus::Failed => "failed",
            DcaStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(DcaStatus::Draft),
            "pending_session" => Some(DcaStatus::PendingSession),
            "active" => Some(DcaStatus::Active),
            "paused" => Some(DcaStatus::Paused),
            "completed" => Some(DcaStatus::Completed),
            "failed" => Some(DcaStatus::Failed),
            "expired" => Some(DcaStatus::Expired),
            _ => None,
        }
    }

    /// Config updates are legal only before activation or while paused.
    pub fn allows_config_update(&self) -> bool {
        matches!(self, DcaStatus::Draft | DcaStatus::Paused)
    }
}

impl std::fmt::Display for DcaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How often a strategy executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcaFrequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl DcaFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            DcaFrequency::Hourly => "hourly",
            DcaFrequency::Daily => "daily",
            DcaFrequency::Weekly => "weekly",
            DcaFrequency::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(DcaFrequency::Hourly),
            "daily" => Some(DcaFrequency::Daily),
            "weekly" => Some(DcaFrequency::Weekly),
            "monthly" => Some(DcaFrequency::Monthly),
            _ => None,
        }
    }

    /// Next run time computed from the moment a tick resolved.
    pub fn next_from(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            DcaFrequency::Hourly => after + Duration::hours(1),
            DcaFrequency::Daily => after + Duration::days(1),
            DcaFrequency::Weekly => after + Duration::weeks(1),
            DcaFrequency::Monthly => after + Duration::days(30),
        }
    }
}

/// Pre-trade guards evaluated in order on every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaGuards {
    pub max_slippage_bps: i64,
    /// Hard gas bound passed through to submission.
    pub max_gas_usd: Option<Decimal>,
    /// Skip the tick when the gas estimate is above this.
    pub skip_if_gas_above_usd: Option<Decimal>,
    pub pause_if_price_above_usd: Option<Decimal>,
    pub pause_if_price_below_usd: Option<Decimal>,
}

impl Default for DcaGuards {
    fn default() -> Self {
        Self {
            max_slippage_bps: 100, // 1%
            max_gas_usd: None,
            skip_if_gas_above_usd: None,
            pause_if_price_above_usd: None,
            pause_if_price_below_usd: None,
        }
    }
}

/// Independent stop conditions; meeting any one completes the strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DcaStopConditions {
    pub max_total_spend_usd: Option<Decimal>,
    pub max_executions: Option<i64>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Running statistics accumulated across completed ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaStats {
    pub total_executions: i64,
    pub successful_executions: i64,
    pub failed_executions: i64,
    pub skipped_executions: i64,
    pub total_amount_spent_usd: Decimal,
    pub total_tokens_acquired: Decimal,
    /// Cumulative: total spent over total acquired, never an average of
    /// per-tick averages.
    pub average_price_usd: Option<Decimal>,
}

impl Default for DcaStats {
    fn default() -> Self {
        Self {
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            skipped_executions: 0,
            total_amount_spent_usd: Decimal::ZERO,
            total_tokens_acquired: Decimal::ZERO,
            average_price_usd: None,
        }
    }
}

impl DcaStats {
    /// Fold one confirmed fill into the running totals.
    pub fn record_fill(&mut self, spent_usd: Decimal, tokens_acquired: Decimal) {
        self.total_executions += 1;
        self.successful_executions += 1;
        self.total_amount_spent_usd += spent_usd;
        self.total_tokens_acquired += tokens_acquired;
        if !self.total_tokens_acquired.is_zero() {
            self.average_price_usd =
                Some(self.total_amount_spent_usd / self.total_tokens_acquired);
        }
    }
}

/// A recurring fixed-budget purchase schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaStrategy {
    pub id: String,
    pub owner_wallet: String,
    pub session_id: Option<String>,

    pub chain_id: i64,
    /// Token spent each tick (the budget denomination).
    pub token_in: String,
    /// Token acquired each tick.
    pub token_out: String,
    pub amount_per_execution_usd: Decimal,

    pub frequency: DcaFrequency,
    pub next_execution_at: Option<DateTime<Utc>>,

    pub guards: DcaGuards,
    pub stop_conditions: DcaStopConditions,
    pub stats: DcaStats,

    pub status: DcaStatus,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DcaStrategy {
    /// True when a stop condition has been met after a resolved tick.
    pub fn stop_condition_met(&self, now: DateTime<Utc>) -> bool {
        if let Some(max) = self.stop_conditions.max_executions {
            if self.stats.successful_executions >= max {
                return true;
            }
        }
        if let Some(cap) = self.stop_conditions.max_total_spend_usd {
            if self.stats.total_amount_spent_usd >= cap {
                return true;
            }
        }
        if let Some(end) = self.stop_conditions.end_date {
            if now >= end {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcaExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl DcaExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DcaExecutionStatus::Pending => "pending",
            DcaExecutionStatus::Running => "running",
            DcaExecutionStatus::Completed => "completed",
            DcaExecutionStatus::Failed => "failed",
            DcaExecutionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DcaExecutionStatus::Pending),
            "running" => Some(DcaExecutionStatus::Running),
            "completed" => Some(DcaExecutionStatus::Completed),
            "failed" => Some(DcaExecutionStatus::Failed),
            "skipped" => Some(DcaExecutionStatus::Skipped),
            _ => None,
        }
    }
}

/// Why a tick was skipped instead of executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcaSkipReason {
    GasTooHigh,
    PriceAboveLimit,
    PriceBelowLimit,
    SessionExpired,
}

impl DcaSkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DcaSkipReason::GasTooHigh => "gas_too_high",
            DcaSkipReason::PriceAboveLimit => "price_above_limit",
            DcaSkipReason::PriceBelowLimit => "price_below_limit",
            DcaSkipReason::SessionExpired => "session_expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gas_too_high" => Some(DcaSkipReason::GasTooHigh),
            "price_above_limit" => Some(DcaSkipReason::PriceAboveLimit),
            "price_below_limit" => Some(DcaSkipReason::PriceBelowLimit),
            "session_expired" => Some(DcaSkipReason::SessionExpired),
            _ => None,
        }
    }

    pub fn human_readable(&self) -> &'static str {
        match self {
            DcaSkipReason::GasTooHigh => "gas price above the configured ceiling",
            DcaSkipReason::PriceAboveLimit => "token price above the configured band",
            DcaSkipReason::PriceBelowLimit => "token price below the configured band",
            DcaSkipReason::SessionExpired => "session key is no longer usable",
        }
    }
}

/// One scheduled evaluation/execution attempt of a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaExecution {
    pub id: String,
    pub strategy_id: String,
    /// Monotonic per strategy, skipped ticks included.
    pub execution_number: i64,
    pub status: DcaExecutionStatus,
    pub skip_reason: Option<DcaSkipReason>,

    // Market snapshot at evaluation time.
    pub token_price_usd: Option<Decimal>,
    pub gas_price_usd: Option<Decimal>,

    // Quote and fill actuals.
    pub quoted_amount_out: Option<Decimal>,
    pub spent_usd: Option<Decimal>,
    pub tokens_acquired: Option<Decimal>,
    pub actual_price_usd: Option<Decimal>,
    pub tx_hash: Option<String>,

    pub error: Option<String>,
    pub execution_record_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn average_price_is_cumulative() {
        let mut stats = DcaStats::default();
        // Two fills at very different prices: $100 for 10 tokens ($10),
        // then $100 for 40 tokens ($2.50).
        stats.record_fill(dec!(100), dec!(10));
        stats.record_fill(dec!(100), dec!(40));

        // Cumulative: 200 / 50 = 4. An average-of-averages would say 6.25.
        assert_eq!(stats.average_price_usd, Some(dec!(4)));
        assert_eq!(stats.total_amount_spent_usd, dec!(200));
        assert_eq!(stats.total_tokens_acquired, dec!(50));
    }

    #[test]
    fn average_price_is_order_independent() {
        let fills = [
            (dec!(30), dec!(3)),
            (dec!(100), dec!(40)),
            (dec!(70), dec!(7)),
        ];

        let mut forward = DcaStats::default();
        for (s, t) in fills {
            forward.record_fill(s, t);
        }
        let mut reverse = DcaStats::default();
        for (s, t) in fills.iter().rev() {
            reverse.record_fill(s.to_owned(), t.to_owned());
        }
        assert_eq!(forward.average_price_usd, reverse.average_price_usd);
    }

    #[test]
    fn stop_conditions_are_independent() {
        let now = Utc::now();
        let mut strategy = DcaStrategy {
            id: "dca-1".to_string(),
            owner_wallet: "0xwallet".to_string(),
            session_id: None,
            chain_id: 8453,
            token_in: "USDC".to_string(),
            token_out: "WETH".to_string(),
            amount_per_execution_usd: dec!(50),
            frequency: DcaFrequency::Daily,
            next_execution_at: Some(now),
            guards: DcaGuards::default(),
            stop_conditions: DcaStopConditions {
                max_total_spend_usd: Some(dec!(150)),
                max_executions: Some(5),
                end_date: None,
            },
            stats: DcaStats::default(),
            status: DcaStatus::Active,
            last_executed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        assert!(!strategy.stop_condition_met(now));
        strategy.stats.record_fill(dec!(50), dec!(1));
        strategy.stats.record_fill(dec!(50), dec!(1));
        assert!(!strategy.stop_condition_met(now));
        strategy.stats.record_fill(dec!(50), dec!(1));
        // Spend cap reached before the execution cap.
        assert!(strategy.stop_condition_met(now));
    }

    #[test]
    fn frequency_advances_from_resolution_time() {
        let t = Utc::now();
        assert_eq!(DcaFrequency::Hourly.next_from(t), t + Duration::hours(1));
        assert_eq!(DcaFrequency::Weekly.next_from(t), t + Duration::weeks(1));
    }
}
