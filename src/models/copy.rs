//! Copy-trading models: follower/leader relationships and replicated trades.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::session::ActionClass;

/// How a follower's order size is derived from the leader's trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    /// Leader trade value scaled by `size_value` percent.
    Percentage,
    /// Always `size_value` USD.
    Fixed,
    /// `size_value` percent of the follower's portfolio value.
    Proportional,
}

impl SizingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizingMode::Percentage => "percentage",
            SizingMode::Fixed => "fixed",
            SizingMode::Proportional => "proportional",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "percentage" => Some(SizingMode::Percentage),
            "fixed" => Some(SizingMode::Fixed),
            "proportional" => Some(SizingMode::Proportional),
            _ => None,
        }
    }
}

/// A watched trade by a leader address, as reported by the event ingester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderSignal {
    pub leader_address: String,
    pub chain_id: i64,
    pub action: ActionClass,
    pub token_in: String,
    pub token_out: String,
    pub amount_in: Option<Decimal>,
    pub amount_out: Option<Decimal>,
    /// Observed USD value of the leader's trade.
    pub value_usd: Decimal,
    pub tx_hash: String,
    pub observed_at: DateTime<Utc>,
}

/// One follower-to-leader replication rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyRelationship {
    pub id: String,
    pub follower_wallet: String,
    pub leader_address: String,
    pub session_id: Option<String>,

    pub sizing_mode: SizingMode,
    /// Percent for percentage/proportional modes, USD for fixed mode.
    pub size_value: Decimal,
    pub min_trade_usd: Decimal,
    pub max_trade_usd: Decimal,

    /// Empty whitelist means any token not blacklisted.
    pub allowed_tokens: Vec<String>,
    pub blocked_tokens: Vec<String>,
    pub allowed_actions: Vec<ActionClass>,

    pub delay_seconds: i64,
    pub max_delay_seconds: i64,
    pub max_slippage_bps: i64,

    pub max_daily_trades: Option<i64>,
    pub max_daily_volume_usd: Option<Decimal>,
    pub daily_trade_count: i64,
    pub daily_volume_usd: Decimal,
    pub daily_reset_at: DateTime<Utc>,

    pub total_trades: i64,
    pub successful_trades: i64,
    pub failed_trades: i64,
    pub skipped_trades: i64,
    pub total_volume_usd: Decimal,

    /// Manual mode: every replicated trade waits for operator approval.
    pub requires_approval: bool,
    pub is_active: bool,
    pub is_paused: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CopyRelationship {
    /// Roll the daily window. Zeroes the counters and advances the watermark
    /// in whole-day steps once `now` has passed it; a second invocation
    /// within the same window is a no-op. Returns true when counters were
    /// reset.
    pub fn roll_daily_window(&mut self, now: DateTime<Utc>) -> bool {
        if now < self.daily_reset_at {
            return false;
        }
        self.daily_trade_count = 0;
        self.daily_volume_usd = Decimal::ZERO;
        while self.daily_reset_at <= now {
            self.daily_reset_at = self.daily_reset_at + Duration::days(1);
        }
        true
    }

    /// Derive the follower's order size from a leader trade, clamped to the
    /// max bound. Sizes below the min bound are the caller's gate to skip: a
    /// follower is never sized up past the leader's intent.
    pub fn size_trade(&self, leader_value_usd: Decimal, portfolio_usd: Decimal) -> Decimal {
        let raw = match self.sizing_mode {
            SizingMode::Percentage => leader_value_usd * self.size_value / dec!(100),
            SizingMode::Fixed => self.size_value,
            SizingMode::Proportional => portfolio_usd * self.size_value / dec!(100),
        };
        raw.min(self.max_trade_usd)
    }

    /// Effective submission delay, clamped to the configured maximum.
    pub fn effective_delay(&self) -> Duration {
        Duration::seconds(self.delay_seconds.min(self.max_delay_seconds).max(0))
    }

    pub fn allows_action(&self, action: ActionClass) -> bool {
        self.allowed_actions.is_empty() || self.allowed_actions.contains(&action)
    }

    /// Token filter: blacklist wins over whitelist; an empty whitelist
    /// admits any non-blacklisted token.
    pub fn allows_token(&self, token: &str) -> bool {
        if self.blocked_tokens.iter().any(|t| t.eq_ignore_ascii_case(token)) {
            return false;
        }
        self.allowed_tokens.is_empty()
            || self.allowed_tokens.iter().any(|t| t.eq_ignore_ascii_case(token))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl CopyExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyExecutionStatus::Pending => "pending",
            CopyExecutionStatus::Running => "running",
            CopyExecutionStatus::Completed => "completed",
            CopyExecutionStatus::Failed => "failed",
            CopyExecutionStatus::Skipped => "skipped",
            CopyExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CopyExecutionStatus::Pending),
            "running" => Some(CopyExecutionStatus::Running),
            "completed" => Some(CopyExecutionStatus::Completed),
            "failed" => Some(CopyExecutionStatus::Failed),
            "skipped" => Some(CopyExecutionStatus::Skipped),
            "cancelled" => Some(CopyExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

/// Why a signal was not replicated. The first failing gate wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopySkipReason {
    ActionNotAllowed,
    TokenNotAllowed,
    DailyTradeCapReached,
    DailyVolumeCapReached,
    TradeSizeOutOfBounds,
    SessionExpired,
}

impl CopySkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopySkipReason::ActionNotAllowed => "action_not_allowed",
            CopySkipReason::TokenNotAllowed => "token_not_allowed",
            CopySkipReason::DailyTradeCapReached => "daily_trade_cap_reached",
            CopySkipReason::DailyVolumeCapReached => "daily_volume_cap_reached",
            CopySkipReason::TradeSizeOutOfBounds => "trade_size_out_of_bounds",
            CopySkipReason::SessionExpired => "session_expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "action_not_allowed" => Some(CopySkipReason::ActionNotAllowed),
            "token_not_allowed" => Some(CopySkipReason::TokenNotAllowed),
            "daily_trade_cap_reached" => Some(CopySkipReason::DailyTradeCapReached),
            "daily_volume_cap_reached" => Some(CopySkipReason::DailyVolumeCapReached),
            "trade_size_out_of_bounds" => Some(CopySkipReason::TradeSizeOutOfBounds),
            "session_expired" => Some(CopySkipReason::SessionExpired),
            _ => None,
        }
    }

    pub fn human_readable(&self) -> &'static str {
        match self {
            CopySkipReason::ActionNotAllowed => "action is not allowed by the relationship",
            CopySkipReason::TokenNotAllowed => "token is filtered by the relationship",
            CopySkipReason::DailyTradeCapReached => "daily trade cap reached",
            CopySkipReason::DailyVolumeCapReached => "daily volume cap reached",
            CopySkipReason::TradeSizeOutOfBounds => "sized trade is below the minimum",
            CopySkipReason::SessionExpired => "session key is no longer usable",
        }
    }
}

/// One replication attempt derived from a leader signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyExecution {
    pub id: String,
    pub relationship_id: String,

    // Originating signal.
    pub leader_address: String,
    pub leader_tx_hash: String,
    pub chain_id: i64,
    pub action: ActionClass,
    pub token_in: String,
    pub token_out: String,
    pub leader_value_usd: Decimal,

    pub status: CopyExecutionStatus,
    pub skip_reason: Option<CopySkipReason>,

    pub calculated_size_usd: Option<Decimal>,
    pub actual_size_usd: Option<Decimal>,
    pub actual_price_usd: Option<Decimal>,
    pub gas_used_usd: Option<Decimal>,
    pub slippage_bps: Option<i64>,

    /// Earliest submission time for delayed autonomous executions.
    pub execute_after: Option<DateTime<Utc>>,
    pub execution_record_id: Option<String>,
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relationship(now: DateTime<Utc>) -> CopyRelationship {
        CopyRelationship {
            id: "rel-1".to_string(),
            follower_wallet: "0xfollower".to_string(),
            leader_address: "0xleader".to_string(),
            session_id: None,
            sizing_mode: SizingMode::Percentage,
            size_value: dec!(10),
            min_trade_usd: dec!(5),
            max_trade_usd: dec!(200),
            allowed_tokens: vec![],
            blocked_tokens: vec![],
            allowed_actions: vec![ActionClass::Swap],
            delay_seconds: 30,
            max_delay_seconds: 300,
            max_slippage_bps: 100,
            max_daily_trades: Some(2),
            max_daily_volume_usd: Some(dec!(500)),
            daily_trade_count: 0,
            daily_volume_usd: Decimal::ZERO,
            daily_reset_at: now + Duration::days(1),
            total_trades: 0,
            successful_trades: 0,
            failed_trades: 0,
            skipped_trades: 0,
            total_volume_usd: Decimal::ZERO,
            requires_approval: false,
            is_active: true,
            is_paused: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn daily_reset_is_idempotent_within_a_window() {
        let now = Utc::now();
        let mut rel = relationship(now);
        rel.daily_reset_at = now - Duration::hours(1);
        rel.daily_trade_count = 2;
        rel.daily_volume_usd = dec!(300);

        let watermark_before = rel.daily_reset_at;
        assert!(rel.roll_daily_window(now));
        assert_eq!(rel.daily_trade_count, 0);
        assert_eq!(rel.daily_volume_usd, Decimal::ZERO);
        // Advanced by exactly one day.
        assert_eq!(rel.daily_reset_at, watermark_before + Duration::days(1));

        // Second invocation within the new window is a no-op.
        rel.daily_trade_count = 1;
        assert!(!rel.roll_daily_window(now));
        assert_eq!(rel.daily_trade_count, 1);
    }

    #[test]
    fn sizing_modes() {
        let now = Utc::now();
        let mut rel = relationship(now);

        // percentage: 10% of a $1000 leader trade
        assert_eq!(rel.size_trade(dec!(1000), dec!(5000)), dec!(100));

        rel.sizing_mode = SizingMode::Fixed;
        rel.size_value = dec!(25);
        assert_eq!(rel.size_trade(dec!(1000), dec!(5000)), dec!(25));

        rel.sizing_mode = SizingMode::Proportional;
        rel.size_value = dec!(2);
        assert_eq!(rel.size_trade(dec!(1000), dec!(5000)), dec!(100));
    }

    #[test]
    fn sizing_clamps_to_max() {
        let now = Utc::now();
        let mut rel = relationship(now);
        rel.size_value = dec!(50);
        // 50% of $1000 = $500, clamped to max_trade_usd.
        assert_eq!(rel.size_trade(dec!(1000), Decimal::ZERO), dec!(200));
    }

    #[test]
    fn token_filter_blacklist_wins() {
        let now = Utc::now();
        let mut rel = relationship(now);
        assert!(rel.allows_token("0xAAA"));

        rel.blocked_tokens = vec!["0xaaa".to_string()];
        assert!(!rel.allows_token("0xAAA"));

        rel.allowed_tokens = vec!["0xbbb".to_string()];
        assert!(rel.allows_token("0xBBB"));
        assert!(!rel.allows_token("0xccc"));
    }

    #[test]
    fn delay_is_clamped() {
        let now = Utc::now();
        let mut rel = relationship(now);
        rel.delay_seconds = 900;
        rel.max_delay_seconds = 300;
        assert_eq!(rel.effective_delay(), Duration::seconds(300));
    }
}
