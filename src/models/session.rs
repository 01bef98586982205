//! Session key and smart session models: revocable, scoped spending grants.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How many usage entries are retained per session.
pub const USAGE_LOG_LIMIT: i64 = 100;

/// Lifecycle status of a spending grant.
///
/// Transitions are one-directional except `extend`, which may reactivate an
/// expired key. Revoked and exhausted keys are permanently dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked,
    Exhausted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Revoked => "revoked",
            SessionStatus::Exhausted => "exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "expired" => Some(SessionStatus::Expired),
            "revoked" => Some(SessionStatus::Revoked),
            "exhausted" => Some(SessionStatus::Exhausted),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability class an agent may exercise under a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Swap,
    Transfer,
    Approve,
    Bridge,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::Swap => "swap",
            ActionClass::Transfer => "transfer",
            ActionClass::Approve => "approve",
            ActionClass::Bridge => "bridge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "swap" => Some(ActionClass::Swap),
            "transfer" => Some(ActionClass::Transfer),
            "approve" => Some(ActionClass::Approve),
            "bridge" => Some(ActionClass::Bridge),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value caps and running usage totals for a session key.
///
/// Invariant: `total_value_used_usd <= max_total_value_usd` and, when set,
/// `transaction_count <= max_transactions`, at every observed instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueLimits {
    pub max_value_per_tx_usd: Decimal,
    pub max_total_value_usd: Decimal,
    pub max_transactions: Option<i64>,
    pub total_value_used_usd: Decimal,
    pub transaction_count: i64,
}

impl ValueLimits {
    pub fn remaining_usd(&self) -> Decimal {
        (self.max_total_value_usd - self.total_value_used_usd).max(Decimal::ZERO)
    }
}

/// Why an authorization check denied a spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDenied {
    NotActive(SessionStatus),
    Expired,
    ChainNotAllowed(i64),
    ContractNotAllowed(String),
    TokenNotAllowed(String),
    ActionNotAllowed(ActionClass),
    PerTxLimitExceeded,
    TotalLimitExceeded,
    TransactionCountExhausted,
}

impl std::fmt::Display for AuthorizationDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorizationDenied::NotActive(status) => {
                write!(f, "session is {status}, not active")
            }
            AuthorizationDenied::Expired => write!(f, "session has expired"),
            AuthorizationDenied::ChainNotAllowed(chain) => {
                write!(f, "chain {chain} is not in the session allowlist")
            }
            AuthorizationDenied::ContractNotAllowed(addr) => {
                write!(f, "contract {addr} is not in the session allowlist")
            }
            AuthorizationDenied::TokenNotAllowed(token) => {
                write!(f, "token {token} is not in the session allowlist")
            }
            AuthorizationDenied::ActionNotAllowed(action) => {
                write!(f, "action {action} is not granted by the session")
            }
            AuthorizationDenied::PerTxLimitExceeded => {
                write!(f, "value exceeds the per-transaction limit")
            }
            AuthorizationDenied::TotalLimitExceeded => {
                write!(f, "value exceeds the remaining session budget")
            }
            AuthorizationDenied::TransactionCountExhausted => {
                write!(f, "session transaction count is exhausted")
            }
        }
    }
}

/// What a spend is scoped to, for allowlist checks.
#[derive(Debug, Clone, Default)]
pub struct SpendScope {
    pub chain_id: Option<i64>,
    pub contract: Option<String>,
    pub token: Option<String>,
}

/// A grant scoped to one wallet/agent pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKey {
    pub id: String,
    pub wallet_address: String,
    pub label: Option<String>,

    pub value_limits: ValueLimits,

    /// Empty allowlist means unrestricted (intended policy, applied on
    /// every call path).
    pub allowed_chains: Vec<i64>,
    pub allowed_contracts: Vec<String>,
    pub allowed_tokens: Vec<String>,

    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub revoked_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the key can still gate spends: active and unexpired.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && !self.is_expired(now)
    }

    /// Read-path authorization predicate. The mutating reserve re-checks the
    /// value limits atomically; allowlists are immutable per key so checking
    /// them here does not race.
    pub fn authorizes(
        &self,
        now: DateTime<Utc>,
        value_usd: Decimal,
        scope: &SpendScope,
    ) -> Result<(), AuthorizationDenied> {
        if self.status != SessionStatus::Active {
            return Err(AuthorizationDenied::NotActive(self.status));
        }
        if self.is_expired(now) {
            return Err(AuthorizationDenied::Expired);
        }
        if let Some(chain) = scope.chain_id {
            if !self.allowed_chains.is_empty() && !self.allowed_chains.contains(&chain) {
                return Err(AuthorizationDenied::ChainNotAllowed(chain));
            }
        }
        if let Some(contract) = &scope.contract {
            if !self.allowed_contracts.is_empty()
                && !self.allowed_contracts.iter().any(|c| c.eq_ignore_ascii_case(contract))
            {
                return Err(AuthorizationDenied::ContractNotAllowed(contract.clone()));
            }
        }
        if let Some(token) = &scope.token {
            if !self.allowed_tokens.is_empty()
                && !self.allowed_tokens.iter().any(|t| t.eq_ignore_ascii_case(token))
            {
                return Err(AuthorizationDenied::TokenNotAllowed(token.clone()));
            }
        }
        if value_usd > self.value_limits.max_value_per_tx_usd {
            return Err(AuthorizationDenied::PerTxLimitExceeded);
        }
        if self.value_limits.total_value_used_usd + value_usd
            > self.value_limits.max_total_value_usd
        {
            return Err(AuthorizationDenied::TotalLimitExceeded);
        }
        if let Some(max) = self.value_limits.max_transactions {
            if self.value_limits.transaction_count >= max {
                return Err(AuthorizationDenied::TransactionCountExhausted);
            }
        }
        Ok(())
    }
}

/// One recorded spend under a session. The log is bounded to the last
/// [`USAGE_LOG_LIMIT`] entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    pub id: i64,
    pub session_id: String,
    pub value_usd: Decimal,
    pub action: ActionClass,
    pub chain_id: Option<i64>,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// On-chain-mirrored grant variant: a single aggregate spending limit and a
/// capability set instead of graded permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartSession {
    pub id: String,
    pub wallet_address: String,
    pub spending_limit_usd: Decimal,
    pub spent_usd: Decimal,
    pub transaction_count: i64,
    pub allowed_actions: Vec<ActionClass>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SmartSession {
    pub fn authorizes(
        &self,
        now: DateTime<Utc>,
        value_usd: Decimal,
        action: ActionClass,
    ) -> Result<(), AuthorizationDenied> {
        if self.status != SessionStatus::Active {
            return Err(AuthorizationDenied::NotActive(self.status));
        }
        if now >= self.expires_at {
            return Err(AuthorizationDenied::Expired);
        }
        if !self.allowed_actions.is_empty() && !self.allowed_actions.contains(&action) {
            return Err(AuthorizationDenied::ActionNotAllowed(action));
        }
        if self.spent_usd + value_usd > self.spending_limit_usd {
            return Err(AuthorizationDenied::TotalLimitExceeded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn key(limits: ValueLimits, now: DateTime<Utc>) -> SessionKey {
        SessionKey {
            id: "sk-1".to_string(),
            wallet_address: "0xwallet".to_string(),
            label: None,
            value_limits: limits,
            allowed_chains: vec![],
            allowed_contracts: vec![],
            allowed_tokens: vec![],
            expires_at: now + Duration::days(30),
            status: SessionStatus::Active,
            revoked_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn limits() -> ValueLimits {
        ValueLimits {
            max_value_per_tx_usd: dec!(50),
            max_total_value_usd: dec!(100),
            max_transactions: Some(3),
            total_value_used_usd: Decimal::ZERO,
            transaction_count: 0,
        }
    }

    #[test]
    fn empty_allowlist_is_unrestricted() {
        let now = Utc::now();
        let k = key(limits(), now);
        let scope = SpendScope {
            chain_id: Some(8453),
            contract: Some("0xrouter".to_string()),
            token: Some("0xtoken".to_string()),
        };
        assert!(k.authorizes(now, dec!(10), &scope).is_ok());
    }

    #[test]
    fn allowlist_filters_when_nonempty() {
        let now = Utc::now();
        let mut k = key(limits(), now);
        k.allowed_chains = vec![1];
        let scope = SpendScope {
            chain_id: Some(8453),
            ..Default::default()
        };
        assert_eq!(
            k.authorizes(now, dec!(10), &scope),
            Err(AuthorizationDenied::ChainNotAllowed(8453))
        );
    }

    #[test]
    fn per_tx_and_total_limits_deny() {
        let now = Utc::now();
        let mut k = key(limits(), now);
        assert_eq!(
            k.authorizes(now, dec!(51), &SpendScope::default()),
            Err(AuthorizationDenied::PerTxLimitExceeded)
        );

        k.value_limits.total_value_used_usd = dec!(80);
        assert_eq!(
            k.authorizes(now, dec!(30), &SpendScope::default()),
            Err(AuthorizationDenied::TotalLimitExceeded)
        );
        assert!(k.authorizes(now, dec!(20), &SpendScope::default()).is_ok());
    }

    #[test]
    fn expired_key_denies() {
        let now = Utc::now();
        let mut k = key(limits(), now);
        k.expires_at = now - Duration::seconds(1);
        assert_eq!(
            k.authorizes(now, dec!(1), &SpendScope::default()),
            Err(AuthorizationDenied::Expired)
        );
        assert!(!k.is_usable(now));
    }

    #[test]
    fn smart_session_capability_gate() {
        let now = Utc::now();
        let session = SmartSession {
            id: "ss-1".to_string(),
            wallet_address: "0xwallet".to_string(),
            spending_limit_usd: dec!(500),
            spent_usd: dec!(100),
            transaction_count: 2,
            allowed_actions: vec![ActionClass::Swap],
            expires_at: now + Duration::days(7),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        assert!(session.authorizes(now, dec!(50), ActionClass::Swap).is_ok());
        assert_eq!(
            session.authorizes(now, dec!(50), ActionClass::Transfer),
            Err(AuthorizationDenied::ActionNotAllowed(ActionClass::Transfer))
        );
        assert_eq!(
            session.authorizes(now, dec!(450), ActionClass::Swap),
            Err(AuthorizationDenied::TotalLimitExceeded)
        );
    }
}
