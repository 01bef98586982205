//! Session budget enforcer: revocable, scoped spending grants with atomic
//! authorize-and-reserve.
//!
//! Authorization and usage recording are one guarded database update, so two
//! concurrent transactions for a wallet can never both pass a stale check
//! and breach the cap together.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::models::{
    ActionClass, AuthorizationDenied, SessionKey, SessionStatus, SmartSession, SpendScope,
    UsageEntry, ValueLimits,
};

/// Extension must stay within one year.
const MAX_EXTEND_DAYS: i64 = 365;

/// Outcome of an authorize-and-reserve attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveDecision {
    Reserved,
    Denied(AuthorizationDenied),
}

impl ReserveDecision {
    pub fn is_reserved(&self) -> bool {
        matches!(self, ReserveDecision::Reserved)
    }
}

/// Transaction metadata recorded with each spend.
#[derive(Debug, Clone, Default)]
pub struct UsageMetadata {
    pub action: Option<ActionClass>,
    pub chain_id: Option<i64>,
    pub tx_hash: Option<String>,
}

/// Parameters for creating a session key.
#[derive(Debug, Clone)]
pub struct NewSessionKey {
    pub wallet_address: String,
    pub label: Option<String>,
    pub max_value_per_tx_usd: Decimal,
    pub max_total_value_usd: Decimal,
    pub max_transactions: Option<i64>,
    pub allowed_chains: Vec<i64>,
    pub allowed_contracts: Vec<String>,
    pub allowed_tokens: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

pub struct SessionEnforcer {
    db: Arc<Database>,
}

impl SessionEnforcer {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ==================== Lifecycle ====================

    pub async fn create(&self, params: NewSessionKey) -> Result<SessionKey> {
        let now = Utc::now();

        if params.max_value_per_tx_usd <= Decimal::ZERO {
            bail!("max_value_per_tx_usd must be positive");
        }
        if params.max_total_value_usd < params.max_value_per_tx_usd {
            bail!("max_total_value_usd must be at least max_value_per_tx_usd");
        }
        if let Some(max) = params.max_transactions {
            if max < 1 {
                bail!("max_transactions must be at least 1");
            }
        }
        if params.expires_at <= now {
            bail!("expires_at must be in the future");
        }

        let key = SessionKey {
            id: Uuid::new_v4().to_string(),
            wallet_address: params.wallet_address,
            label: params.label,
            value_limits: ValueLimits {
                max_value_per_tx_usd: params.max_value_per_tx_usd,
                max_total_value_usd: params.max_total_value_usd,
                max_transactions: params.max_transactions,
                total_value_used_usd: Decimal::ZERO,
                transaction_count: 0,
            },
            allowed_chains: params.allowed_chains,
            allowed_contracts: params.allowed_contracts,
            allowed_tokens: params.allowed_tokens,
            expires_at: params.expires_at,
            status: SessionStatus::Active,
            revoked_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_session_key(&key).await?;
        info!(
            session = %key.id,
            wallet = %key.wallet_address,
            total_cap = %key.value_limits.max_total_value_usd,
            "Session key created"
        );
        Ok(key)
    }

    pub async fn get(&self, id: &str) -> Result<SessionKey> {
        self.db.get_session_key(id).await
    }

    pub async fn list(&self, wallet: Option<&str>) -> Result<Vec<SessionKey>> {
        self.db.list_session_keys(wallet).await
    }

    pub async fn usage(&self, id: &str) -> Result<Vec<UsageEntry>> {
        self.db.get_session_usage(id).await
    }

    /// One-way revocation.
    pub async fn revoke(&self, id: &str, reason: &str) -> Result<SessionKey> {
        // Validate existence first so a bad id is an error, not a no-op.
        let key = self.db.get_session_key(id).await?;
        if key.status != SessionStatus::Revoked {
            self.db
                .set_session_status(id, SessionStatus::Revoked, Some(reason), Utc::now())
                .await?;
            warn!(session = %id, reason = %reason, "Session key revoked");
        }
        self.db.get_session_key(id).await
    }

    /// Extend the grant by `days` (1..=365). Illegal from revoked or
    /// exhausted; reactivates an expired key, extending from
    /// `max(now, current expiry)`.
    pub async fn extend(&self, id: &str, days: i64) -> Result<SessionKey> {
        if !(1..=MAX_EXTEND_DAYS).contains(&days) {
            bail!("extension must be between 1 and {MAX_EXTEND_DAYS} days");
        }

        let key = self.db.get_session_key(id).await?;
        match key.status {
            SessionStatus::Revoked => bail!("cannot extend a revoked session"),
            SessionStatus::Exhausted => bail!("cannot extend an exhausted session"),
            SessionStatus::Active | SessionStatus::Expired => {}
        }

        let now = Utc::now();
        let base = key.expires_at.max(now);
        let new_expiry = base + Duration::days(days);
        self.db.set_session_expiry(id, new_expiry, now).await?;

        info!(session = %id, days, expires_at = %new_expiry, "Session key extended");
        self.db.get_session_key(id).await
    }

    /// Idempotent batch expiry of due sessions.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired = self.db.expire_due_sessions(now).await?;
        if expired > 0 {
            info!(count = expired, "Expired due sessions");
        }
        Ok(expired)
    }

    /// True when the key can currently gate spends.
    pub async fn is_usable(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.db.get_session_key(id).await?.is_usable(now))
    }

    // ==================== Authorization ====================

    /// Read-path authorization check, no mutation.
    pub async fn authorize(
        &self,
        id: &str,
        now: DateTime<Utc>,
        value_usd: Decimal,
        scope: &SpendScope,
    ) -> Result<Result<(), AuthorizationDenied>> {
        let key = self.db.get_session_key(id).await?;
        Ok(key.authorizes(now, value_usd, scope))
    }

    /// Atomic authorize-and-reserve: one guarded update decides and records
    /// the spend. On success the usage log is appended and the key flips to
    /// exhausted once a limit is met.
    pub async fn authorize_and_reserve(
        &self,
        id: &str,
        now: DateTime<Utc>,
        value_usd: Decimal,
        scope: &SpendScope,
        metadata: UsageMetadata,
    ) -> Result<ReserveDecision> {
        if value_usd <= Decimal::ZERO {
            bail!("reserve value must be positive");
        }

        let key = self.db.get_session_key(id).await?;
        // Allowlists are immutable per key, so this pre-check cannot race.
        // Value limits are re-checked by the guarded update below.
        if let Err(denied) = key.authorizes(now, value_usd, scope) {
            return Ok(ReserveDecision::Denied(denied));
        }

        if !self.db.try_reserve_session_budget(id, value_usd, now).await? {
            // Raced with another spend or a status change; re-read for the
            // precise reason.
            let key = self.db.get_session_key(id).await?;
            let denied = key
                .authorizes(now, value_usd, scope)
                .err()
                .unwrap_or(AuthorizationDenied::TotalLimitExceeded);
            return Ok(ReserveDecision::Denied(denied));
        }

        self.db
            .append_session_usage(
                id,
                value_usd,
                metadata.action.unwrap_or(ActionClass::Swap),
                metadata.chain_id,
                metadata.tx_hash.as_deref(),
                now,
            )
            .await?;

        if self.db.mark_exhausted_if_limits_met(id, now).await? {
            info!(session = %id, "Session key exhausted");
        }

        Ok(ReserveDecision::Reserved)
    }

    /// Record usage for a spend the caller authorized against current key
    /// state. Shares the reserve path so the budget invariant holds even
    /// for external callers.
    pub async fn record_usage(
        &self,
        id: &str,
        value_usd: Decimal,
        metadata: UsageMetadata,
    ) -> Result<ReserveDecision> {
        self.authorize_and_reserve(id, Utc::now(), value_usd, &SpendScope::default(), metadata)
            .await
    }

    // ==================== Smart sessions ====================

    pub async fn create_smart_session(
        &self,
        wallet_address: &str,
        spending_limit_usd: Decimal,
        allowed_actions: Vec<ActionClass>,
        expires_at: DateTime<Utc>,
    ) -> Result<SmartSession> {
        let now = Utc::now();
        if spending_limit_usd <= Decimal::ZERO {
            bail!("spending_limit_usd must be positive");
        }
        if expires_at <= now {
            bail!("expires_at must be in the future");
        }

        let session = SmartSession {
            id: Uuid::new_v4().to_string(),
            wallet_address: wallet_address.to_string(),
            spending_limit_usd,
            spent_usd: Decimal::ZERO,
            transaction_count: 0,
            allowed_actions,
            expires_at,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_smart_session(&session).await?;
        info!(session = %session.id, wallet = %wallet_address, "Smart session created");
        Ok(session)
    }

    pub async fn get_smart_session(&self, id: &str) -> Result<SmartSession> {
        self.db.get_smart_session(id).await
    }

    /// Same contract as `authorize_and_reserve`, against the flattened
    /// aggregate limit.
    pub async fn reserve_smart_session(
        &self,
        id: &str,
        now: DateTime<Utc>,
        value_usd: Decimal,
        action: ActionClass,
    ) -> Result<ReserveDecision> {
        if value_usd <= Decimal::ZERO {
            bail!("reserve value must be positive");
        }

        let session = self.db.get_smart_session(id).await?;
        if let Err(denied) = session.authorizes(now, value_usd, action) {
            return Ok(ReserveDecision::Denied(denied));
        }

        if !self.db.try_reserve_smart_session(id, value_usd, now).await? {
            let session = self.db.get_smart_session(id).await?;
            let denied = session
                .authorizes(now, value_usd, action)
                .err()
                .unwrap_or(AuthorizationDenied::TotalLimitExceeded);
            return Ok(ReserveDecision::Denied(denied));
        }

        if self
            .db
            .mark_smart_session_exhausted_if_spent(id, now)
            .await?
        {
            info!(session = %id, "Smart session exhausted");
        }

        Ok(ReserveDecision::Reserved)
    }

    pub async fn revoke_smart_session(&self, id: &str) -> Result<SmartSession> {
        self.db.get_smart_session(id).await?;
        self.db
            .set_smart_session_status(id, SessionStatus::Revoked, Utc::now())
            .await?;
        self.db.get_smart_session(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn enforcer() -> SessionEnforcer {
        let db = Arc::new(Database::in_memory().await.expect("db"));
        SessionEnforcer::new(db)
    }

    fn params(total: Decimal, per_tx: Decimal, max_tx: Option<i64>) -> NewSessionKey {
        NewSessionKey {
            wallet_address: "0xwallet".to_string(),
            label: None,
            max_value_per_tx_usd: per_tx,
            max_total_value_usd: total,
            max_transactions: max_tx,
            allowed_chains: vec![],
            allowed_contracts: vec![],
            allowed_tokens: vec![],
            expires_at: Utc::now() + Duration::days(30),
        }
    }

    #[tokio::test]
    async fn reserve_enforces_total_cap_at_every_instant() {
        let enforcer = enforcer().await;
        let key = enforcer
            .create(params(dec!(100), dec!(100), None))
            .await
            .unwrap();
        let now = Utc::now();

        let first = enforcer
            .authorize_and_reserve(&key.id, now, dec!(60), &SpendScope::default(), UsageMetadata::default())
            .await
            .unwrap();
        assert!(first.is_reserved());

        // 60 + 50 would breach the cap; denied, totals untouched.
        let second = enforcer
            .authorize_and_reserve(&key.id, now, dec!(50), &SpendScope::default(), UsageMetadata::default())
            .await
            .unwrap();
        assert_eq!(
            second,
            ReserveDecision::Denied(AuthorizationDenied::TotalLimitExceeded)
        );

        let key = enforcer.get(&key.id).await.unwrap();
        assert_eq!(key.value_limits.total_value_used_usd, dec!(60));
        assert!(key.value_limits.total_value_used_usd <= key.value_limits.max_total_value_usd);

        // Exactly filling the budget works and exhausts the key.
        let third = enforcer
            .authorize_and_reserve(&key.id, now, dec!(40), &SpendScope::default(), UsageMetadata::default())
            .await
            .unwrap();
        assert!(third.is_reserved());

        let key = enforcer.get(&key.id).await.unwrap();
        assert_eq!(key.status, SessionStatus::Exhausted);
        assert_eq!(key.value_limits.total_value_used_usd, dec!(100));

        // Exhaustion cascade: any further spend is denied.
        let fourth = enforcer
            .authorize_and_reserve(&key.id, now, dec!(1), &SpendScope::default(), UsageMetadata::default())
            .await
            .unwrap();
        assert_eq!(
            fourth,
            ReserveDecision::Denied(AuthorizationDenied::NotActive(SessionStatus::Exhausted))
        );
    }

    #[tokio::test]
    async fn transaction_count_limit_exhausts_key() {
        let enforcer = enforcer().await;
        let key = enforcer
            .create(params(dec!(1000), dec!(100), Some(2)))
            .await
            .unwrap();
        let now = Utc::now();

        for _ in 0..2 {
            let decision = enforcer
                .authorize_and_reserve(&key.id, now, dec!(10), &SpendScope::default(), UsageMetadata::default())
                .await
                .unwrap();
            assert!(decision.is_reserved());
        }

        let key = enforcer.get(&key.id).await.unwrap();
        assert_eq!(key.status, SessionStatus::Exhausted);
        assert_eq!(key.value_limits.transaction_count, 2);
    }

    #[tokio::test]
    async fn usage_log_is_bounded() {
        let enforcer = enforcer().await;
        let key = enforcer
            .create(params(dec!(100000), dec!(100), None))
            .await
            .unwrap();
        let now = Utc::now();

        for _ in 0..105 {
            enforcer
                .authorize_and_reserve(&key.id, now, dec!(1), &SpendScope::default(), UsageMetadata::default())
                .await
                .unwrap();
        }

        let usage = enforcer.usage(&key.id).await.unwrap();
        assert_eq!(usage.len(), 100);
    }

    #[tokio::test]
    async fn extend_rules() {
        let enforcer = enforcer().await;
        let key = enforcer
            .create(params(dec!(100), dec!(100), None))
            .await
            .unwrap();

        assert!(enforcer.extend(&key.id, 0).await.is_err());
        assert!(enforcer.extend(&key.id, 366).await.is_err());

        let original_expiry = key.expires_at;
        let extended = enforcer.extend(&key.id, 10).await.unwrap();
        assert_eq!(extended.expires_at, original_expiry + Duration::days(10));

        // Revoked keys cannot be extended.
        enforcer.revoke(&key.id, "user request").await.unwrap();
        assert!(enforcer.extend(&key.id, 10).await.is_err());
    }

    #[tokio::test]
    async fn extend_reactivates_expired_key_from_now() {
        let enforcer = enforcer().await;
        let key = enforcer
            .create(params(dec!(100), dec!(100), None))
            .await
            .unwrap();

        // Force-expire via cleanup from the far future.
        let far_future = key.expires_at + Duration::days(5);
        assert_eq!(enforcer.cleanup_expired(far_future).await.unwrap(), 1);
        let expired = enforcer.get(&key.id).await.unwrap();
        assert_eq!(expired.status, SessionStatus::Expired);

        // Expiry is in the past, so the extension is anchored at now.
        let reactivated = enforcer.extend(&key.id, 7).await.unwrap();
        assert_eq!(reactivated.status, SessionStatus::Active);
        assert!(reactivated.expires_at > Utc::now() + Duration::days(6));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let enforcer = enforcer().await;
        let key = enforcer
            .create(params(dec!(100), dec!(100), None))
            .await
            .unwrap();

        let later = key.expires_at + Duration::seconds(1);
        assert_eq!(enforcer.cleanup_expired(later).await.unwrap(), 1);
        assert_eq!(enforcer.cleanup_expired(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn revoke_is_one_way() {
        let enforcer = enforcer().await;
        let key = enforcer
            .create(params(dec!(100), dec!(100), None))
            .await
            .unwrap();

        let revoked = enforcer.revoke(&key.id, "compromised").await.unwrap();
        assert_eq!(revoked.status, SessionStatus::Revoked);
        assert_eq!(revoked.revoked_reason.as_deref(), Some("compromised"));

        let decision = enforcer
            .authorize_and_reserve(
                &key.id,
                Utc::now(),
                dec!(1),
                &SpendScope::default(),
                UsageMetadata::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            decision,
            ReserveDecision::Denied(AuthorizationDenied::NotActive(SessionStatus::Revoked))
        );
    }

    #[tokio::test]
    async fn smart_session_reserve_and_exhaustion() {
        let enforcer = enforcer().await;
        let session = enforcer
            .create_smart_session(
                "0xwallet",
                dec!(100),
                vec![ActionClass::Swap],
                Utc::now() + Duration::days(7),
            )
            .await
            .unwrap();
        let now = Utc::now();

        let denied = enforcer
            .reserve_smart_session(&session.id, now, dec!(10), ActionClass::Transfer)
            .await
            .unwrap();
        assert_eq!(
            denied,
            ReserveDecision::Denied(AuthorizationDenied::ActionNotAllowed(ActionClass::Transfer))
        );

        let reserved = enforcer
            .reserve_smart_session(&session.id, now, dec!(100), ActionClass::Swap)
            .await
            .unwrap();
        assert!(reserved.is_reserved());

        let session = enforcer.get_smart_session(&session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Exhausted);
        assert_eq!(session.spent_usd, dec!(100));
    }
}
