//! Interfaces to the external market-data and chain-submission services.
//!
//! Quotes and submission are asynchronous collaborators: the engine holds no
//! lock across them. Submission is fire-and-acknowledge: confirmation or
//! failure arrives later through the execution-record callbacks.

mod market_client;

pub use market_client::{HttpChainSubmitter, HttpMarketData};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Price and gas observation for one (chain, token) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub chain_id: i64,
    pub token: String,
    pub price_usd: Decimal,
    pub gas_price_usd: Decimal,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub chain_id: i64,
    pub token_in: String,
    pub token_out: String,
    pub amount_in_usd: Decimal,
    pub max_slippage_bps: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapQuote {
    pub quote_id: String,
    pub expected_amount_out: Decimal,
    pub min_amount_out: Decimal,
    pub price_usd: Decimal,
    pub expires_at: DateTime<Utc>,
}

/// Transaction handed to the chain-submission service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub execution_record_id: String,
    pub wallet_address: String,
    pub chain_id: i64,
    pub token_in: String,
    pub token_out: String,
    pub amount_usd: Decimal,
    pub min_amount_out: Decimal,
    pub max_slippage_bps: i64,
    pub max_gas_usd: Option<Decimal>,
}

/// Acknowledgement that the submission service accepted the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionAck {
    pub reference: String,
}

/// Submission error with a recoverability verdict: transient failures keep
/// the owner active for retry, non-retryable ones disable it.
#[derive(Debug, Clone)]
pub struct SubmitError {
    pub message: String,
    pub recoverable: bool,
}

impl SubmitError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.recoverable {
            write!(f, "submission failed (transient): {}", self.message)
        } else {
            write!(f, "submission failed: {}", self.message)
        }
    }
}

impl std::error::Error for SubmitError {}

/// Read-side market collaborator: price/gas snapshots and swap quotes.
pub trait MarketDataSource: Send + Sync {
    async fn snapshot(&self, chain_id: i64, token: &str) -> Result<MarketSnapshot>;
    async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote>;
}

/// Write-side chain collaborator. The ack only means the service took the
/// request; on-chain progress flows back via `mark_submitted` /
/// `mark_confirmed` / `mark_failed`.
pub trait ChainSubmitter: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmissionAck, SubmitError>;
}

/// Dry-run submitter: logs the would-be transaction and acknowledges it.
#[derive(Debug, Clone, Default)]
pub struct SimulatedSubmitter;

impl ChainSubmitter for SimulatedSubmitter {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmissionAck, SubmitError> {
        info!(
            record = %request.execution_record_id,
            chain = request.chain_id,
            token_in = %request.token_in,
            token_out = %request.token_out,
            amount = %request.amount_usd,
            "[DRY RUN] Would submit swap"
        );
        Ok(SubmissionAck {
            reference: format!("sim-{}", Uuid::new_v4()),
        })
    }
}
