//! HTTP clients for the price-quoting and chain-submission services.

use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use super::{
    ChainSubmitter, MarketDataSource, MarketSnapshot, QuoteRequest, SubmissionAck, SubmitError,
    SubmitRequest, SwapQuote,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn retry_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(60)),
        ..ExponentialBackoff::default()
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    price_usd: Decimal,
    gas_price_usd: Decimal,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    quote_id: String,
    expected_amount_out: Decimal,
    min_amount_out: Decimal,
    price_usd: Decimal,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    reference: String,
}

/// Client for the price-quoting service (read-only operations).
#[derive(Clone)]
pub struct HttpMarketData {
    client: Client,
    base_url: String,
}

impl HttpMarketData {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        // Transient failures retry with exponential backoff; HTTP errors
        // from the service are permanent for this request.
        let response = backoff::future::retry(retry_policy(), || async {
            self.client
                .get(&url)
                .send()
                .await
                .map_err(backoff::Error::transient)
        })
        .await
        .with_context(|| format!("Request to {url} failed"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Request failed: {} - {}", status, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {url}"))
    }
}

impl MarketDataSource for HttpMarketData {
    async fn snapshot(&self, chain_id: i64, token: &str) -> Result<MarketSnapshot> {
        let url = format!(
            "{}/v1/snapshot?chain={}&token={}",
            self.base_url, chain_id, token
        );
        debug!(url = %url, "Fetching market snapshot");

        let body: SnapshotResponse = self.get_json(url).await?;

        Ok(MarketSnapshot {
            chain_id,
            token: token.to_string(),
            price_usd: body.price_usd,
            gas_price_usd: body.gas_price_usd,
            captured_at: Utc::now(),
        })
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote> {
        let url = format!(
            "{}/v1/quote?chain={}&token_in={}&token_out={}&amount_usd={}&max_slippage_bps={}",
            self.base_url,
            request.chain_id,
            request.token_in,
            request.token_out,
            request.amount_in_usd,
            request.max_slippage_bps
        );
        debug!(url = %url, "Fetching swap quote");

        let body: QuoteResponse = self.get_json(url).await?;

        Ok(SwapQuote {
            quote_id: body.quote_id,
            expected_amount_out: body.expected_amount_out,
            min_amount_out: body.min_amount_out,
            price_usd: body.price_usd,
            expires_at: body.expires_at,
        })
    }
}

/// Client for the chain-submission service.
#[derive(Clone)]
pub struct HttpChainSubmitter {
    client: Client,
    base_url: String,
}

impl HttpChainSubmitter {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl ChainSubmitter for HttpChainSubmitter {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmissionAck, SubmitError> {
        let url = format!("{}/v1/submit", self.base_url);
        debug!(url = %url, record = %request.execution_record_id, "Submitting transaction");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| SubmitError::transient(format!("submission request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let body: SubmitResponse = response
                .json()
                .await
                .map_err(|e| SubmitError::transient(format!("bad submission response: {e}")))?;
            return Ok(SubmissionAck {
                reference: body.reference,
            });
        }

        let body = response.text().await.unwrap_or_default();
        // 5xx means the service choked and the request may be retried;
        // 4xx means this transaction will never be accepted.
        if status.is_server_error() {
            Err(SubmitError::transient(format!("{status} - {body}")))
        } else {
            Err(SubmitError::fatal(format!("{status} - {body}")))
        }
    }
}
