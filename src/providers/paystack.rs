//! Paystack payment gateway adapter.
//!
//! Uses two endpoints of the Paystack REST API:
//! - `POST /transaction/initialize`: start a checkout, get an authorization URL
//! - `GET /transaction/verify/{reference}`: authoritative payment status
//!
//! Amounts are in kobo on the wire. Webhooks are signed with the same
//! secret key (see [`crate::billing::reconciler::verify_webhook_signature`]).

use crate::billing::reconciler::{GatewayError, PaymentFact, PaymentGateway, PaymentStatus, TopUpSession};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.paystack.co";

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaystackConfig {
    pub base_url: String,
    /// Secret key (`sk_live_...` / `sk_test_...`).
    pub secret_key: String,
    /// Where Paystack redirects the payer after checkout.
    pub callback_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for PaystackConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            secret_key: String::new(),
            callback_url: None,
            timeout_secs: 30,
        }
    }
}

// ── Wire types ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InitializeRequest<'a> {
    email: &'a str,
    amount: i64,
    reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<&'a str>,
}

/// Paystack's `{ status, message, data }` envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    reference: String,
    status: PaymentStatus,
    amount: i64,
    currency: String,
    customer: Customer,
}

#[derive(Debug, Deserialize)]
struct Customer {
    email: String,
}

// ── Client ───────────────────────────────────────────────────────

pub struct PaystackGateway {
    config: PaystackConfig,
    http: reqwest::Client,
}

impl PaystackGateway {
    pub fn new(config: PaystackConfig) -> anyhow::Result<Self> {
        if config.secret_key.trim().is_empty() {
            anyhow::bail!("Paystack secret key is not configured");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        let resp = request
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Unavailable(format!("Paystack returned {status}: {body}")));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            if status.is_success() {
                GatewayError::Unavailable(format!("malformed Paystack response: {e}"))
            } else {
                GatewayError::Rejected(format!("Paystack returned {status}"))
            }
        })?;

        if !status.is_success() || !envelope.status {
            let message = if envelope.message.is_empty() {
                format!("Paystack returned {status}")
            } else {
                envelope.message
            };
            return Err(GatewayError::Rejected(message));
        }
        envelope
            .data
            .ok_or_else(|| GatewayError::Rejected("Paystack response has no data".into()))
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    fn name(&self) -> &str {
        "paystack"
    }

    async fn initialize(
        &self,
        payer_identity: &str,
        amount_minor: i64,
        reference: &str,
    ) -> Result<TopUpSession, GatewayError> {
        let body = InitializeRequest {
            email: payer_identity,
            amount: amount_minor,
            reference,
            callback_url: self.config.callback_url.as_deref(),
        };
        let data: InitializeData = self
            .send(self.http.post(self.url("/transaction/initialize")).json(&body))
            .await?;
        Ok(TopUpSession {
            authorization_url: data.authorization_url,
            reference: data.reference,
        })
    }

    async fn verify(&self, reference: &str) -> Result<PaymentFact, GatewayError> {
        let path = format!("/transaction/verify/{}", urlencoding::encode(reference));
        let data: VerifyData = self.send(self.http.get(self.url(&path))).await?;
        tracing::debug!(reference = %data.reference, status = data.status.as_str(), "Paystack verify");
        Ok(PaymentFact {
            reference: data.reference,
            status: data.status,
            amount_minor: data.amount,
            currency: data.currency,
            payer_identity: data.customer.email,
        })
    }
}
