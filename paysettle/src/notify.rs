use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::digest::InvalidLength;
use log::{info, warn};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::invoice::Invoice;
use crate::metrics;
use crate::signing::{sign, SIGNATURE_HEADER};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyEvent {
    Created,
    Paid,
    Expired,
}

impl NotifyEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyEvent::Created => "invoice created",
            NotifyEvent::Paid => "paid",
            NotifyEvent::Expired => "expired",
        }
    }
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body POSTed to the merchant. The callback URI never leaves the engine.
#[derive(Debug, Serialize)]
pub struct NotificationPayload<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payment_id: &'a str,
    pub status: &'static str,
    pub order_id: &'a str,
    pub custom: &'a str,
    pub atomic_amount: u64,
    pub amount_received: u64,
    pub fee: u64,
    pub currency_code: &'a str,
    pub currency_amount: f64,
    pub public_key: &'a str,
    pub timestamp: u64,
}

impl<'a> NotificationPayload<'a> {
    pub fn new(invoice: &'a Invoice, event: NotifyEvent) -> Self {
        Self {
            kind: event.as_str(),
            payment_id: &invoice.payment_id,
            status: invoice.status.as_str(),
            order_id: &invoice.order_id,
            custom: &invoice.custom_data,
            atomic_amount: invoice.target_atomic_amount,
            amount_received: invoice.amount_received,
            fee: invoice.fee,
            currency_code: &invoice.currency_code,
            currency_amount: invoice.currency_amount,
            public_key: &invoice.public_key,
            timestamp: invoice.created_at,
        }
    }
}

/// Resolves the per-merchant webhook secret from the merchant's public key.
pub trait MerchantKeyring: Send + Sync {
    fn secret_for(&self, public_key: &str) -> Option<Vec<u8>>;
}

#[derive(Clone, Debug, Default)]
pub struct StaticKeyring {
    secrets: HashMap<String, Vec<u8>>,
}

impl StaticKeyring {
    pub fn new<K, S>(entries: impl IntoIterator<Item = (K, S)>) -> Self
    where
        K: Into<String>,
        S: Into<Vec<u8>>,
    {
        Self { secrets: entries.into_iter().map(|(k, s)| (k.into(), s.into())).collect() }
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl MerchantKeyring for StaticKeyring {
    fn secret_for(&self, public_key: &str) -> Option<Vec<u8>> {
        self.secrets.get(public_key).cloned()
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http status {0}")]
    Http(u16),
    #[error("no webhook secret for merchant {0}")]
    UnknownMerchant(String),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidSecret(#[from] InvalidLength),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, invoice: &Invoice, event: NotifyEvent) -> Result<(), NotifyError>;
}

/// Single signed POST per event; failures are returned, never retried.
pub struct WebhookNotifier {
    client: Client,
    keyring: Arc<dyn MerchantKeyring>,
}

impl WebhookNotifier {
    pub fn new(keyring: Arc<dyn MerchantKeyring>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, keyring })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, invoice: &Invoice, event: NotifyEvent) -> Result<(), NotifyError> {
        let secret = self
            .keyring
            .secret_for(&invoice.public_key)
            .ok_or_else(|| NotifyError::UnknownMerchant(invoice.public_key.clone()))?;
        let body = serde_json::to_vec(&NotificationPayload::new(invoice, event))?;
        let signature = sign(&secret, &body)?;

        let resp = self
            .client
            .post(&invoice.callback_uri)
            .header(SIGNATURE_HEADER, signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        info!("webhook event={} payment_id={} status={}", event, invoice.payment_id, status.as_u16());
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Http(status.as_u16()))
        }
    }
}

/// Sends one notification, logging instead of failing.
pub async fn deliver(notifier: &dyn Notifier, invoice: &Invoice, event: NotifyEvent) {
    if let Err(err) = notifier.notify(invoice, event).await {
        metrics::inc(&metrics::NOTIFICATION_FAILURES);
        warn!("webhook event={} payment_id={} failed: {err}", event, invoice.payment_id);
    }
}
