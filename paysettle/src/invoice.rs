use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::store::{Fields, InvoiceStore, StoreError};

/// Stored in place of an absent return address; the store cannot hold empty strings.
pub const NO_RETURN_ADDRESS: &str = "-";

/// Random bytes behind a payment id (hex encoded, so ids are twice as long).
pub const PAYMENT_ID_BYTES: usize = 32;

/// Record field names.
pub mod field {
    pub const STATUS: &str = "status";
    pub const MERCHANT_ADDRESS: &str = "merchant_address";
    pub const RETURN_ADDRESS: &str = "return_address";
    pub const PAYMENT_ADDRESS: &str = "payment_address";
    pub const CURRENCY_CODE: &str = "currency_code";
    pub const CURRENCY_AMOUNT: &str = "currency_amount";
    pub const ATOMIC_AMOUNT: &str = "atomic_amount";
    pub const AMOUNT_RECEIVED: &str = "amount_received";
    pub const FEE: &str = "fee";
    pub const ORDER_ID: &str = "order_id";
    pub const CUSTOM: &str = "custom";
    pub const PUBLIC_KEY: &str = "public_key";
    pub const IPN_URI: &str = "ipn_uri";
    pub const TIMESTAMP: &str = "timestamp";
    pub const EXPIRATION: &str = "expiration";
    pub const BLOCK: &str = "block";
    /// Bumped by every settlement attempt; only the attempt that sees 1 stages a transfer.
    /// Not part of [`super::ALL_FIELDS`].
    pub const SETTLE_CLAIM: &str = "settle_claim";
}

pub const ALL_FIELDS: [&str; 16] = [
    field::STATUS,
    field::MERCHANT_ADDRESS,
    field::RETURN_ADDRESS,
    field::PAYMENT_ADDRESS,
    field::CURRENCY_CODE,
    field::CURRENCY_AMOUNT,
    field::ATOMIC_AMOUNT,
    field::AMOUNT_RECEIVED,
    field::FEE,
    field::ORDER_ID,
    field::CUSTOM,
    field::PUBLIC_KEY,
    field::IPN_URI,
    field::TIMESTAMP,
    field::EXPIRATION,
    field::BLOCK,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    New,
    AwaitingConfirmation,
    Paid,
    Expired,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::New => "new",
            InvoiceStatus::AwaitingConfirmation => "awaiting_confirmation",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Expired)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(InvoiceStatus::New),
            "awaiting_confirmation" => Ok(InvoiceStatus::AwaitingConfirmation),
            "paid" => Ok(InvoiceStatus::Paid),
            "expired" => Ok(InvoiceStatus::Expired),
            other => Err(format!("unknown invoice status {other:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Invoice {
    pub payment_id: String,
    pub status: InvoiceStatus,
    pub merchant_address: String,
    pub return_address: Option<String>,
    pub payment_address: String,
    pub currency_code: String,
    pub currency_amount: f64,
    pub target_atomic_amount: u64,
    pub amount_received: u64,
    pub fee: u64,
    pub order_id: String,
    pub custom_data: String,
    pub public_key: String,
    pub callback_uri: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub confirming_block: Option<u64>,
}

impl Invoice {
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        let mut put = |name: &str, value: String| {
            fields.insert(name.to_string(), value);
        };
        put(field::STATUS, self.status.as_str().to_string());
        put(field::MERCHANT_ADDRESS, self.merchant_address.clone());
        put(field::RETURN_ADDRESS, self.return_address.clone().unwrap_or_else(|| NO_RETURN_ADDRESS.to_string()));
        put(field::PAYMENT_ADDRESS, self.payment_address.clone());
        put(field::CURRENCY_CODE, self.currency_code.clone());
        put(field::CURRENCY_AMOUNT, self.currency_amount.to_string());
        put(field::ATOMIC_AMOUNT, self.target_atomic_amount.to_string());
        put(field::AMOUNT_RECEIVED, self.amount_received.to_string());
        put(field::FEE, self.fee.to_string());
        put(field::ORDER_ID, self.order_id.clone());
        put(field::CUSTOM, self.custom_data.clone());
        put(field::PUBLIC_KEY, self.public_key.clone());
        put(field::IPN_URI, self.callback_uri.clone());
        put(field::TIMESTAMP, self.created_at.to_string());
        put(field::EXPIRATION, self.expires_at.to_string());
        if let Some(block) = self.confirming_block {
            put(field::BLOCK, block.to_string());
        }
        fields
    }

    pub fn from_fields(payment_id: &str, fields: &Fields) -> Result<Self, StoreError> {
        let text = |name: &str| -> Result<String, StoreError> {
            fields.get(name).cloned().ok_or_else(|| corrupt(payment_id, format!("missing field {name}")))
        };
        let int = |name: &str| -> Result<u64, StoreError> { parse_u64(payment_id, name, &text(name)?) };

        let status = text(field::STATUS)?.parse::<InvoiceStatus>().map_err(|e| corrupt(payment_id, e))?;
        let return_address = text(field::RETURN_ADDRESS)?;
        let currency_amount = text(field::CURRENCY_AMOUNT)?
            .parse::<f64>()
            .map_err(|_| corrupt(payment_id, "currency_amount is not a number".to_string()))?;
        let confirming_block = match fields.get(field::BLOCK) {
            Some(raw) => Some(parse_u64(payment_id, field::BLOCK, raw)?),
            None => None,
        };

        Ok(Self {
            payment_id: payment_id.to_string(),
            status,
            merchant_address: text(field::MERCHANT_ADDRESS)?,
            return_address: (return_address != NO_RETURN_ADDRESS).then_some(return_address),
            payment_address: text(field::PAYMENT_ADDRESS)?,
            currency_code: text(field::CURRENCY_CODE)?,
            currency_amount,
            target_atomic_amount: int(field::ATOMIC_AMOUNT)?,
            amount_received: int(field::AMOUNT_RECEIVED)?,
            fee: int(field::FEE)?,
            order_id: text(field::ORDER_ID)?,
            custom_data: text(field::CUSTOM)?,
            public_key: text(field::PUBLIC_KEY)?,
            callback_uri: text(field::IPN_URI)?,
            created_at: int(field::TIMESTAMP)?,
            expires_at: int(field::EXPIRATION)?,
            confirming_block,
        })
    }

    pub fn load(store: &dyn InvoiceStore, payment_id: &str) -> Result<Self, StoreError> {
        let fields = store.get_fields(payment_id, &ALL_FIELDS)?;
        Self::from_fields(payment_id, &fields)
    }

    /// Address that receives the proceeds of an expired invoice.
    pub fn refund_address(&self) -> &str {
        self.return_address.as_deref().unwrap_or(&self.merchant_address)
    }

    /// `amount_received - fee`, or `None` when nothing is left to forward.
    pub fn net_amount(&self) -> Option<u64> {
        self.amount_received.checked_sub(self.fee).filter(|amount| *amount > 0)
    }
}

pub fn parse_u64(payment_id: &str, name: &str, raw: &str) -> Result<u64, StoreError> {
    raw.parse::<u64>().map_err(|_| corrupt(payment_id, format!("{name} is not an integer: {raw:?}")))
}

fn corrupt(id: &str, reason: String) -> StoreError {
    StoreError::Corrupt { id: id.to_string(), reason }
}

/// `max(floor(target * fee_rate), min_fee)`.
pub fn compute_fee(target_atomic_amount: u64, fee_rate: f64, min_fee: u64) -> u64 {
    let proportional = (target_atomic_amount as f64 * fee_rate).floor();
    let proportional = if proportional.is_finite() && proportional > 0.0 { proportional as u64 } else { 0 };
    proportional.max(min_fee)
}

/// Converts a fiat amount to atomic units at `rate` fiat per coin.
pub fn to_atomic(currency_amount: f64, rate: f64, atoms: u64) -> Option<u64> {
    if rate <= 0.0 || !rate.is_finite() || currency_amount <= 0.0 {
        return None;
    }
    let atomic = (currency_amount / rate * atoms as f64).floor();
    (atomic.is_finite() && atomic >= 1.0 && atomic < u64::MAX as f64).then(|| atomic as u64)
}

pub fn generate_payment_id() -> String {
    let mut bytes = [0u8; PAYMENT_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
