use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::invoice::{compute_fee, field, generate_payment_id, parse_u64, to_atomic, Invoice, InvoiceStatus};
use crate::metrics;
use crate::notify::{deliver, Notifier, NotifyEvent};
use crate::rates::RateTable;
use crate::settings::Settings;
use crate::store::{Fields, InvoiceStore, Store, StoreError, AWAITING_CONFIRMATION, EXPIRED_INVOICES, OPEN_INVOICES};
use crate::timers::ExpiryTimers;
use crate::wallet::{WalletError, WalletGateway};

/// Delay before an expiry that hit a store failure is attempted again.
const EXPIRY_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("{0}")]
    Invalid(String),
    #[error("invoice {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

impl From<StoreError> for InvoiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => InvoiceError::NotFound(id),
            other => InvoiceError::Store(other),
        }
    }
}

fn invalid(reason: impl Into<String>) -> InvoiceError {
    InvoiceError::Invalid(reason.into())
}

#[derive(Clone, Debug, Deserialize)]
pub struct InvoiceRequest {
    #[serde(default)]
    pub return_address: Option<String>,
    pub ipn_uri: String,
    pub currency_code: String,
    pub currency_amount: f64,
    pub order_id: String,
    #[serde(default)]
    pub custom: Option<String>,
    pub public_key: String,
    pub merchant_address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedInvoice {
    pub payment_id: String,
    pub timestamp: u64,
}

/// What the invoice query returns to the merchant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvoiceView {
    pub status: InvoiceStatus,
    pub order_id: String,
    pub atomic_amount: u64,
    pub amount_received: u64,
    pub expiration: u64,
    pub payment_address: String,
    pub currency_code: String,
    pub currency_amount: f64,
    pub fee: u64,
}

impl From<&Invoice> for InvoiceView {
    fn from(invoice: &Invoice) -> Self {
        Self {
            status: invoice.status,
            order_id: invoice.order_id.clone(),
            atomic_amount: invoice.target_atomic_amount,
            amount_received: invoice.amount_received,
            expiration: invoice.expires_at,
            payment_address: invoice.payment_address.clone(),
            currency_code: invoice.currency_code.clone(),
            currency_amount: invoice.currency_amount,
            fee: invoice.fee,
        }
    }
}

/// Payment observed by the wallet. The wallet sends `block` as a string.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PaymentReceived {
    pub payment_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub amount: u64,
    #[serde(deserialize_with = "string_or_number")]
    pub block: u64,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// Amount added; no state change.
    Recorded { received: u64 },
    /// Target met: the invoice now waits for confirmations.
    Promoted { received: u64, block: u64 },
    /// The invoice is already terminal; nothing was changed.
    Ignored(InvoiceStatus),
}

/// Request-path side of the invoice state machine: creation, payment
/// events and timer-driven expiry.
pub struct InvoiceLifecycle {
    store: Store,
    wallet: Arc<dyn WalletGateway>,
    notifier: Arc<dyn Notifier>,
    timers: Arc<ExpiryTimers>,
    rates: Arc<RateTable>,
    settings: Arc<Settings>,
}

struct Priced {
    currency_code: String,
    target: u64,
    fee: u64,
}

impl InvoiceLifecycle {
    pub fn new(
        store: Store,
        wallet: Arc<dyn WalletGateway>,
        notifier: Arc<dyn Notifier>,
        timers: Arc<ExpiryTimers>,
        rates: Arc<RateTable>,
        settings: Arc<Settings>,
    ) -> Self {
        Self { store, wallet, notifier, timers, rates, settings }
    }

    pub fn timers(&self) -> &Arc<ExpiryTimers> {
        &self.timers
    }

    fn validate(&self, req: &InvoiceRequest) -> Result<Priced, InvoiceError> {
        let currency_code = req.currency_code.trim().to_ascii_lowercase();
        let rate = self.rates.get(&currency_code).ok_or_else(|| invalid("unknown currency code"))?;
        if rate <= 0.0 || !rate.is_finite() {
            return Err(invalid("exchange rate unavailable"));
        }
        if !(req.currency_amount.is_finite() && req.currency_amount > 0.0) {
            return Err(invalid("currency_amount must be positive"));
        }
        if !self.settings.is_valid_address(&req.merchant_address) {
            return Err(invalid("invalid merchant_address"));
        }
        if let Some(addr) = req.return_address.as_deref().filter(|a| !a.is_empty()) {
            if !self.settings.is_valid_address(addr) {
                return Err(invalid("invalid return_address"));
            }
        }
        if req.ipn_uri.trim().is_empty() {
            return Err(invalid("ipn_uri is required"));
        }
        if req.order_id.trim().is_empty() {
            return Err(invalid("order_id is required"));
        }
        if req.public_key.len() != self.settings.public_key_len {
            return Err(invalid("invalid public_key"));
        }
        let target = to_atomic(req.currency_amount, rate, self.settings.atoms)
            .ok_or_else(|| invalid("currency_amount is below one atomic unit"))?;
        let fee = compute_fee(target, self.settings.fee_rate, self.settings.min_fee);
        if target <= fee {
            return Err(invalid("currency_amount does not cover the fee"));
        }
        Ok(Priced { currency_code, target, fee })
    }

    pub async fn create(&self, req: InvoiceRequest) -> Result<CreatedInvoice, InvoiceError> {
        let priced = self.validate(&req)?;
        let payment_id = generate_payment_id();
        let payment_address = self.wallet.receiving_address(&payment_id).await?;
        let created_at = crate::now();

        let invoice = Invoice {
            payment_id: payment_id.clone(),
            status: InvoiceStatus::New,
            merchant_address: req.merchant_address,
            return_address: req.return_address.filter(|a| !a.is_empty()),
            payment_address,
            currency_code: priced.currency_code,
            currency_amount: req.currency_amount,
            target_atomic_amount: priced.target,
            amount_received: 0,
            fee: priced.fee,
            order_id: req.order_id,
            custom_data: req.custom.unwrap_or_default(),
            public_key: req.public_key,
            callback_uri: req.ipn_uri,
            created_at,
            expires_at: created_at + self.settings.invoice_ttl_secs,
            confirming_block: None,
        };

        self.store.create(&payment_id, &invoice.to_fields())?;
        if let Err(err) = self.store.add_to_set(OPEN_INVOICES, &payment_id) {
            if let Err(cleanup) = self.store.delete(&payment_id) {
                error!("payment_id={payment_id} left without open_invoices entry, delete failed: {cleanup}");
            }
            return Err(err.into());
        }
        arm_expiry(self.store.clone(), self.timers.clone(), payment_id.clone(), self.settings.invoice_ttl());

        metrics::inc(&metrics::INVOICES_CREATED);
        info!(
            "invoice created payment_id={} order_id={} atomic_amount={} fee={}",
            payment_id, invoice.order_id, invoice.target_atomic_amount, invoice.fee
        );

        let notifier = self.notifier.clone();
        tokio::spawn(async move { deliver(notifier.as_ref(), &invoice, NotifyEvent::Created).await });

        Ok(CreatedInvoice { payment_id, timestamp: created_at })
    }

    pub fn query(&self, payment_id: &str) -> Result<InvoiceView, InvoiceError> {
        let invoice = Invoice::load(self.store.as_ref(), payment_id)?;
        Ok(InvoiceView::from(&invoice))
    }

    /// Applies one payment event. Safe under duplicate and concurrent delivery:
    /// the amount is added with an atomic increment and promotion is decided by
    /// the `open_invoices` claim.
    pub fn record_payment(&self, event: &PaymentReceived) -> Result<PaymentOutcome, InvoiceError> {
        let id = event.payment_id.as_str();
        let fields = self.store.get_fields(id, &[field::STATUS, field::ATOMIC_AMOUNT, field::EXPIRATION])?;
        let status = status_of(id, &fields)?;
        if status.is_terminal() {
            info!("payment ignored payment_id={id} status={status} amount={}", event.amount);
            return Ok(PaymentOutcome::Ignored(status));
        }

        let received = self.store.increment_field(id, field::AMOUNT_RECEIVED, event.amount)?;
        metrics::inc(&metrics::PAYMENTS_RECEIVED);
        let target = int_of(id, &fields, field::ATOMIC_AMOUNT)?;
        debug!("payment recorded payment_id={id} amount={} received={received} target={target}", event.amount);

        // Expiry or settlement may have landed between the read and the increment.
        let current = self.store.get_fields(id, &[field::STATUS, field::SETTLE_CLAIM])?;
        let status = status_of(id, &current)?;
        if status.is_terminal() {
            if current.get(field::SETTLE_CLAIM).is_some_and(|claim| claim != "0") {
                error!(
                    "payment_id={id} amount={} received={received} arrived after {status} settlement, reconcile manually",
                    event.amount
                );
                return Ok(PaymentOutcome::Ignored(status));
            }
            info!("payment_id={id} amount={} landed on {status} invoice before settlement", event.amount);
            return Ok(PaymentOutcome::Recorded { received });
        }
        if status != InvoiceStatus::New || received < target {
            return Ok(PaymentOutcome::Recorded { received });
        }

        self.timers.cancel(id);
        if !self.store.remove_from_set(OPEN_INVOICES, id)? {
            debug!("promotion skipped payment_id={id}, already claimed");
            return Ok(PaymentOutcome::Recorded { received });
        }

        let mut update = Fields::new();
        update.insert(field::STATUS.to_string(), InvoiceStatus::AwaitingConfirmation.as_str().to_string());
        update.insert(field::BLOCK.to_string(), event.block.to_string());
        let promoted = self
            .store
            .set_fields(id, &update)
            .and_then(|_| self.store.add_to_set(AWAITING_CONFIRMATION, id));
        if let Err(err) = promoted {
            warn!("promotion payment_id={id} failed: {err}");
            self.release_claim(id, &fields);
            return Err(err.into());
        }

        info!("invoice awaiting confirmation payment_id={id} received={received} block={}", event.block);
        Ok(PaymentOutcome::Promoted { received, block: event.block })
    }

    /// Puts a failed promotion back into the `new` path so expiry can still happen.
    fn release_claim(&self, id: &str, fields: &Fields) {
        let mut revert = Fields::new();
        revert.insert(field::STATUS.to_string(), InvoiceStatus::New.as_str().to_string());
        if let Err(err) = self.store.set_fields(id, &revert).and_then(|_| self.store.add_to_set(OPEN_INVOICES, id)) {
            error!("restoring open invoice payment_id={id} failed, no expiry will run: {err}");
            return;
        }
        let expires_at = int_of(id, fields, field::EXPIRATION).unwrap_or(0);
        let delay = Duration::from_secs(expires_at.saturating_sub(crate::now()));
        arm_expiry(self.store.clone(), self.timers.clone(), id.to_string(), delay);
    }

    /// Re-arms expiry timers for every invoice still in `new`. Invoices whose
    /// deadline passed while the process was down expire right away.
    pub fn recover(&self) -> Result<usize, InvoiceError> {
        let now = crate::now();
        let mut armed = 0;
        for id in self.store.members_of(OPEN_INVOICES)? {
            let fields = match self.store.get_fields(&id, &[field::STATUS, field::EXPIRATION]) {
                Ok(fields) => fields,
                Err(StoreError::NotFound(_)) => {
                    warn!("open invoice payment_id={id} has no record, dropping");
                    self.store.remove_from_set(OPEN_INVOICES, &id)?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if status_of(&id, &fields)? != InvoiceStatus::New {
                self.store.remove_from_set(OPEN_INVOICES, &id)?;
                continue;
            }
            let expires_at = int_of(&id, &fields, field::EXPIRATION)?;
            let delay = Duration::from_secs(expires_at.saturating_sub(now));
            arm_expiry(self.store.clone(), self.timers.clone(), id, delay);
            armed += 1;
        }
        info!("recovered expiry timers count={armed}");
        Ok(armed)
    }
}

fn status_of(id: &str, fields: &Fields) -> Result<InvoiceStatus, StoreError> {
    fields
        .get(field::STATUS)
        .ok_or_else(|| StoreError::Corrupt { id: id.to_string(), reason: "missing status".into() })?
        .parse::<InvoiceStatus>()
        .map_err(|reason| StoreError::Corrupt { id: id.to_string(), reason })
}

fn int_of(id: &str, fields: &Fields, name: &str) -> Result<u64, StoreError> {
    let raw = fields
        .get(name)
        .ok_or_else(|| StoreError::Corrupt { id: id.to_string(), reason: format!("missing {name}") })?;
    parse_u64(id, name, raw)
}

fn arm_expiry(store: Store, timers: Arc<ExpiryTimers>, id: String, delay: Duration) {
    let registry = timers.clone();
    let key = id.clone();
    timers.schedule(&key, delay, move || async move {
        match expire_invoice(store.as_ref(), &id) {
            Ok(true) => {
                metrics::inc(&metrics::INVOICES_EXPIRED);
                info!("invoice expired payment_id={id}");
            }
            Ok(false) => debug!("expiry skipped payment_id={id}, already claimed"),
            Err(err) => {
                warn!("expiry payment_id={id} failed: {err}, retrying in {}s", EXPIRY_RETRY.as_secs());
                arm_expiry(store, registry, id, EXPIRY_RETRY);
            }
        }
    });
}

/// Moves a `new` invoice to `expired` if this caller wins the `open_invoices`
/// claim. Returns false when a promotion (or an earlier expiry) got there first.
pub fn expire_invoice(store: &dyn InvoiceStore, id: &str) -> Result<bool, StoreError> {
    if !store.remove_from_set(OPEN_INVOICES, id)? {
        return Ok(false);
    }
    let mut update = Fields::new();
    update.insert(field::STATUS.to_string(), InvoiceStatus::Expired.as_str().to_string());
    let result = store.set_fields(id, &update).and_then(|_| store.add_to_set(EXPIRED_INVOICES, id));
    match result {
        Ok(_) => Ok(true),
        Err(StoreError::NotFound(_)) => Ok(false),
        Err(err) => {
            // Give the claim back so the retry can take it again.
            if let Err(restore) = store.add_to_set(OPEN_INVOICES, id) {
                error!("payment_id={id} expiry claim lost, invoice is in no set: {restore}");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyError;
    use crate::store::memory_store;
    use crate::wallet::{ChainStatus, Transfer};
    use async_trait::async_trait;

    struct StubWallet;

    #[async_trait]
    impl WalletGateway for StubWallet {
        async fn chain_status(&self) -> Result<ChainStatus, WalletError> {
            Ok(ChainStatus { height: 1, balance: 0, synced: true })
        }
        async fn receiving_address(&self, payment_id: &str) -> Result<String, WalletError> {
            Ok(format!("TRTLpay{payment_id}"))
        }
        async fn submit_transfer(&self, _transfers: &[Transfer]) -> Result<(), WalletError> {
            Ok(())
        }
    }

    struct SilentNotifier;

    #[async_trait]
    impl Notifier for SilentNotifier {
        async fn notify(&self, _invoice: &Invoice, _event: NotifyEvent) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    fn lifecycle(store: Store) -> InvoiceLifecycle {
        let settings = Settings { min_fee: 10, ..Settings::default() };
        InvoiceLifecycle::new(
            store,
            Arc::new(StubWallet),
            Arc::new(SilentNotifier),
            Arc::new(ExpiryTimers::new()),
            Arc::new(RateTable::new([("trtl", 1.0), ("usd", 0.5)])),
            Arc::new(settings),
        )
    }

    fn request() -> InvoiceRequest {
        InvoiceRequest {
            return_address: None,
            ipn_uri: "http://merchant.test/ipn".into(),
            currency_code: "TRTL".into(),
            currency_amount: 10.0,
            order_id: "order-1".into(),
            custom: None,
            public_key: "k".repeat(64),
            merchant_address: format!("TRTL{}", "m".repeat(95)),
        }
    }

    #[tokio::test]
    async fn creates_priced_invoice() {
        let store = memory_store();
        let lc = lifecycle(store.clone());
        let created = lc.create(request()).await.unwrap();
        let view = lc.query(&created.payment_id).unwrap();
        assert_eq!(view.status, InvoiceStatus::New);
        assert_eq!(view.atomic_amount, 1000);
        assert_eq!(view.fee, 10);
        assert_eq!(view.currency_code, "trtl");
        assert!(view.payment_address.ends_with(&created.payment_id));
        assert!(store.members_of(OPEN_INVOICES).unwrap().contains(&created.payment_id));
        assert!(lc.timers().is_scheduled(&created.payment_id));
    }

    #[tokio::test]
    async fn negative_amount_creates_nothing() {
        let store = memory_store();
        let lc = lifecycle(store.clone());
        let req = InvoiceRequest { currency_amount: -5.0, ..request() };
        let err = lc.create(req).await.unwrap_err();
        assert!(matches!(err, InvoiceError::Invalid(_)));
        assert!(store.members_of(OPEN_INVOICES).unwrap().is_empty());
        assert!(lc.timers().is_empty());
    }

    #[tokio::test]
    async fn validation_rules() {
        let lc = lifecycle(memory_store());
        let cases = vec![
            InvoiceRequest { currency_code: "eur".into(), ..request() },
            InvoiceRequest { merchant_address: "TRTLshort".into(), ..request() },
            InvoiceRequest { return_address: Some("nope".into()), ..request() },
            InvoiceRequest { ipn_uri: " ".into(), ..request() },
            InvoiceRequest { order_id: String::new(), ..request() },
            InvoiceRequest { public_key: "k".repeat(63), ..request() },
            // 0.05 coin = 5 atomic units, below the minimum fee
            InvoiceRequest { currency_amount: 0.05, ..request() },
        ];
        for req in cases {
            assert!(matches!(lc.create(req.clone()).await, Err(InvoiceError::Invalid(_))), "{req:?}");
        }
        let ok = InvoiceRequest { return_address: Some(String::new()), ..request() };
        assert!(lc.create(ok).await.is_ok());
    }

    #[test]
    fn payment_event_accepts_string_block() {
        let event: PaymentReceived =
            serde_json::from_str(r#"{"payment_id":"abc","amount":1000,"block":"42"}"#).unwrap();
        assert_eq!(event, PaymentReceived { payment_id: "abc".into(), amount: 1000, block: 42 });
        assert!(serde_json::from_str::<PaymentReceived>(r#"{"payment_id":"abc","amount":1,"block":"x"}"#).is_err());
    }

    #[tokio::test]
    async fn payment_promotes_once_target_met() {
        let store = memory_store();
        let lc = lifecycle(store.clone());
        let id = lc.create(request()).await.unwrap().payment_id;

        let partial = PaymentReceived { payment_id: id.clone(), amount: 400, block: 7 };
        assert_eq!(lc.record_payment(&partial).unwrap(), PaymentOutcome::Recorded { received: 400 });

        let rest = PaymentReceived { payment_id: id.clone(), amount: 600, block: 9 };
        assert_eq!(lc.record_payment(&rest).unwrap(), PaymentOutcome::Promoted { received: 1000, block: 9 });
        assert!(!lc.timers().is_scheduled(&id));
        assert!(store.members_of(AWAITING_CONFIRMATION).unwrap().contains(&id));
        assert!(!store.members_of(OPEN_INVOICES).unwrap().contains(&id));

        // duplicate delivery after promotion only adds to the amount
        assert_eq!(lc.record_payment(&rest).unwrap(), PaymentOutcome::Recorded { received: 1600 });
        let invoice = Invoice::load(store.as_ref(), &id).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::AwaitingConfirmation);
        assert_eq!(invoice.confirming_block, Some(9));
    }

    #[tokio::test]
    async fn expired_invoice_ignores_payments() {
        let store = memory_store();
        let lc = lifecycle(store.clone());
        let id = lc.create(request()).await.unwrap().payment_id;
        assert!(lc.timers().cancel(&id));
        assert!(expire_invoice(store.as_ref(), &id).unwrap());
        assert!(!expire_invoice(store.as_ref(), &id).unwrap());

        let late = PaymentReceived { payment_id: id.clone(), amount: 1000, block: 3 };
        assert_eq!(lc.record_payment(&late).unwrap(), PaymentOutcome::Ignored(InvoiceStatus::Expired));
        assert_eq!(Invoice::load(store.as_ref(), &id).unwrap().amount_received, 0);
        assert!(store.members_of(EXPIRED_INVOICES).unwrap().contains(&id));
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let lc = lifecycle(memory_store());
        let event = PaymentReceived { payment_id: "nope".into(), amount: 1, block: 1 };
        assert!(matches!(lc.record_payment(&event), Err(InvoiceError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_expires_unpaid_invoice() {
        let store = memory_store();
        let lc = lifecycle(store.clone());
        let id = lc.create(request()).await.unwrap().payment_id;
        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert_eq!(Invoice::load(store.as_ref(), &id).unwrap().status, InvoiceStatus::Expired);
        assert!(store.members_of(EXPIRED_INVOICES).unwrap().contains(&id));
    }

    #[tokio::test]
    async fn recover_rearms_open_invoices() {
        let store = memory_store();
        let first = lifecycle(store.clone());
        let id = first.create(request()).await.unwrap().payment_id;
        store.add_to_set(OPEN_INVOICES, "vanished").unwrap();

        // a fresh process has an empty timer table
        let second = lifecycle(store.clone());
        assert_eq!(second.recover().unwrap(), 1);
        assert!(second.timers().is_scheduled(&id));
        assert!(!store.members_of(OPEN_INVOICES).unwrap().contains("vanished"));
    }

    /// Marks the invoice settled right before the amount lands, as a
    /// concurrent expiry plus settlement cycle would.
    struct SettlesBeforeIncrement {
        inner: Store,
        claim: &'static str,
    }

    impl InvoiceStore for SettlesBeforeIncrement {
        fn create(&self, id: &str, fields: &Fields) -> Result<(), StoreError> {
            self.inner.create(id, fields)
        }
        fn get_fields(&self, id: &str, names: &[&str]) -> Result<Fields, StoreError> {
            self.inner.get_fields(id, names)
        }
        fn set_fields(&self, id: &str, fields: &Fields) -> Result<(), StoreError> {
            self.inner.set_fields(id, fields)
        }
        fn increment_field(&self, id: &str, name: &str, delta: u64) -> Result<u64, StoreError> {
            if name == field::AMOUNT_RECEIVED {
                let mut settled = Fields::new();
                settled.insert(field::STATUS.to_string(), "expired".to_string());
                settled.insert(field::SETTLE_CLAIM.to_string(), self.claim.to_string());
                self.inner.set_fields(id, &settled)?;
            }
            self.inner.increment_field(id, name, delta)
        }
        fn add_to_set(&self, set: &str, id: &str) -> Result<bool, StoreError> {
            self.inner.add_to_set(set, id)
        }
        fn remove_from_set(&self, set: &str, id: &str) -> Result<bool, StoreError> {
            self.inner.remove_from_set(set, id)
        }
        fn members_of(&self, set: &str) -> Result<std::collections::BTreeSet<String>, StoreError> {
            self.inner.members_of(set)
        }
        fn expire_after(&self, id: &str, ttl: Duration) -> Result<(), StoreError> {
            self.inner.expire_after(id, ttl)
        }
        fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id)
        }
        fn purge_expired(&self) -> Result<usize, StoreError> {
            self.inner.purge_expired()
        }
    }

    #[tokio::test]
    async fn payment_after_settlement_is_not_promoted() {
        let store: Store = Arc::new(SettlesBeforeIncrement { inner: memory_store(), claim: "1" });
        let lc = lifecycle(store.clone());
        let id = lc.create(request()).await.unwrap().payment_id;

        let event = PaymentReceived { payment_id: id.clone(), amount: 1000, block: 5 };
        assert_eq!(lc.record_payment(&event).unwrap(), PaymentOutcome::Ignored(InvoiceStatus::Expired));
        assert!(store.members_of(AWAITING_CONFIRMATION).unwrap().is_empty());
        assert_eq!(Invoice::load(store.as_ref(), &id).unwrap().status, InvoiceStatus::Expired);
    }

    #[tokio::test]
    async fn payment_on_unsettled_expiry_is_kept_for_refund() {
        let store: Store = Arc::new(SettlesBeforeIncrement { inner: memory_store(), claim: "0" });
        let lc = lifecycle(store.clone());
        let id = lc.create(request()).await.unwrap().payment_id;

        let event = PaymentReceived { payment_id: id.clone(), amount: 1000, block: 5 };
        assert_eq!(lc.record_payment(&event).unwrap(), PaymentOutcome::Recorded { received: 1000 });
        assert!(store.members_of(AWAITING_CONFIRMATION).unwrap().is_empty());
        assert_eq!(Invoice::load(store.as_ref(), &id).unwrap().amount_received, 1000);
    }
}
