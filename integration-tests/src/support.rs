use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use paysettle::engine::SettlementEngine;
use paysettle::invoice::Invoice;
use paysettle::lifecycle::{InvoiceLifecycle, InvoiceRequest, PaymentOutcome, PaymentReceived};
use paysettle::notify::{Notifier, NotifyError, NotifyEvent};
use paysettle::rates::RateTable;
use paysettle::settings::Settings;
use paysettle::store::{Fields, InvoiceStore, Store, StoreError};
use paysettle::timers::ExpiryTimers;
use paysettle::wallet::{ChainStatus, Transfer, WalletError, WalletGateway};

/// Wallet double: chain height is set by the test, submissions are recorded
/// and the next `n` submissions can be made to fail.
#[derive(Default)]
pub struct RecordingWallet {
    height: AtomicU64,
    offline: AtomicBool,
    failures_left: AtomicU32,
    submit_calls: AtomicU32,
    accepted: Mutex<Vec<Vec<Transfer>>>,
}

impl RecordingWallet {
    pub fn at_height(height: u64) -> Arc<Self> {
        let wallet = Self::default();
        wallet.height.store(height, Ordering::SeqCst);
        Arc::new(wallet)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_next_submissions(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Batches the wallet accepted, in order.
    pub fn accepted(&self) -> Vec<Vec<Transfer>> {
        self.accepted.lock().unwrap().clone()
    }

    pub fn accepted_transfers(&self) -> Vec<Transfer> {
        self.accepted().into_iter().flatten().collect()
    }
}

#[async_trait]
impl WalletGateway for RecordingWallet {
    async fn chain_status(&self) -> Result<ChainStatus, WalletError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(WalletError::Http(503));
        }
        Ok(ChainStatus { height: self.height.load(Ordering::SeqCst), balance: 0, synced: true })
    }

    async fn receiving_address(&self, payment_id: &str) -> Result<String, WalletError> {
        Ok(format!("TRTLintegrated{payment_id}"))
    }

    async fn submit_transfer(&self, transfers: &[Transfer]) -> Result<(), WalletError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        if failing {
            debug!("fake wallet refusing batch of {}", transfers.len());
            return Err(WalletError::Rejected("node busy".into()));
        }
        self.accepted.lock().unwrap().push(transfers.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, NotifyEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(String, NotifyEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, payment_id: &str) -> Vec<NotifyEvent> {
        self.events().into_iter().filter(|(id, _)| id == payment_id).map(|(_, event)| event).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, invoice: &Invoice, event: NotifyEvent) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push((invoice.payment_id.clone(), event));
        Ok(())
    }
}

/// Store calls that [`FlakyStore`] can fail once on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    SetFields,
    RemoveFromSet,
    ExpireAfter,
}

/// Store wrapper whose writes to named sets can be made to fail, and whose
/// next call of a given kind can be made to fail once.
pub struct FlakyStore {
    inner: Store,
    broken_sets: Mutex<BTreeSet<String>>,
    fail_once: Mutex<Vec<StoreOp>>,
}

impl FlakyStore {
    pub fn wrap(inner: Store) -> Arc<Self> {
        Arc::new(Self { inner, broken_sets: Mutex::new(BTreeSet::new()), fail_once: Mutex::new(Vec::new()) })
    }

    pub fn break_set(&self, set: &str) {
        self.broken_sets.lock().unwrap().insert(set.to_string());
    }

    pub fn heal(&self) {
        self.broken_sets.lock().unwrap().clear();
        self.fail_once.lock().unwrap().clear();
    }

    pub fn fail_next(&self, op: StoreOp) {
        self.fail_once.lock().unwrap().push(op);
    }

    fn check_set(&self, set: &str) -> Result<(), StoreError> {
        if self.broken_sets.lock().unwrap().contains(set) {
            return Err(StoreError::Unavailable(format!("set {set} offline")));
        }
        Ok(())
    }

    fn check_op(&self, op: StoreOp) -> Result<(), StoreError> {
        let mut pending = self.fail_once.lock().unwrap();
        if let Some(pos) = pending.iter().position(|p| *p == op) {
            pending.remove(pos);
            debug!("flaky store failing {op:?}");
            return Err(StoreError::Unavailable(format!("{op:?} failed")));
        }
        Ok(())
    }
}

impl InvoiceStore for FlakyStore {
    fn create(&self, id: &str, fields: &Fields) -> Result<(), StoreError> {
        self.inner.create(id, fields)
    }
    fn get_fields(&self, id: &str, names: &[&str]) -> Result<Fields, StoreError> {
        self.inner.get_fields(id, names)
    }
    fn set_fields(&self, id: &str, fields: &Fields) -> Result<(), StoreError> {
        self.check_op(StoreOp::SetFields)?;
        self.inner.set_fields(id, fields)
    }
    fn increment_field(&self, id: &str, name: &str, delta: u64) -> Result<u64, StoreError> {
        self.inner.increment_field(id, name, delta)
    }
    fn add_to_set(&self, set: &str, id: &str) -> Result<bool, StoreError> {
        self.check_set(set)?;
        self.inner.add_to_set(set, id)
    }
    fn remove_from_set(&self, set: &str, id: &str) -> Result<bool, StoreError> {
        self.check_op(StoreOp::RemoveFromSet)?;
        self.inner.remove_from_set(set, id)
    }
    fn members_of(&self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        self.inner.members_of(set)
    }
    fn expire_after(&self, id: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_op(StoreOp::ExpireAfter)?;
        self.inner.expire_after(id, ttl)
    }
    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id)
    }
    fn purge_expired(&self) -> Result<usize, StoreError> {
        self.inner.purge_expired()
    }
}

/// 1 TRTL = 100 atomic units, minimum fee 10, no retry delay.
pub fn test_settings() -> Settings {
    Settings { min_fee: 10, retry_delay_secs: 0, transfer_attempts: 3, ..Settings::default() }
}

pub fn merchant_address() -> String {
    format!("TRTL{}", "m".repeat(95))
}

pub fn return_address() -> String {
    format!("TRTL{}", "r".repeat(95))
}

/// Invoice for `coins` TRTL paid out to [`merchant_address`].
pub fn request(coins: f64) -> InvoiceRequest {
    InvoiceRequest {
        return_address: None,
        ipn_uri: "http://merchant.test/ipn".into(),
        currency_code: "trtl".into(),
        currency_amount: coins,
        order_id: "order-1".into(),
        custom: None,
        public_key: "p".repeat(64),
        merchant_address: merchant_address(),
    }
}

/// Lifecycle and engine over one store, with recording doubles.
pub struct Harness {
    pub store: Store,
    pub wallet: Arc<RecordingWallet>,
    pub notifier: Arc<RecordingNotifier>,
    pub lifecycle: InvoiceLifecycle,
    pub engine: SettlementEngine,
}

impl Harness {
    pub fn new(store: Store) -> Self {
        Self::with_settings(store, test_settings())
    }

    pub fn with_settings(store: Store, settings: Settings) -> Self {
        let wallet = RecordingWallet::at_height(100);
        let notifier = Arc::new(RecordingNotifier::default());
        let settings = Arc::new(settings);
        let lifecycle = InvoiceLifecycle::new(
            store.clone(),
            wallet.clone(),
            notifier.clone(),
            Arc::new(ExpiryTimers::new()),
            Arc::new(RateTable::new([("trtl", 1.0)])),
            settings.clone(),
        );
        let engine = SettlementEngine::new(store.clone(), wallet.clone(), notifier.clone(), settings);
        Self { store, wallet, notifier, lifecycle, engine }
    }

    pub async fn create(&self, req: InvoiceRequest) -> String {
        self.lifecycle.create(req).await.unwrap().payment_id
    }

    pub fn pay(&self, payment_id: &str, amount: u64, block: u64) -> PaymentOutcome {
        self.lifecycle.record_payment(&PaymentReceived { payment_id: payment_id.to_string(), amount, block }).unwrap()
    }

    pub fn invoice(&self, payment_id: &str) -> Invoice {
        Invoice::load(self.store.as_ref(), payment_id).unwrap()
    }
}
