use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::invoice::{field, Invoice, InvoiceStatus};
use crate::metrics;
use crate::notify::{deliver, Notifier, NotifyEvent};
use crate::outbox::{PendingTransfer, TransferOutbox};
use crate::settings::Settings;
use crate::store::{Fields, Store, StoreError, AWAITING_CONFIRMATION, EXPIRED_INVOICES};
use crate::wallet::{Transfer, WalletError, WalletGateway};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("wallet unavailable: {0}")]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one settlement cycle did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub height: u64,
    pub paid: Vec<String>,
    pub expired: Vec<String>,
    /// Accepted by the wallet this cycle.
    pub submitted: Vec<PendingTransfer>,
    /// Still in the outbox after every attempt failed.
    pub deferred: Vec<PendingTransfer>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.paid.is_empty() && self.expired.is_empty() && self.submitted.is_empty() && self.deferred.is_empty()
    }
}

/// Periodic reconciliation: confirms promoted invoices, settles expired ones,
/// submits the staged transfers as one batch and notifies merchants.
pub struct SettlementEngine {
    store: Store,
    wallet: Arc<dyn WalletGateway>,
    notifier: Arc<dyn Notifier>,
    outbox: TransferOutbox,
    settings: Arc<Settings>,
}

impl SettlementEngine {
    pub fn new(store: Store, wallet: Arc<dyn WalletGateway>, notifier: Arc<dyn Notifier>, settings: Arc<Settings>) -> Self {
        let outbox = TransferOutbox::new(store.clone());
        Self { store, wallet, notifier, outbox, settings }
    }

    pub fn outbox(&self) -> &TransferOutbox {
        &self.outbox
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, EngineError> {
        let chain = self.wallet.chain_status().await?;
        if !chain.synced {
            warn!("wallet not synced height={}", chain.height);
        }
        let mut report = CycleReport { height: chain.height, ..CycleReport::default() };
        let mut settled = Vec::new();

        for id in self.store.members_of(AWAITING_CONFIRMATION)? {
            match self.settle_confirmed(&id, chain.height) {
                Ok(Some(invoice)) => {
                    report.paid.push(id);
                    settled.push((invoice, NotifyEvent::Paid));
                }
                Ok(None) => {}
                Err(err) => warn!("settlement payment_id={id} skipped: {err}"),
            }
        }
        for id in self.store.members_of(EXPIRED_INVOICES)? {
            match self.settle_expired(&id) {
                Ok(Some(invoice)) => {
                    report.expired.push(id);
                    settled.push((invoice, NotifyEvent::Expired));
                }
                Ok(None) => {}
                Err(err) => warn!("refund payment_id={id} skipped: {err}"),
            }
        }

        match self.outbox.pending() {
            Ok(pending) if pending.is_empty() => {}
            Ok(pending) => {
                if self.submit(&pending).await {
                    self.clear_outbox(&pending).await;
                    report.submitted = pending;
                } else {
                    report.deferred = pending;
                }
            }
            Err(err) => warn!("outbox unreadable, transfers wait for next cycle: {err}"),
        }

        self.notify_all(settled).await;
        Ok(report)
    }

    /// Finalizes one member of the awaiting set once deep enough. The
    /// settlement claim is taken before staging and the set removal comes
    /// last, so a failure at any later step is finished by a later cycle
    /// without staging again.
    fn settle_confirmed(&self, id: &str, height: u64) -> Result<Option<Invoice>, StoreError> {
        let Some(mut invoice) = self.load_member(AWAITING_CONFIRMATION, id)? else {
            return Ok(None);
        };
        match invoice.status {
            InvoiceStatus::AwaitingConfirmation => {
                let block = invoice.confirming_block.ok_or_else(|| StoreError::Corrupt {
                    id: id.to_string(),
                    reason: "awaiting confirmation without block".into(),
                })?;
                let depth = height.saturating_sub(block);
                if depth < self.settings.min_confirmations {
                    debug!("payment_id={id} depth={depth} waiting");
                    return Ok(None);
                }
            }
            // Left paid by a cycle that failed before leaving the set.
            InvoiceStatus::Paid => {}
            other => {
                warn!("payment_id={id} status={other} in awaiting set, dropping");
                self.store.remove_from_set(AWAITING_CONFIRMATION, id)?;
                return Ok(None);
            }
        }

        if self.claim_settlement(id)? {
            if let Some(amount) = invoice.net_amount() {
                self.stage_claimed(&PendingTransfer {
                    payment_id: id.to_string(),
                    address: invoice.merchant_address.clone(),
                    amount,
                })?;
            }
        } else {
            debug!("payment_id={id} transfer already staged, finishing settlement");
        }
        self.mark(id, InvoiceStatus::Paid)?;
        self.store.expire_after(id, self.settings.grace())?;
        self.store.remove_from_set(AWAITING_CONFIRMATION, id)?;

        invoice.status = InvoiceStatus::Paid;
        metrics::inc(&metrics::INVOICES_PAID);
        info!(
            "invoice paid payment_id={id} received={} fee={} forwarded={}",
            invoice.amount_received,
            invoice.fee,
            invoice.net_amount().unwrap_or(0)
        );
        Ok(Some(invoice))
    }

    /// Refunds (or forwards) whatever an expired invoice collected, net of fee.
    fn settle_expired(&self, id: &str) -> Result<Option<Invoice>, StoreError> {
        let Some(invoice) = self.load_member(EXPIRED_INVOICES, id)? else {
            return Ok(None);
        };
        if invoice.status != InvoiceStatus::Expired {
            warn!("payment_id={id} status={} in expired set, dropping", invoice.status);
            self.store.remove_from_set(EXPIRED_INVOICES, id)?;
            return Ok(None);
        }

        if !self.claim_settlement(id)? {
            debug!("payment_id={id} refund already staged, finishing settlement");
        } else if let Some(amount) = invoice.net_amount() {
            self.stage_claimed(&PendingTransfer {
                payment_id: id.to_string(),
                address: invoice.refund_address().to_string(),
                amount,
            })?;
            info!("refund staged payment_id={id} address={} amount={amount}", invoice.refund_address());
        }
        self.store.expire_after(id, self.settings.grace())?;
        self.store.remove_from_set(EXPIRED_INVOICES, id)?;
        Ok(Some(invoice))
    }

    /// Persisted once-only guard taken before anything is staged. A record
    /// that already carries a claim never produces a second transfer, even
    /// after its first one was submitted and cleared from the outbox.
    fn claim_settlement(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.store.increment_field(id, field::SETTLE_CLAIM, 1)? == 1)
    }

    /// Stages under a held claim. If staging fails the claim is reset so the
    /// next cycle can stage; if that reset fails too the transfer is never
    /// sent and has to be reconciled by hand.
    fn stage_claimed(&self, transfer: &PendingTransfer) -> Result<(), StoreError> {
        let id = transfer.payment_id.as_str();
        let Err(err) = self.outbox.stage(transfer) else {
            return Ok(());
        };
        let mut reset = Fields::new();
        reset.insert(field::SETTLE_CLAIM.to_string(), "0".to_string());
        if let Err(reset_err) = self.store.set_fields(id, &reset) {
            error!(
                "payment_id={id} amount={} address={} not staged and claim stuck: {reset_err}",
                transfer.amount, transfer.address
            );
        }
        Err(err)
    }

    /// Loads a set member, dropping it from the set if its record is gone.
    fn load_member(&self, set: &str, id: &str) -> Result<Option<Invoice>, StoreError> {
        match Invoice::load(self.store.as_ref(), id) {
            Ok(invoice) => Ok(Some(invoice)),
            Err(StoreError::NotFound(_)) => {
                warn!("payment_id={id} in {set} has no record, dropping");
                self.store.remove_from_set(set, id)?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn mark(&self, id: &str, status: InvoiceStatus) -> Result<(), StoreError> {
        let mut update = Fields::new();
        update.insert(field::STATUS.to_string(), status.as_str().to_string());
        self.store.set_fields(id, &update)
    }

    /// One batch, a bounded number of attempts with a fixed delay between them.
    async fn submit(&self, pending: &[PendingTransfer]) -> bool {
        let transfers: Vec<Transfer> = pending.iter().map(PendingTransfer::to_transfer).collect();
        let attempts = self.settings.transfer_attempts.max(1);
        for attempt in 1..=attempts {
            match self.wallet.submit_transfer(&transfers).await {
                Ok(()) => {
                    metrics::inc(&metrics::TRANSFERS_SUBMITTED);
                    info!("transfer batch outputs={} attempt={attempt} status=ok", transfers.len());
                    return true;
                }
                Err(err) => {
                    warn!("transfer batch outputs={} attempt={attempt} failed: {err}", transfers.len());
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_delay()).await;
                    }
                }
            }
        }
        metrics::inc(&metrics::TRANSFER_FAILURES);
        error!("transfer batch outputs={} deferred after {attempts} attempts", transfers.len());
        false
    }

    async fn clear_outbox(&self, sent: &[PendingTransfer]) {
        let attempts = self.settings.transfer_attempts.max(1);
        for attempt in 1..=attempts {
            match self.outbox.clear(sent) {
                Ok(()) => return,
                Err(err) => {
                    error!("outbox clear attempt={attempt} failed after wallet accepted batch: {err}");
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_delay()).await;
                    }
                }
            }
        }
    }

    async fn notify_all(&self, settled: Vec<(Invoice, NotifyEvent)>) {
        let mut tasks = JoinSet::new();
        for (invoice, event) in settled {
            let notifier = self.notifier.clone();
            tasks.spawn(async move { deliver(notifier.as_ref(), &invoice, event).await });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Runs cycles until `shutdown` flips to true. A cycle in progress always
    /// finishes; only the sleep between cycles is interrupted.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "settlement loop started interval={}s min_confirmations={}",
            self.settings.scan_interval_secs, self.settings.min_confirmations
        );
        while !*shutdown.borrow() {
            match self.run_cycle().await {
                Ok(report) if report.is_idle() => debug!("settlement cycle idle height={}", report.height),
                Ok(report) => info!(
                    "settlement cycle height={} paid={} expired={} submitted={} deferred={}",
                    report.height,
                    report.paid.len(),
                    report.expired.len(),
                    report.submitted.len(),
                    report.deferred.len()
                ),
                Err(err) => warn!("settlement cycle skipped: {err}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.scan_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("settlement loop stopped");
    }
}

/// Drops records whose post-settlement TTL has elapsed.
pub async fn run_janitor(store: Store, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        match store.purge_expired() {
            Ok(0) => {}
            Ok(purged) => debug!("purged expired records count={purged}"),
            Err(err) => warn!("purge failed: {err}"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
