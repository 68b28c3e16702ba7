use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub static INVOICES_CREATED: AtomicU64 = AtomicU64::new(0);
pub static PAYMENTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
pub static INVOICES_PAID: AtomicU64 = AtomicU64::new(0);
pub static INVOICES_EXPIRED: AtomicU64 = AtomicU64::new(0);
pub static TRANSFERS_SUBMITTED: AtomicU64 = AtomicU64::new(0);
pub static TRANSFER_FAILURES: AtomicU64 = AtomicU64::new(0);
pub static NOTIFICATION_FAILURES: AtomicU64 = AtomicU64::new(0);

pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub invoices_created: u64,
    pub payments_received: u64,
    pub invoices_paid: u64,
    pub invoices_expired: u64,
    pub transfers_submitted: u64,
    pub transfer_failures: u64,
    pub notification_failures: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        invoices_created: INVOICES_CREATED.load(Ordering::Relaxed),
        payments_received: PAYMENTS_RECEIVED.load(Ordering::Relaxed),
        invoices_paid: INVOICES_PAID.load(Ordering::Relaxed),
        invoices_expired: INVOICES_EXPIRED.load(Ordering::Relaxed),
        transfers_submitted: TRANSFERS_SUBMITTED.load(Ordering::Relaxed),
        transfer_failures: TRANSFER_FAILURES.load(Ordering::Relaxed),
        notification_failures: NOTIFICATION_FAILURES.load(Ordering::Relaxed),
    }
}
