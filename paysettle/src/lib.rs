//! Invoice settlement core.
//!
//! Owns invoice state, reconciles payment events against chain depth,
//! forwards net proceeds in batched wallet transfers and notifies merchants.

pub mod engine;
pub mod invoice;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod outbox;
pub mod rates;
pub mod settings;
pub mod signing;
#[cfg(feature = "sled-store")]
pub mod storage;
pub mod store;
pub mod timers;
pub mod wallet;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_else(|_| Duration::from_secs(0)).as_secs()
}
