use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Fiat (or coin) units per whole coin, keyed by lower-case currency code.
///
/// Populated from configuration; an external rate poller may update it
/// through [`RateTable::set`].
#[derive(Debug, Default)]
pub struct RateTable {
    rates: RwLock<HashMap<String, f64>>,
}

impl RateTable {
    pub fn new<K: AsRef<str>>(rates: impl IntoIterator<Item = (K, f64)>) -> Self {
        let table = Self::default();
        for (code, rate) in rates {
            table.set(code.as_ref(), rate);
        }
        table
    }

    pub fn set(&self, code: &str, rate: f64) {
        self.rates.write().unwrap_or_else(PoisonError::into_inner).insert(code.to_ascii_lowercase(), rate);
    }

    /// `None` for unknown codes.
    pub fn get(&self, code: &str) -> Option<f64> {
        self.rates.read().unwrap_or_else(PoisonError::into_inner).get(&code.to_ascii_lowercase()).copied()
    }

    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.rates.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        codes.sort();
        codes
    }
}
