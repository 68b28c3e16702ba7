use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid { name, reason: reason.into() }
}

/// Tunables shared by invoice intake and the settlement loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scan_interval_secs: u64,
    pub min_confirmations: u64,
    pub transfer_attempts: u32,
    pub retry_delay_secs: u64,
    pub invoice_ttl_secs: u64,
    /// How long a terminal record stays readable before the store drops it.
    pub grace_secs: u64,
    pub fee_rate: f64,
    pub min_fee: u64,
    /// Atomic units per whole coin.
    pub atoms: u64,
    pub address_prefix: String,
    /// Accepted address lengths, prefix included (standard, integrated).
    pub address_lengths: Vec<usize>,
    pub public_key_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 15,
            min_confirmations: 1,
            transfer_attempts: 3,
            retry_delay_secs: 5,
            invoice_ttl_secs: 3600,
            grace_secs: 60,
            fee_rate: 0.0,
            min_fee: 0,
            atoms: 100,
            address_prefix: "TRTL".to_string(),
            address_lengths: vec![99, 187],
            public_key_len: 64,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.scan_interval_secs == 0 {
            return Err(invalid("scan_interval_secs", "must be positive"));
        }
        if self.transfer_attempts == 0 {
            return Err(invalid("transfer_attempts", "must be at least 1"));
        }
        if self.invoice_ttl_secs == 0 {
            return Err(invalid("invoice_ttl_secs", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.fee_rate) {
            return Err(invalid("fee_rate", format!("{} is outside [0, 1)", self.fee_rate)));
        }
        if self.atoms == 0 {
            return Err(invalid("atoms", "must be positive"));
        }
        if self.address_lengths.iter().any(|len| *len <= self.address_prefix.len()) {
            return Err(invalid("address_lengths", "every length must exceed the prefix"));
        }
        if self.public_key_len == 0 {
            return Err(invalid("public_key_len", "must be positive"));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn invoice_ttl(&self) -> Duration {
        Duration::from_secs(self.invoice_ttl_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    /// Prefix followed by alphanumerics, at one of the accepted lengths.
    pub fn is_valid_address(&self, address: &str) -> bool {
        address.starts_with(&self.address_prefix)
            && self.address_lengths.contains(&address.len())
            && address.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(len: usize) -> String {
        format!("TRTL{}", "a".repeat(len - 4))
    }

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn address_format() {
        let settings = Settings::default();
        assert!(settings.is_valid_address(&address(99)));
        assert!(settings.is_valid_address(&address(187)));
        assert!(!settings.is_valid_address(&address(100)));
        assert!(!settings.is_valid_address(&format!("XRTL{}", "a".repeat(95))));
        assert!(!settings.is_valid_address(&format!("TRTL{}-", "a".repeat(94))));
    }

    #[test]
    fn rejects_nonsense() {
        let settings = Settings { transfer_attempts: 0, ..Settings::default() };
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid { name: "transfer_attempts", .. })));
        let settings = Settings { fee_rate: 1.5, ..Settings::default() };
        assert!(settings.validate().is_err());
    }
}
