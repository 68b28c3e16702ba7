use log::warn;

use crate::invoice::parse_u64;
use crate::store::{Fields, Store, StoreError};
use crate::wallet::Transfer;

/// Index of staged transfers not yet accepted by the wallet.
pub const SETTLING_TRANSFERS: &str = "settling_transfers";
const RECORD_PREFIX: &str = "transfer:";
const ADDRESS: &str = "address";
const AMOUNT: &str = "amount";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTransfer {
    pub payment_id: String,
    pub address: String,
    pub amount: u64,
}

impl PendingTransfer {
    pub fn to_transfer(&self) -> Transfer {
        Transfer { address: self.address.clone(), amount: self.amount }
    }
}

/// Persists pending transfers before they are submitted, keyed by payment id.
/// Staging the same payment twice overwrites rather than duplicates.
#[derive(Clone)]
pub struct TransferOutbox {
    store: Store,
}

impl TransferOutbox {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn key(payment_id: &str) -> String {
        format!("{RECORD_PREFIX}{payment_id}")
    }

    pub fn stage(&self, transfer: &PendingTransfer) -> Result<(), StoreError> {
        let mut fields = Fields::new();
        fields.insert(ADDRESS.to_string(), transfer.address.clone());
        fields.insert(AMOUNT.to_string(), transfer.amount.to_string());
        self.store.create(&Self::key(&transfer.payment_id), &fields)?;
        self.store.add_to_set(SETTLING_TRANSFERS, &transfer.payment_id)?;
        Ok(())
    }

    /// Everything staged and not yet cleared, ordered by payment id.
    pub fn pending(&self) -> Result<Vec<PendingTransfer>, StoreError> {
        let mut pending = Vec::new();
        for payment_id in self.store.members_of(SETTLING_TRANSFERS)? {
            let key = Self::key(&payment_id);
            let fields = match self.store.get_fields(&key, &[ADDRESS, AMOUNT]) {
                Ok(fields) => fields,
                Err(StoreError::NotFound(_)) => {
                    warn!("outbox payment_id={payment_id} has no transfer record, dropping");
                    self.store.remove_from_set(SETTLING_TRANSFERS, &payment_id)?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let address = fields
                .get(ADDRESS)
                .cloned()
                .ok_or_else(|| StoreError::Corrupt { id: key.clone(), reason: "missing address".into() })?;
            let amount = match fields.get(AMOUNT) {
                Some(raw) => parse_u64(&key, AMOUNT, raw)?,
                None => return Err(StoreError::Corrupt { id: key, reason: "missing amount".into() }),
            };
            pending.push(PendingTransfer { payment_id, address, amount });
        }
        Ok(pending)
    }

    /// Called once the wallet accepted the batch.
    pub fn clear(&self, transfers: &[PendingTransfer]) -> Result<(), StoreError> {
        for transfer in transfers {
            self.store.remove_from_set(SETTLING_TRANSFERS, &transfer.payment_id)?;
            self.store.delete(&Self::key(&transfer.payment_id))?;
        }
        Ok(())
    }
}
