use std::time::Duration;

use async_trait::async_trait;
use hmac::digest::InvalidLength;
use log::debug;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signing::{sign, SIGNATURE_HEADER};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub height: u64,
    pub balance: u64,
    pub synced: bool,
}

/// One output of a batched transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub address: String,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct WalletInfo {
    pub address: String,
    pub node_fee: u64,
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("http status {0}")]
    Http(u16),
    #[error("wallet rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidSecret(#[from] InvalidLength),
}

/// Signed RPC surface of the wallet node.
///
/// A failed call carries no partial-success information: a failed
/// `submit_transfer` means none of the outputs were sent.
#[async_trait]
pub trait WalletGateway: Send + Sync {
    async fn chain_status(&self) -> Result<ChainStatus, WalletError>;
    async fn receiving_address(&self, payment_id: &str) -> Result<String, WalletError>;
    async fn submit_transfer(&self, transfers: &[Transfer]) -> Result<(), WalletError>;
}

#[derive(Deserialize)]
struct StatusResponse {
    block: u64,
    balance: u64,
    is_synced: bool,
}

#[derive(Serialize)]
struct AddressRequest<'a> {
    payment_id: &'a str,
}

#[derive(Deserialize)]
struct AddressResponse {
    integrated_address: String,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    transfers: Vec<(&'a str, u64)>,
}

#[derive(Deserialize)]
struct SendResponse {
    status: String,
}

/// JSON-over-HTTP client; every body is signed with the master key.
pub struct HttpWallet {
    base_url: String,
    secret: Vec<u8>,
    client: Client,
}

impl HttpWallet {
    pub fn new(base_url: impl Into<String>, secret: impl Into<Vec<u8>>, timeout: Duration) -> Result<Self, WalletError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, secret: secret.into(), client })
    }

    /// Wallet primary address and the node fee charged per transfer.
    pub async fn info(&self) -> Result<WalletInfo, WalletError> {
        self.get("/wallet").await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, WalletError> {
        let signature = sign(&self.secret, b"")?;
        let resp = self.client.get(format!("{}{path}", self.base_url)).header(SIGNATURE_HEADER, signature).send().await?;
        Self::decode(path, resp).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, WalletError> {
        let body = serde_json::to_vec(body)?;
        let signature = sign(&self.secret, &body)?;
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header(SIGNATURE_HEADER, signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        Self::decode(path, resp).await
    }

    async fn decode<T: DeserializeOwned>(path: &str, resp: reqwest::Response) -> Result<T, WalletError> {
        let status = resp.status();
        debug!("wallet path={path} status={}", status.as_u16());
        if !status.is_success() {
            return Err(WalletError::Http(status.as_u16()));
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl WalletGateway for HttpWallet {
    async fn chain_status(&self) -> Result<ChainStatus, WalletError> {
        let status: StatusResponse = self.get("/wallet/status").await?;
        Ok(ChainStatus { height: status.block, balance: status.balance, synced: status.is_synced })
    }

    async fn receiving_address(&self, payment_id: &str) -> Result<String, WalletError> {
        let resp: AddressResponse = self.post("/wallet/integrated_address", &AddressRequest { payment_id }).await?;
        Ok(resp.integrated_address)
    }

    async fn submit_transfer(&self, transfers: &[Transfer]) -> Result<(), WalletError> {
        let request = SendRequest { transfers: transfers.iter().map(|t| (t.address.as_str(), t.amount)).collect() };
        let resp: SendResponse = self.post("/wallet/send_transaction", &request).await?;
        if resp.status == "ok" {
            Ok(())
        } else {
            Err(WalletError::Rejected(resp.status))
        }
    }
}
