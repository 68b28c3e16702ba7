use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use paysettle::signing::{verify, SIGNATURE_HEADER};
use paysettle::wallet::{ChainStatus, HttpWallet, Transfer, WalletError, WalletGateway};
use serde_json::{json, Value};
use tokio::net::TcpListener;

const KEY: &[u8] = b"master-key";

#[derive(Clone, Default)]
struct FakeWallet {
    sent: Arc<Mutex<Vec<Value>>>,
    reject: bool,
}

fn check_signature(headers: &HeaderMap, body: &[u8]) -> Result<(), StatusCode> {
    let sig = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()).ok_or(StatusCode::UNAUTHORIZED)?;
    if verify(KEY, body, sig) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn info(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    check_signature(&headers, b"")?;
    Ok(Json(json!({ "address": "TRTLwallet", "node_fee": 10 })))
}

async fn status(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    check_signature(&headers, b"")?;
    Ok(Json(json!({ "block": 1234, "balance": 5000, "is_synced": true })))
}

async fn integrated(headers: HeaderMap, body: Bytes) -> Result<Json<Value>, StatusCode> {
    check_signature(&headers, &body)?;
    let req: Value = serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let pid = req["payment_id"].as_str().ok_or(StatusCode::BAD_REQUEST)?;
    Ok(Json(json!({ "integrated_address": format!("TRTLint{pid}") })))
}

async fn send(State(state): State<FakeWallet>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>, StatusCode> {
    check_signature(&headers, &body)?;
    let req: Value = serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    state.sent.lock().unwrap().push(req["transfers"].clone());
    if state.reject {
        Ok(Json(json!({ "status": "error" })))
    } else {
        Ok(Json(json!({ "status": "ok" })))
    }
}

async fn spawn_wallet(state: FakeWallet) -> String {
    let app = Router::new()
        .route("/wallet", get(info))
        .route("/wallet/status", get(status))
        .route("/wallet/integrated_address", post(integrated))
        .route("/wallet/send_transaction", post(send))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app.into_make_service()).await.unwrap() });
    format!("http://{addr}")
}

#[tokio::test]
async fn queries_are_signed_and_decoded() {
    let url = spawn_wallet(FakeWallet::default()).await;
    let wallet = HttpWallet::new(url, KEY.to_vec(), Duration::from_secs(2)).unwrap();

    let info = wallet.info().await.unwrap();
    assert_eq!(info.node_fee, 10);
    assert_eq!(wallet.chain_status().await.unwrap(), ChainStatus { height: 1234, balance: 5000, synced: true });
    assert_eq!(wallet.receiving_address("abc").await.unwrap(), "TRTLintabc");
}

#[tokio::test]
async fn batch_is_sent_as_address_amount_pairs() {
    let state = FakeWallet::default();
    let url = spawn_wallet(state.clone()).await;
    let wallet = HttpWallet::new(url, KEY.to_vec(), Duration::from_secs(2)).unwrap();

    let batch = vec![
        Transfer { address: "TRTLmerchant".into(), amount: 990 },
        Transfer { address: "TRTLcustomer".into(), amount: 40 },
    ];
    wallet.submit_transfer(&batch).await.unwrap();
    let sent = state.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![json!([["TRTLmerchant", 990], ["TRTLcustomer", 40]])]);
}

#[tokio::test]
async fn non_ok_status_is_a_failure() {
    let url = spawn_wallet(FakeWallet { reject: true, ..FakeWallet::default() }).await;
    let wallet = HttpWallet::new(url, KEY.to_vec(), Duration::from_secs(2)).unwrap();
    let err = wallet.submit_transfer(&[Transfer { address: "a".into(), amount: 1 }]).await.unwrap_err();
    match err {
        WalletError::Rejected(status) => assert_eq!(status, "error"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn wrong_key_is_refused_by_wallet() {
    let url = spawn_wallet(FakeWallet::default()).await;
    let wallet = HttpWallet::new(url, b"not-the-key".to_vec(), Duration::from_secs(2)).unwrap();
    match wallet.chain_status().await.unwrap_err() {
        WalletError::Http(401) => {}
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_wallet_is_a_request_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let wallet = HttpWallet::new(format!("http://{addr}"), KEY.to_vec(), Duration::from_secs(1)).unwrap();
    assert!(matches!(wallet.chain_status().await, Err(WalletError::Request(_))));
}
