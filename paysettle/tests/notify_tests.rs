use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use axum::body::Bytes;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use paysettle::invoice::{Invoice, InvoiceStatus};
use paysettle::notify::{Notifier, NotifyError, NotifyEvent, StaticKeyring, WebhookNotifier};
use paysettle::signing::{verify, SIGNATURE_HEADER};
use serde_json::Value;
use tokio::net::TcpListener;

#[derive(Clone)]
struct AppState {
    attempts: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    secret: Vec<u8>,
    reply: StatusCode,
}

async fn merchant(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let sig = headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert!(verify(&state.secret, &body, sig), "signature must use the merchant secret");
    state.attempts.fetch_add(1, Ordering::SeqCst);
    state.bodies.lock().unwrap().push(serde_json::from_slice(&body).unwrap());
    state.reply
}

async fn spawn_merchant(secret: &[u8], reply: StatusCode) -> (String, AppState) {
    let state = AppState {
        attempts: Arc::new(AtomicUsize::new(0)),
        bodies: Arc::new(Mutex::new(Vec::new())),
        secret: secret.to_vec(),
        reply,
    };
    let app = Router::new().route("/ipn", post(merchant)).with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app.into_make_service()).await.unwrap() });
    (format!("http://{addr}/ipn"), state)
}

fn invoice(callback_uri: String) -> Invoice {
    Invoice {
        payment_id: "cd".repeat(32),
        status: InvoiceStatus::Paid,
        merchant_address: "TRTLmerchant".into(),
        return_address: None,
        payment_address: "TRTLpay".into(),
        currency_code: "usd".into(),
        currency_amount: 5.0,
        target_atomic_amount: 1000,
        amount_received: 1000,
        fee: 10,
        order_id: "order-9".into(),
        custom_data: "cart=3".into(),
        public_key: "merchant-pk".into(),
        callback_uri,
        created_at: 1_700_000_000,
        expires_at: 1_700_003_600,
        confirming_block: Some(50),
    }
}

fn notifier(secret: &[u8]) -> WebhookNotifier {
    let keyring = StaticKeyring::new([("merchant-pk", secret.to_vec())]);
    WebhookNotifier::new(Arc::new(keyring), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn posts_signed_payload_without_callback() {
    let (url, state) = spawn_merchant(b"merchant-secret", StatusCode::OK).await;
    let inv = invoice(url.clone());
    notifier(b"merchant-secret").notify(&inv, NotifyEvent::Paid).await.unwrap();

    let bodies = state.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(body["type"], "paid");
    assert_eq!(body["order_id"], "order-9");
    assert_eq!(body["custom"], "cart=3");
    assert_eq!(body["amount_received"], 1000);
    assert!(body.get("ipn_uri").is_none());
    assert!(!body.to_string().contains(&url));
}

#[tokio::test]
async fn failure_is_not_retried() {
    let (url, state) = spawn_merchant(b"merchant-secret", StatusCode::INTERNAL_SERVER_ERROR).await;
    let err = notifier(b"merchant-secret").notify(&invoice(url), NotifyEvent::Expired).await.unwrap_err();
    match err {
        NotifyError::Http(500) => {}
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(state.attempts.load(Ordering::SeqCst), 1);
}
