use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use paysettle::lifecycle::{InvoiceError, InvoiceLifecycle, InvoiceRequest, PaymentOutcome, PaymentReceived};
use paysettle::metrics;
use paysettle::signing::{verify, SIGNATURE_HEADER};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct AppState {
    lifecycle: Arc<InvoiceLifecycle>,
    master_key: Arc<Vec<u8>>,
    wallet_key: Arc<Vec<u8>>,
}

impl AppState {
    pub fn new(lifecycle: Arc<InvoiceLifecycle>, master_key: impl Into<Vec<u8>>, wallet_key: impl Into<Vec<u8>>) -> Self {
        Self { lifecycle, master_key: Arc::new(master_key.into()), wallet_key: Arc::new(wallet_key.into()) }
    }
}

/// `{"status": "<message>"}` with the matching HTTP code.
#[derive(Debug)]
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "status": self.1 }))).into_response()
    }
}

impl From<InvoiceError> for ApiError {
    fn from(err: InvoiceError) -> Self {
        let code = match &err {
            InvoiceError::Invalid(_) => StatusCode::BAD_REQUEST,
            InvoiceError::NotFound(_) => StatusCode::NOT_FOUND,
            InvoiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            InvoiceError::Wallet(_) => StatusCode::BAD_GATEWAY,
        };
        if code.is_server_error() {
            warn!("request failed status={} error={err}", code.as_u16());
        }
        ApiError(code, err.to_string())
    }
}

fn ok<T: Serialize>(result: T) -> Json<Value> {
    Json(json!({ "status": "ok", "result": result }))
}

/// Checks the body signature before anything else looks at the request.
fn authorize(headers: &HeaderMap, body: &[u8], key: &[u8]) -> Result<(), ApiError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    match signature {
        Some(sig) if verify(key, body, sig) => Ok(()),
        _ => Err(ApiError(StatusCode::UNAUTHORIZED, "invalid signature".into())),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("malformed request: {e}")))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/invoice", post(create_invoice))
        .route("/api/invoice/{payment_id}", get(get_invoice))
        .route("/api/transaction/received", post(transaction_received))
        .route("/api/status", get(status))
        .route("/metrics", get(metrics_endpoint))
        .route("/healthz", get(healthz))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await
}

async fn create_invoice(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>, ApiError> {
    authorize(&headers, &body, &state.master_key)?;
    let req: InvoiceRequest = parse_json(&body)?;
    let created = state.lifecycle.create(req).await?;
    Ok(ok(created))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&headers, b"", &state.master_key)?;
    let view = state.lifecycle.query(&payment_id)?;
    Ok(ok(view))
}

async fn transaction_received(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    authorize(&headers, &body, &state.wallet_key)?;
    let event: PaymentReceived = parse_json(&body)?;
    let result = match state.lifecycle.record_payment(&event)? {
        PaymentOutcome::Recorded { received } => json!({ "outcome": "recorded", "amount_received": received }),
        PaymentOutcome::Promoted { received, block } => {
            json!({ "outcome": "awaiting_confirmation", "amount_received": received, "block": block })
        }
        PaymentOutcome::Ignored(status) => {
            info!("late payment payment_id={} amount={} status={status}", event.payment_id, event.amount);
            json!({ "outcome": "ignored", "invoice_status": status })
        }
    };
    Ok(ok(result))
}

async fn status(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    authorize(&headers, b"", &state.master_key)?;
    Ok(ok(json!({ "timestamp": paysettle::now() })))
}

async fn metrics_endpoint() -> Json<metrics::Snapshot> {
    Json(metrics::snapshot())
}

async fn healthz() -> &'static str {
    "ok"
}
