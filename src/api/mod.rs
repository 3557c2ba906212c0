//! HTTP surface
//!
//! Thin axum adapter over the admission service. Business rejections come
//! back as structured 400 responses; only storage failures surface as 5xx.

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::admission::{Admission, AdmissionService};
use crate::health::CounterHealthProbe;
use crate::models::{
    CreateAccountRequest, CreateAccountResponse, ErrorBody, HealthResponse, LedgerError,
    TransactionRequest, TransactionResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionService>,
    pub probe: Arc<CounterHealthProbe>,
    pub app_name: String,
    pub app_version: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/transaction", post(process_transaction))
        .route("/account", post(create_account))
        .route("/balance/:account_id", get(get_balance))
        .route("/pending/:account_id", get(get_pending))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}

fn error_status(e: &LedgerError) -> StatusCode {
    match e {
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_user_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &LedgerError) -> Response {
    (error_status(e), Json(ErrorBody { error: e.to_string() })).into_response()
}

async fn process_transaction(
    Extension(state): Extension<AppState>,
    Json(req): Json<TransactionRequest>,
) -> Response {
    match state.admission.process(&req).await {
        Ok(Admission::Accepted { account_id, amount, direction, path, .. }) => (
            StatusCode::OK,
            Json(TransactionResponse {
                success: true,
                message: format!("transaction accepted via {} path", path.as_str()),
                account_id,
                amount,
                tx_type: direction.as_str().to_string(),
                status: "pending".to_string(),
                timestamp: Utc::now(),
            }),
        )
            .into_response(),
        Ok(Admission::Rejected { account_id, amount, direction, reason }) => (
            StatusCode::BAD_REQUEST,
            Json(TransactionResponse {
                success: false,
                message: reason,
                account_id,
                amount,
                tx_type: direction.as_str().to_string(),
                status: "rejected".to_string(),
                timestamp: Utc::now(),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn create_account(
    Extension(state): Extension<AppState>,
    Json(req): Json<CreateAccountRequest>,
) -> Response {
    let balance = req.balance.unwrap_or(Decimal::ZERO);
    match state.admission.create_account(&req.account_id, balance).await {
        Ok(account) => (
            StatusCode::OK,
            Json(CreateAccountResponse {
                success: true,
                message: "account created".to_string(),
                account_id: account.id,
                balance: account.settled_balance,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_balance(
    Extension(state): Extension<AppState>,
    Path(account_id): Path<String>,
) -> Response {
    match state.admission.get_balance(&account_id).await {
        Ok(balance) => (StatusCode::OK, Json(balance)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_pending(
    Extension(state): Extension<AppState>,
    Path(account_id): Path<String>,
) -> Response {
    match state.admission.get_pending(&account_id).await {
        Ok(pending) => (StatusCode::OK, Json(pending)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn health(Extension(state): Extension<AppState>) -> Json<HealthResponse> {
    // The service keeps admitting through the fallback when the counter
    // backend is down, so that state reads as degraded, not unhealthy.
    let status = if state.probe.is_healthy() { "healthy" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        service: state.app_name.clone(),
        version: state.app_version.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(error_status(&LedgerError::NotFound("A".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            error_status(&LedgerError::InvalidInput("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&LedgerError::InsufficientFunds {
                available: dec!(1),
                requested: dec!(2)
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&LedgerError::Io("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
