use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::intake::{Delivery, IntakeError, IntakeOutcome, JobIntake};
use crate::status::StatusAggregator;
use crate::upstream::webhook::{DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};

pub struct AppState {
    pub intake: JobIntake,
    pub status: StatusAggregator,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<IntakeOutcome, IntakeError> {
    let delivery = Delivery {
        event: header(&headers, EVENT_HEADER),
        signature: header(&headers, SIGNATURE_HEADER),
        delivery_id: header(&headers, DELIVERY_HEADER),
        body: &body,
    };
    let result = state.intake.handle(delivery).await;
    match &result {
        Ok(IntakeOutcome::Ignored(reason)) => {
            log::debug!(
                "Delivery {} acknowledged: {}",
                delivery.delivery_id.unwrap_or("?"),
                reason.message()
            );
        }
        Ok(IntakeOutcome::Provisioned(_)) => {}
        Err(error) => {
            log::warn!(
                "Delivery {} rejected: {error}",
                delivery.delivery_id.unwrap_or("?")
            );
        }
    }
    result
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    match state.status.status().await {
        Ok(status) => Json(status).into_response(),
        Err(error) => {
            log::error!("Cannot compute system status: {error}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Status is not available" })),
            )
                .into_response()
        }
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
