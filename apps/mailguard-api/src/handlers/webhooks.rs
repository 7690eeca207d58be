use crate::AppState;
use crate::error::AppResult;
use crate::services::subscriber_service::DeliveryEvent;
use axum::{Json, extract::State};
use mailguard_db::models::Subscriber;
use mailguard_shared::api::ApiResponse;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct DeliveryWebhook {
    pub email: String,
    pub event: DeliveryEvent,
}

/// Bounce and complaint notifications from the sending provider.
pub async fn delivery(
    State(state): State<AppState>,
    Json(hook): Json<DeliveryWebhook>,
) -> AppResult<Json<ApiResponse<Subscriber>>> {
    info!("Delivery webhook: {:?} for {}", hook.event, hook.email);
    let sub = state
        .subscribers
        .record_delivery_event(&hook.email, hook.event)
        .await?;
    Ok(Json(ApiResponse::ok(sub)))
}
