use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::services::subscriber_service::{CreateSubscriber, UpdateSubscriber};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use mailguard_db::models::{Subscriber, SubscriberFilter, SubscriberStatus};
use mailguard_shared::api::{ApiResponse, Paginated};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<ApiResponse<Paginated<Subscriber>>>> {
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(s) => Some(
            serde_json::from_value::<SubscriberStatus>(Value::String(s.to_lowercase()))
                .map_err(|_| AppError::validation(format!("Unknown subscriber status: {s}")))?,
        ),
    };
    let filter = SubscriberFilter {
        status,
        page: query.page,
        limit: query.limit.min(100),
    };
    Ok(Json(ApiResponse::ok(state.subscribers.list(filter).await?)))
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateSubscriber>,
) -> AppResult<Json<ApiResponse<Subscriber>>> {
    Ok(Json(ApiResponse::ok(state.subscribers.create(req).await?)))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Subscriber>>> {
    Ok(Json(ApiResponse::ok(state.subscribers.get(id).await?)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateSubscriber>,
) -> AppResult<Json<ApiResponse<Subscriber>>> {
    Ok(Json(ApiResponse::ok(state.subscribers.update(id, req).await?)))
}

#[derive(Debug, Deserialize)]
pub struct LifecycleRequest {
    pub email: String,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn subscribe(
    State(state): State<AppState>,
    Json(req): Json<LifecycleRequest>,
) -> AppResult<Json<ApiResponse<Subscriber>>> {
    Ok(Json(ApiResponse::ok(state.subscribers.subscribe(&req.email).await?)))
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    Json(req): Json<LifecycleRequest>,
) -> AppResult<Json<ApiResponse<Subscriber>>> {
    let sub = state
        .subscribers
        .unsubscribe(&req.email, req.reason.filter(|r| !r.trim().is_empty()))
        .await?;
    Ok(Json(ApiResponse::ok(sub)))
}
