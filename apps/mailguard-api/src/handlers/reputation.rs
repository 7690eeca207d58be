use crate::AppState;
use crate::error::{AppError, AppResult};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use mailguard_shared::api::ApiResponse;
use mailguard_shared::reputation::{
    DomainReputationResult, EmailValidationResult, IpReputationResult,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
pub struct DetailQuery {
    #[serde(default)]
    pub detailed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpReputationView {
    #[serde(flatten)]
    pub result: IpReputationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_zones: Option<Vec<String>>,
}

pub async fn ip_reputation(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    Query(query): Query<DetailQuery>,
) -> AppResult<Json<ApiResponse<IpReputationView>>> {
    debug!("IP reputation request for {} (detailed={})", ip, query.detailed);
    let mut result = state.reputation.check_ip_reputation(&ip).await;
    let checked_zones = if query.detailed {
        Some(state.reputation.zones().to_vec())
    } else {
        result.errors = None;
        None
    };
    Ok(Json(ApiResponse::ok(IpReputationView {
        result,
        checked_zones,
    })))
}

pub async fn domain_reputation(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> AppResult<Json<ApiResponse<DomainReputationResult>>> {
    let domain = domain.trim().to_lowercase();
    if domain.is_empty() {
        return Err(AppError::validation("Domain is required"));
    }
    let result = state.reputation.check_domain_reputation(&domain).await;
    Ok(Json(ApiResponse::ok(result)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateEmailRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub sender_ip: Option<String>,
}

pub async fn validate_email(
    State(state): State<AppState>,
    Json(req): Json<ValidateEmailRequest>,
) -> AppResult<Json<ApiResponse<EmailValidationResult>>> {
    let email = req.email.trim();
    if email.is_empty() {
        return Err(AppError::validation("Email is required"));
    }
    let result = state
        .validator
        .validate_email(email, req.sender_ip.as_deref().filter(|ip| !ip.is_empty()))
        .await;
    Ok(Json(ApiResponse::ok(result)))
}
