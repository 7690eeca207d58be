use crate::AppState;
use axum::{Json, extract::State};
use serde_json::{Value, json};

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "cache": state.cache.backend_name(),
        "store": state.store_backend,
        "version": env!("CARGO_PKG_VERSION")
    }))
}
