use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use super::Server;
use crate::metrics;

/// Healthy unless the configured object storage is missing from the
/// registry.
pub async fn health(State(server): State<Arc<Server>>) -> (StatusCode, Json<Value>) {
    if server.object_storage.is_empty() {
        return (StatusCode::OK, Json(json!({ "status": "healthy", "persistence": "disabled" })));
    }

    match server.registry.object_backend(&server.object_storage) {
        Ok(backend) => (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "objectStorage": backend.name() })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "error": e.to_string() })),
        ),
    }
}

pub async fn metrics() -> String {
    metrics::gather_metrics()
}
