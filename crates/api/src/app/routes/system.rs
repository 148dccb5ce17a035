use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::app::dto;
use crate::app::services::{self, AppServices};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let config = services.config();
    Json(serde_json::json!({
        "status": "ok",
        "currency": config.ledger.currency.as_str(),
        "feeBps": config.ledger.fee_bps.get(),
        "persistent": config.use_persistent_stores,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    pub match_id: Option<String>,
}

/// GET /stream
///
/// Server-sent lifecycle events; `?matchId=` narrows the stream to one match.
pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<StreamParams>,
) -> Response {
    let match_id = match params.match_id.as_deref() {
        Some(raw) => match dto::parse_id("match id", raw) {
            Ok(id) => Some(id),
            Err(resp) => return resp,
        },
        None => None,
    };
    services::lifecycle_sse_stream(services, match_id).into_response()
}
