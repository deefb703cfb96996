//! Direct push from trusted producers: `POST /broadcast`
//!
//! The body is `{"resourceId": "...", "data": {...}}` and the pre-shared
//! push key must be presented verbatim in the `Authorization` header.

use std::net::SocketAddr;

use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use feedrelay_core::models::ResourceUpdate;
use feedrelay_hub::metrics;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::http::{AppError, AppResult, AppState};

/// Largest accepted push body
const MAX_PUSH_BODY_BYTES: usize = 4 * 1024 * 1024;

pub async fn broadcast_handler(
    State(state): State<AppState>,
    request: Request,
) -> AppResult<impl IntoResponse> {
    let push = state
        .push
        .as_ref()
        .ok_or_else(|| AppError::service_unavailable("Direct push is disabled"))?;

    let caller = caller_address(&request);
    let (parts, body) = request.into_parts();

    if !credential_matches(parts.headers.get(AUTHORIZATION), &push.push_key) {
        warn!(caller = %caller, "Rejected push with invalid credential");
        metrics::record_update("unauthorized");
        return Err(AppError::forbidden("Invalid credential"));
    }

    let bytes = to_bytes(body, MAX_PUSH_BODY_BYTES).await.map_err(|e| {
        warn!(caller = %caller, error = %e, "Unreadable push body");
        metrics::record_update("malformed");
        AppError::forbidden("Malformed payload")
    })?;

    let update = ResourceUpdate::from_slice(&bytes).map_err(|e| {
        warn!(caller = %caller, error = %e, "Rejected malformed push");
        metrics::record_update("malformed");
        AppError::forbidden("Malformed payload")
    })?;

    let resource_id = update.resource_id().clone();
    push.sink.submit(update).map_err(|e| {
        warn!(resource_id = %resource_id, error = %e, "Push could not be queued");
        metrics::record_update("rejected");
        AppError::from(e)
    })?;

    info!(resource_id = %resource_id, caller = %caller, "Accepted push");
    Ok((StatusCode::OK, "OK"))
}

fn credential_matches(presented: Option<&HeaderValue>, expected: &str) -> bool {
    presented.is_some_and(|value| bool::from(value.as_bytes().ct_eq(expected.as_bytes())))
}

/// First `X-Forwarded-For` hop, else the socket peer
fn caller_address(request: &Request) -> String {
    forwarded_for(request.headers())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|hop| hop.trim().to_string())
        .filter(|hop| !hop.is_empty())
}
