//! Liveness endpoint (spec §4.10). Ambient surface only, never part of the
//! tunnel protocol -- always `200` once the process is accepting connections.

use axum::http::StatusCode;

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}
