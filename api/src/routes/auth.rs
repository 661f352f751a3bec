//! Caller identity
//!
//! Sign-in lives in front of this service. The gateway forwards the
//! authenticated user id in `x-user-id`.

use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
};

pub const USER_ID_HEADER: &str = "x-user-id";

/// Extractor that reads the authenticated user id
pub struct Requester(pub i64);

impl<S: Send + Sync> FromRequestParts<S> for Requester {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(Requester(user_id))
    }
}
