//! Access-token validation for the realtime endpoint and the control API.
//!
//! Tokens are HS256 JWTs signed with `RALPH_SECRET_KEY` carrying
//! `{sub, type: "access", exp}`. Issuing tokens is the login service's job;
//! this server only validates them.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing access token")]
    MissingToken,

    #[error("Invalid access token")]
    InvalidToken,

    #[error("Unexpected token type: {0}")]
    WrongTokenType(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub exp: u64,
}

/// Decode and check an access token.
pub fn validate_access_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|_| AuthError::InvalidToken)?;
    if data.claims.token_type != "access" {
        return Err(AuthError::WrongTokenType(data.claims.token_type));
    }
    Ok(data.claims)
}

/// Token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Extractor that rejects requests without a valid bearer token.
pub struct Authenticated(pub Claims);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingToken)?;
        let token = bearer_token(header).ok_or(AuthError::MissingToken)?;
        let claims = validate_access_token(token, &state.settings.secret_key)?;
        Ok(Self(claims))
    }
}
