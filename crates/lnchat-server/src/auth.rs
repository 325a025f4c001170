//! Optional HTTP Basic authentication.
//!
//! The password is checked against a bcrypt hash. The username is compared
//! in constant time, and the bcrypt check runs even when the username is
//! wrong so both failures take the same time.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::BasicAuthConfig;

#[derive(Clone)]
pub struct BasicAuth {
    user: Arc<Vec<u8>>,
    password_hash: Arc<String>,
}

impl BasicAuth {
    pub fn new(config: &BasicAuthConfig) -> Self {
        Self {
            user: Arc::new(config.user.as_bytes().to_vec()),
            password_hash: Arc::new(config.password_hash.clone()),
        }
    }

    pub fn check(&self, headers: &HeaderMap) -> bool {
        let Some((user, password)) = credentials(headers) else {
            return false;
        };
        let user_ok: bool = user.as_bytes().ct_eq(self.user.as_slice()).into();
        let password_ok = bcrypt::verify(&password, &self.password_hash).unwrap_or(false);
        user_ok & password_ok
    }
}

/// `(user, password)` from an `Authorization: Basic ..` header.
fn credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

pub async fn basic_auth_middleware(
    State(auth): State<BasicAuth>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if auth.check(req.headers()) {
        return next.run(req).await;
    }
    warn!(path = %req.uri().path(), "rejected unauthenticated request");
    let mut response = StatusCode::UNAUTHORIZED.into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"lnchat\""),
    );
    response
}
