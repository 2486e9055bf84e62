//! Cookie-backed admin sessions.
//!
//! Tokens live in an in-process map; the cookie carries
//! `<token>.<hex HMAC-SHA256(secret, token)>` so a tampered cookie is
//! rejected before any lookup.

use std::collections::HashMap;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::AppState;

pub const SESSION_COOKIE: &str = "sponsorhub.sid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

pub struct SessionStore {
    secret: String,
    ttl: Duration,
    cookie_secure: bool,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(secret: impl Into<String>, ttl: Duration, cookie_secure: bool) -> Self {
        Self {
            secret: secret.into(),
            ttl,
            cookie_secure,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn mac(&self) -> Option<Hmac<Sha256>> {
        Hmac::<Sha256>::new_from_slice(self.secret.as_bytes()).ok()
    }

    fn sign(&self, token: &str) -> Option<String> {
        let mut mac = self.mac()?;
        mac.update(token.as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Token part of a well-signed cookie value. The comparison is
    /// constant-time.
    fn verified_token<'a>(&self, cookie_value: &'a str) -> Option<&'a str> {
        let (token, signature) = cookie_value.rsplit_once('.')?;
        if token.is_empty() {
            return None;
        }
        let signature = hex::decode(signature).ok()?;
        let mut mac = self.mac()?;
        mac.update(token.as_bytes());
        mac.verify_slice(&signature).ok().map(|()| token)
    }

    /// Starts a session and returns the signed cookie value.
    pub async fn create(&self, email: &str) -> Option<String> {
        let token = Uuid::new_v4().simple().to_string();
        let signature = self.sign(&token)?;
        let session = Session {
            email: email.to_string(),
            expires_at: Utc::now() + self.ttl,
        };
        let mut sessions = self.sessions.lock().await;
        let now = Utc::now();
        sessions.retain(|_, s| s.expires_at > now);
        sessions.insert(token.clone(), session);
        Some(format!("{token}.{signature}"))
    }

    pub async fn validate(&self, cookie_value: &str) -> Option<Session> {
        let token = self.verified_token(cookie_value)?;
        let mut sessions = self.sessions.lock().await;
        match sessions.get(token) {
            Some(session) if session.expires_at > Utc::now() => Some(session.clone()),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    pub async fn from_headers(&self, headers: &HeaderMap) -> Option<Session> {
        self.validate(cookie_value(headers)?).await
    }

    pub async fn destroy(&self, cookie_value: &str) {
        if let Some(token) = self.verified_token(cookie_value) {
            self.sessions.lock().await.remove(token);
        }
    }

    pub fn set_cookie(&self, value: &str) -> String {
        self.cookie_with(value, self.ttl.num_seconds())
    }

    pub fn clear_cookie(&self) -> String {
        self.cookie_with("", 0)
    }

    fn cookie_with(&self, value: &str, max_age: i64) -> String {
        let mut cookie =
            format!("{SESSION_COOKIE}={value}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age}");
        if self.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Value of the session cookie among all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Extractor for API routes: a live admin session or 401.
pub struct AdminSession(pub Session);

impl FromRequestParts<AppState> for AdminSession {
    type Rejection = SessionError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let value = cookie_value(&parts.headers).ok_or_else(|| {
            debug!(path = %parts.uri.path(), "missing session cookie");
            SessionError::Missing
        })?;
        let session = state.sessions.validate(value).await.ok_or_else(|| {
            debug!(path = %parts.uri.path(), "invalid or expired session");
            SessionError::Invalid
        })?;
        Ok(Self(session))
    }
}

#[derive(Debug)]
pub enum SessionError {
    Missing,
    Invalid,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let message = match self {
            Self::Missing => "unauthorized",
            Self::Invalid => "session expired or invalid",
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": message })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn store() -> SessionStore {
        SessionStore::new("test-secret", Duration::hours(24), false)
    }

    #[tokio::test]
    async fn signed_cookie_round_trips() {
        let store = store();
        let value = store.create("admin@example.org").await.unwrap();
        let session = store.validate(&value).await.unwrap();
        assert_eq!(session.email, "admin@example.org");

        store.destroy(&value).await;
        assert!(store.validate(&value).await.is_none());
    }

    #[tokio::test]
    async fn tampered_or_foreign_cookies_are_rejected() {
        let store = store();
        let value = store.create("admin@example.org").await.unwrap();
        let (token, _) = value.rsplit_once('.').unwrap();
        assert!(store.validate(&format!("{token}.deadbeef")).await.is_none());
        assert!(store.validate(token).await.is_none());

        let other = SessionStore::new("other-secret", Duration::hours(24), false);
        assert!(other.validate(&value).await.is_none());
    }

    #[tokio::test]
    async fn signature_is_hmac_sha256_of_the_token() {
        let store = store();
        let value = store.create("admin@example.org").await.unwrap();
        let (token, signature) = value.rsplit_once('.').unwrap();

        let mut mac = Hmac::<Sha256>::new_from_slice(b"test-secret").unwrap();
        mac.update(token.as_bytes());
        assert_eq!(signature, hex::encode(mac.finalize().into_bytes()));
        assert!(store.validate(&format!("{token}.not-hex")).await.is_none());
    }

    #[tokio::test]
    async fn expired_sessions_are_dropped() {
        let store = SessionStore::new("s", Duration::seconds(-1), false);
        let value = store.create("admin@example.org").await.unwrap();
        assert!(store.validate(&value).await.is_none());
    }

    #[test]
    fn cookie_attributes() {
        let plain = store().set_cookie("abc.def");
        assert_eq!(
            plain,
            "sponsorhub.sid=abc.def; HttpOnly; SameSite=Lax; Path=/; Max-Age=86400"
        );
        let secure = SessionStore::new("s", Duration::hours(1), true).clear_cookie();
        assert!(secure.ends_with("Max-Age=0; Secure"));
    }

    #[test]
    fn finds_the_session_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(
            header::COOKIE,
            HeaderValue::from_static("a=1; sponsorhub.sid=tok.sig; b=2"),
        );
        assert_eq!(cookie_value(&headers), Some("tok.sig"));
        assert_eq!(cookie_value(&HeaderMap::new()), None);
    }
}
