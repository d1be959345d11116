//! The two credential checks exposed over HTTP.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use axum_extra::extract::CookieJar;
use common_obs::CounterVec;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::ApiError;
use crate::AppState;

static VERDICTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    common_obs::register_counter(
        "auth_gateway_verdicts_total",
        "Verdicts returned by the credential checks",
        &["check", "status"],
    )
});

const TOKEN_CHECK: &str = "token";
const SESSION_CHECK: &str = "session";

/// Machine-readable outcome of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Authorized,
    Unauthorized,
    ServiceUnavailable,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Authorized => "AUTHORIZED",
            CheckStatus::Unauthorized => "UNAUTHORIZED",
            CheckStatus::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

/// Body of a definitive (`200`) verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub status: CheckStatus,
    pub valid: bool,
}

impl Verdict {
    pub fn from_valid(valid: bool) -> Self {
        let status = if valid {
            CheckStatus::Authorized
        } else {
            CheckStatus::Unauthorized
        };
        Self { status, valid }
    }
}

/// Ensure every series is exported before the first request.
pub(crate) fn register_metrics() {
    for check in [TOKEN_CHECK, SESSION_CHECK] {
        for status in [
            CheckStatus::Authorized,
            CheckStatus::Unauthorized,
            CheckStatus::ServiceUnavailable,
        ] {
            VERDICTS_TOTAL.ensure(&[check, status.as_str()]);
        }
    }
}

/// `GET /check/:token_name/:token_key/:session_id`
///
/// The token pair must match the registry before the session is forwarded to
/// the validator. Unknown names and wrong keys produce the same response.
pub async fn check_token(
    State(state): State<Arc<AppState>>,
    Path((token_name, token_key, session_id)): Path<(String, String, String)>,
) -> Result<Json<Verdict>, ApiError> {
    if !state.registry.verify(&token_name, &token_key) {
        tracing::info!(
            event = "token_rejected",
            token_name = token_name.as_str(),
            "token check failed"
        );
        return Ok(Json(record(TOKEN_CHECK, Verdict::from_valid(false))));
    }

    let verdict = validate_session(&state, TOKEN_CHECK, &session_id).await?;
    tracing::debug!(
        event = "token_checked",
        token_name = token_name.as_str(),
        valid = verdict.valid
    );
    Ok(Json(verdict))
}

/// `GET /session/valid`
///
/// Validates the session cookie the caller's browser presented. A request
/// without the cookie is unauthorized and never reaches the daemon.
pub async fn session_valid(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Verdict>, ApiError> {
    let session_id = match jar.get(&state.session_cookie) {
        Some(cookie) if !cookie.value().is_empty() => cookie.value().to_string(),
        _ => {
            tracing::debug!(
                event = "session_cookie_missing",
                cookie = state.session_cookie.as_str()
            );
            return Ok(Json(record(SESSION_CHECK, Verdict::from_valid(false))));
        }
    };

    let verdict = validate_session(&state, SESSION_CHECK, &session_id).await?;
    Ok(Json(verdict))
}

async fn validate_session(
    state: &AppState,
    check: &'static str,
    session_id: &str,
) -> Result<Verdict, ApiError> {
    match state.validator.validate(session_id).await {
        Ok(valid) => Ok(record(check, Verdict::from_valid(valid))),
        Err(err) => {
            tracing::warn!(
                event = "validator_unavailable",
                check,
                error = %err,
                "unable to validate session"
            );
            VERDICTS_TOTAL.inc(&[check, CheckStatus::ServiceUnavailable.as_str()], 1);
            Err(ApiError::from(err))
        }
    }
}

fn record(check: &'static str, verdict: Verdict) -> Verdict {
    VERDICTS_TOTAL.inc(&[check, verdict.status.as_str()], 1);
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_in_screaming_case() {
        let body = serde_json::to_value(Verdict::from_valid(true)).expect("json");
        assert_eq!(body["status"], "AUTHORIZED");
        assert_eq!(body["valid"], true);

        let status = serde_json::to_value(CheckStatus::ServiceUnavailable).expect("json");
        assert_eq!(status, CheckStatus::ServiceUnavailable.as_str());
    }
}
