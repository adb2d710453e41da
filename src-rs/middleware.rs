use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::{
    models::User,
    rate_limit::InMemoryRateLimiter,
    state::AppState,
    subscription::{is_entitled, Customer},
};

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: User,
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value,
        None => return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
    };

    let user_id = match state.auth.verify_bearer_token(auth_header) {
        Ok(user_id) => user_id,
        Err(error) => {
            tracing::warn!(error = %error, "authorization failed");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let user = match state.store.get_user(user_id).await {
        Ok(Some(user)) if user.is_active => user,
        Ok(_) => {
            tracing::warn!(user_id = %user_id, "session for missing or inactive user");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to load session user");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    request.extensions_mut().insert(AuthenticatedUser { user });

    next.run(request).await
}

/// Must run after `require_auth`.
pub async fn require_staff(request: Request<Body>, next: Next) -> Response {
    let is_staff = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map_or(false, |auth| auth.user.is_staff);

    if !is_staff {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    next.run(request).await
}

/// Subscribed or trialing users only. Must run after `require_auth`.
pub async fn require_entitlement(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    entitlement_gate(state, request, next, true).await
}

/// Paying users only; a trial is not enough.
pub async fn require_paid_subscription(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    entitlement_gate(state, request, next, false).await
}

async fn entitlement_gate(
    state: AppState,
    request: Request<Body>,
    next: Next,
    include_trial: bool,
) -> Response {
    let user = match request.extensions().get::<AuthenticatedUser>() {
        Some(auth) => auth.user.clone(),
        None => return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
    };

    let info = match state.store.get_info_for_user(user.id).await {
        Ok(info) => info,
        Err(error) => {
            tracing::error!(error = %error, user_id = %user.id, "failed to load billing record");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    let customer = Customer::of(&user, info.as_ref(), state.policy, Utc::now());
    if !is_entitled(&customer, include_trial) {
        tracing::debug!(
            customer = %customer,
            state = customer.state().as_str(),
            include_trial,
            "entitlement denied"
        );
        return (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "error": "An active subscription is required.",
                "upgradeUrl": state.config.saas.upgrade_url,
            })),
        )
            .into_response();
    }

    next.run(request).await
}

pub async fn auth_rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(response) = limit(&state, &state.auth_limiter, &request) {
        return response;
    }
    next.run(request).await
}

pub async fn api_rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(response) = limit(&state, &state.api_limiter, &request) {
        return response;
    }
    next.run(request).await
}

fn limit(
    state: &AppState,
    limiter: &InMemoryRateLimiter,
    request: &Request<Body>,
) -> Option<Response> {
    let socket_addr = request
        .extensions()
        .get::<SocketAddr>()
        .copied()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|value| value.0)
        });
    let key = client_identity(request.headers(), socket_addr, state.config.trust_proxy);

    if limiter.check_and_count(&key) {
        return None;
    }

    tracing::warn!(client = %key, path = %request.uri().path(), "rate limit exceeded");
    Some(
        (
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "Too many requests from this IP, please try again after {} minutes",
                limiter.window().as_secs() / 60
            ),
        )
            .into_response(),
    )
}

pub fn client_identity(
    headers: &HeaderMap,
    socket_addr: Option<SocketAddr>,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        if let Some(value) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            if let Some(first) = value.split(',').next() {
                let candidate = first.trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }

        if let Some(value) = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
        {
            let candidate = value.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }

    socket_addr
        .map(|address| address.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
