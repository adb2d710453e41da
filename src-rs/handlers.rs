use axum::{
    extract::{Extension, Json, Path as AxumPath, State},
    http::{
        header::{REFERER, USER_AGENT},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::{decode_uid, encode_uid, hash_password, verify_password},
    format::format_stripe_amount,
    forms::RegistrationForm,
    middleware::AuthenticatedUser,
    models::{Acquisition, BillingEvent, StripeInfo, User},
    notifications::Notification,
    state::AppState,
    store::StoreError,
    stripe_api::{CheckoutCustomer, SignatureError, StripeEvent, StripeSource, StripeSubscription},
    subscription::Customer,
    sync::{mirror_subscription, provision_customer, refresh_on_login},
    webhook::WebhookOutcome,
};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(flatten)]
    pub form: RegistrationForm,
    pub campaign: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub token: Option<String>,
    #[serde(rename = "planId")]
    pub plan_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentMethodRequest {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    #[serde(rename = "planId")]
    pub plan_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    #[serde(rename = "priceId")]
    pub price_id: Option<String>,
    #[serde(rename = "successUrl")]
    pub success_url: Option<String>,
    #[serde(rename = "cancelUrl")]
    pub cancel_url: Option<String>,
}

const LINK_EXPIRED: &str = "Link Expired. Contact admin to activate your account.";

pub async fn health(State(state): State<AppState>) -> Response {
    let customers = state.store.list_infos().await.map(|infos| infos.len());
    let events = state.store.list_events().await.map(|events| events.len());

    match (customers, events) {
        (Ok(customers), Ok(events)) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "timestamp": Utc::now().to_rfc3339(),
                "customers": customers,
                "events": events,
            })),
        )
            .into_response(),
        (Err(error), _) | (_, Err(error)) => {
            tracing::error!(error = %error, "health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable").into_response()
        }
    }
}

pub async fn get_public_config(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "publishableKey": state.config.stripe_publishable_key,
            "useCheckout": state.config.saas.use_checkout,
            "checkoutPriceId": state.config.saas.checkout_price_id,
            "trialDays": state.config.saas.trial_days,
            "enableTrial": state.config.saas.enable_trial,
        })),
    )
        .into_response()
}

pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterRequest>,
) -> Response {
    let email = match payload.form.validate(state.store.as_ref()).await {
        Ok(Ok(email)) => email,
        Ok(Err(errors)) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "errors": errors }))).into_response()
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to validate registration");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Registration failed.").into_response();
        }
    };

    let password_hash = match hash_password(&payload.form.password1) {
        Ok(hash) => hash,
        Err(error) => {
            tracing::error!(error = %error, "failed to hash password");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Registration failed.").into_response();
        }
    };

    let user = User::new(&email, password_hash);
    match state.store.insert_user(user.clone()).await {
        Ok(()) => {}
        Err(StoreError::EmailTaken) => {
            return (
                StatusCode::CONFLICT,
                Json(json!({ "errors": { "email": ["A user with that email already exists."] } })),
            )
                .into_response()
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to create user");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Registration failed.").into_response();
        }
    }

    let acquisition = Acquisition {
        id: Uuid::new_v4(),
        user_id: user.id,
        agent: header_string(&headers, USER_AGENT.as_str()),
        referer: header_string(&headers, REFERER.as_str()),
        campaign: payload.campaign.filter(|value| !value.trim().is_empty()),
        content: payload.content.filter(|value| !value.trim().is_empty()),
        created_at: Utc::now(),
    };
    if let Err(error) = state.store.insert_acquisition(acquisition).await {
        tracing::error!(error = %error, user_id = %user.id, "failed to record acquisition");
    }

    // Login retries provisioning for users left without a customer here.
    if let Err(error) =
        provision_customer(state.store.as_ref(), &state.stripe, &state.config.saas, &user).await
    {
        tracing::error!(error = %error, user_id = %user.id, "failed to provision Stripe customer");
    }

    let link = format!(
        "{}/api/auth/activate/{}/{}",
        state.notifier.site_url(),
        encode_uid(user.id),
        state.auth.make_activation_token(&user)
    );
    state
        .notifier
        .notify(&user, Notification::Activation { link })
        .await;

    tracing::info!(user_id = %user.id, "registered user");
    (
        StatusCode::CREATED,
        Json(json!({
            "message": "Check your email to activate your account.",
            "userId": user.id,
        })),
    )
        .into_response()
}

pub async fn activate(
    State(state): State<AppState>,
    AxumPath((uidb64, token)): AxumPath<(String, String)>,
) -> Response {
    let user_id = match decode_uid(&uidb64) {
        Some(user_id) => user_id,
        None => return (StatusCode::BAD_REQUEST, LINK_EXPIRED).into_response(),
    };

    let mut user = match state.store.get_user(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return (StatusCode::BAD_REQUEST, LINK_EXPIRED).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to load user for activation");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Activation failed.").into_response();
        }
    };

    if !state.auth.check_activation_token(&user, &token) {
        return (StatusCode::BAD_REQUEST, LINK_EXPIRED).into_response();
    }

    user.is_active = true;
    if let Err(error) = state.store.update_user(user.clone()).await {
        tracing::error!(error = %error, user_id = %user.id, "failed to activate user");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Activation failed.").into_response();
    }

    tracing::info!(user_id = %user.id, "activated user");
    session_response(&state, &user).await
}

pub async fn login(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> Response {
    let user = match state.store.find_user_by_email(payload.email.trim()).await {
        Ok(Some(user)) if verify_password(&payload.password, &user.password_hash) => user,
        Ok(_) => {
            return (StatusCode::UNAUTHORIZED, "Invalid email or password.").into_response()
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to load user for login");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed.").into_response();
        }
    };

    if !user.is_active {
        return (StatusCode::FORBIDDEN, "Account is not activated.").into_response();
    }

    match refresh_on_login(state.store.as_ref(), &state.stripe, &state.config.saas, &user).await {
        Ok(outcome) => tracing::debug!(user_id = %user.id, outcome = ?outcome, "billing refreshed on login"),
        Err(error) => {
            tracing::error!(error = %error, user_id = %user.id, "failed to refresh billing on login")
        }
    }

    session_response(&state, &user).await
}

async fn session_response(state: &AppState, user: &User) -> Response {
    let token = match state.auth.issue_session(user) {
        Ok(token) => token,
        Err(error) => {
            tracing::error!(error = %error, "failed to issue session");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    let info = match load_info(state, user).await {
        Ok(info) => info,
        Err(response) => return response,
    };
    let customer = Customer::of(user, info.as_ref(), state.policy, Utc::now());

    (
        StatusCode::OK,
        Json(json!({ "token": token, "customer": customer.summary() })),
    )
        .into_response()
}

pub async fn get_customer(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Response {
    let info = match load_info(&state, &auth.user).await {
        Ok(info) => info,
        Err(response) => return response,
    };
    let customer = Customer::of(&auth.user, info.as_ref(), state.policy, Utc::now());
    (StatusCode::OK, Json(customer.summary())).into_response()
}

pub async fn list_plans(State(state): State<AppState>) -> Response {
    match state.stripe.list_plans().await {
        Ok(plans) => (
            StatusCode::OK,
            Json(json!({
                "plans": plans,
                "publishableKey": state.config.stripe_publishable_key,
            })),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to list Stripe plans");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error loading plans").into_response()
        }
    }
}

pub async fn subscribe(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(payload): Json<SubscribeRequest>,
) -> Response {
    let (token, plan_id) = match (non_blank(payload.token), non_blank(payload.plan_id)) {
        (Some(token), Some(plan_id)) => (token, plan_id),
        _ => {
            return (StatusCode::BAD_REQUEST, "A card token and plan are required.")
                .into_response()
        }
    };

    let mut info = match require_info(&state, &auth.user).await {
        Ok(info) => info,
        Err(response) => return response,
    };

    let customer = Customer::of(&auth.user, Some(&info), state.policy, Utc::now());
    if customer.actively_subscribed() && info.subscription_id.is_some() {
        return (StatusCode::CONFLICT, "You already have an active subscription.").into_response();
    }

    if let Err(error) = state
        .stripe
        .update_customer_source(&info.customer_id, &token)
        .await
    {
        tracing::error!(error = %error, customer_id = %info.customer_id, "failed to attach card");
        return (StatusCode::BAD_REQUEST, "Your card could not be saved.").into_response();
    }

    let subscription = match state
        .stripe
        .create_subscription(&info.customer_id, &plan_id)
        .await
    {
        Ok(subscription) => subscription,
        Err(error) => {
            tracing::error!(error = %error, customer_id = %info.customer_id, "failed to create subscription");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error creating subscription").into_response();
        }
    };

    info.previously_subscribed = info.previously_subscribed || info.subscription_id.is_some();
    mirror_subscription(&mut info, &subscription);
    if let Err(error) = state.store.save_info(info).await {
        tracing::error!(error = %error, "failed to save subscription locally");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Error creating subscription").into_response();
    }

    if !subscription.is_live() {
        tracing::warn!(
            user_id = %auth.user.id,
            subscription_id = %subscription.id,
            status = subscription.status.as_deref().unwrap_or("unknown"),
            "subscription created without a successful payment"
        );
        return (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "error": "Your payment could not be completed.",
                "subscription": subscription_json(&subscription),
            })),
        )
            .into_response();
    }

    tracing::info!(user_id = %auth.user.id, subscription_id = %subscription.id, "created subscription");
    (
        StatusCode::CREATED,
        Json(json!({ "subscription": subscription_json(&subscription) })),
    )
        .into_response()
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Response {
    let info = match load_info(&state, &auth.user).await {
        Ok(info) => info,
        Err(response) => return response,
    };

    let bills = match state.store.list_billing_events_for_user(auth.user.id).await {
        Ok(bills) => bills,
        Err(error) => {
            tracing::error!(error = %error, "failed to load billing history");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error loading subscription").into_response();
        }
    };

    let (card, subscription) = match info.as_ref() {
        Some(info) => match state.stripe.retrieve_customer(&info.customer_id).await {
            Ok(customer) => (
                customer.first_source().map(card_json),
                customer.first_subscription().map(subscription_json),
            ),
            Err(error) => {
                tracing::error!(error = %error, customer_id = %info.customer_id, "failed to load Stripe customer");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Error loading subscription")
                    .into_response();
            }
        },
        None => (None, None),
    };

    let customer = Customer::of(&auth.user, info.as_ref(), state.policy, Utc::now());
    (
        StatusCode::OK,
        Json(json!({
            "customer": customer.summary(),
            "card": card,
            "subscription": subscription,
            "bills": bills.iter().map(billing_json).collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

pub async fn update_payment_method(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(payload): Json<PaymentMethodRequest>,
) -> Response {
    let token = match non_blank(payload.token) {
        Some(token) => token,
        None => return (StatusCode::BAD_REQUEST, "A card token is required.").into_response(),
    };

    let info = match require_info(&state, &auth.user).await {
        Ok(info) => info,
        Err(response) => return response,
    };

    let customer = match state
        .stripe
        .update_customer_source(&info.customer_id, &token)
        .await
    {
        Ok(customer) => customer,
        Err(error) => {
            tracing::error!(error = %error, customer_id = %info.customer_id, "failed to replace card");
            return (StatusCode::BAD_REQUEST, "Your card could not be saved.").into_response();
        }
    };

    let card = customer.first_source();
    if let (Some(subscription_id), Some(card)) = (info.subscription_id.as_deref(), card) {
        if let Err(error) = state
            .stripe
            .set_subscription_default_source(subscription_id, &card.id)
            .await
        {
            tracing::error!(error = %error, subscription_id, "failed to update subscription card");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error updating payment method")
                .into_response();
        }
    }

    (StatusCode::OK, Json(json!({ "card": card.map(card_json) }))).into_response()
}

pub async fn change_plan(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(payload): Json<ChangePlanRequest>,
) -> Response {
    let plan_id = match non_blank(payload.plan_id) {
        Some(plan_id) => plan_id,
        None => return (StatusCode::BAD_REQUEST, "A plan is required.").into_response(),
    };

    let mut info = match require_info(&state, &auth.user).await {
        Ok(info) => info,
        Err(response) => return response,
    };
    let subscription_id = match info.subscription_id.clone() {
        Some(subscription_id) => subscription_id,
        None => return (StatusCode::BAD_REQUEST, "You have no subscription to change.").into_response(),
    };

    let current = match state.stripe.retrieve_subscription(&subscription_id).await {
        Ok(subscription) => subscription,
        Err(error) => {
            tracing::error!(error = %error, subscription_id = %subscription_id, "failed to load subscription");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error changing plan").into_response();
        }
    };
    let item_id = match current.first_item_id() {
        Some(item_id) => item_id.to_string(),
        None => {
            tracing::error!(subscription_id = %subscription_id, "subscription has no items");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error changing plan").into_response();
        }
    };

    let updated = match state
        .stripe
        .change_subscription_plan(&subscription_id, &item_id, &plan_id)
        .await
    {
        Ok(subscription) => subscription,
        Err(error) => {
            tracing::error!(error = %error, subscription_id = %subscription_id, "failed to change plan");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error changing plan").into_response();
        }
    };

    mirror_subscription(&mut info, &updated);
    if let Err(error) = state.store.save_info(info).await {
        tracing::error!(error = %error, "failed to save plan change locally");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Error changing plan").into_response();
    }

    (
        StatusCode::OK,
        Json(json!({ "subscription": subscription_json(&updated) })),
    )
        .into_response()
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Response {
    let mut info = match require_info(&state, &auth.user).await {
        Ok(info) => info,
        Err(response) => return response,
    };
    let subscription_id = match info.subscription_id.clone() {
        Some(subscription_id) => subscription_id,
        None => return (StatusCode::BAD_REQUEST, "You have no subscription to cancel.").into_response(),
    };

    let at_period_end = state.config.saas.cancel_at_period_end;
    let result = if at_period_end {
        state
            .stripe
            .cancel_subscription_at_period_end(&subscription_id)
            .await
    } else {
        state.stripe.delete_subscription(&subscription_id).await
    };

    if let Err(error) = result {
        tracing::error!(error = %error, subscription_id = %subscription_id, "failed to cancel subscription");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Error canceling subscription").into_response();
    }

    // A lazy cancel keeps access until the period ends; the deletion webhook clears it.
    if !at_period_end {
        info.previously_subscribed = true;
        info.clear_subscription();
        if let Err(error) = state.store.save_info(info).await {
            tracing::error!(error = %error, "failed to save cancellation locally");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error canceling subscription")
                .into_response();
        }
    }

    tracing::info!(user_id = %auth.user.id, subscription_id = %subscription_id, at_period_end, "canceled subscription");
    (
        StatusCode::OK,
        Json(json!({ "canceled": true, "atPeriodEnd": at_period_end })),
    )
        .into_response()
}

pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Response {
    let info = match require_info(&state, &auth.user).await {
        Ok(info) => info,
        Err(response) => return response,
    };

    let return_url = format!("{}/billing", state.config.site_url);
    let session = match state
        .stripe
        .create_billing_portal_session(&info.customer_id, &return_url)
        .await
    {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(error = %error, "failed to create Stripe portal session");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error creating customer portal session",
            )
                .into_response();
        }
    };

    match session.url {
        Some(url) => (StatusCode::OK, Json(json!({ "url": url }))).into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error creating Stripe customer portal session.",
        )
            .into_response(),
    }
}

pub async fn create_checkout_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(payload): Json<CreateCheckoutRequest>,
) -> Response {
    if !state.config.saas.use_checkout {
        return (StatusCode::BAD_REQUEST, "Checkout is disabled.").into_response();
    }

    let price_id = match non_blank(payload.price_id).or_else(|| state.config.saas.checkout_price_id.clone()) {
        Some(price_id) => price_id,
        None => return (StatusCode::BAD_REQUEST, "No price configured for checkout.").into_response(),
    };

    let info = match load_info(&state, &auth.user).await {
        Ok(info) => info,
        Err(response) => return response,
    };
    let customer = match info.as_ref() {
        Some(info) => CheckoutCustomer::Existing(&info.customer_id),
        None => CheckoutCustomer::Email(&auth.user.email),
    };

    let site_url = &state.config.site_url;
    let success_url = non_blank(payload.success_url)
        .unwrap_or_else(|| format!("{}/billing?checkout=success", site_url));
    let cancel_url = non_blank(payload.cancel_url)
        .unwrap_or_else(|| format!("{}/billing?checkout=canceled", site_url));

    let session = match state
        .stripe
        .create_checkout_session(customer, &price_id, &success_url, &cancel_url)
        .await
    {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(error = %error, "failed to create Stripe checkout session");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error creating checkout session")
                .into_response();
        }
    };

    match session.url {
        Some(url) => (StatusCode::OK, Json(json!({ "url": url }))).into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error creating Stripe checkout session.",
        )
            .into_response(),
    }
}

pub async fn get_billing(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    AxumPath(billing_id): AxumPath<Uuid>,
) -> Response {
    match state.store.get_billing_event(billing_id).await {
        Ok(Some(billing)) if billing.user_id == auth.user.id => {
            (StatusCode::OK, Json(billing_json(&billing))).into_response()
        }
        Ok(_) => (StatusCode::NOT_FOUND, "Not Found").into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to load billing event");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

pub async fn premium(Extension(auth): Extension<AuthenticatedUser>) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "message": format!("Welcome, {}.", auth.user.email) })),
    )
        .into_response()
}

pub async fn admin_customers(State(state): State<AppState>) -> Response {
    let infos = match state.store.list_infos().await {
        Ok(infos) => infos,
        Err(error) => {
            tracing::error!(error = %error, "failed to list customers");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    let now = Utc::now();
    let mut customers = Vec::with_capacity(infos.len());
    for info in &infos {
        let user = match state.store.get_user(info.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => continue,
            Err(error) => {
                tracing::error!(error = %error, "failed to load customer user");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
            }
        };
        let acquisition = match state.store.get_acquisition_for_user(user.id).await {
            Ok(acquisition) => acquisition,
            Err(error) => {
                tracing::warn!(error = %error, user_id = %user.id, "failed to load acquisition");
                None
            }
        };
        let customer = Customer::of(&user, Some(info), state.policy, now);
        customers.push(json!({
            "id": info.id,
            "shortId": info.short_id(),
            "customerId": info.customer_id,
            "subscriptionId": info.subscription_id,
            "createdAt": info.created_at,
            "modifiedAt": info.modified_at,
            "summary": customer.summary(),
            "acquisition": acquisition,
        }));
    }

    (StatusCode::OK, Json(json!({ "customers": customers }))).into_response()
}

pub async fn admin_events(State(state): State<AppState>) -> Response {
    match state.store.list_events().await {
        Ok(events) => (StatusCode::OK, Json(json!({ "events": events }))).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to list events");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

pub async fn admin_bills(State(state): State<AppState>) -> Response {
    match state.store.list_billing_events().await {
        Ok(bills) => (
            StatusCode::OK,
            Json(json!({ "bills": bills.iter().map(billing_json).collect::<Vec<_>>() })),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to list bills");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = match headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value,
        None => return (StatusCode::BAD_REQUEST, "Missing Stripe signature.").into_response(),
    };

    if let Err(error) = state.stripe.verify_webhook_signature(signature, &body) {
        tracing::error!(error = %error, "Stripe webhook signature verification failed");
        if error == SignatureError::NotConfigured {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Webhook not configured.").into_response();
        }
        return (StatusCode::BAD_REQUEST, "Invalid signature.").into_response();
    }

    let event: StripeEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(error) => {
            tracing::error!(error = %error, "invalid Stripe webhook payload");
            return (StatusCode::BAD_REQUEST, "Invalid payload.").into_response();
        }
    };

    match state.webhooks.process(event).await {
        Ok(WebhookOutcome::Duplicate) => (
            StatusCode::OK,
            Json(json!({ "received": true, "duplicate": true })),
        )
            .into_response(),
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "received": true, "duplicate": false, "outcome": outcome.as_str() })),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(error = %error, "Stripe webhook handling failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Webhook handler failed.").into_response()
        }
    }
}

async fn load_info(state: &AppState, user: &User) -> Result<Option<StripeInfo>, Response> {
    state.store.get_info_for_user(user.id).await.map_err(|error| {
        tracing::error!(error = %error, user_id = %user.id, "failed to load billing record");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
    })
}

async fn require_info(state: &AppState, user: &User) -> Result<StripeInfo, Response> {
    match load_info(state, user).await? {
        Some(info) => Ok(info),
        None => Err((StatusCode::BAD_REQUEST, "No billing account found for this user.").into_response()),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn card_json(card: &StripeSource) -> Value {
    json!({
        "id": card.id,
        "brand": card.brand,
        "last4": card.last4,
        "expMonth": card.exp_month,
        "expYear": card.exp_year,
    })
}

fn subscription_json(subscription: &StripeSubscription) -> Value {
    json!({
        "id": subscription.id,
        "status": subscription.status,
        "planId": subscription.plan_id(),
        "currentPeriodEnd": subscription.current_period_end,
        "trialEnd": subscription.trial_end,
        "cancelAtPeriodEnd": subscription.cancel_at_period_end,
    })
}

fn billing_json(billing: &BillingEvent) -> Value {
    let currency = billing.currency().unwrap_or("usd");
    json!({
        "id": billing.id,
        "shortId": billing.short_id(),
        "success": billing.success,
        "invoice": billing.invoice(),
        "date": billing.date(),
        "description": billing.description(),
        "currency": currency,
        "amountDue": billing.amount_due().map(|amount| format_stripe_amount(amount, currency)),
        "amountPaid": billing.amount_paid().map(|amount| format_stripe_amount(amount, currency)),
        "createdAt": billing.created_at,
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use chrono::Duration;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        auth::AuthService,
        config::Config,
        mailer::testing::RecordingMailer,
        notifications::NotificationKind,
        store::MemoryStore,
        stripe_api::{sign_payload, StripeApi},
    };

    struct TestApp {
        router: Router,
        state: AppState,
        mailer: RecordingMailer,
    }

    fn test_app_with(config: Config) -> TestApp {
        let mailer = RecordingMailer::default();
        let auth = AuthService::new(
            config.session_secret.clone().unwrap_or_default().as_bytes(),
            Duration::hours(config.session_ttl_hours),
            Duration::hours(config.activation_token_ttl_hours),
        )
        .unwrap();
        let stripe = StripeApi::new(
            config.stripe_secret_key.clone(),
            config.stripe_webhook_secret.clone(),
        )
        .unwrap()
        .with_base_url(config.stripe_api_base.clone());
        let state = AppState::new(
            config,
            Arc::new(MemoryStore::new()),
            auth,
            stripe,
            Arc::new(mailer.clone()),
        );
        TestApp {
            router: crate::build_router(state.clone()),
            state,
            mailer,
        }
    }

    fn test_app() -> TestApp {
        test_app_with(Config::for_tests())
    }

    fn test_app_against(server: &httpmock::MockServer, config: Config) -> TestApp {
        test_app_with(Config {
            stripe_secret_key: Some("sk_test_123".to_string()),
            stripe_api_base: format!("{}/v1", server.base_url()),
            ..config
        })
    }

    impl TestApp {
        async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, body.to_vec())
        }

        async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Vec<u8>) {
            let mut builder = Request::builder().uri(uri);
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {}", token));
            }
            self.send(builder.body(Body::empty()).unwrap()).await
        }

        async fn post_json(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Vec<u8>) {
            let mut builder = Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json");
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {}", token));
            }
            self.send(builder.body(Body::from(body.to_string())).unwrap()).await
        }

        async fn active_user(&self, email: &str, staff: bool) -> (User, String) {
            let mut user = User::new(email, hash_password("long enough").unwrap());
            user.is_active = true;
            user.is_staff = staff;
            self.state.store.insert_user(user.clone()).await.unwrap();
            let token = self.state.auth.issue_session(&user).unwrap();
            (user, token)
        }
    }

    fn json_body(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app();
        let (status, body) = app.get("/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["status"], "ok");
    }

    #[tokio::test]
    async fn public_config_exposes_publishable_key() {
        let app = test_app();
        let (status, body) = app.get("/api/config", None).await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body["publishableKey"], "pk_test_123");
        assert_eq!(body["useCheckout"], false);
    }

    #[tokio::test]
    async fn register_activate_and_view_trial() {
        let app = test_app();
        let (status, _) = app
            .post_json(
                "/api/auth/register",
                None,
                json!({
                    "email": "ada@example.com",
                    "password1": "long enough",
                    "password2": "long enough",
                    "campaign": "launch"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let user = app
            .state
            .store
            .find_user_by_email("ada@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(!user.is_active);
        let acquisition = app.state.store.get_acquisition_for_user(user.id).await.unwrap().unwrap();
        assert_eq!(acquisition.campaign.as_deref(), Some("launch"));

        let sent = app.mailer.sent();
        assert_eq!(sent.len(), 1);
        let link = sent[0]
            .text
            .lines()
            .find_map(|line| line.strip_prefix("Activate your account here: "))
            .unwrap()
            .to_string();
        let path = link.strip_prefix("https://app.example.com").unwrap();

        let (status, body) = app.get(path, None).await;
        assert_eq!(status, StatusCode::OK);
        let token = json_body(&body)["token"].as_str().unwrap().to_string();

        let (status, body) = app.get("/api/customer", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        let summary = json_body(&body);
        assert_eq!(summary["trialing"], true);
        assert_eq!(summary["subscribed"], true);
        assert_eq!(summary["state"], "trialing");

        // The link is single use.
        let (status, body) = app.get(path, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(String::from_utf8(body).unwrap(), LINK_EXPIRED);
    }

    #[tokio::test]
    async fn register_reports_field_errors() {
        let app = test_app();
        let (status, body) = app
            .post_json(
                "/api/auth/register",
                None,
                json!({ "email": "nope", "password1": "short", "password2": "short" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let errors = &json_body(&body)["errors"];
        assert!(errors["email"].is_array());
        assert!(errors["password1"].is_array());
        assert!(errors.get("password2").is_none());
        assert!(app.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn disabled_activation_mail_is_not_sent() {
        let mut config = Config::for_tests();
        config.saas.disabled_notifications = HashSet::from([NotificationKind::Activation]);
        let app = test_app_with(config);
        let (status, _) = app
            .post_json(
                "/api/auth/register",
                None,
                json!({ "email": "ada@example.com", "password1": "long enough", "password2": "long enough" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(app.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn bad_activation_links_expire() {
        let app = test_app();
        let (status, _) = app.get("/api/auth/activate/garbage/1-abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn login_checks_password_and_activation() {
        let app = test_app();
        app.active_user("ada@example.com", false).await;
        let inactive = User::new("bob@example.com", hash_password("long enough").unwrap());
        app.state.store.insert_user(inactive).await.unwrap();

        let (status, body) = app
            .post_json(
                "/api/auth/login",
                None,
                json!({ "email": "ada@example.com", "password": "long enough" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(json_body(&body)["token"].is_string());

        let (status, _) = app
            .post_json(
                "/api/auth/login",
                None,
                json!({ "email": "ada@example.com", "password": "wrong password" }),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = app
            .post_json(
                "/api/auth/login",
                None,
                json!({ "email": "bob@example.com", "password": "long enough" }),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn auth_endpoints_are_rate_limited() {
        let app = test_app();
        for _ in 0..10 {
            let (status, _) = app
                .post_json("/api/auth/login", None, json!({ "email": "x@example.com", "password": "nope" }))
                .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        let (status, _) = app
            .post_json("/api/auth/login", None, json!({ "email": "x@example.com", "password": "nope" }))
            .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn session_is_required() {
        let app = test_app();
        let (status, _) = app.get("/api/customer", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = app.get("/api/customer", Some("not-a-token")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn premium_requires_entitlement() {
        let app = test_app();
        let (_, token) = app.active_user("trial@example.com", false).await;
        let (status, _) = app.get("/api/premium", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);

        // A trial is not enough for paid-only features.
        let (status, _) = app.get("/api/premium/pro", Some(&token)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

        let (mut expired, token) = app.active_user("expired@example.com", false).await;
        expired.date_joined = Utc::now() - Duration::days(40);
        app.state.store.update_user(expired).await.unwrap();

        let (status, body) = app.get("/api/premium", Some(&token)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(json_body(&body)["upgradeUrl"], "/subscribe");
    }

    #[tokio::test]
    async fn paying_customers_pass_paid_gate() {
        let app = test_app();
        let (user, token) = app.active_user("paid@example.com", false).await;
        let mut info = StripeInfo::new(user.id, "cus_1");
        info.set_subscription("sub_1".into(), Some(Utc::now() + Duration::days(10)), None);
        app.state.store.save_info(info).await.unwrap();

        let (status, _) = app.get("/api/premium/pro", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_routes_require_staff() {
        let app = test_app();
        let (_, user_token) = app.active_user("user@example.com", false).await;
        let (_, staff_token) = app.active_user("staff@example.com", true).await;

        let (status, _) = app.get("/api/admin/customers", Some(&user_token)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        for path in ["/api/admin/customers", "/api/admin/events", "/api/admin/bills"] {
            let (status, _) = app.get(path, Some(&staff_token)).await;
            assert_eq!(status, StatusCode::OK, "{}", path);
        }
    }

    #[tokio::test]
    async fn bills_are_private_to_their_owner() {
        let app = test_app();
        let (owner, owner_token) = app.active_user("owner@example.com", false).await;
        let (_, other_token) = app.active_user("other@example.com", false).await;

        let billing = BillingEvent::new(
            owner.id,
            true,
            json!({ "id": "in_1", "amount_paid": 500, "currency": "usd" }),
        );
        app.state.store.insert_billing_event(billing.clone()).await.unwrap();
        let path = format!("/api/billing/{}", billing.id);

        let (status, body) = app.get(&path, Some(&owner_token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["amountPaid"], "$5.00");

        let (status, _) = app.get(&path, Some(&other_token)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn checkout_requires_checkout_mode() {
        let app = test_app();
        let (_, token) = app.active_user("ada@example.com", false).await;
        let (status, _) = app
            .post_json("/api/subscription/checkout", Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_without_subscription_is_rejected() {
        let app = test_app();
        let (user, token) = app.active_user("ada@example.com", false).await;
        app.state
            .store
            .save_info(StripeInfo::new(user.id, "cus_1"))
            .await
            .unwrap();
        let (status, _) = app
            .post_json("/api/subscription/cancel", Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    fn signed_webhook(body: &str, secret: &str) -> Request<Body> {
        let timestamp = Utc::now().timestamp();
        let signature = sign_payload(secret, timestamp, body.as_bytes());
        Request::builder()
            .method("POST")
            .uri("/api/stripe/webhook")
            .header("stripe-signature", format!("t={},v1={}", timestamp, signature))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn webhook_is_verified_and_deduplicated() {
        let app = test_app();
        let body = json!({
            "id": "evt_1",
            "type": "charge.refunded",
            "created": Utc::now().timestamp(),
            "data": { "object": { "id": "ch_1" } }
        })
        .to_string();

        let (status, body_bytes) = app.send(signed_webhook(&body, "whsec_test_secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body_bytes)["duplicate"], false);

        let (status, body_bytes) = app.send(signed_webhook(&body, "whsec_test_secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body_bytes)["duplicate"], true);

        let (status, _) = app.send(signed_webhook(&body, "whsec_wrong")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unsigned = Request::builder()
            .method("POST")
            .uri("/api/stripe/webhook")
            .body(Body::from(body))
            .unwrap();
        let (status, _) = app.send(unsigned).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_without_secret_is_a_server_error() {
        let mut config = Config::for_tests();
        config.stripe_webhook_secret = None;
        let app = test_app_with(config);
        let (status, _) = app.send(signed_webhook("{}", "whsec_test_secret")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn webhook_rejects_unparsable_payload() {
        let app = test_app();
        let (status, _) = app.send(signed_webhook("not json", "whsec_test_secret")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    async fn customer_with_subscription(app: &TestApp, user: &User) {
        let mut info = StripeInfo::new(user.id, "cus_1");
        info.set_subscription(
            "sub_1".into(),
            Some(Utc::now() + Duration::days(20)),
            Some("plan_basic".into()),
        );
        app.state.store.save_info(info).await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_attaches_card_and_stores_subscription() {
        let server = httpmock::MockServer::start_async().await;
        let attach = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/v1/customers/cus_1")
                    .x_www_form_urlencoded_tuple("source", "tok_visa");
                then.status(200).json_body(json!({ "id": "cus_1" }));
            })
            .await;
        let period_end = (Utc::now() + Duration::days(30)).timestamp();
        let create = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/v1/subscriptions")
                    .x_www_form_urlencoded_tuple("items[0][plan]", "plan_pro");
                then.status(200).json_body(json!({
                    "id": "sub_1",
                    "status": "active",
                    "current_period_end": period_end,
                    "plan": { "id": "plan_pro" }
                }));
            })
            .await;

        let app = test_app_against(&server, Config::for_tests());
        let (user, token) = app.active_user("ada@example.com", false).await;
        app.state.store.save_info(StripeInfo::new(user.id, "cus_1")).await.unwrap();

        let (status, body) = app
            .post_json(
                "/api/subscription/subscribe",
                Some(&token),
                json!({ "token": "tok_visa", "planId": "plan_pro" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json_body(&body)["subscription"]["planId"], "plan_pro");
        attach.assert_async().await;
        create.assert_async().await;

        let info = app.state.store.get_info_for_user(user.id).await.unwrap().unwrap();
        assert_eq!(info.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(info.plan_id.as_deref(), Some("plan_pro"));
    }

    #[tokio::test]
    async fn declined_first_payment_does_not_grant_access() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/v1/customers/cus_1");
                then.status(200).json_body(json!({ "id": "cus_1" }));
            })
            .await;
        let period_end = (Utc::now() + Duration::days(30)).timestamp();
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/v1/subscriptions");
                then.status(200).json_body(json!({
                    "id": "sub_1",
                    "status": "incomplete",
                    "current_period_end": period_end,
                    "plan": { "id": "plan_pro" }
                }));
            })
            .await;

        let app = test_app_against(&server, Config::for_tests());
        let (user, token) = app.active_user("ada@example.com", false).await;
        app.state.store.save_info(StripeInfo::new(user.id, "cus_1")).await.unwrap();

        let (status, body) = app
            .post_json(
                "/api/subscription/subscribe",
                Some(&token),
                json!({ "token": "tok_declined", "planId": "plan_pro" }),
            )
            .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(json_body(&body)["subscription"]["status"], "incomplete");

        let info = app.state.store.get_info_for_user(user.id).await.unwrap().unwrap();
        assert!(info.subscription_id.is_none());
        assert!(info.subscription_end.is_none());
        assert!(!info.previously_subscribed);
    }

    #[tokio::test]
    async fn change_plan_swaps_the_first_item() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/v1/subscriptions/sub_1");
                then.status(200).json_body(json!({
                    "id": "sub_1",
                    "status": "active",
                    "items": { "data": [{ "id": "si_1", "plan": { "id": "plan_basic" } }] }
                }));
            })
            .await;
        let period_end = (Utc::now() + Duration::days(30)).timestamp();
        let update = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/v1/subscriptions/sub_1")
                    .x_www_form_urlencoded_tuple("items[0][id]", "si_1")
                    .x_www_form_urlencoded_tuple("items[0][plan]", "plan_max");
                then.status(200).json_body(json!({
                    "id": "sub_1",
                    "status": "active",
                    "current_period_end": period_end,
                    "items": { "data": [{ "id": "si_1", "plan": { "id": "plan_max" } }] }
                }));
            })
            .await;

        let app = test_app_against(&server, Config::for_tests());
        let (user, token) = app.active_user("ada@example.com", false).await;
        customer_with_subscription(&app, &user).await;

        let (status, body) = app
            .post_json("/api/subscription/plan", Some(&token), json!({ "planId": "plan_max" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["subscription"]["planId"], "plan_max");
        update.assert_async().await;

        let info = app.state.store.get_info_for_user(user.id).await.unwrap().unwrap();
        assert_eq!(info.plan_id.as_deref(), Some("plan_max"));
    }

    #[tokio::test]
    async fn immediate_cancel_deletes_and_clears_access() {
        let server = httpmock::MockServer::start_async().await;
        let delete = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::DELETE).path("/v1/subscriptions/sub_1");
                then.status(200)
                    .json_body(json!({ "id": "sub_1", "status": "canceled" }));
            })
            .await;

        let app = test_app_against(&server, Config::for_tests());
        let (user, token) = app.active_user("ada@example.com", false).await;
        customer_with_subscription(&app, &user).await;

        let (status, body) = app
            .post_json("/api/subscription/cancel", Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["atPeriodEnd"], false);
        delete.assert_async().await;

        let info = app.state.store.get_info_for_user(user.id).await.unwrap().unwrap();
        assert!(info.subscription_id.is_none());
        assert!(info.previously_subscribed);
    }

    #[tokio::test]
    async fn lazy_cancel_keeps_access_until_period_end() {
        let server = httpmock::MockServer::start_async().await;
        let flag = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/v1/subscriptions/sub_1")
                    .x_www_form_urlencoded_tuple("cancel_at_period_end", "true");
                then.status(200).json_body(json!({
                    "id": "sub_1",
                    "status": "active",
                    "cancel_at_period_end": true
                }));
            })
            .await;
        let delete = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::DELETE).path("/v1/subscriptions/sub_1");
                then.status(200).json_body(json!({ "id": "sub_1" }));
            })
            .await;

        let mut config = Config::for_tests();
        config.saas.cancel_at_period_end = true;
        let app = test_app_against(&server, config);
        let (user, token) = app.active_user("ada@example.com", false).await;
        customer_with_subscription(&app, &user).await;

        let (status, body) = app
            .post_json("/api/subscription/cancel", Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["atPeriodEnd"], true);
        flag.assert_async().await;
        assert_eq!(delete.hits_async().await, 0);

        let info = app.state.store.get_info_for_user(user.id).await.unwrap().unwrap();
        assert_eq!(info.subscription_id.as_deref(), Some("sub_1"));
        assert!(!info.previously_subscribed);
    }
}
