use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::{
    config::SaasSettings,
    models::{StripeInfo, User},
    store::BillingStore,
    stripe_api::{StripeApi, StripeCustomer, StripeSubscription},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Updated,
    Created,
    Removed,
    Stale,
    UnknownCustomer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    Unchanged,
    Removed,
    Provisioned,
    NoCustomer,
}

/// Copies a live subscription onto the record. Any other status ends access.
pub fn mirror_subscription(info: &mut StripeInfo, subscription: &StripeSubscription) {
    if subscription.is_live() {
        info.set_subscription(
            subscription.id.clone(),
            subscription.current_period_end,
            subscription.plan_id(),
        );
        return;
    }

    tracing::info!(
        customer_id = %info.customer_id,
        subscription_id = %subscription.id,
        status = subscription.status.as_deref().unwrap_or("unknown"),
        "subscription no longer grants access"
    );
    if !subscription.never_paid() {
        info.previously_subscribed = true;
    }
    let is_current = info
        .subscription_id
        .as_deref()
        .map_or(true, |current| current == subscription.id);
    if is_current {
        info.clear_subscription();
    }
}

/// Mirrors the customer's first subscription onto the cached record.
fn apply_customer_subscription(info: &mut StripeInfo, subscription: Option<&StripeSubscription>) {
    info.previously_subscribed = info.previously_subscribed || info.subscription_id.is_some();
    match subscription {
        Some(subscription) => mirror_subscription(info, subscription),
        None => info.clear_subscription(),
    }
}

/// Reconciles a customer object (from `customer.*` webhooks) with local state.
///
/// Records are matched by customer id first, then by the customer's email,
/// which is how customers created by hosted checkout get linked to users.
pub async fn sync_with_customer(
    store: &dyn BillingStore,
    customer: &StripeCustomer,
    event_at: Option<DateTime<Utc>>,
) -> anyhow::Result<SyncOutcome> {
    let subscription = customer.first_subscription();

    if let Some(mut info) = store
        .get_info_by_customer(&customer.id)
        .await
        .context("failed to load customer record")?
    {
        if !info.accepts_event_at(event_at) {
            return Ok(SyncOutcome::Stale);
        }
        if customer.deleted {
            store.delete_info(info.id).await?;
            return Ok(SyncOutcome::Removed);
        }
        apply_customer_subscription(&mut info, subscription);
        info.mark_event_applied(event_at);
        store.save_info(info).await?;
        return Ok(SyncOutcome::Updated);
    }

    if customer.deleted {
        return Ok(SyncOutcome::UnknownCustomer);
    }

    let email = match customer.email.as_deref().filter(|email| !email.trim().is_empty()) {
        Some(email) => email,
        None => {
            tracing::warn!(customer_id = %customer.id, "customer has no email; cannot link to a user");
            return Ok(SyncOutcome::UnknownCustomer);
        }
    };

    let user = match store.find_user_by_email(email).await? {
        Some(user) => user,
        None => {
            tracing::warn!(customer_id = %customer.id, "no user registered for customer email");
            return Ok(SyncOutcome::UnknownCustomer);
        }
    };

    match store.get_info_for_user(user.id).await? {
        Some(mut info) => {
            if !info.accepts_event_at(event_at) {
                return Ok(SyncOutcome::Stale);
            }
            tracing::info!(
                user_id = %user.id,
                old_customer_id = %info.customer_id,
                customer_id = %customer.id,
                "replacing customer id for user"
            );
            info.customer_id = customer.id.clone();
            apply_customer_subscription(&mut info, subscription);
            info.mark_event_applied(event_at);
            store.save_info(info).await?;
            Ok(SyncOutcome::Updated)
        }
        None => {
            let mut info = StripeInfo::new(user.id, customer.id.clone());
            if let Some(subscription) = subscription {
                mirror_subscription(&mut info, subscription);
            }
            info.mark_event_applied(event_at);
            store.save_info(info).await?;
            Ok(SyncOutcome::Created)
        }
    }
}

/// Returns whether anything changed. Without a live subscription nothing is touched.
pub fn apply_login_refresh(info: &mut StripeInfo, customer: &StripeCustomer) -> bool {
    let subscription = match customer.first_subscription() {
        Some(subscription) => subscription,
        None => return false,
    };

    let replaced = info
        .subscription_id
        .as_deref()
        .map_or(false, |current| current != subscription.id);
    info.previously_subscribed = info.previously_subscribed || replaced;
    mirror_subscription(info, subscription);
    true
}

/// Pulls the live customer on login so missed webhooks cannot leave a user locked out.
pub async fn refresh_on_login(
    store: &dyn BillingStore,
    stripe: &StripeApi,
    settings: &SaasSettings,
    user: &User,
) -> anyhow::Result<RefreshOutcome> {
    let mut info = match store.get_info_for_user(user.id).await? {
        Some(info) => info,
        None => {
            return match provision_customer(store, stripe, settings, user).await? {
                Some(_) => Ok(RefreshOutcome::Provisioned),
                None => Ok(RefreshOutcome::NoCustomer),
            }
        }
    };

    let customer = match stripe.retrieve_customer(&info.customer_id).await {
        Ok(customer) => customer,
        Err(error) => {
            tracing::warn!(error = %error, customer_id = %info.customer_id, "could not refresh customer on login");
            return Ok(RefreshOutcome::Unchanged);
        }
    };

    if customer.deleted {
        tracing::info!(customer_id = %info.customer_id, "customer deleted upstream; removing local record");
        store.delete_info(info.id).await?;
        return Ok(RefreshOutcome::Removed);
    }

    if apply_login_refresh(&mut info, &customer) {
        store.save_info(info).await?;
        Ok(RefreshOutcome::Refreshed)
    } else {
        Ok(RefreshOutcome::Unchanged)
    }
}

/// Creates (or in debug mode, re-adopts) the processor customer for a new user.
/// Hosted checkout creates customers itself, so nothing happens in that mode.
pub async fn provision_customer(
    store: &dyn BillingStore,
    stripe: &StripeApi,
    settings: &SaasSettings,
    user: &User,
) -> anyhow::Result<Option<StripeInfo>> {
    if settings.use_checkout {
        return Ok(None);
    }

    let mut existing = None;
    if settings.debug {
        existing = stripe
            .list_customers_by_email(&user.email)
            .await
            .context("failed to look up existing customers")?
            .into_iter()
            .find(|customer| !customer.deleted);
    }

    let customer = match existing {
        Some(customer) => {
            tracing::info!(customer_id = %customer.id, user_id = %user.id, "reusing existing Stripe customer");
            customer
        }
        None => {
            let customer = stripe
                .create_customer(&user.email, &user.id.to_string())
                .await
                .context("failed to create Stripe customer")?;
            tracing::info!(customer_id = %customer.id, user_id = %user.id, "created Stripe customer");
            customer
        }
    };

    let mut info = StripeInfo::new(user.id, customer.id.clone());
    if let Some(subscription) = customer.first_subscription() {
        mirror_subscription(&mut info, subscription);
    }
    store.save_info(info.clone()).await?;
    Ok(Some(info))
}
