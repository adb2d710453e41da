use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;

use crate::{
    models::{BillingEvent, StripeEventRecord, User},
    notifications::{Notification, Notifier},
    store::{BillingStore, StoreError},
    stripe_api::{StripeCustomer, StripeEvent, StripeInvoice, StripeSubscription},
    sync::{mirror_subscription, sync_with_customer, SyncOutcome},
};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to record event: {0}")]
    Record(#[from] StoreError),
    #[error("failed to handle {event_type}: {source:#}")]
    Handler {
        event_type: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    Duplicate,
    Stale,
    Ignored,
    Recorded,
}

impl WebhookOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Stale => "stale",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Recorded => "recorded",
        }
    }
}

/// Applies verified processor events to local billing state.
#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn BillingStore>,
    notifier: Notifier,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn BillingStore>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Records the event, then dispatches it. A failed dispatch forgets the
    /// event again so the processor's retry is not swallowed as a duplicate.
    pub async fn process(&self, event: StripeEvent) -> Result<WebhookOutcome, WebhookError> {
        let record = StripeEventRecord::new(
            &event.event_type,
            event.data.object.clone(),
            event.id.clone(),
        );
        if !self.store.record_event(record).await? {
            tracing::info!(event_id = ?event.id, event_type = %event.event_type, "duplicate Stripe event");
            return Ok(WebhookOutcome::Duplicate);
        }

        match self.dispatch(&event).await {
            Ok(outcome) => {
                tracing::info!(
                    event_id = ?event.id,
                    event_type = %event.event_type,
                    outcome = outcome.as_str(),
                    "processed Stripe event"
                );
                Ok(outcome)
            }
            Err(source) => {
                if let Some(event_id) = event.id.as_deref() {
                    if let Err(error) = self.store.forget_event(event_id).await {
                        tracing::error!(error = %error, event_id, "failed to forget event after handler failure");
                    }
                }
                Err(WebhookError::Handler {
                    event_type: event.event_type.clone(),
                    source,
                })
            }
        }
    }

    async fn dispatch(&self, event: &StripeEvent) -> anyhow::Result<WebhookOutcome> {
        let object = &event.data.object;
        match event.event_type.as_str() {
            "customer.created" | "customer.updated" | "customer.deleted" => {
                let customer: StripeCustomer =
                    serde_json::from_value(object.clone()).context("invalid customer object")?;
                let outcome = sync_with_customer(self.store.as_ref(), &customer, event.created).await?;
                Ok(match outcome {
                    SyncOutcome::Updated | SyncOutcome::Created | SyncOutcome::Removed => {
                        WebhookOutcome::Applied
                    }
                    SyncOutcome::Stale => {
                        tracing::info!(customer_id = %customer.id, "skipping stale customer event");
                        WebhookOutcome::Stale
                    }
                    SyncOutcome::UnknownCustomer => WebhookOutcome::Ignored,
                })
            }
            "customer.subscription.created" | "customer.subscription.updated" => {
                let subscription = parse_subscription(object)?;
                self.apply_subscription(event, &subscription, false).await
            }
            "customer.subscription.deleted" => {
                let subscription = parse_subscription(object)?;
                self.apply_subscription(event, &subscription, true).await
            }
            "customer.subscription.trial_will_end" => {
                let subscription = parse_subscription(object)?;
                let customer_id = match subscription.customer.as_ref() {
                    Some(customer) => customer.id(),
                    None => return Ok(WebhookOutcome::Ignored),
                };
                let Some(user) = self.customer_user(customer_id).await? else {
                    return Ok(WebhookOutcome::Ignored);
                };
                self.notifier
                    .notify(
                        &user,
                        Notification::TrialWillEnd {
                            trial_end: subscription.trial_end,
                        },
                    )
                    .await;
                Ok(WebhookOutcome::Applied)
            }
            "invoice.payment_succeeded" | "invoice.payment_failed" => {
                let invoice = parse_invoice(object)?;
                let Some(user) = self.invoice_user(&invoice).await? else {
                    return Ok(WebhookOutcome::Ignored);
                };

                let success = event.event_type == "invoice.payment_succeeded";
                let billing = BillingEvent::new(user.id, success, object.clone());
                self.store
                    .insert_billing_event(billing.clone())
                    .await
                    .context("failed to store billing event")?;

                if success {
                    if invoice.amount_due == 0 && invoice.amount_paid == 0 {
                        tracing::debug!(user_id = %user.id, "zero-amount invoice; no receipt sent");
                    } else {
                        self.notifier
                            .notify(&user, Notification::PaymentSucceeded { billing: &billing })
                            .await;
                    }
                } else {
                    self.notifier
                        .notify(&user, Notification::PaymentFailed { billing: &billing })
                        .await;
                }
                Ok(WebhookOutcome::Applied)
            }
            "invoice.payment_action_required" | "invoice.upcoming" => {
                let invoice = parse_invoice(object)?;
                let Some(user) = self.invoice_user(&invoice).await? else {
                    return Ok(WebhookOutcome::Ignored);
                };
                let notification = if event.event_type == "invoice.upcoming" {
                    Notification::InvoiceUpcoming { invoice: &invoice }
                } else {
                    Notification::PaymentActionRequired { invoice: &invoice }
                };
                self.notifier.notify(&user, notification).await;
                Ok(WebhookOutcome::Applied)
            }
            _ => Ok(WebhookOutcome::Recorded),
        }
    }

    async fn apply_subscription(
        &self,
        event: &StripeEvent,
        subscription: &StripeSubscription,
        deleted: bool,
    ) -> anyhow::Result<WebhookOutcome> {
        let customer_id = match subscription.customer.as_ref() {
            Some(customer) => customer.id(),
            None => {
                tracing::warn!(subscription_id = %subscription.id, "subscription without customer");
                return Ok(WebhookOutcome::Ignored);
            }
        };

        let mut info = match self.store.get_info_by_customer(customer_id).await? {
            Some(info) => info,
            None => {
                tracing::warn!(customer_id, "Stripe webhook for unknown customer");
                return Ok(WebhookOutcome::Ignored);
            }
        };

        if !info.accepts_event_at(event.created) {
            tracing::info!(
                customer_id,
                subscription_id = %subscription.id,
                event_type = %event.event_type,
                "skipping stale subscription event"
            );
            return Ok(WebhookOutcome::Stale);
        }

        let is_current = info
            .subscription_id
            .as_deref()
            .map_or(true, |current| current == subscription.id);

        if deleted {
            info.previously_subscribed = true;
            if is_current {
                info.clear_subscription();
            }
        } else {
            info.previously_subscribed = info.previously_subscribed || !is_current;
            mirror_subscription(&mut info, subscription);
        }

        info.mark_event_applied(event.created);
        self.store
            .save_info(info)
            .await
            .context("failed to save customer record")?;
        Ok(WebhookOutcome::Applied)
    }

    async fn invoice_user(&self, invoice: &StripeInvoice) -> anyhow::Result<Option<User>> {
        match invoice.customer.as_ref() {
            Some(customer) => self.customer_user(customer.id()).await,
            None => Ok(None),
        }
    }

    async fn customer_user(&self, customer_id: &str) -> anyhow::Result<Option<User>> {
        let Some(info) = self.store.get_info_by_customer(customer_id).await? else {
            tracing::warn!(customer_id, "Stripe webhook for unknown customer");
            return Ok(None);
        };
        let Some(user) = self.store.get_user(info.user_id).await? else {
            tracing::warn!(customer_id, user_id = %info.user_id, "customer record points at a missing user");
            return Ok(None);
        };
        Ok(Some(user))
    }
}

fn parse_subscription(object: &serde_json::Value) -> anyhow::Result<StripeSubscription> {
    serde_json::from_value(object.clone()).context("invalid subscription object")
}

fn parse_invoice(object: &serde_json::Value) -> anyhow::Result<StripeInvoice> {
    serde_json::from_value(object.clone()).context("invalid invoice object")
}
