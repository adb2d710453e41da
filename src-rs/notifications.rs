use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    format::format_stripe_amount,
    mailer::{Mailer, OutgoingEmail},
    models::{BillingEvent, User},
    stripe_api::StripeInvoice,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NotificationKind {
    Activation,
    PaymentSucceeded,
    PaymentFailed,
    PaymentActionRequired,
    InvoiceUpcoming,
    TrialWillEnd,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Activation => "activation",
            NotificationKind::PaymentSucceeded => "payment_succeeded",
            NotificationKind::PaymentFailed => "payment_failed",
            NotificationKind::PaymentActionRequired => "payment_action_required",
            NotificationKind::InvoiceUpcoming => "invoice_upcoming",
            NotificationKind::TrialWillEnd => "trial_will_end",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "activation" => Some(NotificationKind::Activation),
            "payment_succeeded" => Some(NotificationKind::PaymentSucceeded),
            "payment_failed" => Some(NotificationKind::PaymentFailed),
            "payment_action_required" => Some(NotificationKind::PaymentActionRequired),
            "invoice_upcoming" => Some(NotificationKind::InvoiceUpcoming),
            "trial_will_end" => Some(NotificationKind::TrialWillEnd),
            _ => None,
        }
    }
}

pub enum Notification<'a> {
    Activation { link: String },
    PaymentSucceeded { billing: &'a BillingEvent },
    PaymentFailed { billing: &'a BillingEvent },
    PaymentActionRequired { invoice: &'a StripeInvoice },
    InvoiceUpcoming { invoice: &'a StripeInvoice },
    TrialWillEnd { trial_end: Option<DateTime<Utc>> },
}

impl Notification<'_> {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::Activation { .. } => NotificationKind::Activation,
            Notification::PaymentSucceeded { .. } => NotificationKind::PaymentSucceeded,
            Notification::PaymentFailed { .. } => NotificationKind::PaymentFailed,
            Notification::PaymentActionRequired { .. } => NotificationKind::PaymentActionRequired,
            Notification::InvoiceUpcoming { .. } => NotificationKind::InvoiceUpcoming,
            Notification::TrialWillEnd { .. } => NotificationKind::TrialWillEnd,
        }
    }

    pub fn render(&self, user: &User, site_url: &str) -> OutgoingEmail {
        let billing_url = format!("{}/billing", site_url);
        let (subject, lines) = match self {
            Notification::Activation { link } => (
                "Activate your account".to_string(),
                vec![
                    "Thanks for signing up!".to_string(),
                    format!("Activate your account here: {}", link),
                ],
            ),
            Notification::PaymentSucceeded { billing } => (
                "Payment received".to_string(),
                vec![
                    format!(
                        "We received your payment of {}.",
                        billing_amount(billing, billing.amount_paid())
                    ),
                    billing
                        .description()
                        .map(|description| format!("Item: {}", description))
                        .unwrap_or_default(),
                    format!("Receipt: {}/billing/{}", site_url, billing.id),
                ],
            ),
            Notification::PaymentFailed { billing } => (
                "Your payment failed".to_string(),
                vec![
                    format!(
                        "We could not charge {} for your subscription.",
                        billing_amount(billing, billing.amount_due())
                    ),
                    format!("Please update your payment method: {}", billing_url),
                ],
            ),
            Notification::PaymentActionRequired { invoice } => (
                "Action required to complete your payment".to_string(),
                vec![
                    format!(
                        "Your bank needs you to confirm a payment of {}.",
                        invoice_amount(invoice, invoice.amount_due)
                    ),
                    invoice
                        .hosted_invoice_url
                        .as_ref()
                        .map(|url| format!("Confirm it here: {}", url))
                        .unwrap_or_else(|| format!("Confirm it here: {}", billing_url)),
                ],
            ),
            Notification::InvoiceUpcoming { invoice } => (
                "Your upcoming invoice".to_string(),
                vec![
                    format!(
                        "Your next invoice of {} is coming up{}.",
                        invoice_amount(invoice, invoice.amount_due),
                        invoice
                            .next_payment_attempt
                            .map(|at| format!(" on {}", at.format("%B %-d, %Y")))
                            .unwrap_or_default()
                    ),
                    format!("Manage your subscription: {}", billing_url),
                ],
            ),
            Notification::TrialWillEnd { trial_end } => (
                "Your trial is ending soon".to_string(),
                vec![
                    format!(
                        "Your free trial ends{}.",
                        trial_end
                            .map(|at| format!(" on {}", at.format("%B %-d, %Y")))
                            .unwrap_or_else(|| " soon".to_string())
                    ),
                    format!("Subscribe to keep access: {}", billing_url),
                ],
            ),
        };

        let lines: Vec<String> = lines.into_iter().filter(|line| !line.is_empty()).collect();
        let text = format!("Hi {},\n\n{}\n", user.email, lines.join("\n\n"));
        let html = format!(
            "<p>Hi {},</p>{}",
            escape_html(&user.email),
            lines
                .iter()
                .map(|line| format!("<p>{}</p>", escape_html(line)))
                .collect::<String>()
        );

        OutgoingEmail::new(&user.email, &subject, text, Some(html))
    }
}

fn billing_amount(billing: &BillingEvent, amount: Option<i64>) -> String {
    format_stripe_amount(amount.unwrap_or(0), billing.currency().unwrap_or("usd"))
}

fn invoice_amount(invoice: &StripeInvoice, amount: i64) -> String {
    format_stripe_amount(amount, invoice.currency.as_deref().unwrap_or("usd"))
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Renders and sends notifications; disabled kinds and mail failures are logged and skipped.
#[derive(Clone)]
pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    site_url: String,
    disabled: HashSet<NotificationKind>,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, site_url: String, disabled: HashSet<NotificationKind>) -> Self {
        Self {
            mailer,
            site_url,
            disabled,
        }
    }

    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    pub async fn notify(&self, user: &User, notification: Notification<'_>) -> bool {
        let kind = notification.kind();
        if self.disabled.contains(&kind) {
            tracing::debug!(kind = kind.as_str(), user_id = %user.id, "notification disabled");
            return false;
        }

        let email = notification.render(user, &self.site_url);
        match self.mailer.send(email).await {
            Ok(()) => {
                tracing::info!(kind = kind.as_str(), user_id = %user.id, "notification sent");
                true
            }
            Err(error) => {
                tracing::error!(error = %error, kind = kind.as_str(), user_id = %user.id, "failed to send notification");
                false
            }
        }
    }
}
