use std::{collections::HashSet, env, path::PathBuf};

use crate::{notifications::NotificationKind, subscription::MAX_TRIAL_DAYS};

const MAX_TOKEN_TTL_HOURS: i64 = 24 * 365 * 10;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub trust_proxy: bool,
    pub production: bool,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub site_url: String,
    pub stripe_api_base: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_publishable_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub session_secret: Option<String>,
    pub session_ttl_hours: i64,
    pub activation_token_ttl_hours: i64,
    pub saas: SaasSettings,
    pub smtp: Option<SmtpSettings>,
    pub from_email: String,
    pub store_path: Option<PathBuf>,
}

/// Billing behaviour toggles, named after the `SAAS_*` variables that set them.
#[derive(Clone, Debug)]
pub struct SaasSettings {
    pub trial_days: i64,
    pub enable_trial: bool,
    pub is_staff_subscribed: bool,
    pub use_checkout: bool,
    pub checkout_price_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub upgrade_url: String,
    pub debug: bool,
    pub disabled_notifications: HashSet<NotificationKind>,
}

impl Default for SaasSettings {
    fn default() -> Self {
        Self {
            trial_days: 30,
            enable_trial: true,
            is_staff_subscribed: true,
            use_checkout: false,
            checkout_price_id: None,
            cancel_at_period_end: false,
            upgrade_url: "/subscribe".to_string(),
            debug: false,
            disabled_notifications: HashSet::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_disabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = parse_u16(env::var("PORT").ok(), 9001);

        let trust_proxy = parse_bool(env::var("TRUST_PROXY").ok(), true);
        let production = env::var("APP_ENV")
            .ok()
            .map(|value| value.trim().eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let site_url = env::var("SITE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        let defaults = SaasSettings::default();
        let saas = SaasSettings {
            trial_days: parse_i64_capped(
                env::var("SAAS_TRIAL_DAYS").ok(),
                defaults.trial_days,
                MAX_TRIAL_DAYS,
            ),
            enable_trial: parse_bool(env::var("SAAS_ENABLE_TRIAL").ok(), defaults.enable_trial),
            is_staff_subscribed: parse_bool(
                env::var("SAAS_IS_STAFF_SUBSCRIBED").ok(),
                defaults.is_staff_subscribed,
            ),
            use_checkout: parse_bool(env::var("SAAS_USE_CHECKOUT").ok(), defaults.use_checkout),
            checkout_price_id: non_empty(env::var("SAAS_CHECKOUT_PRICE_ID").ok()),
            cancel_at_period_end: parse_bool(
                env::var("SAAS_CANCEL_SUBSCRIPTION_AT_PERIOD_END").ok(),
                defaults.cancel_at_period_end,
            ),
            upgrade_url: non_empty(env::var("SAAS_UPGRADE_URL").ok())
                .unwrap_or(defaults.upgrade_url),
            debug: parse_bool(env::var("SAAS_DEBUG").ok(), defaults.debug),
            disabled_notifications: parse_notification_list(
                env::var("SAAS_DISABLED_NOTIFICATIONS").ok(),
            ),
        };

        let smtp = non_empty(env::var("SMTP_HOST").ok()).map(|host| SmtpSettings {
            host,
            port: parse_u16(env::var("SMTP_PORT").ok(), 587),
            username: non_empty(env::var("SMTP_USERNAME").ok()),
            password: non_empty(env::var("SMTP_PASSWORD").ok()),
            tls_disabled: parse_bool(env::var("SMTP_TLS_DISABLED").ok(), false),
        });

        Ok(Self {
            port,
            trust_proxy,
            production,
            tls_key_path: env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
            tls_cert_path: env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            site_url,
            stripe_api_base: non_empty(env::var("STRIPE_API_BASE").ok())
                .unwrap_or_else(|| "https://api.stripe.com/v1".to_string()),
            stripe_secret_key: non_empty(env::var("STRIPE_SECRET_KEY").ok()),
            stripe_publishable_key: non_empty(env::var("STRIPE_PUBLISHABLE_KEY").ok()),
            stripe_webhook_secret: non_empty(env::var("STRIPE_WEBHOOK_SECRET").ok()),
            session_secret: non_empty(env::var("SESSION_SECRET").ok()),
            session_ttl_hours: parse_i64_capped(
                env::var("SESSION_TTL_HOURS").ok(),
                24 * 7,
                MAX_TOKEN_TTL_HOURS,
            ),
            activation_token_ttl_hours: parse_i64_capped(
                env::var("ACTIVATION_TOKEN_TTL_HOURS").ok(),
                24 * 3,
                MAX_TOKEN_TTL_HOURS,
            ),
            saas,
            smtp,
            from_email: non_empty(env::var("SAAS_FROM_EMAIL").ok())
                .unwrap_or_else(|| "no-reply@localhost".to_string()),
            store_path: non_empty(env::var("STORE_PATH").ok()).map(PathBuf::from),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_i64(value: Option<String>, fallback: i64) -> i64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v >= 0)
        .unwrap_or(fallback)
}

fn parse_i64_capped(value: Option<String>, fallback: i64, max: i64) -> i64 {
    parse_i64(value, fallback).min(max)
}

fn parse_bool(value: Option<String>, fallback: bool) -> bool {
    match value.map(|v| v.trim().to_lowercase()) {
        Some(normalized) => match normalized.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => fallback,
        },
        None => fallback,
    }
}

fn parse_notification_list(value: Option<String>) -> HashSet<NotificationKind> {
    value
        .unwrap_or_default()
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let kind = NotificationKind::parse(entry);
            if kind.is_none() {
                tracing::warn!(kind = %entry, "ignoring unknown notification kind");
            }
            kind
        })
        .collect()
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self {
            port: 9001,
            trust_proxy: false,
            production: false,
            tls_key_path: None,
            tls_cert_path: None,
            site_url: "https://app.example.com".to_string(),
            stripe_api_base: "https://api.stripe.com/v1".to_string(),
            stripe_secret_key: None,
            stripe_publishable_key: Some("pk_test_123".to_string()),
            stripe_webhook_secret: Some("whsec_test_secret".to_string()),
            session_secret: Some("0123456789abcdef0123456789abcdef".to_string()),
            session_ttl_hours: 24,
            activation_token_ttl_hours: 72,
            saas: SaasSettings::default(),
            smtp: None,
            from_email: "billing@example.com".to_string(),
            store_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans_accept_common_spellings() {
        assert!(parse_bool(Some("YES".into()), false));
        assert!(parse_bool(Some(" on ".into()), false));
        assert!(!parse_bool(Some("0".into()), true));
        assert!(!parse_bool(Some("Off".into()), true));
        assert!(parse_bool(Some("maybe".into()), true));
        assert!(!parse_bool(None, false));
    }

    #[test]
    fn numbers_fall_back_when_invalid() {
        assert_eq!(parse_u16(Some("0".into()), 9001), 9001);
        assert_eq!(parse_u16(Some("8080".into()), 9001), 8080);
        assert_eq!(parse_i64(Some("-3".into()), 30), 30);
        assert_eq!(parse_i64(Some("14".into()), 30), 14);
        assert_eq!(parse_i64(Some("fourteen".into()), 30), 30);
    }

    #[test]
    fn oversized_numbers_are_capped() {
        assert_eq!(
            parse_i64_capped(Some("200000000000000".into()), 30, MAX_TRIAL_DAYS),
            MAX_TRIAL_DAYS
        );
        assert_eq!(parse_i64_capped(Some("14".into()), 30, MAX_TRIAL_DAYS), 14);
    }

    #[test]
    fn notification_list_skips_unknown_entries() {
        let kinds = parse_notification_list(Some(
            "payment_failed, trial_will_end,bogus,,".to_string(),
        ));
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&NotificationKind::PaymentFailed));
        assert!(kinds.contains(&NotificationKind::TrialWillEnd));
    }
}
