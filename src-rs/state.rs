use std::{sync::Arc, time::Duration};

use crate::{
    auth::AuthService, config::Config, mailer::Mailer, notifications::Notifier,
    rate_limit::InMemoryRateLimiter, store::BillingStore, stripe_api::StripeApi,
    subscription::EntitlementPolicy, webhook::WebhookProcessor,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn BillingStore>,
    pub auth: AuthService,
    pub stripe: StripeApi,
    pub notifier: Notifier,
    pub webhooks: WebhookProcessor,
    pub policy: EntitlementPolicy,
    pub auth_limiter: Arc<InMemoryRateLimiter>,
    pub api_limiter: Arc<InMemoryRateLimiter>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn BillingStore>,
        auth: AuthService,
        stripe: StripeApi,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let notifier = Notifier::new(
            mailer,
            config.site_url.clone(),
            config.saas.disabled_notifications.clone(),
        );
        Self {
            policy: EntitlementPolicy::from_settings(&config.saas),
            webhooks: WebhookProcessor::new(store.clone(), notifier.clone()),
            auth_limiter: Arc::new(InMemoryRateLimiter::new(Duration::from_secs(15 * 60), 10)),
            api_limiter: Arc::new(InMemoryRateLimiter::new(Duration::from_secs(15 * 60), 300)),
            config: Arc::new(config),
            store,
            auth,
            stripe,
            notifier,
        }
    }
}
