use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::{
    config::SaasSettings,
    models::{StripeInfo, User},
};

const SECONDS_PER_DAY: i64 = 24 * 3600;

/// Upper bound on the configured trial; keeps trial arithmetic inside `Duration`'s range.
pub const MAX_TRIAL_DAYS: i64 = 36_500;

#[derive(Clone, Copy, Debug)]
pub struct EntitlementPolicy {
    pub trial_days: i64,
    pub enable_trial: bool,
    pub is_staff_subscribed: bool,
}

impl EntitlementPolicy {
    pub fn from_settings(settings: &SaasSettings) -> Self {
        Self {
            trial_days: settings.trial_days,
            enable_trial: settings.enable_trial,
            is_staff_subscribed: settings.is_staff_subscribed,
        }
    }
}

impl Default for EntitlementPolicy {
    fn default() -> Self {
        Self::from_settings(&SaasSettings::default())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    None,
    Trialing,
    Active,
    Lapsed,
}

impl SubscriptionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionState::None => "none",
            SubscriptionState::Trialing => "trialing",
            SubscriptionState::Active => "active",
            SubscriptionState::Lapsed => "lapsed",
        }
    }
}

/// Entitlement view of a user and their cached billing record at a fixed instant.
#[derive(Clone, Debug)]
pub struct Customer<'a> {
    user: &'a User,
    info: Option<&'a StripeInfo>,
    policy: EntitlementPolicy,
    date_joined: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
}

impl<'a> Customer<'a> {
    pub fn of(
        user: &'a User,
        info: Option<&'a StripeInfo>,
        policy: EntitlementPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user,
            info,
            policy,
            date_joined: None,
            now,
        }
    }

    pub fn with_date_joined(mut self, date_joined: DateTime<Utc>) -> Self {
        self.date_joined = Some(date_joined);
        self
    }

    pub fn date_joined(&self) -> DateTime<Utc> {
        self.date_joined.unwrap_or(self.user.date_joined)
    }

    pub fn actively_subscribed(&self) -> bool {
        if self.policy.is_staff_subscribed && self.user.is_staff {
            return true;
        }
        match self.info.and_then(|info| info.subscription_end) {
            Some(end) => self.now <= end,
            None => false,
        }
    }

    pub fn previously_subscribed(&self) -> bool {
        self.info.map_or(false, |info| info.previously_subscribed)
    }

    pub fn trial_duration(&self) -> Duration {
        let days = self.policy.trial_days.clamp(0, MAX_TRIAL_DAYS);
        Duration::seconds((1 + days) * SECONDS_PER_DAY)
    }

    pub fn trialing(&self) -> bool {
        if self.actively_subscribed() || self.previously_subscribed() {
            return false;
        }
        if !self.policy.enable_trial {
            return false;
        }
        self.now - self.date_joined() < self.trial_duration()
    }

    /// Entitlement: trialing or paying.
    pub fn subscribed(&self) -> bool {
        self.trialing() || self.actively_subscribed()
    }

    pub fn trial_left_in_seconds(&self) -> i64 {
        (self.trial_duration() - (self.now - self.date_joined())).num_seconds()
    }

    pub fn trial_left_in_days(&self) -> i64 {
        self.trial_left_in_seconds().div_euclid(SECONDS_PER_DAY)
    }

    pub fn state(&self) -> SubscriptionState {
        if self.actively_subscribed() {
            SubscriptionState::Active
        } else if self.trialing() {
            SubscriptionState::Trialing
        } else if self.previously_subscribed() {
            SubscriptionState::Lapsed
        } else {
            SubscriptionState::None
        }
    }

    pub fn summary(&self) -> CustomerSummary {
        CustomerSummary {
            user_id: self.user.id.to_string(),
            email: self.user.email.clone(),
            state: self.state(),
            subscribed: self.subscribed(),
            actively_subscribed: self.actively_subscribed(),
            trialing: self.trialing(),
            previously_subscribed: self.previously_subscribed(),
            trial_left_in_days: self.trialing().then(|| self.trial_left_in_days()),
            plan_id: self.info.and_then(|info| info.plan_id.clone()),
            subscription_end: self.info.and_then(|info| info.subscription_end),
        }
    }
}

impl fmt::Display for Customer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part1 = if self.actively_subscribed() { "Subscribed" } else { "" };
        let part2 = if self.trialing() { "Trialing" } else { "" };
        write!(
            f,
            "<Customer: {} {} {}{}>",
            self.user.id, self.user.email, part1, part2
        )
    }
}

/// Feature gate. Without `include_trial` only a paid subscription passes.
pub fn is_entitled(customer: &Customer<'_>, include_trial: bool) -> bool {
    if include_trial {
        customer.subscribed()
    } else {
        customer.actively_subscribed()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSummary {
    pub user_id: String,
    pub email: String,
    pub state: SubscriptionState,
    pub subscribed: bool,
    pub actively_subscribed: bool,
    pub trialing: bool,
    pub previously_subscribed: bool,
    pub trial_left_in_days: Option<i64>,
    pub plan_id: Option<String>,
    pub subscription_end: Option<DateTime<Utc>>,
}
