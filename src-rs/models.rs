use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::format::from_unix;

fn short(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub is_staff: bool,
    pub date_joined: DateTime<Utc>,
}

impl User {
    pub fn new(email: &str, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.trim().to_string(),
            password_hash,
            is_active: false,
            is_staff: false,
            date_joined: Utc::now(),
        }
    }
}

/// Locally cached billing state of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StripeInfo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub subscription_end: Option<DateTime<Utc>>,
    pub plan_id: Option<String>,
    pub previously_subscribed: bool,
    /// `created` of the newest webhook event applied to this record.
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl StripeInfo {
    pub fn new(user_id: Uuid, customer_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            customer_id: customer_id.into(),
            subscription_id: None,
            subscription_end: None,
            plan_id: None,
            previously_subscribed: false,
            last_event_at: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn short_id(&self) -> String {
        short(&self.id)
    }

    pub fn set_subscription(
        &mut self,
        subscription_id: String,
        subscription_end: Option<DateTime<Utc>>,
        plan_id: Option<String>,
    ) {
        self.subscription_id = Some(subscription_id);
        self.subscription_end = subscription_end;
        self.plan_id = plan_id;
    }

    pub fn clear_subscription(&mut self) {
        self.subscription_id = None;
        self.subscription_end = None;
        self.plan_id = None;
    }

    /// Whether an event created at `event_at` may overwrite this record.
    pub fn accepts_event_at(&self, event_at: Option<DateTime<Utc>>) -> bool {
        match (self.last_event_at, event_at) {
            (Some(last), Some(event_at)) => event_at >= last,
            _ => true,
        }
    }

    pub fn mark_event_applied(&mut self, event_at: Option<DateTime<Utc>>) {
        if let Some(event_at) = event_at {
            if self.last_event_at.map_or(true, |last| event_at > last) {
                self.last_event_at = Some(event_at);
            }
        }
    }
}

/// An invoice outcome reported by the processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub success: bool,
    pub stripe_object: Value,
    pub created_at: DateTime<Utc>,
}

impl BillingEvent {
    pub fn new(user_id: Uuid, success: bool, stripe_object: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            success,
            stripe_object,
            created_at: Utc::now(),
        }
    }

    pub fn short_id(&self) -> String {
        short(&self.id)
    }

    pub fn invoice(&self) -> Option<&str> {
        self.stripe_object.get("id").and_then(Value::as_str)
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.stripe_object
            .get("created")
            .and_then(Value::as_i64)
            .and_then(from_unix)
    }

    fn first_line(&self) -> Option<&Value> {
        self.stripe_object
            .get("lines")
            .and_then(|lines| lines.get("data"))
            .and_then(Value::as_array)
            .and_then(|data| data.first())
    }

    pub fn description(&self) -> Option<&str> {
        self.first_line()
            .and_then(|line| line.get("description"))
            .and_then(Value::as_str)
    }

    pub fn currency(&self) -> Option<&str> {
        self.first_line()
            .and_then(|line| line.get("currency"))
            .and_then(Value::as_str)
            .or_else(|| self.stripe_object.get("currency").and_then(Value::as_str))
    }

    pub fn amount_due(&self) -> Option<i64> {
        self.stripe_object.get("amount_due").and_then(Value::as_i64)
    }

    pub fn amount_paid(&self) -> Option<i64> {
        self.stripe_object.get("amount_paid").and_then(Value::as_i64)
    }
}

/// One received webhook event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StripeEventRecord {
    pub id: Uuid,
    pub event: String,
    pub object: Value,
    pub event_id: Option<String>,
    pub object_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StripeEventRecord {
    pub fn new(event: &str, object: Value, event_id: Option<String>) -> Self {
        let object_id = object.get("id").and_then(Value::as_str).map(str::to_string);
        Self {
            id: Uuid::new_v4(),
            event: event.to_string(),
            object,
            event_id,
            object_id,
            created_at: Utc::now(),
        }
    }

    pub fn short_id(&self) -> String {
        short(&self.id)
    }
}

/// Where a user came from when they signed up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    pub id: Uuid,
    pub user_id: Uuid,
    pub agent: Option<String>,
    pub referer: Option<String>,
    pub campaign: Option<String>,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    #[test]
    fn billing_event_reads_invoice_fields() {
        let billing = BillingEvent::new(
            Uuid::new_v4(),
            true,
            json!({
                "id": "in_123",
                "created": 1_600_000_000,
                "amount_due": 1250,
                "amount_paid": 1250,
                "lines": { "data": [{ "description": "1 x Pro (at $12.50 / month)", "currency": "usd" }] }
            }),
        );

        assert_eq!(billing.invoice(), Some("in_123"));
        assert_eq!(
            billing.date(),
            Some(Utc.timestamp_opt(1_600_000_000, 0).unwrap())
        );
        assert_eq!(billing.description(), Some("1 x Pro (at $12.50 / month)"));
        assert_eq!(billing.currency(), Some("usd"));
        assert_eq!(billing.amount_due(), Some(1250));
        assert_eq!(billing.amount_paid(), Some(1250));
        assert_eq!(billing.short_id().len(), 8);
    }

    #[test]
    fn billing_event_tolerates_missing_lines() {
        let billing = BillingEvent::new(Uuid::new_v4(), false, json!({ "id": "in_1" }));
        assert_eq!(billing.description(), None);
        assert_eq!(billing.currency(), None);
        assert_eq!(billing.amount_due(), None);
    }

    #[test]
    fn stale_events_are_rejected() {
        let mut info = StripeInfo::new(Uuid::new_v4(), "cus_1");
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        assert!(info.accepts_event_at(Some(t0)));
        info.mark_event_applied(Some(t0));

        assert!(info.accepts_event_at(Some(t0)));
        assert!(info.accepts_event_at(Some(t0 + Duration::seconds(1))));
        assert!(!info.accepts_event_at(Some(t0 - Duration::seconds(1))));
        assert!(info.accepts_event_at(None));

        info.mark_event_applied(Some(t0 - Duration::seconds(10)));
        assert_eq!(info.last_event_at, Some(t0));
    }

    #[test]
    fn event_record_extracts_object_id() {
        let record = StripeEventRecord::new(
            "invoice.paid",
            json!({ "id": "in_9", "object": "invoice" }),
            Some("evt_1".into()),
        );
        assert_eq!(record.object_id.as_deref(), Some("in_9"));
        assert_eq!(record.event_id.as_deref(), Some("evt_1"));
    }
}
