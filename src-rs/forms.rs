use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::BillingStore;

pub const MIN_PASSWORD_LENGTH: usize = 8;

static EMAIL_RE: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex")
});

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password1: String,
    #[serde(default)]
    pub password2: String,
}

/// Per-field validation messages, serialized as `{ "field": ["message", ...] }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<&'static str, Vec<String>>);

impl FieldErrors {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.entry(field).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }
}

impl RegistrationForm {
    fn check_fields(&self) -> FieldErrors {
        let mut errors = FieldErrors::default();
        let email = self.email.trim();

        if email.is_empty() {
            errors.add("email", "This field is required.");
        } else if !EMAIL_RE.is_match(email) {
            errors.add("email", "Enter a valid email address.");
        }

        if self.password1.chars().count() < MIN_PASSWORD_LENGTH {
            errors.add(
                "password1",
                format!(
                    "This password is too short. It must contain at least {} characters.",
                    MIN_PASSWORD_LENGTH
                ),
            );
        }
        if self.password1 != self.password2 {
            errors.add("password2", "The two password fields didn't match.");
        }

        errors
    }

    /// Returns the normalized email on success.
    pub async fn validate(&self, store: &dyn BillingStore) -> anyhow::Result<Result<String, FieldErrors>> {
        let mut errors = self.check_fields();
        let email = self.email.trim().to_string();

        if errors.get("email").is_none() && store.find_user_by_email(&email).await?.is_some() {
            errors.add("email", "A user with that email already exists.");
        }

        if errors.is_empty() {
            Ok(Ok(email))
        } else {
            Ok(Err(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::User, store::MemoryStore};

    fn form(email: &str, password1: &str, password2: &str) -> RegistrationForm {
        RegistrationForm {
            email: email.to_string(),
            password1: password1.to_string(),
            password2: password2.to_string(),
        }
    }

    #[tokio::test]
    async fn accepts_a_valid_form() {
        let store = MemoryStore::new();
        let result = form(" ada@example.com ", "long enough", "long enough")
            .validate(&store)
            .await
            .unwrap();
        assert_eq!(result, Ok("ada@example.com".to_string()));
    }

    #[tokio::test]
    async fn reports_every_failing_field() {
        let store = MemoryStore::new();
        let errors = form("not-an-email", "short", "other")
            .validate(&store)
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(errors.get("email").unwrap(), ["Enter a valid email address."]);
        assert_eq!(errors.get("password1").unwrap().len(), 1);
        assert_eq!(
            errors.get("password2").unwrap(),
            ["The two password fields didn't match."]
        );
    }

    #[tokio::test]
    async fn rejects_taken_email() {
        let store = MemoryStore::new();
        store
            .insert_user(User::new("ada@example.com", "hash".to_string()))
            .await
            .unwrap();

        let errors = form("ADA@example.com", "long enough", "long enough")
            .validate(&store)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(
            errors.get("email").unwrap(),
            ["A user with that email already exists."]
        );
    }

    #[tokio::test]
    async fn missing_email_is_required() {
        let store = MemoryStore::new();
        let errors = form("", "long enough", "long enough")
            .validate(&store)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(errors.get("email").unwrap(), ["This field is required."]);
        assert!(errors.get("password1").is_none());
    }

    #[test]
    fn errors_serialize_by_field() {
        let mut errors = FieldErrors::default();
        errors.add("email", "bad");
        assert_eq!(
            serde_json::to_value(&errors).unwrap(),
            serde_json::json!({ "email": ["bad"] })
        );
    }
}
