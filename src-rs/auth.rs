use anyhow::{anyhow, Context};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordVerifier, SaltString};
use argon2::{Argon2, PasswordHasher};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::models::User;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and checks session and activation tokens with one shared secret.
#[derive(Clone)]
pub struct AuthService {
    secret: Vec<u8>,
    session_ttl: Duration,
    activation_ttl: Duration,
}

impl AuthService {
    pub fn new(secret: &[u8], session_ttl: Duration, activation_ttl: Duration) -> anyhow::Result<Self> {
        if secret.len() < 16 {
            return Err(anyhow!("SESSION_SECRET must be at least 16 bytes long"));
        }
        Ok(Self {
            secret: secret.to_vec(),
            session_ttl,
            activation_ttl,
        })
    }

    pub fn issue_session(&self, user: &User) -> anyhow::Result<String> {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: user.id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.session_ttl).timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .context("failed to sign session token")
    }

    pub fn verify_bearer_token(&self, authorization_header: &str) -> anyhow::Result<Uuid> {
        let token = extract_bearer_token(authorization_header)?;
        self.verify_session(token)
    }

    pub fn verify_session(&self, token: &str) -> anyhow::Result<Uuid> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let token_data = decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .context("session token validation failed")?;

        let claims = token_data.claims;
        tracing::debug!(sub = %claims.sub, exp = claims.exp, "verified session token");
        Uuid::parse_str(&claims.sub).context("session subject is not a user id")
    }

    pub fn make_activation_token(&self, user: &User) -> String {
        self.make_activation_token_at(user, Utc::now())
    }

    fn make_activation_token_at(&self, user: &User, at: DateTime<Utc>) -> String {
        let timestamp = at.timestamp();
        format!("{:x}-{}", timestamp, self.activation_digest(user, timestamp))
    }

    /// True while the user is still inactive, the password is unchanged and the TTL holds.
    pub fn check_activation_token(&self, user: &User, token: &str) -> bool {
        self.check_activation_token_at(user, token, Utc::now())
    }

    fn check_activation_token_at(&self, user: &User, token: &str, now: DateTime<Utc>) -> bool {
        let (timestamp_hex, digest) = match token.split_once('-') {
            Some(parts) => parts,
            None => return false,
        };
        let timestamp = match i64::from_str_radix(timestamp_hex, 16) {
            Ok(value) => value,
            Err(_) => return false,
        };

        let expected = self.activation_digest(user, timestamp);
        if !bool::from(expected.as_bytes().ct_eq(digest.as_bytes())) {
            return false;
        }

        let age = now.timestamp() - timestamp;
        age >= 0 && age <= self.activation_ttl.num_seconds()
    }

    fn activation_digest(&self, user: &User, timestamp: i64) -> String {
        let mut mac = match Hmac::<Sha256>::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(b"activation:");
        mac.update(user.id.as_bytes());
        mac.update(user.password_hash.as_bytes());
        mac.update(if user.is_active { b"1" } else { b"0" });
        mac.update(timestamp.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|error| anyhow!("failed to hash password: {}", error))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

pub fn encode_uid(user_id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(user_id.to_string())
}

pub fn decode_uid(uidb64: &str) -> Option<Uuid> {
    let bytes = URL_SAFE_NO_PAD.decode(uidb64.trim().as_bytes()).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    Uuid::parse_str(&text).ok()
}

pub fn extract_bearer_token(value: &str) -> anyhow::Result<&str> {
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default();

    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(anyhow!("Invalid Authorization header format"));
    }

    Ok(token.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new(
            b"0123456789abcdef0123456789abcdef",
            Duration::hours(1),
            Duration::hours(72),
        )
        .unwrap()
    }

    fn user() -> User {
        User::new("ada@example.com", "argon-hash".to_string())
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(AuthService::new(b"short", Duration::hours(1), Duration::hours(1)).is_err());
    }

    #[test]
    fn session_round_trip() {
        let auth = service();
        let user = user();
        let token = auth.issue_session(&user).unwrap();

        let header = format!("Bearer {}", token);
        assert_eq!(auth.verify_bearer_token(&header).unwrap(), user.id);
        assert!(auth.verify_bearer_token(&token).is_err());
        assert!(auth.verify_session("not-a-jwt").is_err());
    }

    #[test]
    fn session_signed_with_other_secret_is_rejected() {
        let other = AuthService::new(
            b"ffffffffffffffffffffffffffffffff",
            Duration::hours(1),
            Duration::hours(1),
        )
        .unwrap();
        let token = other.issue_session(&user()).unwrap();
        assert!(service().verify_session(&token).is_err());
    }

    #[test]
    fn activation_token_is_single_use() {
        let auth = service();
        let mut user = user();
        let token = auth.make_activation_token(&user);
        assert!(auth.check_activation_token(&user, &token));

        user.is_active = true;
        assert!(!auth.check_activation_token(&user, &token));
    }

    #[test]
    fn activation_token_expires() {
        let auth = service();
        let user = user();
        let issued = Utc::now() - Duration::hours(73);
        let token = auth.make_activation_token_at(&user, issued);
        assert!(!auth.check_activation_token(&user, &token));
        assert!(auth.check_activation_token_at(&user, &token, issued + Duration::hours(72)));
    }

    #[test]
    fn malformed_activation_tokens_fail() {
        let auth = service();
        let user = user();
        assert!(!auth.check_activation_token(&user, "garbage"));
        assert!(!auth.check_activation_token(&user, "zz-abc"));
        let token = auth.make_activation_token(&user);
        let tampered = format!("{}0", token);
        assert!(!auth.check_activation_token(&user, &tampered));
    }

    #[test]
    fn passwords_verify_against_their_hash() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("battery staple", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }

    #[test]
    fn uid_encoding_round_trips() {
        let id = Uuid::new_v4();
        assert_eq!(decode_uid(&encode_uid(id)), Some(id));
        assert_eq!(decode_uid("!!!"), None);
    }

    #[test]
    fn bearer_header_must_use_bearer_scheme() {
        assert_eq!(extract_bearer_token("Bearer abc").unwrap(), "abc");
        assert_eq!(extract_bearer_token("bearer  abc ").unwrap(), "abc");
        assert!(extract_bearer_token("Basic abc").is_err());
        assert!(extract_bearer_token("Bearer ").is_err());
    }
}
