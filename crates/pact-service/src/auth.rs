//! Session tokens: `pv1.<hex claims>.<hex mac>` with a blake3 keyed MAC.
//!
//! The mechanics stay inside this module so the rest of the service only
//! sees `mint` and `verify`; swapping the token scheme would not touch the
//! handlers. Verification order is fixed: format, MAC, expiry; the
//! revocation registry check happens in `authenticate`, after the
//! cryptographic checks, so a revoked subject cannot probe MAC validity.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use pact_core::{CoreError, Store, User};

const TOKEN_PREFIX: &str = "pv1";
const MAC_CONTEXT: &str = "pact session mac v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Provider user key; the revocation registry subject.
    pub sub: String,
    /// Local user id.
    pub uid: i64,
    pub iat: i64,
    pub exp: i64,
}

/// MAC key derived once from the configured session secret.
#[derive(Clone)]
pub struct SessionKeys {
    mac_key: [u8; 32],
    ttl: Duration,
}

impl SessionKeys {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            mac_key: blake3::derive_key(MAC_CONTEXT, secret.as_bytes()),
            ttl,
        }
    }

    pub fn mint(&self, user: &User) -> Result<String, CoreError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.provider_user_key.clone(),
            uid: user.id,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        let payload = serde_json::to_vec(&claims)?;
        let mac = blake3::keyed_hash(&self.mac_key, &payload);
        Ok(format!(
            "{TOKEN_PREFIX}.{}.{}",
            hex_encode(&payload),
            mac.to_hex()
        ))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, CoreError> {
        let unauthorized = || CoreError::Unauthorized("invalid session token".to_string());

        let mut parts = token.split('.');
        let (prefix, payload_hex, mac_hex) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(prefix), Some(payload), Some(mac), None) => (prefix, payload, mac),
            _ => return Err(unauthorized()),
        };
        if prefix != TOKEN_PREFIX {
            return Err(unauthorized());
        }

        let payload = hex_decode(payload_hex).ok_or_else(unauthorized)?;
        let presented = hex_decode(mac_hex).ok_or_else(unauthorized)?;
        let expected = blake3::keyed_hash(&self.mac_key, &payload);
        if !constant_time_eq(&presented, expected.as_bytes()) {
            return Err(unauthorized());
        }

        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| unauthorized())?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(CoreError::Unauthorized("session expired".to_string()));
        }
        Ok(claims)
    }
}

/// Resolve the bearer token from the request, verify it, and reject revoked
/// subjects.
pub async fn authenticate(
    keys: &SessionKeys,
    store: &Arc<dyn Store>,
    headers: &HeaderMap,
) -> Result<User, CoreError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| CoreError::Unauthorized("missing bearer token".to_string()))?;

    let claims = keys.verify(token)?;
    if store.is_session_revoked(&claims.sub).await? {
        return Err(CoreError::Unauthorized("session revoked".to_string()));
    }
    store
        .find_user(&claims.sub)
        .await?
        .ok_or_else(|| CoreError::Unauthorized("unknown session subject".to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_decode(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(input.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use pact_core::MemoryStore;

    fn user(key: &str) -> User {
        User {
            id: 7,
            provider_user_key: key.to_string(),
            status: "active".to_string(),
            created_at: Utc::now(),
        }
    }

    fn keys() -> SessionKeys {
        SessionKeys::new("test-secret", Duration::hours(24))
    }

    #[test]
    fn mint_verify_roundtrip() {
        let keys = keys();
        let token = keys.mint(&user("provider:7")).unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.sub, "provider:7");
        assert_eq!(claims.uid, 7);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let keys = keys();
        let token = keys.mint(&user("provider:7")).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_payload = hex_encode(
            serde_json::to_vec(&Claims {
                sub: "provider:8".to_string(),
                uid: 8,
                iat: Utc::now().timestamp(),
                exp: Utc::now().timestamp() + 3600,
            })
            .unwrap()
            .as_slice(),
        );
        parts[1] = &forged_payload;
        let forged = parts.join(".");
        assert!(keys.verify(&forged).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = keys().mint(&user("provider:7")).unwrap();
        let other = SessionKeys::new("another-secret", Duration::hours(24));
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let keys = SessionKeys::new("test-secret", Duration::seconds(-10));
        let token = keys.mint(&user("provider:7")).unwrap();
        let err = keys.verify(&token).unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let keys = keys();
        for token in ["", "pv1", "pv1.zz.zz", "pv2.00.00", "pv1.00.00.00"] {
            assert!(keys.verify(token).is_err(), "accepted {token:?}");
        }
    }

    #[tokio::test]
    async fn revoked_subject_fails_authentication() {
        let keys = keys();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let user = store.upsert_user("provider:7").await.unwrap();
        let token = keys.mint(&user).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        assert!(authenticate(&keys, &store, &headers).await.is_ok());

        store
            .revoke_session("provider:7", "unlinked")
            .await
            .unwrap();
        let err = authenticate(&keys, &store, &headers).await.unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    #[test]
    fn hex_roundtrip() {
        let bytes = [0u8, 1, 127, 128, 255];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("0").is_none());
        assert!(hex_decode("zz").is_none());
    }

    #[test]
    fn iat_is_a_sane_timestamp() {
        let keys = keys();
        let token = keys.mint(&user("provider:7")).unwrap();
        let claims = keys.verify(&token).unwrap();
        assert!(DateTime::from_timestamp(claims.iat, 0).is_some());
        assert!(claims.exp > claims.iat);
    }
}
