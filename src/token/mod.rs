//! Bearer token issuing and validation.
//!
//! Tokens are RS512-signed JWTs carrying the subject (email), a sortable
//! unique id (`jti`), an expiry and a credit grant (`crd`). Validation only
//! accepts RSA-family signatures, so a token crafted with an HMAC algorithm
//! against the public key is rejected outright.

use std::path::Path;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderMap, StatusCode};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::TokenError;

const ISSUER: &str = "au/webstrates";
const APP: &str = "golem-herder";

/// Token lifetime, matching the herder's long-lived grants.
const LIFETIME_HOURS: i64 = 24100;

/// Claims carried by a herder token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (the owner's email).
    pub sub: String,
    /// Unique token id.
    pub jti: String,
    /// Expiry, unix seconds.
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub app: String,
    /// Credit grant.
    #[serde(default)]
    pub crd: i64,
}

/// Signs and validates tokens with an RSA key pair.
pub struct TokenManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenManager {
    /// Load keys from PEM files; fails fast when either is unreadable or
    /// malformed.
    pub fn new(pubkey: &Path, privkey: &Path) -> Result<Self, TokenError> {
        let pub_pem = std::fs::read(pubkey).map_err(|e| TokenError::Key {
            path: pubkey.display().to_string(),
            reason: e.to_string(),
        })?;
        let priv_pem = std::fs::read(privkey).map_err(|e| TokenError::Key {
            path: privkey.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_pems(&pub_pem, &priv_pem)
    }

    /// Build a manager from in-memory PEM data.
    pub fn from_pems(pub_pem: &[u8], priv_pem: &[u8]) -> Result<Self, TokenError> {
        let decoding = DecodingKey::from_rsa_pem(pub_pem).map_err(|e| TokenError::Key {
            path: "public key".to_string(),
            reason: e.to_string(),
        })?;
        let encoding = EncodingKey::from_rsa_pem(priv_pem).map_err(|e| TokenError::Key {
            path: "private key".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { encoding, decoding })
    }

    /// Create a signed token for the subject. Core claims (expiry, issuer,
    /// issued-at, subject, token id, app) override anything in `extra`.
    pub fn generate(
        &self,
        subject: &str,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, TokenError> {
        let now = chrono::Utc::now();
        let mut claims = extra;
        claims.insert(
            "exp".to_string(),
            json!((now + chrono::Duration::hours(LIFETIME_HOURS)).timestamp()),
        );
        claims.insert("iss".to_string(), json!(ISSUER));
        claims.insert("iat".to_string(), json!(now.timestamp()));
        claims.insert("sub".to_string(), json!(subject));
        claims.insert("jti".to_string(), json!(Uuid::now_v7().to_string()));
        claims.insert("app".to_string(), json!(APP));

        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS512),
            &claims,
            &self.encoding,
        )?)
    }

    /// Validate a token string and return its claims. Only RSA-family
    /// algorithms are accepted.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::RS512);
        validation.algorithms = vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

/// Pull a bearer token out of the `Authorization` header
/// (case-insensitive `bearer ` prefix).
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    if value.len() > 7 && value[..7].eq_ignore_ascii_case("bearer ") {
        Some(value[7..].to_string())
    } else {
        None
    }
}

/// Pull a token out of a raw query string (`token=` parameter).
pub fn token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
}

/// Find the bearer token for a request; the header wins over the query
/// parameter.
pub fn find_bearer(parts: &Parts) -> Option<String> {
    bearer_from_headers(&parts.headers)
        .or_else(|| parts.uri.query().and_then(token_from_query))
}

/// Extractor for endpoints requiring a valid token. Rejects with 401 before
/// the handler runs.
pub struct Authenticated {
    pub claims: Claims,
    /// The raw token string, kept for container labelling.
    pub raw: String,
}

impl FromRequestParts<std::sync::Arc<crate::server::HerderState>> for Authenticated {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &std::sync::Arc<crate::server::HerderState>,
    ) -> Result<Self, Self::Rejection> {
        let raw = find_bearer(parts)
            .ok_or((StatusCode::UNAUTHORIZED, "No token supplied".to_string()))?;
        let claims = state.tokens.validate(&raw).map_err(|e| {
            tracing::warn!(error = %e, "Unauthorized");
            (StatusCode::UNAUTHORIZED, e.to_string())
        })?;
        Ok(Self { claims, raw })
    }
}

/// JSON reply for token generation and inspection.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenReply {
    pub token: String,
    pub email: String,
    pub credits: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUB_PEM: &[u8] = include_bytes!("../../tests/fixtures/cert.pem");
    const PRIV_PEM: &[u8] = include_bytes!("../../tests/fixtures/key.pem");

    fn manager() -> TokenManager {
        TokenManager::from_pems(PUB_PEM, PRIV_PEM).unwrap()
    }

    #[test]
    fn test_generate_validate_round_trip() {
        let m = manager();
        let mut extra = serde_json::Map::new();
        extra.insert("crd".to_string(), json!(30000));
        let token = m.generate("a@example.org", extra).unwrap();

        let claims = m.validate(&token).unwrap();
        assert_eq!(claims.sub, "a@example.org");
        assert_eq!(claims.crd, 30000);
        assert_eq!(claims.iss, "au/webstrates");
        assert_eq!(claims.app, "golem-herder");
        assert!(!claims.jti.is_empty());
        assert!(claims.exp > chrono::Utc::now().timestamp() as u64);
    }

    #[test]
    fn test_core_claims_override_extras() {
        let m = manager();
        let mut extra = serde_json::Map::new();
        extra.insert("sub".to_string(), json!("forged@example.org"));
        extra.insert("iss".to_string(), json!("someone-else"));
        let token = m.generate("real@example.org", extra).unwrap();

        let claims = m.validate(&token).unwrap();
        assert_eq!(claims.sub, "real@example.org");
        assert_eq!(claims.iss, "au/webstrates");
    }

    #[test]
    fn test_jtis_are_unique_and_sortable() {
        let m = manager();
        let a = m.validate(&m.generate("x", Default::default()).unwrap()).unwrap();
        // Land in a later millisecond so the time-ordered ids must sort.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = m.validate(&m.generate("x", Default::default()).unwrap()).unwrap();
        assert_ne!(a.jti, b.jti);
        assert!(a.jti < b.jti);
    }

    #[test]
    fn test_hmac_token_rejected() {
        let m = manager();
        // A token signed with HS256 using the *public* key as the HMAC
        // secret must not validate (algorithm confusion).
        let claims = Claims {
            sub: "a@example.org".to_string(),
            jti: "x".to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as u64,
            iat: 0,
            iss: ISSUER.to_string(),
            app: APP.to_string(),
            crd: 1000,
        };
        let forged = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(PUB_PEM),
        )
        .unwrap();
        m.validate(&forged).unwrap_err();
    }

    #[test]
    fn test_expired_token_rejected() {
        let m = manager();
        let claims = Claims {
            sub: "a@example.org".to_string(),
            jti: "x".to_string(),
            exp: 1000, // long past
            iat: 0,
            iss: ISSUER.to_string(),
            app: APP.to_string(),
            crd: 0,
        };
        let stale =
            jsonwebtoken::encode(&Header::new(Algorithm::RS512), &claims, &m.encoding).unwrap();
        m.validate(&stale).unwrap_err();
    }

    #[test]
    fn test_garbage_token_rejected() {
        manager().validate("not-a-token").unwrap_err();
    }

    #[test]
    fn test_bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_from_headers(&headers).unwrap(), "abc.def.ghi");

        headers.insert(header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_from_headers(&headers).unwrap(), "abc.def.ghi");

        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert!(bearer_from_headers(&headers).is_none());
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query("token=abc").unwrap(), "abc");
        assert_eq!(token_from_query("type=worker&token=abc").unwrap(), "abc");
        assert!(token_from_query("type=worker").is_none());
    }
}
