// OIDC id token claim decoding
//
// Signatures are not verified here; only tokens received straight from the
// token endpoint may be decoded.
use crate::error::{AuthError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Claims this client reads from an id token; everything else stays in `all`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct IdTokenClaims {
    #[serde(default)]
    pub iss: Option<String>,
    pub sub: String,
    #[serde(default)]
    pub aud: Option<Audience>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub upn: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(skip)]
    pub all: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, client_id: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == client_id,
            Audience::Many(auds) => auds.iter().any(|a| a == client_id),
        }
    }
}

impl IdTokenClaims {
    /// Decode the payload segment of a compact JWT
    pub fn decode(id_token: &str) -> Result<Self> {
        let mut segments = id_token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_)) => payload,
            _ => {
                return Err(AuthError::InvalidIdToken(
                    "expected three dot-separated segments".to_string(),
                ))
            }
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| AuthError::InvalidIdToken(format!("payload is not base64url: {}", e)))?;
        let all: BTreeMap<String, Value> = serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::InvalidIdToken(format!("payload is not a JSON object: {}", e)))?;
        let mut claims: IdTokenClaims = serde_json::from_value(Value::Object(
            all.clone().into_iter().collect(),
        ))
        .map_err(|e| AuthError::InvalidIdToken(format!("missing required claims: {}", e)))?;
        claims.all = all;
        Ok(claims)
    }

    /// Check nonce, audience and expiry against the request that produced the token
    pub fn validate(&self, expected_nonce: &str, client_id: &str, skew_seconds: i64) -> Result<()> {
        if self.nonce.as_deref() != Some(expected_nonce) {
            return Err(AuthError::NonceMismatch);
        }

        if let Some(aud) = &self.aud {
            if !aud.contains(client_id) {
                return Err(AuthError::InvalidIdToken(format!(
                    "audience does not include client {}",
                    client_id
                )));
            }
        }

        if let Some(exp) = self.exp {
            if exp.saturating_add(skew_seconds) < Utc::now().timestamp() {
                return Err(AuthError::InvalidIdToken("token has expired".to_string()));
            }
        }

        Ok(())
    }

    /// `oid.tid` when the provider issues both, otherwise `sub`
    pub fn home_account_id(&self) -> String {
        match (&self.oid, &self.tid) {
            (Some(oid), Some(tid)) => format!("{}.{}", oid, tid),
            _ => self.sub.clone(),
        }
    }

    pub fn username(&self) -> String {
        self.preferred_username
            .as_ref()
            .or(self.email.as_ref())
            .or(self.upn.as_ref())
            .cloned()
            .unwrap_or_else(|| self.sub.clone())
    }
}

/// Build an unsigned compact JWT, for tests across the crate
#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_reads_claims() {
        let token = encode_unsigned(&json!({
            "iss": "https://login.example.com/tid-1/v2.0",
            "sub": "subject-1",
            "aud": "client-x",
            "nonce": "n-1",
            "oid": "oid-1",
            "tid": "tid-1",
            "preferred_username": "ada@example.com",
            "name": "Ada Lovelace",
            "roles": ["admin"]
        }));

        let claims = IdTokenClaims::decode(&token).unwrap();
        assert_eq!(claims.home_account_id(), "oid-1.tid-1");
        assert_eq!(claims.username(), "ada@example.com");
        assert_eq!(claims.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(claims.all["roles"], json!(["admin"]));
        assert!(claims.validate("n-1", "client-x", 300).is_ok());
    }

    #[test]
    fn test_home_account_id_falls_back_to_sub() {
        let token = encode_unsigned(&json!({"sub": "s-2", "email": "bob@example.com"}));
        let claims = IdTokenClaims::decode(&token).unwrap();
        assert_eq!(claims.home_account_id(), "s-2");
        assert_eq!(claims.username(), "bob@example.com");
    }

    #[test]
    fn test_validate_rejects_wrong_nonce_and_audience() {
        let token = encode_unsigned(&json!({
            "sub": "s",
            "aud": ["other-client"],
            "nonce": "expected"
        }));
        let claims = IdTokenClaims::decode(&token).unwrap();
        assert!(matches!(
            claims.validate("different", "other-client", 0),
            Err(AuthError::NonceMismatch)
        ));
        assert!(matches!(
            claims.validate("expected", "client-x", 0),
            Err(AuthError::InvalidIdToken(_))
        ));
    }

    #[test]
    fn test_validate_rejects_expired_token() {
        let token = encode_unsigned(&json!({
            "sub": "s",
            "nonce": "n",
            "exp": Utc::now().timestamp() - 3600
        }));
        let claims = IdTokenClaims::decode(&token).unwrap();
        assert!(matches!(
            claims.validate("n", "client-x", 300),
            Err(AuthError::InvalidIdToken(_))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_tokens() {
        assert!(IdTokenClaims::decode("not-a-jwt").is_err());
        assert!(IdTokenClaims::decode("a.!!!.c").is_err());
        let no_sub = encode_unsigned(&json!({"name": "x"}));
        assert!(matches!(
            IdTokenClaims::decode(&no_sub),
            Err(AuthError::InvalidIdToken(_))
        ));
    }
}
