//! JWT bearer token validation
//!
//! Tokens are issued by the platform's authentication service; the ledger
//! only validates them and reads the caller's id and roles.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::permissions::Role;
use super::Actor;

/// Claims the ledger expects in a bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Roles granted to the user
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// Issued at (unix seconds)
    pub iat: i64,
}

impl Claims {
    pub fn actor(&self) -> Actor {
        Actor::new(self.sub.clone(), self.roles.clone())
    }
}

/// Outcome of token verification
#[derive(Debug)]
pub struct TokenValidationResult {
    pub valid: bool,
    pub claims: Option<Claims>,
    pub error: Option<String>,
}

/// HS256 token validator
#[derive(Clone)]
pub struct JwtValidator {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    expiry_seconds: u64,
}

impl JwtValidator {
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self, String> {
        if secret.len() < 16 {
            return Err("JWT secret must be at least 16 characters".to_string());
        }
        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            expiry_seconds,
        })
    }

    /// Validator using the development secret
    pub fn new_dev() -> Self {
        let secret = b"dev-only-insecure-secret";
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            encoding_key: EncodingKey::from_secret(secret),
            expiry_seconds: 86400,
        }
    }

    /// Verify a token and extract its claims
    pub fn verify_token(&self, token: &str) -> TokenValidationResult {
        let validation = Validation::new(Algorithm::HS256);
        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => TokenValidationResult {
                valid: true,
                claims: Some(data.claims),
                error: None,
            },
            Err(e) => TokenValidationResult {
                valid: false,
                claims: None,
                error: Some(format!("Invalid token: {}", e)),
            },
        }
    }

    /// Sign a token for the given user. Used by operator tooling and tests.
    pub fn sign_token(&self, user_id: &str, roles: Vec<Role>) -> Result<String, String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            roles,
            iat: now,
            exp: now + self.expiry_seconds as i64,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| format!("Failed to sign token: {}", e))
    }
}

/// Extract a bearer token from an Authorization header value
pub fn extract_token_from_header(header: Option<&str>) -> Option<&str> {
    header?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let jwt = JwtValidator::new("a-long-enough-test-secret".into(), 60).unwrap();
        let token = jwt.sign_token("user-1", vec![Role::Investor]).unwrap();

        let result = jwt.verify_token(&token);
        assert!(result.valid);
        let claims = result.claims.unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.roles, vec![Role::Investor]);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let a = JwtValidator::new("first-secret-0123456".into(), 60).unwrap();
        let b = JwtValidator::new("second-secret-012345".into(), 60).unwrap();
        let token = a.sign_token("user-1", vec![]).unwrap();
        let result = b.verify_token(&token);
        assert!(!result.valid);
        assert!(result.error.is_some());
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(JwtValidator::new("short".into(), 60).is_err());
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token_from_header(Some("Bearer abc")), Some("abc"));
        assert_eq!(extract_token_from_header(Some("Basic abc")), None);
        assert_eq!(extract_token_from_header(Some("Bearer ")), None);
        assert_eq!(extract_token_from_header(None), None);
    }
}
