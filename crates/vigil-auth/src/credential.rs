//! JWT validation at upgrade time.

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use serde_json::Value;
use vigil_core::Principal;

use crate::errors::AuthError;

/// A validated credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Identity carried by the token.
    pub principal: Principal,
    /// First instant at which the credential is no longer valid.
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the credential has expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        expired_at(self.expires_at, now)
    }
}

/// The one expiry rule shared by upgrade-time validation and the
/// connected-session check: a credential is dead from `expires_at` on.
pub fn expired_at(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= expires_at
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
    user_id: Option<Value>,
    institution_id: Option<Value>,
    role: Option<Value>,
}

/// Validates HMAC-signed tokens against a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator").finish_non_exhaustive()
    }
}

impl JwtAuthenticator {
    /// Accepts HS256, HS384 and HS512 with no clock leeway.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify `token` and extract its principal and expiry.
    pub fn authenticate(&self, token: &str) -> Result<Credential, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::MissingRequiredClaim(claim) if claim == "exp" => {
                AuthError::MissingClaim("expiration".into())
            }
            ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
            _ => AuthError::InvalidToken(e.to_string()),
        })?;
        credential_from(data.claims, Utc::now())
    }
}

fn credential_from(claims: Claims, now: DateTime<Utc>) -> Result<Credential, AuthError> {
    let exp = claims
        .exp
        .ok_or_else(|| AuthError::MissingClaim("expiration".into()))?;
    let expires_at = DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| AuthError::InvalidToken("exp out of range".into()))?;

    let credential = Credential {
        principal: Principal {
            user_id: claim_string(claims.user_id, "user_id")?,
            institution_id: claim_string(claims.institution_id, "institution_id")?,
            role: claim_string(claims.role, "role")?,
        },
        expires_at,
    };
    if credential.is_expired_at(now) {
        return Err(AuthError::Expired);
    }
    Ok(credential)
}

/// Claims may be strings or numbers; both are rendered as plain strings.
fn claim_string(value: Option<Value>, name: &str) -> Result<String, AuthError> {
    match value {
        None | Some(Value::Null) => Err(AuthError::MissingClaim(name.to_owned())),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Ok(other.to_string()),
    }
}
