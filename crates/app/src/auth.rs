use std::str::FromStr;

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use anesth_roster_core::types::Role;

use crate::problem::ProblemResponse;

/// Validates bearer tokens signed with the shared HS256 secret.
///
/// Expiry is checked manually against the injected clock so tests can pin
/// time through the application state.
#[derive(Clone)]
pub struct TokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<AuthContext, TokenError> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| TokenError::Invalid(format!("{err}")))?;
        let claims = data.claims;

        let now_ts = now.timestamp();
        if let Some(nbf) = claims.nbf {
            if now_ts < nbf as i64 {
                return Err(TokenError::Invalid("token_not_yet_valid".to_string()));
            }
        }
        if now_ts >= claims.exp as i64 {
            return Err(TokenError::Invalid("token_expired".to_string()));
        }

        let role = Role::from_str(&claims.role)
            .map_err(|_| TokenError::Invalid("unknown_role".to_string()))?;

        Ok(AuthContext {
            user_id: claims.sub,
            role,
        })
    }
}

/// Claims carried by the bearer token.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenClaims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
    #[serde(default)]
    pub nbf: Option<usize>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Authenticated caller identity extracted from the request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub role: Role,
}

impl AuthContext {
    /// Requires planner or admin access.
    pub fn require_planner(&self) -> Result<(), ProblemResponse> {
        if self.role.can_plan() {
            Ok(())
        } else {
            Err(ProblemResponse::forbidden(
                "planner or admin role required",
            ))
        }
    }

    /// Requires full administrative access.
    pub fn require_admin(&self) -> Result<(), ProblemResponse> {
        if self.role.is_admin() {
            Ok(())
        } else {
            Err(ProblemResponse::forbidden("admin role required"))
        }
    }

    /// Requires that the caller is `user_id` themselves or a planner/admin.
    pub fn require_self_or_planner(&self, user_id: &str) -> Result<(), ProblemResponse> {
        if self.user_id == user_id || self.role.can_plan() {
            Ok(())
        } else {
            Err(ProblemResponse::forbidden(
                "cannot act on another user's records",
            ))
        }
    }
}

/// Extracts the bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authenticates a request, returning 401 problems on failure.
pub fn authenticate(
    validator: &TokenValidator,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<AuthContext, ProblemResponse> {
    let token =
        bearer_token(headers).ok_or_else(|| ProblemResponse::unauthorized("missing bearer token"))?;
    validator
        .validate(token, now)
        .map_err(|err| ProblemResponse::unauthorized(err.to_string()))
}

#[cfg(test)]
pub(crate) fn issue_token(secret: &[u8], user_id: &str, role: Role, exp: DateTime<Utc>) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = TokenClaims {
        sub: user_id.to_string(),
        role: role.as_str().to_string(),
        exp: exp.timestamp() as usize,
        nbf: None,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).expect("token encodes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SECRET: &[u8] = b"test-secret";

    #[test]
    fn validates_a_fresh_token() {
        let validator = TokenValidator::new(SECRET);
        let now = Utc::now();
        let token = issue_token(SECRET, "user-1", Role::Planner, now + Duration::hours(1));

        let context = validator.validate(&token, now).expect("token validates");
        assert_eq!(context.user_id, "user-1");
        assert_eq!(context.role, Role::Planner);
        assert!(context.require_planner().is_ok());
        assert!(context.require_admin().is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let validator = TokenValidator::new(SECRET);
        let now = Utc::now();
        let token = issue_token(SECRET, "user-1", Role::User, now - Duration::seconds(1));

        let err = validator.validate(&token, now).unwrap_err();
        assert!(matches!(err, TokenError::Invalid(detail) if detail == "token_expired"));
    }

    #[test]
    fn rejects_wrong_secret() {
        let validator = TokenValidator::new(SECRET);
        let now = Utc::now();
        let token = issue_token(b"other-secret", "user-1", Role::User, now + Duration::hours(1));

        assert!(validator.validate(&token, now).is_err());
    }

    #[test]
    fn self_or_planner_gate() {
        let user = AuthContext {
            user_id: "user-1".to_string(),
            role: Role::User,
        };
        assert!(user.require_self_or_planner("user-1").is_ok());
        assert!(user.require_self_or_planner("user-2").is_err());

        let planner = AuthContext {
            user_id: "planner-1".to_string(),
            role: Role::Planner,
        };
        assert!(planner.require_self_or_planner("user-2").is_ok());
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
