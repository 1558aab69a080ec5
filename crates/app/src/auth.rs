use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use school_fees_core::StudentId;

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Caller roles carried in the `role` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Staff,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Staff => "staff",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub sub: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<StudentId>,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<usize>,
}

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

    /// Decodes the token and checks its time window against `now`.
    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Actor, TokenError> {
        let claims = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| TokenError::Invalid(format!("{err}")))?
            .claims;

        let now_ts = now.timestamp();
        if let Some(nbf) = claims.nbf {
            if now_ts < nbf as i64 {
                return Err(TokenError::Invalid("token_not_yet_valid".to_string()));
            }
        }
        if now_ts >= claims.exp as i64 {
            return Err(TokenError::Invalid("token_expired".to_string()));
        }

        let student_id = match (claims.role, claims.student_id) {
            (Role::Student, None) => {
                return Err(TokenError::Invalid("student_id_required".to_string()));
            }
            (Role::Student, id) => id,
            _ => None,
        };

        Ok(Actor {
            subject: claims.sub,
            role: claims.role,
            student_id,
        })
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub subject: String,
    pub role: Role,
    /// Set for students only.
    pub student_id: Option<StudentId>,
}

impl Actor {
    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Staff | Role::Admin)
    }

    pub fn require_staff(&self) -> Result<(), ProblemResponse> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(ProblemResponse::forbidden(format!(
                "{} callers may not perform this action",
                self.role.as_str()
            )))
        }
    }

    /// Resolves the student filter for a read.
    ///
    /// Staff see whatever they ask for; students are pinned to their own id
    /// and may not ask for anyone else's.
    pub fn scope_student(
        &self,
        requested: Option<StudentId>,
    ) -> Result<Option<StudentId>, ProblemResponse> {
        match self.student_id {
            None => Ok(requested),
            Some(own) => match requested {
                Some(other) if other != own => Err(ProblemResponse::forbidden(
                    "students may only access their own records",
                )),
                _ => Ok(Some(own)),
            },
        }
    }

    pub fn can_access(&self, student_id: StudentId) -> bool {
        self.student_id.map(|own| own == student_id).unwrap_or(true)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Actor {
    type Rejection = ProblemResponse;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| query_token(parts))
            .ok_or_else(|| ProblemResponse::unauthorized("missing bearer token"))?;

        state
            .token_validator()
            .validate(&token, state.now())
            .map_err(|err| {
                debug!(stage = "app", error = %err, "rejected token");
                ProblemResponse::unauthorized("invalid or expired token")
            })
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// `EventSource` cannot set headers, so `/events` also accepts `?token=`.
fn query_token(parts: &Parts) -> Option<String> {
    if parts.uri.path() != "/events" {
        return None;
    }
    parts.uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" && !value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
pub(crate) mod test_tokens {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub const SECRET: &[u8] = b"token-secret";

    pub fn mint(role: Role, student_id: Option<StudentId>, exp: i64) -> String {
        let claims = TokenClaims {
            sub: format!("{}-user", role.as_str()),
            role,
            student_id,
            exp: exp as usize,
            nbf: None,
        };
        encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .expect("encode token")
    }
}

#[cfg(test)]
mod tests {
    use super::test_tokens::*;
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn accepts_valid_staff_token() {
        let validator = TokenValidator::new(SECRET);
        let token = mint(Role::Staff, None, now().timestamp() + 60);
        let actor = validator.validate(&token, now()).expect("valid");
        assert_eq!(actor.subject, "staff-user");
        assert!(actor.is_staff());
        assert_eq!(actor.student_id, None);
    }

    #[test]
    fn rejects_expired_and_foreign_tokens() {
        let validator = TokenValidator::new(SECRET);
        let expired = mint(Role::Staff, None, now().timestamp() - 1);
        assert!(validator.validate(&expired, now()).is_err());

        let other = TokenValidator::new(b"other-secret");
        let token = mint(Role::Staff, None, now().timestamp() + 60);
        assert!(other.validate(&token, now()).is_err());
    }

    #[test]
    fn students_need_an_id_and_are_scoped_to_it() {
        let validator = TokenValidator::new(SECRET);
        let missing = mint(Role::Student, None, now().timestamp() + 60);
        assert!(validator.validate(&missing, now()).is_err());

        let token = mint(Role::Student, Some(5), now().timestamp() + 60);
        let actor = validator.validate(&token, now()).expect("valid");
        assert_eq!(actor.scope_student(None).expect("own"), Some(5));
        assert_eq!(actor.scope_student(Some(5)).expect("own"), Some(5));
        assert!(actor.scope_student(Some(6)).is_err());
        assert!(actor.can_access(5));
        assert!(!actor.can_access(6));
        assert!(actor.require_staff().is_err());
    }
}
