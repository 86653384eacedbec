use axum::{
    extract::{FromRef, FromRequestParts},
    headers::{authorization::Bearer, Authorization},
    http::request::Parts,
    RequestPartsExt, TypedHeader,
};
use bson::oid::ObjectId;
use jsonwebtoken::TokenData;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::{Duration, OffsetDateTime};

use crate::{
    error::{Error, UnauthorizedType},
    util::ObjectIdString,
};

#[derive(Clone)]
pub struct JwtState {
    validation: jsonwebtoken::Validation,
    header: jsonwebtoken::Header,

    encoding_key: jsonwebtoken::EncodingKey,
    decoding_key: jsonwebtoken::DecodingKey,
}

impl JwtState {
    pub fn new(secret: &str) -> Self {
        let encoding_key = jsonwebtoken::EncodingKey::from_secret(secret.as_bytes());
        let decoding_key = jsonwebtoken::DecodingKey::from_secret(secret.as_bytes());

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = false;

        Self {
            header,
            validation,

            encoding_key,
            decoding_key,
        }
    }
}

pub fn current_timestamp() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Which collection the token subject lives in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    User,
    Admin,
    SuperAdmin,
}

impl AccountType {
    pub fn token_lifetime(self) -> Duration {
        match self {
            AccountType::User => Duration::weeks(1),
            AccountType::Admin | AccountType::SuperAdmin => Duration::hours(24),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccessTokenClaims {
    pub sub: ObjectIdString,
    pub email: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub exp: i64,
}

impl AccessTokenClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

pub struct GenerateAccessTokenResponse {
    pub expired_at: OffsetDateTime,
    pub token: String,
}

pub fn generate_access_token(
    jwt_state: &JwtState,
    id: ObjectId,
    email: &str,
    account_type: AccountType,
) -> Result<GenerateAccessTokenResponse, Error> {
    let expired_at = current_timestamp() + account_type.token_lifetime();
    let token = generate_access_token_with_exp(
        jwt_state,
        id,
        email,
        account_type,
        expired_at.unix_timestamp(),
    )?;

    Ok(GenerateAccessTokenResponse { expired_at, token })
}

pub fn generate_access_token_with_exp(
    jwt_state: &JwtState,
    id: ObjectId,
    email: &str,
    account_type: AccountType,
    exp: i64,
) -> Result<String, Error> {
    jsonwebtoken::encode(
        &jwt_state.header,
        &AccessTokenClaims {
            sub: id.into(),
            email: email.to_string(),
            account_type,
            exp,
        },
        &jwt_state.encoding_key,
    )
    .map_err(Into::into)
}

pub fn decode_access_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<AccessTokenClaims>, Error> {
    jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(Into::into)
}

/// Any authenticated caller, whatever kind of account the token names.
#[derive(Debug, Clone)]
pub struct Access {
    pub id: ObjectId,
    pub email: String,
    pub account_type: AccountType,
}

impl Access {
    pub fn from_token(jwt_state: &JwtState, token: &str) -> Result<Self, Error> {
        let token = decode_access_token(jwt_state, token)
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
            .tap_err(|_| tracing::debug!("undecodable access token"))?;

        if token.claims.is_expired() {
            return Err(Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
                .tap_err(|_| tracing::debug!("expired access token"));
        }

        Ok(Self {
            id: token.claims.sub.0,
            email: token.claims.email,
            account_type: token.claims.account_type,
        })
    }

    pub fn require(self, account_type: AccountType) -> Result<Self, Error> {
        if self.account_type == account_type {
            Ok(self)
        } else {
            Err(Error::Forbidden).tap_err(|_| {
                tracing::debug!(
                    "{:?} token used where {:?} is required",
                    self.account_type,
                    account_type
                )
            })
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Access
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(token)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| Error::Unauthorized(UnauthorizedType::MissingAccessToken))?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, token.token())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::extract::FromRequestParts;

    use super::*;

    fn jwt() -> JwtState {
        JwtState::new("test-secret")
    }

    #[test]
    fn test_access_token_round_trip() {
        let jwt = jwt();
        let id = ObjectId::new();

        let generated = generate_access_token(&jwt, id, "seller@example.com", AccountType::User)
            .unwrap();

        let token = decode_access_token(&jwt, &generated.token).unwrap();
        assert_eq!(token.claims.sub, id);
        assert_eq!(token.claims.email, "seller@example.com");
        assert_eq!(token.claims.account_type, AccountType::User);
        assert!(!token.claims.is_expired());
        assert_eq!(token.claims.exp, generated.expired_at.unix_timestamp());
    }

    #[test]
    fn test_token_lifetimes() {
        assert_eq!(AccountType::User.token_lifetime(), Duration::days(7));
        assert_eq!(AccountType::Admin.token_lifetime(), Duration::hours(24));
        assert_eq!(AccountType::SuperAdmin.token_lifetime(), Duration::hours(24));
    }

    #[test]
    fn test_account_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&AccountType::SuperAdmin).unwrap(),
            "\"superadmin\""
        );
        assert_eq!(serde_json::to_string(&AccountType::Admin).unwrap(), "\"admin\"");
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let jwt = jwt();
        let token = generate_access_token_with_exp(
            &jwt,
            ObjectId::new(),
            "a@b.com",
            AccountType::User,
            (current_timestamp() + Duration::seconds(-1)).unix_timestamp(),
        )
        .unwrap();

        assert!(decode_access_token(&jwt, &token).unwrap().claims.is_expired());

        let err = Access::from_token(&jwt, &token).unwrap_err();
        assert_matches!(err, Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
    }

    #[test]
    fn test_foreign_signature_is_rejected() {
        let token = generate_access_token(
            &JwtState::new("other-secret"),
            ObjectId::new(),
            "a@b.com",
            AccountType::Admin,
        )
        .unwrap()
        .token;

        let err = Access::from_token(&jwt(), &token).unwrap_err();
        assert_matches!(err, Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
    }

    #[test]
    fn test_require_account_type() {
        let access = Access {
            id: ObjectId::new(),
            email: "a@b.com".to_string(),
            account_type: AccountType::Admin,
        };

        assert!(access.clone().require(AccountType::Admin).is_ok());
        assert_matches!(access.require(AccountType::User), Err(Error::Forbidden));
    }

    #[tokio::test]
    async fn test_access_from_bearer_header() {
        let jwt = jwt();
        let id = ObjectId::new();
        let token = generate_access_token(&jwt, id, "buyer@example.com", AccountType::User)
            .unwrap()
            .token;

        let (mut parts, _) = axum::http::request::Request::get("http://localhost")
            .header("Authorization", format!("Bearer {}", token))
            .body(())
            .unwrap()
            .into_parts();

        let access = Access::from_request_parts(&mut parts, &jwt).await.unwrap();
        assert_eq!(access.id, id);
        assert_eq!(access.account_type, AccountType::User);
    }

    #[tokio::test]
    async fn test_access_without_header() {
        let (mut parts, _) = axum::http::request::Request::get("http://localhost")
            .body(())
            .unwrap()
            .into_parts();

        let err = Access::from_request_parts(&mut parts, &jwt())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Unauthorized(UnauthorizedType::MissingAccessToken));
    }
}
