use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::{StatusCode, Uri},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::v1::rating::RatingDenial;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(Uri),

    #[error("{0} not found")]
    ResourceNotFound(&'static str),

    #[error("No resource found")]
    NoResource,

    #[error("{0}")]
    PasswordHashError(#[from] password_hash::Error),

    #[error("{0}")]
    DatabaseError(#[from] mongodb::error::Error),

    #[error("{0}")]
    JWTError(#[from] jsonwebtoken::errors::Error),

    #[error("{0} must unique")]
    MustUniqueError(String),

    #[error("{0}")]
    Unauthorized(UnauthorizedType),

    #[error("You have no permission to access this resource")]
    Forbidden,

    #[error("Account suspended: {0}")]
    Suspended(String),

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("{0}")]
    RatingNotAllowed(RatingDenial),

    #[error("{0}")]
    BSONSerError(#[from] bson::ser::Error),

    #[error("{0}")]
    BSONDeError(#[from] bson::de::Error),

    #[error("{1}")]
    CustomStr(StatusCode, &'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum UnauthorizedType {
    #[error("Wrong Username or Password")]
    WrongUsernameOrPassword,

    #[error("Invalid access token")]
    InvalidAccessToken,

    #[error("No token, authorization denied")]
    MissingAccessToken,

    #[error("Current password is incorrect")]
    WrongPassword,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<serde_json::Value>,
    r#type: String,
    message: String,
}

impl From<Error> for ErrorJson {
    fn from(err: Error) -> Self {
        let message = err.to_string();

        let r#type = err.to_string_variant();

        let errors = match err {
            Error::ValidationError(err) => serde_json::to_value(err).ok(),
            Error::BadRequest(..)
            | Error::NotFound(..)
            | Error::ResourceNotFound(..)
            | Error::NoResource
            | Error::PasswordHashError(..)
            | Error::DatabaseError(..)
            | Error::JWTError(..)
            | Error::MustUniqueError(..)
            | Error::Unauthorized(..)
            | Error::Forbidden
            | Error::Suspended(..)
            | Error::AccountDisabled
            | Error::RatingNotAllowed(..)
            | Error::BSONSerError(..)
            | Error::BSONDeError(..)
            | Error::CustomStr(..) => None,
        };

        Self {
            errors,
            message,
            r#type,
        }
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            Self::ValidationError(..)
            | Self::BadRequest(..)
            | Self::MustUniqueError(..)
            | Self::RatingNotAllowed(..) => StatusCode::BAD_REQUEST,
            Self::Forbidden | Self::Suspended(..) | Self::AccountDisabled => StatusCode::FORBIDDEN,
            Self::NotFound(..) | Self::ResourceNotFound(..) | Self::NoResource => {
                StatusCode::NOT_FOUND
            }
            Self::PasswordHashError(..)
            | Self::DatabaseError(..)
            | Self::JWTError(..)
            | Self::BSONSerError(..)
            | Self::BSONDeError(..) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CustomStr(code, ..) => *code,
        }
    }

    pub fn to_string_variant(&self) -> String {
        macro_rules! match_var {
            ($id:ident !) => {
                Self::$id
            };
            ($id:ident (..)) => {
                Self::$id(..)
            };
            ($id:ident {..}) => {
                Self::$id { .. }
            };
        }

        macro_rules! variant {
            ($($name:ident $tt:tt),+) => {
                match self {
                    $(
                        match_var!($name $tt) => {
                            stringify!($name)
                       }
                    )+
                }
            };
        }

        variant! {
            BadRequest(..),
            NotFound(..),
            ResourceNotFound(..),
            NoResource!,
            Forbidden!,
            AccountDisabled!,
            Suspended(..),
            RatingNotAllowed(..),
            ValidationError(..),
            PasswordHashError(..),
            DatabaseError(..),
            JWTError(..),
            BSONSerError(..),
            BSONDeError(..),
            MustUniqueError(..),
            Unauthorized(..),
            CustomStr(..)
        }
        .to_string()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!("error: {:?}", self);
        let status = self.status();

        let error = ErrorJson::from(self);

        (status, Json(error)).into_response()
    }
}

impl From<PathRejection> for Error {
    fn from(_value: PathRejection) -> Self {
        Self::NoResource
    }
}

impl From<JsonRejection> for Error {
    fn from(value: JsonRejection) -> Self {
        Self::BadRequest(value.body_text())
    }
}

impl From<QueryRejection> for Error {
    fn from(value: QueryRejection) -> Self {
        Self::BadRequest(value.body_text())
    }
}
