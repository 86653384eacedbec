use std::str::FromStr;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{
    extract::{FromRequestParts, Path},
    http::request::Parts,
};
use bson::oid::ObjectId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct ObjectIdString(#[serde(with = "object_id_string")] pub ObjectId);

impl From<ObjectId> for ObjectIdString {
    fn from(value: ObjectId) -> Self {
        Self(value)
    }
}

impl From<ObjectIdString> for ObjectId {
    fn from(value: ObjectIdString) -> Self {
        value.0
    }
}

impl std::ops::Deref for ObjectIdString {
    type Target = ObjectId;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::cmp::PartialEq for ObjectIdString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl std::cmp::Eq for ObjectIdString {}

impl std::cmp::PartialEq<ObjectId> for ObjectIdString {
    fn eq(&self, other: &ObjectId) -> bool {
        self.0 == *other
    }
}

impl From<ObjectIdString> for bson::Bson {
    fn from(value: ObjectIdString) -> Self {
        value.0.into()
    }
}

mod object_id_string {
    use bson::oid::ObjectId;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(id: &ObjectId, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ObjectId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub fn parse_object_id(id: &str) -> Result<ObjectId, Error> {
    ObjectId::from_str(id).map_err(|_| Error::NoResource)
}

/// A single `:id` path segment parsed as an [`ObjectId`]. Malformed ids are
/// reported as [`Error::NoResource`], the same as ids that do not exist.
#[derive(Debug, Clone, Copy)]
pub struct PathObjectId(pub ObjectId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for PathObjectId
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(id) = Path::<String>::from_request_parts(parts, state).await?;

        parse_object_id(&id).map(Self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FormattedDateTime(#[serde(with = "time::serde::rfc3339")] OffsetDateTime);

impl From<bson::DateTime> for FormattedDateTime {
    fn from(value: bson::DateTime) -> Self {
        Self(value.into())
    }
}

impl From<OffsetDateTime> for FormattedDateTime {
    fn from(value: OffsetDateTime) -> Self {
        Self(value)
    }
}

pub fn now() -> bson::DateTime {
    OffsetDateTime::now_utc().into()
}

pub fn verify_password(argon: &Argon2, password: &str, hashed: &str) -> bool {
    let hashed = match PasswordHash::new(hashed) {
        Ok(hashed) => hashed,
        Err(_) => return false,
    };

    argon.verify_password(password.as_bytes(), &hashed).is_ok()
}

pub fn hash_password(argon: &Argon2, password: &str) -> Result<String, Error> {
    let salt = password_hash::SaltString::generate(&mut password_hash::rand_core::OsRng);

    argon
        .hash_password(password.as_bytes(), &salt)
        .map(|it| it.to_string())
        .map_err(Into::into)
}

/// Accepts a price written either as a JSON number or as a numeric string.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecimalString(pub Decimal);

impl From<Decimal> for DecimalString {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl From<DecimalString> for Decimal {
    fn from(value: DecimalString) -> Self {
        value.0
    }
}

impl Serialize for DecimalString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for DecimalString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        pub struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = DecimalString;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a string of decimal or a number")
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Decimal::from(v).into())
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Decimal::from(v).into())
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Decimal::try_from(v)
                    .map(Into::into)
                    .map_err(serde::de::Error::custom)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Decimal::from_str(v.trim())
                    .map(Into::into)
                    .map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Page selection parsed leniently from query strings: garbage or zero falls
/// back to the default, then the value is clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u64,
    pub limit: u64,
}

impl Page {
    pub const DEFAULT_LIMIT: u64 = 10;
    pub const MAX_LIMIT: u64 = 100;

    pub fn parse(page: Option<&str>, limit: Option<&str>) -> Self {
        fn lenient(value: Option<&str>, default: i64) -> i64 {
            value
                .and_then(|it| it.trim().parse::<i64>().ok())
                .filter(|it| *it != 0)
                .unwrap_or(default)
        }

        let page = lenient(page, 1).max(1) as u64;
        let limit = lenient(limit, Self::DEFAULT_LIMIT as i64).clamp(1, Self::MAX_LIMIT as i64) as u64;

        Self { page, limit }
    }

    /// Documents to skip, capped at what MongoDB accepts as a 64-bit skip.
    pub fn skip(&self) -> u64 {
        self.page
            .saturating_sub(1)
            .saturating_mul(self.limit)
            .min(i64::MAX as u64)
    }

    pub fn meta(&self, total_items: u64) -> PaginationMeta {
        PaginationMeta {
            current_page: self.page,
            total_pages: (total_items + self.limit - 1) / self.limit,
            total_items,
            items_per_page: self.limit,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PaginationMeta {
    pub current_page: u64,
    pub total_pages: u64,
    pub total_items: u64,
    pub items_per_page: u64,
}

/// Escapes a user-supplied search term so it matches literally inside a
/// MongoDB `$regex`.
pub fn escape_regex(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());

    for c in input.chars() {
        if matches!(
            c,
            '\\' | '.' | '^' | '$' | '|' | '?' | '*' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '/'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

/// Case-insensitive "contains" filter over the given fields.
pub fn search_filter(search: &str, fields: &[&str]) -> bson::Document {
    let pattern = escape_regex(search.trim());

    let clauses: Vec<bson::Bson> = fields
        .iter()
        .map(|field| {
            bson::Bson::Document(bson::doc! {
                *field: { "$regex": pattern.as_str(), "$options": "i" }
            })
        })
        .collect();

    bson::doc! { "$or": clauses }
}

pub fn sanitize_string(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '"' | '\'' | '`'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use bson::oid::ObjectId;
    use rust_decimal::Decimal;

    use super::*;

    #[test]
    fn test_object_id_string_serde() {
        let id = ObjectId::new();
        let json = serde_json::to_string(&ObjectIdString(id)).unwrap();
        assert_eq!(json, format!("\"{}\"", id));

        let back: ObjectIdString = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<ObjectIdString>("\"not-an-id\"").is_err());
    }

    #[test]
    fn test_decimal_string_accepts_numbers_and_strings() {
        let from_str: DecimalString = serde_json::from_str("\"450000.50\"").unwrap();
        assert_eq!(from_str.0, Decimal::new(45000050, 2));

        let from_int: DecimalString = serde_json::from_str("450000").unwrap();
        assert_eq!(from_int.0, Decimal::from(450000));

        assert!(serde_json::from_str::<DecimalString>("\"lots\"").is_err());
    }

    #[test]
    fn test_page_parse() {
        assert_eq!(Page::parse(None, None), Page { page: 1, limit: 10 });
        assert_eq!(
            Page::parse(Some("3"), Some("25")),
            Page { page: 3, limit: 25 }
        );
        assert_eq!(
            Page::parse(Some("abc"), Some("0")),
            Page { page: 1, limit: 10 }
        );
        assert_eq!(
            Page::parse(Some("-4"), Some("500")),
            Page { page: 1, limit: 100 }
        );
        assert_eq!(Page::parse(None, Some("-5")), Page { page: 1, limit: 1 });
    }

    #[test]
    fn test_page_meta() {
        let page = Page::parse(Some("2"), Some("10"));
        assert_eq!(page.skip(), 10);

        let meta = page.meta(21);
        assert_eq!(meta.total_pages, 3);
        assert_eq!(meta.total_items, 21);
        assert_eq!(meta.current_page, 2);

        assert_eq!(page.meta(0).total_pages, 0);
    }

    #[test]
    fn test_huge_page_does_not_overflow() {
        let page = Page::parse(Some("922337203685477580"), Some("100"));
        assert_eq!(page.skip(), i64::MAX as u64);

        let page = Page::parse(Some(&i64::MAX.to_string()), Some("100"));
        assert_eq!(page.skip(), i64::MAX as u64);
        assert_eq!(page.meta(5).current_page, i64::MAX as u64);
    }

    #[test]
    fn test_escape_regex() {
        assert_eq!(escape_regex("swift"), "swift");
        assert_eq!(escape_regex("a.b*c"), "a\\.b\\*c");
        assert_eq!(escape_regex("(x)[y]"), "\\(x\\)\\[y\\]");
    }

    #[test]
    fn test_search_filter() {
        let filter = search_filter(" city+ ", &["name", "description"]);
        let clauses = filter.get_array("$or").unwrap();

        assert_eq!(clauses.len(), 2);
        let first = clauses[0].as_document().unwrap();
        let name = first.get_document("name").unwrap();
        assert_eq!(name.get_str("$regex").unwrap(), "city\\+");
        assert_eq!(name.get_str("$options").unwrap(), "i");
    }

    #[test]
    fn test_sanitize_string() {
        assert_eq!(
            sanitize_string("  <b>Honda \"City\"</b> `x` "),
            "bHonda City/b x"
        );
        assert_eq!(sanitize_string("It's fine"), "Its fine");
    }

    #[test]
    fn test_hash_and_verify_password() {
        let argon = Argon2::default();
        let hashed = hash_password(&argon, "hunter22").unwrap();

        assert!(verify_password(&argon, "hunter22", &hashed));
        assert!(!verify_password(&argon, "hunter23", &hashed));
        assert!(!verify_password(&argon, "hunter22", "not a hash"));
    }
}
