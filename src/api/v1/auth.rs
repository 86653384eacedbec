use argon2::Argon2;
use axum::{
    extract::{FromRef, FromRequestParts, State},
    http::{request::Parts, StatusCode},
    RequestPartsExt,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::{Validate, ValidationError};

use crate::{
    cache::{keys, Cache},
    error::{Error, UnauthorizedType},
    extract::Json,
    mongo_ext::{is_duplicate_key, Collection},
    util::{hash_password, now, verify_password, FormattedDateTime, ObjectIdString},
};

use super::{
    car::{invalidate_car, invalidate_listing, CarCollection},
    token::{generate_access_token, Access, AccountType, JwtState},
};

#[derive(Clone)]
pub struct UserCollection(pub Collection<UserModel>);

impl std::ops::Deref for UserCollection {
    type Target = Collection<UserModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub name: String,
    pub email: String,
    pub password: String,

    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub car_listings: Vec<ObjectId>,

    #[serde(default)]
    pub is_suspended: bool,
    #[serde(default)]
    pub suspension_reason: String,
    #[serde(default)]
    pub suspended_at: Option<bson::DateTime>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

impl UserModel {
    pub async fn from_id(id: ObjectId, users: &UserCollection) -> Result<Self, Error> {
        users
            .get_one_by_id(id)
            .await?
            .ok_or_else(|| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
            .tap_err(|_| tracing::debug!("token names a user that no longer exists"))
    }

    pub fn ensure_not_suspended(&self) -> Result<(), Error> {
        if self.is_suspended {
            return Err(Error::Suspended(self.suspension_reason.clone()))
                .tap_err(|_| tracing::debug!("suspended user {} rejected", self.id));
        }

        Ok(())
    }
}

/// A user as shown to the user themselves and to staff. Never carries the
/// password hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub id: ObjectIdString,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub car_listings: Vec<ObjectIdString>,

    pub is_suspended: bool,
    pub suspension_reason: String,
    pub suspended_at: Option<FormattedDateTime>,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<UserModel> for User {
    fn from(value: UserModel) -> Self {
        Self {
            id: value.id.into(),
            name: value.name,
            email: value.email,
            phone: value.phone,
            car_listings: value.car_listings.into_iter().map(Into::into).collect(),

            is_suspended: value.is_suspended,
            suspension_reason: value.suspension_reason,
            suspended_at: value.suspended_at.map(Into::into),

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

/// Contact details other users may see.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublicUser {
    pub id: ObjectIdString,
    pub name: String,
    pub email: String,
    pub phone: String,
}

impl From<UserModel> for PublicUser {
    fn from(value: UserModel) -> Self {
        Self {
            id: value.id.into(),
            name: value.name,
            email: value.email,
            phone: value.phone,
        }
    }
}

/// A caller holding a user token.
#[derive(Debug, Clone)]
pub struct UserAccess {
    pub id: ObjectId,
    pub email: String,
}

impl UserAccess {
    pub fn from_token(jwt_state: &JwtState, token: &str) -> Result<Self, Error> {
        Self::try_from(Access::from_token(jwt_state, token)?)
    }
}

impl TryFrom<Access> for UserAccess {
    type Error = Error;

    fn try_from(access: Access) -> Result<Self, Self::Error> {
        if access.account_type != AccountType::User {
            return Err(Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
                .tap_err(|_| tracing::debug!("{:?} token used on a user route", access.account_type));
        }

        Ok(Self {
            id: access.id,
            email: access.email,
        })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserAccess
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let access = parts.extract_with_state::<Access, _>(state).await?;

        Self::try_from(access)
    }
}

/// The calling user's document, for routes that suspended users may not use.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserModel);

impl CurrentUser {
    pub async fn from_access(access: &UserAccess, users: &UserCollection) -> Result<Self, Error> {
        let user = UserModel::from_id(access.id, users).await?;
        user.ensure_not_suspended()?;

        Ok(Self(user))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let access = parts.extract_with_state::<UserAccess, _>(state).await?;
        let users = UserCollection::from_ref(state);

        Self::from_access(&access, &users).await
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name
        .chars()
        .all(|c| c.is_ascii_alphabetic() || c == ' ' || c == '-' || c == '\'')
    {
        Ok(())
    } else {
        Err(ValidationError::new("name_charset"))
    }
}

pub fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    if phone.len() == 10 && phone.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ValidationError::new("phone_ten_digits"))
    }
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct RegisterRequest {
    #[validate(length(min = 2, max = 50), custom = "validate_name")]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 6, max = 50))]
    pub password: String,

    #[validate(custom = "validate_phone")]
    pub phone: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthResponse {
    pub id: ObjectIdString,
    pub name: String,
    pub email: String,
    pub token: String,
}

pub async fn create_user(
    users: &UserCollection,
    argon: &Argon2<'_>,
    mut request: RegisterRequest,
) -> Result<UserModel, Error> {
    request.name = request.name.trim().to_string();
    request.email = normalize_email(&request.email);
    request.validate()?;

    let count = users
        .count_documents(bson::doc! { "email": &request.email }, None)
        .await?;

    if count > 0 {
        return Err(Error::MustUniqueError("email".to_string()))
            .tap_err(|_| tracing::debug!("email already registered"));
    }

    let model = UserModel {
        id: ObjectId::new(),
        name: request.name,
        email: request.email,
        password: hash_password(argon, &request.password)?,
        phone: request.phone.unwrap_or_default(),
        car_listings: vec![],
        is_suspended: false,
        suspension_reason: String::new(),
        suspended_at: None,
        created_at: now(),
        updated_at: now(),
    };

    users.insert_one(&model, None).await.map_err(|err| {
        if is_duplicate_key(&err) {
            Error::MustUniqueError("email".to_string())
        } else {
            err.into()
        }
    })?;

    Ok(model)
}

#[tracing::instrument(skip_all, fields(email = %request.email))]
pub async fn register(
    State(users): State<UserCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), Error> {
    let user = create_user(&users, &argon, request).await?;
    let token = generate_access_token(&jwt_state, user.id, &user.email, AccountType::User)?;

    tracing::info!("registered user {}", user.id);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            id: user.id.into(),
            name: user.name,
            email: user.email,
            token: token.token,
        }),
    ))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub async fn login(
    State(users): State<UserCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, Error> {
    let user = users
        .find_one(
            bson::doc! {
                "email": normalize_email(&request.email)
            },
            None,
        )
        .await?;

    let user = match user {
        Some(user) if verify_password(&argon, &request.password, &user.password) => user,
        _ => {
            return Err(Error::Unauthorized(
                UnauthorizedType::WrongUsernameOrPassword,
            ))
            .tap_err(|_| tracing::debug!("failed login attempt"))
        }
    };

    user.ensure_not_suspended()?;

    let token = generate_access_token(&jwt_state, user.id, &user.email, AccountType::User)?;

    Ok(Json(AuthResponse {
        id: user.id.into(),
        name: user.name,
        email: user.email,
        token: token.token,
    }))
}

pub async fn profile(
    State(users): State<UserCollection>,
    access: UserAccess,
) -> Result<Json<User>, Error> {
    let user = UserModel::from_id(access.id, &users).await?;

    Ok(Json(user.into()))
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone, Default)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 2, max = 50), custom = "validate_name")]
    pub name: Option<String>,

    #[validate(custom = "validate_phone")]
    pub phone: Option<String>,

    pub current_password: Option<String>,

    #[validate(length(min = 6, max = 50))]
    pub new_password: Option<String>,
}

#[tracing::instrument(skip_all, fields(user = %access.id))]
pub async fn update_profile(
    State(users): State<UserCollection>,
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    State(argon): State<Argon2<'static>>,
    access: UserAccess,
    Json(mut request): Json<UpdateProfileRequest>,
) -> Result<Json<User>, Error> {
    request.name = request.name.map(|it| it.trim().to_string());
    request.validate()?;

    let user = UserModel::from_id(access.id, &users).await?;

    let mut set = bson::doc! { "updated_at": now() };

    if let Some(name) = &request.name {
        set.insert("name", name);
    }

    if let Some(phone) = &request.phone {
        set.insert("phone", phone);
    }

    if let Some(new_password) = &request.new_password {
        let current_password = request.current_password.as_deref().ok_or(Error::CustomStr(
            StatusCode::BAD_REQUEST,
            "Current password is required to set a new password",
        ))?;

        if !verify_password(&argon, current_password, &user.password) {
            return Err(Error::Unauthorized(UnauthorizedType::WrongPassword))
                .tap_err(|_| tracing::debug!("wrong current password"));
        }

        set.insert("password", hash_password(&argon, new_password)?);
    }

    let updated = users
        .update_one_by_id_returning(user.id, bson::doc! { "$set": set })
        .await?
        .ok_or(Error::ResourceNotFound("User"))?;

    if let Some(phone) = &request.phone {
        cars.update_many(
            bson::doc! { "owner_id": user.id },
            bson::doc! { "$set": { "owner_phone": phone } },
            None,
        )
        .await?;

        invalidate_listing(&cache, user.id).await;
        for car in cars.find_vec(bson::doc! { "owner_id": user.id }, None).await? {
            invalidate_car(&cache, &car).await;
        }
    }

    Ok(Json(updated.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Deletes a user together with every car they own, and takes them off the
/// favourite lists of the remaining cars. Returns whether the user existed.
pub async fn purge_user(
    users: &UserCollection,
    cars: &CarCollection,
    cache: &Cache,
    user_id: ObjectId,
) -> Result<bool, Error> {
    let owned = cars
        .find_vec(bson::doc! { "owner_id": user_id }, None)
        .await?;
    let favorited = cars
        .find_vec(bson::doc! { "favorited_by": user_id }, None)
        .await?;

    cars.delete_many(bson::doc! { "owner_id": user_id }, None)
        .await?;

    cars.update_many(
        bson::doc! { "favorited_by": user_id },
        bson::doc! { "$pull": { "favorited_by": user_id } },
        None,
    )
    .await?;

    let deleted = users.delete_one_by_id(user_id).await?;

    invalidate_listing(cache, user_id).await;
    cache.delete(&keys::favorites(user_id)).await;
    for car in owned.iter().chain(&favorited) {
        invalidate_car(cache, car).await;
    }

    Ok(deleted)
}

#[tracing::instrument(skip_all, fields(user = %access.id))]
pub async fn delete_account(
    State(users): State<UserCollection>,
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    access: UserAccess,
) -> Result<Json<MessageResponse>, Error> {
    if !purge_user(&users, &cars, &cache, access.id).await? {
        return Err(Error::ResourceNotFound("User"));
    }

    tracing::info!("user {} deleted their account", access.id);

    Ok(Json(MessageResponse::new("Account deleted successfully")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::{extract::FromRequestParts, extract::State, http::StatusCode};
    use validator::Validate;

    use super::{RegisterRequest, UpdateProfileRequest};
    use crate::{
        api::v1::{
            tests::bootstrap,
            token::{generate_access_token, AccountType, JwtState},
        },
        error::{Error, UnauthorizedType},
        extract::Json,
    };

    fn register_request(email: &str) -> RegisterRequest {
        RegisterRequest {
            name: "Asha Rao".to_string(),
            email: email.to_string(),
            password: "secret1".to_string(),
            phone: Some("9876543210".to_string()),
        }
    }

    #[test]
    fn test_register_validation() {
        assert!(register_request("asha@example.com").validate().is_ok());

        let mut request = register_request("asha@example.com");
        request.name = "R2D2".to_string();
        assert!(request.validate().is_err());

        let mut request = register_request("asha@example.com");
        request.name = "O'Neil-Smith".to_string();
        assert!(request.validate().is_ok());

        let mut request = register_request("asha@example.com");
        request.name = "Asha\tRao".to_string();
        assert!(request.validate().is_err());

        let mut request = register_request("asha@example.com");
        request.name = "Asha\nRao".to_string();
        assert!(request.validate().is_err());

        let mut request = register_request("asha@example.com");
        request.phone = Some("98765-4321".to_string());
        assert!(request.validate().is_err());

        let mut request = register_request("asha@example.com");
        request.phone = None;
        assert!(request.validate().is_ok());

        let mut request = register_request("asha@example.com");
        request.password = "12345".to_string();
        assert!(request.validate().is_err());

        assert!(register_request("not-an-email").validate().is_err());
    }

    #[test]
    fn test_update_profile_validation() {
        assert!(UpdateProfileRequest::default().validate().is_ok());

        let request = UpdateProfileRequest {
            phone: Some("123".to_string()),
            ..Default::default()
        };
        assert!(request.validate().is_err());

        let request = UpdateProfileRequest {
            new_password: Some("abc".to_string()),
            ..Default::default()
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(super::normalize_email("  Asha@Example.COM "), "asha@example.com");
    }

    #[tokio::test]
    async fn test_staff_token_is_not_user_access() {
        let jwt = JwtState::new("test-secret");
        let token = generate_access_token(
            &jwt,
            bson::oid::ObjectId::new(),
            "mod@example.com",
            AccountType::Admin,
        )
        .unwrap()
        .token;

        let (mut parts, _) = axum::http::request::Request::get("http://localhost")
            .header("Authorization", format!("Bearer {}", token))
            .body(())
            .unwrap()
            .into_parts();

        let err = super::UserAccess::from_request_parts(&mut parts, &jwt)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
    }

    #[tokio::test]
    #[ignore = "needs a running MongoDB (MONGODB_URI)"]
    async fn test_register_and_login() {
        let bootstrap = bootstrap().await;

        let (status, Json(registered)) = super::register(
            bootstrap.users(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(register_request(" New.Seller@Example.com ")),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(registered.email, "new.seller@example.com");

        let Json(logged_in) = super::login(
            bootstrap.users(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(super::LoginRequest {
                email: "NEW.SELLER@example.com".to_string(),
                password: "secret1".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(logged_in.id, registered.id);

        let err = super::login(
            bootstrap.users(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(super::LoginRequest {
                email: "new.seller@example.com".to_string(),
                password: "wrong-password".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(
            err,
            Error::Unauthorized(UnauthorizedType::WrongUsernameOrPassword)
        );
    }

    #[tokio::test]
    #[ignore = "needs a running MongoDB (MONGODB_URI)"]
    async fn test_unique_email() {
        let bootstrap = bootstrap().await;

        let err = super::register(
            bootstrap.users(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(register_request(&bootstrap.user_model().email)),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::MustUniqueError(_));
    }

    #[tokio::test]
    #[ignore = "needs a running MongoDB (MONGODB_URI)"]
    async fn test_suspended_user_cannot_login() {
        let bootstrap = bootstrap().await;

        bootstrap
            .app_state
            .user_collection
            .update_one(
                bson::doc! { "_id": bootstrap.user_id() },
                bson::doc! { "$set": { "is_suspended": true, "suspension_reason": "spam" } },
                None,
            )
            .await
            .unwrap();

        let err = super::login(
            bootstrap.users(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(super::LoginRequest {
                email: bootstrap.user_model().email,
                password: bootstrap.user_password(),
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Suspended(reason) if reason == "spam");
    }

    #[tokio::test]
    #[ignore = "needs a running MongoDB (MONGODB_URI)"]
    async fn test_update_profile_password() {
        let bootstrap = bootstrap().await;

        let err = super::update_profile(
            bootstrap.users(),
            bootstrap.cars(),
            bootstrap.cache(),
            bootstrap.argon(),
            bootstrap.user_access(),
            Json(UpdateProfileRequest {
                current_password: Some("not-it".to_string()),
                new_password: Some("brand-new".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Unauthorized(UnauthorizedType::WrongPassword));

        let Json(user) = super::update_profile(
            bootstrap.users(),
            bootstrap.cars(),
            bootstrap.cache(),
            bootstrap.argon(),
            bootstrap.user_access(),
            Json(UpdateProfileRequest {
                name: Some("Renamed Seller".to_string()),
                phone: Some("9000000000".to_string()),
                current_password: Some(bootstrap.user_password()),
                new_password: Some("brand-new".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(user.name, "Renamed Seller");
        assert_eq!(user.phone, "9000000000");

        super::login(
            bootstrap.users(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(super::LoginRequest {
                email: user.email,
                password: "brand-new".to_string(),
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a running MongoDB (MONGODB_URI)"]
    async fn test_delete_account_removes_cars_and_favorites() {
        let bootstrap = bootstrap().await;
        let buyer = bootstrap.derive("Buyer Person", "buyer@example.com").await;

        let car = bootstrap.create_car("Honda City").await;
        let other = buyer.create_car("Maruti Swift").await;

        crate::api::v1::car::favorite(
            buyer.cars(),
            buyer.cache(),
            buyer.user_access(),
            crate::util::PathObjectId(car.id),
        )
        .await
        .unwrap();
        crate::api::v1::car::favorite(
            bootstrap.cars(),
            bootstrap.cache(),
            bootstrap.user_access(),
            crate::util::PathObjectId(other.id),
        )
        .await
        .unwrap();

        super::delete_account(
            bootstrap.users(),
            bootstrap.cars(),
            bootstrap.cache(),
            bootstrap.user_access(),
        )
        .await
        .unwrap();

        let cars = &bootstrap.app_state.car_collection;
        assert!(cars.get_one_by_id(car.id).await.unwrap().is_none());

        let other = cars.get_one_by_id(other.id).await.unwrap().unwrap();
        assert!(other.favorited_by.is_empty());

        let err = super::profile(State(bootstrap.app_state.user_collection.clone()), bootstrap.user_access())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
    }
}
