use argon2::Argon2;
use axum::{
    extract::{FromRef, FromRequestParts, State},
    http::{request::Parts, StatusCode},
    RequestPartsExt,
};
use bson::{oid::ObjectId, Document};
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    error::{Error, UnauthorizedType},
    extract::{Json, Query},
    mongo_ext::{is_duplicate_key, Collection},
    util::{
        hash_password, now, search_filter, verify_password, FormattedDateTime, ObjectIdString,
        PathObjectId,
    },
};

use super::{
    admin::{parse_flag, DeletedResponse, Permission, StaffRole},
    auth::{normalize_email, validate_name, MessageResponse},
    superadmin_auth::CurrentSuperAdmin,
    token::{generate_access_token, Access, AccountType, JwtState},
};

#[derive(Clone)]
pub struct AdminCollection(pub Collection<AdminModel>);

impl std::ops::Deref for AdminCollection {
    type Target = Collection<AdminModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdminModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub name: String,
    pub email: String,
    pub password: String,

    pub role: StaffRole,
    pub permissions: Vec<Permission>,
    pub created_by: ObjectId,

    pub is_active: bool,
    #[serde(default)]
    pub last_login: Option<bson::DateTime>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

/// Staff account as returned by the auth routes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StaffProfile {
    pub id: ObjectIdString,
    pub name: String,
    pub email: String,
    pub role: StaffRole,
    pub permissions: Vec<Permission>,
    pub created_by: Option<ObjectIdString>,
    pub is_active: bool,
    pub last_login: Option<FormattedDateTime>,
    pub created_at: FormattedDateTime,
}

impl From<AdminModel> for StaffProfile {
    fn from(value: AdminModel) -> Self {
        Self {
            id: value.id.into(),
            name: value.name,
            email: value.email,
            role: value.role,
            permissions: value.permissions,
            created_by: Some(value.created_by.into()),
            is_active: value.is_active,
            last_login: value.last_login.map(Into::into),
            created_at: value.created_at.into(),
        }
    }
}

/// The calling admin's document. Superadmin and user tokens are refused.
#[derive(Debug, Clone)]
pub struct CurrentAdmin(pub AdminModel);

impl CurrentAdmin {
    pub async fn from_access(access: Access, admins: &AdminCollection) -> Result<Self, Error> {
        let access = access.require(AccountType::Admin)?;

        let admin = admins
            .get_one_by_id(access.id)
            .await?
            .ok_or(Error::ResourceNotFound("Admin"))?;

        if !admin.is_active {
            return Err(Error::AccountDisabled)
                .tap_err(|_| tracing::debug!("disabled admin {}", admin.id));
        }

        Ok(Self(admin))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentAdmin
where
    JwtState: FromRef<S>,
    AdminCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let access = parts.extract_with_state::<Access, _>(state).await?;
        let admins = AdminCollection::from_ref(state);

        Self::from_access(access, &admins).await
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StaffLoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StaffLoginResponse {
    pub token: String,
    pub expired_at: FormattedDateTime,
    pub account: StaffProfile,
}

/// Checks a staff login attempt against the stored account. Disabled accounts
/// are only reported once the password matched.
pub fn check_staff_login(
    argon: &Argon2,
    password: &str,
    account: Option<(&str, bool)>,
) -> Result<(), Error> {
    let result = match account {
        Some((hash, is_active)) if verify_password(argon, password, hash) => {
            if is_active {
                Ok(())
            } else {
                Err(Error::AccountDisabled)
            }
        }
        _ => Err(Error::Unauthorized(
            UnauthorizedType::WrongUsernameOrPassword,
        )),
    };

    result.tap_err(|err| tracing::debug!("staff login refused: {}", err))
}

#[tracing::instrument(skip_all, fields(email = %request.email))]
pub async fn login(
    State(admins): State<AdminCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<StaffLoginRequest>,
) -> Result<Json<StaffLoginResponse>, Error> {
    let admin = admins
        .find_one(bson::doc! { "email": normalize_email(&request.email) }, None)
        .await?;

    check_staff_login(
        &argon,
        &request.password,
        admin.as_ref().map(|it| (it.password.as_str(), it.is_active)),
    )?;

    let admin = admin.ok_or(Error::Unauthorized(
        UnauthorizedType::WrongUsernameOrPassword,
    ))?;

    let admin = admins
        .update_one_by_id_returning(
            admin.id,
            bson::doc! { "$set": { "last_login": now() } },
        )
        .await?
        .ok_or(Error::ResourceNotFound("Admin"))?;

    let token = generate_access_token(&jwt_state, admin.id, &admin.email, AccountType::Admin)?;

    tracing::info!("admin {} logged in", admin.id);

    Ok(Json(StaffLoginResponse {
        token: token.token,
        expired_at: token.expired_at.into(),
        account: admin.into(),
    }))
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct StaffRegisterRequest {
    #[validate(length(min = 2, max = 50), custom = "validate_name")]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 6, max = 50))]
    pub password: String,
}

impl StaffRegisterRequest {
    pub fn normalized(mut self) -> Result<Self, Error> {
        self.name = self.name.trim().to_string();
        self.email = normalize_email(&self.email);
        self.validate()?;

        Ok(self)
    }
}

pub fn map_duplicate_email(err: mongodb::error::Error) -> Error {
    if is_duplicate_key(&err) {
        Error::MustUniqueError("email".to_string())
    } else {
        err.into()
    }
}

#[tracing::instrument(skip_all, fields(superadmin = %superadmin.0.id))]
pub async fn register(
    State(admins): State<AdminCollection>,
    State(argon): State<Argon2<'static>>,
    superadmin: CurrentSuperAdmin,
    Json(request): Json<StaffRegisterRequest>,
) -> Result<(StatusCode, Json<StaffProfile>), Error> {
    let request = request.normalized()?;

    let count = admins
        .count_documents(bson::doc! { "email": &request.email }, None)
        .await?;

    if count > 0 {
        return Err(Error::MustUniqueError("email".to_string()))
            .tap_err(|_| tracing::debug!("admin email already registered"));
    }

    let model = AdminModel {
        id: ObjectId::new(),
        name: request.name,
        email: request.email,
        password: hash_password(&argon, &request.password)?,
        role: StaffRole::Moderator,
        permissions: Permission::moderator_defaults(),
        created_by: superadmin.0.id,
        is_active: true,
        last_login: None,
        created_at: now(),
        updated_at: now(),
    };

    admins
        .insert_one(&model, None)
        .await
        .map_err(map_duplicate_email)?;

    tracing::info!("admin {} registered", model.id);

    Ok((StatusCode::CREATED, Json(model.into())))
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AdminListQuery {
    pub search: Option<String>,
    pub active: Option<String>,
}

impl AdminListQuery {
    pub fn to_document(&self) -> Document {
        let mut filter = match self.search.as_deref().filter(|it| !it.trim().is_empty()) {
            Some(search) => search_filter(search, &["name", "email"]),
            None => Document::new(),
        };

        if let Some(active) = parse_flag(self.active.as_deref()) {
            filter.insert("is_active", active);
        }

        filter
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdminsResponse {
    pub count: usize,
    pub admins: Vec<StaffProfile>,
}

pub async fn all(
    State(admins): State<AdminCollection>,
    _superadmin: CurrentSuperAdmin,
    Query(query): Query<AdminListQuery>,
) -> Result<Json<AdminsResponse>, Error> {
    let items = admins.find_newest_first(query.to_document()).await?;

    Ok(Json(AdminsResponse {
        count: items.len(),
        admins: items.into_iter().map(Into::into).collect(),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdminStatusResponse {
    pub message: String,
    pub admin: StaffProfile,
}

async fn set_active(
    admins: &AdminCollection,
    admin_id: ObjectId,
    is_active: bool,
) -> Result<AdminModel, Error> {
    admins
        .update_one_by_id_returning(
            admin_id,
            bson::doc! { "$set": { "is_active": is_active, "updated_at": now() } },
        )
        .await?
        .ok_or(Error::ResourceNotFound("Admin"))
}

#[tracing::instrument(skip_all, fields(id = %admin_id, superadmin = %superadmin.0.id))]
pub async fn disable(
    State(admins): State<AdminCollection>,
    superadmin: CurrentSuperAdmin,
    PathObjectId(admin_id): PathObjectId,
) -> Result<Json<AdminStatusResponse>, Error> {
    let admin = set_active(&admins, admin_id, false).await?;

    Ok(Json(AdminStatusResponse {
        message: format!("Admin {} has been disabled", admin.name),
        admin: admin.into(),
    }))
}

#[tracing::instrument(skip_all, fields(id = %admin_id, superadmin = %superadmin.0.id))]
pub async fn restore(
    State(admins): State<AdminCollection>,
    superadmin: CurrentSuperAdmin,
    PathObjectId(admin_id): PathObjectId,
) -> Result<Json<AdminStatusResponse>, Error> {
    let admin = set_active(&admins, admin_id, true).await?;

    Ok(Json(AdminStatusResponse {
        message: format!("Admin {} has been restored", admin.name),
        admin: admin.into(),
    }))
}

#[tracing::instrument(skip_all, fields(id = %admin_id, superadmin = %superadmin.0.id))]
pub async fn delete_permanently(
    State(admins): State<AdminCollection>,
    superadmin: CurrentSuperAdmin,
    PathObjectId(admin_id): PathObjectId,
) -> Result<Json<DeletedResponse>, Error> {
    if !admins.delete_one_by_id(admin_id).await? {
        return Err(Error::ResourceNotFound("Admin"));
    }

    tracing::info!("admin {} permanently deleted", admin_id);

    Ok(Json(DeletedResponse {
        message: "Admin has been permanently deleted".to_string(),
        id: admin_id.into(),
    }))
}

pub async fn me(CurrentAdmin(admin): CurrentAdmin) -> Json<StaffProfile> {
    Json(admin.into())
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct ChangePasswordRequest {
    pub current_password: String,

    #[validate(length(min = 6, max = 50))]
    pub new_password: String,
}

impl ChangePasswordRequest {
    /// Returns the hash to store once the current password checks out.
    pub fn rehash(&self, argon: &Argon2, stored_hash: &str) -> Result<String, Error> {
        self.validate()?;

        if !verify_password(argon, &self.current_password, stored_hash) {
            return Err(Error::Unauthorized(UnauthorizedType::WrongPassword))
                .tap_err(|_| tracing::debug!("wrong current password"));
        }

        hash_password(argon, &self.new_password)
    }
}

#[tracing::instrument(skip_all, fields(admin = %admin.id))]
pub async fn change_password(
    State(admins): State<AdminCollection>,
    State(argon): State<Argon2<'static>>,
    CurrentAdmin(admin): CurrentAdmin,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, Error> {
    let password = request.rehash(&argon, &admin.password)?;

    admins
        .update_one(
            bson::doc! { "_id": admin.id },
            bson::doc! { "$set": { "password": password, "updated_at": now() } },
            None,
        )
        .await?;

    Ok(Json(MessageResponse::new("Password changed successfully")))
}

#[cfg(test)]
mod tests {
    use argon2::Argon2;
    use assert_matches::assert_matches;
    use axum::http::StatusCode;

    use super::{AdminListQuery, ChangePasswordRequest, StaffLoginRequest, StaffRegisterRequest};
    use crate::{
        api::v1::{
            admin::{Permission, StaffRole},
            tests::bootstrap,
        },
        error::{Error, UnauthorizedType},
        extract::{Json, Query},
        util::{hash_password, PathObjectId},
    };

    #[test]
    fn test_check_staff_login() {
        let argon = Argon2::default();
        let hash = hash_password(&argon, "secret1").unwrap();

        assert!(super::check_staff_login(&argon, "secret1", Some((&hash, true))).is_ok());
        assert_matches!(
            super::check_staff_login(&argon, "secret1", Some((&hash, false))),
            Err(Error::AccountDisabled)
        );
        assert_matches!(
            super::check_staff_login(&argon, "nope", Some((&hash, false))),
            Err(Error::Unauthorized(UnauthorizedType::WrongUsernameOrPassword))
        );
        assert_matches!(
            super::check_staff_login(&argon, "secret1", None),
            Err(Error::Unauthorized(UnauthorizedType::WrongUsernameOrPassword))
        );
    }

    #[test]
    fn test_change_password_request() {
        let argon = Argon2::default();
        let hash = hash_password(&argon, "secret1").unwrap();

        let request = ChangePasswordRequest {
            current_password: "secret1".to_string(),
            new_password: "short".to_string(),
        };
        assert_matches!(request.rehash(&argon, &hash), Err(Error::ValidationError(_)));

        let request = ChangePasswordRequest {
            current_password: "wrong".to_string(),
            new_password: "longer-secret".to_string(),
        };
        assert_matches!(
            request.rehash(&argon, &hash),
            Err(Error::Unauthorized(UnauthorizedType::WrongPassword))
        );

        let request = ChangePasswordRequest {
            current_password: "secret1".to_string(),
            new_password: "longer-secret".to_string(),
        };
        let rehashed = request.rehash(&argon, &hash).unwrap();
        assert!(crate::util::verify_password(&argon, "longer-secret", &rehashed));
    }

    #[test]
    fn test_admin_list_filter() {
        assert!(AdminListQuery::default().to_document().is_empty());

        let filter = AdminListQuery {
            search: Some("mod".to_string()),
            active: Some("false".to_string()),
        }
        .to_document();
        assert!(filter.contains_key("$or"));
        assert_eq!(filter.get_bool("is_active").unwrap(), false);

        let filter = AdminListQuery {
            search: Some("   ".to_string()),
            active: Some("maybe".to_string()),
        }
        .to_document();
        assert!(filter.is_empty());
    }

    fn register_request(email: &str) -> StaffRegisterRequest {
        StaffRegisterRequest {
            name: "Mod Erator".to_string(),
            email: email.to_string(),
            password: "modpass".to_string(),
        }
    }

    #[test]
    fn test_register_request_normalized() {
        let request = register_request("  Mod@Example.com ").normalized().unwrap();
        assert_eq!(request.email, "mod@example.com");

        let mut request = register_request("mod@example.com");
        request.password = "12345".to_string();
        assert_matches!(request.normalized(), Err(Error::ValidationError(_)));
    }

    #[tokio::test]
    #[ignore = "needs a running MongoDB (MONGODB_URI)"]
    async fn test_admin_lifecycle() {
        let bootstrap = bootstrap().await;
        let superadmin = bootstrap.current_superadmin().await;

        let (status, Json(admin)) = super::register(
            bootstrap.admins(),
            bootstrap.argon(),
            superadmin.clone(),
            Json(register_request("Mod@Example.com")),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(admin.role, StaffRole::Moderator);
        assert_eq!(admin.permissions, Permission::moderator_defaults());
        assert_eq!(admin.created_by, Some(superadmin.0.id.into()));

        let err = super::register(
            bootstrap.admins(),
            bootstrap.argon(),
            superadmin.clone(),
            Json(register_request("mod@example.com")),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::MustUniqueError(_));

        let login = |password: &str| {
            super::login(
                bootstrap.admins(),
                bootstrap.jwt_state(),
                bootstrap.argon(),
                Json(StaffLoginRequest {
                    email: "mod@example.com".to_string(),
                    password: password.to_string(),
                }),
            )
        };

        let Json(logged_in) = login("modpass").await.unwrap();
        assert!(logged_in.account.last_login.is_some());

        super::disable(bootstrap.admins(), superadmin.clone(), PathObjectId(*admin.id))
            .await
            .unwrap();
        assert_matches!(login("modpass").await, Err(Error::AccountDisabled));
        assert_matches!(
            login("wrong").await,
            Err(Error::Unauthorized(UnauthorizedType::WrongUsernameOrPassword))
        );

        let Json(listed) = super::all(
            bootstrap.admins(),
            superadmin.clone(),
            Query(AdminListQuery {
                active: Some("false".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(listed.count, 1);

        super::restore(bootstrap.admins(), superadmin.clone(), PathObjectId(*admin.id))
            .await
            .unwrap();
        login("modpass").await.unwrap();

        super::delete_permanently(bootstrap.admins(), superadmin.clone(), PathObjectId(*admin.id))
            .await
            .unwrap();
        let err = super::delete_permanently(
            bootstrap.admins(),
            superadmin,
            PathObjectId(*admin.id),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::ResourceNotFound("Admin"));
    }

    #[tokio::test]
    #[ignore = "needs a running MongoDB (MONGODB_URI)"]
    async fn test_admin_change_password() {
        let bootstrap = bootstrap().await;
        let admin = bootstrap.current_admin().await;

        let err = super::change_password(
            bootstrap.admins(),
            bootstrap.argon(),
            admin.clone(),
            Json(ChangePasswordRequest {
                current_password: "not-it".to_string(),
                new_password: "changed-pass".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Unauthorized(UnauthorizedType::WrongPassword));

        super::change_password(
            bootstrap.admins(),
            bootstrap.argon(),
            admin.clone(),
            Json(ChangePasswordRequest {
                current_password: bootstrap.staff_password(),
                new_password: "changed-pass".to_string(),
            }),
        )
        .await
        .unwrap();

        super::login(
            bootstrap.admins(),
            bootstrap.jwt_state(),
            bootstrap.argon(),
            Json(StaffLoginRequest {
                email: admin.0.email,
                password: "changed-pass".to_string(),
            }),
        )
        .await
        .unwrap();
    }
}
