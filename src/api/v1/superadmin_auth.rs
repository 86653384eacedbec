use argon2::Argon2;
use axum::{
    extract::{FromRef, FromRequestParts, State},
    http::{request::Parts, StatusCode},
    RequestPartsExt,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;

use crate::{
    error::{Error, UnauthorizedType},
    extract::Json,
    mongo_ext::Collection,
    util::{hash_password, now},
};

use super::{
    admin::{Permission, StaffRole},
    admin_auth::{
        check_staff_login, map_duplicate_email, ChangePasswordRequest, StaffLoginRequest,
        StaffLoginResponse, StaffProfile, StaffRegisterRequest,
    },
    auth::{normalize_email, MessageResponse},
    token::{generate_access_token, Access, AccountType, JwtState},
};

#[derive(Clone)]
pub struct SuperAdminCollection(pub Collection<SuperAdminModel>);

impl std::ops::Deref for SuperAdminCollection {
    type Target = Collection<SuperAdminModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SuperAdminModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub name: String,
    pub email: String,
    pub password: String,

    pub role: StaffRole,
    pub permissions: Vec<Permission>,

    pub is_active: bool,
    #[serde(default)]
    pub last_login: Option<bson::DateTime>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

impl From<SuperAdminModel> for StaffProfile {
    fn from(value: SuperAdminModel) -> Self {
        Self {
            id: value.id.into(),
            name: value.name,
            email: value.email,
            role: value.role,
            permissions: value.permissions,
            created_by: None,
            is_active: value.is_active,
            last_login: value.last_login.map(Into::into),
            created_at: value.created_at.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CurrentSuperAdmin(pub SuperAdminModel);

impl CurrentSuperAdmin {
    pub async fn from_access(
        access: Access,
        superadmins: &SuperAdminCollection,
    ) -> Result<Self, Error> {
        let access = access.require(AccountType::SuperAdmin)?;

        let superadmin = superadmins
            .get_one_by_id(access.id)
            .await?
            .ok_or(Error::ResourceNotFound("Superadmin"))?;

        if !superadmin.is_active {
            return Err(Error::AccountDisabled)
                .tap_err(|_| tracing::debug!("disabled superadmin {}", superadmin.id));
        }

        Ok(Self(superadmin))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentSuperAdmin
where
    JwtState: FromRef<S>,
    SuperAdminCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let access = parts.extract_with_state::<Access, _>(state).await?;
        let superadmins = SuperAdminCollection::from_ref(state);

        Self::from_access(access, &superadmins).await
    }
}

pub async fn create_superadmin(
    superadmins: &SuperAdminCollection,
    argon: &Argon2<'_>,
    request: StaffRegisterRequest,
) -> Result<SuperAdminModel, Error> {
    let request = request.normalized()?;

    if superadmins
        .count_documents(bson::doc! { "email": &request.email }, None)
        .await?
        > 0
    {
        return Err(Error::MustUniqueError("email".to_string()))
            .tap_err(|_| tracing::debug!("superadmin email {} already taken", request.email));
    }

    if superadmins.count_documents(None, None).await? > 0 {
        return Err(Error::CustomStr(
            StatusCode::FORBIDDEN,
            "Superadmin already exists. Registration is closed.",
        ))
        .tap_err(|_| tracing::debug!("superadmin registration attempted after bootstrap"));
    }

    let model = SuperAdminModel {
        id: ObjectId::new(),
        name: request.name,
        email: request.email,
        password: hash_password(argon, &request.password)?,
        role: StaffRole::SuperAdmin,
        permissions: Permission::all(),
        is_active: true,
        last_login: None,
        created_at: now(),
        updated_at: now(),
    };

    superadmins
        .insert_one(&model, None)
        .await
        .map_err(map_duplicate_email)?;

    Ok(model)
}

#[tracing::instrument(skip_all, fields(email = %request.email))]
pub async fn register(
    State(superadmins): State<SuperAdminCollection>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<StaffRegisterRequest>,
) -> Result<(StatusCode, Json<StaffProfile>), Error> {
    let superadmin = create_superadmin(&superadmins, &argon, request).await?;

    tracing::info!("superadmin {} registered", superadmin.id);

    Ok((StatusCode::CREATED, Json(superadmin.into())))
}

#[tracing::instrument(skip_all, fields(email = %request.email))]
pub async fn login(
    State(superadmins): State<SuperAdminCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<StaffLoginRequest>,
) -> Result<Json<StaffLoginResponse>, Error> {
    let superadmin = superadmins
        .find_one(bson::doc! { "email": normalize_email(&request.email) }, None)
        .await?;

    check_staff_login(
        &argon,
        &request.password,
        superadmin
            .as_ref()
            .map(|it| (it.password.as_str(), it.is_active)),
    )?;

    let superadmin = superadmin.ok_or(Error::Unauthorized(
        UnauthorizedType::WrongUsernameOrPassword,
    ))?;

    let superadmin = superadmins
        .update_one_by_id_returning(
            superadmin.id,
            bson::doc! { "$set": { "last_login": now() } },
        )
        .await?
        .ok_or(Error::ResourceNotFound("Superadmin"))?;

    let token = generate_access_token(
        &jwt_state,
        superadmin.id,
        &superadmin.email,
        AccountType::SuperAdmin,
    )?;

    Ok(Json(StaffLoginResponse {
        token: token.token,
        expired_at: token.expired_at.into(),
        account: superadmin.into(),
    }))
}

pub async fn me(CurrentSuperAdmin(superadmin): CurrentSuperAdmin) -> Json<StaffProfile> {
    Json(superadmin.into())
}

#[tracing::instrument(skip_all, fields(superadmin = %superadmin.id))]
pub async fn change_password(
    State(superadmins): State<SuperAdminCollection>,
    State(argon): State<Argon2<'static>>,
    CurrentSuperAdmin(superadmin): CurrentSuperAdmin,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, Error> {
    let password = request.rehash(&argon, &superadmin.password)?;

    superadmins
        .update_one(
            bson::doc! { "_id": superadmin.id },
            bson::doc! { "$set": { "password": password, "updated_at": now() } },
            None,
        )
        .await?;

    Ok(Json(MessageResponse::new("Password changed successfully")))
}
