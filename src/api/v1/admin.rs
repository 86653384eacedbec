use axum::{
    extract::{FromRef, FromRequestParts, State},
    http::{request::Parts, StatusCode},
    RequestPartsExt,
};
use bson::{oid::ObjectId, Document};
use mongodb::options::FindOptions;
use serde::{Deserialize, Serialize};
use tap::TapFallible;

use crate::{
    cache::Cache,
    error::Error,
    extract::{Json, Query},
    util::{now, search_filter, ObjectIdString, Page, PaginationMeta, PathObjectId},
};

use super::{
    admin_auth::AdminCollection,
    auth::{purge_user, User, UserCollection},
    car::{invalidate_car, Car, CarCollection},
    superadmin_auth::SuperAdminCollection,
    token::{Access, AccountType, JwtState},
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ManageUsers,
    ManageCars,
    ViewAnalytics,
    ManageAdmins,
    ManageSuperadmins,
}

impl Permission {
    pub fn moderator_defaults() -> Vec<Permission> {
        vec![
            Permission::ManageUsers,
            Permission::ManageCars,
            Permission::ViewAnalytics,
        ]
    }

    pub fn all() -> Vec<Permission> {
        vec![
            Permission::ManageUsers,
            Permission::ManageCars,
            Permission::ViewAnalytics,
            Permission::ManageAdmins,
            Permission::ManageSuperadmins,
        ]
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StaffRole {
    Moderator,
    SuperAdmin,
}

/// An admin or superadmin whose account exists and is active.
#[derive(Debug, Clone)]
pub struct StaffAccess {
    pub id: ObjectId,
    pub account_type: AccountType,
    pub permissions: Vec<Permission>,
}

impl StaffAccess {
    pub async fn from_access(
        access: Access,
        admins: &AdminCollection,
        superadmins: &SuperAdminCollection,
    ) -> Result<Self, Error> {
        let (is_active, permissions) = match access.account_type {
            AccountType::Admin => {
                let admin = admins
                    .get_one_by_id(access.id)
                    .await?
                    .ok_or(Error::ResourceNotFound("Admin"))?;
                (admin.is_active, admin.permissions)
            }
            AccountType::SuperAdmin => {
                let superadmin = superadmins
                    .get_one_by_id(access.id)
                    .await?
                    .ok_or(Error::ResourceNotFound("Superadmin"))?;
                (superadmin.is_active, superadmin.permissions)
            }
            AccountType::User => {
                return Err(Error::Forbidden)
                    .tap_err(|_| tracing::debug!("user token used on a staff route"))
            }
        };

        if !is_active {
            return Err(Error::AccountDisabled)
                .tap_err(|_| tracing::debug!("disabled staff account {}", access.id));
        }

        Ok(Self {
            id: access.id,
            account_type: access.account_type,
            permissions,
        })
    }

    pub fn require(&self, permission: Permission) -> Result<(), Error> {
        if self.permissions.contains(&permission) {
            Ok(())
        } else {
            Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("staff {} lacks {:?}", self.id, permission))
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for StaffAccess
where
    JwtState: FromRef<S>,
    AdminCollection: FromRef<S>,
    SuperAdminCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let access = parts.extract_with_state::<Access, _>(state).await?;

        let admins = AdminCollection::from_ref(state);
        let superadmins = SuperAdminCollection::from_ref(state);

        Self::from_access(access, &admins, &superadmins).await
    }
}

/// `"true"` and `"false"` select; anything else leaves the flag unfiltered.
pub fn parse_flag(value: Option<&str>) -> Option<bool> {
    match value {
        Some("true") => Some(true),
        Some("false") => Some(false),
        _ => None,
    }
}

fn list_filter(search: Option<&str>, fields: &[&str], flag: &str, value: Option<bool>) -> Document {
    let mut filter = match search.filter(|it| !it.trim().is_empty()) {
        Some(search) => search_filter(search, fields),
        None => Document::new(),
    };

    match value {
        Some(true) => {
            filter.insert(flag, true);
        }
        Some(false) => {
            filter.insert(flag, bson::doc! { "$ne": true });
        }
        None => {}
    }

    filter
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UserListQuery {
    pub search: Option<String>,
    pub suspended: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl UserListQuery {
    pub fn to_document(&self) -> Document {
        list_filter(
            self.search.as_deref(),
            &["name", "email"],
            "is_suspended",
            parse_flag(self.suspended.as_deref()),
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CarListQuery {
    pub search: Option<String>,
    pub removed: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl CarListQuery {
    pub fn to_document(&self) -> Document {
        list_filter(
            self.search.as_deref(),
            &["name", "description"],
            "is_removed",
            parse_flag(self.removed.as_deref()),
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UsersPage {
    pub users: Vec<User>,
    pub pagination: PaginationMeta,
}

pub async fn users(
    State(users): State<UserCollection>,
    staff: StaffAccess,
    Query(query): Query<UserListQuery>,
) -> Result<Json<UsersPage>, Error> {
    staff.require(Permission::ManageUsers)?;

    let page = Page::parse(query.page.as_deref(), query.limit.as_deref());
    let (items, total) = users.find_page(query.to_document(), page).await?;

    Ok(Json(UsersPage {
        users: items.into_iter().map(Into::into).collect(),
        pagination: page.meta(total),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReasonRequest {
    pub reason: Option<String>,
}

impl ReasonRequest {
    fn required(self, message: &'static str) -> Result<String, Error> {
        self.reason
            .map(|it| it.trim().to_string())
            .filter(|it| !it.is_empty())
            .ok_or(Error::CustomStr(StatusCode::BAD_REQUEST, message))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserModerationResponse {
    pub message: String,
    pub user: User,
}

#[tracing::instrument(skip_all, fields(id = %user_id, staff = %staff.id))]
pub async fn suspend_user(
    State(users): State<UserCollection>,
    staff: StaffAccess,
    PathObjectId(user_id): PathObjectId,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<UserModerationResponse>, Error> {
    staff.require(Permission::ManageUsers)?;
    let reason = request.required("Suspension reason required")?;

    let user = users
        .update_one_by_id_returning(
            user_id,
            bson::doc! {
                "$set": {
                    "is_suspended": true,
                    "suspension_reason": &reason,
                    "suspended_at": now(),
                    "updated_at": now(),
                }
            },
        )
        .await?
        .ok_or(Error::ResourceNotFound("User"))?;

    tracing::info!("user {} suspended: {}", user_id, reason);

    Ok(Json(UserModerationResponse {
        message: format!("User {} has been suspended", user.name),
        user: user.into(),
    }))
}

#[tracing::instrument(skip_all, fields(id = %user_id, staff = %staff.id))]
pub async fn unsuspend_user(
    State(users): State<UserCollection>,
    staff: StaffAccess,
    PathObjectId(user_id): PathObjectId,
) -> Result<Json<UserModerationResponse>, Error> {
    staff.require(Permission::ManageUsers)?;

    let user = users
        .update_one_by_id_returning(
            user_id,
            bson::doc! {
                "$set": {
                    "is_suspended": false,
                    "suspension_reason": "",
                    "suspended_at": bson::Bson::Null,
                    "updated_at": now(),
                }
            },
        )
        .await?
        .ok_or(Error::ResourceNotFound("User"))?;

    Ok(Json(UserModerationResponse {
        message: format!("User {} has been unsuspended", user.name),
        user: user.into(),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeletedResponse {
    pub message: String,
    pub id: ObjectIdString,
}

#[tracing::instrument(skip_all, fields(id = %user_id, staff = %staff.id))]
pub async fn delete_user_permanently(
    State(users): State<UserCollection>,
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    staff: StaffAccess,
    PathObjectId(user_id): PathObjectId,
) -> Result<Json<DeletedResponse>, Error> {
    staff.require(Permission::ManageUsers)?;

    if !purge_user(&users, &cars, &cache, user_id).await? {
        return Err(Error::ResourceNotFound("User"));
    }

    tracing::info!("user {} permanently deleted", user_id);

    Ok(Json(DeletedResponse {
        message: "User has been permanently deleted from the system".to_string(),
        id: user_id.into(),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CarsPage {
    pub cars: Vec<Car>,
    pub pagination: PaginationMeta,
}

pub async fn cars(
    State(cars): State<CarCollection>,
    staff: StaffAccess,
    Query(query): Query<CarListQuery>,
) -> Result<Json<CarsPage>, Error> {
    staff.require(Permission::ManageCars)?;

    let page = Page::parse(query.page.as_deref(), query.limit.as_deref());
    let (items, total) = cars.find_page(query.to_document(), page).await?;

    Ok(Json(CarsPage {
        cars: items.into_iter().map(Into::into).collect(),
        pagination: page.meta(total),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CarModerationResponse {
    pub message: String,
    pub car: Car,
}

#[tracing::instrument(skip_all, fields(id = %car_id, staff = %staff.id))]
pub async fn remove_car(
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    staff: StaffAccess,
    PathObjectId(car_id): PathObjectId,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<CarModerationResponse>, Error> {
    staff.require(Permission::ManageCars)?;
    let reason = request.required("Removal reason required")?;

    let car = cars
        .update_one_by_id_returning(
            car_id,
            bson::doc! {
                "$set": {
                    "is_removed": true,
                    "removal_reason": &reason,
                    "removed_at": now(),
                    "removed_by": staff.id,
                    "updated_at": now(),
                }
            },
        )
        .await?
        .ok_or(Error::ResourceNotFound("Car"))?;

    invalidate_car(&cache, &car).await;

    tracing::info!("car {} removed: {}", car_id, reason);

    Ok(Json(CarModerationResponse {
        message: format!("Car listing \"{}\" has been removed", car.name),
        car: car.into(),
    }))
}

#[tracing::instrument(skip_all, fields(id = %car_id, staff = %staff.id))]
pub async fn restore_car(
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    staff: StaffAccess,
    PathObjectId(car_id): PathObjectId,
) -> Result<Json<CarModerationResponse>, Error> {
    staff.require(Permission::ManageCars)?;

    let car = cars
        .update_one_by_id_returning(
            car_id,
            bson::doc! {
                "$set": {
                    "is_removed": false,
                    "removal_reason": "",
                    "removed_at": bson::Bson::Null,
                    "removed_by": bson::Bson::Null,
                    "updated_at": now(),
                }
            },
        )
        .await?
        .ok_or(Error::ResourceNotFound("Car"))?;

    invalidate_car(&cache, &car).await;

    Ok(Json(CarModerationResponse {
        message: format!("Car listing \"{}\" has been restored", car.name),
        car: car.into(),
    }))
}

#[tracing::instrument(skip_all, fields(id = %car_id, staff = %staff.id))]
pub async fn delete_car_permanently(
    State(cars): State<CarCollection>,
    State(users): State<UserCollection>,
    State(cache): State<Cache>,
    staff: StaffAccess,
    PathObjectId(car_id): PathObjectId,
) -> Result<Json<DeletedResponse>, Error> {
    staff.require(Permission::ManageCars)?;

    let car = cars
        .get_one_by_id(car_id)
        .await?
        .ok_or(Error::ResourceNotFound("Car"))?;

    cars.delete_one_by_id(car_id).await?;

    users
        .update_one(
            bson::doc! { "_id": car.owner_id },
            bson::doc! { "$pull": { "car_listings": car_id } },
            None,
        )
        .await?;

    invalidate_car(&cache, &car).await;

    Ok(Json(DeletedResponse {
        message: "Car listing has been permanently deleted from the system".to_string(),
        id: car_id.into(),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserStats {
    pub total: u64,
    pub active: u64,
    pub suspended: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CarStats {
    pub total: u64,
    pub active: u64,
    pub removed: u64,
}

#[derive(Deserialize, Debug, Default)]
struct PriceStatsRow {
    avg_price: Option<f64>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    total_price: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PricingStats {
    pub average: i64,
    pub minimum: f64,
    pub maximum: f64,
    pub hypothetical_revenue: i64,
}

impl From<PriceStatsRow> for PricingStats {
    fn from(row: PriceStatsRow) -> Self {
        Self {
            average: row.avg_price.unwrap_or_default().round() as i64,
            minimum: row.min_price.unwrap_or_default(),
            maximum: row.max_price.unwrap_or_default(),
            hypothetical_revenue: row.total_price.unwrap_or_default().round() as i64,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FuelTypeCount {
    #[serde(rename(deserialize = "_id"))]
    pub fuel_type: Option<String>,
    pub count: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecentActivity {
    pub users: Vec<User>,
    pub cars: Vec<Car>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AnalyticsResponse {
    pub users: UserStats,
    pub cars: CarStats,
    pub pricing: PricingStats,
    pub cars_by_fuel_type: Vec<FuelTypeCount>,
    pub recent_activity: RecentActivity,
}

fn active_cars() -> Document {
    bson::doc! { "is_removed": { "$ne": true } }
}

pub fn price_stats_pipeline() -> Vec<Document> {
    vec![
        bson::doc! { "$match": active_cars() },
        bson::doc! {
            "$group": {
                "_id": bson::Bson::Null,
                "avg_price": { "$avg": "$price" },
                "min_price": { "$min": "$price" },
                "max_price": { "$max": "$price" },
                "total_price": { "$sum": "$price" },
            }
        },
    ]
}

pub fn fuel_type_pipeline() -> Vec<Document> {
    vec![
        bson::doc! { "$match": active_cars() },
        bson::doc! { "$group": { "_id": "$fuel_type", "count": { "$sum": 1 } } },
        bson::doc! { "$sort": { "count": -1 } },
    ]
}

pub async fn analytics(
    State(users): State<UserCollection>,
    State(cars): State<CarCollection>,
    staff: StaffAccess,
) -> Result<Json<AnalyticsResponse>, Error> {
    staff.require(Permission::ViewAnalytics)?;

    let total_users = users.count_documents(None, None).await?;
    let suspended_users = users
        .count_documents(bson::doc! { "is_suspended": true }, None)
        .await?;

    let total_cars = cars.count_documents(None, None).await?;
    let removed_cars = cars
        .count_documents(bson::doc! { "is_removed": true }, None)
        .await?;

    let mut cursor = cars.aggregate(price_stats_pipeline(), None).await?;
    let price_stats = if cursor.advance().await? {
        bson::from_document::<PriceStatsRow>(cursor.deserialize_current()?)?
    } else {
        PriceStatsRow::default()
    };

    let mut cursor = cars.aggregate(fuel_type_pipeline(), None).await?;
    let mut cars_by_fuel_type = vec![];
    while cursor.advance().await? {
        cars_by_fuel_type.push(bson::from_document::<FuelTypeCount>(
            cursor.deserialize_current()?,
        )?);
    }

    let options = FindOptions::builder()
        .sort(bson::doc! { "created_at": -1 })
        .limit(5)
        .build();

    let recent_users = users.find_vec(Document::new(), options.clone()).await?;
    let recent_cars = cars.find_vec(active_cars(), options).await?;

    Ok(Json(AnalyticsResponse {
        users: UserStats {
            total: total_users,
            active: total_users.saturating_sub(suspended_users),
            suspended: suspended_users,
        },
        cars: CarStats {
            total: total_cars,
            active: total_cars.saturating_sub(removed_cars),
            removed: removed_cars,
        },
        pricing: price_stats.into(),
        cars_by_fuel_type,
        recent_activity: RecentActivity {
            users: recent_users.into_iter().map(Into::into).collect(),
            cars: recent_cars.into_iter().map(Into::into).collect(),
        },
    }))
}
