use axum::{extract::State, http::StatusCode};
use bson::{oid::ObjectId, Document};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use time::OffsetDateTime;
use validator::{Validate, ValidationError};

use crate::{
    cache::{keys, ttl, Cache},
    error::Error,
    extract::{Json, Query},
    mongo_ext::Collection,
    util::{
        now, sanitize_string, search_filter, DecimalString, FormattedDateTime, ObjectIdString,
        PathObjectId,
    },
};

use super::auth::{CurrentUser, MessageResponse, UserAccess, UserCollection};

pub const MIN_MODEL_YEAR: i32 = 1990;
pub const MAX_PRICE: i64 = 100_000_000;
pub const VALID_SEATS: [i32; 5] = [2, 4, 5, 7, 9];

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuelType {
    Petrol,
    Diesel,
    Electric,
    #[serde(rename = "CNG")]
    Cng,
    Hybrid,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transmission {
    Manual,
    Automatic,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CarModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub name: String,
    pub price: Decimal,
    #[serde(default)]
    pub photo: Option<String>,

    pub owner_id: ObjectId,
    pub owner_email: String,
    #[serde(default)]
    pub owner_phone: String,

    pub model_year: i32,
    pub fuel_type: FuelType,
    pub transmission: Transmission,
    pub kms_driven: i64,
    pub ownership: i32,
    pub seats: i32,
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub favorited_by: Vec<ObjectId>,

    #[serde(default)]
    pub is_removed: bool,
    #[serde(default)]
    pub removal_reason: String,
    #[serde(default)]
    pub removed_at: Option<bson::DateTime>,
    #[serde(default)]
    pub removed_by: Option<ObjectId>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct CarCollection(pub Collection<CarModel>);

impl std::ops::Deref for CarCollection {
    type Target = Collection<CarModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Car {
    pub id: ObjectIdString,

    pub name: String,
    pub price: Decimal,
    pub photo: Option<String>,

    pub owner_id: ObjectIdString,
    pub owner_email: String,
    pub owner_phone: String,

    pub model_year: i32,
    pub fuel_type: FuelType,
    pub transmission: Transmission,
    pub kms_driven: i64,
    pub ownership: i32,
    pub seats: i32,
    pub description: String,

    pub favorited_by: Vec<ObjectIdString>,
    pub favorite_count: usize,

    pub is_removed: bool,
    pub removal_reason: String,
    pub removed_at: Option<FormattedDateTime>,
    pub removed_by: Option<ObjectIdString>,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<CarModel> for Car {
    fn from(car: CarModel) -> Self {
        Self {
            id: car.id.into(),

            name: car.name,
            price: car.price,
            photo: car.photo,

            owner_id: car.owner_id.into(),
            owner_email: car.owner_email,
            owner_phone: car.owner_phone,

            model_year: car.model_year,
            fuel_type: car.fuel_type,
            transmission: car.transmission,
            kms_driven: car.kms_driven,
            ownership: car.ownership,
            seats: car.seats,
            description: car.description,

            favorite_count: car.favorited_by.len(),
            favorited_by: car.favorited_by.into_iter().map(Into::into).collect(),

            is_removed: car.is_removed,
            removal_reason: car.removal_reason,
            removed_at: car.removed_at.map(Into::into),
            removed_by: car.removed_by.map(Into::into),

            created_at: car.created_at.into(),
            updated_at: car.updated_at.into(),
        }
    }
}

pub fn validate_price(price: &DecimalString) -> Result<(), ValidationError> {
    if price.0 > Decimal::ZERO && price.0 <= Decimal::from(MAX_PRICE) {
        Ok(())
    } else {
        Err(ValidationError::new("price_range"))
    }
}

pub fn check_model_year(year: i32) -> Result<(), ValidationError> {
    let latest = OffsetDateTime::now_utc().year() + 1;

    if (MIN_MODEL_YEAR..=latest).contains(&year) {
        Ok(())
    } else {
        Err(ValidationError::new("model_year_range"))
    }
}

pub fn check_seats(seats: i32) -> Result<(), ValidationError> {
    if VALID_SEATS.contains(&seats) {
        Ok(())
    } else {
        Err(ValidationError::new("seats"))
    }
}

fn validate_create_request(request: &CreateCarRequest) -> Result<(), ValidationError> {
    check_model_year(request.model_year)?;
    check_seats(request.seats)
}

fn validate_update_request(request: &UpdateCarRequest) -> Result<(), ValidationError> {
    if let Some(year) = request.model_year {
        check_model_year(year)?;
    }

    if let Some(seats) = request.seats {
        check_seats(seats)?;
    }

    Ok(())
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
#[validate(schema(function = "validate_create_request"))]
pub struct CreateCarRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,

    #[validate(custom = "validate_price")]
    pub price: DecimalString,

    pub photo: Option<String>,

    pub model_year: i32,
    pub fuel_type: FuelType,
    pub transmission: Transmission,

    #[validate(range(min = 0, max = 2000000))]
    pub kms_driven: i64,

    #[validate(range(min = 1, max = 3))]
    pub ownership: i32,

    pub seats: i32,

    #[validate(length(max = 500))]
    pub description: Option<String>,
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone, Default)]
#[validate(schema(function = "validate_update_request"))]
pub struct UpdateCarRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,

    #[validate(custom = "validate_price")]
    pub price: Option<DecimalString>,

    pub photo: Option<String>,

    pub model_year: Option<i32>,
    pub fuel_type: Option<FuelType>,
    pub transmission: Option<Transmission>,

    #[validate(range(min = 0, max = 2000000))]
    pub kms_driven: Option<i64>,

    #[validate(range(min = 1, max = 3))]
    pub ownership: Option<i32>,

    pub seats: Option<i32>,

    #[validate(length(max = 500))]
    pub description: Option<String>,
}

impl UpdateCarRequest {
    fn sanitize(&mut self) {
        self.name = self.name.as_deref().map(sanitize_string);
        self.description = self.description.as_deref().map(sanitize_string);
    }

    fn to_set_document(&self) -> Result<Document, Error> {
        let mut set = bson::doc! { "updated_at": now() };

        if let Some(name) = &self.name {
            set.insert("name", name);
        }
        if let Some(price) = &self.price {
            set.insert("price", bson::to_bson(&price.0)?);
        }
        if let Some(photo) = &self.photo {
            set.insert("photo", photo);
        }
        if let Some(model_year) = self.model_year {
            set.insert("model_year", model_year);
        }
        if let Some(fuel_type) = &self.fuel_type {
            set.insert("fuel_type", bson::to_bson(fuel_type)?);
        }
        if let Some(transmission) = &self.transmission {
            set.insert("transmission", bson::to_bson(transmission)?);
        }
        if let Some(kms_driven) = self.kms_driven {
            set.insert("kms_driven", kms_driven);
        }
        if let Some(ownership) = self.ownership {
            set.insert("ownership", ownership);
        }
        if let Some(seats) = self.seats {
            set.insert("seats", seats);
        }
        if let Some(description) = &self.description {
            set.insert("description", description);
        }

        Ok(set)
    }
}

/// Query string of the public listing.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CarFilters {
    pub search: Option<String>,
    pub fuel_type: Option<FuelType>,
    pub transmission: Option<Transmission>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

impl CarFilters {
    pub fn to_document(&self) -> Result<Document, Error> {
        let mut filter = bson::doc! { "is_removed": { "$ne": true } };

        if let Some(search) = self.search.as_deref().filter(|it| !it.trim().is_empty()) {
            for (key, value) in search_filter(search, &["name", "description"]) {
                filter.insert(key, value);
            }
        }

        if let Some(fuel_type) = &self.fuel_type {
            filter.insert("fuel_type", bson::to_bson(fuel_type)?);
        }

        if let Some(transmission) = &self.transmission {
            filter.insert("transmission", bson::to_bson(transmission)?);
        }

        let mut price = Document::new();
        if let Some(min_price) = self.min_price {
            price.insert("$gte", min_price);
        }
        if let Some(max_price) = self.max_price {
            price.insert("$lte", max_price);
        }
        if !price.is_empty() {
            filter.insert("price", price);
        }

        Ok(filter)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IndexResponse {
    pub cars: Vec<Car>,
}

pub async fn invalidate_listing(cache: &Cache, owner_id: ObjectId) {
    cache.delete_pattern(keys::ALL_CARS_PATTERN).await;
    cache.delete(&keys::user_cars(owner_id)).await;
}

/// Drops every cached view that embeds `car`: the public lists, the owner's
/// list, the detail entry and the favourite lists of everyone who saved it.
pub async fn invalidate_car(cache: &Cache, car: &CarModel) {
    invalidate_listing(cache, car.owner_id).await;
    cache.delete(&keys::car_by_id(car.id)).await;

    for user_id in &car.favorited_by {
        cache.delete(&keys::favorites(*user_id)).await;
    }
}

async fn cached_list(
    cars: &CarCollection,
    cache: &Cache,
    key: &str,
    ttl: std::time::Duration,
    filter: Document,
) -> Result<Vec<Car>, Error> {
    if let Some(cached) = cache.get::<Vec<Car>>(key).await {
        return Ok(cached);
    }

    let result: Vec<Car> = cars
        .find_newest_first(filter)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();

    cache.set(key, &result, ttl).await;

    Ok(result)
}

pub async fn index(
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    Query(filters): Query<CarFilters>,
) -> Result<Json<IndexResponse>, Error> {
    let key = keys::all_cars(&filters);
    let cars = cached_list(&cars, &cache, &key, ttl::CARS_LIST, filters.to_document()?).await?;

    Ok(Json(IndexResponse { cars }))
}

pub async fn show(
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    PathObjectId(car_id): PathObjectId,
) -> Result<Json<Car>, Error> {
    let key = keys::car_by_id(car_id);

    if let Some(car) = cache.get::<Car>(&key).await {
        return Ok(Json(car));
    }

    let car: Car = cars
        .find_one(bson::doc! { "_id": car_id, "is_removed": { "$ne": true } }, None)
        .await?
        .ok_or(Error::ResourceNotFound("Car"))
        .tap_err(|_| tracing::debug!("tried accessing non existing car {car_id}"))?
        .into();

    cache.set(&key, &car, ttl::CAR_DETAIL).await;

    Ok(Json(car))
}

pub async fn mine(
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    user: UserAccess,
) -> Result<Json<IndexResponse>, Error> {
    let cars = cached_list(
        &cars,
        &cache,
        &keys::user_cars(user.id),
        ttl::USER_CARS,
        bson::doc! { "owner_id": user.id },
    )
    .await?;

    Ok(Json(IndexResponse { cars }))
}

#[tracing::instrument(skip_all, fields(user = %user.id))]
pub async fn create(
    State(cars): State<CarCollection>,
    State(users): State<UserCollection>,
    State(cache): State<Cache>,
    CurrentUser(user): CurrentUser,
    Json(mut request): Json<CreateCarRequest>,
) -> Result<(StatusCode, Json<Car>), Error> {
    request.name = sanitize_string(&request.name);
    request.description = request.description.as_deref().map(sanitize_string);
    request.validate()?;

    let model = CarModel {
        id: ObjectId::new(),

        name: request.name,
        price: request.price.into(),
        photo: request.photo.filter(|it| !it.is_empty()),

        owner_id: user.id,
        owner_email: user.email,
        owner_phone: user.phone,

        model_year: request.model_year,
        fuel_type: request.fuel_type,
        transmission: request.transmission,
        kms_driven: request.kms_driven,
        ownership: request.ownership,
        seats: request.seats,
        description: request.description.unwrap_or_default(),

        favorited_by: vec![],

        is_removed: false,
        removal_reason: String::new(),
        removed_at: None,
        removed_by: None,

        created_at: now(),
        updated_at: now(),
    };

    tracing::debug!("creating car {:#?}", model);
    cars.insert_one(&model, None).await?;

    users
        .update_one(
            bson::doc! { "_id": user.id },
            bson::doc! { "$addToSet": { "car_listings": model.id } },
            None,
        )
        .await?;

    invalidate_listing(&cache, user.id).await;

    Ok((StatusCode::CREATED, Json(model.into())))
}

async fn owned_car(cars: &CarCollection, car_id: ObjectId, user: &UserAccess) -> Result<CarModel, Error> {
    let car = cars
        .get_one_by_id(car_id)
        .await?
        .ok_or(Error::ResourceNotFound("Car"))?;

    if car.owner_id != user.id {
        return Err(Error::Forbidden)
            .tap_err(|_| tracing::debug!("user {} does not own car {}", user.id, car_id));
    }

    Ok(car)
}

#[tracing::instrument(skip_all, fields(id = %car_id, user = %user.id))]
pub async fn update(
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    user: UserAccess,
    PathObjectId(car_id): PathObjectId,
    Json(mut request): Json<UpdateCarRequest>,
) -> Result<Json<Car>, Error> {
    owned_car(&cars, car_id, &user).await?;

    request.sanitize();
    request.validate()?;

    let car = cars
        .update_one_by_id_returning(car_id, bson::doc! { "$set": request.to_set_document()? })
        .await?
        .ok_or(Error::ResourceNotFound("Car"))?;

    invalidate_car(&cache, &car).await;

    Ok(Json(car.into()))
}

#[tracing::instrument(skip_all, fields(id = %car_id, user = %user.id))]
pub async fn delete(
    State(cars): State<CarCollection>,
    State(users): State<UserCollection>,
    State(cache): State<Cache>,
    user: UserAccess,
    PathObjectId(car_id): PathObjectId,
) -> Result<Json<MessageResponse>, Error> {
    let car = owned_car(&cars, car_id, &user).await?;

    cars.delete_one_by_id(car_id).await?;

    users
        .update_one(
            bson::doc! { "_id": user.id },
            bson::doc! { "$pull": { "car_listings": car_id } },
            None,
        )
        .await?;

    invalidate_car(&cache, &car).await;

    Ok(Json(MessageResponse::new("Car deleted")))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FavoriteResponse {
    pub car_id: ObjectIdString,
    pub is_favorited: bool,
    pub favorite_count: usize,
}

async fn set_favorite(
    cars: &CarCollection,
    cache: &Cache,
    user: &UserAccess,
    car_id: ObjectId,
    favorite: bool,
) -> Result<FavoriteResponse, Error> {
    let update = if favorite {
        bson::doc! { "$addToSet": { "favorited_by": user.id } }
    } else {
        bson::doc! { "$pull": { "favorited_by": user.id } }
    };

    let car = cars
        .find_one_and_update(
            bson::doc! { "_id": car_id, "is_removed": { "$ne": true } },
            update,
            mongodb::options::FindOneAndUpdateOptions::builder()
                .return_document(mongodb::options::ReturnDocument::After)
                .build(),
        )
        .await?
        .ok_or(Error::ResourceNotFound("Car"))
        .tap_err(|_| tracing::debug!("tried favouriting missing car {car_id}"))?;

    invalidate_car(cache, &car).await;
    cache.delete(&keys::favorites(user.id)).await;

    Ok(FavoriteResponse {
        car_id: car.id.into(),
        is_favorited: favorite,
        favorite_count: car.favorited_by.len(),
    })
}

#[tracing::instrument(skip_all, fields(id = %car_id, user = %user.id))]
pub async fn favorite(
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    user: UserAccess,
    PathObjectId(car_id): PathObjectId,
) -> Result<Json<FavoriteResponse>, Error> {
    set_favorite(&cars, &cache, &user, car_id, true).await.map(Json)
}

#[tracing::instrument(skip_all, fields(id = %car_id, user = %user.id))]
pub async fn unfavorite(
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    user: UserAccess,
    PathObjectId(car_id): PathObjectId,
) -> Result<Json<FavoriteResponse>, Error> {
    set_favorite(&cars, &cache, &user, car_id, false).await.map(Json)
}

pub async fn favorites(
    State(cars): State<CarCollection>,
    State(cache): State<Cache>,
    user: UserAccess,
) -> Result<Json<IndexResponse>, Error> {
    let cars = cached_list(
        &cars,
        &cache,
        &keys::favorites(user.id),
        ttl::FAVORITES,
        bson::doc! { "favorited_by": user.id, "is_removed": { "$ne": true } },
    )
    .await?;

    Ok(Json(IndexResponse { cars }))
}
