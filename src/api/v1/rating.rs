use std::collections::HashMap;

use axum::{extract::State, http::StatusCode};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    error::Error,
    extract::{Json, Path},
    mongo_ext::{is_duplicate_key, Collection},
    util::{now, parse_object_id, FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::{
    auth::{CurrentUser, MessageResponse, UserAccess, UserCollection},
    car::CarCollection,
    message::MessageCollection,
};

/// Why a rating is refused, in the order the checks are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RatingDenial {
    #[error("You cannot rate yourself")]
    RateSelf,

    #[error("Invalid car owner")]
    InvalidCarOwner,

    #[error("You can only rate users you have communicated with")]
    NoConversation,

    #[error("You have already rated this user for this car")]
    AlreadyRated,
}

/// Only a user who exchanged messages with the owner of a car about that car
/// may rate the owner, once per car.
pub fn check_eligibility(
    rater: ObjectId,
    rated: ObjectId,
    car_owner: Option<ObjectId>,
    has_conversation: bool,
    already_rated: bool,
) -> Result<(), RatingDenial> {
    if rater == rated {
        return Err(RatingDenial::RateSelf);
    }

    if car_owner != Some(rated) {
        return Err(RatingDenial::InvalidCarOwner);
    }

    if !has_conversation {
        return Err(RatingDenial::NoConversation);
    }

    if already_rated {
        return Err(RatingDenial::AlreadyRated);
    }

    Ok(())
}

/// Mean of the given scores rounded to one decimal, `0.0` when there are none.
pub fn average_rating(scores: &[i32]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }

    let sum: i64 = scores.iter().map(|it| *it as i64).sum();
    let mean = sum as f64 / scores.len() as f64;

    (mean * 10.0).round() / 10.0
}

pub fn unique_key(rated_by: ObjectId, rated_user: ObjectId, car_id: ObjectId) -> String {
    format!("{rated_by}_{rated_user}_{car_id}")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RatingModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub rated_user: ObjectId,
    pub rated_by: ObjectId,
    pub car_id: ObjectId,

    pub rating: i32,
    #[serde(default)]
    pub comment: String,
    pub unique_key: String,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct RatingCollection(pub Collection<RatingModel>);

impl std::ops::Deref for RatingCollection {
    type Target = Collection<RatingModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Rating {
    pub id: ObjectIdString,

    pub rated_user: ObjectIdString,
    pub rated_by: ObjectIdString,
    pub car_id: ObjectIdString,

    pub rating: i32,
    pub comment: String,

    pub rated_by_name: Option<String>,
    pub car_name: Option<String>,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<RatingModel> for Rating {
    fn from(value: RatingModel) -> Self {
        Self {
            id: value.id.into(),

            rated_user: value.rated_user.into(),
            rated_by: value.rated_by.into(),
            car_id: value.car_id.into(),

            rating: value.rating,
            comment: value.comment,

            rated_by_name: None,
            car_name: None,

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

struct Eligibility {
    car_owner: Option<ObjectId>,
    existing: Option<RatingModel>,
    verdict: Result<(), RatingDenial>,
}

async fn eligibility(
    ratings: &RatingCollection,
    cars: &CarCollection,
    messages: &MessageCollection,
    rater: ObjectId,
    rated: ObjectId,
    car_id: ObjectId,
) -> Result<Eligibility, Error> {
    let car_owner = cars.get_one_by_id(car_id).await?.map(|car| car.owner_id);
    let has_conversation = messages.exchanged(rater, rated, car_id).await?;
    let existing = ratings
        .find_one(
            bson::doc! { "rated_user": rated, "rated_by": rater, "car_id": car_id },
            None,
        )
        .await?;

    let verdict = check_eligibility(rater, rated, car_owner, has_conversation, existing.is_some());

    Ok(Eligibility {
        car_owner,
        existing,
        verdict,
    })
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct CreateRequest {
    pub rated_user_id: String,
    pub car_id: String,

    #[validate(range(min = 1, max = 5))]
    pub rating: i32,

    #[validate(length(max = 500))]
    pub comment: Option<String>,
}

#[tracing::instrument(skip_all, fields(user = %user.id))]
pub async fn create(
    State(ratings): State<RatingCollection>,
    State(cars): State<CarCollection>,
    State(messages): State<MessageCollection>,
    CurrentUser(user): CurrentUser,
    Json(mut request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<Rating>), Error> {
    request.comment = request.comment.map(|it| it.trim().to_string());
    request.validate()?;

    let rated_user = parse_object_id(&request.rated_user_id)?;
    let car_id = parse_object_id(&request.car_id)?;

    let eligibility = eligibility(&ratings, &cars, &messages, user.id, rated_user, car_id).await?;

    match eligibility.verdict {
        Ok(()) => {}
        Err(RatingDenial::InvalidCarOwner) if eligibility.car_owner.is_none() => {
            return Err(Error::ResourceNotFound("Car"))
        }
        Err(denial) => {
            return Err(Error::RatingNotAllowed(denial))
                .tap_err(|_| tracing::debug!("rating refused: {denial}"))
        }
    }

    let model = RatingModel {
        id: ObjectId::new(),
        rated_user,
        rated_by: user.id,
        car_id,
        rating: request.rating,
        comment: request.comment.unwrap_or_default(),
        unique_key: unique_key(user.id, rated_user, car_id),
        created_at: now(),
        updated_at: now(),
    };

    ratings.insert_one(&model, None).await.map_err(|err| {
        if is_duplicate_key(&err) {
            Error::RatingNotAllowed(RatingDenial::AlreadyRated)
        } else {
            err.into()
        }
    })?;

    let mut rating = Rating::from(model);
    rating.rated_by_name = Some(user.name);

    Ok((StatusCode::CREATED, Json(rating)))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AverageResponse {
    pub average_rating: f64,
    pub total_reviews: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserRatingsResponse {
    pub ratings: Vec<Rating>,
    pub average_rating: f64,
    pub total_reviews: usize,
}

pub async fn user_ratings(
    State(ratings): State<RatingCollection>,
    State(users): State<UserCollection>,
    State(cars): State<CarCollection>,
    PathObjectId(user_id): PathObjectId,
) -> Result<Json<UserRatingsResponse>, Error> {
    let models = ratings
        .find_newest_first(bson::doc! { "rated_user": user_id })
        .await?;

    let scores: Vec<i32> = models.iter().map(|it| it.rating).collect();

    let rater_ids: Vec<ObjectId> = models.iter().map(|it| it.rated_by).collect();
    let car_ids: Vec<ObjectId> = models.iter().map(|it| it.car_id).collect();

    let rater_names: HashMap<ObjectId, String> = users
        .find_vec(bson::doc! { "_id": { "$in": rater_ids } }, None)
        .await?
        .into_iter()
        .map(|it| (it.id, it.name))
        .collect();

    let car_names: HashMap<ObjectId, String> = cars
        .find_vec(bson::doc! { "_id": { "$in": car_ids } }, None)
        .await?
        .into_iter()
        .map(|it| (it.id, it.name))
        .collect();

    let ratings: Vec<Rating> = models
        .into_iter()
        .map(|model| {
            let rated_by_name = rater_names.get(&model.rated_by).cloned();
            let car_name = car_names.get(&model.car_id).cloned();

            Rating {
                rated_by_name,
                car_name,
                ..Rating::from(model)
            }
        })
        .collect();

    Ok(Json(UserRatingsResponse {
        total_reviews: ratings.len(),
        average_rating: average_rating(&scores),
        ratings,
    }))
}

pub async fn average(
    State(ratings): State<RatingCollection>,
    PathObjectId(user_id): PathObjectId,
) -> Result<Json<AverageResponse>, Error> {
    let scores: Vec<i32> = ratings
        .find_vec(bson::doc! { "rated_user": user_id }, None)
        .await?
        .into_iter()
        .map(|it| it.rating)
        .collect();

    Ok(Json(AverageResponse {
        average_rating: average_rating(&scores),
        total_reviews: scores.len(),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CanRateResponse {
    pub can_rate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_rating: Option<Rating>,
}

impl CanRateResponse {
    /// The existing rating is only reported when it is the reason for the
    /// denial.
    fn new(verdict: Result<(), RatingDenial>, existing: Option<RatingModel>) -> Self {
        match verdict {
            Ok(()) => Self {
                can_rate: true,
                reason: None,
                existing_rating: None,
            },
            Err(denial) => Self {
                can_rate: false,
                reason: Some(denial.to_string()),
                existing_rating: match denial {
                    RatingDenial::AlreadyRated => existing.map(Into::into),
                    _ => None,
                },
            },
        }
    }
}

pub async fn can_rate(
    State(ratings): State<RatingCollection>,
    State(cars): State<CarCollection>,
    State(messages): State<MessageCollection>,
    user: UserAccess,
    Path((rated_user, car_id)): Path<(String, String)>,
) -> Result<Json<CanRateResponse>, Error> {
    let rated_user = parse_object_id(&rated_user)?;
    let car_id = parse_object_id(&car_id)?;

    let eligibility = eligibility(&ratings, &cars, &messages, user.id, rated_user, car_id).await?;

    Ok(Json(CanRateResponse::new(
        eligibility.verdict,
        eligibility.existing,
    )))
}

#[tracing::instrument(skip_all, fields(id = %rating_id, user = %user.id))]
pub async fn delete(
    State(ratings): State<RatingCollection>,
    user: UserAccess,
    PathObjectId(rating_id): PathObjectId,
) -> Result<Json<MessageResponse>, Error> {
    let rating = ratings
        .get_one_by_id(rating_id)
        .await?
        .ok_or(Error::ResourceNotFound("Rating"))?;

    if rating.rated_by != user.id {
        return Err(Error::Forbidden)
            .tap_err(|_| tracing::debug!("tried deleting someone else's rating"));
    }

    ratings.delete_one_by_id(rating_id).await?;

    Ok(Json(MessageResponse::new("Rating deleted successfully")))
}
