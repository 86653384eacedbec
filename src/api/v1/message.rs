use axum::{extract::State, http::StatusCode};
use bson::{oid::ObjectId, Document};
use mongodb::options::{CountOptions, FindOptions};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    error::Error,
    extract::{Json, Path},
    mongo_ext::Collection,
    util::{now, parse_object_id, FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::{
    auth::{CurrentUser, MessageResponse, PublicUser, UserAccess, UserCollection},
    car::CarCollection,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub sender_id: ObjectId,
    pub recipient_id: ObjectId,
    pub car_id: ObjectId,
    pub message: String,

    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<bson::DateTime>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct MessageCollection(pub Collection<MessageModel>);

impl std::ops::Deref for MessageCollection {
    type Target = Collection<MessageModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Filter for every message between `a` and `b` about `car_id`, in either
/// direction.
pub fn between(a: ObjectId, b: ObjectId, car_id: ObjectId) -> Document {
    bson::doc! {
        "car_id": car_id,
        "$or": [
            { "sender_id": a, "recipient_id": b },
            { "sender_id": b, "recipient_id": a },
        ],
    }
}

impl MessageCollection {
    /// Whether `a` and `b` have exchanged at least one message about `car_id`.
    pub async fn exchanged(&self, a: ObjectId, b: ObjectId, car_id: ObjectId) -> Result<bool, Error> {
        let count = self
            .count_documents(between(a, b, car_id), CountOptions::builder().limit(1).build())
            .await?;

        Ok(count > 0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub id: ObjectIdString,

    pub sender_id: ObjectIdString,
    pub recipient_id: ObjectIdString,
    pub car_id: ObjectIdString,
    pub message: String,

    pub is_read: bool,
    pub read_at: Option<FormattedDateTime>,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<MessageModel> for Message {
    fn from(value: MessageModel) -> Self {
        Self {
            id: value.id.into(),

            sender_id: value.sender_id.into(),
            recipient_id: value.recipient_id.into(),
            car_id: value.car_id.into(),
            message: value.message,

            is_read: value.is_read,
            read_at: value.read_at.map(Into::into),

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct SendRequest {
    pub recipient_id: String,
    pub car_id: String,

    #[validate(length(min = 1, max = 2000))]
    pub message: String,
}

#[tracing::instrument(skip_all, fields(user = %user.id))]
pub async fn send(
    State(messages): State<MessageCollection>,
    State(users): State<UserCollection>,
    State(cars): State<CarCollection>,
    CurrentUser(user): CurrentUser,
    Json(mut request): Json<SendRequest>,
) -> Result<(StatusCode, Json<Message>), Error> {
    request.message = request.message.trim().to_string();
    request.validate()?;

    let recipient_id = parse_object_id(&request.recipient_id)?;
    let car_id = parse_object_id(&request.car_id)?;

    if recipient_id == user.id {
        return Err(Error::CustomStr(
            StatusCode::BAD_REQUEST,
            "Cannot send message to yourself",
        ))
        .tap_err(|_| tracing::debug!("tried messaging themselves"));
    }

    cars.get_one_by_id(car_id)
        .await?
        .ok_or(Error::ResourceNotFound("Car"))?;

    users
        .get_one_by_id(recipient_id)
        .await?
        .ok_or(Error::ResourceNotFound("Recipient"))?;

    let model = MessageModel {
        id: ObjectId::new(),
        sender_id: user.id,
        recipient_id,
        car_id,
        message: request.message,
        is_read: false,
        read_at: None,
        created_at: now(),
        updated_at: now(),
    };

    messages.insert_one(&model, None).await?;

    Ok((StatusCode::CREATED, Json(model.into())))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConversationResponse {
    pub other_user: Option<PublicUser>,
    pub car_id: ObjectIdString,
    pub messages: Vec<Message>,
}

pub async fn conversation(
    State(messages): State<MessageCollection>,
    State(users): State<UserCollection>,
    user: UserAccess,
    Path((other_user_id, car_id)): Path<(String, String)>,
) -> Result<Json<ConversationResponse>, Error> {
    let other_user_id = parse_object_id(&other_user_id)?;
    let car_id = parse_object_id(&car_id)?;

    let thread = messages
        .find_vec(
            between(user.id, other_user_id, car_id),
            FindOptions::builder()
                .sort(bson::doc! { "created_at": 1 })
                .build(),
        )
        .await?;

    messages
        .update_many(
            bson::doc! {
                "car_id": car_id,
                "sender_id": other_user_id,
                "recipient_id": user.id,
                "is_read": false,
            },
            bson::doc! { "$set": { "is_read": true, "read_at": now(), "updated_at": now() } },
            None,
        )
        .await?;

    let other_user = users.get_one_by_id(other_user_id).await?.map(Into::into);

    Ok(Json(ConversationResponse {
        other_user,
        car_id: car_id.into(),
        messages: thread.into_iter().map(Into::into).collect(),
    }))
}

/// Groups the caller's messages into one row per (other user, car), newest
/// conversation first.
pub fn conversations_pipeline(user_id: ObjectId) -> Vec<Document> {
    vec![
        bson::doc! {
            "$match": {
                "$or": [{ "sender_id": user_id }, { "recipient_id": user_id }],
            }
        },
        bson::doc! { "$sort": { "created_at": -1 } },
        bson::doc! {
            "$group": {
                "_id": {
                    "other_user_id": {
                        "$cond": [{ "$eq": ["$sender_id", user_id] }, "$recipient_id", "$sender_id"]
                    },
                    "car_id": "$car_id",
                },
                "last_message": { "$first": "$message" },
                "last_message_time": { "$first": "$created_at" },
                "unread_count": {
                    "$sum": {
                        "$cond": [
                            {
                                "$and": [
                                    { "$eq": ["$recipient_id", user_id] },
                                    { "$eq": ["$is_read", false] },
                                ]
                            },
                            1,
                            0,
                        ]
                    }
                },
            }
        },
        bson::doc! { "$sort": { "last_message_time": -1 } },
        bson::doc! {
            "$lookup": {
                "from": "users",
                "localField": "_id.other_user_id",
                "foreignField": "_id",
                "as": "other_user_info",
            }
        },
        bson::doc! {
            "$lookup": {
                "from": "cars",
                "localField": "_id.car_id",
                "foreignField": "_id",
                "as": "car_info",
            }
        },
        bson::doc! {
            "$project": {
                "last_message": 1,
                "last_message_time": 1,
                "unread_count": 1,
                "other_user": {
                    "_id": { "$arrayElemAt": ["$other_user_info._id", 0] },
                    "name": { "$arrayElemAt": ["$other_user_info.name", 0] },
                    "email": { "$arrayElemAt": ["$other_user_info.email", 0] },
                    "phone": { "$arrayElemAt": ["$other_user_info.phone", 0] },
                },
                "car": {
                    "_id": { "$arrayElemAt": ["$car_info._id", 0] },
                    "name": { "$arrayElemAt": ["$car_info.name", 0] },
                    "price": { "$arrayElemAt": ["$car_info.price", 0] },
                    "photo": { "$arrayElemAt": ["$car_info.photo", 0] },
                },
            }
        },
    ]
}

#[derive(Deserialize, Debug)]
pub struct ConversationKey {
    other_user_id: ObjectId,
    car_id: ObjectId,
}

#[derive(Deserialize, Debug)]
pub struct UserSummaryModel {
    #[serde(rename = "_id")]
    id: Option<ObjectId>,
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct CarSummaryModel {
    #[serde(rename = "_id")]
    id: Option<ObjectId>,
    name: Option<String>,
    price: Option<Decimal>,
    photo: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ConversationRow {
    #[serde(rename = "_id")]
    key: ConversationKey,
    last_message: String,
    last_message_time: bson::DateTime,
    unread_count: i64,
    other_user: UserSummaryModel,
    car: CarSummaryModel,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CarSummary {
    pub id: ObjectIdString,
    pub name: String,
    pub price: Decimal,
    pub photo: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConversationSummary {
    pub other_user_id: ObjectIdString,
    pub car_id: ObjectIdString,
    pub other_user: Option<PublicUser>,
    pub car: Option<CarSummary>,
    pub last_message: String,
    pub last_message_time: FormattedDateTime,
    pub unread_count: i64,
}

impl From<ConversationRow> for ConversationSummary {
    fn from(row: ConversationRow) -> Self {
        let other_user = match row.other_user {
            UserSummaryModel {
                id: Some(id),
                name: Some(name),
                email: Some(email),
                phone,
            } => Some(PublicUser {
                id: id.into(),
                name,
                email,
                phone: phone.unwrap_or_default(),
            }),
            _ => None,
        };

        let car = match row.car {
            CarSummaryModel {
                id: Some(id),
                name: Some(name),
                price: Some(price),
                photo,
            } => Some(CarSummary {
                id: id.into(),
                name,
                price,
                photo,
            }),
            _ => None,
        };

        Self {
            other_user_id: row.key.other_user_id.into(),
            car_id: row.key.car_id.into(),
            other_user,
            car,
            last_message: row.last_message,
            last_message_time: row.last_message_time.into(),
            unread_count: row.unread_count,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConversationsResponse {
    pub conversations: Vec<ConversationSummary>,
}

pub async fn conversations(
    State(messages): State<MessageCollection>,
    user: UserAccess,
) -> Result<Json<ConversationsResponse>, Error> {
    let mut cursor = messages
        .aggregate(conversations_pipeline(user.id), None)
        .await?;

    let mut conversations = vec![];

    while cursor.advance().await? {
        let row: ConversationRow = bson::from_document(cursor.deserialize_current()?)?;
        conversations.push(row.into());
    }

    Ok(Json(ConversationsResponse { conversations }))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UnreadCountResponse {
    pub unread_count: u64,
}

pub async fn unread_count(
    State(messages): State<MessageCollection>,
    user: UserAccess,
) -> Result<Json<UnreadCountResponse>, Error> {
    let unread_count = messages
        .count_documents(
            bson::doc! { "recipient_id": user.id, "is_read": false },
            None,
        )
        .await?;

    Ok(Json(UnreadCountResponse { unread_count }))
}

#[tracing::instrument(skip_all, fields(id = %message_id, user = %user.id))]
pub async fn mark_as_read(
    State(messages): State<MessageCollection>,
    user: UserAccess,
    PathObjectId(message_id): PathObjectId,
) -> Result<Json<Message>, Error> {
    let message = messages
        .get_one_by_id(message_id)
        .await?
        .ok_or(Error::ResourceNotFound("Message"))?;

    if message.recipient_id != user.id {
        return Err(Error::Forbidden)
            .tap_err(|_| tracing::debug!("tried marking someone else's message as read"));
    }

    let message = messages
        .update_one_by_id_returning(
            message_id,
            bson::doc! { "$set": { "is_read": true, "read_at": now(), "updated_at": now() } },
        )
        .await?
        .ok_or(Error::ResourceNotFound("Message"))?;

    Ok(Json(message.into()))
}

#[tracing::instrument(skip_all, fields(id = %message_id, user = %user.id))]
pub async fn delete(
    State(messages): State<MessageCollection>,
    user: UserAccess,
    PathObjectId(message_id): PathObjectId,
) -> Result<Json<MessageResponse>, Error> {
    let message = messages
        .get_one_by_id(message_id)
        .await?
        .ok_or(Error::ResourceNotFound("Message"))?;

    if message.sender_id != user.id {
        return Err(Error::Forbidden)
            .tap_err(|_| tracing::debug!("tried deleting a message they did not send"));
    }

    messages.delete_one_by_id(message_id).await?;

    Ok(Json(MessageResponse::new("Message deleted successfully")))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InquiriesResponse {
    pub messages: Vec<Message>,
}

pub async fn car_inquiries(
    State(messages): State<MessageCollection>,
    State(cars): State<CarCollection>,
    user: UserAccess,
    PathObjectId(car_id): PathObjectId,
) -> Result<Json<InquiriesResponse>, Error> {
    let car = cars
        .get_one_by_id(car_id)
        .await?
        .ok_or(Error::ResourceNotFound("Car"))?;

    if car.owner_id != user.id {
        return Err(Error::Forbidden)
            .tap_err(|_| tracing::debug!("tried reading inquiries on someone else's car"));
    }

    let inquiries = messages
        .find_newest_first(bson::doc! { "car_id": car_id })
        .await?;

    Ok(Json(InquiriesResponse {
        messages: inquiries.into_iter().map(Into::into).collect(),
    }))
}
