use std::collections::HashSet;

use bson::{oid::ObjectId, Document};
use mongodb::{options::IndexOptions, IndexModel};
use serde::{Deserialize, Serialize};

use crate::{app::AppState, mongo_ext::Collection};

#[derive(Serialize, Deserialize)]
pub struct MigrateModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub version: i64,
    pub applied_at: bson::DateTime,
}

#[derive(Clone)]
pub struct MigrationCollection(pub Collection<MigrateModel>);

impl std::ops::Deref for MigrationCollection {
    type Target = Collection<MigrateModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MigrationCollection {
    pub async fn insert_version(&self, version: i64) -> Result<(), mongodb::error::Error> {
        self.insert_one(
            MigrateModel {
                id: ObjectId::new(),
                version,
                applied_at: bson::DateTime::now(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn applied_versions(&self) -> Result<HashSet<i64>, mongodb::error::Error> {
        let mut cursor = self.find(None, None).await?;

        let mut versions = HashSet::new();

        while cursor.advance().await? {
            versions.insert(cursor.deserialize_current()?.version);
        }

        Ok(versions)
    }
}

fn index(keys: Document, unique: bool) -> IndexModel {
    let model = IndexModel::builder().keys(keys);

    if unique {
        model
            .options(IndexOptions::builder().unique(true).build())
            .build()
    } else {
        model.build()
    }
}

impl AppState {
    async fn v1_migrate(&self) -> Result<(), mongodb::error::Error> {
        self.migration_collection
            .create_index(index(bson::doc! { "version": 1 }, true), None)
            .await?;

        self.user_collection
            .create_indexes(
                [
                    index(bson::doc! { "email": 1 }, true),
                    index(bson::doc! { "created_at": -1 }, false),
                ],
                None,
            )
            .await?;

        self.car_collection
            .create_indexes(
                [
                    index(bson::doc! { "created_at": -1 }, false),
                    index(bson::doc! { "owner_id": 1 }, false),
                ],
                None,
            )
            .await?;

        self.message_collection
            .create_indexes(
                [
                    index(
                        bson::doc! { "sender_id": 1, "recipient_id": 1, "car_id": 1 },
                        false,
                    ),
                    index(bson::doc! { "recipient_id": 1, "is_read": 1 }, false),
                ],
                None,
            )
            .await?;

        self.rating_collection
            .create_indexes(
                [
                    index(bson::doc! { "unique_key": 1 }, true),
                    index(bson::doc! { "rated_user": 1 }, false),
                ],
                None,
            )
            .await?;

        self.admin_collection
            .create_index(index(bson::doc! { "email": 1 }, true), None)
            .await?;

        self.superadmin_collection
            .create_index(index(bson::doc! { "email": 1 }, true), None)
            .await?;

        Ok(())
    }

    /// Documents written before phone numbers and moderation existed.
    async fn v2_migrate(&self) -> Result<(), mongodb::error::Error> {
        let users = self
            .user_collection
            .update_many(
                bson::doc! { "phone": { "$exists": false } },
                bson::doc! { "$set": { "phone": "" } },
                None,
            )
            .await?;

        let cars = self
            .car_collection
            .update_many(
                bson::doc! { "is_removed": { "$exists": false } },
                bson::doc! { "$set": { "is_removed": false } },
                None,
            )
            .await?;

        tracing::info!(
            "backfilled {} users and {} cars",
            users.modified_count,
            cars.modified_count
        );

        Ok(())
    }

    pub async fn run_migration(&self) -> Result<(), mongodb::error::Error> {
        let applied = self.migration_collection.applied_versions().await?;

        macro_rules! migrate {
            ($version:expr, $fun:ident) => {
                if !applied.contains(&$version) {
                    tracing::debug!("running migration version {}", $version);
                    self.$fun().await?;
                    self.migration_collection.insert_version($version).await?;
                }
            };
        }

        migrate!(1, v1_migrate);
        migrate!(2, v2_migrate);

        Ok(())
    }
}
