use std::ops::{Deref, DerefMut};

use bson::{oid::ObjectId, Document};
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument, UpdateModifications},
};
use serde::de::DeserializeOwned;

use crate::{error::Error, util::Page};

pub struct Collection<T>(pub mongodb::Collection<T>);

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Collection<T> {
    type Target = mongodb::Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Collection<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> From<mongodb::Collection<T>> for Collection<T> {
    fn from(value: mongodb::Collection<T>) -> Self {
        Self(value)
    }
}

impl<T> Collection<T>
where
    T: DeserializeOwned + Send + Sync + Unpin,
{
    pub async fn get_one_by_id(&self, id: ObjectId) -> Result<Option<T>, Error> {
        self.find_one(bson::doc! { "_id": id }, None)
            .await
            .map_err(Into::into)
    }

    pub async fn find_vec(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Vec<T>, Error> {
        let mut cursor = self.find(filter, options).await?;

        let mut items = vec![];

        while cursor.advance().await? {
            items.push(cursor.deserialize_current()?);
        }

        Ok(items)
    }

    pub async fn find_newest_first(&self, filter: Document) -> Result<Vec<T>, Error> {
        self.find_vec(
            filter,
            FindOptions::builder()
                .sort(bson::doc! { "created_at": -1 })
                .build(),
        )
        .await
    }

    /// One page of `filter`, newest first, together with the total number of
    /// matching documents.
    pub async fn find_page(&self, filter: Document, page: Page) -> Result<(Vec<T>, u64), Error> {
        let total = self.count_documents(filter.clone(), None).await?;

        let items = self
            .find_vec(
                filter,
                FindOptions::builder()
                    .sort(bson::doc! { "created_at": -1 })
                    .skip(page.skip())
                    .limit(page.limit as i64)
                    .build(),
            )
            .await?;

        Ok((items, total))
    }

    pub async fn update_one_by_id_returning(
        &self,
        id: ObjectId,
        update: impl Into<UpdateModifications>,
    ) -> Result<Option<T>, Error> {
        self.find_one_and_update(
            bson::doc! { "_id": id },
            update,
            FindOneAndUpdateOptions::builder()
                .return_document(ReturnDocument::After)
                .build(),
        )
        .await
        .map_err(Into::into)
    }

    pub async fn delete_one_by_id(&self, id: ObjectId) -> Result<bool, Error> {
        self.delete_one(bson::doc! { "_id": id }, None)
            .await
            .map(|it| it.deleted_count > 0)
            .map_err(Into::into)
    }
}

pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == 11000
    )
}
