use bson::{Bson, Document};
use futures::TryStreamExt;
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::{Client, Collection, IndexModel};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::common::error::Result;
use crate::common::model::Class;
use crate::common::utils::{local_time, to_bson_document};
use crate::dao::builders::{
    FIND_LIMIT, MAX_AWAIT_TIME, MAX_TIME, TextQuery, brief_text_index, class_sort,
    count_by_name_pipeline, insert_events_pipeline, max_years_by_name_pipeline, text_score_projection,
};
use crate::datasource::DataSource;
use crate::storage::{SessionProvider, UpdateOutcome};
use crate::txn::context::CallContext;
use crate::txn::transaction::TransactionalMutation;

/// Transactional writes to the class collection
pub struct ClassRepository<P: SessionProvider> {
    collection: String,
    mutation: TransactionalMutation<P>,
}

impl<P: SessionProvider> ClassRepository<P> {
    pub fn new(collection: impl Into<String>, mutation: TransactionalMutation<P>) -> Self {
        ClassRepository {
            collection: collection.into(),
            mutation,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Insert a class in its own transaction; returns the generated id
    pub async fn add_class_with_transaction(&self, ctx: &CallContext, class: &Class) -> Result<Bson> {
        class.validate()?;
        let document = to_bson_document(class)?;
        let id = self.mutation.insert(ctx, &self.collection, document).await?;
        debug!("Inserted class {} as {}", class.class_id, id);
        Ok(id)
    }

    /// Update every match of `filter`, inserting one when nothing matches
    pub async fn update_class(&self, ctx: &CallContext, filter: Document, update: Document) -> Result<UpdateOutcome> {
        let outcome = self
            .mutation
            .update_many(ctx, &self.collection, filter, update, true)
            .await?;
        info!(
            "matched: {}  modified: {}  upserted: {}  upsertedID: {:?}",
            outcome.matched_count,
            outcome.modified_count,
            outcome.upserted_count(),
            outcome.upserted_id,
        );
        Ok(outcome)
    }

    /// Delete every match of `filter` in its own transaction
    pub async fn delete_class_with_transaction(&self, ctx: &CallContext, filter: Document) -> Result<u64> {
        let deleted = self.mutation.delete_many(ctx, &self.collection, filter).await?;
        info!("delete count: {}", deleted);
        Ok(deleted)
    }
}

/// Direct (non-transactional) reads and admin calls against MongoDB
pub struct ClassQueries {
    client: Client,
    collection: Collection<Document>,
}

impl ClassQueries {
    pub fn new(source: &DataSource) -> Self {
        ClassQueries {
            client: source.client().clone(),
            collection: source.collection(),
        }
    }

    pub async fn add_class(&self, class: &Class) -> Result<Bson> {
        class.validate()?;
        let document = to_bson_document(class)?;
        let result = self.collection.insert_one(document).await?;
        Ok(result.inserted_id)
    }

    /// Newest classes first, at most 50; undecodable documents are skipped
    pub async fn find_class_by_filter(&self, filter: Document) -> Result<Vec<Class>> {
        let mut cursor = self
            .collection
            .find(filter)
            .sort(class_sort())
            .limit(FIND_LIMIT)
            .await?;

        let mut classes = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            let id = document.get("_id").cloned();
            match bson::from_document::<Class>(document) {
                Ok(class) => {
                    if let Some(created) = class.id.as_ref().and_then(local_time) {
                        debug!("class {} created at {}", class.class_id, created);
                    }
                    classes.push(class);
                }
                Err(e) => warn!("skipping class document {:?}: {}", id, e),
            }
        }
        Ok(classes)
    }

    /// Distinct class ids among the matches of `filter`
    pub async fn distinct_class(&self, filter: Document) -> Result<Vec<Bson>> {
        self.distinct("classid", filter).await
    }

    pub async fn distinct(&self, field: &str, filter: Document) -> Result<Vec<Bson>> {
        let values = self.collection.distinct(field, filter).max_time(MAX_TIME).await?;
        Ok(values)
    }

    /// Delete without a transaction; no match is not an error
    pub async fn delete_class(&self, filter: Document) -> Result<u64> {
        let result = self.collection.delete_many(filter).await?;
        info!("delete count: {}", result.deleted_count);
        Ok(result.deleted_count)
    }

    pub async fn count_class(&self, filter: Document) -> Result<u64> {
        Ok(self.collection.count_documents(filter).await?)
    }

    /// Highest `years` per class name
    pub async fn aggregate_max_years(&self) -> Result<Vec<Document>> {
        self.aggregate(max_years_by_name_pipeline()).await
    }

    /// Number of classes per class name
    pub async fn aggregate_count_by_name(&self) -> Result<Vec<Document>> {
        self.aggregate(count_by_name_pipeline()).await
    }

    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let cursor = self.collection.aggregate(pipeline).max_time(MAX_TIME).await?;
        Ok(cursor.try_collect().await?)
    }

    /// Create the text index on `brief`; returns the index names
    pub async fn create_indexes(&self) -> Result<Vec<String>> {
        let result = self
            .collection
            .create_indexes(vec![brief_text_index()])
            .max_time(MAX_TIME)
            .await?;
        info!("created indexes {:?}", result.index_names);
        Ok(result.index_names)
    }

    pub async fn list_indexes(&self) -> Result<Vec<IndexModel>> {
        let cursor = self.collection.list_indexes().await?;
        Ok(cursor.try_collect().await?)
    }

    /// Full-text search; each returned document carries its `score`
    pub async fn find_by_full_text(&self, query: &TextQuery) -> Result<Vec<Document>> {
        let cursor = self
            .collection
            .find(query.filter())
            .projection(text_score_projection())
            .await?;
        Ok(cursor.try_collect().await?)
    }

    /// Follow insert events across the deployment until `max_events` have
    /// been seen (or forever). Requires a replica set or sharded cluster.
    pub async fn watch_inserts<F>(&self, max_events: Option<usize>, mut on_event: F) -> Result<usize>
    where
        F: FnMut(&ChangeStreamEvent<Document>),
    {
        let mut stream = self
            .client
            .watch()
            .pipeline(insert_events_pipeline())
            .max_await_time(MAX_AWAIT_TIME)
            .await?;

        let mut seen = 0;
        while max_events.is_none_or(|max| seen < max) {
            match stream.try_next().await? {
                Some(event) => {
                    seen += 1;
                    on_event(&event);
                }
                None => break,
            }
        }
        Ok(seen)
    }
}
