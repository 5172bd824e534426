use async_trait::async_trait;
use bson::Document;
use mongodb::{Client, ClientSession, Database};
use tracing::debug;

use crate::common::error::{StorageError, StorageResult};
use crate::storage::{Mutation, MutationOutcome, SessionProvider, TransactionSession, UpdateOutcome};
use crate::txn::context::ExecScope;

/// Session provider backed by a MongoDB client pool
#[derive(Clone)]
pub struct MongoSessionProvider {
    client: Client,
    database: Database,
}

impl MongoSessionProvider {
    pub fn new(client: Client, database: Database) -> Self {
        MongoSessionProvider { client, database }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl SessionProvider for MongoSessionProvider {
    type Session = MongoSession;

    async fn open_session(&self, _scope: &ExecScope) -> StorageResult<MongoSession> {
        let session = self.client.start_session().await?;
        Ok(MongoSession {
            session: Some(session),
            database: self.database.clone(),
        })
    }
}

/// A driver session; closing it hands it back to the driver's pool
pub struct MongoSession {
    session: Option<ClientSession>,
    database: Database,
}

impl MongoSession {
    fn inner(&mut self) -> StorageResult<&mut ClientSession> {
        self.session
            .as_mut()
            .ok_or_else(|| StorageError::InvalidState("session already closed".into()))
    }
}

#[async_trait]
impl TransactionSession for MongoSession {
    fn id(&self) -> String {
        match &self.session {
            Some(s) => s.id().to_string(),
            None => "closed".to_string(),
        }
    }

    async fn begin_transaction(&mut self, _scope: &ExecScope) -> StorageResult<()> {
        self.inner()?.start_transaction().await?;
        Ok(())
    }

    async fn run(
        &mut self,
        _scope: &ExecScope,
        collection: &str,
        mutation: &Mutation,
    ) -> StorageResult<MutationOutcome> {
        let coll = self.database.collection::<Document>(collection);
        let session = self.inner()?;

        let outcome = match mutation {
            Mutation::Insert { document } => {
                let result = coll.insert_one(document).session(&mut *session).await?;
                MutationOutcome::Inserted {
                    inserted_id: result.inserted_id,
                }
            }
            Mutation::UpdateMany {
                filter,
                update,
                upsert,
            } => {
                let result = coll
                    .update_many(filter.clone(), update.clone())
                    .upsert(*upsert)
                    .session(&mut *session)
                    .await?;
                MutationOutcome::Updated(UpdateOutcome {
                    matched_count: result.matched_count,
                    modified_count: result.modified_count,
                    upserted_id: result.upserted_id,
                })
            }
            Mutation::DeleteMany { filter } => {
                let result = coll.delete_many(filter.clone()).session(&mut *session).await?;
                MutationOutcome::Deleted {
                    deleted_count: result.deleted_count,
                }
            }
        };
        Ok(outcome)
    }

    async fn commit(&mut self, _scope: &ExecScope) -> StorageResult<()> {
        self.inner()?.commit_transaction().await?;
        Ok(())
    }

    async fn abort(&mut self, _scope: &ExecScope) -> StorageResult<()> {
        self.inner()?.abort_transaction().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Releasing session {}", session.id());
            drop(session);
        }
    }
}
