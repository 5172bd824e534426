use async_trait::async_trait;
use bson::{Bson, Document};
use serde::Serialize;

use crate::common::error::StorageResult;
use crate::txn::context::ExecScope;

pub mod memory;
pub mod mongo;
pub mod query;

pub use memory::{Fault, MemoryEngine, MemorySession, SessionStats};
pub use mongo::{MongoSession, MongoSessionProvider};

/// A single mutating operation against one collection
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert {
        document: Document,
    },
    UpdateMany {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    DeleteMany {
        filter: Document,
    },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Insert { .. } => "insert",
            Mutation::UpdateMany { .. } => "update_many",
            Mutation::DeleteMany { .. } => "delete_many",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

impl UpdateOutcome {
    pub fn upserted_count(&self) -> u64 {
        u64::from(self.upserted_id.is_some())
    }
}

/// What a mutation did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MutationOutcome {
    Inserted { inserted_id: Bson },
    Updated(UpdateOutcome),
    Deleted { deleted_count: u64 },
}

/// Source of transactional sessions (the process-wide connection pool)
#[async_trait]
pub trait SessionProvider: Send + Sync {
    type Session: TransactionSession + 'static;

    /// Acquire a session from the pool
    async fn open_session(&self, scope: &ExecScope) -> StorageResult<Self::Session>;
}

/// One storage session able to run a transaction
#[async_trait]
pub trait TransactionSession: Send {
    /// Identifier used in logs
    fn id(&self) -> String;

    /// Start a transaction on this session
    async fn begin_transaction(&mut self, scope: &ExecScope) -> StorageResult<()>;

    /// Execute one mutation inside the active transaction
    async fn run(
        &mut self,
        scope: &ExecScope,
        collection: &str,
        mutation: &Mutation,
    ) -> StorageResult<MutationOutcome>;

    /// Commit the active transaction
    async fn commit(&mut self, scope: &ExecScope) -> StorageResult<()>;

    /// Abort the active transaction (best effort)
    async fn abort(&mut self, scope: &ExecScope) -> StorageResult<()>;

    /// Release the session back to its pool
    async fn close(&mut self);
}
