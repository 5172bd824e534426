use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Document};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::common::config::TransactionConfig;
use crate::common::error::{DaoError, Result};
use crate::storage::{Mutation, MutationOutcome, SessionProvider, TransactionSession, UpdateOutcome};
use crate::txn::context::{CallContext, ExecScope, Step};

/// Lifecycle of one transactional mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    SessionOpen,
    TransactionActive,
    Committed,
    Aborted,
}

/// Per-step timeouts
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Bound for acquiring a session and starting the transaction
    pub session_timeout: Duration,
    /// Bound for the operation itself, on top of the caller's deadline
    pub execute_timeout: Duration,
    pub commit_timeout: Duration,
    pub abort_timeout: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions {
            session_timeout: Duration::from_secs(10),
            execute_timeout: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(30),
            abort_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&TransactionConfig> for TransactionOptions {
    fn from(config: &TransactionConfig) -> Self {
        TransactionOptions {
            session_timeout: config.session_timeout(),
            execute_timeout: config.execute_timeout(),
            commit_timeout: config.commit_timeout(),
            abort_timeout: config.abort_timeout(),
        }
    }
}

/// Applies single mutations, each inside its own session and transaction.
///
/// The provider is the process-wide pool; it is borrowed per call and never
/// owned here. Nothing is retried.
pub struct TransactionalMutation<P: SessionProvider> {
    provider: Arc<P>,
    options: TransactionOptions,
}

impl<P: SessionProvider> Clone for TransactionalMutation<P> {
    fn clone(&self) -> Self {
        TransactionalMutation {
            provider: Arc::clone(&self.provider),
            options: self.options.clone(),
        }
    }
}

impl<P: SessionProvider> TransactionalMutation<P> {
    pub fn new(provider: Arc<P>, options: TransactionOptions) -> Self {
        TransactionalMutation { provider, options }
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Insert one document, returning the identifier the storage assigned
    pub async fn insert(&self, ctx: &CallContext, collection: &str, document: Document) -> Result<Bson> {
        match self.apply(ctx, collection, Mutation::Insert { document }).await? {
            MutationOutcome::Inserted { inserted_id } => Ok(inserted_id),
            other => Err(DaoError::internal(format!("insert produced {other:?}"))),
        }
    }

    pub async fn update_many(
        &self,
        ctx: &CallContext,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let mutation = Mutation::UpdateMany {
            filter,
            update,
            upsert,
        };
        match self.apply(ctx, collection, mutation).await? {
            MutationOutcome::Updated(outcome) => Ok(outcome),
            other => Err(DaoError::internal(format!("update produced {other:?}"))),
        }
    }

    /// Delete every match of `filter`; an empty filter deletes everything
    pub async fn delete_many(&self, ctx: &CallContext, collection: &str, filter: Document) -> Result<u64> {
        match self.apply(ctx, collection, Mutation::DeleteMany { filter }).await? {
            MutationOutcome::Deleted { deleted_count } => Ok(deleted_count),
            other => Err(DaoError::internal(format!("delete produced {other:?}"))),
        }
    }

    /// Run one mutation in its own transaction
    pub async fn apply(&self, ctx: &CallContext, collection: &str, mutation: Mutation) -> Result<MutationOutcome> {
        let open_scope = ExecScope::detached(Step::OpenSession, self.options.session_timeout);
        let session = open_scope
            .run(self.provider.open_session(&open_scope))
            .await
            .map_err(|e| {
                warn!("start session failed: {}", e);
                DaoError::SessionAcquisition(e)
            })?;

        let mut guard = SessionGuard::new(session, self.options.abort_timeout);
        debug!(session = %guard.id, kind = mutation.kind(), collection, "session open");

        let result = self.drive(&mut guard, ctx, collection, &mutation).await;
        guard.close().await;
        result
    }

    async fn drive(
        &self,
        guard: &mut SessionGuard<P::Session>,
        ctx: &CallContext,
        collection: &str,
        mutation: &Mutation,
    ) -> Result<MutationOutcome> {
        let begin_scope = ExecScope::detached(Step::BeginTransaction, self.options.session_timeout);
        let session = guard.session_mut()?;
        begin_scope
            .run(session.begin_transaction(&begin_scope))
            .await
            .map_err(|e| {
                warn!("start transaction failed: {}", e);
                DaoError::TransactionStart(e)
            })?;
        guard.transition(TransactionState::TransactionActive);

        let exec_scope = ExecScope::derived(Step::Execute, ctx, self.options.execute_timeout);
        let session = guard.session_mut()?;
        let executed = exec_scope
            .run(session.run(&exec_scope, collection, mutation))
            .await;

        let outcome = match executed {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{} on '{}' failed: {}", mutation.kind(), collection, e);
                guard.abort().await;
                return Err(DaoError::Operation(e));
            }
        };

        let commit_scope = ExecScope::detached(Step::Commit, self.options.commit_timeout);
        let session = guard.session_mut()?;
        match commit_scope.run(session.commit(&commit_scope)).await {
            Ok(()) => {
                guard.transition(TransactionState::Committed);
                Ok(outcome)
            }
            Err(e) => {
                warn!("commit of {} on '{}' failed: {}", mutation.kind(), collection, e);
                guard.transition(TransactionState::Aborted);
                Err(DaoError::Commit(e))
            }
        }
    }
}

/// Owns a session for the length of one call.
///
/// If the call future is dropped mid-flight the guard hands the session to a
/// background task that aborts any active transaction and closes it.
struct SessionGuard<S: TransactionSession + 'static> {
    session: Option<S>,
    id: String,
    state: TransactionState,
    abort_timeout: Duration,
}

impl<S: TransactionSession + 'static> SessionGuard<S> {
    fn new(session: S, abort_timeout: Duration) -> Self {
        SessionGuard {
            id: session.id(),
            session: Some(session),
            state: TransactionState::SessionOpen,
            abort_timeout,
        }
    }

    fn session_mut(&mut self) -> Result<&mut S> {
        self.session
            .as_mut()
            .ok_or_else(|| DaoError::internal("session already released"))
    }

    fn transition(&mut self, next: TransactionState) {
        debug!(session = %self.id, from = ?self.state, to = ?next, "transaction state");
        self.state = next;
    }

    /// Abort under a fresh scope. Failures are logged, never returned.
    async fn abort(&mut self) {
        if let Some(session) = self.session.as_mut() {
            abort_detached(session, &self.id, self.abort_timeout).await;
        }
        self.transition(TransactionState::Aborted);
    }

    async fn close(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
            debug!(session = %self.id, state = ?self.state, "session closed");
        }
    }
}

async fn abort_detached<S: TransactionSession>(session: &mut S, id: &str, timeout: Duration) {
    let scope = ExecScope::detached(Step::Abort, timeout);
    if let Err(e) = scope.run(session.abort(&scope)).await {
        warn!(session = %id, "abort transaction failed: {}", e);
    }
}

impl<S: TransactionSession + 'static> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let active = self.state == TransactionState::TransactionActive;
        let id = std::mem::take(&mut self.id);
        let timeout = self.abort_timeout;

        match Handle::try_current() {
            Ok(handle) => {
                debug!(session = %id, "call cancelled, cleaning up session in background");
                handle.spawn(async move {
                    if active {
                        abort_detached(&mut session, &id, timeout).await;
                    }
                    session.close().await;
                });
            }
            Err(_) => warn!(session = %id, "no runtime available, session dropped without close"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::StorageError;
    use crate::storage::{Fault, MemoryEngine};
    use bson::doc;
    use tokio::time::Instant;

    const CLASS: &str = "class";

    fn mutator(engine: &MemoryEngine) -> TransactionalMutation<MemoryEngine> {
        TransactionalMutation::new(Arc::new(engine.clone()), TransactionOptions::default())
    }

    fn record(id: i32) -> Document {
        doc! {
            "classid": id,
            "classname": format!("CS-{id}"),
            "classdesc": { "stucount": 20, "teachercount": 2 },
            "years": 13,
            "brief": "Sxs",
        }
    }

    #[tokio::test]
    async fn test_insert_commits_once() {
        let engine = MemoryEngine::new();
        let tx = mutator(&engine);

        let id = tx.insert(&CallContext::background(), CLASS, record(3)).await.unwrap();
        assert!(matches!(id, Bson::ObjectId(_)));

        let stats = engine.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.aborts, 0);
        assert_eq!(stats.closes, 1);

        let stored = engine.find(CLASS, &doc! { "classid": 3 }).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].get("_id"), Some(&id));
    }

    #[tokio::test]
    async fn test_update_upsert_when_nothing_matches() {
        let engine = MemoryEngine::new();
        let tx = mutator(&engine);

        let outcome = tx
            .update_many(
                &CallContext::background(),
                CLASS,
                doc! { "classname": "MBA-4" },
                doc! { "$set": { "classname": "MBA三班" } },
                true,
            )
            .await
            .unwrap();

        assert_eq!(outcome.matched_count, 0);
        assert_eq!(outcome.modified_count, 0);
        assert_eq!(outcome.upserted_count(), 1);
        assert_eq!(engine.stats().commits, 1);
        assert_eq!(engine.count(CLASS, &doc! { "classname": "MBA三班" }).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_without_upsert_touches_matches_only() {
        let engine = MemoryEngine::new();
        engine.seed(CLASS, vec![record(1), record(2)]).unwrap();
        let tx = mutator(&engine);

        let outcome = tx
            .update_many(
                &CallContext::background(),
                CLASS,
                doc! { "classid": 2 },
                doc! { "$inc": { "years": 1 } },
                false,
            )
            .await
            .unwrap();

        assert_eq!(outcome.matched_count, 1);
        assert_eq!(outcome.modified_count, 1);
        assert_eq!(outcome.upserted_id, None);
        assert_eq!(engine.count(CLASS, &doc! { "years": 14 }).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_all_with_empty_filter() {
        let engine = MemoryEngine::new();
        engine.seed(CLASS, (1..=5).map(record).collect()).unwrap();
        let tx = mutator(&engine);

        let deleted = tx.delete_many(&CallContext::background(), CLASS, doc! {}).await.unwrap();
        assert_eq!(deleted, 5);
        assert!(engine.documents(CLASS).is_empty());
        assert_eq!(engine.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_operation_error_returned_unchanged() {
        let engine = MemoryEngine::new();
        engine.inject_fault(Fault::Execute);
        let tx = mutator(&engine);

        let err = tx.insert(&CallContext::background(), CLASS, record(3)).await.unwrap_err();
        match err {
            DaoError::Operation(StorageError::Rejected(msg)) => {
                assert_eq!(msg, "injected execute failure")
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let stats = engine.stats();
        assert_eq!(stats.aborts, 1);
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.closes, 1);
        assert!(engine.documents(CLASS).is_empty());
    }

    #[tokio::test]
    async fn test_storage_rejection_aborts() {
        let engine = MemoryEngine::new();
        engine.seed(CLASS, vec![record(1)]).unwrap();
        let tx = mutator(&engine);

        let err = tx
            .update_many(&CallContext::background(), CLASS, doc! {}, doc! { "classname": "x" }, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DaoError::Operation(StorageError::Rejected(_))));
        assert_eq!(engine.stats().aborts, 1);
        assert_eq!(engine.stats().commits, 0);
    }

    #[tokio::test]
    async fn test_abort_scope_is_detached_from_expired_caller() {
        let engine = MemoryEngine::new();
        let tx = mutator(&engine);

        let expired = CallContext::with_deadline(Instant::now() - Duration::from_secs(1));
        let err = tx.insert(&expired, CLASS, record(3)).await.unwrap_err();
        assert!(matches!(err, DaoError::Operation(StorageError::Timeout { step: Step::Execute })));

        let aborts = engine.scopes_for(Step::Abort);
        assert_eq!(aborts.len(), 1);
        assert!(aborts[0].is_detached());
        assert!(aborts[0].deadline() > Instant::now());

        let stats = engine.stats();
        assert_eq!(stats.aborts, 1);
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.closes, 1);
    }

    #[tokio::test]
    async fn test_execute_scope_follows_caller_deadline() {
        let engine = MemoryEngine::new();
        let tx = mutator(&engine);

        let ctx = CallContext::with_timeout(Duration::from_secs(2));
        tx.insert(&ctx, CLASS, record(1)).await.unwrap();

        let runs = engine.scopes_for(Step::Execute);
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].is_detached());
        assert!(runs[0].deadline() <= ctx.deadline().unwrap());

        let commits = engine.scopes_for(Step::Commit);
        assert!(commits[0].is_detached());
    }

    #[tokio::test]
    async fn test_hanging_operation_times_out_and_aborts() {
        let engine = MemoryEngine::new();
        engine.inject_fault(Fault::HangExecute);
        let options = TransactionOptions {
            execute_timeout: Duration::from_millis(30),
            ..TransactionOptions::default()
        };
        let tx = TransactionalMutation::new(Arc::new(engine.clone()), options);

        let err = tx.delete_many(&CallContext::background(), CLASS, doc! {}).await.unwrap_err();
        assert!(matches!(err, DaoError::Operation(StorageError::Timeout { .. })));
        assert_eq!(engine.stats().aborts, 1);
        assert_eq!(engine.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_commit_failure_is_distinct() {
        let engine = MemoryEngine::new();
        engine.inject_fault(Fault::Commit);
        let tx = mutator(&engine);

        let err = tx.insert(&CallContext::background(), CLASS, record(3)).await.unwrap_err();
        assert!(matches!(err, DaoError::Commit(_)));

        let stats = engine.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.aborts, 0);
        assert_eq!(stats.closes, 1);
        assert!(engine.documents(CLASS).is_empty());
    }

    #[tokio::test]
    async fn test_abort_failure_does_not_mask_operation_error() {
        let engine = MemoryEngine::new();
        engine.inject_fault(Fault::Execute);
        engine.inject_fault(Fault::Abort);
        let tx = mutator(&engine);

        let err = tx.insert(&CallContext::background(), CLASS, record(3)).await.unwrap_err();
        assert!(matches!(err, DaoError::Operation(StorageError::Rejected(ref m)) if m == "injected execute failure"));
        assert_eq!(engine.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_session_acquisition_failure() {
        let engine = MemoryEngine::with_max_sessions(0);
        let tx = mutator(&engine);

        let err = tx.insert(&CallContext::background(), CLASS, record(3)).await.unwrap_err();
        assert!(matches!(err, DaoError::SessionAcquisition(StorageError::Unavailable(_))));

        let stats = engine.stats();
        assert_eq!(stats.opened, 0);
        assert_eq!(stats.closes, 0);
    }

    #[tokio::test]
    async fn test_begin_failure_closes_without_abort() {
        let engine = MemoryEngine::new();
        engine.inject_fault(Fault::BeginTransaction);
        let tx = mutator(&engine);

        let err = tx.insert(&CallContext::background(), CLASS, record(3)).await.unwrap_err();
        assert!(matches!(err, DaoError::TransactionStart(_)));

        let stats = engine.stats();
        assert_eq!(stats.runs, 0);
        assert_eq!(stats.aborts, 0);
        assert_eq!(stats.closes, 1);
        assert_eq!(engine.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_inc_overflow_aborts_without_panicking() {
        let engine = MemoryEngine::new();
        engine.seed(CLASS, vec![doc! { "classid": 1, "years": i64::MAX }]).unwrap();
        let tx = mutator(&engine);

        let err = tx
            .update_many(
                &CallContext::background(),
                CLASS,
                doc! {},
                doc! { "$inc": { "years": 1_i64 } },
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DaoError::Operation(StorageError::Rejected(_))));

        let stats = engine.stats();
        assert_eq!(stats.aborts, 1);
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.closes, 1);
        assert_eq!(engine.documents(CLASS)[0].get("years"), Some(&Bson::Int64(i64::MAX)));
    }

    #[tokio::test]
    async fn test_cancelled_call_still_aborts_and_closes() {
        let engine = MemoryEngine::new();
        engine.inject_fault(Fault::HangExecute);
        let tx = mutator(&engine);

        let ctx = CallContext::background();
        let call = tx.insert(&ctx, CLASS, record(3));
        assert!(tokio::time::timeout(Duration::from_millis(20), call).await.is_err());

        // Let the background cleanup run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = engine.stats();
        assert_eq!(stats.aborts, 1);
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.closes, 1);
        assert_eq!(engine.active_sessions(), 0);
        assert!(engine.scopes_for(Step::Abort)[0].is_detached());
    }

    #[tokio::test]
    async fn test_concurrent_callers_use_separate_sessions() {
        let engine = MemoryEngine::new();
        let tx = mutator(&engine);

        let mut handles = Vec::new();
        for i in 0..8 {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                tx.insert(&CallContext::background(), "other", doc! { "n": i }).await
            }));
        }

        let mut committed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => committed += 1,
                Err(e) => assert!(e.is_retryable(), "unexpected error: {e}"),
            }
        }

        let stats = engine.stats();
        assert_eq!(stats.opened, 8);
        assert_eq!(stats.closes, 8);
        assert_eq!(engine.documents("other").len(), committed);
    }
}
