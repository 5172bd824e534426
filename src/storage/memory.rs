use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::common::error::{StorageError, StorageResult};
use crate::storage::query::{apply_update, matches, upsert_seed, validate_update};
use crate::storage::{Mutation, MutationOutcome, SessionProvider, TransactionSession, UpdateOutcome};
use crate::txn::context::{ExecScope, Step};

/// Failure points that can be switched on for a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    OpenSession,
    BeginTransaction,
    Execute,
    /// Execution never completes
    HangExecute,
    Commit,
    Abort,
}

/// Call counters of an engine
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub opened: u64,
    pub begun: u64,
    pub runs: u64,
    pub commits: u64,
    pub aborts: u64,
    pub closes: u64,
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    begun: AtomicU64,
    runs: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    closes: AtomicU64,
}

struct StoredCollection {
    version: u64,
    documents: Vec<Document>,
}

struct EngineInner {
    collections: DashMap<String, StoredCollection>,
    commit_lock: Mutex<()>,
    counters: Counters,
    faults: Mutex<HashSet<Fault>>,
    scopes: Mutex<Vec<ExecScope>>,
    max_sessions: Option<usize>,
    active_sessions: AtomicUsize,
}

impl EngineInner {
    fn has_fault(&self, fault: Fault) -> bool {
        self.faults.lock().contains(&fault)
    }

    fn record_scope(&self, scope: &ExecScope) {
        self.scopes.lock().push(*scope);
    }

    fn version_of(&self, collection: &str) -> u64 {
        self.collections.get(collection).map_or(0, |c| c.version)
    }

    fn snapshot(&self, collection: &str) -> (u64, Vec<Document>) {
        self.collections
            .get(collection)
            .map_or((0, Vec::new()), |c| (c.version, c.documents.clone()))
    }
}

/// In-process storage engine with session-scoped transactions.
///
/// Writes are staged per session on a copy of each touched collection and
/// published on commit. A commit fails with a write conflict when another
/// transaction published the same collection first.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Engine whose session pool holds at most `max_sessions` sessions
    pub fn with_max_sessions(max_sessions: usize) -> Self {
        Self::build(Some(max_sessions))
    }

    fn build(max_sessions: Option<usize>) -> Self {
        MemoryEngine {
            inner: Arc::new(EngineInner {
                collections: DashMap::new(),
                commit_lock: Mutex::new(()),
                counters: Counters::default(),
                faults: Mutex::new(HashSet::new()),
                scopes: Mutex::new(Vec::new()),
                max_sessions,
                active_sessions: AtomicUsize::new(0),
            }),
        }
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.inner.faults.lock().insert(fault);
    }

    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    /// Insert documents outside any transaction. Returns their ids.
    pub fn seed(&self, collection: &str, documents: Vec<Document>) -> StorageResult<Vec<Bson>> {
        let _guard = self.inner.commit_lock.lock();
        let (version, mut current) = self.inner.snapshot(collection);
        let mut ids = Vec::with_capacity(documents.len());
        for document in documents {
            ids.push(insert_into(&mut current, document)?);
        }
        self.inner.collections.insert(
            collection.to_string(),
            StoredCollection {
                version: version + 1,
                documents: current,
            },
        );
        Ok(ids)
    }

    /// Committed documents of a collection
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.inner.snapshot(collection).1
    }

    /// Committed documents matching a filter
    pub fn find(&self, collection: &str, filter: &Document) -> StorageResult<Vec<Document>> {
        let mut found = Vec::new();
        for document in self.documents(collection) {
            if matches(&document, filter)? {
                found.push(document);
            }
        }
        Ok(found)
    }

    pub fn count(&self, collection: &str, filter: &Document) -> StorageResult<u64> {
        Ok(self.find(collection, filter)?.len() as u64)
    }

    pub fn stats(&self) -> SessionStats {
        let c = &self.inner.counters;
        SessionStats {
            opened: c.opened.load(Ordering::SeqCst),
            begun: c.begun.load(Ordering::SeqCst),
            runs: c.runs.load(Ordering::SeqCst),
            commits: c.commits.load(Ordering::SeqCst),
            aborts: c.aborts.load(Ordering::SeqCst),
            closes: c.closes.load(Ordering::SeqCst),
        }
    }

    /// Scopes handed to the given step, in call order
    pub fn scopes_for(&self, step: Step) -> Vec<ExecScope> {
        self.inner
            .scopes
            .lock()
            .iter()
            .filter(|s| s.step() == step)
            .copied()
            .collect()
    }

    /// Sessions currently checked out of the pool
    pub fn active_sessions(&self) -> usize {
        self.inner.active_sessions.load(Ordering::SeqCst)
    }

    fn acquire_slot(&self) -> StorageResult<()> {
        let previous = self.inner.active_sessions.fetch_add(1, Ordering::SeqCst);
        if let Some(max) = self.inner.max_sessions {
            if previous >= max {
                self.inner.active_sessions.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::Unavailable(format!(
                    "session pool exhausted ({max} in use)"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionProvider for MemoryEngine {
    type Session = MemorySession;

    async fn open_session(&self, scope: &ExecScope) -> StorageResult<MemorySession> {
        self.inner.record_scope(scope);
        if self.inner.has_fault(Fault::OpenSession) {
            return Err(StorageError::Unavailable("connection refused".into()));
        }
        self.acquire_slot()?;
        self.inner.counters.opened.fetch_add(1, Ordering::SeqCst);

        Ok(MemorySession {
            id: Uuid::new_v4(),
            engine: Arc::clone(&self.inner),
            in_transaction: false,
            closed: false,
            staged: HashMap::new(),
        })
    }
}

struct Staged {
    base_version: u64,
    documents: Vec<Document>,
}

/// A session of the in-memory engine
pub struct MemorySession {
    id: Uuid,
    engine: Arc<EngineInner>,
    in_transaction: bool,
    closed: bool,
    staged: HashMap<String, Staged>,
}

impl MemorySession {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::InvalidState("session already closed".into()));
        }
        Ok(())
    }

    fn ensure_transaction(&self) -> StorageResult<()> {
        self.ensure_open()?;
        if !self.in_transaction {
            return Err(StorageError::InvalidState("no transaction in progress".into()));
        }
        Ok(())
    }

    fn working_copy(&mut self, collection: &str) -> &mut Vec<Document> {
        let engine = &self.engine;
        &mut self
            .staged
            .entry(collection.to_string())
            .or_insert_with(|| {
                let (base_version, documents) = engine.snapshot(collection);
                Staged {
                    base_version,
                    documents,
                }
            })
            .documents
    }

    fn discard(&mut self) {
        self.staged.clear();
        self.in_transaction = false;
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.discard();
            self.engine.active_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn publish(&mut self) -> StorageResult<()> {
        let _guard = self.engine.commit_lock.lock();
        for (name, staged) in &self.staged {
            if self.engine.version_of(name) != staged.base_version {
                return Err(StorageError::WriteConflict(name.clone()));
            }
        }
        for (name, staged) in self.staged.drain() {
            let version = staged.base_version + 1;
            self.engine.collections.insert(
                name,
                StoredCollection {
                    version,
                    documents: staged.documents,
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionSession for MemorySession {
    fn id(&self) -> String {
        self.id.to_string()
    }

    async fn begin_transaction(&mut self, scope: &ExecScope) -> StorageResult<()> {
        self.engine.record_scope(scope);
        self.engine.counters.begun.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        if self.in_transaction {
            return Err(StorageError::InvalidState("transaction already in progress".into()));
        }
        if self.engine.has_fault(Fault::BeginTransaction) {
            return Err(StorageError::Rejected("injected begin failure".into()));
        }
        self.staged.clear();
        self.in_transaction = true;
        Ok(())
    }

    async fn run(
        &mut self,
        scope: &ExecScope,
        collection: &str,
        mutation: &Mutation,
    ) -> StorageResult<MutationOutcome> {
        self.engine.record_scope(scope);
        self.engine.counters.runs.fetch_add(1, Ordering::SeqCst);
        self.ensure_transaction()?;

        if self.engine.has_fault(Fault::HangExecute) {
            std::future::pending::<()>().await;
        }
        if self.engine.has_fault(Fault::Execute) {
            return Err(StorageError::Rejected("injected execute failure".into()));
        }

        let working = self.working_copy(collection);
        // Mutate a scratch copy so a failing operation leaves nothing behind.
        let mut scratch = working.clone();
        let outcome = apply_mutation(&mut scratch, mutation)?;
        *working = scratch;
        Ok(outcome)
    }

    async fn commit(&mut self, scope: &ExecScope) -> StorageResult<()> {
        self.engine.record_scope(scope);
        self.engine.counters.commits.fetch_add(1, Ordering::SeqCst);
        self.ensure_transaction()?;

        let result = if self.engine.has_fault(Fault::Commit) {
            Err(StorageError::Rejected("injected commit failure".into()))
        } else {
            self.publish()
        };
        self.discard();
        result
    }

    async fn abort(&mut self, scope: &ExecScope) -> StorageResult<()> {
        self.engine.record_scope(scope);
        self.engine.counters.aborts.fetch_add(1, Ordering::SeqCst);
        self.ensure_transaction()?;

        self.discard();
        if self.engine.has_fault(Fault::Abort) {
            return Err(StorageError::Rejected("injected abort failure".into()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.engine.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.release();
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

fn insert_into(documents: &mut Vec<Document>, document: Document) -> StorageResult<Bson> {
    let document = match document.get("_id") {
        Some(_) => document,
        None => {
            let mut with_id = bson::doc! { "_id": ObjectId::new() };
            with_id.extend(document);
            with_id
        }
    };
    let id = document.get("_id").cloned().unwrap_or(Bson::Null);
    if documents.iter().any(|d| d.get("_id") == Some(&id)) {
        return Err(StorageError::DuplicateKey(id.to_string()));
    }
    documents.push(document);
    Ok(id)
}

fn apply_mutation(documents: &mut Vec<Document>, mutation: &Mutation) -> StorageResult<MutationOutcome> {
    match mutation {
        Mutation::Insert { document } => {
            let inserted_id = insert_into(documents, document.clone())?;
            Ok(MutationOutcome::Inserted { inserted_id })
        }
        Mutation::UpdateMany {
            filter,
            update,
            upsert,
        } => {
            validate_update(update)?;
            let mut matched_count = 0;
            let mut modified_count = 0;
            for document in documents.iter_mut() {
                if matches(document, filter)? {
                    matched_count += 1;
                    if apply_update(document, update)? {
                        modified_count += 1;
                    }
                }
            }

            let mut upserted_id = None;
            if matched_count == 0 && *upsert {
                let mut seed = upsert_seed(filter)?;
                apply_update(&mut seed, update)?;
                upserted_id = Some(insert_into(documents, seed)?);
            }

            Ok(MutationOutcome::Updated(UpdateOutcome {
                matched_count,
                modified_count,
                upserted_id,
            }))
        }
        Mutation::DeleteMany { filter } => {
            let mut keep = Vec::with_capacity(documents.len());
            for document in documents.iter() {
                keep.push(!matches(document, filter)?);
            }
            let before = documents.len();
            let mut flags = keep.into_iter();
            documents.retain(|_| flags.next().unwrap_or(true));
            Ok(MutationOutcome::Deleted {
                deleted_count: (before - documents.len()) as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::time::Duration;

    fn scope(step: Step) -> ExecScope {
        ExecScope::detached(step, Duration::from_secs(5))
    }

    async fn open(engine: &MemoryEngine) -> MemorySession {
        let mut session = engine.open_session(&scope(Step::OpenSession)).await.unwrap();
        session.begin_transaction(&scope(Step::BeginTransaction)).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_commit_publishes_staged_writes() {
        let engine = MemoryEngine::new();
        let mut session = open(&engine).await;

        let insert = Mutation::Insert { document: doc! { "classid": 1 } };
        session.run(&scope(Step::Execute), "class", &insert).await.unwrap();
        assert!(engine.documents("class").is_empty());

        session.commit(&scope(Step::Commit)).await.unwrap();
        assert_eq!(engine.documents("class").len(), 1);
        assert!(engine.documents("class")[0].get_object_id("_id").is_ok());
    }

    #[tokio::test]
    async fn test_abort_discards_staged_writes() {
        let engine = MemoryEngine::new();
        let mut session = open(&engine).await;

        let insert = Mutation::Insert { document: doc! { "classid": 1 } };
        session.run(&scope(Step::Execute), "class", &insert).await.unwrap();
        session.abort(&scope(Step::Abort)).await.unwrap();
        session.close().await;

        assert!(engine.documents("class").is_empty());
        assert_eq!(engine.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_commit_conflicts() {
        let engine = MemoryEngine::new();
        engine.seed("class", vec![doc! { "classid": 1, "years": 1 }]).unwrap();

        let bump = Mutation::UpdateMany {
            filter: doc! { "classid": 1 },
            update: doc! { "$inc": { "years": 1 } },
            upsert: false,
        };
        let mut first = open(&engine).await;
        let mut second = open(&engine).await;
        first.run(&scope(Step::Execute), "class", &bump).await.unwrap();
        second.run(&scope(Step::Execute), "class", &bump).await.unwrap();

        first.commit(&scope(Step::Commit)).await.unwrap();
        let err = second.commit(&scope(Step::Commit)).await.unwrap_err();
        assert!(matches!(err, StorageError::WriteConflict(ref c) if c == "class"));
        assert_eq!(engine.documents("class")[0].get_i32("years").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_session_pool_exhaustion() {
        let engine = MemoryEngine::with_max_sessions(1);
        let held = engine.open_session(&scope(Step::OpenSession)).await.unwrap();

        let err = engine.open_session(&scope(Step::OpenSession)).await.err().unwrap();
        assert!(matches!(err, StorageError::Unavailable(_)));

        drop(held);
        assert!(engine.open_session(&scope(Step::OpenSession)).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let engine = MemoryEngine::new();
        engine.seed("class", vec![doc! { "_id": 7, "classid": 7 }]).unwrap();

        let mut session = open(&engine).await;
        let insert = Mutation::Insert { document: doc! { "_id": 7 } };
        let err = session.run(&scope(Step::Execute), "class", &insert).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_working_copy_untouched() {
        let engine = MemoryEngine::new();
        engine
            .seed("class", vec![doc! { "classid": 1, "years": 1 }, doc! { "classid": 2, "years": "x" }])
            .unwrap();

        let mut session = open(&engine).await;
        let bad = Mutation::UpdateMany {
            filter: doc! {},
            update: doc! { "$inc": { "years": 1 } },
            upsert: false,
        };
        assert!(session.run(&scope(Step::Execute), "class", &bad).await.is_err());

        session.commit(&scope(Step::Commit)).await.unwrap();
        assert_eq!(engine.documents("class")[0].get_i32("years").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_requires_transaction() {
        let engine = MemoryEngine::new();
        let mut session = engine.open_session(&scope(Step::OpenSession)).await.unwrap();
        let insert = Mutation::Insert { document: doc! {} };
        let err = session.run(&scope(Step::Execute), "class", &insert).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidState(_)));
    }
}
