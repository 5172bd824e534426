use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::common::error::{StorageError, StorageResult};

/// A remote step of a transactional mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    OpenSession,
    BeginTransaction,
    Execute,
    Commit,
    Abort,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::OpenSession => write!(f, "start session"),
            Step::BeginTransaction => write!(f, "start transaction"),
            Step::Execute => write!(f, "operation"),
            Step::Commit => write!(f, "commit transaction"),
            Step::Abort => write!(f, "abort transaction"),
        }
    }
}

/// The caller's side of a call: an optional overall deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// No deadline at all
    pub fn background() -> Self {
        CallContext { deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        CallContext {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        CallContext {
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }
}

/// Where a scope's deadline came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOrigin {
    /// Bounded by the caller's deadline as well as the step's own timeout
    Caller,
    /// Created fresh; nothing inherited from the caller
    Detached,
}

/// Execution scope handed to every collaborator call.
///
/// A scope always has a deadline. Only the execute step derives it from the
/// caller; session, commit and abort steps get detached scopes so an expired
/// caller cannot leave a transaction open.
#[derive(Debug, Clone, Copy)]
pub struct ExecScope {
    step: Step,
    deadline: Instant,
    origin: ScopeOrigin,
}

impl ExecScope {
    /// Scope bounded by both the caller's deadline and `timeout`
    pub fn derived(step: Step, ctx: &CallContext, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = match ctx.deadline() {
            Some(caller) => caller.min(own),
            None => own,
        };
        ExecScope {
            step,
            deadline,
            origin: ScopeOrigin::Caller,
        }
    }

    /// Fresh scope that ignores the caller entirely
    pub fn detached(step: Step, timeout: Duration) -> Self {
        ExecScope {
            step,
            deadline: Instant::now() + timeout,
            origin: ScopeOrigin::Detached,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn origin(&self) -> ScopeOrigin {
        self.origin
    }

    pub fn is_detached(&self) -> bool {
        self.origin == ScopeOrigin::Detached
    }

    pub fn is_expired(&self) -> bool {
        self.deadline <= Instant::now()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run `fut` within this scope. An already expired scope fails without
    /// polling the future.
    pub async fn run<T, F>(&self, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        if self.is_expired() {
            return Err(StorageError::Timeout { step: self.step });
        }
        match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout { step: self.step }),
        }
    }
}
