pub mod context;
pub mod transaction;

// Re-export main types
pub use context::{CallContext, ExecScope, ScopeOrigin, Step};
pub use transaction::{TransactionOptions, TransactionState, TransactionalMutation};
