// class-dao library
// Data-access layer for the `class` collection on MongoDB

// Common modules
pub mod common {
    pub mod config;
    pub mod error;
    pub mod model;
    pub mod utils;
}

pub mod dao;
pub mod datasource;
pub mod storage;
pub mod txn;

// Re-export commonly used types for convenience
pub use common::config::DaoConfig;
pub use common::error::{DaoError, ErrorCode, Result, StorageError};
pub use common::model::{Class, ClassDesc};

pub use dao::{ClassQueries, ClassRepository, TextQuery};
pub use datasource::DataSource;
pub use storage::{
    MemoryEngine, MongoSessionProvider, Mutation, MutationOutcome, SessionProvider,
    TransactionSession, UpdateOutcome,
};
pub use txn::{CallContext, TransactionOptions, TransactionState, TransactionalMutation};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install the global tracing subscriber. `RUST_LOG` wins over
/// `default_filter`. Calling it again is a no-op.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
