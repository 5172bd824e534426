use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::common::error::Result;

/// Prefix of environment overrides, e.g. `CLASS_DAO__MONGO__URI`
pub const ENV_PREFIX: &str = "CLASS_DAO";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DaoConfig {
    #[validate(nested)]
    pub mongo: MongoConfig,
    #[validate(nested)]
    pub transaction: TransactionConfig,
    #[validate(nested)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MongoConfig {
    #[validate(length(min = 1))]
    pub uri: String,
    #[validate(length(min = 1, max = 63))]
    pub database: String,
    #[validate(length(min = 1, max = 255))]
    pub collection: String,
    pub app_name: Option<String>,
    #[validate(range(min = 1))]
    pub max_pool_size: u32,
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub server_selection_timeout_ms: u64,
}

impl Default for MongoConfig {
    fn default() -> Self {
        MongoConfig {
            uri: "mongodb://localhost:27017".to_string(),
            database: "bing".to_string(),
            collection: "class".to_string(),
            app_name: Some("class-dao".to_string()),
            max_pool_size: 10,
            connect_timeout_ms: 10_000,
            server_selection_timeout_ms: 10_000,
        }
    }
}

impl MongoConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms)
    }
}

/// Timeouts of the individual transaction steps
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TransactionConfig {
    #[validate(range(min = 1))]
    pub session_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub execute_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub commit_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub abort_timeout_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            session_timeout_ms: 10_000,
            execute_timeout_ms: 30_000,
            commit_timeout_ms: 30_000,
            abort_timeout_ms: 10_000,
        }
    }
}

impl TransactionConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    #[validate(length(min = 1))]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "class_dao=info".to_string(),
        }
    }
}

impl DaoConfig {
    /// Load from an optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: DaoConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::common::error::DaoError::internal(e.to_string()))
    }
}
