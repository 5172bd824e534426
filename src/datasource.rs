//! Process-wide MongoDB connection pool.
//!
//! Created once at startup, handed to whoever needs it, and shut down once at
//! exit. Nothing here is global.

use std::sync::Arc;

use bson::{Document, doc};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, Database};
use tracing::info;

use crate::common::config::MongoConfig;
use crate::common::error::{DaoError, Result, StorageError};
use crate::storage::MongoSessionProvider;
use crate::txn::context::Step;

pub struct DataSource {
    client: Client,
    database: Database,
    config: MongoConfig,
}

impl DataSource {
    /// Connect and ping the primary, bounded by the connect timeout
    pub async fn connect(config: &MongoConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.uri).await?;
        options.app_name = config.app_name.clone();
        options.max_pool_size = Some(config.max_pool_size);
        options.connect_timeout = Some(config.connect_timeout());
        options.server_selection_timeout = Some(config.server_selection_timeout());

        let client = Client::with_options(options)?;
        let database = client.database(&config.database);

        let admin = client.database("admin");
        let ping = admin.run_command(doc! { "ping": 1 });
        match tokio::time::timeout(config.connect_timeout(), ping).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                return Err(DaoError::Storage(StorageError::Timeout {
                    step: Step::OpenSession,
                }));
            }
        }
        info!("Connected to MongoDB, database '{}'", config.database);

        Ok(DataSource {
            client,
            database,
            config: config.clone(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn config(&self) -> &MongoConfig {
        &self.config
    }

    /// The configured class collection
    pub fn collection(&self) -> Collection<Document> {
        self.database.collection(&self.config.collection)
    }

    pub async fn list_database_names(&self) -> Result<Vec<String>> {
        Ok(self.client.list_database_names().await?)
    }

    /// Session provider sharing this pool
    pub fn session_provider(&self) -> Arc<MongoSessionProvider> {
        Arc::new(MongoSessionProvider::new(self.client.clone(), self.database.clone()))
    }

    /// Close every pooled connection. Outstanding sessions must be released
    /// first or this waits for them.
    pub async fn shutdown(self) {
        self.client.shutdown().await;
        info!("MongoDB connection pool closed");
    }
}
