//! Service wiring: which operation store backs the process.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use hostpilot_infra::store::{InMemoryOperationStore, OperationStore, PostgresOperationStore};

/// Shared state handed to every route handler and to the background loops.
pub struct AppServices {
    pub store: Arc<dyn OperationStore>,
}

impl AppServices {
    pub fn with_store(store: Arc<dyn OperationStore>) -> Self {
        Self { store }
    }
}

/// Build services from the environment.
///
/// `USE_PERSISTENT_STORE=true` selects Postgres (and requires
/// `DATABASE_URL`); anything else runs on the in-memory store, which is the
/// dev/test mode.
pub async fn build_services() -> anyhow::Result<AppServices> {
    let use_persistent = std::env::var("USE_PERSISTENT_STORE")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let store: Arc<dyn OperationStore> = if use_persistent {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set when USE_PERSISTENT_STORE=true")?;
        let pool = PgPool::connect(&database_url)
            .await
            .context("failed to connect to postgres")?;
        let store = PostgresOperationStore::new(pool);
        store.migrate().await.context("schema migration failed")?;
        tracing::info!("using postgres operation store");
        Arc::new(store)
    } else {
        tracing::info!("using in-memory operation store");
        Arc::new(InMemoryOperationStore::new())
    };

    Ok(AppServices { store })
}
