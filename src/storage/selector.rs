//! Backend selection
//!
//! Picks one storage implementation from configuration and deployment mode.
//! Serverless deployments prefer the REST store (no long-lived sockets);
//! everything else prefers the structured store.

use crate::config::{DeploymentMode, StoreConfig};
use crate::error::{Result, StoreError};
use crate::storage::libsql::{ConnectionMode, LibsqlStorage};
use crate::storage::rest::RestStorage;
use crate::storage::{BackendKind, StorageBackend};
use std::sync::Arc;
use tracing::info;

/// Which backend the configuration resolves to, without constructing it
pub fn plan(config: &StoreConfig, mode: DeploymentMode) -> Result<BackendKind> {
    let order = if mode.is_ephemeral() {
        [BackendKind::Rest, BackendKind::Structured]
    } else {
        [BackendKind::Structured, BackendKind::Rest]
    };

    order
        .into_iter()
        .find(|kind| match kind {
            BackendKind::Structured => config.has_sql(),
            BackendKind::Rest => config.has_rest(),
        })
        .ok_or_else(|| {
            StoreError::Configuration(
                "no storage backend configured: set DATABASE_URL, or SUPABASE_URL and SUPABASE_SERVICE_KEY"
                    .to_string(),
            )
        })
}

/// Build the backend the configuration selects
///
/// A selected backend that fails to open is an error; there is no fallback
/// to the other one.
pub async fn select_backend(config: &StoreConfig, mode: DeploymentMode) -> Result<Arc<dyn StorageBackend>> {
    let kind = plan(config, mode)?;
    info!("Selected {} storage backend ({} deployment)", kind, mode);

    match kind {
        BackendKind::Structured => {
            let dsn = config.database_url.as_deref().unwrap_or_default();
            let connection = ConnectionMode::from_dsn(dsn, config.database_auth_token.as_deref())?;
            let storage = LibsqlStorage::new(connection, &config.pool).await?;
            Ok(Arc::new(storage))
        }
        BackendKind::Rest => Ok(Arc::new(RestStorage::from_config(config)?)),
    }
}
