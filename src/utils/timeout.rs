//! Timeout wrapper for lifecycle hooks

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::module::traits::ModuleError;

/// Run a fallible hook with an upper bound; expiry becomes `ModuleError::Timeout`
pub async fn with_hook_timeout<F, T>(duration: Duration, operation: F) -> Result<T, ModuleError>
where
    F: Future<Output = Result<T, ModuleError>>,
{
    timeout(duration, operation)
        .await
        .map_err(|_| ModuleError::Timeout)?
}
