//! Per-module background task set
//!
//! Tasks a module spawns are owned here, never by the module. Shutdown cancels
//! cooperatively, waits out a grace period, then aborts whatever is left.

use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::module::traits::{ModuleError, ModuleKey};

/// Background tasks owned by one live module instance
pub struct BackgroundTasks {
    key: ModuleKey,
    token: CancellationToken,
    set: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new(key: ModuleKey) -> Self {
        Self {
            key,
            token: CancellationToken::new(),
            set: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn a task; it receives a token it must observe for cancellation
    ///
    /// Errors returned by the task are logged and do not propagate.
    pub async fn spawn<F, Fut>(&self, name: &str, task: F) -> Result<(), ModuleError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), ModuleError>> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return Err(ModuleError::OperationError(format!(
                "Task set of {} is shut down; refusing to spawn {}",
                self.key, name
            )));
        }

        let fut = task(self.token.child_token());
        let key = self.key.clone();
        let name = name.to_string();
        debug!(module = %key, "Spawning background task {}", name);

        self.set.lock().await.spawn(async move {
            if let Err(e) = fut.await {
                warn!(module = %key, "Background task {} failed: {}", name, e);
            }
        });
        Ok(())
    }

    /// Number of tasks still running
    pub async fn len(&self) -> usize {
        let mut set = self.set.lock().await;
        while set.try_join_next().is_some() {}
        set.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every task and wait for all of them to finish
    ///
    /// Returns the number of tasks that ignored cancellation for longer than
    /// `grace` and had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.token.cancel();
        let mut set = self.set.lock().await;

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => return 0,
                    Some(Err(e)) if e.is_panic() => {
                        error!(module = %self.key, "Background task panicked: {}", e);
                    }
                    Some(_) => {}
                },
                _ = &mut deadline => break,
            }
        }

        let remaining = set.len();
        warn!(
            module = %self.key,
            "{} background tasks ignored cancellation; aborting", remaining
        );
        set.abort_all();
        while set.join_next().await.is_some() {}
        remaining
    }
}
