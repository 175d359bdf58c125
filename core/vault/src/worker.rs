//! Async front for [`VaultService`].
//!
//! Folder transitions are long, blocking filesystem work. The worker runs
//! each one on tokio's blocking pool so callers on an async runtime stay
//! responsive, and can give up on a call after a deadline by cancelling
//! it through its [`Progress`] token.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;
use zeroize::Zeroizing;

use crate::request::{Credential, FolderLocked, LockRequest, PasswordChanged, RekeyOutcome, UnlockRequest};
use crate::service::VaultService;
use phantomvault_common::{Error, ProfileId, Result};
use phantomvault_storage::{CancellationToken, OperationReport, Progress};

/// Runs service calls off the async executor.
#[derive(Clone)]
pub struct VaultWorker {
    service: Arc<VaultService>,
}

impl VaultWorker {
    pub fn new(service: Arc<VaultService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<VaultService> {
        &self.service
    }

    /// Run `f` against the service on the blocking pool.
    ///
    /// # Errors
    /// - whatever `f` returns
    /// - `Error::Transaction` if the task panicked
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&VaultService) -> Result<T> + Send + 'static,
    {
        join(self.spawn(f)).await
    }

    /// Like [`run`](Self::run), but cancel `token` once `limit` passes.
    ///
    /// Cancellation is cooperative: the call stops at its next file
    /// boundary and rolls back. If it commits before noticing, its result
    /// is returned as is.
    pub async fn run_with_timeout<T, F>(&self, limit: Duration, token: CancellationToken, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&VaultService) -> Result<T> + Send + 'static,
    {
        let mut handle = self.spawn(f);
        match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined.map_err(join_error)?,
            Err(_) => {
                warn!(limit_ms = limit.as_millis() as u64, "operation timed out, cancelling");
                token.cancel();
                join(handle).await
            }
        }
    }

    pub async fn lock_new(
        &self,
        profile_id: ProfileId,
        path: PathBuf,
        credential: Credential,
        custom_password: Option<String>,
        progress: Progress,
    ) -> Result<FolderLocked> {
        self.run(move |service| {
            service.lock_new(&profile_id, &path, &credential, custom_password.as_deref(), progress)
        })
        .await
    }

    pub async fn lock(&self, request: LockRequest) -> Result<OperationReport> {
        self.run(move |service| service.lock(request)).await
    }

    pub async fn unlock(&self, request: UnlockRequest) -> Result<OperationReport> {
        self.run(move |service| service.unlock(request)).await
    }

    /// Lock, cancelling the request's progress token after `limit`.
    pub async fn lock_with_timeout(&self, request: LockRequest, limit: Duration) -> Result<OperationReport> {
        let token = request.progress.cancellation().clone();
        self.run_with_timeout(limit, token, move |service| service.lock(request))
            .await
    }

    /// Unlock, cancelling the request's progress token after `limit`.
    pub async fn unlock_with_timeout(&self, request: UnlockRequest, limit: Duration) -> Result<OperationReport> {
        let token = request.progress.cancellation().clone();
        self.run_with_timeout(limit, token, move |service| service.unlock(request))
            .await
    }

    pub async fn change_password(
        &self,
        profile_id: ProfileId,
        old_password: String,
        new_password: String,
    ) -> Result<PasswordChanged> {
        let old_password = Zeroizing::new(old_password);
        let new_password = Zeroizing::new(new_password);
        self.run(move |service| service.change_password(&profile_id, &old_password, &new_password))
            .await
    }

    pub async fn resume_rekey(&self, profile_id: ProfileId, password: String) -> Result<RekeyOutcome> {
        let password = Zeroizing::new(password);
        self.run(move |service| service.resume_rekey(&profile_id, &password))
            .await
    }

    fn spawn<T, F>(&self, f: F) -> JoinHandle<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(&VaultService) -> Result<T> + Send + 'static,
    {
        let service = Arc::clone(&self.service);
        tokio::task::spawn_blocking(move || f(&service))
    }
}

async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle.await.map_err(join_error)?
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Transaction(format!("vault worker task failed: {}", err))
}
