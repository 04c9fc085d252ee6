//! TTL leases that serialize engine decisions per run and per lead.
//!
//! A lease is a row keyed by `(scope, key)` with a holder token and an
//! expiry. Acquisition is a conditional upsert that succeeds only when the
//! row is absent or expired, so a crashed holder blocks others for at most
//! one TTL. Leases guard short decision phases only, never agent dispatch.
//!
//! Lock order: a lead lease is always taken before a run lease.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use leadflow_types::config::EngineConfig;
use leadflow_types::error::RepositoryError;
use leadflow_types::id::{LeadId, RunId};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::repository::run::RunRepository;

/// What a lease protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseScope {
    Run(RunId),
    Lead(LeadId),
}

impl LeaseScope {
    pub fn scope(&self) -> &'static str {
        match self {
            LeaseScope::Run(_) => "run",
            LeaseScope::Lead(_) => "lead",
        }
    }

    pub fn key(&self) -> String {
        match self {
            LeaseScope::Run(id) => id.to_string(),
            LeaseScope::Lead(id) => id.to_string(),
        }
    }
}

impl fmt::Display for LeaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope(), self.key())
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("timed out after {waited:?} waiting for lease {scope}")]
    Timeout { scope: String, waited: Duration },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Acquires and releases leases through a [`RunRepository`].
pub struct LeaseManager<R> {
    repo: Arc<R>,
    ttl: Duration,
    wait: Duration,
    poll: Duration,
}

impl<R> Clone for LeaseManager<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            ttl: self.ttl,
            wait: self.wait,
            poll: self.poll,
        }
    }
}

impl<R: RunRepository> LeaseManager<R> {
    pub fn new(repo: Arc<R>, config: &EngineConfig) -> Self {
        Self {
            repo,
            ttl: config.lease_ttl(),
            wait: config.lease_wait(),
            poll: config.lease_poll(),
        }
    }

    /// Block until the lease is ours or the wait limit passes.
    /// Returns the holder token to release with.
    pub async fn acquire(&self, scope: LeaseScope) -> Result<String, LeaseError> {
        let holder = uuid::Uuid::now_v7().to_string();
        let key = scope.key();
        let deadline = Instant::now() + self.wait;

        loop {
            if self
                .repo
                .try_acquire_lease(scope.scope(), &key, &holder, self.ttl)
                .await?
            {
                debug!(lease = %scope, "lease acquired");
                return Ok(holder);
            }
            if Instant::now() >= deadline {
                return Err(LeaseError::Timeout {
                    scope: scope.to_string(),
                    waited: self.wait,
                });
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Release a lease. Failures are logged; the lease expires on its own.
    pub async fn release(&self, scope: LeaseScope, holder: &str) {
        if let Err(e) = self
            .repo
            .release_lease(scope.scope(), &scope.key(), holder)
            .await
        {
            warn!(lease = %scope, error = %e, "failed to release lease");
        }
    }

    /// Run `work` while holding the lease, releasing it afterwards whether
    /// `work` succeeded or not.
    pub async fn hold<T, E, F>(&self, scope: LeaseScope, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<LeaseError>,
    {
        let holder = self.acquire(scope).await?;
        let result = work.await;
        self.release(scope, &holder).await;
        result
    }
}
