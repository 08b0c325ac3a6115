//! The project reaper control loop.
//!
//! The spawner side of this deployment provisions an ephemeral namespace (a
//! "project") and a service account per user session. This loop continuously
//! reconciles those resources against pod liveness: each cycle lists the
//! projects annotated as belonging to this deployment, refreshes a last-seen
//! timestamp for every project whose originating pod still exists, and deletes
//! whatever has gone without proof of life beyond the configured grace period.
//! Service accounts are deleted once their last project is reaped, and
//! accounts observed with no project at all are cleaned up through a separate
//! orphan-tracking path.
//!
//! Deletion is deliberately conservative: a failed listing reaps nothing, an
//! ambiguous pod lookup counts as alive, and all state needed to retry lives
//! in the cluster or in this loop's caches. Under-deletion is the safe failure
//! mode.

mod catalog;
mod cluster;
#[cfg(test)]
mod mod_test;
mod state;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
pub use crate::reaper::cluster::{Cluster, DeleteStatus, KubeCluster};
use crate::reaper::state::SessionState;

/// Total number of project namespaces deleted.
const METRIC_PROJECTS_DELETED: &str = "reaper_projects_deleted";
/// Total number of service accounts deleted.
const METRIC_ACCOUNTS_DELETED: &str = "reaper_accounts_deleted";
/// Total number of finalizers purged from resources of stuck namespaces.
pub(crate) const METRIC_FINALIZERS_PURGED: &str = "reaper_finalizers_purged";
/// Total number of errors encountered during reconciliation cycles.
const METRIC_CYCLE_ERRORS: &str = "reaper_cycle_errors";

/// The reaper control loop over per-user projects and service accounts.
pub struct Reaper<C> {
    /// The cluster handle used for all I/O.
    cluster: C,
    /// Runtime config.
    config: Arc<Config>,
    /// Liveness and ownership caches, owned exclusively by this loop.
    state: SessionState,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl<C: Cluster + 'static> Reaper<C> {
    /// Create a new instance.
    pub fn new(cluster: C, config: Arc<Config>, shutdown: broadcast::Receiver<()>) -> Self {
        metrics::register_counter!(METRIC_PROJECTS_DELETED, metrics::Unit::Count, "total number of project namespaces deleted");
        metrics::register_counter!(METRIC_ACCOUNTS_DELETED, metrics::Unit::Count, "total number of service accounts deleted");
        metrics::register_counter!(METRIC_FINALIZERS_PURGED, metrics::Unit::Count, "total number of finalizers purged from resources of stuck namespaces");
        metrics::register_counter!(METRIC_CYCLE_ERRORS, metrics::Unit::Count, "total number of errors encountered during reconciliation cycles");
        let state = SessionState::new(config.grace_period());
        Self { cluster, config, state, shutdown: BroadcastStream::new(shutdown) }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.reconcile_interval());
        tracing::info!("project reaper initialized");
        loop {
            tokio::select! {
                _ = interval.tick() => self.cycle(Instant::now()).await,
                _ = self.shutdown.next() => break,
            }
        }
        tracing::debug!("project reaper shutdown");
        Ok(())
    }

    /// Run one reconciliation cycle.
    ///
    /// Liveness is always updated before the reap policy is applied, and no
    /// error in any single resource's handling escapes the cycle.
    async fn cycle(&mut self, now: Instant) {
        self.reap_projects(now).await;
        self.reap_orphans(now).await;
    }

    /// Update project liveness from a fresh listing and reap stale projects.
    async fn reap_projects(&mut self, now: Instant) {
        let projects = match self.cluster.list_projects().await {
            Ok(projects) => projects,
            Err(err) => {
                // Fail open: a failed listing is never treated as "nothing
                // exists", and nothing is reaped from cached state without a
                // fresh listing to back it up.
                tracing::error!(error = ?err, "error listing project namespaces");
                metrics::increment_counter!(METRIC_CYCLE_ERRORS);
                return;
            }
        };
        if !projects.is_empty() {
            tracing::debug!(listed = projects.len(), tracked = self.state.tracked_projects(), "checking projects for reaping");
        }

        self.state.observe_projects(&projects, now);
        for project in &projects {
            if self.cluster.pod_exists(&project.pod).await {
                self.state.confirm_alive(project, now);
            }
        }

        for project in self.state.stale_projects(now) {
            if let Some(account) = self.state.evict(&project) {
                // The account's last project is being reaped, so the account
                // goes with it. A failed delete here resurfaces through the
                // orphan path once the account shows up ownerless in a later
                // listing.
                match self.cluster.delete_account(&account).await {
                    Ok(status) => {
                        if status == DeleteStatus::Deleted {
                            metrics::increment_counter!(METRIC_ACCOUNTS_DELETED);
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, %account, "error deleting account");
                        metrics::increment_counter!(METRIC_CYCLE_ERRORS);
                    }
                }
            }
            match self.cluster.delete_project(&project.name).await {
                Ok(DeleteStatus::Terminating) => {
                    // Deletion is blocked; clear finalizers now and leave the
                    // entry in place so the delete is retried next cycle.
                    self.cluster.purge_project(&project.name).await;
                }
                Ok(status) => {
                    if status == DeleteStatus::Deleted {
                        metrics::increment_counter!(METRIC_PROJECTS_DELETED);
                    }
                    self.state.forget(&project);
                }
                Err(err) => {
                    // Retried next cycle; the liveness entry stays put.
                    tracing::error!(error = ?err, project = %project.name, "error deleting project");
                    metrics::increment_counter!(METRIC_CYCLE_ERRORS);
                }
            }
        }
    }

    /// Track and reap service accounts which no longer own any live project.
    async fn reap_orphans(&mut self, now: Instant) {
        let accounts = match self.cluster.list_accounts().await {
            Ok(accounts) => accounts,
            Err(err) => {
                tracing::error!(error = ?err, "error listing managed service accounts");
                metrics::increment_counter!(METRIC_CYCLE_ERRORS);
                return;
            }
        };
        self.state.observe_accounts(&accounts, now);
        for account in self.state.expired_orphans(now) {
            match self.cluster.delete_account(&account).await {
                Ok(status) => {
                    if status == DeleteStatus::Deleted {
                        metrics::increment_counter!(METRIC_ACCOUNTS_DELETED);
                    }
                    self.state.clear_orphan(&account);
                }
                Err(err) => {
                    // Leave the orphan record in place so the delete is retried.
                    tracing::error!(error = ?err, %account, "error deleting orphaned account");
                    metrics::increment_counter!(METRIC_CYCLE_ERRORS);
                }
            }
        }
    }
}
