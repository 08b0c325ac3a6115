//! In-memory session tracking state.
//!
//! All state here is owned exclusively by the reaper control loop; there are
//! no concurrent writers. The caches are rebuilt from cluster listings after a
//! restart, so a restart only ever resets the staleness clock, it never causes
//! an immediate deletion.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// An ephemeral per-user project namespace tracked for reaping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Project {
    /// The name of the project namespace.
    pub name: String,
    /// The name of the service account which owns the project.
    pub account: String,
    /// The name of the pod the project was provisioned for.
    pub pod: String,
}

impl Project {
    /// Create a new instance.
    pub fn new(name: impl Into<String>, account: impl Into<String>, pod: impl Into<String>) -> Self {
        Self { name: name.into(), account: account.into(), pod: pod.into() }
    }
}

/// Liveness and ownership tracking for projects and their service accounts.
pub struct SessionState {
    /// The duration without proof of life after which a resource is reaped.
    grace_period: Duration,
    /// Last-seen timestamps of tracked projects.
    liveness: HashMap<Project, Instant>,
    /// Owning account name to the set of its live projects.
    accounts: HashMap<String, HashSet<Project>>,
    /// First-seen timestamps of accounts observed with no live project.
    orphans: HashMap<String, Instant>,
}

impl SessionState {
    /// Create a new instance.
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            liveness: Default::default(),
            accounts: Default::default(),
            orphans: Default::default(),
        }
    }

    /// Record the projects returned by a listing cycle.
    ///
    /// A project seen for the first time starts with a fresh timestamp; a
    /// project already tracked keeps its old timestamp, as bare presence in a
    /// listing is not proof of life. Every listed project is registered under
    /// its owning account.
    pub fn observe_projects(&mut self, projects: &[Project], now: Instant) {
        for project in projects {
            self.liveness.entry(project.clone()).or_insert(now);
            self.accounts.entry(project.account.clone()).or_default().insert(project.clone());
        }
    }

    /// Reset the staleness clock of a project whose pod was confirmed to exist.
    pub fn confirm_alive(&mut self, project: &Project, now: Instant) {
        if let Some(last_seen) = self.liveness.get_mut(project) {
            *last_seen = now;
        }
    }

    /// Collect the projects which have gone without proof of life beyond the grace period.
    pub fn stale_projects(&self, now: Instant) -> Vec<Project> {
        self.liveness
            .iter()
            .filter(|(_, &last_seen)| now.duration_since(last_seen) > self.grace_period)
            .map(|(project, _)| project.clone())
            .collect()
    }

    /// Remove a project from its owning account's set.
    ///
    /// Returns the account name when its last project was just removed, in
    /// which case the account has been dropped from the index and is due for
    /// deletion.
    pub fn evict(&mut self, project: &Project) -> Option<String> {
        let owned = self.accounts.get_mut(&project.account)?;
        owned.remove(project);
        if owned.is_empty() {
            self.accounts.remove(&project.account);
            return Some(project.account.clone());
        }
        None
    }

    /// Drop a project from the liveness cache.
    pub fn forget(&mut self, project: &Project) {
        self.liveness.remove(project);
    }

    /// Whether the given project is currently tracked.
    #[allow(dead_code)]
    pub fn tracks(&self, project: &Project) -> bool {
        self.liveness.contains_key(project)
    }

    /// The number of currently tracked projects.
    pub fn tracked_projects(&self) -> usize {
        self.liveness.len()
    }

    /// Record the managed accounts returned by a listing cycle.
    ///
    /// An account owning no live project is recorded as an orphan when first
    /// seen. An orphan record is cleared as soon as its account re-acquires a
    /// tracked project.
    pub fn observe_accounts(&mut self, accounts: &[String], now: Instant) {
        for account in accounts {
            if !self.accounts.contains_key(account) {
                self.orphans.entry(account.clone()).or_insert(now);
            }
        }
        let adopted: Vec<String> = self.orphans.keys().filter(|name| self.accounts.contains_key(*name)).cloned().collect();
        for account in adopted {
            tracing::debug!(%account, "orphaned account re-acquired a project");
            self.orphans.remove(&account);
        }
    }

    /// Collect the orphaned accounts past the grace period.
    pub fn expired_orphans(&self, now: Instant) -> Vec<String> {
        self.orphans
            .iter()
            .filter(|(_, &first_seen)| now.duration_since(first_seen) > self.grace_period)
            .map(|(account, _)| account.clone())
            .collect()
    }

    /// Drop an account from the orphan cache.
    pub fn clear_orphan(&mut self, account: &str) {
        self.orphans.remove(account);
    }

    /// Whether the given account is currently recorded as an orphan.
    #[allow(dead_code)]
    pub fn is_orphan(&self, account: &str) -> bool {
        self.orphans.contains_key(account)
    }
}
