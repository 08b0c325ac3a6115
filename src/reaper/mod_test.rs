use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::reaper::cluster::{Cluster, DeleteStatus};
use crate::reaper::state::Project;
use crate::reaper::Reaper;

const GRACE: Duration = Duration::from_secs(90);

/// A scripted in-memory cluster used to exercise the reap policy.
#[derive(Clone)]
struct ScriptedCluster {
    inner: Arc<ClusterScript>,
}

struct ClusterScript {
    /// The project listing returned each cycle; an error string scripts a failed listing.
    projects: Mutex<Result<Vec<Project>, String>>,
    /// The account listing returned each cycle.
    accounts: Mutex<Result<Vec<String>, String>>,
    /// The set of pods which currently exist.
    pods: Mutex<HashSet<String>>,
    /// Delete statuses scripted per project name; unscripted deletes succeed.
    project_deletes: Mutex<HashMap<String, DeleteStatus>>,
    /// Names of projects deleted so far.
    deleted_projects: Mutex<Vec<String>>,
    /// Names of accounts deleted so far.
    deleted_accounts: Mutex<Vec<String>>,
    /// Names of projects which had finalizers purged.
    purged_projects: Mutex<Vec<String>>,
}

impl ScriptedCluster {
    fn new() -> Self {
        Self {
            inner: Arc::new(ClusterScript {
                projects: Mutex::new(Ok(vec![])),
                accounts: Mutex::new(Ok(vec![])),
                pods: Mutex::new(HashSet::new()),
                project_deletes: Mutex::new(HashMap::new()),
                deleted_projects: Mutex::new(vec![]),
                deleted_accounts: Mutex::new(vec![]),
                purged_projects: Mutex::new(vec![]),
            }),
        }
    }

    fn set_projects(&self, projects: Vec<Project>) {
        *self.inner.projects.lock().unwrap() = Ok(projects);
    }

    fn fail_project_listing(&self) {
        *self.inner.projects.lock().unwrap() = Err("scripted listing failure".into());
    }

    fn set_accounts(&self, accounts: Vec<&str>) {
        *self.inner.accounts.lock().unwrap() = Ok(accounts.into_iter().map(String::from).collect());
    }

    fn fail_account_listing(&self) {
        *self.inner.accounts.lock().unwrap() = Err("scripted listing failure".into());
    }

    fn add_pod(&self, name: &str) {
        self.inner.pods.lock().unwrap().insert(name.to_string());
    }

    fn remove_pod(&self, name: &str) {
        self.inner.pods.lock().unwrap().remove(name);
    }

    fn script_project_delete(&self, name: &str, status: DeleteStatus) {
        self.inner.project_deletes.lock().unwrap().insert(name.to_string(), status);
    }

    fn deleted_projects(&self) -> Vec<String> {
        self.inner.deleted_projects.lock().unwrap().clone()
    }

    fn deleted_accounts(&self) -> Vec<String> {
        self.inner.deleted_accounts.lock().unwrap().clone()
    }

    fn purged_projects(&self) -> Vec<String> {
        self.inner.purged_projects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Cluster for ScriptedCluster {
    async fn list_projects(&self) -> Result<Vec<Project>> {
        self.inner.projects.lock().unwrap().clone().map_err(|err| anyhow!(err))
    }

    async fn list_accounts(&self) -> Result<Vec<String>> {
        self.inner.accounts.lock().unwrap().clone().map_err(|err| anyhow!(err))
    }

    async fn pod_exists(&self, name: &str) -> bool {
        self.inner.pods.lock().unwrap().contains(name)
    }

    async fn delete_project(&self, name: &str) -> Result<DeleteStatus> {
        self.inner.deleted_projects.lock().unwrap().push(name.to_string());
        Ok(self.inner.project_deletes.lock().unwrap().get(name).copied().unwrap_or(DeleteStatus::Deleted))
    }

    async fn delete_account(&self, name: &str) -> Result<DeleteStatus> {
        self.inner.deleted_accounts.lock().unwrap().push(name.to_string());
        Ok(DeleteStatus::Deleted)
    }

    async fn purge_project(&self, name: &str) {
        self.inner.purged_projects.lock().unwrap().push(name.to_string());
    }
}

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        rust_log: "error".into(),
        application_name: Some("workshop".into()),
        workshop_name: None,
        http_port: 8080,
        grace_period_seconds: GRACE.as_secs(),
        reconcile_interval_seconds: 60,
        namespace: "spawner".into(),
        deployment_name: "workshop".into(),
    })
}

fn test_reaper(cluster: ScriptedCluster) -> (Reaper<ScriptedCluster>, broadcast::Sender<()>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    (Reaper::new(cluster, test_config(), shutdown_rx), shutdown_tx)
}

fn alice() -> Project {
    Project::new("ws-alice", "acct-alice", "pod-alice")
}

#[tokio::test]
async fn project_with_live_pod_is_never_reaped() -> Result<()> {
    let cluster = ScriptedCluster::new();
    cluster.set_projects(vec![alice()]);
    cluster.add_pod("pod-alice");
    let (mut reaper, _shutdown_tx) = test_reaper(cluster.clone());

    // Cycles spaced far beyond the grace period; the pod check refreshes the
    // clock every time.
    let t0 = Instant::now();
    for round in 0..5u32 {
        reaper.cycle(t0 + GRACE * 3 * round).await;
    }

    assert!(cluster.deleted_projects().is_empty(), "expected no project deletes, got {:?}", cluster.deleted_projects());
    assert!(cluster.deleted_accounts().is_empty(), "expected no account deletes, got {:?}", cluster.deleted_accounts());
    Ok(())
}

#[tokio::test]
async fn idle_project_is_reaped_with_its_account() -> Result<()> {
    let cluster = ScriptedCluster::new();
    cluster.set_projects(vec![alice()]);
    let (mut reaper, _shutdown_tx) = test_reaper(cluster.clone());

    let t0 = Instant::now();
    reaper.cycle(t0).await;
    assert!(cluster.deleted_projects().is_empty(), "expected no deletes on the first observation, got {:?}", cluster.deleted_projects());

    // The pod is gone and the namespace was already deleted externally; the
    // cached entry ages out and the delete is a no-op against the cluster.
    cluster.set_projects(vec![]);
    cluster.script_project_delete("ws-alice", DeleteStatus::AlreadyGone);
    reaper.cycle(t0 + GRACE + Duration::from_secs(1)).await;

    assert!(
        cluster.deleted_projects() == vec!["ws-alice".to_string()],
        "expected the idle project to be reaped, got {:?}",
        cluster.deleted_projects()
    );
    assert!(
        cluster.deleted_accounts() == vec!["acct-alice".to_string()],
        "expected the emptied account to be deleted, got {:?}",
        cluster.deleted_accounts()
    );
    assert!(!reaper.state.tracks(&alice()), "expected the reaped project to be dropped from tracking");
    Ok(())
}

#[tokio::test]
async fn account_survives_while_it_still_owns_a_live_project() -> Result<()> {
    let cluster = ScriptedCluster::new();
    let idle = Project::new("ws-bob-1", "acct-bob", "pod-bob-1");
    let live = Project::new("ws-bob-2", "acct-bob", "pod-bob-2");
    cluster.set_projects(vec![idle.clone(), live.clone()]);
    cluster.add_pod("pod-bob-2");
    let (mut reaper, _shutdown_tx) = test_reaper(cluster.clone());

    let t0 = Instant::now();
    reaper.cycle(t0).await;
    reaper.cycle(t0 + GRACE + Duration::from_secs(1)).await;

    assert!(
        cluster.deleted_projects() == vec!["ws-bob-1".to_string()],
        "expected only the idle project to be reaped, got {:?}",
        cluster.deleted_projects()
    );
    assert!(
        cluster.deleted_accounts().is_empty(),
        "expected the account to survive while it owns a live project, got {:?}",
        cluster.deleted_accounts()
    );
    Ok(())
}

#[tokio::test]
async fn listing_failure_reaps_nothing() -> Result<()> {
    let cluster = ScriptedCluster::new();
    cluster.set_projects(vec![alice()]);
    let (mut reaper, _shutdown_tx) = test_reaper(cluster.clone());

    let t0 = Instant::now();
    reaper.cycle(t0).await;

    // Both listings fail from here on; even far past the grace period nothing
    // may be deleted and the cached state must be left untouched.
    cluster.fail_project_listing();
    cluster.fail_account_listing();
    reaper.cycle(t0 + GRACE * 10).await;

    assert!(cluster.deleted_projects().is_empty(), "expected no project deletes after a failed listing, got {:?}", cluster.deleted_projects());
    assert!(cluster.deleted_accounts().is_empty(), "expected no account deletes after a failed listing, got {:?}", cluster.deleted_accounts());
    assert!(reaper.state.tracks(&alice()), "expected cached liveness state to be preserved across the failed cycle");

    // Once the listing recovers the aged entry is reaped as usual.
    cluster.set_projects(vec![alice()]);
    reaper.cycle(t0 + GRACE * 10 + Duration::from_secs(1)).await;
    assert!(
        cluster.deleted_projects() == vec!["ws-alice".to_string()],
        "expected the project to be reaped once listing recovered, got {:?}",
        cluster.deleted_projects()
    );
    Ok(())
}

#[tokio::test]
async fn stuck_terminating_project_is_purged_and_retried() -> Result<()> {
    let cluster = ScriptedCluster::new();
    let bob = Project::new("ws-bob", "acct-bob", "pod-bob");
    cluster.set_projects(vec![bob.clone()]);
    cluster.script_project_delete("ws-bob", DeleteStatus::Terminating);
    let (mut reaper, _shutdown_tx) = test_reaper(cluster.clone());

    let t0 = Instant::now();
    reaper.cycle(t0).await;
    reaper.cycle(t0 + GRACE + Duration::from_secs(1)).await;

    assert!(
        cluster.purged_projects() == vec!["ws-bob".to_string()],
        "expected a finalizer purge for the stuck project, got {:?}",
        cluster.purged_projects()
    );
    assert!(reaper.state.tracks(&bob), "expected the stuck project to remain tracked for retry");

    // With the finalizers cleared the next delete goes through.
    cluster.script_project_delete("ws-bob", DeleteStatus::Deleted);
    reaper.cycle(t0 + GRACE * 2 + Duration::from_secs(2)).await;

    let deletes = cluster.deleted_projects();
    assert!(
        deletes == vec!["ws-bob".to_string(), "ws-bob".to_string()],
        "expected the delete to be retried after the purge, got {:?}",
        deletes
    );
    assert!(!reaper.state.tracks(&bob), "expected the project to be dropped from tracking once deleted");
    Ok(())
}

#[tokio::test]
async fn orphaned_account_is_reaped_after_grace() -> Result<()> {
    let cluster = ScriptedCluster::new();
    cluster.set_accounts(vec!["acct-carol"]);
    let (mut reaper, _shutdown_tx) = test_reaper(cluster.clone());

    let t0 = Instant::now();
    reaper.cycle(t0).await;
    assert!(cluster.deleted_accounts().is_empty(), "expected no deletes at first orphan observation, got {:?}", cluster.deleted_accounts());

    reaper.cycle(t0 + GRACE).await;
    assert!(cluster.deleted_accounts().is_empty(), "expected no deletes within the grace period, got {:?}", cluster.deleted_accounts());

    reaper.cycle(t0 + GRACE + Duration::from_secs(1)).await;
    assert!(
        cluster.deleted_accounts() == vec!["acct-carol".to_string()],
        "expected the orphaned account to be reaped, got {:?}",
        cluster.deleted_accounts()
    );
    assert!(!reaper.state.is_orphan("acct-carol"), "expected the orphan record to be purged after deletion");
    Ok(())
}

#[tokio::test]
async fn orphaned_account_is_spared_on_readoption() -> Result<()> {
    let cluster = ScriptedCluster::new();
    cluster.set_accounts(vec!["acct-dave"]);
    let (mut reaper, _shutdown_tx) = test_reaper(cluster.clone());

    let t0 = Instant::now();
    reaper.cycle(t0).await;
    assert!(reaper.state.is_orphan("acct-dave"), "expected the account to be recorded as an orphan");

    // A project owned by the account shows up before the grace period elapses.
    let dave = Project::new("ws-dave", "acct-dave", "pod-dave");
    cluster.set_projects(vec![dave]);
    cluster.add_pod("pod-dave");
    reaper.cycle(t0 + Duration::from_secs(30)).await;
    reaper.cycle(t0 + GRACE + Duration::from_secs(5)).await;

    assert!(cluster.deleted_accounts().is_empty(), "expected the re-adopted account to be spared, got {:?}", cluster.deleted_accounts());
    assert!(!reaper.state.is_orphan("acct-dave"), "expected the orphan record to clear on re-adoption");
    Ok(())
}

#[tokio::test]
async fn already_deleted_resources_are_treated_as_reaped() -> Result<()> {
    let cluster = ScriptedCluster::new();
    cluster.set_projects(vec![alice()]);
    cluster.script_project_delete("ws-alice", DeleteStatus::AlreadyGone);
    let (mut reaper, _shutdown_tx) = test_reaper(cluster.clone());

    let t0 = Instant::now();
    reaper.cycle(t0).await;
    cluster.set_projects(vec![]);
    reaper.cycle(t0 + GRACE + Duration::from_secs(1)).await;
    // A later cycle issues no further deletes; the entry is gone.
    reaper.cycle(t0 + GRACE * 2 + Duration::from_secs(2)).await;

    assert!(
        cluster.deleted_projects() == vec!["ws-alice".to_string()],
        "expected exactly one delete attempt for the already-gone project, got {:?}",
        cluster.deleted_projects()
    );
    assert!(!reaper.state.tracks(&alice()), "expected the already-gone project to be dropped from tracking");
    Ok(())
}
