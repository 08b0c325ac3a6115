//! Cluster-facing operations used by the reaper.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, ServiceAccount};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::core::DynamicObject;
use tokio::time::timeout;

use crate::config::Config;
use crate::reaper::catalog::ResourceCatalog;
use crate::reaper::state::Project;
use crate::reaper::METRIC_FINALIZERS_PURGED;

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// The annotation recording the identity which requested a project.
const ANNOTATION_REQUESTOR: &str = "spawner/requestor";
/// The annotation recording the namespace the spawner runs in.
const ANNOTATION_NAMESPACE: &str = "spawner/namespace";
/// The annotation recording the spawner deployment name.
const ANNOTATION_DEPLOYMENT: &str = "spawner/deployment";
/// The annotation recording the service account owning a project.
const ANNOTATION_ACCOUNT: &str = "spawner/account";
/// The annotation recording the pod a project was provisioned for.
const ANNOTATION_SESSION: &str = "spawner/session";

/// The label carrying the application name on managed service accounts.
const LABEL_APP: &str = "app";
/// The label carrying the user name on managed service accounts.
const LABEL_USER: &str = "user";

/// The outcome of a delete call against the cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeleteStatus {
    /// The resource was deleted.
    Deleted,
    /// The resource was already gone.
    AlreadyGone,
    /// The resource is stuck terminating.
    Terminating,
}

/// Cluster operations needed by the reap policy.
///
/// The policy is written against this trait so that it can be exercised with a
/// scripted cluster in tests.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// List the project namespaces created by this deployment.
    async fn list_projects(&self) -> Result<Vec<Project>>;
    /// List the per-user service accounts managed by this deployment.
    async fn list_accounts(&self) -> Result<Vec<String>>;
    /// Check if the named pod exists in the control namespace.
    async fn pod_exists(&self, name: &str) -> bool;
    /// Delete the named project namespace.
    async fn delete_project(&self, name: &str) -> Result<DeleteStatus>;
    /// Delete the named service account.
    async fn delete_account(&self, name: &str) -> Result<DeleteStatus>;
    /// Clear blocking finalizers from the resources of a namespace stuck terminating.
    async fn purge_project(&self, name: &str);
}

/// The kube-backed production cluster implementation.
pub struct KubeCluster {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The catalog of namespaced resource kinds, discovered once at startup.
    catalog: ResourceCatalog,
}

impl KubeCluster {
    /// Create a new instance.
    pub async fn new(client: Client, config: Arc<Config>) -> Result<Self> {
        let catalog = ResourceCatalog::discover(&client).await?;
        tracing::debug!(kinds = catalog.len(), "namespaced resource kinds discovered");
        Ok(Self { client, config, catalog })
    }

    /// Extract a tracked project from a namespace, if its annotations mark it
    /// as created by this deployment.
    fn as_tracked_project(&self, namespace: &Namespace) -> Option<Project> {
        let name = namespace.metadata.name.as_deref()?;
        let annotations = namespace.metadata.annotations.as_ref()?;
        let requestor = self.config.requestor();
        let matches = annotations.get(ANNOTATION_REQUESTOR) == Some(&requestor)
            && annotations.get(ANNOTATION_NAMESPACE) == Some(&self.config.namespace)
            && annotations.get(ANNOTATION_DEPLOYMENT) == Some(&self.config.deployment_name);
        if !matches {
            return None;
        }
        let account = annotations.get(ANNOTATION_ACCOUNT)?;
        let pod = annotations.get(ANNOTATION_SESSION)?;
        Some(Project::new(name, account, pod))
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_projects(&self) -> Result<Vec<Project>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = timeout(API_TIMEOUT, api.list(&ListParams::default()))
            .await
            .context("timeout while listing project namespaces")?
            .context("error listing project namespaces")?;
        Ok(namespaces.items.iter().filter_map(|namespace| self.as_tracked_project(namespace)).collect())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_accounts(&self) -> Result<Vec<String>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let lp = ListParams {
            label_selector: Some(format!("{}={}", LABEL_APP, self.config.deployment_name)),
            ..Default::default()
        };
        let accounts = timeout(API_TIMEOUT, api.list(&lp))
            .await
            .context("timeout while listing managed service accounts")?
            .context("error listing managed service accounts")?;
        let names = accounts
            .items
            .iter()
            .filter(|account| {
                account
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(LABEL_USER))
                    .map(|user| !user.is_empty())
                    .unwrap_or(false)
            })
            .filter_map(|account| account.metadata.name.clone())
            .collect();
        Ok(names)
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn pod_exists(&self, name: &str) -> bool {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let res = match timeout(API_TIMEOUT, api.get(name)).await {
            Ok(res) => res,
            Err(_) => {
                tracing::error!(pod = name, "timeout while looking up pod, assuming it still exists");
                return true;
            }
        };
        match res {
            Ok(_pod) => true,
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => false,
            Err(err) => {
                // An ambiguous lookup failure never counts as proof of death.
                tracing::error!(error = ?err, pod = name, "error looking up pod, assuming it still exists");
                true
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_project(&self, name: &str) -> Result<DeleteStatus> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting project namespace")?;
        match res {
            Ok(_val) => {
                tracing::info!(project = name, "deleted project");
                Ok(DeleteStatus::Deleted)
            }
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => {
                tracing::info!(project = name, "project already deleted");
                Ok(DeleteStatus::AlreadyGone)
            }
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::CONFLICT => {
                tracing::warn!(project = name, "project is still terminating");
                Ok(DeleteStatus::Terminating)
            }
            Err(err) => Err(err).context("error deleting project namespace"),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_account(&self, name: &str) -> Result<DeleteStatus> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting service account")?;
        match res {
            Ok(_val) => {
                tracing::info!(account = name, "deleted account");
                Ok(DeleteStatus::Deleted)
            }
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => {
                tracing::info!(account = name, "account already deleted");
                Ok(DeleteStatus::AlreadyGone)
            }
            Err(err) => Err(err).context("error deleting service account"),
        }
    }

    /// Clear blocking finalizers from the resources of a namespace stuck terminating.
    ///
    /// A namespace wedges in Terminating when the controller responsible for
    /// removing a finalizer on a contained object was itself deleted first, as
    /// deletion order within a dying namespace is not guaranteed. Removing the
    /// finalizer directly unblocks the namespace deletion.
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn purge_project(&self, name: &str) {
        for resource in self.catalog.namespaced_kinds() {
            let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), name, resource);
            let objects = match timeout(API_TIMEOUT, api.list(&ListParams::default())).await {
                Ok(Ok(objects)) => objects,
                // Kinds the reaper may not list within the namespace are expected; skip them.
                Ok(Err(kube::Error::Api(api_err)))
                    if api_err.code == http::StatusCode::FORBIDDEN
                        || api_err.code == http::StatusCode::NOT_FOUND
                        || api_err.code == http::StatusCode::METHOD_NOT_ALLOWED =>
                {
                    continue
                }
                Ok(Err(err)) => {
                    tracing::error!(error = ?err, kind = %resource.kind, project = name, "error listing resources for finalizer purge");
                    continue;
                }
                Err(_) => {
                    tracing::error!(kind = %resource.kind, project = name, "timeout while listing resources for finalizer purge");
                    continue;
                }
            };
            for object in objects.items {
                let blocked = object.metadata.deletion_timestamp.is_some()
                    && object.metadata.finalizers.as_ref().map(|finalizers| !finalizers.is_empty()).unwrap_or(false);
                if !blocked {
                    continue;
                }
                let object_name = match object.metadata.name.as_deref() {
                    Some(object_name) => object_name,
                    None => continue,
                };
                tracing::warn!(kind = %resource.kind, resource = object_name, project = name, "deleting finalizers on resource");
                let body = serde_json::json!({"metadata": {"finalizers": null}});
                let res = timeout(API_TIMEOUT, api.patch(object_name, &PatchParams::default(), &Patch::Merge(&body))).await;
                match res {
                    Ok(Ok(_object)) => metrics::increment_counter!(METRIC_FINALIZERS_PURGED),
                    Ok(Err(err)) => tracing::error!(error = ?err, kind = %resource.kind, resource = object_name, "error deleting finalizers"),
                    Err(_) => tracing::error!(kind = %resource.kind, resource = object_name, "timeout while deleting finalizers"),
                }
            }
        }
    }
}
