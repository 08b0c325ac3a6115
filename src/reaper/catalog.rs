//! Discovery of namespaced resource kinds.

use anyhow::{Context, Result};
use kube::client::Client;
use kube::discovery::{verbs, ApiResource, Discovery, Scope};

/// The catalog of namespaced resource kinds served by the cluster.
///
/// Discovery walks every API group the cluster serves and is expensive, so the
/// catalog is computed once at startup and cached for the process lifetime.
/// The finalizer purge depends only on this catalog, never on ad-hoc
/// per-cycle discovery.
pub struct ResourceCatalog {
    kinds: Vec<ApiResource>,
}

impl ResourceCatalog {
    /// Discover the namespaced, listable resource kinds served by the cluster.
    pub async fn discover(client: &Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .context("error discovering cluster API resources")?;
        let mut kinds = vec![];
        for group in discovery.groups() {
            for (resource, capabilities) in group.recommended_resources() {
                if matches!(capabilities.scope, Scope::Namespaced) && capabilities.supports_operation(verbs::LIST) {
                    kinds.push(resource);
                }
            }
        }
        Ok(Self { kinds })
    }

    /// The discovered namespaced resource kinds.
    pub fn namespaced_kinds(&self) -> &[ApiResource] {
        &self.kinds
    }

    /// The number of discovered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }
}
