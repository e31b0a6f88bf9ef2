//! kube-rs implementation of [`ClusterApi`].

use std::future::Future;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::DynamicObject,
    discovery::{Discovery, Scope},
    Client, Config,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Cancelled, ClusterApi, DiscoveredResource, ResourceTarget};

/// Cluster access bound to a cancellation scope: once `cancel` fires, in-flight and future
/// calls fail with [`Cancelled`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    cancel: CancellationToken,
}

impl KubeCluster {
    pub fn try_new(config: Config, cancel: CancellationToken) -> Result<Self> {
        let client = Client::try_from(config).context("creating Kubernetes API client")?;
        Ok(Self { client, cancel })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, target: &ResourceTarget) -> Api<DynamicObject> {
        match target.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &target.resource),
            None => Api::all_with(self.client.clone(), &target.resource),
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled.into()),
            res = fut => res,
        }
    }
}

fn strip_managed_fields(obj: &mut DynamicObject) {
    obj.metadata.managed_fields = None;
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn discover(&self) -> Result<Vec<DiscoveredResource>> {
        self.bounded(async {
            let discovery = Discovery::new(self.client.clone()).run().await?;
            let mut out = Vec::new();
            for group in discovery.groups() {
                for version in group.versions() {
                    for (ar, caps) in group.versioned_resources(version) {
                        out.push(DiscoveredResource {
                            group: ar.group.clone(),
                            version: ar.version.clone(),
                            kind: ar.kind.clone(),
                            plural: ar.plural.clone(),
                            namespaced: matches!(caps.scope, Scope::Namespaced),
                        });
                    }
                }
            }
            // Stable-ish order
            out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
            debug!(count = out.len(), "discovery complete");
            Ok(out)
        })
        .await
    }

    async fn openapi_schema(&self) -> Result<serde_json::Value> {
        self.bounded(async {
            let req = http::Request::get("/openapi/v2")
                .header(http::header::ACCEPT, "application/json")
                .body(Vec::new())
                .context("building OpenAPI request")?;
            let text = self.client.request_text(req).await.context("retrieving OpenAPI schema document from server")?;
            serde_json::from_str(&text).context("parsing OpenAPI schema document")
        })
        .await
    }

    async fn list(&self, target: &ResourceTarget, params: &ListParams) -> Result<Vec<DynamicObject>> {
        self.bounded(async {
            let list = self.api(target).list(params).await?;
            let mut items = list.items;
            items.iter_mut().for_each(strip_managed_fields);
            Ok(items)
        })
        .await
    }

    async fn get(&self, target: &ResourceTarget, name: &str) -> Result<Option<DynamicObject>> {
        self.bounded(async { Ok(self.api(target).get_opt(name).await?) }).await
    }

    async fn create(&self, target: &ResourceTarget, obj: &DynamicObject) -> Result<DynamicObject> {
        self.bounded(async {
            self.api(target)
                .create(&PostParams::default(), obj)
                .await
                .map_err(|e| anyhow!("creating {}: {}", target.resource.kind, e))
        })
        .await
    }

    async fn delete(&self, target: &ResourceTarget, name: &str) -> Result<()> {
        self.bounded(async {
            match self.api(target).delete(name, &DeleteParams::background()).await {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(anyhow!("deleting {} {}: {}", target.resource.kind, name, e)),
            }
        })
        .await
    }
}
