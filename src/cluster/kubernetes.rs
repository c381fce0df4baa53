//! Kubernetes adapter
//!
//! Implements [`ClusterApi`] on top of a `kube::Client`. Lookups translate
//! HTTP 404 into `None` / [`DeleteOutcome::NotFound`]; every other API error
//! is wrapped with the step that issued it.

use crate::domain::ports::{ClusterApi, DeleteOutcome, ReclaimPolicy};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

/// Production cluster adapter
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient kubeconfig or in-cluster service account
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::control_plane("connect to cluster", e))?;
        Ok(Self::new(client))
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }
}

/// Map a delete response, treating 404 as already gone
fn delete_outcome<T>(
    result: std::result::Result<T, kube::Error>,
    step: String,
) -> Result<DeleteOutcome> {
    match result {
        Ok(_) => Ok(DeleteOutcome::Deleted),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::NotFound),
        Err(e) => Err(Error::control_plane(step, e)),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_claims(&self, namespace: Option<&str>) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = match namespace {
            Some(ns) => self.claims(ns),
            None => Api::all(self.client.clone()),
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::control_plane("list PVCs", e))?;
        Ok(list.items)
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        self.claims(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::control_plane(format!("get PVC {}/{}", namespace, name), e))
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let name = claim.metadata.name.as_deref().unwrap_or_default();
        debug!(namespace, name, "creating PVC");
        self.claims(namespace)
            .create(&PostParams::default(), claim)
            .await
            .map_err(|e| Error::control_plane(format!("create PVC {}/{}", namespace, name), e))
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<DeleteOutcome> {
        debug!(namespace, name, "deleting PVC");
        let result = self
            .claims(namespace)
            .delete(name, &DeleteParams::default())
            .await;
        delete_outcome(result, format!("delete PVC {}/{}", namespace, name))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::control_plane(format!("list pods in {}", namespace), e))?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.pods(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::control_plane(format!("get pod {}/{}", namespace, name), e))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        debug!(namespace, name, "creating pod");
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| Error::control_plane(format!("create pod {}/{}", namespace, name), e))
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<DeleteOutcome> {
        let params = DeleteParams {
            grace_period_seconds: grace_period_secs,
            ..Default::default()
        };
        debug!(namespace, name, ?grace_period_secs, "deleting pod");
        let result = self.pods(namespace).delete(name, &params).await;
        delete_outcome(result, format!("delete pod {}/{}", namespace, name))
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String> {
        self.pods(namespace)
            .logs(name, &LogParams::default())
            .await
            .map_err(|e| Error::control_plane(format!("get logs of pod {}/{}", namespace, name), e))
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        let list = self
            .deployments(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::control_plane(format!("list deployments in {}", namespace), e))?;
        Ok(list.items)
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                Error::control_plane(format!("scale deployment {}/{}", namespace, name), e)
            })?;
        Ok(())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| Error::control_plane(format!("get storage class {}", name), e))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        self.volumes()
            .get_opt(name)
            .await
            .map_err(|e| Error::control_plane(format!("get PV {}", name), e))
    }

    async fn set_reclaim_policy(&self, name: &str, policy: ReclaimPolicy) -> Result<()> {
        let patch = json!({ "spec": { "persistentVolumeReclaimPolicy": policy.to_string() } });
        self.volumes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::control_plane(format!("set reclaim policy of PV {}", name), e))?;
        Ok(())
    }

    async fn release_volume(&self, name: &str) -> Result<()> {
        let patch = json!({ "spec": { "claimRef": null } });
        self.volumes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::control_plane(format!("release PV {}", name), e))?;
        Ok(())
    }
}
