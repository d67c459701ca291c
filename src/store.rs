//! Object store abstraction over the Kubernetes API
//!
//! The reconcilers never talk to the API server directly; they go through
//! the [`ObjectStore`] trait so controller logic can be exercised against
//! mocks. The real implementation wraps a kube [`Client`]: typed Apis for
//! the two parent resources and [`DynamicObject`] Apis for the child
//! service kinds, which the sequencer treats as opaque structured data.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    StratusControlPlane, StratusControlPlaneStatus, StratusVersion, StratusVersionStatus,
};
use crate::registry::ChildKind;
use crate::{Error, Result, FIELD_MANAGER};

/// Finalizer placed on the parent resources
pub const FINALIZER: &str = "stratus.dev/controlplane";

/// Abstract store holding all resources the sequencer reads and writes
///
/// `get_*` operations map NotFound to `Ok(None)`; all other API failures
/// propagate. Update conflicts surface as errors the caller treats as
/// retryable (see [`Error::is_conflict`]).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a child resource by kind and identity
    async fn get_child(
        &self,
        kind: &ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create a child resource
    async fn create_child(&self, kind: &ChildKind, obj: &DynamicObject) -> Result<()>;

    /// Update an existing child resource
    async fn update_child(&self, kind: &ChildKind, obj: &DynamicObject) -> Result<()>;

    /// Delete a child resource; NotFound is success
    async fn delete_child(&self, kind: &ChildKind, namespace: &str, name: &str) -> Result<()>;

    /// Names of Services in the namespace matching the label selector
    async fn list_exposed_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<String>>;

    /// Fetch a StratusVersion by identity
    async fn get_version(&self, namespace: &str, name: &str) -> Result<Option<StratusVersion>>;

    /// Create a StratusVersion
    async fn create_version(&self, version: &StratusVersion) -> Result<()>;

    /// Fetch a StratusControlPlane by identity
    async fn get_control_plane(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StratusControlPlane>>;

    /// Patch the status subresource of a StratusControlPlane
    async fn patch_control_plane_status(
        &self,
        namespace: &str,
        name: &str,
        status: &StratusControlPlaneStatus,
    ) -> Result<()>;

    /// Patch the status subresource of a StratusVersion
    async fn patch_version_status(
        &self,
        namespace: &str,
        name: &str,
        status: &StratusVersionStatus,
    ) -> Result<()>;

    /// Replace the finalizer list on a StratusControlPlane
    async fn set_control_plane_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()>;

    /// Replace the finalizer list on a StratusVersion
    async fn set_version_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()>;
}

/// Kubernetes-backed store implementation
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn children(&self, kind: &ChildKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }

    fn versions(&self, namespace: &str) -> Api<StratusVersion> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn control_planes(&self, namespace: &str) -> Api<StratusControlPlane> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn ignore_not_found<T>(result: kube::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(Error::Kube(e)),
    }
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_child(
        &self,
        kind: &ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        ignore_not_found(self.children(kind, namespace).get(name).await)
    }

    async fn create_child(&self, kind: &ChildKind, obj: &DynamicObject) -> Result<()> {
        let namespace = obj.metadata.namespace.as_deref().unwrap_or_default();
        self.children(kind, namespace)
            .create(&PostParams::default(), obj)
            .await?;
        Ok(())
    }

    async fn update_child(&self, kind: &ChildKind, obj: &DynamicObject) -> Result<()> {
        let namespace = obj.metadata.namespace.as_deref().unwrap_or_default();
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("child object has no name"))?;
        self.children(kind, namespace)
            .replace(name, &PostParams::default(), obj)
            .await?;
        Ok(())
    }

    async fn delete_child(&self, kind: &ChildKind, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.children(kind, namespace)
                .delete(name, &Default::default())
                .await,
        )?;
        Ok(())
    }

    async fn list_exposed_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector_string(selector));
        let services = api.list(&params).await?;
        Ok(services
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect())
    }

    async fn get_version(&self, namespace: &str, name: &str) -> Result<Option<StratusVersion>> {
        ignore_not_found(self.versions(namespace).get(name).await)
    }

    async fn create_version(&self, version: &StratusVersion) -> Result<()> {
        let namespace = version.metadata.namespace.as_deref().unwrap_or_default();
        self.versions(namespace)
            .create(&PostParams::default(), version)
            .await?;
        Ok(())
    }

    async fn get_control_plane(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StratusControlPlane>> {
        ignore_not_found(self.control_planes(namespace).get(name).await)
    }

    async fn patch_control_plane_status(
        &self,
        namespace: &str,
        name: &str,
        status: &StratusControlPlaneStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.control_planes(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn patch_version_status(
        &self,
        namespace: &str,
        name: &str,
        status: &StratusVersionStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.versions(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn set_control_plane_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.control_planes(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn set_version_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.versions(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}
