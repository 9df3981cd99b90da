//! Capabilities the controllers need from the API server.
//!
//! The controllers never hold a [`kube::Client`] directly for their domain
//! logic; they work against the small traits below, implemented once for a
//! real cluster by [`KubeResources`] and by in-memory fakes in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::{pinned_kind, Scope};
use kube::{Client, ResourceExt};
use thiserror::Error;

use xops_api::{AppliedResourceRef, Operation, RequiredResourceSelector};

/// The field manager every server-side apply is attributed to.
pub const FIELD_MANAGER: &str = "crossplane";

/// Ways talking to the API server can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// An apiVersion was not `group/version` or `version`.
    #[error("invalid apiVersion {0:?}")]
    InvalidApiVersion(String),
    /// A kind could not be resolved to a served resource.
    #[error("failed to discover {0}")]
    Discovery(String, #[source] kube::Error),
    /// A get failed.
    #[error("failed to get {0}")]
    Get(String, #[source] kube::Error),
    /// A list failed.
    #[error("failed to list {0}")]
    List(String, #[source] kube::Error),
    /// A credential secret could not be read.
    #[error("failed to read secret {namespace}/{name}")]
    ReadSecret {
        /// Namespace of the secret.
        namespace: String,
        /// Name of the secret.
        name: String,
        /// Why the read failed.
        #[source]
        source: kube::Error,
    },
    /// A manifest to apply has no apiVersion, kind, or name.
    #[error("cannot apply a manifest without apiVersion, kind and metadata.name")]
    IncompleteManifest,
    /// A server-side apply was rejected.
    #[error("failed to apply {0}")]
    Apply(String, #[source] kube::Error),
    /// Listing child operations failed.
    #[error("failed to list operations")]
    ListOperations(#[source] kube::Error),
    /// Creating an operation failed.
    #[error("failed to create operation {0:?}")]
    CreateOperation(String, #[source] kube::Error),
    /// Deleting an operation failed.
    #[error("failed to delete operation {0:?}")]
    DeleteOperation(String, #[source] kube::Error),
}

/// Reads resources pipeline steps depend on.
#[async_trait]
pub trait ResourceReader: Send + Sync {
    /// Fetch the resources a selector names, by name or by labels.
    ///
    /// A by-name fetch of a missing resource is an empty result, not an
    /// error; functions decide whether absence matters.
    async fn fetch_required(
        &self,
        selector: &RequiredResourceSelector,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Read a secret's data for credential hydration.
    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error>;
}

/// Commits desired resources via server-side apply.
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Apply one manifest under the given field manager and return its
    /// identity.
    async fn apply(
        &self,
        manifest: &serde_json::Value,
        field_manager: &str,
    ) -> Result<AppliedResourceRef, Error>;
}

/// CRUD over the [`Operation`]s a scheduling controller owns.
#[async_trait]
pub trait OperationOps: Send + Sync {
    /// List operations carrying `label=value`.
    async fn list_operations(&self, label: &str, value: &str) -> Result<Vec<Operation>, Error>;

    /// Get one operation by name.
    async fn get_operation(&self, name: &str) -> Result<Option<Operation>, Error>;

    /// Create an operation. Creating a name that already exists is not an
    /// error; deterministic names double as dedup locks.
    async fn create_operation(&self, operation: &Operation) -> Result<(), Error>;

    /// Delete an operation. Deleting a name that is already gone is not an
    /// error.
    async fn delete_operation(&self, name: &str) -> Result<(), Error>;
}

/// Merge-patch an object's status subresource.
pub(crate) async fn patch_status<K>(
    api: &Api<K>,
    name: &str,
    status: &(impl serde::Serialize + ?Sized),
) -> kube::Result<K>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await
}

/// Split an apiVersion into group and version.
pub(crate) fn parse_gvk(api_version: &str, kind: &str) -> Result<GroupVersionKind, Error> {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) if !group.is_empty() && !version.is_empty() => (group, version),
        None if !api_version.is_empty() => ("", api_version),
        _ => return Err(Error::InvalidApiVersion(api_version.to_string())),
    };
    Ok(GroupVersionKind::gvk(group, version, kind))
}

/// The real, cluster-backed implementation of every capability.
#[derive(Clone)]
pub struct KubeResources {
    client: Client,
}

impl KubeResources {
    /// Capabilities backed by the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn dynamic_api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, Error> {
        let gvk = parse_gvk(api_version, kind)?;
        let (ar, caps): (ApiResource, _) = pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| Error::Discovery(format!("{api_version}/{kind}"), e))?;
        Ok(match namespace {
            Some(ns) if caps.scope == Scope::Namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    fn operations(&self) -> Api<Operation> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ResourceReader for KubeResources {
    async fn fetch_required(
        &self,
        selector: &RequiredResourceSelector,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api = self
            .dynamic_api(
                &selector.api_version,
                &selector.kind,
                selector.namespace.as_deref(),
            )
            .await?;
        let what = format!(
            "{}/{} {:?}",
            selector.api_version, selector.kind, selector.requirement_name
        );
        if let Some(name) = &selector.name {
            let found = api
                .get_opt(name)
                .await
                .map_err(|e| Error::Get(what, e))?;
            return Ok(found.into_iter().collect());
        }
        let labels = selector
            .match_labels
            .iter()
            .flatten()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let list = api
            .list(&ListParams::default().labels(&labels))
            .await
            .map_err(|e| Error::List(what, e))?;
        Ok(list.items)
    }

    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await.map_err(|e| Error::ReadSecret {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source: e,
        })?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }
}

#[async_trait]
impl ResourceApplier for KubeResources {
    async fn apply(
        &self,
        manifest: &serde_json::Value,
        field_manager: &str,
    ) -> Result<AppliedResourceRef, Error> {
        let api_version = manifest["apiVersion"]
            .as_str()
            .ok_or(Error::IncompleteManifest)?;
        let kind = manifest["kind"].as_str().ok_or(Error::IncompleteManifest)?;
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or(Error::IncompleteManifest)?;
        let namespace = manifest["metadata"]["namespace"].as_str();

        let api = self.dynamic_api(api_version, kind, namespace).await?;
        api.patch(
            name,
            &PatchParams::apply(field_manager).force(),
            &Patch::Apply(manifest),
        )
        .await
        .map_err(|e| Error::Apply(format!("{api_version}/{kind} {name:?}"), e))?;

        Ok(AppliedResourceRef {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(String::from),
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl OperationOps for KubeResources {
    async fn list_operations(&self, label: &str, value: &str) -> Result<Vec<Operation>, Error> {
        let list = self
            .operations()
            .list(&ListParams::default().labels(&format!("{label}={value}")))
            .await
            .map_err(Error::ListOperations)?;
        Ok(list.items)
    }

    async fn get_operation(&self, name: &str) -> Result<Option<Operation>, Error> {
        self.operations()
            .get_opt(name)
            .await
            .map_err(|e| Error::Get(format!("operation {name:?}"), e))
    }

    async fn create_operation(&self, operation: &Operation) -> Result<(), Error> {
        match self
            .operations()
            .create(&PostParams::default(), operation)
            .await
        {
            Ok(_) => Ok(()),
            // The name is the dedup lock; someone else already took it.
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(Error::CreateOperation(operation.name_any(), e)),
        }
    }

    async fn delete_operation(&self, name: &str) -> Result<(), Error> {
        match self
            .operations()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::DeleteOperation(name.to_string(), e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn api_versions_parse_into_gvks() {
        let gvk = parse_gvk("apps/v1", "Deployment").unwrap();
        assert_eq!((gvk.group.as_str(), gvk.version.as_str()), ("apps", "v1"));
        let core = parse_gvk("v1", "Pod").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str()), ("", "v1"));
        assert!(parse_gvk("", "Pod").is_err());
        assert!(parse_gvk("apps/", "Deployment").is_err());
    }
}
