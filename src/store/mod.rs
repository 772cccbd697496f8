//! The object store the controllers read and write through.
//!
//! Every outcome a call site may want to tolerate (`NotFound`,
//! `AlreadyExists`, `Conflict`) is its own variant, so callers match on it
//! instead of inspecting API error codes.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

mod kube_store;
#[cfg(test)]
pub mod memory;

pub use kube_store::KubeStore;

/// A namespaced kind the store can serve.
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("object was modified concurrently")]
    Conflict,
    #[error("api request failed: {0}")]
    Api(#[source] kube::Error),
    #[error("failed to encode object: {0}")]
    Serialization(#[source] serde_json::Error),
}

/// Identifies the parent whose controller-owned children should be listed.
#[derive(Debug, Clone, Copy)]
pub struct Owner<'a> {
    pub kind: &'a str,
    pub name: &'a str,
}

/// How dependents of a deleted object are cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    #[default]
    Default,
    Background,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K, StoreError>;

    /// Objects in `namespace` whose controller owner reference points at `owner`.
    async fn list_owned<K: Object>(
        &self,
        namespace: &str,
        owner: Owner<'_>,
    ) -> Result<Vec<K>, StoreError>;

    async fn create<K: Object>(&self, namespace: &str, object: &K) -> Result<K, StoreError>;

    /// Writes `object.status`, guarded by `object.metadata.resourceVersion`.
    async fn replace_status<K: Object>(&self, object: &K) -> Result<K, StoreError>;

    async fn delete<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), StoreError>;
}

/// Turns `NotFound` into `None`.
pub fn found<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(object) => Ok(Some(object)),
        Err(StoreError::NotFound) => Ok(None),
        Err(error) => Err(error),
    }
}

/// True when `meta` names `owner` as its controller.
pub fn is_controlled_by(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    owner: Owner<'_>,
) -> bool {
    meta.owner_references.iter().flatten().any(|reference| {
        reference.controller == Some(true)
            && reference.kind == owner.kind
            && reference.name == owner.name
    })
}
