//! Reconcilers for the four backup resources.
//!
//! Each reconciler re-reads the object it was triggered for, applies its side
//! effects idempotently and returns a requeue directive. Reconcilers never
//! call each other; they coordinate through owner references and status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::runtime::controller::Action;
use kube::Resource;
use tracing::error;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventPublisher;
use crate::store::ObjectStore;

pub mod backup;
pub mod backup_scheduled;
pub mod restore;
pub mod sync;

/// Requeue while the referenced Backup has not started.
pub const REQUEUE_BACKUP_NEW: Duration = Duration::from_secs(30);
/// Requeue while the referenced Backup is running.
pub const REQUEUE_BACKUP_IN_PROGRESS: Duration = Duration::from_secs(15);
/// Requeue while the restore target is not available.
pub const REQUEUE_TARGET_NOT_READY: Duration = Duration::from_secs(60);

pub struct Context<S> {
    pub store: S,
    pub events: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
}

impl<S: ObjectStore> Context<S> {
    /// Objects outside the configured label partition are left alone.
    pub fn accepts(&self, meta: &ObjectMeta) -> bool {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.config
            .filter
            .matches(meta.labels.as_ref().unwrap_or(&EMPTY))
    }
}

pub fn error_policy<K>(_object: Arc<K>, error: &Error, config: &Config) -> Action {
    error!(%error, "reconcile failed");
    Action::requeue(config.error_requeue_duration())
}

/// A controller owner reference pointing at `owner`.
pub fn controller_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Result<OwnerReference> {
    let meta = owner.meta();
    Ok(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?,
        uid: meta
            .uid
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Writes `status` onto `object` through the store unless it is already
/// the persisted value. Returns whether a write happened.
pub async fn persist_status<S, K, St>(
    store: &S,
    object: &mut K,
    status: St,
    current: impl Fn(&K) -> Option<&St>,
    assign: impl Fn(&mut K, St),
) -> Result<bool>
where
    S: ObjectStore,
    K: crate::store::Object,
    St: PartialEq,
{
    if current(object) == Some(&status) {
        return Ok(false);
    }
    assign(object, status);
    *object = store
        .replace_status(object)
        .await
        .map_err(Error::UpdateStatusFailed)?;
    Ok(true)
}
