//! The two stages of a Sync. Each stage runs under its own controller and
//! only communicates with the other through `Sync.status`.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::restore::target_name;
use super::{controller_reference, persist_status, Context, REQUEUE_TARGET_NOT_READY};
use crate::error::{Error, Result};
use crate::events::reasons;
use crate::phase;
use crate::store::{found, Object, ObjectStore, StoreError};
use crate::types::{
    Backup, DeploymentConfig, Phase, Restore, RestoreSpec, Sync, SyncBackupStatus,
    SyncRestoreStatus, SyncStatus, LABEL_ENVIRONMENT, LABEL_SITE,
};

pub fn backup_name(sync_name: &str) -> String {
    format!("sync-{sync_name}-backup")
}

pub fn restore_name(sync_name: &str) -> String {
    format!("sync-{sync_name}-restore")
}

/// Creates the Sync's Backup and mirrors its progress into
/// `status.backup`.
pub async fn reconcile_backup_stage<S: ObjectStore>(
    ctx: &Context<S>,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let mut sync = match get_sync(ctx, namespace, name).await? {
        Some(sync) => sync,
        None => return Ok(Action::await_change()),
    };
    let current = sync.status.clone().unwrap_or_default();
    if crate::types::is_terminal(current.backup.phase) {
        debug!(sync = name, "backup stage finished, skipping");
        return Ok(Action::await_change());
    }

    let child_name = backup_name(name);
    let backup = Backup {
        metadata: child_metadata(&sync, &child_name, &sync.spec.backup_env)?,
        spec: sync.spec.backup_spec.clone(),
        status: None,
    };
    create_child(ctx, &sync, namespace, "Backup", &backup).await?;
    let backup: Backup = get_child(ctx, namespace, "Backup", &child_name).await?;

    let status = SyncStatus {
        backup: SyncBackupStatus {
            name: Some(child_name),
            phase: Some(
                backup
                    .status
                    .as_ref()
                    .and_then(|status| status.phase)
                    .unwrap_or(Phase::New),
            ),
            start_time: backup
                .status
                .as_ref()
                .and_then(|status| status.start_time.clone()),
        },
        restore: current.restore,
    };
    if persist_status(
        &ctx.store,
        &mut sync,
        status,
        |sync| sync.status.as_ref(),
        |sync, status| sync.status = Some(status),
    )
    .await?
    {
        info!(sync = name, "updated sync backup status");
    }

    Ok(Action::await_change())
}

/// Once the backup stage has completed and the target environment is
/// available, creates the Sync's Restore and mirrors its progress into
/// `status.restore`.
pub async fn reconcile_restore_stage<S: ObjectStore>(
    ctx: &Context<S>,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let mut sync = match get_sync(ctx, namespace, name).await? {
        Some(sync) => sync,
        None => return Ok(Action::await_change()),
    };
    let current = sync.status.clone().unwrap_or_default();
    if current.backup.phase != Some(Phase::Completed) {
        debug!(sync = name, "backup stage not completed, skipping");
        return Ok(Action::await_change());
    }
    if crate::types::is_terminal(current.restore.phase) {
        debug!(sync = name, "restore stage finished, skipping");
        return Ok(Action::await_change());
    }
    let source = match current.backup.name.clone() {
        Some(source) => source,
        None => return Err(Error::MissingObjectKey(".status.backup.name")),
    };

    let target = target_name(&sync.spec.restore_env);
    let deployment_config =
        match found(ctx.store.get::<DeploymentConfig>(namespace, &target).await) {
            Ok(Some(deployment_config)) => deployment_config,
            Ok(None) => {
                info!(sync = name, %target, "restore target not found, skipping");
                return Ok(Action::await_change());
            }
            Err(source) => {
                return Err(Error::GetFailed {
                    kind: "DeploymentConfig",
                    name: target,
                    source,
                })
            }
        };
    if !phase::deployment_config_is_available(&deployment_config) {
        info!(sync = name, %target, "restore target not available yet");
        return Ok(Action::requeue(REQUEUE_TARGET_NOT_READY));
    }

    let child_name = restore_name(name);
    let restore = Restore {
        metadata: child_metadata(&sync, &child_name, &sync.spec.restore_env)?,
        spec: RestoreSpec {
            backup_name: source,
            volumes: sync.spec.restore_spec.volumes.clone(),
            mysql: sync.spec.restore_spec.mysql.clone(),
        },
        status: None,
    };
    create_child(ctx, &sync, namespace, "Restore", &restore).await?;
    let restore: Restore = get_child(ctx, namespace, "Restore", &child_name).await?;

    let restore_status = restore.status.unwrap_or_default();
    let status = SyncStatus {
        backup: current.backup,
        restore: SyncRestoreStatus {
            name: Some(child_name),
            phase: Some(restore_status.phase.unwrap_or(Phase::New)),
            completion_time: restore_status.completion_time,
        },
    };
    if persist_status(
        &ctx.store,
        &mut sync,
        status,
        |sync| sync.status.as_ref(),
        |sync, status| sync.status = Some(status),
    )
    .await?
    {
        info!(sync = name, "updated sync restore status");
    }

    Ok(Action::await_change())
}

async fn get_sync<S: ObjectStore>(
    ctx: &Context<S>,
    namespace: &str,
    name: &str,
) -> Result<Option<Sync>> {
    let sync = found(ctx.store.get::<Sync>(namespace, name).await).map_err(|source| {
        Error::GetFailed {
            kind: "Sync",
            name: name.to_string(),
            source,
        }
    })?;
    Ok(sync.filter(|sync| ctx.accepts(&sync.metadata)))
}

fn child_metadata(sync: &Sync, name: &str, environment: &str) -> Result<ObjectMeta> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_SITE.to_string(), sync.spec.site.clone());
    labels.insert(LABEL_ENVIRONMENT.to_string(), environment.to_string());
    // Keep the tenant partition label so the child stays visible to us.
    for (key, value) in sync.labels() {
        labels.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Ok(ObjectMeta {
        name: Some(name.to_string()),
        namespace: sync.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![controller_reference(sync)?]),
        ..ObjectMeta::default()
    })
}

async fn create_child<S: ObjectStore, K: Object>(
    ctx: &Context<S>,
    sync: &Sync,
    namespace: &str,
    kind: &'static str,
    child: &K,
) -> Result<()> {
    let child_name = child.name_any();
    match ctx.store.create(namespace, child).await {
        Ok(_) => {
            info!(sync = %sync.name_any(), %kind, name = %child_name, "created sync child");
            ctx.events
                .publish(
                    &sync.object_ref(&()),
                    EventType::Normal,
                    reasons::CREATE,
                    format!("Creating {kind} {child_name}"),
                )
                .await;
            Ok(())
        }
        Err(StoreError::AlreadyExists) => Ok(()),
        Err(source) => Err(Error::CreateFailed {
            kind,
            name: child_name,
            source,
        }),
    }
}

async fn get_child<S: ObjectStore, K: Object>(
    ctx: &Context<S>,
    namespace: &str,
    kind: &'static str,
    name: &str,
) -> Result<K> {
    ctx.store
        .get::<K>(namespace, name)
        .await
        .map_err(|source| Error::GetFailed {
            kind,
            name: name.to_string(),
            source,
        })
}
