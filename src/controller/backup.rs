//! Drives a single Backup: credentials Secret, one execution Pod, status
//! derived from that Pod.

use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{controller_reference, persist_status, Context};
use crate::error::{Error, Result};
use crate::phase;
use crate::store::{found, ObjectStore, StoreError};
use crate::types::{Backup, BackupStatus, DEFAULT_BACKUP_TYPE};
use crate::workload;

pub async fn reconcile<S: ObjectStore>(
    ctx: &Context<S>,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let mut backup = match found(ctx.store.get::<Backup>(namespace, name).await) {
        Ok(Some(backup)) => backup,
        Ok(None) => return Ok(Action::await_change()),
        Err(source) => {
            return Err(Error::GetFailed {
                kind: "Backup",
                name: name.to_string(),
                source,
            })
        }
    };
    if !ctx.accepts(&backup.metadata) {
        return Ok(Action::await_change());
    }
    if crate::types::is_terminal(backup.status.as_ref().and_then(|status| status.phase)) {
        debug!(backup = name, "backup finished, skipping");
        return Ok(Action::await_change());
    }

    if backup.spec.type_.as_deref().unwrap_or_default().is_empty() {
        backup.spec.type_ = Some(DEFAULT_BACKUP_TYPE.to_string());
    }

    let owner = controller_reference(&backup)?;
    let pod_name = workload::backup_pod_name(name);

    let secret = workload::credentials_secret(&pod_name, owner.clone(), &ctx.config.storage);
    match ctx.store.create::<Secret>(namespace, &secret).await {
        Ok(_) | Err(StoreError::AlreadyExists) => {}
        Err(source) => {
            return Err(Error::CreateFailed {
                kind: "Secret",
                name: pod_name,
                source,
            })
        }
    }

    let pod = workload::backup_pod(&backup, owner, &ctx.config);
    match ctx.store.create::<Pod>(namespace, &pod).await {
        Ok(_) => info!(backup = name, pod = %pod_name, "created backup pod"),
        Err(StoreError::AlreadyExists) => {}
        Err(source) => {
            return Err(Error::CreateFailed {
                kind: "Pod",
                name: pod_name,
                source,
            })
        }
    }
    let pod = ctx
        .store
        .get::<Pod>(namespace, &pod_name)
        .await
        .map_err(|source| Error::GetFailed {
            kind: "Pod",
            name: pod_name.clone(),
            source,
        })?;

    let status = status_from_pod(&pod);
    let phase = status.phase;
    if persist_status(
        &ctx.store,
        &mut backup,
        status,
        |backup| backup.status.as_ref(),
        |backup, status| backup.status = Some(status),
    )
    .await?
    {
        info!(backup = %backup.name_any(), ?phase, "updated backup status");
    }

    Ok(Action::await_change())
}

fn status_from_pod(pod: &Pod) -> BackupStatus {
    let phase = phase::pod_phase(pod.status.as_ref());
    BackupStatus {
        start_time: pod.status.as_ref().and_then(|status| status.start_time.clone()),
        completion_time: if phase.is_terminal() {
            phase::pod_completion_time(pod)
        } else {
            None
        },
        phase: Some(phase),
    }
}
