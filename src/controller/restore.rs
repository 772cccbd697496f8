//! Restores a completed Backup into the environment named by the Restore's
//! labels, through a single bounded Job.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::{
    controller_reference, persist_status, Context, REQUEUE_BACKUP_IN_PROGRESS, REQUEUE_BACKUP_NEW,
};
use crate::error::{Error, Result};
use crate::events::reasons;
use crate::phase;
use crate::store::{found, ObjectStore, StoreError};
use crate::types::{
    Backup, DeploymentConfig, Phase, Restore, RestoreStatus, LABEL_ENVIRONMENT, LABEL_SITE,
};
use crate::workload;

/// Name of the deployment a given environment runs as.
pub fn target_name(environment: &str) -> String {
    format!("node-{environment}")
}

pub async fn reconcile<S: ObjectStore>(
    ctx: &Context<S>,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let mut restore = match found(ctx.store.get::<Restore>(namespace, name).await) {
        Ok(Some(restore)) => restore,
        Ok(None) => return Ok(Action::await_change()),
        Err(source) => {
            return Err(Error::GetFailed {
                kind: "Restore",
                name: name.to_string(),
                source,
            })
        }
    };
    if !ctx.accepts(&restore.metadata) {
        return Ok(Action::await_change());
    }
    if crate::types::is_terminal(restore.status.as_ref().and_then(|status| status.phase)) {
        debug!(restore = name, "restore finished, skipping");
        return Ok(Action::await_change());
    }

    let backup_name = restore.spec.backup_name.clone();
    let backup = match found(ctx.store.get::<Backup>(namespace, &backup_name).await) {
        Ok(Some(backup)) => backup,
        Ok(None) => {
            warn!(restore = name, backup = %backup_name, "backup not found");
            ctx.events
                .publish(
                    &restore.object_ref(&()),
                    EventType::Warning,
                    reasons::ERROR,
                    format!("Backup {backup_name} not found"),
                )
                .await;
            return Ok(Action::await_change());
        }
        Err(source) => {
            return Err(Error::GetFailed {
                kind: "Backup",
                name: backup_name,
                source,
            })
        }
    };

    match backup.status.as_ref().and_then(|status| status.phase) {
        Some(Phase::Completed) => {}
        Some(Phase::Failed) => {
            info!(restore = name, backup = %backup_name, "backup failed, skipping restore");
            return Ok(Action::await_change());
        }
        None | Some(Phase::New) => {
            debug!(restore = name, backup = %backup_name, "backup has not started");
            return Ok(Action::requeue(REQUEUE_BACKUP_NEW));
        }
        Some(Phase::InProgress) => {
            debug!(restore = name, backup = %backup_name, "backup in progress");
            return Ok(Action::requeue(REQUEUE_BACKUP_IN_PROGRESS));
        }
    }

    let labels = restore.labels();
    let (site, environment) = match (labels.get(LABEL_SITE), labels.get(LABEL_ENVIRONMENT)) {
        (Some(site), Some(environment)) => (site.clone(), environment.clone()),
        _ => {
            warn!(restore = name, "restore is missing the site or environment label, skipping");
            return Ok(Action::await_change());
        }
    };

    let target = target_name(&environment);
    match found(ctx.store.get::<DeploymentConfig>(namespace, &target).await) {
        Ok(Some(_)) => {}
        Ok(None) => {
            info!(restore = name, %target, "restore target not found, skipping");
            return Ok(Action::await_change());
        }
        Err(source) => {
            return Err(Error::GetFailed {
                kind: "DeploymentConfig",
                name: target,
                source,
            })
        }
    }

    let owner = controller_reference(&restore)?;
    let job_name = workload::restore_job_name(name);

    let secret = workload::credentials_secret(&job_name, owner.clone(), &ctx.config.storage);
    match ctx.store.create::<Secret>(namespace, &secret).await {
        Ok(_) | Err(StoreError::AlreadyExists) => {}
        Err(source) => {
            return Err(Error::CreateFailed {
                kind: "Secret",
                name: job_name,
                source,
            })
        }
    }

    let job = workload::restore_job(&restore, &backup, &site, &environment, owner, &ctx.config);
    match ctx.store.create::<Job>(namespace, &job).await {
        Ok(_) => info!(restore = name, job = %job_name, "created restore job"),
        Err(StoreError::AlreadyExists) => {}
        Err(source) => {
            return Err(Error::CreateFailed {
                kind: "Job",
                name: job_name,
                source,
            })
        }
    }
    let job = ctx
        .store
        .get::<Job>(namespace, &job_name)
        .await
        .map_err(|source| Error::GetFailed {
            kind: "Job",
            name: job_name.clone(),
            source,
        })?;

    let status = RestoreStatus {
        phase: Some(phase::job_phase(&job)),
        start_time: job.status.as_ref().and_then(|status| status.start_time.clone()),
        completion_time: if phase::job_is_finished(&job) {
            phase::job_completion_time(&job)
        } else {
            None
        },
    };
    let phase = status.phase;
    if persist_status(
        &ctx.store,
        &mut restore,
        status,
        |restore| restore.status.as_ref(),
        |restore, status| restore.status = Some(status),
    )
    .await?
    {
        info!(restore = %restore.name_any(), ?phase, "updated restore status");
    }

    Ok(Action::await_change())
}
