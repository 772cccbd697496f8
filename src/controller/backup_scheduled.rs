use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{FuturesUnordered, TryStreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{error, info, warn, Instrument};

use super::{controller_reference, persist_status, Context};
use crate::error::{Error, Result};
use crate::events::reasons;
use crate::schedule;
use crate::store::{found, ObjectStore, Owner, Propagation, StoreError};
use crate::types::{
    Backup, BackupScheduled, BackupScheduledStatus, BackupSpec, ConcurrencyPolicy, Phase,
    LABEL_SITE,
};

pub const SCHEDULED_TIME_ANNOTATION: &str = "backup.example.com/scheduled-at";

pub async fn reconcile<S: ObjectStore>(
    ctx: &Context<S>,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let mut scheduled = match found(ctx.store.get::<BackupScheduled>(namespace, name).await) {
        Ok(Some(scheduled)) => scheduled,
        Ok(None) => return Ok(Action::await_change()),
        Err(source) => {
            return Err(Error::GetFailed {
                kind: "BackupScheduled",
                name: name.to_string(),
                source,
            })
        }
    };
    if !ctx.accepts(&scheduled.metadata) {
        return Ok(Action::await_change());
    }

    if scheduled.spec.schedule.crontab.is_empty() {
        return Err(Error::MissingSchedule);
    }
    if !scheduled.labels().contains_key(LABEL_SITE) {
        return Err(Error::MissingLabel(LABEL_SITE));
    }

    let owner = Owner {
        kind: "BackupScheduled",
        name,
    };
    let mut child_backups = ctx
        .store
        .list_owned::<Backup>(namespace, owner)
        .await
        .map_err(|source| Error::ListFailed {
            kind: "Backup",
            source,
        })?;

    // Scheduled times are read before retention so that deleting the newest
    // children cannot move the schedule backwards.
    let mut most_recent_time = scheduled
        .status
        .as_ref()
        .and_then(|status| status.last_executed_time.as_ref())
        .map(|time| time.0);
    for child_backup in &child_backups {
        let scheduled_time_for_backup = match get_scheduled_time_for_backup(child_backup) {
            Ok(time) => time,
            Err(error) => {
                warn!(
                    %error,
                    backup = %child_backup.name_any(),
                    "unable to parse schedule time for child backup"
                );
                continue;
            }
        };
        if most_recent_time.map_or(true, |time| time < scheduled_time_for_backup) {
            most_recent_time = Some(scheduled_time_for_backup);
        }
    }

    let max_number = scheduled.spec.retention.max_number;
    if max_number >= 1 && child_backups.len() > max_number {
        child_backups.sort_by(by_completion_newest_first);
        let expired = child_backups.split_off(max_number);
        for backup in &expired {
            delete_backup(ctx, &scheduled, backup, Propagation::Default).await?;
        }
    }

    let mut active_backups = Vec::new();
    let mut successful_backups = Vec::new();
    let mut failed_backups = Vec::new();
    for child_backup in child_backups {
        match child_backup.status.as_ref().and_then(|status| status.phase) {
            Some(Phase::Completed) => successful_backups.push(child_backup),
            Some(Phase::Failed) => failed_backups.push(child_backup),
            None | Some(Phase::New) | Some(Phase::InProgress) => active_backups.push(child_backup),
        }
    }

    info!(
        active_backups = active_backups.len(),
        successful_backups = successful_backups.len(),
        failed_backups = failed_backups.len(),
        "backup count"
    );

    let status = BackupScheduledStatus {
        last_executed_time: most_recent_time.map(Time),
        active: active_backups
            .iter()
            .map(|backup| backup.object_ref(&()))
            .collect(),
    };
    persist_status(
        &ctx.store,
        &mut scheduled,
        status,
        |scheduled| scheduled.status.as_ref(),
        |scheduled, status| scheduled.status = Some(status),
    )
    .await?;

    if let Some(limit) = scheduled.spec.schedule.failed_history_limit {
        prune_history(ctx, &scheduled, &mut failed_backups, limit).await?;
    }
    if let Some(limit) = scheduled.spec.schedule.successful_history_limit {
        prune_history(ctx, &scheduled, &mut successful_backups, limit).await?;
    }

    if scheduled.spec.schedule.suspend {
        info!("backup schedule suspended, skipping");
        return Ok(Action::await_change());
    }

    schedule_next_backup(ctx, &scheduled, &active_backups).await
}

/// Fires the most recent missed run, if any, honouring the starting deadline
/// and the concurrency policy. Always requeues for the next fire time.
pub async fn schedule_next_backup<S: ObjectStore>(
    ctx: &Context<S>,
    scheduled: &BackupScheduled,
    active_backups: &[Backup],
) -> Result<Action> {
    let now = ctx.clock.now();
    let created_at = scheduled
        .meta()
        .creation_timestamp
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.creationTimestamp"))?
        .0;
    let last_executed = scheduled
        .status
        .as_ref()
        .and_then(|status| status.last_executed_time.as_ref())
        .map(|time| time.0);

    let (missed_run, next_run) = schedule::next_schedule(
        &scheduled.spec.schedule.crontab,
        last_executed,
        created_at,
        now,
    )?;

    let requeue_after = if now < next_run {
        next_run - now
    } else {
        Duration::seconds(0)
    };
    let scheduled_action = Action::requeue(requeue_after.to_std().map_err(Error::TimeOutOfRange)?);
    let scheduling_span = tracing::info_span!("scheduling", %now, %next_run);

    let missed_run = if let Some(run) = missed_run {
        run
    } else {
        scheduling_span.in_scope(|| info!("no upcoming scheduled times, sleeping until next"));
        return Ok(scheduled_action);
    };

    fire_missed_run(ctx, scheduled, active_backups, missed_run, now)
        .instrument(tracing::info_span!(parent: &scheduling_span, "current run", %missed_run))
        .await?;

    Ok(scheduled_action)
}

async fn fire_missed_run<S: ObjectStore>(
    ctx: &Context<S>,
    scheduled: &BackupScheduled,
    active_backups: &[Backup],
    missed_run: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    let namespace = scheduled.namespace().unwrap_or_default();

    let too_late = if let Some(starting_deadline_seconds) =
        scheduled.spec.schedule.starting_deadline_seconds
    {
        missed_run + Duration::seconds(starting_deadline_seconds) < now
    } else {
        false
    };
    if too_late {
        info!("missed starting deadline for last run, sleeping till next");
        return Ok(());
    }

    match scheduled.spec.schedule.concurrency_policy {
        ConcurrencyPolicy::Forbid if !active_backups.is_empty() => {
            info!(
                num_active = active_backups.len(),
                "concurrency policy blocks concurrent runs, skipping"
            );
            return Ok(());
        }
        ConcurrencyPolicy::Replace => {
            active_backups
                .iter()
                .map(|backup| delete_backup(ctx, scheduled, backup, Propagation::Background))
                .collect::<FuturesUnordered<_>>()
                .try_collect::<()>()
                .await?;
        }
        _ => {}
    }

    let backup = construct_backup_for_schedule(scheduled, missed_run)?;
    let backup_name = backup.name_any();

    let existing = found(ctx.store.get::<Backup>(&namespace, &backup_name).await).map_err(
        |source| Error::GetFailed {
            kind: "Backup",
            name: backup_name.clone(),
            source,
        },
    )?;
    if existing.is_some() {
        info!(backup = %backup_name, "backup for this run already exists");
        return Ok(());
    }

    match ctx.store.create(&namespace, &backup).await {
        Ok(_) => {}
        Err(StoreError::AlreadyExists) => return Ok(()),
        Err(source) => {
            return Err(Error::CreateFailed {
                kind: "Backup",
                name: backup_name,
                source,
            })
        }
    }

    info!(backup = %backup_name, "created Backup for BackupScheduled run");
    ctx.events
        .publish(
            &scheduled.object_ref(&()),
            EventType::Normal,
            reasons::CREATE,
            format!("Creating Backup {backup_name}"),
        )
        .await;

    Ok(())
}

/// Keeps the `limit` most recently started backups of one outcome class.
async fn prune_history<S: ObjectStore>(
    ctx: &Context<S>,
    scheduled: &BackupScheduled,
    backups: &mut [Backup],
    limit: usize,
) -> Result<()> {
    backups.sort_unstable_by(by_start_oldest_first);
    backups
        .iter()
        .rev()
        .skip(limit)
        .map(|backup| delete_backup(ctx, scheduled, backup, Propagation::Background))
        .collect::<FuturesUnordered<_>>()
        .try_collect::<()>()
        .await
}

async fn delete_backup<S: ObjectStore>(
    ctx: &Context<S>,
    scheduled: &BackupScheduled,
    backup: &Backup,
    propagation: Propagation,
) -> Result<()> {
    let name = backup.name_any();
    let namespace = backup.namespace().unwrap_or_default();
    match ctx.store.delete::<Backup>(&namespace, &name, propagation).await {
        Ok(()) => {}
        Err(StoreError::NotFound) => return Ok(()),
        Err(source) => {
            error!(error = %source, backup = %name, "unable to delete backup");
            ctx.events
                .publish(
                    &scheduled.object_ref(&()),
                    EventType::Warning,
                    reasons::ERROR,
                    format!("Failed to delete Backup {name}: {source}"),
                )
                .await;
            return Err(Error::DeleteFailed {
                kind: "Backup",
                name,
                source,
            });
        }
    }
    info!(backup = %name, "deleted backup");
    ctx.events
        .publish(
            &scheduled.object_ref(&()),
            EventType::Normal,
            reasons::DELETE,
            format!("Deleting Backup {name}"),
        )
        .await;
    Ok(())
}

/// Completed backups newest first; backups without a completion time go
/// last, in reverse name order.
fn by_completion_newest_first(left: &Backup, right: &Backup) -> Ordering {
    let completion = |backup: &Backup| {
        backup
            .status
            .as_ref()
            .and_then(|status| status.completion_time.as_ref())
            .map(|time| time.0)
    };
    match (completion(left), completion(right)) {
        (Some(left_time), Some(right_time)) => right_time
            .cmp(&left_time)
            .then_with(|| right.name_any().cmp(&left.name_any())),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => right.name_any().cmp(&left.name_any()),
    }
}

/// Oldest start first; backups that never started sort before all others.
fn by_start_oldest_first(left: &Backup, right: &Backup) -> Ordering {
    match (
        left.status
            .as_ref()
            .and_then(|status| status.start_time.as_ref()),
        right
            .status
            .as_ref()
            .and_then(|status| status.start_time.as_ref()),
    ) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left_time), Some(right_time)) => left_time.0.cmp(&right_time.0),
    }
}

fn get_scheduled_time_for_backup(backup: &Backup) -> Result<DateTime<Utc>, anyhow::Error> {
    let time_raw = backup
        .annotations()
        .get(SCHEDULED_TIME_ANNOTATION)
        .ok_or_else(|| anyhow::Error::msg("failed to find scheduled time annotation"))?;
    if time_raw.is_empty() {
        return Err(anyhow::Error::msg("scheduled time annotation is empty"));
    }
    let time_parsed = DateTime::parse_from_rfc3339(time_raw)?;
    Ok(time_parsed.with_timezone(&Utc))
}

fn construct_backup_for_schedule(
    scheduled: &BackupScheduled,
    scheduled_time: DateTime<Utc>,
) -> Result<Backup> {
    let name = format!("{}-{}", scheduled.name_any(), scheduled_time.timestamp());

    let mut backup = Backup {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: scheduled.namespace(),
            labels: Some(scheduled.labels().clone()),
            owner_references: Some(vec![controller_reference(scheduled)?]),
            ..ObjectMeta::default()
        },
        spec: BackupSpec {
            type_: None,
            volumes: scheduled.spec.volumes.clone(),
            mysql: scheduled.spec.mysql.clone(),
        },
        status: None,
    };
    backup.annotations_mut().insert(
        SCHEDULED_TIME_ANNOTATION.to_string(),
        scheduled_time.to_rfc3339(),
    );

    Ok(backup)
}
