use std::sync::Arc;

use anyhow::Result;
use futures_util::future;
use futures_util::stream::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use tracing_subscriber::EnvFilter;

use backup_operator::clock::SystemClock;
use backup_operator::config::Config;
use backup_operator::controller::{self, backup, backup_scheduled, restore, sync, Context};
use backup_operator::error::Error;
use backup_operator::events::KubeEventPublisher;
use backup_operator::store::KubeStore;
use backup_operator::types::{Backup, BackupScheduled, Restore, Sync};

const CONTROLLER_NAME: &str = "backup-operator";

type Ctx = Context<KubeStore>;

fn object_key<K: Resource>(object: &K) -> Result<(String, String), Error> {
    let namespace = object
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    Ok((namespace, object.name_any()))
}

async fn reconcile_backup(object: Arc<Backup>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let (namespace, name) = object_key(object.as_ref())?;
    backup::reconcile(&ctx, &namespace, &name).await
}

async fn reconcile_backup_scheduled(
    object: Arc<BackupScheduled>,
    ctx: Arc<Ctx>,
) -> Result<Action, Error> {
    let (namespace, name) = object_key(object.as_ref())?;
    backup_scheduled::reconcile(&ctx, &namespace, &name).await
}

async fn reconcile_restore(object: Arc<Restore>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let (namespace, name) = object_key(object.as_ref())?;
    restore::reconcile(&ctx, &namespace, &name).await
}

async fn reconcile_sync_backup(object: Arc<Sync>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let (namespace, name) = object_key(object.as_ref())?;
    sync::reconcile_backup_stage(&ctx, &namespace, &name).await
}

async fn reconcile_sync_restore(object: Arc<Sync>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let (namespace, name) = object_key(object.as_ref())?;
    sync::reconcile_restore_stage(&ctx, &namespace, &name).await
}

fn error_policy<K>(object: Arc<K>, error: &Error, ctx: Arc<Ctx>) -> Action {
    controller::error_policy(object, error, &ctx.config)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing(&config);

    let client = Client::try_default().await?;
    let ctx = Arc::new(Context {
        store: KubeStore::new(client.clone()),
        events: Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
        clock: Arc::new(SystemClock),
        config: Arc::new(config),
    });

    let backups = Controller::new(Api::<Backup>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Pod>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_backup, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("reconciled {:?}", o),
                Err(e) => tracing::warn!("reconcile failed: {}", e),
            }
        });

    let schedules = Controller::new(
        Api::<BackupScheduled>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(Api::<Backup>::all(client.clone()), watcher::Config::default())
    .shutdown_on_signal()
    .run(reconcile_backup_scheduled, error_policy, ctx.clone())
    .for_each(|res| async move {
        match res {
            Ok(o) => tracing::info!("reconciled {:?}", o),
            Err(e) => tracing::warn!("reconcile failed: {}", e),
        }
    });

    let restores = Controller::new(Api::<Restore>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Job>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_restore, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("reconciled {:?}", o),
                Err(e) => tracing::warn!("reconcile failed: {}", e),
            }
        });

    let sync_backups = Controller::new(Api::<Sync>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Backup>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_sync_backup, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("reconciled sync backup stage {:?}", o),
                Err(e) => tracing::warn!("sync backup stage failed: {}", e),
            }
        });

    let sync_restores = Controller::new(
        Api::<Sync>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(Api::<Restore>::all(client), watcher::Config::default())
    .shutdown_on_signal()
    .run(reconcile_sync_restore, error_policy, ctx)
    .for_each(|res| async move {
        match res {
            Ok(o) => tracing::info!("reconciled sync restore stage {:?}", o),
            Err(e) => tracing::warn!("sync restore stage failed: {}", e),
        }
    });

    future::join5(backups, schedules, restores, sync_backups, sync_restores).await;

    tracing::info!("controller terminated");

    Ok(())
}
