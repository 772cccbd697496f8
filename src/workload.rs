//! Manifests for the Secrets, Pods and Jobs that run the backup tooling.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    PodTemplateSpec, ResourceRequirements, Secret, SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::config::{Config, ResourceConfig, StorageConfig};
use crate::types::{Backup, Restore, SpecMySql, SpecVolume};

pub const RESTORE_PARALLELISM: i32 = 1;
pub const RESTORE_COMPLETIONS: i32 = 1;
pub const RESTORE_ACTIVE_DEADLINE_SECONDS: i64 = 3600;
pub const RESTORE_BACKOFF_LIMIT: i32 = 2;

const VOLUME_MOUNT_ROOT: &str = "/mnt/volume";

pub fn backup_pod_name(backup_name: &str) -> String {
    format!("backup-{backup_name}")
}

pub fn restore_job_name(restore_name: &str) -> String {
    format!("restore-{restore_name}")
}

/// Object-storage prefix a Backup writes to, which doubles as its snapshot id.
pub fn snapshot_id(backup: &Backup) -> String {
    format!(
        "{}/{}/{}",
        backup.namespace().unwrap_or_default(),
        backup.spec.backup_type(),
        backup.name_any()
    )
}

/// `aws <service> [--endpoint-url <url>] <operation> <args...>`
pub fn storage_command(
    endpoint: Option<&str>,
    service: &str,
    operation: &str,
    args: &[String],
) -> Vec<String> {
    let mut argv = vec!["aws".to_string(), service.to_string()];
    if let Some(endpoint) = endpoint {
        argv.push("--endpoint-url".to_string());
        argv.push(endpoint.to_string());
    }
    argv.push(operation.to_string());
    argv.extend(args.iter().cloned());
    argv
}

/// Access credentials for object storage, read by the generated containers.
pub fn credentials_secret(name: &str, owner: OwnerReference, storage: &StorageConfig) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        string_data: Some(BTreeMap::from([
            (storage.field_key_id.clone(), storage.access_key_id.clone()),
            (
                storage.field_access_key.clone(),
                storage.secret_access_key.clone(),
            ),
        ])),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

pub fn backup_pod(backup: &Backup, owner: OwnerReference, config: &Config) -> Pod {
    let name = backup_pod_name(&backup.name_any());
    let storage = &config.storage;
    let target = format!("s3://{}/{}", storage.bucket, snapshot_id(backup));

    let mut steps = vec!["set -e".to_string()];
    for key in backup.spec.volumes.keys() {
        steps.push(shell_line(&storage_command(
            storage.endpoint.as_deref(),
            "s3",
            "sync",
            &[
                format!("{VOLUME_MOUNT_ROOT}/{key}"),
                format!("{target}/volume/{key}"),
            ],
        )));
    }
    for key in backup.spec.mysql.keys() {
        let upload = storage_command(
            storage.endpoint.as_deref(),
            "s3",
            "cp",
            &["-".to_string(), format!("{target}/mysql/{key}.sql")],
        );
        steps.push(format!(
            "{} | {}",
            mysql_client("mysqldump --single-transaction", key),
            shell_line(&upload)
        ));
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(backup.labels().clone()),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            volumes: Some(claim_volumes(&backup.spec.volumes, true)),
            containers: vec![Container {
                name: "backup".to_string(),
                image: Some(config.backup_image.clone()),
                working_dir: Some(config.working_dir.clone()),
                command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), steps.join("\n")]),
                env: Some(container_env(&name, storage, &backup.spec.mysql)),
                volume_mounts: Some(volume_mounts(&backup.spec.volumes, true)),
                resources: Some(resources(&config.resources)),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        status: None,
    }
}

/// A bounded Job restoring `backup` into the volumes and databases named by
/// `restore`.
pub fn restore_job(
    restore: &Restore,
    backup: &Backup,
    site: &str,
    environment: &str,
    owner: OwnerReference,
    config: &Config,
) -> Job {
    let name = restore_job_name(&restore.name_any());
    let storage = &config.storage;
    let source = format!("s3://{}/{}", storage.bucket, snapshot_id(backup));

    let mut steps = vec!["set -e".to_string()];
    for key in restore.spec.volumes.keys() {
        steps.push(shell_line(&storage_command(
            storage.endpoint.as_deref(),
            "s3",
            "sync",
            &[
                format!("{source}/volume/{key}"),
                format!("{VOLUME_MOUNT_ROOT}/{key}"),
            ],
        )));
    }
    for key in restore.spec.mysql.keys() {
        let download = storage_command(
            storage.endpoint.as_deref(),
            "s3",
            "cp",
            &[format!("{source}/mysql/{key}.sql"), "-".to_string()],
        );
        steps.push(format!(
            "{} | {}",
            shell_line(&download),
            mysql_client("mysql", key)
        ));
    }

    let mut env = container_env(&name, storage, &restore.spec.mysql);
    env.push(plain_env("SITE", site));
    env.push(plain_env("ENVIRONMENT", environment));

    let labels = restore.labels().clone();
    Job {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            parallelism: Some(RESTORE_PARALLELISM),
            completions: Some(RESTORE_COMPLETIONS),
            active_deadline_seconds: Some(RESTORE_ACTIVE_DEADLINE_SECONDS),
            backoff_limit: Some(RESTORE_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    volumes: Some(claim_volumes(&restore.spec.volumes, false)),
                    containers: vec![Container {
                        name: "restore".to_string(),
                        image: Some(config.restore_image.clone()),
                        working_dir: Some(config.working_dir.clone()),
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            steps.join("\n"),
                        ]),
                        env: Some(env),
                        volume_mounts: Some(volume_mounts(&restore.spec.volumes, false)),
                        resources: Some(resources(&config.resources)),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        status: None,
    }
}

fn claim_volumes(volumes: &BTreeMap<String, SpecVolume>, read_only: bool) -> Vec<Volume> {
    volumes
        .iter()
        .map(|(key, volume)| Volume {
            name: volume_name(key),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: volume.claim_name.clone(),
                read_only: Some(read_only),
            }),
            ..Volume::default()
        })
        .collect()
}

fn volume_mounts(volumes: &BTreeMap<String, SpecVolume>, read_only: bool) -> Vec<VolumeMount> {
    volumes
        .keys()
        .map(|key| VolumeMount {
            name: volume_name(key),
            mount_path: format!("{VOLUME_MOUNT_ROOT}/{key}"),
            read_only: Some(read_only),
            ..VolumeMount::default()
        })
        .collect()
}

fn volume_name(key: &str) -> String {
    format!("volume-{}", key.to_lowercase().replace('_', "-"))
}

fn container_env(
    credentials_secret: &str,
    storage: &StorageConfig,
    mysql: &BTreeMap<String, SpecMySql>,
) -> Vec<EnvVar> {
    let mut env = vec![
        secret_env("AWS_ACCESS_KEY_ID", credentials_secret, &storage.field_key_id),
        secret_env(
            "AWS_SECRET_ACCESS_KEY",
            credentials_secret,
            &storage.field_access_key,
        ),
        plain_env("AWS_DEFAULT_REGION", &storage.region),
    ];
    for (key, database) in mysql {
        let secret = &database.secret;
        let fields = [
            ("HOSTNAME", &secret.keys.hostname),
            ("PORT", &secret.keys.port),
            ("USERNAME", &secret.keys.username),
            ("PASSWORD", &secret.keys.password),
            ("DATABASE", &secret.keys.database),
        ];
        for (suffix, field) in fields {
            env.push(secret_env(&mysql_env_name(key, suffix), &secret.name, field));
        }
    }
    env
}

fn mysql_env_name(key: &str, suffix: &str) -> String {
    let key = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("MYSQL_{key}_{suffix}")
}

/// A MySQL client invocation reading its connection from the per-database
/// environment variables.
fn mysql_client(program: &str, key: &str) -> String {
    let var = |suffix| format!("\"${}\"", mysql_env_name(key, suffix));
    format!(
        "{program} --host={} --port={} --user={} --password={} {}",
        var("HOSTNAME"),
        var("PORT"),
        var("USERNAME"),
        var("PASSWORD"),
        var("DATABASE"),
    )
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..SecretKeySelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

fn resources(config: &ResourceConfig) -> ResourceRequirements {
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(quantities(&config.cpu_request, &config.memory_request)),
        limits: Some(quantities(&config.cpu_limit, &config.memory_limit)),
        ..ResourceRequirements::default()
    }
}

fn shell_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
