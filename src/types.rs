use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the site a workload belongs to.
pub const LABEL_SITE: &str = "site";

/// Label carrying the environment a workload belongs to.
pub const LABEL_ENVIRONMENT: &str = "environment";

/// Backup type used when none is given.
pub const DEFAULT_BACKUP_TYPE: &str = "system";

/// Coarse lifecycle shared by Backup, Restore and Sync status.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    New,
    InProgress,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

/// Absent phases have not been observed yet and count as active.
pub fn is_terminal(phase: Option<Phase>) -> bool {
    phase.map_or(false, Phase::is_terminal)
}

/// A persistent volume claim to archive or restore into.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpecVolume {
    pub claim_name: String,
}

/// A MySQL database whose connection details live in a Secret.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpecMySql {
    pub secret: SpecMySqlSecret,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpecMySqlSecret {
    /// Name of the Secret in the same namespace.
    pub name: String,
    pub keys: SpecMySqlSecretKeys,
}

/// Field names inside the referenced Secret.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpecMySqlSecretKeys {
    pub username: String,
    pub password: String,
    pub database: String,
    pub hostname: String,
    pub port: String,
}

/// BackupSpec defines a point-in-time capture of volumes and databases.
#[derive(CustomResource, Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "backup.example.com",
    version = "v1",
    kind = "Backup",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "BackupStatus")]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Free-form classification, `system` when unset.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// Volumes to archive, keyed by logical name.
    #[serde(default)]
    pub volumes: BTreeMap<String, SpecVolume>,

    /// Databases to dump, keyed by logical name.
    #[serde(default)]
    pub mysql: BTreeMap<String, SpecMySql>,
}

impl BackupSpec {
    pub fn backup_type(&self) -> &str {
        match self.type_.as_deref() {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_BACKUP_TYPE,
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
}

/// BackupScheduledSpec defines a recurring backup policy.
#[derive(CustomResource, Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[kube(
    group = "backup.example.com",
    version = "v1",
    kind = "BackupScheduled",
    namespaced,
    printcolumn = r#"{"name":"Schedule", "type":"string", "jsonPath":".spec.schedule.crontab"}"#,
    printcolumn = r#"{"name":"Last", "type":"date", "jsonPath":".status.lastExecutedTime"}"#
)]
#[kube(status = "BackupScheduledStatus")]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduledSpec {
    #[serde(default)]
    pub retention: Retention,

    pub schedule: ScheduleSpec,

    #[serde(default)]
    pub volumes: BTreeMap<String, SpecVolume>,

    #[serde(default)]
    pub mysql: BTreeMap<String, SpecMySql>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Retention {
    /// Number of Backups to keep, ordered by completion time. Zero disables retention.
    #[serde(default)]
    pub max_number: usize,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    /// The schedule in Cron format, see <https://en.wikipedia.org/wiki/Cron>.
    #[serde(default)]
    pub crontab: String,

    /// Optional deadline in seconds for starting a Backup if it misses its
    /// scheduled time for any reason.
    #[serde(default)]
    pub starting_deadline_seconds: Option<i64>,

    /// Specifies how to treat concurrent executions of a Backup.
    /// Valid values are:
    /// - "Allow" (default): allows Backups to run concurrently;
    /// - "Forbid": forbids concurrent runs, skipping next run if previous run hasn't finished yet;
    /// - "Replace": cancels currently running Backups and replaces them with a new one
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,

    /// Suspends subsequent executions, it does not apply to already started
    /// executions. Defaults to false.
    #[serde(default)]
    pub suspend: bool,

    /// The number of successful finished Backups to retain.
    #[serde(default)]
    pub successful_history_limit: Option<usize>,

    /// The number of failed finished Backups to retain.
    #[serde(default)]
    pub failed_history_limit: Option<usize>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    #[default]
    Allow,
    Forbid,
    Replace,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduledStatus {
    /// Scheduled time of the most recent Backup this policy produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_time: Option<Time>,

    /// Pointers to currently running Backups.
    #[serde(default)]
    pub active: Vec<ObjectReference>,
}

/// RestoreSpec recovers volumes and databases from a completed Backup.
#[derive(CustomResource, Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "backup.example.com",
    version = "v1",
    kind = "Restore",
    namespaced,
    printcolumn = r#"{"name":"Backup", "type":"string", "jsonPath":".spec.backupName"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[kube(status = "RestoreStatus")]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    pub backup_name: String,

    #[serde(default)]
    pub volumes: BTreeMap<String, SpecVolume>,

    #[serde(default)]
    pub mysql: BTreeMap<String, SpecMySql>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
}

/// SyncSpec copies one environment's data into another: a Backup of
/// `backupEnv` followed by a Restore into `restoreEnv`.
#[derive(CustomResource, Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[kube(
    group = "backup.example.com",
    version = "v1",
    kind = "Sync",
    namespaced,
    printcolumn = r#"{"name":"Backup", "type":"string", "jsonPath":".status.backup.phase"}"#,
    printcolumn = r#"{"name":"Restore", "type":"string", "jsonPath":".status.restore.phase"}"#
)]
#[kube(status = "SyncStatus")]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    pub site: String,
    pub backup_env: String,
    pub restore_env: String,

    #[serde(default)]
    pub backup_spec: BackupSpec,

    #[serde(default)]
    pub restore_spec: BackupSpec,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    #[serde(default)]
    pub backup: SyncBackupStatus,

    #[serde(default)]
    pub restore: SyncRestoreStatus,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncBackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRestoreStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
}

/// The subset of an OpenShift `DeploymentConfig` the operator reads.
/// Owned by OpenShift, never generated by `crdgen`.
#[derive(CustomResource, Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[kube(
    group = "apps.openshift.io",
    version = "v1",
    kind = "DeploymentConfig",
    namespaced
)]
#[kube(status = "DeploymentConfigStatus")]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigStatus {
    #[serde(default)]
    pub available_replicas: Option<i32>,

    #[serde(default)]
    pub conditions: Vec<DeploymentConfigCondition>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Every resource kind this operator serves, in the order `crdgen` prints them.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![Backup::crd(), BackupScheduled::crd(), Restore::crd(), Sync::crd()]
}
