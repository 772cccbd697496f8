//! Maps the state of Pods, Jobs and deployments onto [`Phase`].

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{Job, JobCondition};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::types::{DeploymentConfig, Phase};

pub fn pod_phase(status: Option<&PodStatus>) -> Phase {
    match status.and_then(|status| status.phase.as_deref()) {
        Some("Succeeded") => Phase::Completed,
        Some("Failed") => Phase::Failed,
        _ => Phase::InProgress,
    }
}

/// Latest container termination time, or the Pod's creation time when no
/// container has terminated yet.
pub fn pod_completion_time(pod: &Pod) -> Option<Time> {
    pod.status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten())
        .filter_map(|container| {
            container
                .state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
                .and_then(|terminated| terminated.finished_at.clone())
        })
        .max_by(|left, right| left.0.cmp(&right.0))
        .or_else(|| pod.metadata.creation_timestamp.clone())
}

pub fn job_is_finished(job: &Job) -> bool {
    job_finished_condition(job).is_some()
}

fn job_finished_condition(job: &Job) -> Option<&JobCondition> {
    job.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions.iter().find(|condition| {
                (condition.type_ == "Complete" || condition.type_ == "Failed")
                    && condition.status == "True"
            })
        })
}

pub fn job_phase(job: &Job) -> Phase {
    let status = job.status.clone().unwrap_or_default();
    if status.active.unwrap_or(0) > 0 {
        Phase::InProgress
    } else if status.succeeded.unwrap_or(0) > 0 {
        Phase::Completed
    } else if status.failed.unwrap_or(0) > 0 {
        Phase::Failed
    } else {
        Phase::New
    }
}

/// When the Job finished: its completion time, or the transition time of the
/// condition that ended it.
pub fn job_completion_time(job: &Job) -> Option<Time> {
    job.status
        .as_ref()
        .and_then(|status| status.completion_time.clone())
        .or_else(|| job_finished_condition(job).and_then(|c| c.last_transition_time.clone()))
}

pub fn deployment_phase(deployment: &Deployment) -> Phase {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let wanted = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let status = match deployment.status.as_ref() {
        Some(status) => status,
        None => return Phase::New,
    };

    let deadline_exceeded = status.conditions.iter().flatten().any(|condition| {
        condition.type_ == "Progressing"
            && condition.reason.as_deref() == Some("ProgressDeadlineExceeded")
    });
    if deadline_exceeded {
        return Phase::Failed;
    }

    if status.observed_generation.unwrap_or(0) < generation {
        return Phase::InProgress;
    }
    let updated = status.updated_replicas.unwrap_or(0);
    if updated < wanted
        || status.replicas.unwrap_or(0) > updated
        || status.available_replicas.unwrap_or(0) < updated
    {
        return Phase::InProgress;
    }

    Phase::Completed
}

pub fn deployment_config_is_available(deployment_config: &DeploymentConfig) -> bool {
    deployment_config
        .status
        .iter()
        .flat_map(|status| status.conditions.iter())
        .any(|condition| condition.type_ == "Available" && condition.status == "True")
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::types::{DeploymentConfigCondition, DeploymentConfigStatus};

    fn time(hour: u32) -> Time {
        Time(Utc.with_ymd_and_hms(2020, 4, 1, hour, 0, 0).unwrap())
    }

    fn terminated_at(hour: u32) -> ContainerStatus {
        ContainerStatus {
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    finished_at: Some(time(hour)),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_phase_mapping() {
        let with = |phase: &str| PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        };
        assert_eq!(pod_phase(Some(&with("Succeeded"))), Phase::Completed);
        assert_eq!(pod_phase(Some(&with("Failed"))), Phase::Failed);
        assert_eq!(pod_phase(Some(&with("Running"))), Phase::InProgress);
        assert_eq!(pod_phase(Some(&with("Pending"))), Phase::InProgress);
        assert_eq!(pod_phase(None), Phase::InProgress);
    }

    #[test]
    fn completion_time_is_latest_termination() {
        let pod = Pod {
            metadata: ObjectMeta {
                creation_timestamp: Some(time(1)),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(vec![
                    terminated_at(3),
                    terminated_at(5),
                    terminated_at(4),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(pod_completion_time(&pod), Some(time(5)));
    }

    #[test]
    fn completion_time_defaults_to_creation() {
        let pod = Pod {
            metadata: ObjectMeta {
                creation_timestamp: Some(time(1)),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus::default()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(pod_completion_time(&pod), Some(time(1)));
    }

    #[test]
    fn job_status_mapping() {
        let job = |active, succeeded, failed| Job {
            status: Some(JobStatus {
                active: Some(active),
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(job_phase(&job(1, 0, 1)), Phase::InProgress);
        assert_eq!(job_phase(&job(0, 1, 1)), Phase::Completed);
        assert_eq!(job_phase(&job(0, 0, 2)), Phase::Failed);
        assert_eq!(job_phase(&job(0, 0, 0)), Phase::New);
        assert_eq!(job_phase(&Job::default()), Phase::New);
    }

    #[test]
    fn job_finished_requires_true_terminal_condition() {
        let job = |type_: &str, status: &str| Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    last_transition_time: Some(time(7)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(job_is_finished(&job("Complete", "True")));
        assert!(job_is_finished(&job("Failed", "True")));
        assert!(!job_is_finished(&job("Failed", "False")));
        assert!(!job_is_finished(&job("Suspended", "True")));
        assert!(!job_is_finished(&Job::default()));
        assert_eq!(job_completion_time(&job("Failed", "True")), Some(time(7)));
    }

    #[test]
    fn deployment_rollout_phases() {
        let deployment = |generation, observed, updated, available| Deployment {
            metadata: ObjectMeta {
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                replicas: Some(2),
                updated_replicas: Some(updated),
                available_replicas: Some(available),
                ..Default::default()
            }),
        };
        assert_eq!(deployment_phase(&deployment(2, 2, 2, 2)), Phase::Completed);
        assert_eq!(deployment_phase(&deployment(3, 2, 2, 2)), Phase::InProgress);
        assert_eq!(deployment_phase(&deployment(2, 2, 1, 1)), Phase::InProgress);
        assert_eq!(deployment_phase(&deployment(2, 2, 2, 1)), Phase::InProgress);
        assert_eq!(deployment_phase(&Deployment::default()), Phase::New);

        let mut stuck = deployment(2, 2, 1, 1);
        stuck.status.as_mut().unwrap().conditions = Some(vec![DeploymentCondition {
            type_: "Progressing".to_string(),
            status: "False".to_string(),
            reason: Some("ProgressDeadlineExceeded".to_string()),
            ..Default::default()
        }]);
        assert_eq!(deployment_phase(&stuck), Phase::Failed);
    }

    #[test]
    fn deployment_config_availability() {
        let mut dc = DeploymentConfig::new("node-dev", Default::default());
        assert!(!deployment_config_is_available(&dc));

        dc.status = Some(DeploymentConfigStatus {
            available_replicas: Some(1),
            conditions: vec![DeploymentConfigCondition {
                type_: "Available".to_string(),
                status: "False".to_string(),
                reason: None,
            }],
        });
        assert!(!deployment_config_is_available(&dc));

        dc.status.as_mut().unwrap().conditions[0].status = "True".to_string();
        assert!(deployment_config_is_available(&dc));
    }
}
