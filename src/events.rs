//! Kubernetes Events attached to the objects the controllers act on.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails a
//! reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

pub mod reasons {
    pub const CREATE: &str = "Create";
    pub const DELETE: &str = "Delete";
    pub const ERROR: &str = "Error";
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    );
}

pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, regarding).await {
            warn!(%error, reason, "failed to publish event");
        }
    }
}

#[cfg(test)]
pub use recording::{RecordedEvent, RecordingPublisher};

#[cfg(test)]
mod recording {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::ObjectReference;
    use kube::runtime::events::EventType;

    use super::EventPublisher;

    #[derive(Debug, Clone)]
    pub struct RecordedEvent {
        pub regarding: Option<String>,
        pub type_: EventType,
        pub reason: String,
        pub note: String,
    }

    #[derive(Debug, Default)]
    pub struct RecordingPublisher {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingPublisher {
        pub fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
            self.events()
                .into_iter()
                .filter(|event| event.reason == reason)
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            regarding: &ObjectReference,
            type_: EventType,
            reason: &str,
            note: String,
        ) {
            self.events.lock().unwrap().push(RecordedEvent {
                regarding: regarding.name.clone(),
                type_,
                reason: reason.to_string(),
                note,
            });
        }
    }
}
