use thiserror::Error;

use crate::schedule::ScheduleError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Failed to get {kind} {name}: {source}")]
    GetFailed {
        kind: &'static str,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("Failed to list child {kind}s: {source}")]
    ListFailed {
        kind: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("Failed to create {kind} {name}: {source}")]
    CreateFailed {
        kind: &'static str,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("Failed to delete {kind} {name}: {source}")]
    DeleteFailed {
        kind: &'static str,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("Failed to update status: {0}")]
    UpdateStatusFailed(#[source] StoreError),
    #[error("Schedule is not defined")]
    MissingSchedule,
    #[error("Label {0:?} is not defined")]
    MissingLabel(&'static str),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("Time is out of range")]
    TimeOutOfRange(#[source] chrono::OutOfRangeError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
