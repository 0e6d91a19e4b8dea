// Job Events - observed by UI/operator layers through Supervisor::subscribe

use super::job::{JobId, JobState};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    Discovered {
        job_id: JobId,
    },
    StateChanged {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    Removed {
        job_id: JobId,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Discovered { job_id }
            | JobEvent::StateChanged { job_id, .. }
            | JobEvent::Removed { job_id } => job_id,
        }
    }
}
