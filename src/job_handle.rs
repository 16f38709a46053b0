use bson::DateTime;

use crate::types::JobRow;

/// A claimed job. Only the holder of a claim should complete or release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    job_id: String,
    queue: String,
    claimed_at: Option<DateTime>,
}

impl JobHandle {
    /// Builds a handle for a job claimed elsewhere, e.g. to release work left behind by a crashed worker.
    pub fn new(job_id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            queue: queue.into(),
            claimed_at: None,
        }
    }

    pub(crate) fn from_row(row: JobRow) -> Self {
        Self {
            job_id: row.job_id,
            queue: row.queue,
            claimed_at: row.claimed_at,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn claimed_at(&self) -> Option<DateTime> {
        self.claimed_at
    }
}
