use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// The queue operation an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    EnsureIndexes,
    Enqueue,
    Claim,
    FetchPayload,
    Complete,
    Release,
    RequeueStale,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::EnsureIndexes => "ensure_indexes",
            Operation::Enqueue => "enqueue",
            Operation::Claim => "claim_next",
            Operation::FetchPayload => "fetch_payload",
            Operation::Complete => "complete",
            Operation::Release => "release",
            Operation::RequeueStale => "requeue_stale",
        };
        f.write_str(name)
    }
}

/// Codec failure on a job record or payload, before queue context is attached.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to encode")]
    Encoding(#[source] anyhow::Error),

    #[error("failed to decode")]
    Decoding(#[source] anyhow::Error),
}

/// Every variant names the operation, queue and job id it came from. `job_id` is empty for
/// queue-wide operations (`claim_next` before a record is picked, `ensure_indexes`, `requeue_stale`).
#[derive(Debug, Error)]
pub enum QueueError {
    /// Connectivity loss. Retry with backoff; nothing is retried internally.
    #[error("document store unavailable during {operation} of job {job_id:?} on queue {queue:?}")]
    StoreUnavailable {
        operation: Operation,
        job_id: String,
        queue: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} of job {job_id:?} on queue {queue:?} violates the unique job index")]
    DuplicateKey {
        operation: Operation,
        job_id: String,
        queue: String,
    },

    /// No processing record to read. Fatal for the current attempt.
    #[error("no processing job {job_id:?} in queue {queue:?}")]
    MissingJob { job_id: String, queue: String },

    /// The conditional transition matched nothing: the race was lost or the caller misused the handle.
    #[error("{operation} matched no processing job {job_id:?} in queue {queue:?}")]
    ModificationFailed {
        operation: Operation,
        job_id: String,
        queue: String,
    },

    #[error("failed to encode job {job_id:?} for {operation} on queue {queue:?}")]
    Encoding {
        operation: Operation,
        job_id: String,
        queue: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to decode job {job_id:?} during {operation} on queue {queue:?}")]
    Decoding {
        operation: Operation,
        job_id: String,
        queue: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} of job {job_id:?} failed on queue {queue:?}")]
    Store {
        operation: Operation,
        job_id: String,
        queue: String,
        #[source]
        source: anyhow::Error,
    },
}

impl QueueError {
    /// Maps an adapter failure into the queue taxonomy.
    pub(crate) fn from_store(err: StoreError, operation: Operation, job_id: &str, queue: &str) -> Self {
        let (job_id, queue) = (job_id.to_string(), queue.to_string());
        match err {
            StoreError::Unavailable(source) => QueueError::StoreUnavailable {
                operation,
                job_id,
                queue,
                source,
            },
            StoreError::DuplicateKey(_) => QueueError::DuplicateKey {
                operation,
                job_id,
                queue,
            },
            StoreError::Other(source) => QueueError::Store {
                operation,
                job_id,
                queue,
                source,
            },
        }
    }

    pub(crate) fn from_record(err: RecordError, operation: Operation, job_id: &str, queue: &str) -> Self {
        let (job_id, queue) = (job_id.to_string(), queue.to_string());
        match err {
            RecordError::Encoding(source) => QueueError::Encoding {
                operation,
                job_id,
                queue,
                source,
            },
            RecordError::Decoding(source) => QueueError::Decoding {
                operation,
                job_id,
                queue,
                source,
            },
        }
    }

    /// Transient failures a poller should treat as "try again later".
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable { .. })
    }

    pub fn operation(&self) -> Operation {
        match self {
            QueueError::StoreUnavailable { operation, .. }
            | QueueError::DuplicateKey { operation, .. }
            | QueueError::ModificationFailed { operation, .. }
            | QueueError::Encoding { operation, .. }
            | QueueError::Decoding { operation, .. }
            | QueueError::Store { operation, .. } => *operation,
            QueueError::MissingJob { .. } => Operation::FetchPayload,
        }
    }
}
