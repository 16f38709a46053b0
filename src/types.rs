use bson::{spec::BinarySubtype, Binary, Bson, DateTime, Document};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Lifecycle of a job record. Unknown values fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Ready,
    /// Claimed by exactly one worker.
    Processing,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ready => "ready",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
        }
    }
}

impl From<JobStatus> for Bson {
    fn from(status: JobStatus) -> Self {
        Bson::String(status.as_str().to_string())
    }
}

/// One document per enqueue. All logical queues share a collection and are told apart by `queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    pub status: JobStatus,
    pub job_id: String,
    pub queue: String,
    pub payload: Binary,
    /// FIFO key: enqueue time, or the last time the record went back to ready.
    pub created_at: DateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime>,
}

impl JobRow {
    pub fn ready(job_id: &str, queue: &str, payload: Vec<u8>, created_at: DateTime) -> Self {
        Self {
            status: JobStatus::Ready,
            job_id: job_id.to_string(),
            queue: queue.to_string(),
            payload: Binary {
                subtype: BinarySubtype::Generic,
                bytes: payload,
            },
            created_at,
            claimed_at: None,
        }
    }

    pub fn to_document(&self) -> Result<Document, RecordError> {
        bson::to_document(self).map_err(|e| RecordError::Encoding(e.into()))
    }

    pub fn from_document(document: Document) -> Result<Self, RecordError> {
        bson::from_document(document).map_err(|e| RecordError::Decoding(e.into()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        bson::to_vec(self).map_err(|e| RecordError::Encoding(e.into()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        bson::from_slice(bytes).map_err(|e| RecordError::Decoding(e.into()))
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload.bytes
    }
}
