use std::path::PathBuf;
use std::time::Duration;

use bson::doc;
use serde::Deserialize;

use crate::{store::IndexSpec, types::JobStatus};

pub const DEFAULT_DATABASE: &str = "queues";
pub const DEFAULT_COLLECTION: &str = "job_queue";

/// Which records the unique `(job_id, queue)` index covers.
///
/// `JobAndQueue` is the historical layout: once a job id has a record in a queue, any later
/// enqueue of that id fails, even after completion. `JobQueueAndStatus` only covers ready and
/// processing records, so an id can be enqueued again once its earlier record has completed,
/// and completed records never collide with each other. The partial filter uses `$in`, which
/// needs MongoDB 6.0 or later.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexScope {
    #[default]
    JobAndQueue,
    JobQueueAndStatus,
}

impl IndexScope {
    pub fn index(&self) -> IndexSpec {
        match self {
            IndexScope::JobAndQueue => IndexSpec {
                name: "job_index".to_string(),
                keys: doc! { "job_id": 1, "queue": 1 },
                unique: true,
                partial_filter: None,
            },
            IndexScope::JobQueueAndStatus => IndexSpec {
                name: "live_job_index".to_string(),
                keys: doc! { "job_id": 1, "queue": 1 },
                unique: true,
                partial_filter: Some(doc! {
                    "status": { "$in": [JobStatus::Ready, JobStatus::Processing] }
                }),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoDbConfig {
    pub uri: String,
    /// CA file. Enables TLS.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// Falls back to the database named in the URI, then `queues`.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub index_scope: IndexScope,
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

impl MongoDbConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            cert_file: None,
            database: None,
            collection: default_collection(),
            index_scope: IndexScope::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub poll_interval: Duration,
    /// Jobs processed at once by one runner.
    pub concurrency: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            concurrency: 10,
        }
    }
}
