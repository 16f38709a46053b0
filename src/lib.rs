//! A polling job queue kept in one MongoDB collection.
//!
//! Workers never share memory: a job is claimed by flipping its status from `ready` to
//! `processing` in a single `findAndModify`, so at most one poller wins each job. Released jobs go
//! to the back of their queue. Delivery is at least once; a claimed job has no lease unless
//! [`JobQueue::requeue_stale`] is run by someone.

pub mod config;
pub mod error;
mod job_handle;
mod queue;
pub mod runner;
pub mod store;
mod types;

pub use config::{IndexScope, MongoDbConfig, RunnerOptions};
pub use error::{Operation, QueueError, RecordError};
pub use job_handle::JobHandle;
pub use queue::JobQueue;
pub use runner::{JobData, JobOutcome, JobProcessor, JobRunner, RunnerRouter};
pub use store::{DocumentStore, MemoryStore, MongoDbStore, StoreError};
pub use types::{JobRow, JobStatus};
