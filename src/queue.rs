use std::sync::Arc;

use bson::doc;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::{
    config::IndexScope,
    error::{Operation, QueueError},
    job_handle::JobHandle,
    store::{DocumentStore, MongoDbStore, ReturnPolicy},
    types::{JobRow, JobStatus},
};

fn now() -> bson::DateTime {
    bson::DateTime::from_millis(Utc::now().timestamp_millis())
}

/// Job queue over a shared document collection.
///
/// Every state change is one conditional find-and-modify on a single document, so any number of
/// processes can poll the same collection without other coordination.
pub struct JobQueue<S = MongoDbStore> {
    store: Arc<S>,
    index_scope: IndexScope,
}

impl<S> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            index_scope: self.index_scope,
        }
    }
}

impl<S: DocumentStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self::with_index_scope(store, IndexScope::default())
    }

    pub fn with_index_scope(store: S, index_scope: IndexScope) -> Self {
        Self {
            store: Arc::new(store),
            index_scope,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates the unique job index. Safe to call on every startup.
    #[instrument(skip_all, err)]
    pub async fn ensure_indexes(&self) -> Result<(), QueueError> {
        self.store
            .create_index(self.index_scope.index())
            .await
            .map_err(|e| QueueError::from_store(e, Operation::EnsureIndexes, "", ""))
    }

    /// Inserts a new ready record. Never touches existing records.
    #[instrument(skip_all, err, fields(job_id = %job_id, queue = %queue, payload_size = payload.len()))]
    pub async fn enqueue(&self, job_id: &str, queue: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let document = JobRow::ready(job_id, queue, payload, now())
            .to_document()
            .map_err(|e| QueueError::from_record(e, Operation::Enqueue, job_id, queue))?;

        self.store
            .insert_one(document)
            .await
            .map_err(|e| QueueError::from_store(e, Operation::Enqueue, job_id, queue))
    }

    /// Claims the oldest ready job in `queue`. `None` means the queue is idle.
    #[instrument(skip_all, err, fields(queue = %queue))]
    pub async fn claim_next(&self, queue: &str) -> Result<Option<JobHandle>, QueueError> {
        let filter = doc! {
            "queue": queue,
            "status": JobStatus::Ready,
        };
        let update = doc! {
            "$set": {
                "status": JobStatus::Processing,
                "claimed_at": now(),
            }
        };

        let claimed = self
            .store
            .find_one_and_update(filter, update, Some(doc! { "created_at": 1 }), ReturnPolicy::After)
            .await
            .map_err(|e| QueueError::from_store(e, Operation::Claim, "", queue))?;

        match claimed {
            Some(document) => {
                // The record is already processing; name it even if the rest fails to decode.
                let job_id = document.get_str("job_id").unwrap_or_default().to_string();
                let row = JobRow::from_document(document)
                    .map_err(|e| QueueError::from_record(e, Operation::Claim, &job_id, queue))?;
                debug!(job_id = %row.job_id, "Claimed job");
                Ok(Some(JobHandle::from_row(row)))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip_all, err, fields(job_id = %handle.job_id(), queue = %handle.queue()))]
    pub async fn fetch_payload(&self, handle: &JobHandle) -> Result<Vec<u8>, QueueError> {
        let (job_id, queue) = (handle.job_id(), handle.queue());
        let row = self
            .store
            .find_one(processing_filter(job_id, queue))
            .await
            .map_err(|e| QueueError::from_store(e, Operation::FetchPayload, job_id, queue))?
            .ok_or_else(|| QueueError::MissingJob {
                job_id: job_id.to_string(),
                queue: queue.to_string(),
            })?;

        let row = JobRow::from_document(row)
            .map_err(|e| QueueError::from_record(e, Operation::FetchPayload, job_id, queue))?;
        Ok(row.into_payload())
    }

    #[instrument(skip_all, err, fields(job_id = %handle.job_id(), queue = %handle.queue()))]
    pub async fn complete(&self, handle: JobHandle) -> Result<(), QueueError> {
        let update = doc! {
            "$set": { "status": JobStatus::Completed }
        };
        self.transition(handle, update, Operation::Complete).await?;
        debug!("Completed job");
        Ok(())
    }

    /// Puts a processing job back to ready at the tail of its queue.
    #[instrument(skip_all, err, fields(job_id = %handle.job_id(), queue = %handle.queue()))]
    pub async fn release(&self, handle: JobHandle) -> Result<(), QueueError> {
        let update = doc! {
            "$set": {
                "status": JobStatus::Ready,
                "created_at": now(),
            },
            "$unset": { "claimed_at": "" }
        };
        self.transition(handle, update, Operation::Release).await?;
        debug!("Released job");
        Ok(())
    }

    /// Releases every job in `queue` claimed longer than `older_than` ago and returns how many.
    ///
    /// Nothing calls this automatically; a claim carries no lease on its own. A negative
    /// `older_than` counts as zero.
    #[instrument(skip_all, err, ret, fields(queue = %queue))]
    pub async fn requeue_stale(&self, queue: &str, older_than: chrono::Duration) -> Result<u64, QueueError> {
        let age = older_than.num_milliseconds().max(0);
        let cutoff = bson::DateTime::from_millis(now().timestamp_millis().saturating_sub(age));
        let mut requeued = 0;

        loop {
            let filter = doc! {
                "queue": queue,
                "status": JobStatus::Processing,
                "claimed_at": { "$lt": cutoff },
            };
            let update = doc! {
                "$set": {
                    "status": JobStatus::Ready,
                    "created_at": now(),
                },
                "$unset": { "claimed_at": "" }
            };

            let previous = self
                .store
                .find_one_and_update(filter, update, Some(doc! { "claimed_at": 1 }), ReturnPolicy::Before)
                .await
                .map_err(|e| QueueError::from_store(e, Operation::RequeueStale, "", queue))?;

            match previous {
                Some(document) => {
                    let job_id = document.get_str("job_id").unwrap_or_default();
                    let claimed_at = document.get_datetime("claimed_at").ok().copied();
                    debug!(job_id, claimed_at = ?claimed_at, "Requeued stale job");
                    requeued += 1;
                }
                None => return Ok(requeued),
            }
        }
    }

    async fn transition(
        &self,
        handle: JobHandle,
        update: bson::Document,
        operation: Operation,
    ) -> Result<(), QueueError> {
        let (job_id, queue) = (handle.job_id(), handle.queue());
        let updated = self
            .store
            .find_one_and_update(processing_filter(job_id, queue), update, None, ReturnPolicy::After)
            .await
            .map_err(|e| QueueError::from_store(e, operation, job_id, queue))?;

        match updated {
            Some(_) => Ok(()),
            None => Err(QueueError::ModificationFailed {
                operation,
                job_id: job_id.to_string(),
                queue: queue.to_string(),
            }),
        }
    }
}

fn processing_filter(job_id: &str, queue: &str) -> bson::Document {
    doc! {
        "job_id": job_id,
        "queue": queue,
        "status": JobStatus::Processing,
    }
}
