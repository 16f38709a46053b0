//! Worker side: typed job handlers, payload envelopes and the polling loop.

use std::{collections::HashMap, future::Future, sync::Arc};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bincode::{Decode, Encode};
use tokio::{sync::Semaphore, time::MissedTickBehavior};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::RunnerOptions,
    error::{Operation, QueueError, RecordError},
    job_handle::JobHandle,
    queue::JobQueue,
    store::{DocumentStore, MongoDbStore},
};

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// A handler for one kind of job.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    type Payload: Encode + Decode + Send;
    type Error: Into<anyhow::Error> + Send;

    async fn handle(&self, job_id: &str, payload: Self::Payload) -> Result<(), Self::Error>;

    /// Routing key stored with every dispatched job. Must be unique within a router.
    fn name() -> &'static str;
}

/// What gets stored as a record's opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct JobData {
    pub job_name: String,
    pub payload: Vec<u8>,
}

impl JobData {
    pub fn new<J: JobProcessor>(payload: &J::Payload) -> Result<Self, RecordError> {
        let payload =
            bincode::encode_to_vec(payload, bincode_config()).map_err(|e| RecordError::Encoding(e.into()))?;
        Ok(Self {
            job_name: J::name().to_string(),
            payload,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        bincode::encode_to_vec(self, bincode_config()).map_err(|e| RecordError::Encoding(e.into()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        let (data, _) =
            bincode::decode_from_slice(bytes, bincode_config()).map_err(|e| RecordError::Decoding(e.into()))?;
        Ok(data)
    }
}

impl<S: DocumentStore> JobQueue<S> {
    /// Enqueues a typed job under a fresh id and returns the id.
    pub async fn dispatch<J: JobProcessor>(&self, queue: &str, payload: J::Payload) -> Result<String, QueueError> {
        let job_id = Uuid::new_v4().to_string();
        let bytes = JobData::new::<J>(&payload)
            .and_then(|data| data.to_bytes())
            .map_err(|e| QueueError::from_record(e, Operation::Enqueue, &job_id, queue))?;
        self.enqueue(&job_id, queue, bytes).await?;
        Ok(job_id)
    }
}

#[async_trait]
trait ErasedProcessor: Send + Sync {
    async fn process(&self, job_id: &str, payload: &[u8]) -> anyhow::Result<()>;
}

struct Wrapped<J>(J);

#[async_trait]
impl<J: JobProcessor> ErasedProcessor for Wrapped<J> {
    async fn process(&self, job_id: &str, payload: &[u8]) -> anyhow::Result<()> {
        let (payload, _): (J::Payload, usize) = bincode::decode_from_slice(payload, bincode_config())
            .with_context(|| format!("Failed to decode payload for {}", J::name()))?;
        self.0.handle(job_id, payload).await.map_err(Into::into)
    }
}

/// Maps job names to handlers.
#[derive(Default)]
pub struct RunnerRouter {
    processors: HashMap<&'static str, Box<dyn ErasedProcessor>>,
}

impl RunnerRouter {
    pub fn add_job_handler<J: JobProcessor>(&mut self, processor: J) {
        self.processors.insert(J::name(), Box::new(Wrapped(processor)));
    }

    pub fn job_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.processors.keys().copied()
    }

    async fn dispatch(&self, job_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let data = JobData::from_bytes(bytes)?;
        let processor = self
            .processors
            .get(data.job_name.as_str())
            .ok_or_else(|| anyhow!("No handler registered for job {}", data.job_name))?;
        processor.process(job_id, &data.payload).await
    }
}

/// How a claimed job left the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The handler failed and the job went back to the tail of the queue.
    Released,
}

/// Polls one named queue and runs claimed jobs through a router.
pub struct JobRunner<S = MongoDbStore> {
    queue: JobQueue<S>,
    queue_name: String,
    router: Arc<RunnerRouter>,
    options: RunnerOptions,
    semaphore: Arc<Semaphore>,
}

impl<S: DocumentStore + 'static> JobRunner<S> {
    pub fn new(queue: JobQueue<S>, queue_name: impl Into<String>, router: RunnerRouter, options: RunnerOptions) -> Self {
        // `acquire_many` at shutdown takes a u32.
        let max_concurrency = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        let concurrency = options.concurrency.clamp(1, max_concurrency);
        Self {
            queue,
            queue_name: queue_name.into(),
            router: Arc::new(router),
            options: RunnerOptions { concurrency, ..options },
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Claims and runs at most one job inline. `None` when the queue is idle.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, QueueError> {
        match self.queue.claim_next(&self.queue_name).await? {
            Some(handle) => process(&self.queue, &self.router, handle).await.map(Some),
            None => Ok(None),
        }
    }

    /// Polls every `poll_interval` until `shutdown` resolves, then waits for in-flight jobs.
    pub async fn run_with_shutdown<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        info!(queue = %self.queue_name, jobs = ?self.router.job_names().collect::<Vec<_>>(), "Starting job runner");
        tokio::pin!(shutdown);

        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => self.poll().await,
            }
        }

        info!(queue = %self.queue_name, "Shutting down, waiting for running jobs");
        let permits = u32::try_from(self.options.concurrency).unwrap_or(u32::MAX);
        let _running = self.semaphore.acquire_many(permits).await;
    }

    /// Claims until the queue is idle or every slot is busy.
    async fn poll(&self) {
        loop {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                return;
            };

            match self.queue.claim_next(&self.queue_name).await {
                Ok(Some(handle)) => {
                    let queue = self.queue.clone();
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        // Failures are already logged inside `process`.
                        let _ = process(&queue, &router, handle).await;
                        drop(permit);
                    });
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(queue = %self.queue_name, error = %err, transient = err.is_transient(), "Failed to poll queue");
                    return;
                }
            }
        }
    }
}

#[instrument(skip_all, err, fields(job_id = %handle.job_id(), queue = %handle.queue()))]
async fn process<S: DocumentStore>(
    queue: &JobQueue<S>,
    router: &RunnerRouter,
    handle: JobHandle,
) -> Result<JobOutcome, QueueError> {
    // A missing record means someone else moved the job; this attempt is over.
    let payload = queue.fetch_payload(&handle).await?;

    match router.dispatch(handle.job_id(), &payload).await {
        Ok(()) => {
            queue.complete(handle).await?;
            Ok(JobOutcome::Completed)
        }
        Err(err) => {
            error!(error = ?err, "Job failed, returning it to the queue");
            queue.release(handle).await?;
            Ok(JobOutcome::Released)
        }
    }
}
