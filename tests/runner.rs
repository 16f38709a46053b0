use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bincode::{Decode, Encode};
use queues_mongodb::{
    JobOutcome, JobProcessor, JobQueue, JobRow, JobRunner, JobStatus, MemoryStore, RunnerOptions,
    RunnerRouter,
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct Email {
    to: String,
}

#[derive(Clone, Default)]
struct SendEmail {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobProcessor for SendEmail {
    type Payload = Email;
    type Error = anyhow::Error;

    async fn handle(&self, _job_id: &str, payload: Self::Payload) -> Result<(), Self::Error> {
        self.sent.lock().await.push(payload.to);
        Ok(())
    }

    fn name() -> &'static str {
        "send_email"
    }
}

#[derive(Clone, Default)]
struct AlwaysFails {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl JobProcessor for AlwaysFails {
    type Payload = u32;
    type Error = anyhow::Error;

    async fn handle(&self, _job_id: &str, _payload: Self::Payload) -> Result<(), Self::Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("smtp is down")
    }

    fn name() -> &'static str {
        "always_fails"
    }
}

async fn setup() -> JobQueue<MemoryStore> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let queue = JobQueue::new(MemoryStore::new());
    queue.ensure_indexes().await.unwrap();
    queue
}

async fn statuses(queue: &JobQueue<MemoryStore>) -> Vec<JobStatus> {
    queue
        .store()
        .documents()
        .await
        .into_iter()
        .map(|document| JobRow::from_document(document).unwrap().status)
        .collect()
}

#[tokio::test]
async fn process_next_completes_successful_job() {
    let queue = setup().await;
    let handler = SendEmail::default();
    let mut router = RunnerRouter::default();
    router.add_job_handler(handler.clone());

    queue
        .dispatch::<SendEmail>("emails", Email { to: "mongo@database.driver".to_string() })
        .await
        .unwrap();

    let runner = JobRunner::new(queue.clone(), "emails", router, RunnerOptions::default());
    assert_eq!(runner.process_next().await.unwrap(), Some(JobOutcome::Completed));
    assert_eq!(runner.process_next().await.unwrap(), None);

    assert_eq!(*handler.sent.lock().await, vec!["mongo@database.driver".to_string()]);
    assert_eq!(statuses(&queue).await, vec![JobStatus::Completed]);
}

#[tokio::test]
async fn failing_job_is_released() {
    let queue = setup().await;
    let handler = AlwaysFails::default();
    let mut router = RunnerRouter::default();
    router.add_job_handler(handler.clone());

    queue.dispatch::<AlwaysFails>("emails", 1).await.unwrap();

    let runner = JobRunner::new(queue.clone(), "emails", router, RunnerOptions::default());
    assert_eq!(runner.process_next().await.unwrap(), Some(JobOutcome::Released));
    assert_eq!(runner.process_next().await.unwrap(), Some(JobOutcome::Released));

    assert_eq!(handler.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(statuses(&queue).await, vec![JobStatus::Ready]);
}

#[tokio::test]
async fn unknown_job_is_released() {
    let queue = setup().await;
    queue.dispatch::<AlwaysFails>("emails", 1).await.unwrap();

    let runner = JobRunner::new(queue.clone(), "emails", RunnerRouter::default(), RunnerOptions::default());
    assert_eq!(runner.process_next().await.unwrap(), Some(JobOutcome::Released));
    assert_eq!(statuses(&queue).await, vec![JobStatus::Ready]);
}

#[tokio::test]
async fn garbage_payload_is_released() {
    let queue = setup().await;
    queue.enqueue("raw", "emails", vec![0xff; 3]).await.unwrap();

    let runner = JobRunner::new(queue.clone(), "emails", RunnerRouter::default(), RunnerOptions::default());
    assert_eq!(runner.process_next().await.unwrap(), Some(JobOutcome::Released));
}

#[tokio::test]
async fn runner_only_claims_its_own_queue() {
    let queue = setup().await;
    queue.enqueue("J1", "emails", vec![]).await.unwrap();

    let runner = JobRunner::new(queue.clone(), "sms", RunnerRouter::default(), RunnerOptions::default());
    assert!(matches!(runner.process_next().await, Ok(None)));
    assert_eq!(statuses(&queue).await, vec![JobStatus::Ready]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_with_shutdown_drains_queue() {
    let queue = setup().await;
    let handler = SendEmail::default();
    let mut router = RunnerRouter::default();
    router.add_job_handler(handler.clone());

    for i in 0..5 {
        queue
            .dispatch::<SendEmail>("emails", Email { to: format!("user{i}@example.com") })
            .await
            .unwrap();
    }

    let options = RunnerOptions {
        poll_interval: Duration::from_millis(10),
        concurrency: 2,
    };
    let runner = JobRunner::new(queue.clone(), "emails", router, options);
    runner
        .run_with_shutdown(tokio::time::sleep(Duration::from_millis(300)))
        .await;

    assert_eq!(handler.sent.lock().await.len(), 5);
    assert_eq!(statuses(&queue).await, vec![JobStatus::Completed; 5]);
}

#[tokio::test]
async fn oversized_concurrency_is_clamped() {
    let queue = setup().await;
    let handler = SendEmail::default();
    let mut router = RunnerRouter::default();
    router.add_job_handler(handler.clone());
    queue
        .dispatch::<SendEmail>("emails", Email { to: "a@example.com".to_string() })
        .await
        .unwrap();

    let options = RunnerOptions {
        poll_interval: Duration::from_millis(5),
        concurrency: usize::MAX,
    };
    let runner = JobRunner::new(queue.clone(), "emails", router, options);
    runner
        .run_with_shutdown(tokio::time::sleep(Duration::from_millis(100)))
        .await;

    assert_eq!(handler.sent.lock().await.len(), 1);
    assert_eq!(statuses(&queue).await, vec![JobStatus::Completed]);
}
