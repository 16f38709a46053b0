use async_trait::async_trait;
use bincode::{Decode, Encode};
use queues_mongodb::{JobProcessor, JobQueue, JobRunner, MongoDbConfig, MongoDbStore, RunnerOptions, RunnerRouter};

#[derive(Debug, Encode, Decode)]
struct Email {
    to: String,
}

struct SendEmail;

#[async_trait]
impl JobProcessor for SendEmail {
    type Payload = Email;
    type Error = anyhow::Error;

    async fn handle(&self, job_id: &str, payload: Self::Payload) -> Result<(), Self::Error> {
        tracing::info!(job_id, to = %payload.to, "sending email");
        Ok(())
    }

    fn name() -> &'static str {
        "send_email"
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = MongoDbConfig::new("mongodb://localhost:27017/queues");
    let queue = JobQueue::with_index_scope(MongoDbStore::new(&config).await?, config.index_scope);
    queue.ensure_indexes().await?;

    let _job_id = queue
        .dispatch::<SendEmail>("emails", Email { to: "mongo@database.driver".to_string() })
        .await?;

    let mut router = RunnerRouter::default();
    router.add_job_handler(SendEmail);

    let runner = JobRunner::new(queue, "emails", router, RunnerOptions::default());
    // Poll for a short while, then shut down. A real worker would wait on ctrl-c instead.
    runner
        .run_with_shutdown(async {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        })
        .await;
    Ok(())
}
