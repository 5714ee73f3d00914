//! Delivery loop for the durable queue
//!
//! Each round leases the due tasks, posts them concurrently to their
//! handler URLs and applies the outcome. A 2xx removes the task, a 4xx
//! buries it and anything else is retried with exponential backoff.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::durable::{now_millis, LeasedTask};
use super::DurableQueue;
use crate::config::QueueSettings;
use crate::server::{QUEUE_NAME_HEADER, TASK_NAME_HEADER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            min_backoff: Duration::from_millis(settings.min_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms.max(settings.min_backoff_ms)),
            max_attempts: settings.max_attempts.max(1),
        }
    }

    /// Delay before the next attempt after `attempts` failures
    pub fn backoff(&self, attempts: u32) -> Duration {
        let doublings = attempts.saturating_sub(1).min(31);
        self.min_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Retry(String),
    Bury(String),
}

/// Map a handler's reply onto what happens to the task
pub fn classify_status(status: StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        DeliveryOutcome::Delivered
    } else if status.is_client_error() {
        DeliveryOutcome::Bury(format!("handler replied {}", status))
    } else {
        DeliveryOutcome::Retry(format!("handler replied {}", status))
    }
}

pub struct Deliverer {
    queue: DurableQueue,
    http: reqwest::Client,
    policy: RetryPolicy,
    poll_interval: Duration,
    batch_size: usize,
    deadline: Duration,
}

impl Deliverer {
    pub fn new(queue: DurableQueue, settings: &QueueSettings) -> Result<Self> {
        let deadline = settings.dispatch_deadline();
        Ok(Self {
            queue,
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .context("Failed to build delivery HTTP client")?,
            policy: RetryPolicy::from_settings(settings),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(10)),
            batch_size: settings.batch_size.max(1),
            deadline,
        })
    }

    /// Deliver every task that is due now. Returns how many were attempted.
    pub async fn run_once(&self) -> Result<usize> {
        let limit = self.batch_size;
        // The lease outlives the delivery deadline so a slow handler is not
        // raced by a second copy of its own task.
        let lease = self.deadline + Duration::from_secs(30);
        let tasks = self
            .queue
            .with_store(move |store| store.lease_due(now_millis(), limit, lease))
            .await?;

        if tasks.is_empty() {
            return Ok(0);
        }
        debug!("Delivering {} task(s)", tasks.len());

        let mut deliveries = JoinSet::new();
        for task in tasks {
            let http = self.http.clone();
            let deadline = self.deadline;
            deliveries.spawn(async move {
                let outcome = deliver(&http, &task, deadline).await;
                (task, outcome)
            });
        }

        let mut attempted = 0;
        while let Some(joined) = deliveries.join_next().await {
            let (task, outcome) = joined.context("delivery task panicked")?;
            attempted += 1;
            self.settle(task, outcome).await?;
        }

        Ok(attempted)
    }

    async fn settle(&self, task: LeasedTask, outcome: DeliveryOutcome) -> Result<()> {
        let attempts = task.attempts + 1;
        match outcome {
            DeliveryOutcome::Delivered => {
                debug!(task = %task.name, queue = %task.queue, "Task delivered");
                self.queue
                    .with_store(move |store| store.complete(&task.name))
                    .await
            }
            DeliveryOutcome::Bury(reason) => {
                warn!(task = %task.name, queue = %task.queue, "Burying task: {}", reason);
                self.queue
                    .with_store(move |store| store.bury(&task.name, attempts, &reason))
                    .await
            }
            DeliveryOutcome::Retry(reason) if attempts >= self.policy.max_attempts => {
                warn!(
                    task = %task.name,
                    queue = %task.queue,
                    "Burying task after {} attempts: {}",
                    attempts,
                    reason
                );
                self.queue
                    .with_store(move |store| store.bury(&task.name, attempts, &reason))
                    .await
            }
            DeliveryOutcome::Retry(reason) => {
                let delay = self.policy.backoff(attempts);
                debug!(
                    task = %task.name,
                    queue = %task.queue,
                    "Retrying in {:?}: {}",
                    delay,
                    reason
                );
                let next_at = now_millis() + delay.as_millis() as i64;
                self.queue
                    .with_store(move |store| {
                        store.reschedule(&task.name, attempts, next_at, &reason)
                    })
                    .await
            }
        }
    }

    /// Poll for due tasks until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Task deliverer running (poll every {:?}, batch {})",
            self.poll_interval, self.batch_size
        );
        tokio::pin!(shutdown);

        loop {
            let pause = match self.run_once().await {
                Ok(n) if n >= self.batch_size => Duration::ZERO,
                Ok(_) => self.poll_interval,
                Err(e) => {
                    warn!("Delivery round failed: {:#}", e);
                    self.poll_interval
                }
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Task deliverer stopped");
        Ok(())
    }
}

async fn deliver(http: &reqwest::Client, task: &LeasedTask, deadline: Duration) -> DeliveryOutcome {
    let response = http
        .post(&task.handler_url)
        .header(TASK_NAME_HEADER, &task.name)
        .header(QUEUE_NAME_HEADER, &task.queue)
        .header(CONTENT_TYPE, "application/json")
        .body(task.body.clone())
        .timeout(deadline)
        .send()
        .await;

    match response {
        Ok(response) => classify_status(response.status()),
        Err(e) => DeliveryOutcome::Retry(format!("delivery to {} failed: {}", task.handler_url, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            max_attempts: 5,
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(60), Duration::from_secs(10));
    }

    #[test]
    fn client_errors_bury_and_server_errors_retry() {
        assert_eq!(classify_status(StatusCode::OK), DeliveryOutcome::Delivered);
        assert!(matches!(
            classify_status(StatusCode::CONFLICT),
            DeliveryOutcome::Bury(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            DeliveryOutcome::Retry(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT),
            DeliveryOutcome::Retry(_)
        ));
    }

    #[test]
    fn policy_reads_queue_settings() {
        let settings = QueueSettings {
            min_backoff_ms: 250,
            max_backoff_ms: 100,
            max_attempts: 0,
            ..QueueSettings::default()
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.max_backoff, Duration::from_millis(250));
        assert_eq!(policy.max_attempts, 1);
    }
}
