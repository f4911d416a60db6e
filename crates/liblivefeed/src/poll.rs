//! Polls the external task API for one user on a fixed tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use livefeed_protocol::{MAX_ENTRIES, ServiceStatus, TASK_QUEUE_CAPACITY, Task, UserId};

use crate::error::LiveFeedError;

const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub base_url: String,
    pub tick: Duration,
    /// Must stay below `tick` so one slow request cannot overlap the next tick.
    pub request_timeout: Duration,
}

impl PollConfig {
    pub fn new(base_url: impl Into<String>, tick: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            tick,
            request_timeout: default_request_timeout(tick),
        }
    }

    /// Connection-reusing client shared by every poller.
    pub fn build_client(&self) -> Result<reqwest::Client, LiveFeedError> {
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("livefeed/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(client)
    }
}

/// 80% of the tick, capped at five seconds.
pub fn default_request_timeout(tick: Duration) -> Duration {
    (tick * 4 / 5).clamp(Duration::from_millis(1), MAX_REQUEST_TIMEOUT)
}

pub struct PollSource {
    user_id: UserId,
    config: PollConfig,
    client: reqwest::Client,
    tasks_tx: broadcast::Sender<Vec<Task>>,
    status_tx: watch::Sender<ServiceStatus>,
}

impl PollSource {
    pub fn new(user_id: UserId, config: PollConfig, client: reqwest::Client) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ServiceStatus::default());
        let (tasks_tx, _) = broadcast::channel(TASK_QUEUE_CAPACITY);
        Arc::new(Self {
            user_id,
            config,
            client,
            tasks_tx,
            status_tx,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Task>> {
        self.tasks_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tasks_tx.receiver_count()
    }

    pub fn status(&self) -> watch::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ServiceStatus {
        self.status_tx.borrow().clone()
    }

    /// GET the user's tasks and keep the 10 most recent (tail of the array).
    pub async fn fetch(&self) -> Result<Vec<Task>, LiveFeedError> {
        let resp = self
            .client
            .get(&self.config.base_url)
            .query(&[("user_id", self.user_id)])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(LiveFeedError::UpstreamStatus(status.as_u16()));
        }

        let mut tasks: Vec<Task> = resp.json().await?;
        if tasks.len() > MAX_ENTRIES {
            tasks.drain(..tasks.len() - MAX_ENTRIES);
        }
        Ok(tasks)
    }

    /// Send a batch to every subscriber without blocking. A subscriber that
    /// falls behind loses its oldest batches and sees `Lagged` on its next recv.
    pub fn publish(&self, batch: Vec<Task>) -> usize {
        self.tasks_tx.send(batch).unwrap_or(0)
    }

    pub async fn poll_once(&self) -> Result<usize, LiveFeedError> {
        let batch = self.fetch().await?;
        let len = batch.len();
        self.publish(batch);
        Ok(len)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(user_id = self.user_id, url = %self.config.base_url, "task poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };
            match outcome {
                Ok(len) => {
                    debug!(user_id = self.user_id, tasks = len, "task poll ok");
                    self.status_tx.send_replace(ServiceStatus::healthy());
                }
                Err(err) => {
                    warn!(user_id = self.user_id, error = %err, "task poll failed");
                    self.status_tx.send_replace(ServiceStatus::unhealthy(&err));
                }
            }
        }

        info!(user_id = self.user_id, "task poller stopped");
    }
}
