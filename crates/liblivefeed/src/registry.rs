use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use livefeed_protocol::{ServiceStatus, Task, UserId};

use crate::error::LiveFeedError;
use crate::poll::{PollConfig, PollSource};

struct PollerEntry {
    source: Arc<PollSource>,
    cancel: CancellationToken,
    attachments: usize,
}

/// One task poller per active user, started on first attach and stopped when
/// the last attachment for that user is dropped.
pub struct PollRegistry {
    config: PollConfig,
    client: reqwest::Client,
    pollers: DashMap<UserId, PollerEntry>,
    active: AtomicUsize,
    max_active_users: usize,
    root: CancellationToken,
}

impl PollRegistry {
    /// Pollers run as children of `root`; cancelling it stops all of them.
    pub fn new(
        config: PollConfig,
        max_active_users: usize,
        root: CancellationToken,
    ) -> Result<Arc<Self>, LiveFeedError> {
        let client = config.build_client()?;
        Ok(Arc::new(Self {
            config,
            client,
            pollers: DashMap::new(),
            active: AtomicUsize::new(0),
            max_active_users: max_active_users.max(1),
            root,
        }))
    }

    pub fn attach(self: &Arc<Self>, user_id: UserId) -> Result<PollAttachment, LiveFeedError> {
        let source = match self.pollers.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.attachments += 1;
                Arc::clone(&entry.source)
            }
            Entry::Vacant(vacant) => {
                if self.active.fetch_add(1, Ordering::AcqRel) >= self.max_active_users {
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    return Err(LiveFeedError::AtCapacity(self.max_active_users));
                }
                let source = PollSource::new(user_id, self.config.clone(), self.client.clone());
                let cancel = self.root.child_token();
                tokio::spawn(Arc::clone(&source).run(cancel.clone()));
                info!(user_id, "task poller registered");
                vacant.insert(PollerEntry {
                    source: Arc::clone(&source),
                    cancel,
                    attachments: 1,
                });
                source
            }
        };

        let receiver = source.subscribe();
        Ok(PollAttachment {
            user_id,
            source,
            receiver,
            registry: Arc::downgrade(self),
        })
    }

    fn detach(&self, user_id: UserId) {
        let removed = self.pollers.remove_if_mut(&user_id, |_, entry| {
            entry.attachments = entry.attachments.saturating_sub(1);
            entry.attachments == 0
        });
        if let Some((_, entry)) = removed {
            entry.cancel.cancel();
            self.active.fetch_sub(1, Ordering::AcqRel);
            info!(user_id, "task poller evicted, no attachments left");
        }
    }

    pub fn active_users(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_polling(&self, user_id: UserId) -> bool {
        self.pollers.contains_key(&user_id)
    }
}

/// A session's handle on its user's poller. Dropping it releases the poller.
pub struct PollAttachment {
    user_id: UserId,
    source: Arc<PollSource>,
    receiver: broadcast::Receiver<Vec<Task>>,
    registry: Weak<PollRegistry>,
}

impl PollAttachment {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Next batch. `Lagged` means older batches were discarded because this
    /// receiver fell behind; `Closed` means the poller is gone.
    pub async fn recv(&mut self) -> Result<Vec<Task>, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    pub fn status(&self) -> watch::Receiver<ServiceStatus> {
        self.source.status()
    }
}

impl Drop for PollAttachment {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.user_id);
        }
    }
}
