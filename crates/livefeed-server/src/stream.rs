//! `GET /stream?user_id=<id>`: one long-lived NDJSON response per client.
//!
//! A session resolves the user, attaches to both sources, then runs two
//! fan-in workers (notes and tasks) that merge into a per-session
//! [`UserAggregator`] and push a full snapshot after every accepted update.
//! The session's cancellation token is tripped by client disconnect, a failed
//! write, or server shutdown; the supervisor then joins both workers and
//! releases the subscriptions.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use liblivefeed::{LiveFeedError, PollAttachment, Subscription, UserAggregator, lookup_user};
use livefeed_protocol::{Note, ServiceStatus, User, UserId, is_valid_user_id};

use crate::error::ApiError;
use crate::server::AppState;

/// Pushes buffered between the workers and the socket.
const PUSH_BUFFER: usize = 16;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    user_id: Option<String>,
}

/// A positive integer id; anything else is rejected before any lookup.
pub fn parse_user_id(raw: Option<&str>) -> Result<UserId, LiveFeedError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LiveFeedError::InvalidUserId("missing".to_string()))?;
    match raw.parse::<UserId>() {
        Ok(id) if is_valid_user_id(id) => Ok(id),
        _ => Err(LiveFeedError::InvalidUserId(raw.to_string())),
    }
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let user_id = parse_user_id(query.user_id.as_deref())?;
    let user = lookup_user(Arc::clone(&state.identity), user_id)
        .await?
        .ok_or(LiveFeedError::UserNotFound(user_id))?;

    let session = StreamSession::open(&state, user)?;
    let body = session.start();
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    ClientGone,
    EncodeFailed,
    /// The source stopped publishing, e.g. the file tail exited on shutdown.
    SourceClosed,
}

pub struct StreamSession {
    user: User,
    notes: Subscription<Note>,
    notes_status: watch::Receiver<ServiceStatus>,
    tasks: PollAttachment,
    cancel: CancellationToken,
}

impl StreamSession {
    /// Attach to both sources for `user`. Fails with `AtCapacity` when no
    /// task poller slot is free.
    pub fn open(state: &AppState, user: User) -> Result<Self, LiveFeedError> {
        let tasks = state.tasks.attach(user.user_id)?;
        let notes = state.notes.subscribe(user.user_id);
        Ok(Self {
            notes,
            notes_status: state.notes.status(),
            tasks,
            cancel: state.shutdown.child_token(),
            user,
        })
    }

    /// Spawn the workers and return the response body they write to.
    pub fn start(self) -> Body {
        let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(PUSH_BUFFER);
        let Self {
            user,
            notes,
            notes_status,
            tasks,
            cancel,
        } = self;

        let user_id = user.user_id;
        let aggregator = Arc::new(UserAggregator::new());
        aggregator.add_user(&user);
        let pusher = Pusher {
            user_id,
            aggregator,
            tx,
            cancel: cancel.clone(),
        };

        let tasks_status = tasks.status();
        let notes_worker = tokio::spawn(notes_loop(notes, notes_status, pusher.clone()));
        let tasks_worker = tokio::spawn(tasks_loop(tasks, tasks_status, pusher.clone()));

        tokio::spawn(async move {
            info!(user_id, user_name = %user.user_name, "stream session opened");

            tokio::select! {
                _ = pusher.tx.closed() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
            let (notes_end, tasks_end) = tokio::join!(notes_worker, tasks_worker);
            drop(pusher);

            info!(
                user_id,
                notes = ?notes_end.ok(),
                tasks = ?tasks_end.ok(),
                "stream session closed"
            );
        });

        Body::from_stream(ReceiverStream::new(rx))
    }
}

#[derive(Clone)]
struct Pusher {
    user_id: UserId,
    aggregator: Arc<UserAggregator>,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    cancel: CancellationToken,
}

impl Pusher {
    /// Write the current snapshot as one JSON line.
    async fn push(&self) -> Result<(), LiveFeedError> {
        let Some(snapshot) = self.aggregator.snapshot() else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(&snapshot)?;
        line.push(b'\n');

        tokio::select! {
            _ = self.cancel.cancelled() => Err(LiveFeedError::Disconnected),
            sent = self.tx.send(Ok(Bytes::from(line))) => {
                sent.map_err(|_| LiveFeedError::Disconnected)
            }
        }
    }

    /// Stop the whole session on a failed push.
    fn fail(&self, feed: &str, err: LiveFeedError) -> SessionEnd {
        self.cancel.cancel();
        match err {
            LiveFeedError::Disconnected => {
                debug!(user_id = self.user_id, feed, "client gone");
                SessionEnd::ClientGone
            }
            err => {
                warn!(user_id = self.user_id, feed, error = %err, "push failed");
                SessionEnd::EncodeFailed
            }
        }
    }
}

fn report_status(user_id: UserId, feed: &str, status: &ServiceStatus) {
    if status.is_healthy {
        debug!(user_id, feed, "source healthy");
    } else {
        warn!(
            user_id,
            feed,
            error = status.error.as_deref().unwrap_or("unknown"),
            "source unhealthy"
        );
    }
}

async fn notes_loop(
    mut notes: Subscription<Note>,
    mut status: watch::Receiver<ServiceStatus>,
    pusher: Pusher,
) -> SessionEnd {
    let user_id = pusher.user_id;
    let mut status_open = true;
    loop {
        tokio::select! {
            _ = pusher.cancel.cancelled() => return SessionEnd::Cancelled,
            changed = status.changed(), if status_open => match changed {
                Ok(()) => report_status(user_id, "notes", &status.borrow_and_update()),
                Err(_) => status_open = false,
            },
            note = notes.recv() => {
                let Some(note) = note else {
                    pusher.cancel.cancel();
                    return SessionEnd::SourceClosed;
                };
                if note.user_id != user_id {
                    continue;
                }
                pusher.aggregator.add_note(&note);
                if let Err(err) = pusher.push().await {
                    return pusher.fail("notes", err);
                }
            }
        }
    }
}

async fn tasks_loop(
    mut tasks: PollAttachment,
    mut status: watch::Receiver<ServiceStatus>,
    pusher: Pusher,
) -> SessionEnd {
    let user_id = pusher.user_id;
    let mut status_open = true;
    loop {
        tokio::select! {
            _ = pusher.cancel.cancelled() => return SessionEnd::Cancelled,
            changed = status.changed(), if status_open => match changed {
                Ok(()) => report_status(user_id, "tasks", &status.borrow_and_update()),
                Err(_) => status_open = false,
            },
            batch = tasks.recv() => {
                let batch = match batch {
                    Ok(batch) => batch,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(user_id, skipped, "task queue full, evicted oldest batches");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        pusher.cancel.cancel();
                        return SessionEnd::SourceClosed;
                    }
                };
                // Empty batches carry nothing to show.
                let Some(first) = batch.first() else {
                    continue;
                };
                if first.user_id != user_id || !pusher.aggregator.should_accept_task_batch(&batch) {
                    continue;
                }
                pusher.aggregator.add_tasks(&batch);
                if let Err(err) = pusher.push().await {
                    return pusher.fail("tasks", err);
                }
            }
        }
    }
}
