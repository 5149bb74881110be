//! Background snapshot writer.
//!
//! The manager hands every new state to a [`Persister`] without waiting. A
//! single worker task writes them in order; when several states arrive during
//! one write only the newest is written next. Failures are logged and
//! reported on a bounded event channel, never returned to the caller.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::storage::{ContextStorage, SessionState};

/// Outcome of one background write
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceEvent {
    Saved {
        session_id: String,
        entries: usize,
        at: DateTime<Utc>,
    },
    Failed {
        session_id: String,
        error: String,
    },
}

/// Sender half of a persistence event channel
pub type PersistenceEventSender = mpsc::Sender<PersistenceEvent>;

/// Receiver half of a persistence event channel
pub type PersistenceEventReceiver = mpsc::Receiver<PersistenceEvent>;

/// Create a bounded persistence event channel. Events that do not fit are
/// dropped rather than stalling the writer.
pub fn persistence_channel(
    buffer_size: usize,
) -> (PersistenceEventSender, PersistenceEventReceiver) {
    mpsc::channel(buffer_size.max(1))
}

/// Handle to the background writer of one session
pub struct Persister {
    sender: watch::Sender<Option<SessionState>>,
    worker: JoinHandle<()>,
}

impl Persister {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(storage: ContextStorage, events: Option<PersistenceEventSender>) -> Self {
        let (sender, mut receiver) = watch::channel::<Option<SessionState>>(None);

        let worker = tokio::spawn(async move {
            // Ends once the handle is dropped and the last state is written
            while receiver.changed().await.is_ok() {
                let Some(state) = receiver.borrow_and_update().clone() else {
                    continue;
                };

                let event = match storage.save(&state).await {
                    Ok(()) => {
                        tracing::debug!(
                            session_id = %state.session_id,
                            entries = state.entries.len(),
                            "background snapshot saved"
                        );
                        PersistenceEvent::Saved {
                            session_id: state.session_id.clone(),
                            entries: state.entries.len(),
                            at: Utc::now(),
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            session_id = %state.session_id,
                            error = %e,
                            "background snapshot failed; in-memory state is still authoritative"
                        );
                        PersistenceEvent::Failed {
                            session_id: state.session_id.clone(),
                            error: e.to_string(),
                        }
                    }
                };

                if let Some(events) = &events {
                    if events.try_send(event).is_err() {
                        tracing::debug!("persistence event dropped: channel full or closed");
                    }
                }
            }
        });

        Self { sender, worker }
    }

    /// Queue `state` for writing, replacing anything not yet written
    pub fn submit(&self, state: SessionState) {
        self.sender.send_replace(Some(state));
    }

    /// Stop accepting states and wait until the last one is written
    pub async fn shutdown(self) {
        let Self { sender, worker } = self;
        drop(sender);
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "persistence worker ended abnormally");
        }
    }
}
