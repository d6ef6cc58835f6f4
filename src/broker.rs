// Bridges each debate's event sequence to one (possibly late-joining)
// HTTP subscriber. Events are logged for replay; the log outlives the
// debate for a bounded retention window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::debate::DebateEvent;

const DEFAULT_BUFFER_CAPACITY: usize = 256;
const DEFAULT_RETENTION: Duration = Duration::from_secs(300);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("debate '{0}' is already registered")]
    Duplicate(String),

    #[error("debate '{0}' not found")]
    NotFound(String),

    #[error("debate '{0}' already has a subscriber")]
    AlreadySubscribed(String),
}

struct ChannelState {
    log: Vec<DebateEvent>,
    /// Index of the next event the forwarder will deliver.
    cursor: usize,
    subscribed: bool,
    closed: bool,
    closed_at: Option<Instant>,
    notify: Arc<Notify>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            log: Vec::new(),
            cursor: 0,
            subscribed: false,
            closed: false,
            closed_at: None,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct BrokerInner {
    channels: Mutex<HashMap<String, ChannelState>>,
    buffer_capacity: usize,
    retention: Duration,
}

#[derive(Clone)]
pub struct DebateBroker {
    inner: Arc<BrokerInner>,
}

impl DebateBroker {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_BUFFER_CAPACITY, DEFAULT_RETENTION)
    }

    pub fn with_limits(buffer_capacity: usize, retention: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                channels: Mutex::new(HashMap::new()),
                buffer_capacity: buffer_capacity.max(1),
                retention,
            }),
        }
    }

    /// Register a debate id before its orchestrator starts producing.
    pub fn register(&self, id: &str) -> Result<(), BrokerError> {
        let mut channels = self.lock_channels();
        if channels.contains_key(id) {
            return Err(BrokerError::Duplicate(id.to_string()));
        }
        channels.insert(id.to_string(), ChannelState::new());
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock_channels().contains_key(id)
    }

    /// Append one event to a debate's log. When a slow subscriber's unread
    /// backlog overflows, the oldest shed-able events are dropped;
    /// terminal and early-stop events are never shed.
    pub fn publish(&self, id: &str, event: DebateEvent) {
        let mut channels = self.lock_channels();
        let Some(state) = channels.get_mut(id) else {
            tracing::warn!(debate = id, "publish on unregistered debate, dropping event");
            return;
        };

        state.log.push(event);

        if state.subscribed {
            let capacity = self.inner.buffer_capacity;
            while state.log.len() - state.cursor > capacity {
                let Some(drop_index) = state.log[state.cursor..]
                    .iter()
                    .position(|event| !event.must_deliver())
                    .map(|offset| state.cursor + offset)
                else {
                    break;
                };
                state.log.remove(drop_index);
                tracing::debug!(debate = id, "subscriber lagging, dropped oldest event");
            }
        }

        state.notify.notify_one();
    }

    pub fn complete(&self, id: &str) {
        self.close(id, false);
    }

    pub fn fail(&self, id: &str) {
        self.close(id, true);
    }

    fn close(&self, id: &str, failed: bool) {
        let mut channels = self.lock_channels();
        let Some(state) = channels.get_mut(id) else {
            return;
        };
        state.closed = true;
        state.closed_at = Some(Instant::now());
        state.notify.notify_one();
        tracing::debug!(debate = id, failed, "debate channel closed");
    }

    /// Attach the single subscriber for a debate. All events produced so
    /// far are replayed in order before any new ones; the channel closes
    /// after the terminal event.
    pub fn subscribe(&self, id: &str) -> Result<mpsc::Receiver<DebateEvent>, BrokerError> {
        let notify = {
            let mut channels = self.lock_channels();
            let Some(state) = channels.get_mut(id) else {
                return Err(BrokerError::NotFound(id.to_string()));
            };
            if state.subscribed {
                return Err(BrokerError::AlreadySubscribed(id.to_string()));
            }
            state.subscribed = true;
            state.notify.clone()
        };

        let (tx, rx) = mpsc::channel(self.inner.buffer_capacity);
        let inner = self.inner.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            forward(inner, id, notify, tx).await;
        });
        Ok(rx)
    }

    /// Evict finished channels past their retention window. The sweeper
    /// task calls this periodically; tests call it directly.
    pub fn sweep_now(&self) {
        let now = Instant::now();
        let mut channels = self.lock_channels();
        channels.retain(|id, state| {
            let expired = state.closed
                && state
                    .closed_at
                    .map(|at| now.duration_since(at) >= self.inner.retention)
                    .unwrap_or(false);
            if expired {
                tracing::debug!(debate = %id, "evicting finished debate log");
                state.notify.notify_one();
            }
            !expired
        });
    }

    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                broker.sweep_now();
            }
        })
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChannelState>> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for DebateBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver events one at a time so unsent events stay in the log, where
/// the overflow policy can still reach them.
async fn forward(
    inner: Arc<BrokerInner>,
    id: String,
    notify: Arc<Notify>,
    tx: mpsc::Sender<DebateEvent>,
) {
    loop {
        // Arm the notification before checking state so a publish between
        // check and await cannot be missed.
        let notified = notify.notified();

        let step = {
            let mut channels = inner.channels.lock().unwrap_or_else(|p| p.into_inner());
            let Some(state) = channels.get_mut(&id) else {
                return;
            };
            if state.cursor < state.log.len() {
                let event = state.log[state.cursor].clone();
                state.cursor += 1;
                Some(event)
            } else if state.closed {
                return;
            } else {
                None
            }
        };

        match step {
            Some(event) => {
                if tx.send(event).await.is_err() {
                    // Subscriber disconnected. The debate keeps running;
                    // we just stop reading its log.
                    return;
                }
            }
            None => notified.await,
        }
    }
}
