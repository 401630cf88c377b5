//! Transmit queue: one-at-a-time admission for synchronous exchanges.
//!
//! A dedicated task owns the current-holder slot and the FIFO backlog.
//! Callers talk to it over an unbounded mpsc channel, so no lock guards the
//! slot.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐  Begin / Clear / Info                 ┌─► QueueSlot (caller 1)
//! Caller 2 ─┼──────────────────────► Queue Task ────┤
//! Caller N ─┘  Complete (QueueSlot drop) ◄──────────┘   backlog: 2..N
//! ```
//!
//! Admission hands out a [`QueueSlot`]. Dropping the slot releases the
//! holder and admits the next backlog entry, so the slot is released exactly
//! once on every exit path.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::command::Ticket;
use crate::error::{Result, UnpiError};

/// Default maximum number of queued (not yet admitted) commands.
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 100;

/// Configuration for the transmit queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Backlog length at which the oldest entry is evicted.
    pub max_queue_length: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
        }
    }
}

/// Snapshot of the queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    /// Entries waiting for admission.
    pub queued: usize,
    /// Whether a holder is admitted.
    pub busy: bool,
}

enum Message {
    Begin {
        ticket: Ticket,
        label: String,
        reply: oneshot::Sender<Result<QueueSlot>>,
    },
    Complete {
        ticket: Ticket,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    IsCurrent {
        ticket: Ticket,
        reply: oneshot::Sender<bool>,
    },
    Info {
        reply: oneshot::Sender<QueueInfo>,
    },
}

/// Proof of admission. Releases the queue when dropped.
#[derive(Debug)]
pub struct QueueSlot {
    ticket: Ticket,
    tx: mpsc::UnboundedSender<Message>,
}

impl QueueSlot {
    #[inline]
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Release the slot now.
    pub fn complete(self) {}
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Complete {
            ticket: self.ticket,
        });
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Begin { ticket, label, .. } => write!(f, "Begin({:?}, {})", ticket, label),
            Message::Complete { ticket } => write!(f, "Complete({:?})", ticket),
            Message::Clear { .. } => f.write_str("Clear"),
            Message::IsCurrent { ticket, .. } => write!(f, "IsCurrent({:?})", ticket),
            Message::Info { .. } => f.write_str("Info"),
        }
    }
}

/// Handle to the transmit queue task.
///
/// Cheaply cloneable. The task exits once every handle and slot is dropped.
#[derive(Clone)]
pub struct TxQueue {
    tx: mpsc::UnboundedSender<Message>,
}

impl TxQueue {
    /// Spawn the queue task. Must be called inside a tokio runtime.
    pub fn spawn(config: QueueConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = QueueTask {
            rx,
            weak: tx.downgrade(),
            max_queue_length: config.max_queue_length.max(1),
            state: State::Idle,
            backlog: VecDeque::new(),
        };
        let handle = tokio::spawn(task.run());
        (Self { tx }, handle)
    }

    /// Request admission.
    ///
    /// The request is registered before this returns, so admission order
    /// follows call order. The future resolves with the slot once admitted,
    /// or with `QueueOverflow` / `QueueCleared` if the entry is shed.
    pub fn begin(
        &self,
        ticket: Ticket,
        label: impl Into<String>,
    ) -> impl Future<Output = Result<QueueSlot>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Message::Begin {
                ticket,
                label: label.into(),
                reply,
            })
            .is_ok();
        async move {
            if !sent {
                return Err(UnpiError::ConnectionClosed);
            }
            rx.await.map_err(|_| UnpiError::ConnectionClosed)?
        }
    }

    /// Abort every queued entry, then wait for the current holder to finish.
    pub async fn clear(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::Clear { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether `ticket` is the admitted holder.
    pub async fn is_current(&self, ticket: Ticket) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::IsCurrent { ticket, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn info(&self) -> QueueInfo {
        let (reply, rx) = oneshot::channel();
        let closed = QueueInfo {
            queued: 0,
            busy: false,
        };
        if self.tx.send(Message::Info { reply }).is_err() {
            return closed;
        }
        rx.await.unwrap_or(closed)
    }
}

struct Entry {
    ticket: Ticket,
    label: String,
    reply: oneshot::Sender<Result<QueueSlot>>,
}

enum State {
    Idle,
    Busy {
        current: Ticket,
        label: String,
        since: Instant,
        clear_waiters: Vec<oneshot::Sender<()>>,
    },
}

struct QueueTask {
    rx: mpsc::UnboundedReceiver<Message>,
    weak: mpsc::WeakUnboundedSender<Message>,
    max_queue_length: usize,
    state: State,
    backlog: VecDeque<Entry>,
}

impl QueueTask {
    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                Message::Begin {
                    ticket,
                    label,
                    reply,
                } => self.begin(Entry {
                    ticket,
                    label,
                    reply,
                }),
                Message::Complete { ticket } => self.complete(ticket),
                Message::Clear { reply } => self.clear(reply),
                Message::IsCurrent { ticket, reply } => {
                    let current = matches!(self.state, State::Busy { current, .. } if current == ticket);
                    let _ = reply.send(current);
                }
                Message::Info { reply } => {
                    let _ = reply.send(QueueInfo {
                        queued: self.backlog.len(),
                        busy: matches!(self.state, State::Busy { .. }),
                    });
                }
            }
        }
        tracing::debug!("transmit queue stopped");
    }

    fn begin(&mut self, entry: Entry) {
        if let State::Idle = self.state {
            self.admit(entry);
            return;
        }

        tracing::debug!(target: "unpi::sreq", " [queued] {}", entry.label);
        if self.backlog.len() >= self.max_queue_length {
            if let Some(evicted) = self.backlog.pop_front() {
                tracing::warn!(
                    "queue too long: {}, discarded {}. Was doing {}",
                    self.backlog.len(),
                    evicted.label,
                    self.describe_current()
                );
                let _ = evicted.reply.send(Err(UnpiError::QueueOverflow));
            }
        }
        self.backlog.push_back(entry);
    }

    /// Make `entry` the holder. Its slot comes back as a Complete if the
    /// caller is gone.
    fn admit(&mut self, entry: Entry) {
        let Some(tx) = self.weak.upgrade() else {
            let _ = entry.reply.send(Err(UnpiError::ConnectionClosed));
            return;
        };

        self.state = State::Busy {
            current: entry.ticket,
            label: entry.label,
            since: Instant::now(),
            clear_waiters: Vec::new(),
        };
        let slot = QueueSlot {
            ticket: entry.ticket,
            tx,
        };
        let _ = entry.reply.send(Ok(slot));
    }

    fn complete(&mut self, ticket: Ticket) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Busy {
                current,
                clear_waiters,
                ..
            } if current == ticket => {
                for waiter in clear_waiters {
                    let _ = waiter.send(());
                }
            }
            other => {
                tracing::error!("completion for {:?} which is not the current holder", ticket);
                self.state = other;
                return;
            }
        }

        while let Some(next) = self.backlog.pop_front() {
            if next.reply.is_closed() {
                continue;
            }
            self.admit(next);
            break;
        }
    }

    fn clear(&mut self, reply: oneshot::Sender<()>) {
        for entry in self.backlog.drain(..) {
            let _ = entry.reply.send(Err(UnpiError::QueueCleared));
        }
        match &mut self.state {
            State::Idle => {
                let _ = reply.send(());
            }
            State::Busy { clear_waiters, .. } => clear_waiters.push(reply),
        }
    }

    fn describe_current(&self) -> String {
        match &self.state {
            State::Idle => "nothing".to_string(),
            State::Busy { label, since, .. } => {
                format!("{} admitted {:?} ago", label, since.elapsed())
            }
        }
    }
}
