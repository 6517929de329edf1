//! Bounded hand-off between the MQTT delivery path and the database writer.
//!
//! Any number of producers may hold a `DispatchSender`, there is exactly one
//! `DispatchReceiver`. Events come out in the order they went in. What happens
//! when the buffer is full is chosen by a `BackpressurePolicy`:
//!
//! - `Block` waits for the writer to catch up. The database write rate gates the
//!   ingestion rate, at the cost of stalling the MQTT event loop (which can cost
//!   us the broker connection under sustained overload).
//! - `BlockWithTimeout` waits a bounded amount of time, then drops the new event.
//! - `DropOldest` never waits; the oldest queued events are overwritten and the
//!   receiver reports how many were lost. The buffer capacity is rounded up to the
//!   next power of two in this mode.
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::{
    broadcast,
    mpsc::{self, error::SendTimeoutError, error::TrySendError},
};
use tracing::{debug, warn};

use crate::metrics::{EVENTS_DROPPED, EVENTS_ENQUEUED, QUEUE_FULL, QUEUE_IN_FLIGHT};

/// Name of a policy, as read from the environment.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BackpressureMode {
    Block,
    BlockWithTimeout,
    DropOldest,
}

impl FromStr for BackpressureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_ref() {
            "block" => Ok(BackpressureMode::Block),
            "block_with_timeout" => Ok(BackpressureMode::BlockWithTimeout),
            "drop_oldest" => Ok(BackpressureMode::DropOldest),
            _ => Err(format!("Unknown backpressure policy: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BackpressurePolicy {
    Block,
    BlockWithTimeout(Duration),
    DropOldest,
}

/// What became of an event handed to `DispatchSender::send`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendOutcome {
    Enqueued,
    /// The queue stayed full for longer than the policy allows.
    Dropped,
}

/// The receiving side is gone; the event is handed back.
#[derive(Debug)]
pub struct QueueClosed<T>(pub T);

#[derive(Debug)]
enum SenderKind<T> {
    Bounded {
        sender: mpsc::Sender<T>,
        timeout: Option<Duration>,
    },
    Lossy {
        sender: broadcast::Sender<T>,
        capacity: usize,
    },
}

impl<T> Clone for SenderKind<T> {
    fn clone(&self) -> Self {
        match self {
            SenderKind::Bounded { sender, timeout } => SenderKind::Bounded {
                sender: sender.clone(),
                timeout: *timeout,
            },
            SenderKind::Lossy { sender, capacity } => SenderKind::Lossy {
                sender: sender.clone(),
                capacity: *capacity,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSender<T> {
    inner: SenderKind<T>,
}

#[derive(Debug)]
enum ReceiverKind<T> {
    Bounded(mpsc::Receiver<T>),
    Lossy(broadcast::Receiver<T>),
}

#[derive(Debug)]
pub struct DispatchReceiver<T> {
    inner: ReceiverKind<T>,
}

/// Build a queue holding up to `capacity` events (at least one).
pub fn dispatch_queue<T: Clone>(
    capacity: usize,
    policy: BackpressurePolicy,
) -> (DispatchSender<T>, DispatchReceiver<T>) {
    let capacity = capacity.max(1);
    match policy {
        BackpressurePolicy::Block | BackpressurePolicy::BlockWithTimeout(_) => {
            let timeout = match policy {
                BackpressurePolicy::BlockWithTimeout(timeout) => Some(timeout),
                _ => None,
            };
            let (tx, rx) = mpsc::channel(capacity);
            (
                DispatchSender {
                    inner: SenderKind::Bounded {
                        sender: tx,
                        timeout,
                    },
                },
                DispatchReceiver {
                    inner: ReceiverKind::Bounded(rx),
                },
            )
        }
        BackpressurePolicy::DropOldest => {
            let (tx, rx) = broadcast::channel(capacity);
            (
                DispatchSender {
                    inner: SenderKind::Lossy {
                        sender: tx,
                        capacity: capacity.next_power_of_two(),
                    },
                },
                DispatchReceiver {
                    inner: ReceiverKind::Lossy(rx),
                },
            )
        }
    }
}

impl<T> DispatchSender<T> {
    /// Hand an event to the writer, applying the backpressure policy when the queue is full.
    pub async fn send(&self, item: T) -> Result<SendOutcome, QueueClosed<T>> {
        let outcome = match &self.inner {
            SenderKind::Bounded { sender, timeout } => {
                let item = match sender.try_send(item) {
                    Ok(_) => return Ok(self.enqueued()),
                    Err(TrySendError::Closed(item)) => return Err(QueueClosed(item)),
                    Err(TrySendError::Full(item)) => item,
                };

                debug!("Dispatch queue full, delivery blocked");
                metrics::counter!(QUEUE_FULL).increment(1);

                match timeout {
                    None => match sender.send(item).await {
                        Ok(_) => SendOutcome::Enqueued,
                        Err(mpsc::error::SendError(item)) => return Err(QueueClosed(item)),
                    },
                    Some(timeout) => match sender.send_timeout(item, *timeout).await {
                        Ok(_) => SendOutcome::Enqueued,
                        Err(SendTimeoutError::Timeout(_)) => {
                            warn!(
                                "Dispatch queue still full after {:?}, dropping event",
                                timeout
                            );
                            metrics::counter!(EVENTS_DROPPED).increment(1);
                            SendOutcome::Dropped
                        }
                        Err(SendTimeoutError::Closed(item)) => return Err(QueueClosed(item)),
                    },
                }
            }
            SenderKind::Lossy { sender, capacity } => {
                if sender.len() >= *capacity {
                    metrics::counter!(QUEUE_FULL).increment(1);
                }
                match sender.send(item) {
                    Ok(_) => SendOutcome::Enqueued,
                    Err(broadcast::error::SendError(item)) => return Err(QueueClosed(item)),
                }
            }
        };

        if outcome == SendOutcome::Enqueued {
            return Ok(self.enqueued());
        }
        Ok(outcome)
    }

    fn enqueued(&self) -> SendOutcome {
        metrics::counter!(EVENTS_ENQUEUED).increment(1);
        metrics::gauge!(QUEUE_IN_FLIGHT).set(self.in_flight() as f64);
        SendOutcome::Enqueued
    }

    /// Number of events waiting for the writer.
    pub fn in_flight(&self) -> usize {
        match &self.inner {
            SenderKind::Bounded { sender, .. } => sender.max_capacity() - sender.capacity(),
            SenderKind::Lossy { sender, .. } => sender.len(),
        }
    }
}

impl<T: Clone> DispatchReceiver<T> {
    /// Wait for the next event. Returns `None` once every sender is dropped and
    /// the buffer has been drained.
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.inner {
            ReceiverKind::Bounded(receiver) => receiver.recv().await,
            ReceiverKind::Lossy(receiver) => loop {
                match receiver.recv().await {
                    Ok(item) => return Some(item),
                    Err(broadcast::error::RecvError::Lagged(lost)) => {
                        warn!(lost, "Dispatch queue overflowed, dropped oldest events");
                        metrics::counter!(EVENTS_DROPPED).increment(lost);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}
