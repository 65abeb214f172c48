// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed pubsub broker (C2): a homogeneous in-process broadcast bus for one
//! payload type. Every subscriber owns an independently bounded queue; a
//! slow subscriber only drops its own envelopes, never blocks the publisher
//! or starves other subscribers.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default bounded queue depth for a new subscriber.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// One delivered item: a caller-supplied discriminant plus its payload.
#[derive(Debug, Clone)]
pub struct Envelope<K, T> {
    pub kind: K,
    pub payload: T,
}

struct Subscriber<K, T> {
    tx: mpsc::Sender<Envelope<K, T>>,
}

/// A broadcast bus for one payload type `T`, tagged on publish by `K`.
///
/// `K` is typically a small `Copy` enum (e.g. an event subtype) and `T` the
/// event payload itself; callers that don't need tagging can use `K = ()`.
pub struct Broker<K, T> {
    subscribers: Mutex<Vec<Subscriber<K, T>>>,
    queue_depth: usize,
    dropped: AtomicU64,
    closed: Mutex<bool>,
}

impl<K, T> Default for Broker<K, T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl<K, T> Broker<K, T>
where
    K: Clone,
    T: Clone,
{
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            queue_depth,
            dropped: AtomicU64::new(0),
            closed: Mutex::new(false),
        }
    }

    /// Register a new subscriber with a bounded queue. The returned receiver
    /// is closed when `cancel` fires or the broker is closed.
    pub fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<Envelope<K, T>> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        if *self.closed.lock().unwrap() {
            // Closed brokers accept no new subscribers; drop `tx` immediately
            // so the returned receiver observes a closed channel right away.
            return rx;
        }
        self.subscribers.lock().unwrap().push(Subscriber { tx: tx.clone() });
        tokio::spawn(async move {
            cancel.cancelled().await;
            drop(tx);
        });
        rx
    }

    /// Publish one envelope to every live subscriber, non-blockingly.
    ///
    /// A subscriber whose queue is full has this delivery dropped for it
    /// alone; other subscribers are unaffected (slow-subscriber isolation).
    pub fn publish(&self, kind: K, payload: T) {
        if *self.closed.lock().unwrap() {
            return;
        }
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| {
            let envelope = Envelope {
                kind: kind.clone(),
                payload: payload.clone(),
            };
            match s.tx.try_send(envelope) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("pubsub: subscriber queue full, dropping envelope");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Close the broker: every subscriber channel is dropped (closing the
    /// receiver side) and further `publish`/`subscribe` calls are no-ops.
    pub fn close(&self) {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return;
        }
        *closed = true;
        self.subscribers.lock().unwrap().clear();
        debug!("pubsub broker closed");
    }

    /// Number of envelopes dropped across all subscribers due to queue overflow.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of currently live subscribers. A cancelled subscriber's channel
    /// closes immediately (see `subscribe`), so this filters on channel
    /// liveness rather than `Vec` length — the count reaches 0 as soon as
    /// cancellation fires, without waiting for the next `publish`.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().iter().filter(|s| !s.tx.is_closed()).count()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
