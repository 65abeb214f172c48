// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Notification broker (C5, §4.5): consumes fabric events, applies
//! subscription policy, and dispatches one debounced, consolidated nudge
//! per agent through the command submitter seam.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fabric_clock::{Clock, SystemClock};
use fabric_domain::{FabricStore, SubscriptionMode};
use fabric_service::{EventHandler, FabricEvent, FabricEventType};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::submitter::{Command, CommandSource, CommandSubmitter};

/// Channels never notified regardless of subscription.
const SUPPRESSED_CHANNELS: &[&str] = &["observer"];

/// Default inbox capacity (§4.5, §5).
pub const DEFAULT_INBOX_CAPACITY: usize = 100;
/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(3);

/// `chrono::Duration::from_std` but saturating instead of fallible — debounce
/// windows are always small enough to fit, this just avoids an `.unwrap()`.
fn duration_to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

#[derive(Debug, Default, Clone)]
struct PendingEntry {
    channel_slug: String,
    senders: BTreeSet<String>,
}

pub struct NotificationBroker {
    store: Arc<FabricStore>,
    submitter: Option<Arc<dyn CommandSubmitter>>,
    clock: Arc<dyn Clock>,
    debounce: Duration,
    inbox_tx: mpsc::Sender<FabricEvent>,
    inbox_rx: AsyncMutex<Option<mpsc::Receiver<FabricEvent>>>,
    cancel: CancellationToken,
    task: AsyncMutex<Option<JoinHandle<()>>>,
    dropped_count: AtomicU64,
}

impl NotificationBroker {
    pub fn new(store: Arc<FabricStore>, submitter: Option<Arc<dyn CommandSubmitter>>, debounce: Duration) -> Arc<Self> {
        Self::with_clock(store, submitter, debounce, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<FabricStore>,
        submitter: Option<Arc<dyn CommandSubmitter>>,
        debounce: Duration,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let debounce = if debounce.is_zero() { DEFAULT_DEBOUNCE } else { debounce };
        let (tx, rx) = mpsc::channel(DEFAULT_INBOX_CAPACITY);
        Arc::new(Self {
            store,
            submitter,
            clock,
            debounce,
            inbox_tx: tx,
            inbox_rx: AsyncMutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            task: AsyncMutex::new(None),
            dropped_count: AtomicU64::new(0),
        })
    }

    /// Enqueues an event onto the bounded inbox. Full inboxes drop silently
    /// (best-effort delivery, counted for observability).
    pub fn handle_event(&self, event: FabricEvent) {
        if self.inbox_tx.try_send(event).is_err() {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            trace!("notification broker inbox full, dropping event");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Adapts this broker as a `FabricEvent` sink for `chain_handler`.
    pub fn as_handler(self: &Arc<Self>) -> EventHandler {
        let broker = self.clone();
        Arc::new(move |event: &FabricEvent| broker.handle_event(event.clone()))
    }

    /// Spawns the debounce/dispatch loop. Idempotent: a second call is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let Some(rx) = self.inbox_rx.lock().await.take() else {
            return;
        };
        let broker = self.clone();
        *task = Some(tokio::spawn(async move { broker.run(rx).await }));
    }

    /// Runs the debounce/dispatch loop. A `deadline` is only set (or
    /// extended) when `process_event` reports a qualifying event actually
    /// touched `pending` — irrelevant inbox traffic (subscribed, acked,
    /// channel.created, ...) must not postpone an already-pending nudge.
    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<FabricEvent>) {
        let mut pending: HashMap<String, PendingEntry> = HashMap::new();
        let mut deadline: Option<DateTime<Utc>> = None;
        loop {
            match deadline {
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        maybe_event = rx.recv() => match maybe_event {
                            Some(event) => {
                                if self.process_event(&event, &mut pending) {
                                    deadline = Some(self.clock.now() + duration_to_chrono(self.debounce));
                                }
                            }
                            None => break,
                        },
                    }
                }
                Some(dl) => {
                    let remaining = (dl - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.clock.sleep(remaining) => {
                            self.flush(&mut pending);
                            deadline = None;
                        }
                        maybe_event = rx.recv() => match maybe_event {
                            Some(event) => {
                                if self.process_event(&event, &mut pending) {
                                    deadline = Some(self.clock.now() + duration_to_chrono(self.debounce));
                                }
                            }
                            None => {
                                self.flush(&mut pending);
                                break;
                            }
                        },
                    }
                }
            }
        }
    }

    /// Applies one event to `pending`. Returns whether it was a qualifying
    /// event (message.posted/reply.posted) that actually nudged at least one
    /// agent — the caller uses this to decide whether the debounce deadline
    /// should start or extend.
    fn process_event(&self, event: &FabricEvent, pending: &mut HashMap<String, PendingEntry>) -> bool {
        if !matches!(event.event_type, FabricEventType::MessagePosted | FabricEventType::ReplyPosted) {
            return false;
        }
        let slug = event.channel_slug.clone().unwrap_or_default();
        if SUPPRESSED_CHANNELS.contains(&slug.as_str()) {
            return false;
        }
        let sender = event.agent_id.clone().unwrap_or_default();
        let mentions: HashSet<String> = event.mentions.clone().unwrap_or_default().into_iter().collect();
        let channel_id = event.channel_id.clone().unwrap_or_default();

        let mut touched = false;
        let mut nudge = |agent: &str, pending: &mut HashMap<String, PendingEntry>| {
            if agent == sender || agent.is_empty() {
                return;
            }
            let entry = pending.entry(agent.to_string()).or_default();
            entry.channel_slug = slug.clone();
            entry.senders.insert(sender.clone());
            touched = true;
        };

        for sub in self.store.subscriptions.list_for_channel(&channel_id) {
            match sub.mode {
                SubscriptionMode::All => nudge(&sub.agent_id, pending),
                SubscriptionMode::Mentions => {
                    if mentions.contains(&sub.agent_id.to_lowercase()) {
                        nudge(&sub.agent_id, pending);
                    }
                }
                SubscriptionMode::None => {}
            }
        }

        // Explicit mentions always deliver, regardless of subscription mode.
        for agent in &mentions {
            nudge(agent, pending);
        }

        // Thread-following: every participant of the reply's root is nudged.
        if event.event_type == FabricEventType::ReplyPosted {
            for participant in event.participants.clone().unwrap_or_default() {
                nudge(&participant, pending);
            }
        }

        touched
    }

    fn flush(&self, pending: &mut HashMap<String, PendingEntry>) {
        for (agent, entry) in pending.drain() {
            let senders: Vec<String> = entry.senders.into_iter().collect();
            let text = match senders.as_slice() {
                [] => continue,
                [only] => format!("[{only} sent a message in #{}] Use fabric_inbox to check messages.", entry.channel_slug),
                many => format!(
                    "[{} sent messages in #{}] Use fabric_inbox to check messages.",
                    many.join(", "),
                    entry.channel_slug
                ),
            };
            if let Some(submitter) = &self.submitter {
                submitter.submit(Command { agent_id: agent, source: CommandSource::Internal, text });
            }
        }
    }

    /// Cancels the event loop, clears pending state (by letting the loop's
    /// stack frame drop), and joins it. Idempotent — safe to call repeatedly.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submitter::RecordingSubmitter;
    use fabric_service::{FabricService, ReplyParams, SendMessageParams};

    fn setup() -> (Arc<FabricStore>, Arc<RecordingSubmitter>) {
        (Arc::new(FabricStore::new()), Arc::new(RecordingSubmitter::new()))
    }

    /// A `FabricService` over `store` whose own emitted events are discarded —
    /// these tests drive the broker directly via `handle_event`.
    fn silent_service(store: Arc<FabricStore>) -> FabricService {
        FabricService::new(store, Arc::new(|_: &FabricEvent| {}))
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_with_mode_all_gets_nudged() {
        let (store, submitter) = setup();
        let svc = silent_service(store.clone());
        svc.init_session("root-agent").unwrap();
        svc.subscribe("general", "bob", SubscriptionMode::All).unwrap();

        let broker = NotificationBroker::new(store.clone(), Some(submitter.clone()), Duration::from_millis(50));
        broker.start().await;

        let channel = store.threads.get_by_slug("general").unwrap();
        let thread = svc
            .send_message(SendMessageParams {
                channel_slug: "general".into(),
                content: "hi".into(),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        broker.handle_event(FabricEvent::message_posted(
            &channel.id,
            "general",
            "alice",
            thread,
            vec![],
            vec!["alice".into()],
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.stop().await;

        let commands = submitter.drain();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].agent_id, "bob");
        assert!(commands[0].text.contains("alice sent a message in #general"));
    }

    #[tokio::test(start_paused = true)]
    async fn observer_channel_is_suppressed() {
        let (store, submitter) = setup();
        let svc = silent_service(store.clone());
        svc.init_session("root-agent").unwrap();
        svc.subscribe("observer", "bob", SubscriptionMode::All).unwrap();

        let broker = NotificationBroker::new(store.clone(), Some(submitter.clone()), Duration::from_millis(30));
        broker.start().await;

        let channel = store.threads.get_by_slug("observer").unwrap();
        let thread = svc
            .send_message(SendMessageParams {
                channel_slug: "observer".into(),
                content: "hi".into(),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        broker.handle_event(fabric_service::FabricEvent::message_posted(
            &channel.id,
            "observer",
            "alice",
            thread,
            vec![],
            vec!["alice".into()],
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        broker.stop().await;
        assert!(submitter.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn multiple_senders_are_sorted_lexicographically_in_flush_message() {
        let (store, submitter) = setup();
        let svc = silent_service(store.clone());
        svc.init_session("root-agent").unwrap();
        svc.subscribe("general", "zoe", SubscriptionMode::All).unwrap();

        let broker = NotificationBroker::new(store.clone(), Some(submitter.clone()), Duration::from_millis(50));
        broker.start().await;

        let channel = store.threads.get_by_slug("general").unwrap();
        for sender in ["bob", "alice"] {
            let thread = svc
                .send_message(SendMessageParams {
                    channel_slug: "general".into(),
                    content: "hi".into(),
                    kind: None,
                    creator: sender.into(),
                    mentions: None,
                    metadata: Default::default(),
                })
                .unwrap();
            broker.handle_event(fabric_service::FabricEvent::message_posted(
                &channel.id,
                "general",
                sender,
                thread,
                vec![],
                vec![sender.to_string()],
            ));
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        broker.stop().await;

        let commands = submitter.drain();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].text.contains("alice, bob sent messages in #general"));
    }

    #[tokio::test(start_paused = true)]
    async fn irrelevant_events_do_not_restart_the_debounce_window() {
        let (store, submitter) = setup();
        let svc = silent_service(store.clone());
        svc.init_session("root-agent").unwrap();
        svc.subscribe("general", "bob", SubscriptionMode::All).unwrap();

        let broker = NotificationBroker::new(store.clone(), Some(submitter.clone()), Duration::from_millis(100));
        broker.start().await;

        let channel = store.threads.get_by_slug("general").unwrap();
        let thread = svc
            .send_message(SendMessageParams {
                channel_slug: "general".into(),
                content: "hi".into(),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        broker.handle_event(FabricEvent::message_posted(
            &channel.id,
            "general",
            "alice",
            thread,
            vec![],
            vec!["alice".into()],
        ));

        // Flood the inbox with unrelated events throughout the debounce
        // window; none of them are message.posted/reply.posted, so none
        // should push the flush deadline further out.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            broker.handle_event(FabricEvent::channel_archived(&channel.id, "general"));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.stop().await;

        let commands = submitter.drain();
        assert_eq!(commands.len(), 1, "debounce window should elapse and flush despite unrelated inbox traffic");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (store, _submitter) = setup();
        let broker = NotificationBroker::new(store, None, Duration::from_millis(10));
        broker.start().await;
        broker.stop().await;
        broker.stop().await;
    }

    #[tokio::test]
    async fn full_inbox_increments_dropped_count_not_panics() {
        let (store, _submitter) = setup();
        let broker = NotificationBroker::new(store.clone(), None, Duration::from_secs(3600));
        // Don't start the loop: inbox fills up under DEFAULT_INBOX_CAPACITY.
        for _ in 0..(DEFAULT_INBOX_CAPACITY + 5) {
            broker.handle_event(FabricEvent::channel_archived("c1", "general"));
        }
        assert!(broker.dropped_count() > 0);
    }
}
