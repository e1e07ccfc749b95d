//! In-process publish/subscribe for trigger notifications.
//!
//! Delivery is synchronous and ordered by subscription. A failing handler (an
//! `Err` return or a panic) is logged and counted but never stops delivery to
//! the remaining subscribers. Stream subscribers get a bounded buffer and never
//! block the publisher: a full buffer drops the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::{bounded, Sender, TrySendError};

use super::event::{SubscriptionId, TriggerFired};
use super::stream::TriggerStream;

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receiver of trigger notifications.
///
/// Implemented for any `Fn(&TriggerFired) -> Result<(), HandlerError>`.
pub trait TriggerHandler: Send + Sync {
    /// Handle one event.
    fn handle(&self, event: &TriggerFired) -> Result<(), HandlerError>;
}

impl<F> TriggerHandler for F
where
    F: Fn(&TriggerFired) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &TriggerFired) -> Result<(), HandlerError> {
        self(event)
    }
}

#[derive(Clone)]
enum Subscriber {
    Handler(Arc<dyn TriggerHandler>),
    Stream(Sender<TriggerFired>),
}

/// Outcome of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Subscribers that accepted the event.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
    /// Stream subscribers whose buffer was full or gone.
    pub dropped: usize,
}

/// Per-engine notification bus.
pub struct NotificationBus {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    closed: AtomicBool,
    failed_deliveries: AtomicU64,
    dropped_events: AtomicU64,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .field("failed_deliveries", &self.failed_deliveries())
            .field("dropped_events", &self.dropped_events())
            .finish()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    /// Create an open bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            failed_deliveries: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        }
    }

    fn insert(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId::new();
        let mut subs = match self.subscribers.write() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.is_closed() {
            tracing::warn!(subscription = %id, "subscribe on closed notification bus ignored");
            return id;
        }
        subs.push((id, subscriber));
        id
    }

    /// Register a callback handler.
    pub fn subscribe(&self, handler: Arc<dyn TriggerHandler>) -> SubscriptionId {
        self.insert(Subscriber::Handler(handler))
    }

    /// Register a bounded stream subscriber.
    pub fn subscribe_stream(self: &Arc<Self>, capacity: usize) -> TriggerStream {
        let (tx, rx) = bounded::<TriggerFired>(capacity.max(1));
        let id = self.insert(Subscriber::Stream(tx));
        TriggerStream::new(id, rx, Arc::downgrade(self))
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = match self.subscribers.write() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        subs.len() != before
    }

    /// Deliver an event to every current subscriber, in subscription order.
    pub fn publish(&self, event: &TriggerFired) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if self.is_closed() {
            return report;
        }

        // Snapshot so handlers may (un)subscribe without deadlocking. `close`
        // flips the flag under the write lock, so it is re-read here.
        let snapshot: Vec<(SubscriptionId, Subscriber)> = {
            let subs = match self.subscribers.read() {
                Ok(subs) => subs,
                Err(poisoned) => poisoned.into_inner(),
            };
            if self.is_closed() {
                return report;
            }
            subs.clone()
        };

        let mut disconnected = Vec::new();
        for (id, subscriber) in snapshot {
            if self.is_closed() {
                break;
            }
            match subscriber {
                Subscriber::Handler(handler) => {
                    match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                        Ok(Ok(())) => report.delivered += 1,
                        Ok(Err(err)) => {
                            report.failed += 1;
                            tracing::warn!(
                                subscription = %id,
                                trigger = %event.trigger,
                                counter = %event.counter,
                                error = %err,
                                "trigger handler failed"
                            );
                        }
                        Err(_) => {
                            report.failed += 1;
                            tracing::warn!(
                                subscription = %id,
                                trigger = %event.trigger,
                                counter = %event.counter,
                                "trigger handler panicked"
                            );
                        }
                    }
                }
                Subscriber::Stream(tx) => match tx.try_send(event.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => report.dropped += 1,
                    Err(TrySendError::Disconnected(_)) => {
                        report.dropped += 1;
                        disconnected.push(id);
                    }
                },
            }
        }

        for id in disconnected {
            self.unsubscribe(id);
        }

        self.failed_deliveries
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        self.dropped_events
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }

    /// Clear every subscription; later publishes are no-ops.
    pub fn close(&self) {
        let mut subs = match self.subscribers.write() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        subs.clear();
    }

    /// True once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.read() {
            Ok(subs) => subs.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Handler failures since creation.
    #[must_use]
    pub fn failed_deliveries(&self) -> u64 {
        self.failed_deliveries.load(Ordering::Relaxed)
    }

    /// Stream events dropped since creation.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
}
