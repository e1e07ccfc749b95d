//! Notification bus for trigger events.
//!
//! Embedded-first: callbacks run synchronously on the thread that changed the
//! value, and [`TriggerStream`] offers a buffered alternative for consumers that
//! want to process events on their own thread.

/// Subscription list and delivery.
pub mod bus;
/// Event and subscription id types.
pub mod event;
/// Buffered stream subscriptions.
pub mod stream;

pub use bus::{DeliveryReport, HandlerError, NotificationBus, TriggerHandler};
pub use event::{SubscriptionId, TriggerFired};
pub use stream::TriggerStream;
