//! # Webhook Dispatcher
//!
//! Tees from the in-memory event stream and fans events out to configured
//! webhook subscriptions. Each subscription gets its own bounded mailbox
//! (drop-oldest on overflow) and its own consumer task, so a stalled
//! delivery blocks only its own subscription, never another.
//!
//! Deliveries are HMAC-SHA256-signed HTTP POSTs with a bounded retry
//! schedule; every state transition of a delivery row is persisted so a
//! crash during dispatch cannot lose a pending row.

pub mod delivery;
pub mod dispatcher;
pub mod mailbox;
pub mod metrics;

pub use delivery::DeliverySender;
pub use dispatcher::WebhookDispatcher;
pub use mailbox::Mailbox;
