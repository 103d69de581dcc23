//! Domain types shared across Haflow components: the canonical flattened
//! event, catalog rows, webhook subscriptions and deliveries, and aggregate
//! job records.

pub mod catalog;
pub mod delivery;
pub mod event;
pub mod job;
pub mod subscription;

pub use catalog::{Area, Capability, CapabilityType, Device, Entity, RegistryAction};
pub use delivery::{DeliveryStatus, WebhookDelivery};
pub use event::{Event, EventContext, Origin, StateSnapshot};
pub use job::{JobKind, JobRun, JobState};
pub use subscription::{
    Condition, ConditionGroup, ConditionSet, CreateSubscriptionRequest, WebhookSubscription,
};
