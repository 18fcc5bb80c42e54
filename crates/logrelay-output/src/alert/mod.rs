//! Correlated alerting
//!
//! Context lines are grouped per correlation key in a [`CorrelationStore`].
//! When an error arrives for a key, the [`AlertSink`] waits a short moment
//! for stragglers and then hands the whole bucket to the [`DispatchQueue`],
//! whose consumer delivers it through an [`AlertTransport`].

pub mod dispatch;
pub mod message;
pub mod sink;
pub mod store;
pub mod telegram;

pub use dispatch::DispatchQueue;
pub use message::{AlertHeader, AlertMessage};
pub use sink::AlertSink;
pub use store::{CorrelationStore, Generation, Stored};
pub use telegram::{AlertTransport, TelegramTransport};
