//! `vigil-middleware` – event fan-out.
//!
//! Routes notifications between the evaluator, interlock, emergency responder,
//! executor and watchdog without caring about their meaning.
//!
//! - [`bus`] – typed, topic-based publish/subscribe built on Tokio broadcast
//!   channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver, DEFAULT_CAPACITY};
