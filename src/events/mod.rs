//! Schema-stable debate events: envelope types, de-duplicating dispatcher,
//! and resumable subscriber streams.

mod dispatcher;
mod types;

pub use dispatcher::{EventDispatcher, EventError, EventSubscription, SharedDispatcher};
pub use types::{derive_event_id, DebateEvent, EventKind};
