//! Session Management Module
//!
//! Registry of remote sessions with:
//! - Validation and rate limiting before a session is admitted
//! - Connection lifecycle (`disconnected` -> `connecting` -> `connected`)
//! - Inactivity sweep
//! - Lifecycle events for subscribers such as the tab multiplexer

pub mod events;
mod registry;
pub mod types;

pub use events::{EventBus, SessionEvent, Subscription, SubscriptionToken};
pub use registry::SessionRegistry;
pub use types::{ConnectionState, SessionInfo};
