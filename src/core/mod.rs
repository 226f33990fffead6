//! Core types - pure abstractions shared across the codebase.

mod change;
mod events;
mod id;
mod priority;
mod state;

pub use change::ChangeKind;
pub use events::EventBus;
pub use id::ProjectId;
pub use priority::Priority;
pub use state::{is_shutdown, register_shutdown, setup_shutdown_handler};
