//! Configuration section definitions.
//!
//! Each module corresponds to a section in `previewd.toml`:
//!
//! | Module     | TOML Section   | Purpose                                  |
//! |------------|----------------|------------------------------------------|
//! | `runtime`  | `[runtime]`    | Runtime command, port pool, timeouts     |
//! | `watch`    | `[watch]`      | Debounce window, extra ignore patterns   |
//! | `queue`    | `[queue]`      | Tick, bound, retry policy                |
//! | `conflict` | `[conflict]`   | Default strategy, expiry                 |
//! | `registry` | `[registry]`   | Project cap, idle eviction               |
//! | `server`   | `[relay]`, `[admin]` | Listening endpoints                |
//! | `project`  | `[[project]]`  | Projects registered at boot              |

mod conflict;
mod project;
mod queue;
mod registry;
mod runtime;
mod server;
mod watch;

pub use conflict::ConflictConfig;
pub use project::ProjectEntry;
pub use queue::QueueConfig;
pub use registry::RegistryConfig;
pub use runtime::RuntimeConfig;
pub use server::{AdminConfig, RelayConfig};
pub use watch::WatchConfig;
