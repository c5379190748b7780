pub mod config;
pub mod control_plane;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod health;
pub mod initiator;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod registrar;
pub mod rollback;
pub mod session;
pub mod spec;
pub mod types;
pub mod watcher;

pub use error::{Result, RolloutError};
