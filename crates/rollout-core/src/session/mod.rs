pub mod db;
pub mod lock;
pub mod model;

pub use db::SessionDb;
pub use lock::{ServiceLease, ServiceLocks};
pub use model::RolloutSession;
