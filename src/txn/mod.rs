//! Transaction layer: shared environment, transaction guard, process lock

pub mod env;
pub mod guard;
pub mod lock_manager;

pub use env::{open_environment, release_environment, OpenKind, OpenedEnv, SharedEnv, REGION_FILE};
pub use guard::{with_read_txn, with_transaction};
pub use lock_manager::PidLock;
