pub mod coordinator;

pub use coordinator::{CoordinatorError, SyncCoordinator};
