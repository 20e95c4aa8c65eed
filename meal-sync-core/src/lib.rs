//! Core types for the meal sync protocol.
//!
//! Everything here is pure data and deterministic logic: change
//! envelopes, patch documents, the command catalog, the portion ledger
//! vocabulary, conflict objects and the per-entity-class resolver, and
//! the wire types for the sync endpoints. Persistence and transport
//! live in the server crate.

pub mod change;
pub mod command;
pub mod conflict;
pub mod cursor;
pub mod error;
pub mod event;
pub mod patch;
pub mod portion;
pub mod protocol;
pub mod resolver;

pub use change::{Change, ChangeBase, ChangeOp, ChangeOutcome, ChangeStatus, TargetRef};
pub use command::Command;
pub use conflict::{Conflict, ConflictReason, ResolutionChoice};
pub use cursor::Cursor;
pub use error::SyncError;
pub use event::DomainEvent;
pub use patch::PatchDocument;
pub use portion::{PortionEvent, PortionKind};
pub use resolver::{classify, resolve, EntityClass, MergeInput, Resolution};
