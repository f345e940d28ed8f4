//! Autosave for block documents.
//!
//! This crate provides:
//! - `debounce` / `throttle`: time-windowed call coalescing
//! - `HttpBlockClient`: the block API over HTTP, behind the `BlockService` trait
//! - `IdentityResolver`: lazy block creation and the document's `(id, version)`
//! - `Reconciler`: optimistic-concurrency saves with a single conflict retry
//! - `AutosaveSession` / `DocumentBuffer`: the lifecycle a host drives

pub mod client;
pub mod error;
pub mod host;
pub mod identity;
pub mod reconciler;
pub mod scheduler;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;


pub use client::{BlockService, CreatedBlock, HttpBlockClient, NewBlock, PatchedBlock, StoredBlock};
pub use error::{BlockError, Operation};
pub use host::DocumentBuffer;
pub use identity::{BlockIdentity, BlockRef, IdentityResolver, SkipReason};
pub use reconciler::{Reconciler, SaveOutcome, SaveStatus, SavedBlock};
pub use session::{AutosaveOptions, AutosaveSession};
pub use types::{BlockId, DocumentId, MeetingId, Snapshot, Version};
