//! Shared type definitions for Sluice.
//!
//! These types describe the externally observable state of the source cache:
//! normalized [`SourceId`]s, the [`CacheEntry`] stored for each of them, the
//! append-only list of [`ErrorRecord`]s, and the [`StoreAction`]s that drive
//! every transition. They are deliberately free of any runtime so that the
//! engine, the CLI, and tests can share them.

pub mod action;
pub mod entry;
pub mod failure;
pub mod location;
pub mod source_id;

pub use action::StoreAction;
pub use entry::{CacheEntry, CacheSnapshot, ErrorRecord};
pub use failure::FailureKind;
pub use location::Location;
pub use source_id::{SourceId, absolutize};
