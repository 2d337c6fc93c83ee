//! Shared domain types for the branchline pipeline orchestrator.
//!
//! This crate holds the data model that crosses component boundaries —
//! events, error kinds, the tier classification, and the manifest record —
//! so that the binary crate and any future adapter can depend on a single
//! stable vocabulary instead of re-deriving it.

pub mod error;
pub mod event;
pub mod manifest;
pub mod request;
pub mod tier;

pub use error::PipelineError;
pub use event::{Event, EventKind};
pub use manifest::{HistoryEntry, Manifest, PendingMergeEntry, ReadyEntry};
pub use request::{PipelineRequest, PipelineState, PipelineStatus};
pub use tier::{ChangeStats, Tier, TierThresholds};
