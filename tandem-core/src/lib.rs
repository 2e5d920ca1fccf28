//! # tandem-core: Operation model for Tandem
//!
//! Plain-text documents addressed by character offsets, the edit operations
//! that change them, and the transformation rules that let concurrent edits
//! converge.
//!
//! ## Modules
//!
//! - [`operation`]: `Operation`, `Component`, `OpId`, composition
//! - [`transform`]: concurrent edit transformation and offset rebasing
//! - [`document`]: rope-backed `Document` and `Snapshot`
//!
//! Nothing here does I/O; the distributed pieces live in `tandem-collab`.

pub mod document;
pub mod operation;
pub mod transform;

pub use document::{apply, Document, Snapshot};
pub use operation::{
    compose, AcceptedOperation, Component, DocumentId, OpId, Operation, OperationError, ParticipantId,
};
pub use transform::{
    transform, transform_offset, transform_pair, transform_pair_with_report, transform_range,
    transform_with_report, Bias, TransformReport,
};
