//! Activation offload engine: moves tensors captured during a forward
//! pass to host memory on a schedule and restores them just-in-time
//! during backward, overlapping the copies with compute via two
//! dedicated streams.
//!
//! Wiring, top to bottom: [`context::get_cpu_offload_context`] builds a
//! [`handler::AsyncDoubleBufferHandler`] and hands back a
//! [`hook::ScopedSaveRestoreHook`] plus a synchronizer closure built from
//! [`commit`]. [`primitive`] is the copy substrate both
//! [`sync_handler::SynchronousHandler`] and the async handler are built
//! on.

pub mod commit;
pub mod context;
pub mod error;
pub mod handler;
pub mod hook;
pub mod primitive;
pub mod probe;
pub mod sync_handler;

pub use common::{GroupId, Tag};
pub use context::{get_cpu_offload_context, OffloadConfig, OffloadContext, Synchronizer};
pub use error::{OffloadError, Result};
pub use hook::{is_offload_enabled, mark_activation_offload};
pub use tensor::Captured;

/// Shared contract between the scoped hook, the commit barrier and the
/// two handler implementations. Kept as a trait object boundary (`&dyn
/// OffloadHandler`) rather than a generic parameter so
/// `ScopedSaveRestoreHook`/the commit free functions stay decoupled from
/// which concrete handler backs them.
pub trait OffloadHandler: Send {
    /// Register a newly captured tensor, returning its tag.
    fn push(&mut self, captured: Captured) -> Tag;

    /// Remove and return the tensor registered under `tag`.
    fn pop(&mut self, tag: Tag) -> Captured;

    /// Forward-time layer boundary.
    fn on_group_commit_forward(&mut self) -> crate::error::Result<()>;

    /// Backward-time layer boundary.
    fn on_group_commit_backward(&mut self) -> crate::error::Result<()>;

    /// `true` once every tag this handler issued has been popped and
    /// every counter is back at its initial value. Checked by the
    /// scoped hook on exit.
    fn is_drained(&self) -> bool;

    /// Number of tags still outstanding, for [`error::OffloadError::Leak`].
    fn outstanding_count(&self) -> usize;
}
