//! Stream/event/pinned-memory substrate consumed by the offload engine.
//!
//! This crate only defines the contract: a stream/event API with a
//! current-stream accessor, `stream.wait_stream(other)`, enqueue of
//! device/host copies, and pinned host allocation. Two crates implement
//! it: `device-cpu` (in-process, used by default and by every test) and
//! `device-cuda` (real hardware, behind the `cuda` feature on the
//! workspace and a build-time toolkit probe).

use common::DeviceId;
use std::any::Any;
use std::sync::Arc;

/// A device-resident allocation. Opaque to callers outside the backend
/// that created it: the engine only ever moves buffers around, never
/// inspects their bytes. `as_any` exists purely so a concrete backend's
/// `Stream` impl can recover its own buffer type out of the trait object
/// the generic engine code hands it back.
pub trait DeviceBuffer: Send + Sync {
    fn device(&self) -> DeviceId;
    fn byte_len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

/// A host allocation, optionally page-locked ("pinned") for DMA.
/// Copy destinations take `&self` rather than `&mut self` on both this
/// trait and `DeviceBuffer`: ordering is established by the stream/event
/// discipline, not by Rust's aliasing rules, the same way a raw CUDA
/// memcpy targets a pointer rather than a uniquely-borrowed slice. Each
/// backend supplies its own interior mutability.
pub trait PinnedHostBuffer: Send + Sync {
    fn byte_len(&self) -> usize;
    fn is_pinned(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

/// An opaque cross-stream synchronization marker.
pub trait Event: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// A logical command queue. `d2h_stream`/`h2d_stream` in the engine are
/// instances of this trait distinct from the ambient compute stream.
pub trait Stream: Send + Sync {
    /// Record an event on this stream's current position.
    fn record_event(&self) -> Box<dyn Event>;

    /// Block this stream's future work until `event` has fired.
    fn wait_event(&self, event: &dyn Event);

    /// Make this stream wait for everything `other` has enqueued so far:
    /// record an event on `other`, wait on it from `self`.
    fn wait_stream(&self, other: &dyn Stream) {
        self.wait_event(other.record_event().as_ref());
    }

    /// Block the calling thread until all enqueued work has completed.
    fn synchronize(&self);

    /// Enqueue a device-to-host copy. `non_blocking` only has observable
    /// effect when `dst` is pinned; unpinned host memory always forces a
    /// blocking copy at the backend level.
    fn enqueue_d2h(&self, src: &dyn DeviceBuffer, dst: &dyn PinnedHostBuffer, non_blocking: bool);

    /// Enqueue a host-to-device copy, symmetric to [`Stream::enqueue_d2h`].
    fn enqueue_h2d(&self, src: &dyn PinnedHostBuffer, dst: &dyn DeviceBuffer, non_blocking: bool);
}

/// A single accelerator: allocates buffers and streams on itself.
pub trait Device: Send + Sync {
    fn id(&self) -> DeviceId;

    /// The stream compute kernels for this device are enqueued on.
    fn current_stream(&self) -> Arc<dyn Stream>;

    /// A fresh stream independent of the current one (used by the engine
    /// for its dedicated `d2h_stream`/`h2d_stream`).
    fn new_stream(&self) -> Arc<dyn Stream>;

    fn alloc(&self, byte_len: usize) -> Arc<dyn DeviceBuffer>;

    fn alloc_like(&self, other: &dyn DeviceBuffer) -> Arc<dyn DeviceBuffer> {
        self.alloc(other.byte_len())
    }

    /// Host buffers returned here are pinned by default.
    fn alloc_pinned(&self, byte_len: usize) -> Box<dyn PinnedHostBuffer>;
}
