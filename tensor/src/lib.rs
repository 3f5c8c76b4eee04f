//! The two tensor shapes the offload engine moves around: plain dense
//! tensors and the composite-quantized contract.
//!
//! Quantizers, GEMMs and the concrete dataclass shape of a quantized
//! tensor are out of scope here — this crate only pins down the
//! externally observable `prepare_for_saving` / `restore_from_saved` /
//! `get_data_tensors` / `clear` surface a composite must expose.

use common::DType;
use device::{Device, DeviceBuffer};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// What a [`Tensor`]'s storage currently points at.
///
/// Kept behind a shared, lockable cell (rather than owned directly by
/// `Tensor`) because a composite-quantized object frequently keeps its
/// own hidden handle to the same underlying buffer alongside whatever
/// the offload engine is tracking. Force-clearing through one `Tensor`
/// clone must be observable through every other clone that shares the
/// same storage cell.
enum Storage {
    Resident(Arc<dyn DeviceBuffer>),
    Empty,
}

/// Markers set by [`mark_activation_offload`]. Kept next
/// to `storage` rather than as plain fields on `Tensor` itself: a
/// composite's `get_data_tensors()` hands out a fresh `Tensor` clone each
/// call, and a marker set on one clone must still be visible through the
/// composite's own retained clone of the same underlying.
struct Markers {
    activation_offloading: bool,
    needs_force_clear: bool,
}

struct Inner {
    storage: Mutex<Storage>,
    markers: Mutex<Markers>,
}

/// A plain dense tensor. Cloning a `Tensor` is shallow: all clones share
/// the same underlying storage cell.
#[derive(Clone)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub device: common::DeviceId,
    inner: Arc<Inner>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("device", &self.device)
            .field("activation_offloading", &self.activation_offloading())
            .finish()
    }
}

impl Tensor {
    pub fn new(dtype: DType, shape: Vec<usize>, buf: Arc<dyn DeviceBuffer>) -> Self {
        let device = buf.device();
        Self {
            dtype,
            shape,
            device,
            inner: Arc::new(Inner {
                storage: Mutex::new(Storage::Resident(buf)),
                markers: Mutex::new(Markers {
                    activation_offloading: false,
                    needs_force_clear: false,
                }),
            }),
        }
    }

    /// Set by [`mark_activation_offload`]; read by the handler's default
    /// need-offload predicate.
    pub fn activation_offloading(&self) -> bool {
        self.inner.markers.lock().activation_offloading
    }

    pub fn set_activation_offloading(&self, value: bool) {
        self.inner.markers.lock().activation_offloading = value;
    }

    /// Set alongside `activation_offloading` on composite underlyings;
    /// tells the window-boundary release step to destructively empty
    /// storage rather than merely drop the handler's reference.
    pub fn needs_force_clear(&self) -> bool {
        self.inner.markers.lock().needs_force_clear
    }

    pub fn set_needs_force_clear(&self, value: bool) {
        self.inner.markers.lock().needs_force_clear = value;
    }

    pub fn alloc(dtype: DType, shape: Vec<usize>, elem_size: usize, device: &dyn Device) -> Self {
        let len: usize = shape.iter().product::<usize>() * elem_size;
        Self::new(dtype, shape, device.alloc(len))
    }

    pub fn byte_len(&self) -> usize {
        match &*self.inner.storage.lock() {
            Storage::Resident(buf) => buf.byte_len(),
            Storage::Empty => 0,
        }
    }

    /// `true` once this tensor's storage has been force-cleared: the
    /// buffer's storage is observably emptied (byte length zero).
    pub fn is_empty(&self) -> bool {
        matches!(&*self.inner.storage.lock(), Storage::Empty)
    }

    pub fn buffer(&self) -> Option<Arc<dyn DeviceBuffer>> {
        match &*self.inner.storage.lock() {
            Storage::Resident(buf) => Some(buf.clone()),
            Storage::Empty => None,
        }
    }

    /// Destructively empty this tensor's storage. Visible through every
    /// clone of this `Tensor` (see [`Storage`]'s doc comment).
    pub fn force_clear(&self) {
        *self.inner.storage.lock() = Storage::Empty;
    }

    /// Returns `true` if `self` and `other` share the same storage cell
    /// — used nowhere in the hot path, but handy for tests asserting the
    /// aliasing `force_clear` depends on.
    pub fn shares_storage_with(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// The composite-quantized contract consumed by the offload engine. A
/// bundle holding one-or-more underlying plain tensors plus metadata
/// the engine never inspects.
///
/// The `Float8`-like sub-kind additionally needs a boolean preserved
/// across an offload/reload cycle; rather than a separate trait (which
/// would force the engine to downcast trait objects), it is modeled as
/// an optional field on the base contract: `transpose_invalid` returns
/// `None` for composites that do not have the notion at all.
pub trait CompositeTensor: Send + Sync {
    /// Detach and return the underlying plain tensors, in a stable order
    /// that `restore_from_saved` must be called with.
    fn prepare_for_saving(&mut self) -> Vec<Tensor>;

    /// Re-attach a previously detached tensor list.
    fn restore_from_saved(&mut self, tensors: Vec<Tensor>);

    /// All underlying plain tensors, without detaching them.
    fn get_data_tensors(&self) -> Vec<Tensor>;

    /// Release this composite's internal references to its underlying
    /// storage (but not necessarily the storage itself — see
    /// `Tensor::force_clear` for that).
    fn clear(&mut self);

    /// `Some(_)` only for `Float8`-like composites.
    fn transpose_invalid(&self) -> Option<bool> {
        None
    }

    fn set_transpose_invalid(&mut self, _value: bool) {}

    /// Set by the handler on pop when double buffering is enabled: the
    /// underlying buffers this composite now points at are owned by the
    /// reload double-buffer pool, not by this composite, so teardown
    /// must not free them.
    fn set_do_not_clear(&mut self, _value: bool) {}
}

/// A composite object as seen by the engine: shared and interiorly
/// mutable, because the same instance can be pushed under two different
/// tags in the same forward pass and the engine must be able to tell
/// those two pushes apart by pointer identity (`Arc::ptr_eq`).
pub type CompositeHandle = Arc<Mutex<dyn CompositeTensor>>;

/// A symbolic/fake-shape placeholder with no real storage. Carries
/// nothing but an optional debug label — the engine passes it through
/// untouched.
#[derive(Clone, Debug, Default)]
pub struct StrayTensor {
    pub label: Option<String>,
}

/// What the host framework hands the engine at push time, already
/// discriminated into one of three shapes: stray, plain, or composite.
/// In a real integration this discrimination is performed by the
/// binding layer that talks to the host framework's tensor
/// representation (fake-tensor check, `isinstance` against the
/// composite-quantized base class, else plain); Rust's static typing
/// moves that check to the boundary rather than to a runtime probe over
/// a single dynamic type.
pub enum Captured {
    Stray(StrayTensor),
    Plain(Tensor),
    Composite(CompositeHandle),
}
