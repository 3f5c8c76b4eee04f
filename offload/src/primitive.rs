//! Synchronous device↔host copy primitive. Generic over the `device`
//! crate's traits so the same code path drives both `device-cpu`
//! (tests) and `device-cuda` (production).

use crate::error::{OffloadError, Result};
use common::{DType, DeviceId};
use device::{Device, PinnedHostBuffer, Stream};
use std::sync::Arc;
use tensor::Tensor;

/// The `(origin_device, host_buffer)` pair that forms the offload
/// state — enough to reconstruct a [`Tensor`] once reloaded.
pub struct HostBackup {
    pub origin_device: DeviceId,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub host: Box<dyn PinnedHostBuffer>,
}

/// Allocate a pinned host buffer of identical shape/dtype/layout to
/// `src` and issue a device→host copy.
pub fn offload(src: &Tensor, stream: &dyn Stream, device: &dyn Device) -> HostBackup {
    let buf = src
        .buffer()
        .expect("offload() called on a tensor with already-empty storage");
    let host = device.alloc_pinned(buf.byte_len());
    stream.enqueue_d2h(buf.as_ref(), host.as_ref(), host.is_pinned());
    HostBackup {
        origin_device: src.device,
        dtype: src.dtype,
        shape: src.shape.clone(),
        host,
    }
}

/// Restore a [`HostBackup`] to device memory.
///
/// If `dest` is provided its size must equal the backup's; this is
/// where the async handler's double-buffer pool feeds a preallocated
/// destination back in rather than letting a fresh buffer be allocated
/// per reload. `non_blocking` defaults to the backup's pinned-ness when
/// `None`.
pub fn reload(
    backup: HostBackup,
    stream: &dyn Stream,
    device: &dyn Device,
    dest: Option<Arc<dyn device::DeviceBuffer>>,
    non_blocking: Option<bool>,
) -> Result<Tensor> {
    let non_blocking = non_blocking.unwrap_or_else(|| backup.host.is_pinned());
    let dst = match dest {
        Some(dst) => {
            if dst.byte_len() != backup.host.byte_len() {
                return Err(OffloadError::Shape {
                    src: backup.host.byte_len(),
                    dest: dst.byte_len(),
                });
            }
            dst
        }
        None => device.alloc(backup.host.byte_len()),
    };
    stream.enqueue_h2d(backup.host.as_ref(), dst.as_ref(), non_blocking);
    Ok(Tensor::new(backup.dtype, backup.shape, dst))
}
