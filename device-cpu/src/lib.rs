//! In-process simulated backend: no real accelerator required. Used by
//! default and by every unit test in `offload` as a hardware-free
//! reference backend alongside the real GPU one.
//!
//! Streams here execute copies inline rather than truly asynchronously —
//! there is no device to overlap with — but the event/wait bookkeeping
//! is still real, so tests exercise the engine's cross-stream ordering
//! logic rather than assuming it away.

use common::DeviceId;
use device::{Device, DeviceBuffer, Event, PinnedHostBuffer, Stream};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

pub struct CpuDevice {
    id: DeviceId,
}

impl CpuDevice {
    pub fn new(id: usize) -> Arc<Self> {
        Arc::new(Self { id: DeviceId(id) })
    }

    /// Test/harness convenience: allocate a device buffer pre-populated
    /// with `bytes`, bypassing the zero-initialized [`Device::alloc`].
    pub fn alloc_with(&self, bytes: Vec<u8>) -> Arc<CpuBuffer> {
        Arc::new(CpuBuffer {
            device: self.id,
            data: Mutex::new(bytes),
        })
    }

    /// Test/harness convenience: allocate a pinned host buffer
    /// pre-populated with `bytes`.
    pub fn pinned_with(&self, bytes: Vec<u8>) -> Box<CpuHostBuffer> {
        Box::new(CpuHostBuffer {
            data: Mutex::new(bytes),
            pinned: true,
        })
    }
}

impl Device for CpuDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn current_stream(&self) -> Arc<dyn Stream> {
        Arc::new(CpuStream { device: self.id })
    }

    fn new_stream(&self) -> Arc<dyn Stream> {
        Arc::new(CpuStream { device: self.id })
    }

    fn alloc(&self, byte_len: usize) -> Arc<dyn DeviceBuffer> {
        Arc::new(CpuBuffer {
            device: self.id,
            data: Mutex::new(vec![0u8; byte_len]),
        })
    }

    fn alloc_pinned(&self, byte_len: usize) -> Box<dyn PinnedHostBuffer> {
        Box::new(CpuHostBuffer {
            data: Mutex::new(vec![0u8; byte_len]),
            pinned: true,
        })
    }
}

pub struct CpuBuffer {
    device: DeviceId,
    data: Mutex<Vec<u8>>,
}

impl CpuBuffer {
    /// Snapshot the current contents. Test-only convenience — real
    /// backends do not expose raw bytes through the `DeviceBuffer`
    /// trait at all.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl DeviceBuffer for CpuBuffer {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn byte_len(&self) -> usize {
        self.data.lock().len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CpuHostBuffer {
    data: Mutex<Vec<u8>>,
    pinned: bool,
}

impl CpuHostBuffer {
    /// Snapshot the current contents. Test-only convenience.
    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl PinnedHostBuffer for CpuHostBuffer {
    fn byte_len(&self) -> usize {
        self.data.lock().len()
    }

    fn is_pinned(&self) -> bool {
        self.pinned
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CpuEvent;
impl Event for CpuEvent {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CpuStream {
    device: DeviceId,
}

impl Stream for CpuStream {
    fn record_event(&self) -> Box<dyn Event> {
        Box::new(CpuEvent)
    }

    fn wait_event(&self, _event: &dyn Event) {
        // Copies below execute inline on the calling thread, so by the
        // time any event could be waited on the work it guards has
        // already completed. Kept as an explicit no-op rather than
        // omitted so the call sites in `offload` read the same against
        // every backend.
    }

    fn synchronize(&self) {}

    fn enqueue_d2h(&self, src: &dyn DeviceBuffer, dst: &dyn PinnedHostBuffer, _non_blocking: bool) {
        let src = src
            .as_any()
            .downcast_ref::<CpuBuffer>()
            .expect("device-cpu stream used with a foreign DeviceBuffer");
        assert_eq!(src.device(), self.device);
        let dst = dst
            .as_any()
            .downcast_ref::<CpuHostBuffer>()
            .expect("device-cpu stream used with a foreign PinnedHostBuffer");
        dst.data.lock().copy_from_slice(&src.data.lock());
    }

    fn enqueue_h2d(&self, src: &dyn PinnedHostBuffer, dst: &dyn DeviceBuffer, _non_blocking: bool) {
        let src = src
            .as_any()
            .downcast_ref::<CpuHostBuffer>()
            .expect("device-cpu stream used with a foreign PinnedHostBuffer");
        let dst = dst
            .as_any()
            .downcast_ref::<CpuBuffer>()
            .expect("device-cpu stream used with a foreign DeviceBuffer");
        assert_eq!(dst.device(), self.device);
        dst.data.lock().copy_from_slice(&src.data.lock());
    }
}
