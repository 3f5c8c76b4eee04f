//! Asynchronous double-buffered handler — the scheduler. Extends the
//! synchronous handler's push/pop shape (by reimplementation, not
//! inheritance — see [`crate::sync_handler`]) with two extra streams, a
//! window-based bulk offload/reload schedule, composite-tensor
//! bookkeeping, deduplication and reload double-buffer cycling.

use crate::error::Result;
use crate::primitive::{self, HostBackup};
use crate::OffloadHandler;
use common::{GroupId, Tag};
use device::{Device, DeviceBuffer, Stream};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tensor::{Captured, CompositeHandle, StrayTensor, Tensor};

enum UnderlyingState {
    Device(Tensor),
    Host(HostBackup),
}

enum PlainState {
    Device(Tensor),
    Host(HostBackup),
}

enum CompositeState {
    /// Per-underlying device/host states, populated at push and mutated
    /// in place by `bulk_offload_group`/`bulk_reload_group`. Tags whose
    /// group never falls inside the offload window stay in this shape
    /// forever — `pop` has to restore them itself in that case (see
    /// `pop`'s doc comment).
    Underlying(Vec<UnderlyingState>),
    /// Rebuilt by `bulk_reload_group` once every underlying has been
    /// brought back to device memory.
    Restored(CompositeHandle),
}

enum Slot {
    Stray(StrayTensor),
    Plain(PlainState),
    Composite(CompositeState),
}

/// `layer_window[i]` — the forward-group index after which the i-th
/// offload batch must have been launched. Built once at construction
/// time.
fn build_window_plan(num_offload_groups: i64, num_model_layers: i64) -> Vec<GroupId> {
    let base = num_model_layers / num_offload_groups;
    let rem = num_model_layers % num_offload_groups;
    let mut acc = 0;
    (0..num_offload_groups)
        .map(|i| {
            acc += base + if i < rem { 1 } else { 0 };
            GroupId(acc - 1)
        })
        .collect()
}

pub struct AsyncDoubleBufferHandler {
    device: Arc<dyn Device>,
    compute_stream: Arc<dyn Stream>,
    d2h_stream: Arc<dyn Stream>,
    h2d_stream: Arc<dyn Stream>,
    num_offload_groups: i64,
    num_model_layers: i64,
    double_buffering: bool,
    need_offload: Box<dyn Fn(&Tensor) -> bool + Send>,
    layer_window: Vec<GroupId>,

    current_group: GroupId,
    intra_group_seq: u64,
    stray_seq: u64,
    offloaded_group_count: i64,

    slots: BTreeMap<Tag, Slot>,
    buf_refs: BTreeMap<Tag, Vec<Tensor>>,
    composite_map: BTreeMap<Tag, CompositeHandle>,
    dedup_set: BTreeSet<Tag>,
    transpose_cache_valid: BTreeMap<Tag, bool>,

    reload_buffers: [Vec<Arc<dyn DeviceBuffer>>; 2],
    reload_buffers_ready: [bool; 2],
}

impl AsyncDoubleBufferHandler {
    pub fn new(
        device: Arc<dyn Device>,
        num_offload_groups: i64,
        num_model_layers: i64,
        double_buffering: bool,
    ) -> Self {
        Self::with_predicate(
            device,
            num_offload_groups,
            num_model_layers,
            double_buffering,
            |t: &Tensor| t.activation_offloading(),
        )
    }

    /// Construct with a custom need-offload predicate, overriding the
    /// default `activation_offloading` marker check.
    pub fn with_predicate(
        device: Arc<dyn Device>,
        num_offload_groups: i64,
        num_model_layers: i64,
        double_buffering: bool,
        need_offload: impl Fn(&Tensor) -> bool + Send + 'static,
    ) -> Self {
        assert!(num_offload_groups >= 1, "num_offload_groups must be >= 1");
        assert!(
            num_model_layers >= num_offload_groups,
            "num_model_layers must be >= num_offload_groups"
        );
        let compute_stream = device.current_stream();
        let d2h_stream = device.new_stream();
        let h2d_stream = device.new_stream();
        let layer_window = build_window_plan(num_offload_groups, num_model_layers);
        debug!("cpu offload window plan: {layer_window:?}");
        Self {
            device,
            compute_stream,
            d2h_stream,
            h2d_stream,
            num_offload_groups,
            num_model_layers,
            double_buffering,
            need_offload: Box::new(need_offload),
            layer_window,
            current_group: GroupId(0),
            intra_group_seq: 0,
            stray_seq: 0,
            offloaded_group_count: 0,
            slots: BTreeMap::new(),
            buf_refs: BTreeMap::new(),
            composite_map: BTreeMap::new(),
            dedup_set: BTreeSet::new(),
            transpose_cache_valid: BTreeMap::new(),
            reload_buffers: [Vec::new(), Vec::new()],
            reload_buffers_ready: [false, false],
        }
    }

    fn in_window(&self) -> bool {
        self.current_group.0 < self.num_offload_groups
    }

    fn group_range(g: GroupId) -> std::ops::Range<Tag> {
        Tag::new(g, 0)..Tag::new(GroupId(g.0 + 1), 0)
    }

    fn tags_in_group(&self, g: GroupId) -> Vec<Tag> {
        self.slots.range(Self::group_range(g)).map(|(t, _)| *t).collect()
    }

    /// Bulk device→host eviction of every offload-eligible tensor tagged
    /// with group `g`. Issued on `d2h_stream`; returns immediately, the
    /// copies themselves are asynchronous.
    fn bulk_offload_group(&mut self, g: GroupId) {
        let stream = self.d2h_stream.clone();
        let device = self.device.clone();
        let tags = self.tags_in_group(g);
        let mut offloaded = 0usize;
        for tag in &tags {
            match self.slots.get_mut(tag).expect("tag present in range query") {
                Slot::Plain(state) => {
                    if let PlainState::Device(t) = state {
                        if (self.need_offload)(t) {
                            let backup = primitive::offload(t, stream.as_ref(), device.as_ref());
                            *state = PlainState::Host(backup);
                            offloaded += 1;
                        }
                    }
                }
                Slot::Composite(CompositeState::Underlying(entries)) => {
                    for entry in entries.iter_mut() {
                        if let UnderlyingState::Device(t) = entry {
                            if (self.need_offload)(t) {
                                let backup = primitive::offload(t, stream.as_ref(), device.as_ref());
                                *entry = UnderlyingState::Host(backup);
                                offloaded += 1;
                            }
                        }
                    }
                }
                Slot::Composite(CompositeState::Restored(_)) | Slot::Stray(_) => {}
            }
        }
        debug!("bulk offload group {g}: {offloaded} buffers queued on d2h stream ({} tags)", tags.len());
    }

    /// Bulk host→device restore of every evicted tensor tagged with
    /// group `g`. Issued on `h2d_stream`.
    fn bulk_reload_group(&mut self, g: GroupId) -> Result<()> {
        let stream = self.h2d_stream.clone();
        let device = self.device.clone();
        let double_buffer_idx = g.0.rem_euclid(2) as usize;
        let mut buffer_idx = 0usize;
        let tags = self.tags_in_group(g);
        for tag in tags {
            let slot = self.slots.remove(&tag).expect("tag present in range query");
            let slot = match slot {
                Slot::Plain(PlainState::Host(backup)) => {
                    let dest = self.reload_buffers[double_buffer_idx].get(buffer_idx).cloned();
                    if dest.is_some() {
                        buffer_idx += 1;
                    }
                    let t = primitive::reload(backup, stream.as_ref(), device.as_ref(), dest, Some(true))?;
                    Slot::Plain(PlainState::Device(t))
                }
                plain @ Slot::Plain(PlainState::Device(_)) => plain,
                Slot::Composite(CompositeState::Underlying(entries)) => {
                    let mut rebuilt = Vec::with_capacity(entries.len());
                    for entry in entries {
                        match entry {
                            UnderlyingState::Host(backup) => {
                                let dest = self.reload_buffers[double_buffer_idx].get(buffer_idx).cloned();
                                if dest.is_some() {
                                    buffer_idx += 1;
                                }
                                let t = primitive::reload(
                                    backup,
                                    stream.as_ref(),
                                    device.as_ref(),
                                    dest,
                                    Some(true),
                                )?;
                                rebuilt.push(t);
                            }
                            UnderlyingState::Device(t) => rebuilt.push(t),
                        }
                    }
                    let handle = self
                        .composite_map
                        .remove(&tag)
                        .expect("composite registered at push");
                    if self.dedup_set.remove(&tag) {
                        debug!("dedup skip restore for composite tag {tag}");
                    } else {
                        let mut c = handle.lock();
                        c.restore_from_saved(rebuilt);
                        if let Some(flag) = self.transpose_cache_valid.remove(&tag) {
                            c.set_transpose_invalid(flag);
                        }
                    }
                    Slot::Composite(CompositeState::Restored(handle))
                }
                other @ (Slot::Stray(_) | Slot::Composite(CompositeState::Restored(_))) => other,
            };
            self.slots.insert(tag, slot);
        }
        debug!("bulk reload group {g} issued on h2d stream");
        Ok(())
    }

    /// Release device-side buffer references for group `g` once its
    /// eviction has completed. Tensors marked `needs_force_clear`
    /// have their storage destructively emptied rather than merely
    /// dropped, because a composite may retain its own hidden reference
    /// to the same underlying beyond the handler's reach.
    fn release_group(&mut self, g: GroupId) {
        let tags: Vec<Tag> = self.buf_refs.range(Self::group_range(g)).map(|(t, _)| *t).collect();
        for tag in tags {
            if let Some(tensors) = self.buf_refs.remove(&tag) {
                for t in tensors {
                    if t.needs_force_clear() {
                        t.force_clear();
                        debug!("force-cleared storage for tag {tag}");
                    }
                }
            }
        }
    }

    fn alloc_reload_half_from_group(&mut self, idx: usize, g: GroupId) {
        if !self.double_buffering || self.reload_buffers_ready[idx] {
            return;
        }
        let bufs: Vec<Arc<dyn DeviceBuffer>> = self
            .buf_refs
            .range(Self::group_range(g))
            .flat_map(|(_, tensors)| tensors.iter())
            .filter_map(|t| t.buffer())
            .map(|b| self.device.alloc_like(b.as_ref()))
            .collect();
        self.reload_buffers[idx] = bufs;
        self.reload_buffers_ready[idx] = true;
    }

    fn alloc_reload_half_matching(&mut self, idx: usize) {
        if !self.double_buffering || self.reload_buffers_ready[idx] {
            return;
        }
        let bufs: Vec<Arc<dyn DeviceBuffer>> = self.reload_buffers[0]
            .iter()
            .map(|b| self.device.alloc_like(b.as_ref()))
            .collect();
        self.reload_buffers[idx] = bufs;
        self.reload_buffers_ready[idx] = true;
    }
}

impl OffloadHandler for AsyncDoubleBufferHandler {
    fn push(&mut self, captured: Captured) -> Tag {
        match captured {
            Captured::Stray(s) => {
                let tag = Tag::new(GroupId::STRAY, self.stray_seq);
                self.stray_seq += 1;
                self.slots.insert(tag, Slot::Stray(s));
                tag
            }
            Captured::Plain(t) => {
                let tag = Tag::new(self.current_group, self.intra_group_seq);
                self.intra_group_seq += 1;
                if self.in_window() && (self.need_offload)(&t) {
                    self.buf_refs.entry(tag).or_default().push(t.clone());
                }
                self.slots.insert(tag, Slot::Plain(PlainState::Device(t)));
                tag
            }
            Captured::Composite(c) => {
                let tag = Tag::new(self.current_group, self.intra_group_seq);
                self.intra_group_seq += 1;

                let underlyings = c.lock().prepare_for_saving();

                if self.composite_map.values().any(|existing| Arc::ptr_eq(existing, &c)) {
                    self.dedup_set.insert(tag);
                }
                self.composite_map.insert(tag, c.clone());

                let mut entries = Vec::with_capacity(underlyings.len());
                let mut any_eligible = false;
                for u in underlyings {
                    if self.in_window() && (self.need_offload)(&u) {
                        self.buf_refs.entry(tag).or_default().push(u.clone());
                        any_eligible = true;
                    }
                    entries.push(UnderlyingState::Device(u));
                }
                if any_eligible {
                    c.lock().clear();
                }
                if let Some(flag) = c.lock().transpose_invalid() {
                    self.transpose_cache_valid.insert(tag, flag);
                }

                self.slots.insert(tag, Slot::Composite(CompositeState::Underlying(entries)));
                tag
            }
        }
    }

    /// Composites whose group never falls inside the offload window are
    /// never touched by `bulk_offload_group`/`bulk_reload_group` (those
    /// only iterate groups `0..num_offload_groups`), so they reach `pop`
    /// still in the `Underlying` shape; `pop` performs the same
    /// dedup-checked restore bulk reload would otherwise have done.
    fn pop(&mut self, tag: Tag) -> Captured {
        let slot = self
            .slots
            .remove(&tag)
            .unwrap_or_else(|| panic!("offload tag {tag} popped twice or never pushed"));
        self.buf_refs.remove(&tag);
        match slot {
            Slot::Stray(s) => Captured::Stray(s),
            Slot::Plain(PlainState::Device(t)) => Captured::Plain(t),
            Slot::Plain(PlainState::Host(_)) => {
                panic!("offload tag {tag} popped before its group was reloaded")
            }
            Slot::Composite(CompositeState::Restored(handle)) => {
                if self.double_buffering {
                    handle.lock().set_do_not_clear(true);
                }
                Captured::Composite(handle)
            }
            Slot::Composite(CompositeState::Underlying(entries)) => {
                let tensors: Vec<Tensor> = entries
                    .into_iter()
                    .map(|e| match e {
                        UnderlyingState::Device(t) => t,
                        UnderlyingState::Host(_) => {
                            unreachable!("out-of-window composite has no evicted underlyings")
                        }
                    })
                    .collect();
                let handle = self
                    .composite_map
                    .remove(&tag)
                    .expect("composite registered at push");
                if self.dedup_set.remove(&tag) {
                    debug!("dedup skip restore (out-of-window) for composite tag {tag}");
                } else {
                    let mut c = handle.lock();
                    c.restore_from_saved(tensors);
                    if let Some(flag) = self.transpose_cache_valid.remove(&tag) {
                        c.set_transpose_invalid(flag);
                    }
                }
                Captured::Composite(handle)
            }
        }
    }

    fn on_group_commit_forward(&mut self) -> Result<()> {
        let cur = self.current_group;

        if cur.0 == 0 {
            self.d2h_stream.wait_stream(self.compute_stream.as_ref());
            self.alloc_reload_half_from_group(0, GroupId(0));
            self.bulk_offload_group(GroupId(0));
        }

        if self.offloaded_group_count < self.num_offload_groups
            && self.layer_window[self.offloaded_group_count as usize] == cur
        {
            self.d2h_stream.wait_stream(self.compute_stream.as_ref());
            self.compute_stream.wait_stream(self.d2h_stream.as_ref());

            self.release_group(GroupId(self.offloaded_group_count));

            if self.offloaded_group_count + 1 < self.num_offload_groups {
                self.bulk_offload_group(GroupId(self.offloaded_group_count + 1));
            }
            self.offloaded_group_count += 1;
        }

        if cur.0 == self.num_model_layers - 1 {
            self.alloc_reload_half_matching(1);
        }

        self.current_group = GroupId(cur.0 + 1);
        self.intra_group_seq = 0;
        Ok(())
    }

    fn on_group_commit_backward(&mut self) -> Result<()> {
        self.current_group = GroupId(self.current_group.0 - 1);
        assert!(self.current_group.0 >= 0, "group counter underflow");

        if self.offloaded_group_count > 0
            && self.layer_window[(self.offloaded_group_count - 1) as usize] == self.current_group
        {
            self.compute_stream.wait_stream(self.h2d_stream.as_ref());
            self.h2d_stream.wait_stream(self.compute_stream.as_ref());

            self.bulk_reload_group(GroupId(self.offloaded_group_count - 1))?;
            // Decrements only while above 1, so this sticks at 1 rather
            // than reaching 0 on its own; the `current_group == 0` branch
            // below is what actually resets it to 0 at the end of
            // backward.
            if self.offloaded_group_count > 1 {
                self.offloaded_group_count -= 1;
            }
        }

        if self.current_group.0 == 0 {
            self.compute_stream.wait_stream(self.h2d_stream.as_ref());
            self.offloaded_group_count = 0;
        }
        Ok(())
    }

    fn is_drained(&self) -> bool {
        self.slots.is_empty()
            && self.buf_refs.is_empty()
            && self.composite_map.is_empty()
            && self.dedup_set.is_empty()
            && self.transpose_cache_valid.is_empty()
            && self.current_group.0 == 0
            && self.offloaded_group_count == 0
    }

    fn outstanding_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_cpu::CpuDevice;
    use parking_lot::Mutex as PLMutex;
    use tensor::CompositeTensor;

    fn f32_tensor(device: &CpuDevice, values: &[f32]) -> Tensor {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let buf = device.alloc_with(bytes);
        let t = Tensor::new(digit_layout::types::F32, vec![values.len()], buf);
        t.set_activation_offloading(true);
        t
    }

    fn read_f32(t: &Tensor) -> Vec<f32> {
        let buf = t.buffer().expect("tensor storage unexpectedly empty");
        let any = buf.as_any();
        let cpu = any
            .downcast_ref::<device_cpu::CpuBuffer>()
            .expect("test tensors always back onto device-cpu");
        cpu.snapshot()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    struct StubComposite {
        underlying: Vec<Tensor>,
        transpose_invalid: Option<bool>,
        restore_calls: Arc<PLMutex<usize>>,
    }

    impl CompositeTensor for StubComposite {
        fn prepare_for_saving(&mut self) -> Vec<Tensor> {
            std::mem::take(&mut self.underlying)
        }

        fn restore_from_saved(&mut self, tensors: Vec<Tensor>) {
            *self.restore_calls.lock() += 1;
            self.underlying = tensors;
        }

        fn get_data_tensors(&self) -> Vec<Tensor> {
            self.underlying.clone()
        }

        fn clear(&mut self) {
            self.underlying.clear();
        }

        fn transpose_invalid(&self) -> Option<bool> {
            self.transpose_invalid
        }

        fn set_transpose_invalid(&mut self, value: bool) {
            self.transpose_invalid = Some(value);
        }
    }

    fn unwrap_plain(captured: Captured) -> Tensor {
        match captured {
            Captured::Plain(t) => t,
            _ => panic!("expected a plain tensor"),
        }
    }

    fn unwrap_composite(captured: Captured) -> CompositeHandle {
        match captured {
            Captured::Composite(c) => c,
            _ => panic!("expected a composite tensor"),
        }
    }

    // S1 — single-layer plain tensor round-trips exactly.
    #[test]
    fn s1_single_layer_plain_roundtrip() {
        let device = CpuDevice::new(0);
        let mut handler = AsyncDoubleBufferHandler::new(device.clone(), 1, 1, false);

        let original = (0..32).map(|i| i as f32).collect::<Vec<_>>();
        let t = f32_tensor(&device, &original);
        let tag = handler.push(Captured::Plain(t));

        handler.on_group_commit_forward().unwrap();
        handler.on_group_commit_backward().unwrap();

        let restored = unwrap_plain(handler.pop(tag));
        assert_eq!(read_f32(&restored), original);
        assert!(handler.is_drained());
    }

    // S2 — three-layer double-buffered session (first two offloaded, the
    // third left resident), popped in reverse order.
    #[test]
    fn s2_two_layer_double_buffered_roundtrip() {
        let device = CpuDevice::new(0);
        let mut handler = AsyncDoubleBufferHandler::new(device.clone(), 2, 3, true);

        let v1 = vec![1.0f32, 2.0, 3.0];
        let v2 = vec![4.0f32, 5.0, 6.0];
        let v3 = vec![7.0f32, 8.0, 9.0];
        let t1 = f32_tensor(&device, &v1);
        let t2 = f32_tensor(&device, &v2);
        let t3 = f32_tensor(&device, &v3);

        let tag1 = handler.push(Captured::Plain(t1));
        handler.on_group_commit_forward().unwrap();
        let tag2 = handler.push(Captured::Plain(t2));
        handler.on_group_commit_forward().unwrap();
        let tag3 = handler.push(Captured::Plain(t3));
        handler.on_group_commit_forward().unwrap();

        handler.on_group_commit_backward().unwrap();
        handler.on_group_commit_backward().unwrap();
        handler.on_group_commit_backward().unwrap();

        let r3 = unwrap_plain(handler.pop(tag3));
        let r2 = unwrap_plain(handler.pop(tag2));
        let r1 = unwrap_plain(handler.pop(tag1));
        assert_eq!(read_f32(&r3), v3);
        assert_eq!(read_f32(&r2), v2);
        assert_eq!(read_f32(&r1), v1);
        assert!(handler.is_drained());
    }

    // S3 — unmarked tensor is stored but never evicted, popped by identity.
    #[test]
    fn s3_unmarked_tensor_passthrough() {
        let device = CpuDevice::new(0);
        let mut handler = AsyncDoubleBufferHandler::new(device.clone(), 1, 1, false);

        let buf = device.alloc_with(vec![1, 2, 3, 4]);
        let t = Tensor::new(digit_layout::types::U8, vec![4], buf);
        assert!(!t.activation_offloading());

        let tag = handler.push(Captured::Plain(t.clone()));
        assert!(handler.buf_refs.is_empty());

        handler.on_group_commit_forward().unwrap();
        handler.on_group_commit_backward().unwrap();

        let popped = unwrap_plain(handler.pop(tag));
        assert!(popped.shares_storage_with(&t));
    }

    // S4 — composite with two underlying buffers round-trips, transpose
    // flag preserved.
    #[test]
    fn s4_composite_roundtrip_preserves_transpose_flag() {
        let device = CpuDevice::new(0);
        let mut handler = AsyncDoubleBufferHandler::new(device.clone(), 1, 1, false);

        let a = f32_tensor(&device, &[1.0, 2.0, 3.0, 4.0]);
        let scale = f32_tensor(&device, &[0.5]);
        let composite: CompositeHandle = Arc::new(PLMutex::new(StubComposite {
            underlying: vec![a, scale],
            transpose_invalid: Some(true),
            restore_calls: Arc::new(PLMutex::new(0)),
        }));

        let tag = handler.push(Captured::Composite(composite.clone()));
        handler.on_group_commit_forward().unwrap();
        handler.on_group_commit_backward().unwrap();

        let restored = unwrap_composite(handler.pop(tag));
        assert!(Arc::ptr_eq(&restored, &composite));
        let data = restored.lock().get_data_tensors();
        assert_eq!(read_f32(&data[0]), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(read_f32(&data[1]), vec![0.5]);
        assert_eq!(restored.lock().transpose_invalid(), Some(true));
    }

    // S5 — aliased composite dedup: one restore, both pops return the
    // same object.
    #[test]
    fn s5_aliased_composite_dedup() {
        let device = CpuDevice::new(0);
        let mut handler = AsyncDoubleBufferHandler::new(device.clone(), 2, 2, false);

        let restore_calls = Arc::new(PLMutex::new(0));
        let composite: CompositeHandle = Arc::new(PLMutex::new(StubComposite {
            underlying: vec![f32_tensor(&device, &[9.0])],
            transpose_invalid: None,
            restore_calls: restore_calls.clone(),
        }));

        let tag0 = handler.push(Captured::Composite(composite.clone()));
        handler.on_group_commit_forward().unwrap();
        let tag1 = handler.push(Captured::Composite(composite.clone()));
        handler.on_group_commit_forward().unwrap();

        handler.on_group_commit_backward().unwrap();
        handler.on_group_commit_backward().unwrap();

        let popped1 = unwrap_composite(handler.pop(tag1));
        let popped0 = unwrap_composite(handler.pop(tag0));
        assert!(Arc::ptr_eq(&popped0, &popped1));
        assert_eq!(*restore_calls.lock(), 1);
    }

    // S6 — stray tensor passes through with a sentinel group id.
    #[test]
    fn s6_stray_tensor_passthrough() {
        let device = CpuDevice::new(0);
        let mut handler = AsyncDoubleBufferHandler::new(device, 1, 1, false);

        let stray = StrayTensor { label: Some("fake".into()) };
        let tag = handler.push(Captured::Stray(stray));
        assert!(tag.group.is_stray());

        match handler.pop(tag) {
            Captured::Stray(s) => assert_eq!(s.label.as_deref(), Some("fake")),
            _ => panic!("expected a stray tensor"),
        }
        assert!(handler.is_drained());
    }

    #[test]
    fn window_plan_load_balances_remainder() {
        // L=10, G=3 -> sizes 4,3,3 -> windows end at 3, 6, 9.
        let plan = build_window_plan(3, 10);
        assert_eq!(plan, vec![GroupId(3), GroupId(6), GroupId(9)]);
    }

    #[test]
    fn group_counters_reach_bounds_across_a_session() {
        let device = CpuDevice::new(0);
        let mut handler = AsyncDoubleBufferHandler::new(device.clone(), 2, 4, true);
        let mut tags = Vec::new();
        for _ in 0..4 {
            let t = f32_tensor(&device, &[1.0, 2.0]);
            tags.push(handler.push(Captured::Plain(t)));
            handler.on_group_commit_forward().unwrap();
        }
        assert_eq!(handler.current_group.0, 4);
        assert_eq!(handler.offloaded_group_count, 2);

        for _ in 0..4 {
            handler.on_group_commit_backward().unwrap();
        }
        assert_eq!(handler.current_group.0, 0);
        assert_eq!(handler.offloaded_group_count, 0);

        for tag in tags.into_iter().rev() {
            handler.pop(tag);
        }
        assert!(handler.is_drained());
    }
}
