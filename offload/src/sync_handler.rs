//! Synchronous handler: the baseline offload handler, evicting eagerly
//! on push and restoring eagerly on pop. Copies run on the same stream
//! as compute, so they block — useful as a correctness reference and as
//! the model the asynchronous handler generalizes with its own streams
//! and event discipline. The async handler does not extend this type;
//! it reimplements the same push/pop shape against richer bookkeeping.

use crate::error::Result;
use crate::primitive::{self, HostBackup};
use crate::OffloadHandler;
use common::{GroupId, Tag};
use device::Device;
use std::collections::BTreeMap;
use std::sync::Arc;
use tensor::{Captured, CompositeHandle, StrayTensor, Tensor};

enum Slot {
    Stray(StrayTensor),
    Device(Tensor),
    Host(HostBackup),
    Composite(CompositeHandle),
}

/// `slots` is a `BTreeMap` rather than a `HashMap`: iteration order only
/// matters for debugging/logging here (unlike the async handler's
/// window bookkeeping), but keeping every map in the crate ordered the
/// same way avoids a silent behavioral difference between the two
/// handlers.
pub struct SynchronousHandler {
    device: Arc<dyn Device>,
    num_offload_groups: i64,
    current_group: GroupId,
    intra_group_seq: u64,
    stray_seq: u64,
    slots: BTreeMap<Tag, Slot>,
}

impl SynchronousHandler {
    pub fn new(device: Arc<dyn Device>, num_offload_groups: i64) -> Self {
        Self {
            device,
            num_offload_groups,
            current_group: GroupId(0),
            intra_group_seq: 0,
            stray_seq: 0,
            slots: BTreeMap::new(),
        }
    }

    fn in_window(&self) -> bool {
        self.current_group.0 < self.num_offload_groups
    }
}

impl OffloadHandler for SynchronousHandler {
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
                if self.in_window() && t.activation_offloading() {
                    let stream = self.device.current_stream();
                    let backup = primitive::offload(&t, stream.as_ref(), self.device.as_ref());
                    self.slots.insert(tag, Slot::Host(backup));
                } else {
                    self.slots.insert(tag, Slot::Device(t));
                }
                tag
            }
            Captured::Composite(c) => {
                let tag = Tag::new(self.current_group, self.intra_group_seq);
                self.intra_group_seq += 1;
                self.slots.insert(tag, Slot::Composite(c));
                tag
            }
        }
    }

    fn pop(&mut self, tag: Tag) -> Captured {
        match self
            .slots
            .remove(&tag)
            .unwrap_or_else(|| panic!("offload tag {tag} popped twice or never pushed"))
        {
            Slot::Stray(s) => Captured::Stray(s),
            Slot::Device(t) => Captured::Plain(t),
            Slot::Host(backup) => {
                let stream = self.device.current_stream();
                let t = primitive::reload(backup, stream.as_ref(), self.device.as_ref(), None, None)
                    .expect("reload destination always matches the backup it was allocated from");
                Captured::Plain(t)
            }
            Slot::Composite(c) => Captured::Composite(c),
        }
    }

    fn on_group_commit_forward(&mut self) -> Result<()> {
        self.current_group = GroupId(self.current_group.0 + 1);
        self.intra_group_seq = 0;
        Ok(())
    }

    fn on_group_commit_backward(&mut self) -> Result<()> {
        self.current_group = GroupId(self.current_group.0 - 1);
        assert!(self.current_group.0 >= 0, "group counter underflow");
        Ok(())
    }

    fn is_drained(&self) -> bool {
        self.slots.is_empty() && self.current_group.0 == 0
    }

    fn outstanding_count(&self) -> usize {
        self.slots.len()
    }
}
