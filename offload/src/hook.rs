//! Scoped save/restore hook.
//!
//! On entry sets the process-wide `offload_enabled` flag; on exit (any
//! path, including an early return or panic unwind) clears it. Cleanup
//! lives in `Drop` rather than threaded through every return path, so a
//! caller can't forget to release the flag.

use crate::error::{OffloadError, Result};
use crate::OffloadHandler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tensor::Captured;

static OFFLOAD_ENABLED: AtomicBool = AtomicBool::new(false);

/// The single global observable the engine exposes.
pub fn is_offload_enabled() -> bool {
    OFFLOAD_ENABLED.load(Ordering::Acquire)
}

/// Annotates `tensors` as offload candidates. `debug_mode` stands in for
/// whatever debug/inspection-mode
/// flag the integrating host framework exposes — this crate has no such
/// framework of its own, so the check is surfaced as a parameter rather
/// than read from global state.
pub fn mark_activation_offload(tensors: &mut [Captured], debug_mode: bool) -> Result<()> {
    if debug_mode {
        return Err(OffloadError::UnsupportedMode);
    }
    for captured in tensors.iter_mut() {
        match captured {
            Captured::Stray(_) => {}
            Captured::Plain(t) => {
                t.set_activation_offloading(true);
            }
            Captured::Composite(c) => {
                for u in c.lock().get_data_tensors() {
                    u.set_activation_offloading(true);
                    u.set_needs_force_clear(true);
                }
            }
        }
    }
    Ok(())
}

/// RAII guard over a scoped registration of the save-for-backward
/// interception. Holds no state of its own beyond the handler and the
/// global flag it toggles; `on_save`/`on_get` are the callback pair a
/// host framework would register for its save-for-backward hooks —
/// here exposed as methods for an integrating caller to wire up
/// directly.
pub struct ScopedSaveRestoreHook {
    handler: Arc<Mutex<dyn OffloadHandler>>,
}

impl ScopedSaveRestoreHook {
    pub fn new(handler: Arc<Mutex<dyn OffloadHandler>>) -> Self {
        OFFLOAD_ENABLED.store(true, Ordering::Release);
        Self { handler }
    }

    /// `on_save(t) -> tag`.
    pub fn on_save(&self, captured: Captured) -> common::Tag {
        self.handler.lock().push(captured)
    }

    /// `on_get(tag) -> t`.
    pub fn on_get(&self, tag: common::Tag) -> Captured {
        self.handler.lock().pop(tag)
    }

    /// Verify the handler drained cleanly, surfacing a [`OffloadError::Leak`]
    /// instead of silently leaving state behind.
    pub fn check_drained(&self) -> Result<()> {
        let handler = self.handler.lock();
        if handler.is_drained() {
            Ok(())
        } else {
            Err(OffloadError::Leak(handler.outstanding_count()))
        }
    }
}

impl Drop for ScopedSaveRestoreHook {
    fn drop(&mut self) {
        OFFLOAD_ENABLED.store(false, Ordering::Release);
        // Already unwinding: a second panic here would abort the process
        // instead of reporting the original one, so only enforce the
        // drained invariant on the ordinary exit path.
        if std::thread::panicking() {
            return;
        }
        let handler = self.handler.lock();
        if !handler.is_drained() {
            let outstanding = handler.outstanding_count();
            drop(handler);
            panic!("cpu offload context leaked {outstanding} entries at scope exit");
        }
    }
}
