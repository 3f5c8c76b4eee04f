//! Group commit barrier.
//!
//! `commit_forward`/`commit_backward` are identity operations: they
//! return their argument unchanged and exist purely as a synchronization
//! hinge at layer boundaries. Kept as free functions over `&mut dyn
//! OffloadHandler` rather than methods on a concrete handler so neither
//! this module nor its callers need to know which handler backs a given
//! session.

use crate::error::Result;
use crate::OffloadHandler;
use parking_lot::Mutex;
use std::sync::Arc;

pub fn commit_forward<T>(t: T, handler: &Arc<Mutex<dyn OffloadHandler>>) -> Result<T> {
    handler.lock().on_group_commit_forward()?;
    Ok(t)
}

pub fn commit_backward<T>(t: T, handler: &Arc<Mutex<dyn OffloadHandler>>) -> Result<T> {
    handler.lock().on_group_commit_backward()?;
    Ok(t)
}
