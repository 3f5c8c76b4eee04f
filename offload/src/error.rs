//! Error taxonomy for the offload engine. Every variant is fatal at the
//! point it surfaces — nothing here is recovered locally.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OffloadError {
    /// Misconfigured factory arguments. Fatal at construction.
    #[error("cpu offload misconfigured: {0}")]
    Config(String),

    /// `mark_activation_offload` called while the host framework is in a
    /// debug/inspection mode that forbids offloading hooks.
    #[error("cpu offload is not supported in the current debug mode")]
    UnsupportedMode,

    /// Internal bookkeeping invariant violated: duplicate tag, missing
    /// tag at pop, or a group counter going negative.
    #[error("offload tag invariant violated: {0}")]
    Tag(String),

    /// A reload destination buffer's size does not match the host
    /// backup it would be copied into.
    #[error("reload destination size {dest} does not match host backup size {src}")]
    Shape { src: usize, dest: usize },

    /// Non-empty engine state observed at scope exit.
    #[error("cpu offload context leaked {0} entries at scope exit")]
    Leak(usize),
}

pub type Result<T> = std::result::Result<T, OffloadError>;
