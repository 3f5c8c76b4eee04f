//! Tensor-kind probe.
//!
//! A host framework typically classifies a captured value at runtime by
//! testing it against a fake-tensor check and an `isinstance` against
//! the composite-quantized base class. `tensor::Captured` already
//! carries that discrimination as a Rust enum — built by whatever
//! binding layer talks to the host framework's tensor representation —
//! so classifying here is a direct match rather than a runtime test.

pub use tensor::Captured as TensorKind;

/// Re-exposed under the probe's own name so call sites in this crate
/// read as "classify, then match".
#[inline]
pub fn classify(captured: tensor::Captured) -> TensorKind {
    captured
}
