//! Public context factory. Wires a configured handler together with its
//! group-commit barrier into a scoped context usable by a caller
//! driving its own forward/backward loop.

use crate::commit::{commit_backward, commit_forward};
use crate::error::{OffloadError, Result};
use crate::handler::AsyncDoubleBufferHandler;
use crate::hook::ScopedSaveRestoreHook;
use crate::OffloadHandler;
use device::Device;
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;

/// The `(enabled, num_layers, model_layers, offload_activations,
/// offload_weights, double_buffering)` configuration tuple, gathered
/// into one struct so [`get_cpu_offload_context`] takes a single
/// argument rather than six positional bools/ints.
#[derive(Clone, Copy, Debug)]
pub struct OffloadConfig {
    pub enabled: bool,
    /// Number of groups to offload (`G`).
    pub num_layers: i64,
    /// Total model groups (`L`); must be `>= num_layers`.
    pub model_layers: i64,
    pub offload_activations: bool,
    /// Deprecated: true alone yields a no-op context; true alongside
    /// `offload_activations` is accepted but ignored.
    pub offload_weights: bool,
    pub double_buffering: bool,
}

/// A no-op synchronizer and a real one behind one call shape, so callers
/// don't need to branch on whether offloading ended up enabled.
pub enum Synchronizer {
    Identity,
    Commit(Arc<Mutex<dyn OffloadHandler>>),
}

impl Synchronizer {
    pub fn forward<T>(&self, t: T) -> Result<T> {
        match self {
            Synchronizer::Identity => Ok(t),
            Synchronizer::Commit(handler) => commit_forward(t, handler),
        }
    }

    pub fn backward<T>(&self, t: T) -> Result<T> {
        match self {
            Synchronizer::Identity => Ok(t),
            Synchronizer::Commit(handler) => commit_backward(t, handler),
        }
    }
}

/// Either a real scoped hook backed by a running handler, or a no-op
/// stand-in for `enabled=false` / weights-only configurations. Kept as
/// one type (rather than an `Option<ScopedSaveRestoreHook>` the caller
/// has to branch on) so dropping out of scope always behaves the same
/// way regardless of which path the factory took.
pub enum OffloadContext {
    Active(ScopedSaveRestoreHook),
    Noop,
}

impl OffloadContext {
    pub fn on_save(&self, captured: tensor::Captured) -> Option<common::Tag> {
        match self {
            OffloadContext::Active(hook) => Some(hook.on_save(captured)),
            OffloadContext::Noop => None,
        }
    }

    pub fn on_get(&self, tag: Option<common::Tag>, fallback: tensor::Captured) -> tensor::Captured {
        match (self, tag) {
            (OffloadContext::Active(hook), Some(tag)) => hook.on_get(tag),
            _ => fallback,
        }
    }

    pub fn check_drained(&self) -> Result<()> {
        match self {
            OffloadContext::Active(hook) => hook.check_drained(),
            OffloadContext::Noop => Ok(()),
        }
    }
}

/// Build a CPU offload context from [`OffloadConfig`].
///
/// Returns a no-op context and identity synchronizer when `enabled` is
/// false, and also (with a deprecation warning) when `offload_weights`
/// is requested without `offload_activations` — weight offloading was
/// never implemented by this engine, only activation offloading.
pub fn get_cpu_offload_context(
    config: OffloadConfig,
    device: Arc<dyn Device>,
) -> Result<(OffloadContext, Synchronizer)> {
    if !config.offload_activations && !config.offload_weights {
        return Err(OffloadError::Config(
            "at least one of offload_activations or offload_weights must be set".into(),
        ));
    }

    if !config.enabled {
        return Ok((OffloadContext::Noop, Synchronizer::Identity));
    }

    if config.offload_weights && !config.offload_activations {
        warn!("offload_weights is deprecated and has no effect; returning a no-op context");
        return Ok((OffloadContext::Noop, Synchronizer::Identity));
    }

    if config.num_layers < 1 || config.model_layers < config.num_layers {
        return Err(OffloadError::Config(format!(
            "num_layers ({}) must be >= 1 and <= model_layers ({})",
            config.num_layers, config.model_layers
        )));
    }

    let handler = AsyncDoubleBufferHandler::new(
        device,
        config.num_layers,
        config.model_layers,
        config.double_buffering,
    );
    let handler: Arc<Mutex<dyn OffloadHandler>> = Arc::new(Mutex::new(handler));
    let hook = ScopedSaveRestoreHook::new(handler.clone());
    Ok((
        OffloadContext::Active(hook),
        Synchronizer::Commit(handler),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_cpu::CpuDevice;

    fn base_config() -> OffloadConfig {
        OffloadConfig {
            enabled: true,
            num_layers: 2,
            model_layers: 4,
            offload_activations: true,
            offload_weights: false,
            double_buffering: true,
        }
    }

    // S8 — disabled path is identity: no-op context never tags anything.
    #[test]
    fn disabled_config_yields_noop_context() {
        let device = CpuDevice::new(0);
        let config = OffloadConfig {
            enabled: false,
            ..base_config()
        };
        let (ctx, sync) = get_cpu_offload_context(config, device).unwrap();
        assert!(matches!(ctx, OffloadContext::Noop));
        assert!(matches!(sync, Synchronizer::Identity));
        assert_eq!(sync.forward(7).unwrap(), 7);
        ctx.check_drained().unwrap();
    }

    #[test]
    fn weights_only_is_deprecated_noop() {
        let device = CpuDevice::new(0);
        let config = OffloadConfig {
            offload_activations: false,
            offload_weights: true,
            ..base_config()
        };
        let (ctx, _sync) = get_cpu_offload_context(config, device).unwrap();
        assert!(matches!(ctx, OffloadContext::Noop));
    }

    #[test]
    fn neither_activations_nor_weights_is_a_config_error() {
        let device = CpuDevice::new(0);
        let config = OffloadConfig {
            offload_activations: false,
            offload_weights: false,
            ..base_config()
        };
        let err = get_cpu_offload_context(config, device).unwrap_err();
        assert!(matches!(err, OffloadError::Config(_)));
    }

    #[test]
    fn num_layers_exceeding_model_layers_is_a_config_error() {
        let device = CpuDevice::new(0);
        let config = OffloadConfig {
            num_layers: 5,
            model_layers: 4,
            ..base_config()
        };
        let err = get_cpu_offload_context(config, device).unwrap_err();
        assert!(matches!(err, OffloadError::Config(_)));
    }

    #[test]
    fn active_context_round_trips_a_tensor() {
        let device = CpuDevice::new(0);
        let (ctx, sync) = get_cpu_offload_context(base_config(), device.clone()).unwrap();

        let buf = device.alloc_with(vec![42u8; 8]);
        let t = tensor::Tensor::new(digit_layout::types::U8, vec![8], buf);
        t.set_activation_offloading(true);

        let tag = ctx.on_save(tensor::Captured::Plain(t.clone()));
        for _ in 0..4 {
            sync.forward(()).unwrap();
        }
        for _ in 0..4 {
            sync.backward(()).unwrap();
        }
        let restored = ctx.on_get(tag, tensor::Captured::Plain(t));
        match restored {
            tensor::Captured::Plain(t) => assert_eq!(t.byte_len(), 8),
            _ => panic!("expected a plain tensor back"),
        }
        ctx.check_drained().unwrap();
    }
}
