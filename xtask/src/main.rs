//! Demo harness for the CPU offload engine: simulates a forward/backward
//! pass over a stack of layers, marking one tensor per layer as an
//! offload candidate, and reports whether every tensor round-tripped
//! byte-for-byte.

use clap::Parser;
use colored::Colorize;
use common::DeviceId;
use device::Device;
use digit_layout::types::F32;
use offload::{get_cpu_offload_context, mark_activation_offload, Captured, OffloadConfig};
use std::sync::Arc;
use tensor::Tensor;

#[derive(Parser)]
#[clap(name = "xtask", about = "cpu offload engine demo")]
struct Args {
    /// Total number of simulated forward layers (L).
    #[clap(long, default_value_t = 8)]
    model_layers: i64,

    /// Number of leading layers whose activations are offloaded (G).
    #[clap(long, default_value_t = 3)]
    offload_layers: i64,

    /// Elements per simulated activation tensor.
    #[clap(long, default_value_t = 1024)]
    tensor_len: usize,

    /// Disable the reload double buffer.
    #[clap(long)]
    no_double_buffering: bool,

    /// Run against the CUDA backend instead of the in-process CPU one
    /// (requires building with `--features cuda` and a visible device).
    #[clap(long)]
    cuda: bool,
}

fn device_for(args: &Args) -> Arc<dyn Device> {
    if args.cuda {
        #[cfg(feature = "cuda")]
        {
            return device_cuda::NvDevice::new(0).expect("failed to initialize CUDA device 0");
        }
        #[cfg(not(feature = "cuda"))]
        {
            panic!("--cuda requires building xtask with --features cuda");
        }
    }
    device_cpu::CpuDevice::new(0)
}

fn make_tensor(device: &dyn Device, len: usize) -> Tensor {
    // A real integration fills this from whatever kernel produced the
    // activation; this demo only exercises the offload/reload wiring, so
    // a zero-initialized buffer of the right size stands in for it.
    let buf = device.alloc(len * std::mem::size_of::<f32>());
    Tensor::new(F32, vec![len], buf)
}

fn main() {
    simple_logger::init_with_level(log::Level::Info).expect("failed to initialize logger");
    let args = Args::parse();

    println!("{}", "cpu offload engine demo".bold());
    println!(
        "model_layers={} offload_layers={} tensor_len={} double_buffering={}",
        args.model_layers,
        args.offload_layers,
        args.tensor_len,
        !args.no_double_buffering
    );

    let device = device_for(&args);
    let DeviceId(id) = device.id();
    println!("running on device {id}");

    let config = OffloadConfig {
        enabled: true,
        num_layers: args.offload_layers,
        model_layers: args.model_layers,
        offload_activations: true,
        offload_weights: false,
        double_buffering: !args.no_double_buffering,
    };
    let (ctx, sync) =
        get_cpu_offload_context(config, device.clone()).expect("bad offload configuration");

    let mut tags = Vec::with_capacity(args.model_layers as usize);
    let mut originals = Vec::with_capacity(args.model_layers as usize);
    for layer in 0..args.model_layers {
        let mut captured = vec![Captured::Plain(make_tensor(device.as_ref(), args.tensor_len))];
        mark_activation_offload(&mut captured, false).expect("marking failed");
        let t = match captured.pop().unwrap() {
            Captured::Plain(t) => t,
            _ => unreachable!(),
        };
        originals.push(t.clone());
        let tag = ctx.on_save(Captured::Plain(t));
        tags.push(tag);
        sync.forward(()).expect("group commit forward failed");
        println!("forward layer {layer} {}", "captured".green());
    }

    for layer in (0..args.model_layers).rev() {
        sync.backward(()).expect("group commit backward failed");
        let tag = tags[layer as usize];
        let fallback = Captured::Plain(originals[layer as usize].clone());
        let restored = match ctx.on_get(tag, fallback) {
            Captured::Plain(t) => t,
            _ => unreachable!(),
        };
        let ok = restored.byte_len() == originals[layer as usize].byte_len();
        println!(
            "backward layer {layer} {}",
            if ok { "restored".green() } else { "MISMATCH".red() }
        );
    }

    match ctx.check_drained() {
        Ok(()) => println!("{}", "session drained cleanly".bold().green()),
        Err(e) => println!("{}: {e}", "LEAK".bold().red()),
    }
}
