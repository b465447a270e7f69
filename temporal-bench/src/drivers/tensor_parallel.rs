//! Large model split across every GPU, with a single-GPU fallback

use anyhow::Result;
use fanout_core::ResultSet;
use gpu_bridge::{build_assignment, EngineConfig, SamplingParams};
use tracing::warn;

use super::{banner, print_prompt_and_response, BenchContext, QWEN_72B, QWEN_7B};

/// Engine for `model` sharded over `tp` devices.
fn sharded_engine(model: &str, tp: u32) -> EngineConfig {
    EngineConfig {
        tensor_parallel_size: tp,
        gpu_memory_utilization: 0.8,
        enforce_eager: true,
        disable_custom_all_reduce: true,
        ..EngineConfig::new(model)
    }
}

pub async fn run(ctx: &BenchContext) -> Result<()> {
    let tp = ctx.bench.num_gpus;
    let temporal = ctx.temporal();
    let sampling = SamplingParams::default();

    println!("Loading {QWEN_72B} with tensor_parallel_size={tp}...");
    let assignment = build_assignment(
        0,
        temporal.tensor_parallel(),
        &sharded_engine(QWEN_72B, tp),
        &sampling,
    )?;
    let config = ctx
        .harness_config()
        .clone()
        .with_device_groups(vec![(0..tp).collect()]);
    let results = ctx
        .harness_with(config)
        .run(vec![assignment], &ctx.bench.backend)
        .await?;

    if !results.all_failed() {
        report(&format!("{QWEN_72B} across {tp} GPUs"), &results);
        return Ok(());
    }

    if let Some(err) = results.iter().find_map(|r| r.error()) {
        warn!(error = %err, model = QWEN_72B, "Sharded engine failed, falling back");
        println!("Error: {err}");
    }
    println!("\nFalling back to {QWEN_7B} on a single GPU...");

    let fallback = EngineConfig {
        gpu_memory_utilization: 0.8,
        ..EngineConfig::new(QWEN_7B)
    };
    let assignment = build_assignment(0, temporal.fallback(), &fallback, &sampling)?;
    let results = ctx.harness().run(vec![assignment], &ctx.bench.backend).await?;
    report(&format!("{QWEN_7B} on one GPU"), &results);

    if results.all_failed() {
        println!("\nBoth engines failed");
    }

    Ok(())
}

fn report(label: &str, results: &ResultSet) {
    banner(&format!("Testing temporal reasoning with {label}"));
    for result in results {
        print_prompt_and_response(result);
    }
}
