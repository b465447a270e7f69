//! One engine per GPU, each answering its own prompts in parallel

use anyhow::Result;
use gpu_bridge::{build_assignment, EngineConfig, SamplingParams};
use tracing::info;

use super::{banner, print_failures, print_prompt_and_response, BenchContext, QWEN_7B};

pub async fn run(ctx: &BenchContext) -> Result<()> {
    let engine = EngineConfig {
        max_model_len: 4096,
        gpu_memory_utilization: 0.85,
        ..EngineConfig::new(QWEN_7B)
    };
    let sampling = SamplingParams::default();

    let groups = ctx.temporal().multi_gpu_groups();
    let assignments = (0..ctx.bench.num_gpus)
        .zip(groups.iter().cycle())
        .map(|(gpu, prompts)| build_assignment(gpu, prompts.clone(), &engine, &sampling))
        .collect::<Result<Vec<_>, _>>()?;

    info!(gpus = ctx.bench.num_gpus, model = QWEN_7B, "Starting multi-GPU run");
    println!(
        "Starting multi-GPU test with {} parallel engines...",
        ctx.bench.num_gpus
    );

    let results = ctx.harness().run(assignments, &ctx.bench.backend).await?;

    banner("MULTI-GPU TEMPORAL REASONING RESULTS");
    for gpu in 0..ctx.bench.num_gpus {
        println!("\nGPU {gpu}:");
        for result in results.for_resource(gpu) {
            print_prompt_and_response(result);
        }
    }
    print_failures(&results);

    Ok(())
}
