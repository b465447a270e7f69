//! Small model smoke test

use anyhow::Result;
use gpu_bridge::{build_assignment, EngineConfig, SamplingParams};

use super::{banner, print_failures, print_prompt_and_response, BenchContext, PHI_35_MINI};

pub async fn run(ctx: &BenchContext) -> Result<()> {
    let engine = EngineConfig {
        gpu_memory_utilization: 0.8,
        ..EngineConfig::new(PHI_35_MINI)
    };
    let assignment = build_assignment(
        0,
        ctx.temporal().smoke(),
        &engine,
        &SamplingParams::default(),
    )?;

    println!("Loading {PHI_35_MINI}...");
    let results = ctx.harness().run(vec![assignment], &ctx.bench.backend).await?;

    banner("Testing temporal reasoning");
    for result in &results {
        print_prompt_and_response(result);
    }
    print_failures(&results);

    Ok(())
}
