//! Single tuned engine with warmup and a throughput report

use anyhow::Result;
use fanout_core::BenchReport;
use gpu_bridge::inference::WARMUP_KEY;
use gpu_bridge::{build_assignment, EngineConfig, SamplingParams};

use super::{answer, banner, BenchContext, QWEN_7B};
use crate::prompts::question_of;

const WARMUP_PROMPT: &str = "Warmup prompt";

fn engine() -> EngineConfig {
    EngineConfig {
        max_model_len: 8192,
        gpu_memory_utilization: 0.9,
        swap_space_gb: Some(4),
        block_size: Some(16),
        enable_prefix_caching: true,
        enable_chunked_prefill: true,
        max_num_batched_tokens: Some(8192),
        max_num_seqs: Some(256),
        disable_log_stats: true,
        ..EngineConfig::new(QWEN_7B)
    }
}

pub async fn run(ctx: &BenchContext) -> Result<()> {
    let sampling = SamplingParams {
        spaces_between_special_tokens: false,
        ..SamplingParams::default()
    };
    let assignment = build_assignment(0, ctx.temporal().optimized(), &engine(), &sampling)?
        .with_metadata(WARMUP_KEY, WARMUP_PROMPT)?;

    println!("Loading {QWEN_7B} with optimized settings...");
    let results = ctx.harness().run(vec![assignment], &ctx.bench.backend).await?;

    banner("PERFORMANCE TEST RESULTS");
    for result in &results {
        println!("\nQ{}: {}", result.item_index + 1, question_of(&result.prompt));
        println!("A: {}", answer(result));
    }

    banner("TIMING");
    print!("{}", BenchReport::from_results(&results));

    Ok(())
}
