//! Basic prompts vs the same questions with temporal context

use anyhow::Result;
use fanout_core::WorkResult;
use gpu_bridge::{build_assignment, EngineConfig, SamplingParams};

use super::{answer, banner, print_failures, BenchContext, QWEN_7B};
use crate::prompts::{question_of, TemporalContext};

pub async fn run(ctx: &BenchContext) -> Result<()> {
    let engine = EngineConfig {
        max_model_len: 4096,
        gpu_memory_utilization: 0.85,
        ..EngineConfig::new(QWEN_7B)
    };
    let sampling = SamplingParams::default().with_max_tokens(300);

    let basic = TemporalContext::basic();
    let enhanced = ctx.temporal().enhanced();
    let split = basic.len();

    // One engine answers both sets; basic prompts come first.
    let prompts = basic.into_iter().chain(enhanced).collect();
    let assignment = build_assignment(0, prompts, &engine, &sampling)?;
    let results = ctx.harness().run(vec![assignment], &ctx.bench.backend).await?;

    let (basic, enhanced): (Vec<&WorkResult>, Vec<&WorkResult>) =
        results.iter().partition(|r| r.item_index < split);

    banner("TEMPORAL REASONING COMPARISON");

    println!("\nBASIC PROMPTS (no temporal context):");
    for result in &basic {
        println!("\nQ: {}", result.prompt);
        println!("A: {}", answer(result));
    }

    println!("\nENHANCED PROMPTS (date and academic-year context):");
    for result in &enhanced {
        println!("\nQ: {}", question_of(&result.prompt));
        println!("A: {}", answer(result));
    }

    banner("SUMMARY");
    println!("Basic prompts lack temporal context and leave 'last year' ambiguous");
    println!("Enhanced prompts state today's date and which academic year 'last year' means");
    print_failures(&results);

    Ok(())
}
