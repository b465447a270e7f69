//! Bench drivers, one per subcommand

pub mod comparison;
pub mod multi_gpu;
pub mod optimized;
pub mod smoke;
pub mod tensor_parallel;

use fanout_core::{ResultSet, WorkResult};
use gpu_bridge::{Harness, HarnessConfig, WorkerCommand};

use crate::config::BenchConfig;
use crate::prompts::TemporalContext;

pub const QWEN_7B: &str = "Qwen/Qwen2.5-7B-Instruct";
pub const QWEN_72B: &str = "Qwen/Qwen2.5-72B-Instruct";
pub const PHI_35_MINI: &str = "microsoft/Phi-3.5-mini-instruct";

const RULE_WIDTH: usize = 80;

/// Everything a driver needs to dispatch work.
pub struct BenchContext {
    pub bench: BenchConfig,
    worker: WorkerCommand,
    harness: HarnessConfig,
}

impl BenchContext {
    pub const fn new(bench: BenchConfig, worker: WorkerCommand, harness: HarnessConfig) -> Self {
        Self {
            bench,
            worker,
            harness,
        }
    }

    pub const fn temporal(&self) -> TemporalContext {
        TemporalContext::new(self.bench.reference_date)
    }

    pub fn harness(&self) -> Harness {
        self.harness_with(self.harness.clone())
    }

    pub fn harness_with(&self, config: HarnessConfig) -> Harness {
        Harness::new(self.worker.clone(), config)
    }

    pub const fn harness_config(&self) -> &HarnessConfig {
        &self.harness
    }
}

pub(crate) fn banner(title: &str) {
    let rule = "=".repeat(RULE_WIDTH);
    println!("\n{rule}\n{title}\n{rule}");
}

pub(crate) fn answer(result: &WorkResult) -> String {
    match (result.output(), result.error()) {
        (Some(text), _) => text.to_string(),
        (None, Some(err)) => format!("Error: {err}"),
        (None, None) => String::new(),
    }
}

pub(crate) fn print_prompt_and_response(result: &WorkResult) {
    println!("\nPrompt: {}", result.prompt);
    println!("Response: {}", answer(result));
}

pub(crate) fn print_failures(results: &ResultSet) {
    let failed = results.failures().count();
    if failed > 0 {
        println!("\n{failed} of {} items failed", results.len());
    }
}
