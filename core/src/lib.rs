//! Fan-out Core Library
//!
//! Provides the types shared by the harness, its workers and the bench drivers:
//! - Work assignments, results and the ordered result set
//! - Error taxonomy for per-worker and harness-level failures
//! - Timing report for benchmark runs
//! - Tracing initialisation

pub mod error;
pub mod report;
pub mod types;

// Re-export commonly used items
pub use error::{HarnessError, InferenceError, WorkError, WorkErrorKind};
pub use report::BenchReport;
pub use types::{
    BatchTiming, Metadata, Outcome, ResourceScope, ResultBatch, ResultSet, WorkAssignment,
    WorkResult,
};

/// Initialize tracing with standard configuration.
///
/// Output goes to stderr: worker processes use stdout as their result channel.
pub fn init_tracing(service_name: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(service_name)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Initialize tracing with JSON output (for log collection)
pub fn init_tracing_json(service_name: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(service_name)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();
}

fn default_directive(service_name: &str) -> String {
    // Crate targets use underscores even when the package name has dashes.
    let target = service_name.replace('-', "_");
    format!("{target}=info,gpu_bridge=info,fanout_core=info")
}
