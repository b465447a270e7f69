//! Timing summary for bench runs

use std::fmt;
use std::time::Duration;

use crate::types::ResultSet;

/// Throughput figures derived from a [`ResultSet`].
///
/// Workers run in parallel, so the wall time of a run is the slowest
/// worker's generation time, not the sum.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub queries: usize,
    pub failed: usize,
    pub total: Duration,
    pub warmup: Option<Duration>,
    /// Whitespace-separated words across all outputs
    pub approx_tokens: usize,
}

impl BenchReport {
    pub fn from_results(results: &ResultSet) -> Self {
        let total_ms = results
            .timings()
            .values()
            .map(|t| t.generation_ms)
            .max()
            .unwrap_or(0);
        let warmup_ms = results.timings().values().filter_map(|t| t.warmup_ms).max();

        let approx_tokens = results
            .iter()
            .filter_map(|r| r.output())
            .map(|text| text.split_whitespace().count())
            .sum();

        Self {
            queries: results.successes().count(),
            failed: results.failures().count(),
            total: Duration::from_millis(total_ms),
            warmup: warmup_ms.map(Duration::from_millis),
            approx_tokens,
        }
    }

    pub fn average_per_query(&self) -> Option<Duration> {
        let queries = u32::try_from(self.queries).ok().filter(|q| *q > 0)?;
        Some(self.total / queries)
    }

    pub fn queries_per_second(&self) -> Option<f64> {
        let secs = self.total.as_secs_f64();
        (secs > 0.0).then(|| self.queries as f64 / secs)
    }

    pub fn tokens_per_second(&self) -> Option<f64> {
        let secs = self.total.as_secs_f64();
        (secs > 0.0).then(|| self.approx_tokens as f64 / secs)
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(warmup) = self.warmup {
            writeln!(f, "Warmup time: {:.2} seconds", warmup.as_secs_f64())?;
        }
        writeln!(f, "Total inference time: {:.2} seconds", self.total.as_secs_f64())?;
        if let Some(avg) = self.average_per_query() {
            writeln!(f, "Average per query: {:.2} seconds", avg.as_secs_f64())?;
        }
        if let Some(qps) = self.queries_per_second() {
            writeln!(f, "Queries per second: {qps:.2}")?;
        }
        if let Some(tps) = self.tokens_per_second() {
            writeln!(f, "Approximate tokens/second: {tps:.1}")?;
        }
        if self.failed > 0 {
            writeln!(f, "Failed queries: {}", self.failed)?;
        }
        Ok(())
    }
}
