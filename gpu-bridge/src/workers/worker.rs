//! Worker side of the harness
//!
//! A worker reads one [`WorkerRequest`], runs the inference call inside its
//! resource scope and writes one [`ResultBatch`]. Failures of the call are
//! captured into error-tagged results; the worker always reports and exits
//! normally.

use std::time::Instant;

use fanout_core::{
    BatchTiming, InferenceError, ResourceScope, ResultBatch, WorkAssignment, WorkError,
    WorkErrorKind, WorkResult,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use super::ipc::{read_frame, write_frame, IpcError, WorkerRequest, DEFAULT_MAX_FRAME_BYTES};
use crate::inference::{
    EngineConfig, InferenceService, SamplingParams, ENGINE_KEY, SAMPLING_KEY, WARMUP_KEY,
};

/// Serve one request from `reader` and write the results to `writer`.
///
/// Only channel failures are returned; inference failures become results.
///
/// # Arguments
///
/// * `reader` - Harness side of the request channel (stdin in a worker process)
/// * `writer` - Where the result frame goes (stdout in a worker process)
///
/// # Errors
///
/// Returns [`IpcError::MissingRequest`] if the channel closes before a request
/// arrives, or the underlying framing error if a frame cannot be read or written.
pub async fn run_worker<R, W>(reader: &mut R, writer: &mut W) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request: WorkerRequest = read_frame(reader, DEFAULT_MAX_FRAME_BYTES)
        .await?
        .ok_or(IpcError::MissingRequest)?;

    let batch = process_request(request).await;
    write_frame(writer, &batch).await
}

/// Turn a request into its result batch. Never fails.
pub async fn process_request(request: WorkerRequest) -> ResultBatch {
    let WorkerRequest {
        scope,
        assignment,
        backend,
    } = request;
    let resource_id = assignment.resource_id;

    info!(
        resource_id,
        devices = %scope.visible_devices(),
        backend = backend.name(),
        items = assignment.payload.len(),
        "Worker starting"
    );

    let service = match backend.build() {
        Ok(service) => service,
        Err(err) => return failed_batch(&assignment, err.into()),
    };

    // Run on its own task so a panicking backend still yields a report.
    let task_assignment = assignment.clone();
    let outcome = tokio::spawn(async move {
        execute(service.as_ref(), &scope, &task_assignment).await
    })
    .await;

    match outcome {
        Ok(Ok(batch)) => {
            info!(
                resource_id,
                generation_ms = batch.timing.generation_ms,
                "Worker completed processing"
            );
            batch
        }
        Ok(Err(err)) => failed_batch(&assignment, err.into()),
        Err(join_err) => failed_batch(
            &assignment,
            WorkError::new(
                WorkErrorKind::Inference,
                format!("inference task aborted: {join_err}"),
            ),
        ),
    }
}

fn failed_batch(assignment: &WorkAssignment, error: WorkError) -> ResultBatch {
    warn!(resource_id = assignment.resource_id, error = %error, "Worker failed");
    ResultBatch {
        resource_id: assignment.resource_id,
        results: assignment.fail_all(&error),
        timing: BatchTiming::default(),
    }
}

async fn execute(
    service: &dyn InferenceService,
    scope: &ResourceScope,
    assignment: &WorkAssignment,
) -> Result<ResultBatch, InferenceError> {
    let engine: EngineConfig = assignment
        .metadata_as(ENGINE_KEY)
        .map_err(|e| InferenceError::Configuration(format!("invalid engine metadata: {e}")))?
        .ok_or_else(|| InferenceError::Configuration("missing engine metadata".to_string()))?;
    let sampling: SamplingParams = assignment
        .metadata_as(SAMPLING_KEY)
        .map_err(|e| InferenceError::Configuration(format!("invalid sampling metadata: {e}")))?
        .unwrap_or_default();

    engine.validate(scope)?;
    sampling.validate()?;

    let warmup_ms = match assignment.metadata_str(WARMUP_KEY) {
        Some(prompt) => {
            let start = Instant::now();
            service
                .generate(scope, &engine, &[prompt.to_string()], &sampling)
                .await?;
            Some(elapsed_ms(start))
        }
        None => None,
    };

    if assignment.payload.is_empty() {
        return Ok(ResultBatch {
            resource_id: assignment.resource_id,
            results: Vec::new(),
            timing: BatchTiming {
                warmup_ms,
                generation_ms: 0,
            },
        });
    }

    let start = Instant::now();
    let completions = service
        .generate(scope, &engine, &assignment.payload, &sampling)
        .await?;
    let generation_ms = elapsed_ms(start);

    if completions.len() != assignment.payload.len() {
        return Err(InferenceError::Inference(format!(
            "service returned {} outputs for {} prompts",
            completions.len(),
            assignment.payload.len()
        )));
    }

    let results = assignment
        .payload
        .iter()
        .zip(completions)
        .enumerate()
        .map(|(index, (prompt, completion))| {
            WorkResult::success(assignment.resource_id, index, prompt, completion.text.trim())
        })
        .collect();

    Ok(ResultBatch {
        resource_id: assignment.resource_id,
        results,
        timing: BatchTiming {
            warmup_ms,
            generation_ms,
        },
    })
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{build_assignment, BackendConfig, EchoConfig, SubprocessConfig};

    fn request(assignment: WorkAssignment, backend: BackendConfig) -> WorkerRequest {
        WorkerRequest {
            scope: ResourceScope::single(assignment.resource_id),
            assignment,
            backend,
        }
    }

    fn prompts() -> Vec<String> {
        vec!["What year is it?".to_string(), "What month is it?".to_string()]
    }

    #[tokio::test]
    async fn test_worker_round_trip_over_duplex() {
        let assignment = build_assignment(
            0,
            prompts(),
            &EngineConfig::new("echo"),
            &SamplingParams::default(),
        )
        .unwrap();

        let (mut harness_side, worker_side) = tokio::io::duplex(4096);
        let worker = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(worker_side);
            run_worker(&mut rd, &mut wr).await
        });

        write_frame(&mut harness_side, &request(assignment, BackendConfig::default()))
            .await
            .unwrap();
        let batch: ResultBatch = read_frame(&mut harness_side, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap()
            .unwrap();
        worker.await.unwrap().unwrap();

        assert_eq!(batch.resource_id, 0);
        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.results[1].output(), Some("echo:What month is it?"));
    }

    #[tokio::test]
    async fn test_missing_request_is_reported() {
        let mut empty: &[u8] = &[];
        let mut sink: Vec<u8> = Vec::new();
        let err = run_worker(&mut empty, &mut sink).await.unwrap_err();
        assert!(matches!(err, IpcError::MissingRequest));
    }

    #[tokio::test]
    async fn test_service_error_tags_every_item() {
        let assignment = build_assignment(
            2,
            prompts(),
            &EngineConfig::new("echo"),
            &SamplingParams::default(),
        )
        .unwrap();
        let backend = BackendConfig::Echo(EchoConfig {
            fail_on: vec![2],
            ..Default::default()
        });

        let batch = process_request(request(assignment, backend)).await;
        assert_eq!(batch.results.len(), 2);
        for result in &batch.results {
            assert_eq!(result.resource_id, 2);
            assert_eq!(result.error().map(|e| e.kind), Some(WorkErrorKind::Inference));
        }
    }

    #[tokio::test]
    async fn test_missing_engine_is_a_configuration_error() {
        let assignment = WorkAssignment::new(0, prompts());
        let batch = process_request(request(assignment, BackendConfig::default())).await;
        assert!(batch
            .results
            .iter()
            .all(|r| r.error().map(|e| e.kind) == Some(WorkErrorKind::Configuration)));
    }

    #[tokio::test]
    async fn test_invalid_engine_never_reaches_the_service() {
        let engine = EngineConfig {
            tensor_parallel_size: 3,
            ..EngineConfig::new("Qwen/Qwen2.5-72B-Instruct")
        };
        let assignment =
            build_assignment(0, prompts(), &engine, &SamplingParams::default()).unwrap();
        let backend = BackendConfig::Subprocess(SubprocessConfig {
            program: "/nonexistent/generator".to_string(),
            args: Vec::new(),
        });

        let batch = process_request(request(assignment, backend)).await;
        let err = batch.results[0].error().unwrap();
        assert_eq!(err.kind, WorkErrorKind::Configuration);
        assert!(err.message.contains("tensor_parallel_size"));
    }

    #[tokio::test]
    async fn test_warmup_is_timed_separately() {
        let assignment = build_assignment(
            0,
            prompts(),
            &EngineConfig::new("echo"),
            &SamplingParams::default(),
        )
        .unwrap()
        .with_metadata(WARMUP_KEY, "Warmup prompt")
        .unwrap();

        let batch = process_request(request(assignment, BackendConfig::default())).await;
        assert!(batch.timing.warmup_ms.is_some());
        assert_eq!(batch.results.len(), 2);
        assert!(batch.results.iter().all(WorkResult::is_success));
    }
}
