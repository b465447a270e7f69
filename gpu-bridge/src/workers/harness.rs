//! Parent side: fan out one worker process per resource, fan results back in
//!
//! # Lifecycle of a run
//!
//! 1. Validate assignments and bind each one to its device group
//! 2. Spawn every worker with its own `CUDA_VISIBLE_DEVICES`, send its request
//! 3. Forward result frames from each worker's stdout into one channel
//! 4. Join every worker (optionally with a deadline, killing on expiry)
//! 5. Drain the channel until it is closed and empty
//! 6. Fill gaps with error-tagged results and sort
//!
//! Every worker leads its own process group. Whatever it starts (an inference
//! engine holding device memory, say) is killed with it, whether the worker
//! exits, times out or the run is dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use fanout_core::{
    BatchTiming, HarnessError, ResourceScope, ResultBatch, ResultSet, WorkAssignment, WorkError,
    WorkErrorKind, WorkResult,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::ipc::{encode_frame, read_frame, WorkerRequest};
use super::VISIBLE_DEVICES_ENV;
use crate::config::HarnessConfig;
use crate::inference::BackendConfig;

/// Program (and arguments) started for every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    /// Command with no arguments. A bare name is resolved through `PATH`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-execute the running binary, typically with a `worker` subcommand.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn command(&self, scope: &ResourceScope) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(VISIBLE_DEVICES_ENV, scope.visible_devices())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true); // Ensure cleanup if the harness goes away
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// How a worker process ended.
#[derive(Debug)]
enum WorkerExit {
    Exited(ExitStatus),
    TimedOut,
}

/// Process group led by one worker. Killed at most once, at the latest on drop.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn kill(&mut self) {
        let Some(leader) = self.leader.take() else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let Ok(pgid) = i32::try_from(leader) else {
                return;
            };
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) => debug!(pgid, "Worker process group killed"),
                // Nothing left in the group.
                Err(Errno::ESRCH) => {}
                Err(e) => warn!(pgid, error = %e, "Failed to kill worker process group"),
            }
        }
        #[cfg(not(unix))]
        let _ = leader;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

struct RunningWorker {
    resource_id: u32,
    child: Child,
    group: ProcessGroup,
    deadline: Option<Instant>,
    forwarder: JoinHandle<()>,
}

/// Runs assignments in parallel worker processes and merges their results.
pub struct Harness {
    worker: WorkerCommand,
    config: HarnessConfig,
}

impl Harness {
    /// Create a harness that starts `worker` once per assignment.
    pub const fn new(worker: WorkerCommand, config: HarnessConfig) -> Self {
        Self { worker, config }
    }

    /// Dispatch every assignment to its own worker and collect a complete result set.
    ///
    /// Per-worker failures come back as error-tagged results. An `Err` means the
    /// harness itself could not spawn or join its workers.
    ///
    /// # Arguments
    ///
    /// * `assignments` - One per worker; resource ids must be unique and index
    ///   into the configured device groups
    /// * `backend` - Inference service every worker builds for itself
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidAssignments`] before anything is spawned if
    /// the assignments break those rules, [`HarnessError::Spawn`] if a worker
    /// cannot be started and [`HarnessError::Join`] if waiting on one fails.
    pub async fn run(
        &self,
        assignments: Vec<WorkAssignment>,
        backend: &BackendConfig,
    ) -> Result<ResultSet, HarnessError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("fanout", run_id = %run_id, workers = assignments.len());
        self.run_inner(assignments, backend).instrument(span).await
    }

    async fn run_inner(
        &self,
        assignments: Vec<WorkAssignment>,
        backend: &BackendConfig,
    ) -> Result<ResultSet, HarnessError> {
        let scopes = self.plan(&assignments)?;
        info!(backend = backend.name(), "Dispatching workers");

        let (tx, mut rx) = mpsc::unbounded_channel::<ResultBatch>();

        let mut running = Vec::with_capacity(assignments.len());
        for (assignment, scope) in assignments.iter().zip(scopes) {
            // Already-spawned children are killed on drop if this fails.
            running.push(self.spawn(assignment, scope, backend, tx.clone()).await?);
        }
        drop(tx);

        let mut exits = HashMap::with_capacity(running.len());
        for worker in &mut running {
            let exit = join(worker).await?;
            exits.insert(worker.resource_id, exit);
        }

        for worker in running {
            match worker.forwarder.await {
                Ok(()) => {}
                // Forwarders of killed workers are aborted in join().
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    return Err(HarnessError::Join {
                        resource_id: worker.resource_id,
                        reason: format!("result forwarder failed: {e}"),
                    })
                }
            }
        }

        // Every sender is gone now, so recv() yields None only once the buffer is empty.
        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
        debug!(batches = batches.len(), "Result channel drained");

        let results = assemble(&assignments, batches, &exits);
        info!(
            results = results.len(),
            failed = results.failures().count(),
            "All workers joined"
        );
        Ok(results)
    }

    /// Check the assignment invariants and compute each worker's scope.
    fn plan(&self, assignments: &[WorkAssignment]) -> Result<Vec<ResourceScope>, HarnessError> {
        if assignments.is_empty() {
            return Err(HarnessError::InvalidAssignments(
                "no assignments to dispatch".to_string(),
            ));
        }

        let count = assignments.len();
        let mut ids = HashSet::with_capacity(count);
        let mut claimed_devices = HashMap::new();
        let mut scopes = Vec::with_capacity(count);

        for assignment in assignments {
            let id = assignment.resource_id;
            if id as usize >= count {
                return Err(HarnessError::InvalidAssignments(format!(
                    "resource id {id} is outside 0..{count}"
                )));
            }
            if !ids.insert(id) {
                return Err(HarnessError::InvalidAssignments(format!(
                    "resource id {id} is assigned more than once"
                )));
            }

            let devices = self
                .config
                .devices_for(id)
                .filter(|d| !d.is_empty())
                .ok_or_else(|| {
                    HarnessError::InvalidAssignments(format!(
                        "no devices configured for resource {id}"
                    ))
                })?;
            for device in &devices {
                if let Some(owner) = claimed_devices.insert(*device, id) {
                    return Err(HarnessError::InvalidAssignments(format!(
                        "device {device} is claimed by resources {owner} and {id}"
                    )));
                }
            }

            scopes.push(ResourceScope::with_devices(id, devices));
        }

        Ok(scopes)
    }

    async fn spawn(
        &self,
        assignment: &WorkAssignment,
        scope: ResourceScope,
        backend: &BackendConfig,
        tx: mpsc::UnboundedSender<ResultBatch>,
    ) -> Result<RunningWorker, HarnessError> {
        let resource_id = assignment.resource_id;
        let frame = encode_frame(&WorkerRequest {
            scope: scope.clone(),
            assignment: assignment.clone(),
            backend: backend.clone(),
        })?;

        let mut child = self
            .worker
            .command(&scope)
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                resource_id,
                source,
            })?;
        let group = ProcessGroup { leader: child.id() };
        // A timeout too large to represent is no deadline at all.
        let deadline = self
            .config
            .join_timeout
            .and_then(|t| Instant::now().checked_add(t));

        info!(
            resource_id,
            pid = child.id(),
            devices = %scope.visible_devices(),
            "Worker process spawned"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Ipc("worker stdout was not captured".to_string()))?;
        let forwarder = tokio::spawn(
            forward_results(resource_id, stdout, tx, self.config.max_frame_bytes)
                .instrument(tracing::Span::current()),
        );

        if let Some(mut stdin) = child.stdin.take() {
            let send = async move {
                stdin.write_all(&frame).await?;
                stdin.shutdown().await
            };
            let sent = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, send)
                    .await
                    .unwrap_or_else(|_| {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "worker did not accept its request",
                        ))
                    }),
                None => send.await,
            };
            // A worker that cannot take its request is reported as lost after join.
            if let Err(e) = sent {
                warn!(resource_id, error = %e, "Failed to send request to worker");
            }
        }

        Ok(RunningWorker {
            resource_id,
            child,
            group,
            deadline,
            forwarder,
        })
    }
}

/// Wait for a worker, killing it if its deadline passes.
///
/// Whatever the worker left running in its process group is killed as soon
/// as the worker itself is gone.
async fn join(worker: &mut RunningWorker) -> Result<WorkerExit, HarnessError> {
    let resource_id = worker.resource_id;
    let join_error = |e: std::io::Error| HarnessError::Join {
        resource_id,
        reason: e.to_string(),
    };

    let status = match worker.deadline {
        None => worker.child.wait().await.map_err(join_error)?,
        Some(deadline) => match tokio::time::timeout_at(deadline, worker.child.wait()).await {
            Ok(status) => status.map_err(join_error)?,
            Err(_) => {
                error!(resource_id, pid = worker.child.id(), "Worker timed out, killing it");
                worker.group.kill();
                worker.child.kill().await.map_err(join_error)?;
                // Anything it still holds open must not keep the run waiting.
                worker.forwarder.abort();
                return Ok(WorkerExit::TimedOut);
            }
        },
    };

    worker.group.kill();
    if status.success() {
        debug!(resource_id, "Worker exited");
    } else {
        warn!(resource_id, status = %status, "Worker exited with failure status");
    }
    Ok(WorkerExit::Exited(status))
}

/// Pump result frames from one worker's stdout into the shared channel.
async fn forward_results(
    resource_id: u32,
    stdout: ChildStdout,
    tx: mpsc::UnboundedSender<ResultBatch>,
    max_frame_bytes: usize,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame::<_, ResultBatch>(&mut reader, max_frame_bytes).await {
            Ok(Some(mut batch)) => {
                if batch.resource_id != resource_id {
                    warn!(
                        resource_id,
                        claimed = batch.resource_id,
                        "Discarding batch for a foreign resource"
                    );
                    continue;
                }
                batch.results.retain(|r| r.resource_id == resource_id);
                debug!(resource_id, results = batch.results.len(), "Result batch received");
                if tx.send(batch).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(resource_id, error = %e, "Dropping malformed result stream");
                break;
            }
        }
    }
}

/// Merge batches into a result set with exactly one outcome per dispatched item.
fn assemble(
    assignments: &[WorkAssignment],
    batches: Vec<ResultBatch>,
    exits: &HashMap<u32, WorkerExit>,
) -> ResultSet {
    let payload_len: HashMap<u32, usize> = assignments
        .iter()
        .map(|a| (a.resource_id, a.payload.len()))
        .collect();

    let mut collected: BTreeMap<(u32, usize), WorkResult> = BTreeMap::new();
    let mut timings: BTreeMap<u32, BatchTiming> = BTreeMap::new();

    for batch in batches {
        timings.insert(batch.resource_id, batch.timing);
        for result in batch.results {
            let in_range = payload_len
                .get(&result.resource_id)
                .is_some_and(|len| result.item_index < *len);
            if !in_range {
                warn!(
                    resource_id = result.resource_id,
                    item_index = result.item_index,
                    "Discarding result for an item that was never dispatched"
                );
                continue;
            }
            if collected.contains_key(&result.key()) {
                warn!(
                    resource_id = result.resource_id,
                    item_index = result.item_index,
                    "Discarding duplicate result"
                );
                continue;
            }
            collected.insert(result.key(), result);
        }
    }

    for assignment in assignments {
        let missing = (0..assignment.payload.len())
            .filter(|i| !collected.contains_key(&(assignment.resource_id, *i)))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            continue;
        }

        let error = missing_error(exits.get(&assignment.resource_id));
        warn!(
            resource_id = assignment.resource_id,
            missing = missing.len(),
            error = %error,
            "Worker did not report every item"
        );
        for index in missing {
            let result = WorkResult::failure(
                assignment.resource_id,
                index,
                &assignment.payload[index],
                error.clone(),
            );
            collected.insert(result.key(), result);
        }
    }

    ResultSet::new(collected.into_values().collect(), timings)
}

fn missing_error(exit: Option<&WorkerExit>) -> WorkError {
    match exit {
        Some(WorkerExit::TimedOut) => WorkError::new(
            WorkErrorKind::Timeout,
            "worker exceeded the join timeout and was killed",
        ),
        Some(WorkerExit::Exited(status)) => WorkError::new(
            WorkErrorKind::WorkerLost,
            format!("worker exited with {status} before reporting this item"),
        ),
        None => WorkError::new(WorkErrorKind::WorkerLost, "worker was never joined"),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;

    /// True once `pid` no longer exists or is only a zombie awaiting its reaper.
    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..50 {
            let gone = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Err(_) => true,
                Ok(stat) => stat
                    .rsplit_once(") ")
                    .is_some_and(|(_, rest)| rest.starts_with('Z')),
            };
            if gone {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    async fn read_pid(path: &Path) -> u32 {
        for _ in 0..50 {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Ok(pid) = raw.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    fn assignment(id: u32, n: usize) -> WorkAssignment {
        WorkAssignment::new(id, (0..n).map(|i| format!("p{id}-{i}")).collect())
    }

    fn harness(config: HarnessConfig) -> Harness {
        Harness::new(WorkerCommand::new("unused"), config)
    }

    #[test]
    fn test_plan_binds_slot_to_matching_device() {
        let scopes = harness(HarnessConfig::default())
            .plan(&[assignment(1, 1), assignment(0, 1)])
            .unwrap();
        assert_eq!(scopes[0], ResourceScope::single(1));
        assert_eq!(scopes[1], ResourceScope::single(0));
    }

    #[test]
    fn test_plan_rejects_bad_ids() {
        let h = harness(HarnessConfig::default());
        assert!(matches!(h.plan(&[]), Err(HarnessError::InvalidAssignments(_))));

        let err = h.plan(&[assignment(0, 1), assignment(0, 1)]).unwrap_err();
        assert!(err.to_string().contains("more than once"));

        let err = h.plan(&[assignment(0, 1), assignment(2, 1)]).unwrap_err();
        assert!(err.to_string().contains("outside 0..2"));
    }

    #[test]
    fn test_plan_rejects_shared_devices() {
        let h = harness(HarnessConfig::default().with_device_groups(vec![vec![0, 1], vec![1, 2]]));
        let err = h.plan(&[assignment(0, 1), assignment(1, 1)]).unwrap_err();
        assert!(err.to_string().contains("device 1"));

        let h = harness(HarnessConfig::default().with_device_groups(vec![vec![0, 1, 2]]));
        let scopes = h.plan(&[assignment(0, 1)]).unwrap();
        assert_eq!(scopes[0].visible_devices(), "0,1,2");
    }

    #[test]
    fn test_assemble_fills_gaps_and_drops_noise() {
        let assignments = vec![assignment(0, 2), assignment(1, 2)];
        let batches = vec![
            ResultBatch {
                resource_id: 1,
                results: vec![WorkResult::success(1, 1, "p1-1", "late")],
                timing: BatchTiming::default(),
            },
            ResultBatch {
                resource_id: 0,
                results: vec![
                    WorkResult::success(0, 0, "p0-0", "first"),
                    WorkResult::success(0, 0, "p0-0", "duplicate"),
                    WorkResult::success(0, 1, "p0-1", "second"),
                    WorkResult::success(0, 7, "p0-7", "never dispatched"),
                ],
                timing: BatchTiming::default(),
            },
        ];
        let mut exits = HashMap::new();
        exits.insert(1, WorkerExit::TimedOut);

        let set = assemble(&assignments, batches, &exits);
        assert!(set.is_complete_for(&assignments));

        let keys: Vec<_> = set.iter().map(WorkResult::key).collect();
        assert_eq!(keys, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(set.results()[0].output(), Some("first"));
        assert_eq!(
            set.results()[2].error().map(|e| e.kind),
            Some(WorkErrorKind::Timeout)
        );
        assert_eq!(set.results()[2].prompt, "p1-0");
        assert_eq!(set.results()[3].output(), Some("late"));
    }

    #[tokio::test]
    async fn test_spawn_failure_aborts_run() {
        let harness = Harness::new(
            WorkerCommand::new("/nonexistent/fanout-worker"),
            HarnessConfig::default(),
        );
        let err = harness
            .run(vec![assignment(0, 1)], &BackendConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Spawn { resource_id: 0, .. }));
    }

    #[tokio::test]
    async fn test_silent_worker_is_reported_lost() {
        let harness = Harness::new(
            WorkerCommand::new("sh").arg("-c").arg("cat > /dev/null; exit 3"),
            HarnessConfig::default(),
        );
        let assignments = vec![assignment(0, 2), assignment(1, 1)];
        let set = harness
            .run(assignments.clone(), &BackendConfig::default())
            .await
            .unwrap();

        assert!(set.is_complete_for(&assignments));
        for result in &set {
            let err = result.error().unwrap();
            assert_eq!(err.kind, WorkErrorKind::WorkerLost);
            assert!(err.message.contains('3'));
        }
    }

    #[tokio::test]
    async fn test_hung_worker_is_killed_at_deadline() {
        let harness = Harness::new(
            WorkerCommand::new("sh").arg("-c").arg("cat > /dev/null; exec sleep 30"),
            HarnessConfig::default().with_join_timeout(Duration::from_millis(300)),
        );
        let started = std::time::Instant::now();
        let set = harness
            .run(vec![assignment(0, 1)], &BackendConfig::default())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            set.results()[0].error().map(|e| e.kind),
            Some(WorkErrorKind::Timeout)
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timed_out_worker_takes_its_children_along() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("child.pid");
        let script = format!(
            "cat > /dev/null; sleep 30 & echo $! > {}; wait",
            pidfile.display()
        );
        let harness = Harness::new(
            WorkerCommand::new("sh").arg("-c").arg(script),
            HarnessConfig::default().with_join_timeout(Duration::from_millis(1500)),
        );

        let set = harness
            .run(vec![assignment(0, 1)], &BackendConfig::default())
            .await
            .unwrap();
        assert_eq!(
            set.results()[0].error().map(|e| e.kind),
            Some(WorkErrorKind::Timeout)
        );

        let child = read_pid(&pidfile).await;
        assert!(wait_until_gone(child).await, "pid {child} outlived its worker");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_crashed_worker_leaves_no_children() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("child.pid");
        let script = format!(
            "cat > /dev/null; sleep 30 > /dev/null & echo $! > {}; exit 1",
            pidfile.display()
        );
        let harness = Harness::new(
            WorkerCommand::new("sh").arg("-c").arg(script),
            HarnessConfig::default(),
        );

        let set = harness
            .run(vec![assignment(0, 1)], &BackendConfig::default())
            .await
            .unwrap();
        assert_eq!(
            set.results()[0].error().map(|e| e.kind),
            Some(WorkErrorKind::WorkerLost)
        );

        let child = read_pid(&pidfile).await;
        assert!(wait_until_gone(child).await, "pid {child} outlived its worker");
    }
}
