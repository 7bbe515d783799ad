//! Process supervisor: launches one OS process per partition, follows its
//! output, retries failed partitions and drives the reporter.

use chrono::Utc;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::config::TaskConfig;
use super::error::{AttemptFailure, SupervisorError};
use super::log::{prepare_log_dir, WorkerLog};
use super::protocol::{classify, ControlEvent, Line, ReportedStatus, Stream};
use super::reporter::{NoopReporter, Reporter};
use super::state::{initial_states, RunReport, Snapshot, StateTable, WorkerState, WorkerStatus};
use crate::metrics;

/// Lines buffered between a worker's pipe readers and its attempt loop.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// How long to keep reading output after the process exited.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Longest line forwarded as one piece; longer output is split.
const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Builds the argv (program first) for one partition.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, state: &WorkerState) -> Vec<String>;
}

impl<F> CommandBuilder for F
where
    F: Fn(&WorkerState) -> Vec<String> + Send + Sync,
{
    fn build(&self, state: &WorkerState) -> Vec<String> {
        self(state)
    }
}

/// Process-level settings applied to every launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory of the worker processes.
    pub current_dir: Option<PathBuf>,
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Cancels a run from outside.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Kills running workers and stops the run.
    pub fn trigger(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Everything a worker future needs, scoped to one run.
struct RunContext<'a> {
    run_id: Uuid,
    config: &'a TaskConfig,
    launch: &'a LaunchOptions,
    command: &'a dyn CommandBuilder,
    states: StateTable,
    slots: Arc<Semaphore>,
    shutdown_rx: watch::Receiver<bool>,
}

/// What one attempt ended with.
struct AttemptReport {
    result: Result<(), AttemptFailure>,
    exit_code: Option<i32>,
}

impl AttemptReport {
    fn failed(failure: AttemptFailure) -> Self {
        Self {
            result: Err(failure),
            exit_code: None,
        }
    }
}

/// What a worker does after an attempt has been settled.
enum NextStep {
    Done,
    Retry(u32),
}

/// Runs a partitioned task across a pool of worker processes.
pub struct ProcessSupervisor {
    config: TaskConfig,
    command: Box<dyn CommandBuilder>,
    launch: LaunchOptions,
    states: StateTable,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ProcessSupervisor {
    pub fn new(config: TaskConfig, command: impl CommandBuilder + 'static) -> Self {
        let states = StateTable::new(initial_states(
            config.total_items,
            config.num_workers,
            config.max_retries,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            command: Box::new(command),
            launch: LaunchOptions::default(),
            states,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn with_launch_options(mut self, launch: LaunchOptions) -> Self {
        self.launch = launch;
        self
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.states.snapshot().await
    }

    /// Current worker states ordered by id.
    pub async fn states(&self) -> Vec<WorkerState> {
        self.states.snapshot().await.workers
    }

    /// Sum of `completed` over all workers.
    pub async fn global_completed(&self) -> u64 {
        self.states.snapshot().await.global_completed
    }

    /// Runs without a reporter.
    pub async fn run_silent(&self) -> Result<RunReport, SupervisorError> {
        self.run(Box::new(NoopReporter::new())).await
    }

    /// Runs every partition to a terminal state.
    ///
    /// Partition failures end up in the report; only internal faults are
    /// returned as errors.
    pub async fn run(&self, mut reporter: Box<dyn Reporter>) -> Result<RunReport, SupervisorError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        self.config
            .validate()
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))?;
        prepare_log_dir(
            &self.config.log_dir,
            self.config.num_workers,
            self.config.truncate_logs,
        )
        .await?;

        self.states
            .reset(initial_states(
                self.config.total_items,
                self.config.num_workers,
                self.config.max_retries,
            ))
            .await;

        info!(
            %run_id,
            total_items = self.config.total_items,
            num_workers = self.config.num_workers,
            max_retries = self.config.max_retries,
            reporter = reporter.name(),
            "Starting run"
        );

        reporter.start(&self.states.snapshot().await);
        let (stop_tx, stop_rx) = oneshot::channel();
        let reporter_task = spawn_reporter(
            reporter,
            self.states.clone(),
            self.config.refresh_interval(),
            stop_rx,
        );

        let ctx = RunContext {
            run_id,
            config: &self.config,
            launch: &self.launch,
            command: self.command.as_ref(),
            states: self.states.clone(),
            slots: Arc::new(Semaphore::new(self.config.num_workers)),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };

        let outcome = try_join_all(
            (0..self.config.num_workers).map(|worker_id| supervise_worker(&ctx, worker_id)),
        )
        .await;

        let _ = stop_tx.send(());
        if let Err(e) = reporter_task.await {
            warn!("Reporter task failed: {}", e);
        }

        // The next run starts uncancelled.
        let cancelled = self.shutdown_tx.send_replace(false);

        if let Err(e) = outcome {
            error!(%run_id, "Run aborted: {}", e);
            metrics::RUNS_TOTAL.with_label_values(&["error"]).inc();
            return Err(e);
        }

        let snapshot = self.states.snapshot().await;
        let report = RunReport {
            run_id,
            global_completed: snapshot.global_completed,
            total_items: snapshot.total_items,
            workers: snapshot.workers,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        };

        record_run_metrics(&report);
        if report.is_success() {
            info!(
                %run_id,
                completed = report.global_completed,
                "Run finished, all {} partitions succeeded",
                report.workers.len()
            );
        } else {
            warn!(
                %run_id,
                completed = report.global_completed,
                cancelled,
                "Run finished with {} failed partitions",
                report.failed_workers().len()
            );
        }

        Ok(report)
    }
}

fn record_run_metrics(report: &RunReport) {
    for worker in &report.workers {
        let status = worker.status.as_str().to_ascii_lowercase();
        metrics::WORKERS_FINISHED
            .with_label_values(&[status.as_str()])
            .inc();
        if worker.status == WorkerStatus::Success {
            metrics::ITEMS_COMPLETED.inc_by(worker.completed);
        }
    }

    let result = if report.cancelled {
        "cancelled"
    } else if report.is_success() {
        "success"
    } else {
        "partial_failure"
    };
    metrics::RUNS_TOTAL.with_label_values(&[result]).inc();
}

/// Drives the reporter at the refresh rate until told to stop, then finishes it.
fn spawn_reporter(
    mut reporter: Box<dyn Reporter>,
    states: StateTable,
    period: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    let snapshot = states.snapshot().await;
                    reporter.update(&snapshot);
                }
            }
        }

        let snapshot = states.snapshot().await;
        reporter.finish(&snapshot);
    })
}

/// Resolves once the run is cancelled. Never resolves if the sender is gone.
async fn wait_cancelled(shutdown_rx: &mut watch::Receiver<bool>) {
    let closed = shutdown_rx.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Sleeps through a retry delay. Returns `false` if the run was cancelled.
async fn wait_backoff(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if !delay.is_zero() {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = wait_cancelled(shutdown_rx) => {}
        }
    }
    !*shutdown_rx.borrow()
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Marks a worker stopped by cancellation. Never-launched workers stay `PENDING`.
async fn mark_cancelled(states: &StateTable, worker_id: usize) {
    states
        .update(worker_id, |s| {
            if matches!(s.status, WorkerStatus::Running | WorkerStatus::Failed) && !s.is_terminal()
            {
                if let Err(e) = s.fail_attempt(AttemptFailure::Cancelled.to_string()) {
                    debug!("{}", e);
                }
                s.finalize_failure();
            }
        })
        .await;
}

/// Applies the end of an attempt to the worker's state.
fn settle_attempt(state: &mut WorkerState, report: &AttemptReport) -> NextStep {
    state.exit_code = report.exit_code;

    match &report.result {
        Ok(()) => {
            if state.status == WorkerStatus::Running {
                if let Err(e) = state.succeed() {
                    debug!("{}", e);
                }
            }
            NextStep::Done
        }
        Err(failure) => {
            if state.status == WorkerStatus::Success {
                debug!(
                    worker_id = state.worker_id,
                    "Ignoring failure after reported success: {}", failure
                );
                return NextStep::Done;
            }
            if let Err(e) = state.fail_attempt(failure.to_string()) {
                debug!("{}", e);
            }
            if *failure == AttemptFailure::Cancelled || !state.can_retry() {
                state.finalize_failure();
                NextStep::Done
            } else {
                NextStep::Retry(state.retries_used + 1)
            }
        }
    }
}

/// Runs one partition through all of its attempts.
#[instrument(name = "worker", skip(ctx), fields(run_id = %ctx.run_id))]
async fn supervise_worker(ctx: &RunContext<'_>, worker_id: usize) -> Result<(), SupervisorError> {
    let mut shutdown_rx = ctx.shutdown_rx.clone();

    let Some(initial) = ctx.states.get(worker_id).await else {
        return Ok(());
    };
    if initial.partition.is_empty() {
        if let Some(Err(e)) = ctx.states.update(worker_id, |s| s.finish_empty()).await {
            debug!("{}", e);
        }
        debug!("Empty partition, nothing to launch");
        return Ok(());
    }

    let _permit = tokio::select! {
        permit = ctx.slots.acquire() => permit.map_err(|_| SupervisorError::PoolClosed)?,
        _ = wait_cancelled(&mut shutdown_rx) => return Ok(()),
    };

    let mut log = WorkerLog::new(&ctx.config.log_dir, worker_id);

    loop {
        if *shutdown_rx.borrow() {
            mark_cancelled(&ctx.states, worker_id).await;
            break;
        }

        let state = match ctx
            .states
            .update(worker_id, |s| s.begin_attempt().map(|_| s.clone()))
            .await
        {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                debug!("Not relaunching: {}", e);
                break;
            }
            None => break,
        };

        let started = Instant::now();
        let attempt = run_attempt(ctx, &state, &mut log, &mut shutdown_rx).await;
        log.flush().await?;
        let report = attempt?;

        let label = match &report.result {
            Ok(()) => "success",
            Err(failure) => failure.kind(),
        };
        metrics::WORKER_ATTEMPTS.with_label_values(&[label]).inc();
        metrics::ATTEMPT_DURATION
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());

        let next = ctx
            .states
            .update(worker_id, |s| settle_attempt(s, &report))
            .await
            .unwrap_or(NextStep::Done);

        match next {
            NextStep::Done => break,
            NextStep::Retry(retry) => {
                let delay = ctx.config.retry.delay_for(retry);
                if let Err(failure) = &report.result {
                    warn!(
                        attempt = state.attempts,
                        "Attempt failed ({}), retry {}/{} in {:?}",
                        failure,
                        retry,
                        ctx.config.max_retries,
                        delay
                    );
                }
                if wait_backoff(delay, &mut shutdown_rx).await {
                    metrics::WORKER_RETRIES.inc();
                }
            }
        }
    }

    if let Some(state) = ctx.states.get(worker_id).await {
        match state.status {
            WorkerStatus::Success => info!(attempts = state.attempts, "Partition succeeded"),
            WorkerStatus::Failed => warn!(
                attempts = state.attempts,
                "Partition failed: {}",
                state.last_error.as_deref().unwrap_or("unknown error")
            ),
            _ => {}
        }
    }

    Ok(())
}

/// Decrements the running-workers gauge when an attempt's process is gone.
struct RunningGuard;

impl RunningGuard {
    fn new() -> Self {
        metrics::WORKERS_RUNNING.inc();
        Self
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        metrics::WORKERS_RUNNING.dec();
    }
}

/// Launches one process and follows it until it exits, times out or the run
/// is cancelled.
async fn run_attempt(
    ctx: &RunContext<'_>,
    state: &WorkerState,
    log: &mut WorkerLog,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<AttemptReport, SupervisorError> {
    let worker_id = state.worker_id;
    let argv = ctx.command.build(state);
    let Some((program, args)) = argv.split_first() else {
        warn!("Command builder returned an empty command");
        return Ok(AttemptReport::failed(AttemptFailure::Launch(
            "empty command".to_string(),
        )));
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .envs(&ctx.launch.env)
        .env("FANOUT_WORKER_ID", worker_id.to_string())
        .env("FANOUT_ATTEMPT", state.attempts.to_string())
        .env("FANOUT_START", state.partition.start_index.to_string())
        .env("FANOUT_END", state.partition.end_index.to_string());
    if let Some(dir) = &ctx.launch.current_dir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to launch {}: {}", program, e);
            return Ok(AttemptReport::failed(AttemptFailure::Launch(format!(
                "{}: {}",
                program, e
            ))));
        }
    };
    let _running = RunningGuard::new();

    info!(
        attempt = state.attempts,
        pid = child.id(),
        "Launched worker for {}..{}",
        state.partition.start_index,
        state.partition.end_index
    );

    let (line_tx, mut line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_output(
            Stream::Stdout,
            stdout,
            line_tx.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_output(
            Stream::Stderr,
            stderr,
            line_tx.clone(),
        )));
    }
    drop(line_tx);

    let deadline = ctx.config.attempt_timeout.map(|limit| Instant::now() + limit);
    let mut drain_deadline = None;
    let mut exit: Option<ExitStatus> = None;
    let mut streams_open = true;
    let mut first_final: Option<ReportedStatus> = None;
    let mut interruption: Option<AttemptFailure> = None;

    while streams_open || exit.is_none() {
        tokio::select! {
            line = line_rx.recv(), if streams_open => match line {
                Some((stream, text)) => {
                    handle_line(ctx, worker_id, log, stream, &text, &mut first_final).await?;
                }
                None => streams_open = false,
            },
            status = child.wait(), if exit.is_none() => match status {
                Ok(status) => {
                    exit = Some(status);
                    drain_deadline = Some(Instant::now() + DRAIN_GRACE);
                }
                Err(e) => {
                    interruption = Some(AttemptFailure::Wait(e.to_string()));
                    break;
                }
            },
            _ = sleep_until_opt(deadline), if exit.is_none() => {
                interruption = ctx.config.attempt_timeout.map(AttemptFailure::TimedOut);
                break;
            }
            _ = sleep_until_opt(drain_deadline), if exit.is_some() => {
                debug!("Output still open {:?} after exit, abandoning it", DRAIN_GRACE);
                break;
            }
            _ = wait_cancelled(shutdown_rx), if exit.is_none() => {
                interruption = Some(AttemptFailure::Cancelled);
                break;
            }
        }
    }

    if exit.is_none() {
        if let Err(e) = child.kill().await {
            debug!("Failed to kill worker: {}", e);
        }
    }

    // Whatever is already buffered still belongs to this attempt.
    line_rx.close();
    while let Some((stream, text)) = line_rx.recv().await {
        handle_line(ctx, worker_id, log, stream, &text, &mut first_final).await?;
    }
    for reader in readers {
        reader.abort();
    }

    let exit_code = exit.and_then(|status| status.code());
    let result = match (interruption, first_final, exit) {
        (Some(failure), _, _) => Err(failure),
        (None, Some(ReportedStatus::Failed), _) => Err(AttemptFailure::Reported),
        (None, Some(_), status) => {
            if let Some(status) = status.filter(|s| !s.success()) {
                warn!("Worker exited with {} after reporting success", status);
            }
            Ok(())
        }
        (None, None, Some(status)) if status.success() => Ok(()),
        (None, None, Some(status)) => match status.code() {
            Some(code) => Err(AttemptFailure::ExitCode(code)),
            None => Err(AttemptFailure::Signal),
        },
        (None, None, None) => Err(AttemptFailure::Wait("no exit status".to_string())),
    };

    Ok(AttemptReport { result, exit_code })
}

/// Routes one output line to the state table or the worker log.
async fn handle_line(
    ctx: &RunContext<'_>,
    worker_id: usize,
    log: &mut WorkerLog,
    stream: Stream,
    text: &str,
    first_final: &mut Option<ReportedStatus>,
) -> Result<(), SupervisorError> {
    match classify(stream, text) {
        Line::Control(event) => {
            let kind = match &event {
                ControlEvent::Status(status) => {
                    if status.is_final() && first_final.is_none() {
                        *first_final = Some(*status);
                    }
                    "status"
                }
                ControlEvent::Progress(_) => "progress",
                ControlEvent::Message(_) => "message",
            };
            metrics::CONTROL_EVENTS.with_label_values(&[kind]).inc();

            if let Some(Err(e)) = ctx.states.update(worker_id, |s| s.apply(&event)).await {
                debug!("Ignoring protocol line: {}", e);
            }
        }
        Line::Log(line) => {
            log.write_line(&line).await?;
            metrics::LOG_LINES
                .with_label_values(&[stream.as_str()])
                .inc();
        }
    }
    Ok(())
}

/// Reads one pipe line by line and forwards each line, decoded lossily.
/// Lines longer than `MAX_LINE_BYTES` are forwarded in pieces.
async fn forward_output<R>(stream: Stream, reader: R, line_tx: mpsc::Sender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut split = false;

    loop {
        buf.clear();
        match (&mut reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut buf)
            .await
        {
            Ok(0) => break,
            Ok(_) => {
                let complete = buf.last() == Some(&b'\n');
                if complete {
                    buf.pop();
                    // Newline right after a split piece ends that line.
                    if split && buf.is_empty() {
                        split = false;
                        continue;
                    }
                }
                split = !complete;
                let line = String::from_utf8_lossy(&buf).into_owned();
                if line_tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Stopped reading worker {}: {}", stream, e);
                break;
            }
        }
    }
}
