use super::error::JobError;
use super::progress::{FractionProgress, MAX_RUNNING_PROGRESS, ProgressEstimator};
use super::types::{JobSnapshot, JobStatus};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

struct JobState {
    status: JobStatus,
    progress: u8,
    logs: Vec<String>,
    metadata: Map<String, Value>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    killed: bool,
}

struct JobEntry {
    id: Uuid,
    kind: String,
    title: String,
    pipeline_step_id: Option<String>,
    created_at: DateTime<Utc>,
    state: Mutex<JobState>,
    cancel: AtomicBool,
    child: Mutex<Option<Child>>,
}

impl JobEntry {
    fn lock(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state.lock().expect("job state lock")
    }

    fn snapshot(&self) -> JobSnapshot {
        let state = self.lock();
        JobSnapshot {
            id: self.id,
            kind: self.kind.clone(),
            title: self.title.clone(),
            pipeline_step_id: self.pipeline_step_id.clone(),
            status: state.status,
            progress_percent: state.progress,
            logs: state.logs.clone(),
            metadata: state.metadata.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }

    fn begin(&self) -> Result<(), JobError> {
        let mut state = self.lock();
        if state.status != JobStatus::Queued {
            return Err(JobError::AlreadyStarted {
                id: self.id,
                status: state.status,
            });
        }
        state.status = JobStatus::Running;
        state.started_at = Some(Utc::now());
        Ok(())
    }

    fn append_log(&self, line: String, estimator: &dyn ProgressEstimator) {
        let observed = estimator.observe(&line);
        let mut state = self.lock();
        if let Some(percent) = observed {
            if !state.status.is_finished() {
                state.progress = state.progress.max(percent.min(MAX_RUNNING_PROGRESS));
            }
        }
        state.logs.push(line);
    }

    /// Records the terminal state unless a kill already did.
    fn finish(&self, status: JobStatus, metadata: Map<String, Value>) {
        let mut state = self.lock();
        if state.killed {
            return;
        }
        state.status = status;
        state.progress = 100;
        state.finished_at = Some(Utc::now());
        state.metadata.extend(metadata);
    }

    fn fail(&self, line: String, metadata: Map<String, Value>) {
        self.lock().logs.push(line);
        self.finish(JobStatus::Failed, metadata);
    }
}

/// Handle given to in-process work started with [`JobSupervisor::run_with`].
pub struct JobContext {
    entry: Arc<JobEntry>,
    estimator: Arc<dyn ProgressEstimator>,
}

impl JobContext {
    pub fn id(&self) -> Uuid {
        self.entry.id
    }

    pub fn log(&self, line: impl Into<String>) {
        self.entry.append_log(line.into(), self.estimator.as_ref());
    }

    pub fn set_progress(&self, percent: u8) {
        let mut state = self.entry.lock();
        if !state.status.is_finished() {
            state.progress = percent.min(MAX_RUNNING_PROGRESS);
        }
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.entry.lock().metadata.insert(key.into(), value);
    }

    /// Set once the job has been killed; work should stop at the next
    /// convenient point.
    pub fn is_cancelled(&self) -> bool {
        self.entry.cancel.load(Ordering::SeqCst)
    }
}

/// Tracks background jobs, one OS thread each.
pub struct JobSupervisor {
    jobs: RwLock<HashMap<Uuid, Arc<JobEntry>>>,
    estimator: Arc<dyn ProgressEstimator>,
}

impl Default for JobSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl JobSupervisor {
    pub fn new() -> Self {
        Self::with_estimator(Arc::new(FractionProgress))
    }

    pub fn with_estimator(estimator: Arc<dyn ProgressEstimator>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            estimator,
        }
    }

    pub fn create_job(
        &self,
        kind: impl Into<String>,
        title: impl Into<String>,
        pipeline_step_id: Option<String>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let entry = Arc::new(JobEntry {
            id,
            kind: kind.into(),
            title: title.into(),
            pipeline_step_id,
            created_at: Utc::now(),
            state: Mutex::new(JobState {
                status: JobStatus::Queued,
                progress: 0,
                logs: Vec::new(),
                metadata: Map::new(),
                started_at: None,
                finished_at: None,
                killed: false,
            }),
            cancel: AtomicBool::new(false),
            child: Mutex::new(None),
        });
        debug!(job = %id, kind = entry.kind.as_str(), "job created");
        self.jobs
            .write()
            .expect("job table lock")
            .insert(id, entry);
        id
    }

    fn entry(&self, id: Uuid) -> Result<Arc<JobEntry>, JobError> {
        self.jobs
            .read()
            .expect("job table lock")
            .get(&id)
            .cloned()
            .ok_or(JobError::NotFound { id })
    }

    /// Runs `command` through the platform shell on a dedicated thread.
    pub fn run_async(&self, id: Uuid, command: &str) -> Result<(), JobError> {
        let entry = self.entry(id)?;
        entry.begin()?;
        info!(job = %id, command, "starting job command");

        let mut child = match shell(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                entry.fail(
                    format!("failed to spawn command: {source}"),
                    error_metadata("Spawn", None),
                );
                return Err(JobError::Spawn { id, source });
            }
        };

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(&entry, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(&entry, stderr));
        }
        *entry.child.lock().expect("job child lock") = Some(child);
        if entry.cancel.load(Ordering::SeqCst) {
            // Killed between `begin` and now.
            let _ = kill_child(&entry);
        }

        let monitor = Arc::clone(&entry);
        std::thread::Builder::new()
            .name(format!("job-{id}"))
            .spawn(move || monitor_child(monitor, readers))
            .map(|_| ())
            .map_err(|source| {
                let _ = kill_child(&entry);
                entry.fail(
                    format!("failed to start job thread: {source}"),
                    error_metadata("Thread", None),
                );
                JobError::Thread { id, source }
            })
    }

    fn spawn_reader<R>(&self, entry: &Arc<JobEntry>, stream: R) -> Option<JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        let id = entry.id;
        let entry = Arc::clone(entry);
        let estimator = Arc::clone(&self.estimator);
        std::thread::Builder::new()
            .name(format!("job-{id}-output"))
            .spawn(move || drain_lines(stream, |line| entry.append_log(line, estimator.as_ref())))
            .map_err(|err| warn!(job = %id, %err, "failed to start output reader"))
            .ok()
    }

    /// Runs in-process work on a dedicated thread. `Err` marks the job failed
    /// with the message recorded in its metadata.
    pub fn run_with<F>(&self, id: Uuid, work: F) -> Result<(), JobError>
    where
        F: FnOnce(&JobContext) -> Result<(), String> + Send + 'static,
    {
        let entry = self.entry(id)?;
        entry.begin()?;
        info!(job = %id, kind = entry.kind.as_str(), "starting in-process job");

        let context = JobContext {
            entry: Arc::clone(&entry),
            estimator: Arc::clone(&self.estimator),
        };
        std::thread::Builder::new()
            .name(format!("job-{id}"))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| work(&context)));
                let entry = &context.entry;
                match outcome {
                    Ok(Ok(())) if !entry.cancel.load(Ordering::SeqCst) => {
                        entry.finish(JobStatus::Completed, Map::new());
                        info!(job = %entry.id, "job completed");
                    }
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => {
                        warn!(job = %entry.id, error = message.as_str(), "job failed");
                        entry.fail(
                            format!("job failed: {message}"),
                            error_metadata("Work", Some(message)),
                        );
                    }
                    Err(_) => {
                        warn!(job = %entry.id, "job panicked");
                        entry.fail(
                            "job panicked".to_string(),
                            error_metadata("Panic", None),
                        );
                    }
                }
            })
            .map(|_| ())
            .map_err(|source| {
                entry.fail(
                    format!("failed to start job thread: {source}"),
                    error_metadata("Thread", None),
                );
                JobError::Thread { id, source }
            })
    }

    pub fn get_status(&self, id: Uuid) -> Option<JobSnapshot> {
        self.entry(id).ok().map(|entry| entry.snapshot())
    }

    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .jobs
            .read()
            .expect("job table lock")
            .values()
            .map(|entry| entry.snapshot())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Stops a queued or running job and marks it failed. Returns true when
    /// the job is (now or already) killed, false for unknown or naturally
    /// finished jobs.
    pub fn kill_job(&self, id: Uuid) -> bool {
        let Ok(entry) = self.entry(id) else {
            return false;
        };

        {
            let mut state = entry.lock();
            if state.killed {
                return true;
            }
            if state.status.is_finished() {
                return false;
            }
            state.killed = true;
            state.status = JobStatus::Failed;
            state.progress = 100;
            state.finished_at = Some(Utc::now());
            state.logs.push("job killed".to_string());
            state
                .metadata
                .insert("killed".to_string(), Value::Bool(true));
        }
        entry.cancel.store(true, Ordering::SeqCst);

        if let Err(err) = kill_child(&entry) {
            warn!(job = %id, %err, "failed to kill job process");
        }
        info!(job = %id, "job killed");
        true
    }

    /// Blocks until the job finishes or `timeout` elapses.
    pub fn wait(&self, id: Uuid, timeout: Duration) -> Option<JobSnapshot> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.get_status(id)?;
            if snapshot.status.is_finished() || Instant::now() >= deadline {
                return Some(snapshot);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Drops finished jobs whose end lies further back than `older_than`.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let horizon = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let mut jobs = self.jobs.write().expect("job table lock");
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let state = entry.lock();
            match (state.status.is_finished(), state.finished_at, horizon) {
                (true, Some(finished), Some(horizon)) => finished > horizon,
                _ => true,
            }
        });
        let purged = before - jobs.len();
        if purged > 0 {
            debug!(purged, "purged finished jobs");
        }
        purged
    }
}

fn monitor_child(entry: Arc<JobEntry>, readers: Vec<Option<JoinHandle<()>>>) {
    let exit = loop {
        let mut guard = entry.child.lock().expect("job child lock");
        let Some(child) = guard.as_mut() else {
            break None;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                guard.take();
                break Some(Ok(status));
            }
            Ok(None) => {
                drop(guard);
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                guard.take();
                break Some(Err(err));
            }
        }
    };

    // Killed jobs may leave grandchildren holding the pipes open.
    if entry.cancel.load(Ordering::SeqCst) {
        return;
    }
    for reader in readers.into_iter().flatten() {
        let _ = reader.join();
    }

    match exit {
        Some(Ok(status)) if status.success() => {
            entry.finish(JobStatus::Completed, Map::new());
            info!(job = %entry.id, "job completed");
        }
        Some(Ok(status)) => {
            let failure = JobError::SubprocessFailure {
                code: status.code(),
            };
            warn!(job = %entry.id, error = %failure, "job failed");
            let mut metadata = error_metadata("SubprocessFailure", Some(failure.to_string()));
            metadata.insert("exit_code".to_string(), json!(status.code()));
            entry.fail(failure.to_string(), metadata);
        }
        Some(Err(err)) => {
            entry.fail(
                format!("failed to wait for command: {err}"),
                error_metadata("Wait", Some(err.to_string())),
            );
        }
        None => {}
    }
}

/// Reads `stream` to EOF, one lossily decoded line at a time. The pipe is
/// never dropped early, or the child could block or die of SIGPIPE.
fn drain_lines<R: Read>(stream: R, mut on_line: impl FnMut(String)) {
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buffer.last(), Some(b'\n' | b'\r')) {
                    buffer.pop();
                }
                on_line(String::from_utf8_lossy(&buffer).into_owned());
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(%err, "job output stream closed");
                break;
            }
        }
    }
}

fn kill_child(entry: &JobEntry) -> std::io::Result<()> {
    let child = entry.child.lock().expect("job child lock").take();
    if let Some(mut child) = child {
        child.kill()?;
        let _ = child.wait();
    }
    Ok(())
}

fn error_metadata(kind: &str, message: Option<String>) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("error_kind".to_string(), Value::String(kind.to_string()));
    if let Some(message) = message {
        metadata.insert("error".to_string(), Value::String(message));
    }
    metadata
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn new_jobs_are_queued() {
        let supervisor = JobSupervisor::new();
        let id = supervisor.create_job("verify", "Verify tasks", Some("step-2".into()));
        let snapshot = supervisor.get_status(id).expect("job exists");
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.progress_percent, 0);
        assert_eq!(snapshot.pipeline_step_id.as_deref(), Some("step-2"));
        assert!(supervisor.get_status(Uuid::new_v4()).is_none());
    }

    #[test]
    fn successful_command_completes_with_both_streams_logged() {
        let supervisor = JobSupervisor::new();
        let id = supervisor.create_job("shell", "echo", None);
        supervisor
            .run_async(id, "echo '[1/2] out'; echo err 1>&2; echo '[2/2] out'")
            .expect("start");

        let snapshot = supervisor.wait(id, WAIT).expect("job exists");
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.progress_percent, 100);
        assert!(snapshot.logs.contains(&"[1/2] out".to_string()));
        assert!(snapshot.logs.contains(&"err".to_string()));
        assert!(snapshot.logs.contains(&"[2/2] out".to_string()));
        assert!(snapshot.finished_at.is_some());
    }

    #[test]
    fn non_zero_exit_fails_with_subprocess_failure() {
        let supervisor = JobSupervisor::new();
        let id = supervisor.create_job("shell", "fail", None);
        supervisor.run_async(id, "echo working; exit 3").expect("start");

        let snapshot = supervisor.wait(id, WAIT).expect("job exists");
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.progress_percent, 100);
        assert_eq!(snapshot.metadata["error_kind"], "SubprocessFailure");
        assert_eq!(snapshot.metadata["exit_code"], 3);
    }

    #[test]
    fn invalid_utf8_output_keeps_the_pipe_drained() {
        let supervisor = JobSupervisor::new();
        let id = supervisor.create_job("shell", "binary noise", None);
        supervisor
            .run_async(
                id,
                "printf 'start\\n\\377\\n'; head -c 300000 /dev/zero | tr '\\000' a; echo; echo done",
            )
            .expect("start");

        let snapshot = supervisor.wait(id, WAIT).expect("job exists");
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.logs.first().map(String::as_str), Some("start"));
        assert_eq!(snapshot.logs[1], "\u{FFFD}");
        assert_eq!(snapshot.logs[2].len(), 300_000);
        assert_eq!(snapshot.logs.last().map(String::as_str), Some("done"));
    }

    #[test]
    fn drain_lines_decodes_lossily_and_strips_line_endings() {
        let mut lines = Vec::new();
        drain_lines(&b"one\r\n\xffbad\nlast"[..], |line| lines.push(line));
        assert_eq!(lines, vec!["one", "\u{FFFD}bad", "last"]);
    }

    #[test]
    fn jobs_start_only_once() {
        let supervisor = JobSupervisor::new();
        let id = supervisor.create_job("shell", "twice", None);
        supervisor.run_async(id, "true").expect("start");
        assert!(matches!(
            supervisor.run_async(id, "true"),
            Err(JobError::AlreadyStarted { .. })
        ));
        assert!(matches!(
            supervisor.run_async(Uuid::new_v4(), "true"),
            Err(JobError::NotFound { .. })
        ));
    }

    #[test]
    fn kill_is_idempotent_and_safe_on_finished_jobs() {
        let supervisor = JobSupervisor::new();
        let id = supervisor.create_job("shell", "sleeper", None);
        supervisor.run_async(id, "sleep 30").expect("start");

        assert!(supervisor.kill_job(id));
        assert!(supervisor.kill_job(id));
        let snapshot = supervisor.get_status(id).expect("job exists");
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.metadata["killed"], true);

        let done = supervisor.create_job("shell", "quick", None);
        supervisor.run_async(done, "true").expect("start");
        supervisor.wait(done, WAIT);
        assert!(!supervisor.kill_job(done));
        assert_eq!(
            supervisor.get_status(done).unwrap().status,
            JobStatus::Completed
        );
        assert!(!supervisor.kill_job(Uuid::new_v4()));
    }

    #[test]
    fn in_process_work_reports_progress_and_result() {
        let supervisor = JobSupervisor::new();
        let id = supervisor.create_job("verify", "in-process", None);
        supervisor
            .run_with(id, |ctx| {
                ctx.log("[1/2] first");
                ctx.set_metadata("processed", json!(1));
                ctx.log("[2/2] second");
                Ok(())
            })
            .expect("start");

        let snapshot = supervisor.wait(id, WAIT).expect("job exists");
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.logs, vec!["[1/2] first", "[2/2] second"]);
        assert_eq!(snapshot.metadata["processed"], 1);

        let failing = supervisor.create_job("verify", "failing", None);
        supervisor
            .run_with(failing, |_| Err("input file missing".to_string()))
            .expect("start");
        let snapshot = supervisor.wait(failing, WAIT).expect("job exists");
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.metadata["error"], "input file missing");
    }

    #[test]
    fn running_progress_never_reaches_one_hundred() {
        let supervisor = JobSupervisor::new();
        let id = supervisor.create_job("verify", "progress", None);
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (seen_tx, seen_rx) = std::sync::mpsc::channel::<()>();
        supervisor
            .run_with(id, move |ctx| {
                ctx.log("[4/4] all done");
                let _ = seen_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            })
            .expect("start");

        seen_rx.recv_timeout(WAIT).expect("work logged");
        let running = supervisor.get_status(id).expect("job exists");
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.progress_percent, MAX_RUNNING_PROGRESS);

        release_tx.send(()).expect("release");
        assert_eq!(supervisor.wait(id, WAIT).unwrap().progress_percent, 100);
    }

    #[test]
    fn killing_in_process_work_sets_cancel_flag() {
        let supervisor = JobSupervisor::new();
        let id = supervisor.create_job("verify", "cancellable", None);
        let (observed_tx, observed_rx) = std::sync::mpsc::channel();
        supervisor
            .run_with(id, move |ctx| {
                while !ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                let _ = observed_tx.send(());
                Ok(())
            })
            .expect("start");

        assert!(supervisor.kill_job(id));
        observed_rx.recv_timeout(WAIT).expect("work saw cancellation");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(supervisor.get_status(id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn purge_removes_only_finished_jobs() {
        let supervisor = JobSupervisor::new();
        let queued = supervisor.create_job("shell", "queued", None);
        let done = supervisor.create_job("shell", "done", None);
        supervisor.run_async(done, "true").expect("start");
        supervisor.wait(done, WAIT);

        assert_eq!(supervisor.purge_finished(Duration::from_secs(3600)), 0);
        assert_eq!(supervisor.purge_finished(Duration::ZERO), 1);
        assert!(supervisor.get_status(done).is_none());
        assert!(supervisor.get_status(queued).is_some());
        assert_eq!(supervisor.list_jobs().len(), 1);
    }
}
