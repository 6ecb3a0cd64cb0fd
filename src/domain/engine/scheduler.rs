use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::domain::utils::id::DrmJobId;
use crate::domain::workflow::status::{ExitInfo, ExitStatus, JobStatus};
use crate::domain::workflow::workflow_node::ParallelJobInfo;
use crate::error::{Error, Result};

/// A job with every path already resolved on the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescription {
    pub name: String,
    pub command: Vec<String>,
    pub stdin: Option<PathBuf>,
    pub stdout_file: PathBuf,
    /// `None` joins stderr into `stdout_file`.
    pub stderr_file: Option<PathBuf>,
    pub working_directory: Option<PathBuf>,
    pub parallel_job_info: Option<ParallelJobInfo>,
}

/// The executor that actually runs jobs on the resource.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn submit(&self, job: JobDescription) -> Result<DrmJobId>;

    /// `None` for an identifier the scheduler does not know.
    async fn status(&self, id: DrmJobId) -> Option<JobStatus>;

    /// `None` until the job reached a terminal state.
    async fn exit_information(&self, id: DrmJobId) -> Option<ExitInfo>;

    /// Puts a job on hold.
    async fn stop(&self, id: DrmJobId) -> Result<()>;

    /// Releases a held job.
    async fn restart(&self, id: DrmJobId) -> Result<()>;

    async fn kill(&self, id: DrmJobId) -> Result<()>;

    /// Kills the job if needed and forgets it.
    async fn dispose(&self, id: DrmJobId) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LocalJob {
    description: JobDescription,
    status: JobStatus,
    exit_info: Option<ExitInfo>,
    held: bool,
    kill: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct LocalState {
    jobs: HashMap<DrmJobId, LocalJob>,
    queue: VecDeque<DrmJobId>,
    running: usize,
}

/// Runs jobs as child processes of the engine, at most `max_running` at once.
pub struct LocalScheduler {
    state: Arc<Mutex<LocalState>>,
    max_running: usize,
    next_id: AtomicI64,
}

impl LocalScheduler {
    pub fn new(max_running: usize) -> Self {
        LocalScheduler { state: Arc::new(Mutex::new(LocalState::default())), max_running: max_running.max(1), next_id: AtomicI64::new(1) }
    }

    fn unknown(id: DrmJobId) -> Error {
        Error::SchedulerError(format!("unknown scheduler job {}", id))
    }
}

/// Starts queued jobs until the running limit is reached.
fn pump(shared: &Arc<Mutex<LocalState>>, state: &mut LocalState, max_running: usize) {
    while state.running < max_running {
        let Some(position) = state.queue.iter().position(|id| state.jobs.get(id).is_some_and(|job| !job.held)) else {
            return;
        };
        let Some(id) = state.queue.remove(position) else {
            return;
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            continue;
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        job.kill = Some(kill_tx);
        job.status = JobStatus::Running;
        state.running += 1;

        log::debug!("Starting local job {} ({})", id, job.description.name);
        tokio::spawn(run(Arc::clone(shared), id, job.description.clone(), kill_rx, max_running));
    }
}

async fn run(shared: Arc<Mutex<LocalState>>, id: DrmJobId, description: JobDescription, kill_rx: oneshot::Receiver<()>, max_running: usize) {
    let (status, exit_info) = match execute(&description, kill_rx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("Local job {} ({}) could not run: {}", id, description.name, e);
            (JobStatus::Failed, ExitInfo { exit_status: ExitStatus::ExitAborted, ..ExitInfo::not_run() })
        }
    };
    log::debug!("Local job {} ended as {} ({:?})", id, status, exit_info.exit_status);

    let mut state = lock(&shared);
    state.running = state.running.saturating_sub(1);
    if let Some(job) = state.jobs.get_mut(&id) {
        job.status = status;
        job.exit_info = Some(exit_info);
        job.kill = None;
    }
    pump(&shared, &mut state, max_running);
}

async fn execute(description: &JobDescription, kill_rx: oneshot::Receiver<()>) -> Result<(JobStatus, ExitInfo)> {
    let (program, args) = description.command.split_first().ok_or_else(|| Error::SchedulerError("empty command".into()))?;

    if let Some(parallel) = &description.parallel_job_info {
        log::info!(
            "Job '{}' asks for parallel configuration '{}' on {} node(s); running it as a single process",
            description.name,
            parallel.configuration_name,
            parallel.max_node_count
        );
    }

    let stdout = File::create(&description.stdout_file)?;
    let stderr = match &description.stderr_file {
        Some(path) => File::create(path)?,
        None => stdout.try_clone()?,
    };
    let stdin = match &description.stdin {
        Some(path) => Stdio::from(File::open(path)?),
        None => Stdio::null(),
    };

    let mut command = Command::new(program);
    command.args(args).stdin(stdin).stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr)).kill_on_drop(true);
    if let Some(directory) = &description.working_directory {
        command.current_dir(directory);
    }

    let mut child = command.spawn()?;

    tokio::select! {
        status = child.wait() => Ok(exit_outcome(status?)),
        _ = kill_rx => {
            child.kill().await?;
            let killed = ExitInfo { exit_status: ExitStatus::UserKilled, ..ExitInfo::not_run() };
            Ok((JobStatus::Failed, killed))
        }
    }
}

fn exit_outcome(status: std::process::ExitStatus) -> (JobStatus, ExitInfo) {
    if let Some(code) = status.code() {
        return (JobStatus::Done, ExitInfo::finished(code));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            let info = ExitInfo { exit_status: ExitStatus::FinishedTermSig, term_signal: Some(signal), ..ExitInfo::not_run() };
            return (JobStatus::Failed, info);
        }
    }

    (JobStatus::Failed, ExitInfo { exit_status: ExitStatus::FinishedUnclearConditions, ..ExitInfo::not_run() })
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn submit(&self, description: JobDescription) -> Result<DrmJobId> {
        if description.command.is_empty() {
            return Err(Error::SchedulerError(format!("job '{}' has an empty command", description.name)));
        }
        let id = DrmJobId::new(self.next_id.fetch_add(1, Ordering::SeqCst));

        let mut state = lock(&self.state);
        state.jobs.insert(id, LocalJob { description, status: JobStatus::QueuedActive, exit_info: None, held: false, kill: None });
        state.queue.push_back(id);
        pump(&self.state, &mut state, self.max_running);

        Ok(id)
    }

    async fn status(&self, id: DrmJobId) -> Option<JobStatus> {
        lock(&self.state).jobs.get(&id).map(|job| job.status)
    }

    async fn exit_information(&self, id: DrmJobId) -> Option<ExitInfo> {
        lock(&self.state).jobs.get(&id).and_then(|job| job.exit_info.clone())
    }

    async fn stop(&self, id: DrmJobId) -> Result<()> {
        let mut state = lock(&self.state);
        let job = state.jobs.get_mut(&id).ok_or_else(|| Self::unknown(id))?;
        match job.status {
            JobStatus::QueuedActive | JobStatus::UserOnHold => {
                job.held = true;
                job.status = JobStatus::UserOnHold;
                Ok(())
            }
            JobStatus::Running => Err(Error::SchedulerError(format!("local job {} is already running and cannot be held", id))),
            _ => Ok(()),
        }
    }

    async fn restart(&self, id: DrmJobId) -> Result<()> {
        let mut state = lock(&self.state);
        let job = state.jobs.get_mut(&id).ok_or_else(|| Self::unknown(id))?;
        if job.held {
            job.held = false;
            job.status = JobStatus::QueuedActive;
            pump(&self.state, &mut state, self.max_running);
        }
        Ok(())
    }

    async fn kill(&self, id: DrmJobId) -> Result<()> {
        let mut state = lock(&self.state);
        let job = state.jobs.get_mut(&id).ok_or_else(|| Self::unknown(id))?;

        if let Some(kill) = job.kill.take() {
            // The run task records the outcome.
            let _ = kill.send(());
        } else if !job.status.is_terminal() {
            job.status = JobStatus::Failed;
            job.exit_info = Some(ExitInfo { exit_status: ExitStatus::UserKilled, ..ExitInfo::not_run() });
            state.queue.retain(|queued| *queued != id);
        }
        Ok(())
    }

    async fn dispose(&self, id: DrmJobId) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(mut job) = state.jobs.remove(&id) {
            if let Some(kill) = job.kill.take() {
                let _ = kill.send(());
            }
            state.queue.retain(|queued| *queued != id);
        }
        Ok(())
    }
}
