use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{DEFAULT_DISPOSAL_TIMEOUT_HOURS, ResourceConfig};
use crate::domain::engine::calls::{EngineCall, EngineReply, WorkflowSummary};
use crate::domain::engine::scheduler::{JobDescription, Scheduler};
use crate::domain::engine::translation::TranslationTable;
use crate::domain::remote_object::object_server::RemoteObject;
use crate::domain::transfer::transfer_action::{TransferInformation, TransferStatus};
use crate::domain::transfer::transfer_store::TransferStore;
use crate::domain::utils::id::{DrmJobId, JobId, TransferId, WorkflowId};
use crate::domain::workflow::status::{
    ExitInfo, ExitStatus, JobStatus, JobStatusEntry, JobTimes, TransferStatusEntry, WorkflowStatus, WorkflowStatusReport, ended_with_success,
};
use crate::domain::workflow::workflow::Workflow;
use crate::domain::workflow::workflow_node::{Job, JobArg, NodeKey, TransferRef, WorkflowNode};
use crate::error::{Error, Result};

struct JobRecord {
    job: Job,
    workflow: Option<(WorkflowId, NodeKey)>,
    description: JobDescription,
    drm_id: Option<DrmJobId>,
    status: JobStatus,
    exit_info: Option<ExitInfo>,
    times: JobTimes,
    inputs: Vec<TransferId>,
    outputs: Vec<TransferId>,
    /// Every transfer this job holds a reference on, its own std streams included.
    referenced: BTreeSet<TransferId>,
    stdout_transfer: TransferId,
    stderr_transfer: Option<TransferId>,
    expiration: DateTime<Utc>,
    disposal_requested: bool,
}

impl JobRecord {
    fn ended_with_success(&self) -> bool {
        ended_with_success(self.status, self.exit_info.as_ref())
    }

    fn owned_transfers(&self) -> impl Iterator<Item = TransferId> + '_ {
        std::iter::once(self.stdout_transfer).chain(self.stderr_transfer)
    }

    fn end(&mut self, exit_info: ExitInfo) {
        self.status = JobStatus::Failed;
        self.exit_info = Some(exit_info);
        self.times.ending = Some(Utc::now());
    }

    fn entry(&self, job_id: JobId) -> JobStatusEntry {
        JobStatusEntry { job_id, name: self.job.name.clone(), status: self.status, exit_info: self.exit_info.clone(), times: self.times.clone() }
    }
}

struct WorkflowRecord {
    workflow: Workflow,
    expiration: DateTime<Utc>,
    jobs: BTreeMap<NodeKey, JobId>,
    transfers: BTreeMap<NodeKey, TransferId>,
}

#[derive(Default)]
struct EngineState {
    jobs: BTreeMap<JobId, JobRecord>,
    workflows: BTreeMap<WorkflowId, WorkflowRecord>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failed,
    Pending,
}

/// What a workflow submission created so far, undone if it fails halfway.
#[derive(Default)]
struct Created {
    transfers: Vec<TransferId>,
    jobs: Vec<JobId>,
}

/// The server-side object reached through a `Proxy<WorkflowEngine>`.
///
/// It owns the transfer bookkeeping of one resource and drives jobs through
/// the scheduler: a job is handed to the scheduler only once its input
/// transfers are complete and, inside a workflow, once every predecessor
/// ended with success.
pub struct WorkflowEngine {
    transfers: TransferStore,
    scheduler: Arc<dyn Scheduler>,
    translation: TranslationTable,
    wait_poll: Duration,
    state: Mutex<EngineState>,
    next_job_id: AtomicI64,
    next_workflow_id: AtomicI64,
}

impl WorkflowEngine {
    pub fn new(resource: &ResourceConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        Ok(WorkflowEngine {
            transfers: TransferStore::new(&resource.staging_dir)?,
            scheduler,
            translation: TranslationTable::load(&resource.translation_files),
            wait_poll: resource.wait_poll(),
            state: Mutex::new(EngineState::default()),
            next_job_id: AtomicI64::new(1),
            next_workflow_id: AtomicI64::new(1),
        })
    }

    pub fn transfers(&self) -> &TransferStore {
        &self.transfers
    }

    // ---------------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------------

    async fn create_job(
        &self,
        state: &mut EngineState,
        mut job: Job,
        workflow: Option<(WorkflowId, NodeKey)>,
        node_transfers: &BTreeMap<NodeKey, TransferId>,
    ) -> Result<JobId> {
        if job.command.is_empty() {
            return Err(Error::ValidationError(format!("job '{}' has an empty command", job.name)));
        }

        let mut referenced = BTreeSet::new();
        for reference in job.transfer_refs() {
            let transfer_id = transfer_for(&reference, node_transfers)?;
            if !self.transfers.contains(transfer_id).await {
                return Err(Error::NotFound(format!("transfer {} referenced by job '{}'", transfer_id, job.name)));
            }
            referenced.insert(transfer_id);
        }
        let inputs = job.referenced_input_files.iter().map(|r| transfer_for(r, node_transfers)).collect::<Result<Vec<_>>>()?;
        let outputs = job.referenced_output_files.iter().map(|r| transfer_for(r, node_transfers)).collect::<Result<Vec<_>>>()?;

        let mut command = Vec::with_capacity(job.command.len());
        for arg in &job.command {
            command.push(self.resolve_arg(arg, node_transfers).await?);
        }
        let stdin = self.resolve_path(job.stdin.as_ref(), node_transfers).await?;
        let working_directory = self.resolve_path(job.working_directory.as_ref(), node_transfers).await?;
        let stdout_file = self.resolve_path(job.stdout_file.as_ref(), node_transfers).await?;
        let stderr_file = self.resolve_path(job.stderr_file.as_ref(), node_transfers).await?;

        let job_id = JobId::new(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        let workflow_id = workflow.map(|(id, _)| id);
        let hours = job.disposal_timeout;

        let stdout = self.register_stream(stdout_file, "stdout", job_id, hours, workflow_id).await?;
        let stderr = if job.join_stderrout {
            None
        } else {
            match self.register_stream(stderr_file, "stderr", job_id, hours, workflow_id).await {
                Ok(info) => Some(info),
                Err(e) => {
                    self.transfers.cancel(stdout.id).await?;
                    return Err(e);
                }
            }
        };

        referenced.insert(stdout.id);
        referenced.extend(stderr.as_ref().map(|info| info.id));
        for transfer_id in &referenced {
            self.transfers.add_reference(*transfer_id).await?;
        }

        let description = JobDescription {
            name: job.name.clone(),
            command,
            stdin,
            stdout_file: stdout.local_path.clone(),
            stderr_file: stderr.as_ref().map(|info| info.local_path.clone()),
            working_directory,
            parallel_job_info: job.parallel_job_info.clone(),
        };

        job.job_id = Some(job_id);
        log::info!("Job {} ('{}') created: {:?}", job_id, job.name, description.command);

        let record = JobRecord {
            job,
            workflow,
            description,
            drm_id: None,
            status: JobStatus::NotSubmitted,
            exit_info: None,
            times: JobTimes { submission: Some(Utc::now()), ..JobTimes::default() },
            inputs,
            outputs,
            referenced,
            stdout_transfer: stdout.id,
            stderr_transfer: stderr.map(|info| info.id),
            expiration: Utc::now() + ChronoDuration::hours(i64::from(hours)),
            disposal_requested: false,
        };
        state.jobs.insert(job_id, record);

        Ok(job_id)
    }

    async fn register_stream(
        &self,
        target: Option<PathBuf>,
        stream: &str,
        job_id: JobId,
        hours: u32,
        workflow_id: Option<WorkflowId>,
    ) -> Result<TransferInformation> {
        let remote_path = PathBuf::from(format!("job_{}.{}", job_id, stream));
        match target {
            Some(path) => self.transfers.register_existing(path, remote_path, hours, workflow_id).await,
            None => self.transfers.register_output(stream, remote_path, hours, workflow_id).await,
        }
    }

    async fn resolve_arg(&self, arg: &JobArg, node_transfers: &BTreeMap<NodeKey, TransferId>) -> Result<String> {
        match arg {
            JobArg::Literal(value) => Ok(value.clone()),
            JobArg::Transfer(reference) => {
                let transfer_id = transfer_for(reference, node_transfers)?;
                let info = self.transfers.information(transfer_id).await?;
                Ok(info.local_path.to_string_lossy().into_owned())
            }
            JobArg::Shared(shared) => Ok(self.translation.resolve(shared)?.to_string_lossy().into_owned()),
        }
    }

    async fn resolve_path(&self, arg: Option<&JobArg>, node_transfers: &BTreeMap<NodeKey, TransferId>) -> Result<Option<PathBuf>> {
        match arg {
            Some(arg) => Ok(Some(PathBuf::from(self.resolve_arg(arg, node_transfers).await?))),
            None => Ok(None),
        }
    }

    async fn submit_to_scheduler(&self, job_id: JobId, record: &mut JobRecord) {
        match self.scheduler.submit(record.description.clone()).await {
            Ok(drm_id) => {
                record.drm_id = Some(drm_id);
                record.status = JobStatus::QueuedActive;
                log::info!("Job {} handed to the scheduler as {}", job_id, drm_id);
            }
            Err(e) => {
                log::error!("Job {} could not be submitted: {}", job_id, e);
                record.end(ExitInfo { exit_status: ExitStatus::ExitAborted, ..ExitInfo::not_run() });
            }
        }
    }

    /// Pulls the scheduler state of a submitted job. A job that just ended
    /// with success completes its output transfers.
    async fn refresh(&self, job_id: JobId, record: &mut JobRecord) {
        let Some(drm_id) = record.drm_id else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }

        let status = self.scheduler.status(drm_id).await.unwrap_or(JobStatus::Undetermined);
        if status == record.status {
            return;
        }
        record.status = status;

        if status == JobStatus::Running && record.times.execution.is_none() {
            record.times.execution = Some(Utc::now());
        }
        if !status.is_terminal() {
            return;
        }

        record.exit_info = self.scheduler.exit_information(drm_id).await;
        record.times.ending = Some(Utc::now());
        if record.times.execution.is_none() && record.exit_info.as_ref().is_some_and(|info| info.exit_status != ExitStatus::ExitNotRun) {
            record.times.execution = record.times.ending;
        }
        log::info!("Job {} ended as {} ({:?})", job_id, status, record.exit_info);

        for stream in record.owned_transfers().collect::<Vec<_>>() {
            if let Err(e) = self.transfers.mark_complete(stream).await {
                log::warn!("Std stream transfer {} of job {} not marked complete: {}", stream, job_id, e);
            }
        }
        if record.ended_with_success() {
            for output in &record.outputs {
                if let Err(e) = self.transfers.mark_complete(*output).await {
                    log::warn!("Output transfer {} of job {} not marked complete: {}", output, job_id, e);
                }
            }
        }
    }

    /// `true` once every input transfer of the job holds its whole content.
    async fn inputs_available(&self, record: &JobRecord) -> bool {
        for input in &record.inputs {
            if !self.transfer_available(*input).await {
                return false;
            }
        }
        true
    }

    async fn transfer_available(&self, transfer_id: TransferId) -> bool {
        matches!(self.transfers.status(transfer_id).await, Ok(TransferStatus::Complete)) || self.transfers.retrieval_pending(transfer_id).await
    }

    /// One scheduling pass over every job.
    ///
    /// **Phase 1:** refresh every submitted job from the scheduler.
    /// **Phase 2:** submit standalone jobs whose inputs are complete.
    /// **Phase 3:** walk each workflow in dependency order; submit jobs whose
    /// predecessors all succeeded and whose inputs are complete, and fail,
    /// without running, every job below a failure.
    async fn advance(&self, state: &mut EngineState) {
        let EngineState { jobs, workflows } = state;

        // Phase 1
        for (job_id, record) in jobs.iter_mut() {
            self.refresh(*job_id, record).await;
        }

        // Phase 2
        for (job_id, record) in jobs.iter_mut() {
            if record.workflow.is_some() || record.status != JobStatus::NotSubmitted {
                continue;
            }
            if self.inputs_available(record).await {
                self.submit_to_scheduler(*job_id, record).await;
            }
        }

        // Phase 3
        for (workflow_id, workflow) in workflows.iter() {
            let order = match workflow.workflow.execution_order() {
                Ok(order) => order,
                Err(e) => {
                    log::error!("Workflow {} cannot be ordered: {}", workflow_id, e);
                    continue;
                }
            };

            let mut outcomes: BTreeMap<NodeKey, Outcome> = BTreeMap::new();
            for key in order {
                let predecessors: Vec<Outcome> =
                    workflow.workflow.predecessors(key).iter().map(|p| outcomes.get(p).copied().unwrap_or(Outcome::Pending)).collect();
                let any_failed = predecessors.contains(&Outcome::Failed);
                let all_succeeded = predecessors.iter().all(|outcome| *outcome == Outcome::Success);

                let outcome = match workflow.workflow.node(key) {
                    Some(WorkflowNode::Job(_)) => {
                        let Some(job_id) = workflow.jobs.get(&key).copied() else {
                            outcomes.insert(key, Outcome::Failed);
                            continue;
                        };
                        let Some(record) = jobs.get_mut(&job_id) else {
                            outcomes.insert(key, Outcome::Failed);
                            continue;
                        };

                        if record.status == JobStatus::NotSubmitted {
                            if any_failed {
                                log::info!("Job {} of workflow {} will not run: a predecessor failed", job_id, workflow_id);
                                record.end(ExitInfo::not_run());
                            } else if all_succeeded && self.inputs_available(record).await {
                                self.submit_to_scheduler(job_id, record).await;
                            }
                        }

                        if record.ended_with_success() {
                            Outcome::Success
                        } else if record.status.is_terminal() {
                            Outcome::Failed
                        } else {
                            Outcome::Pending
                        }
                    }
                    Some(WorkflowNode::FileTransfer(_)) => match workflow.transfers.get(&key) {
                        _ if any_failed => Outcome::Failed,
                        Some(transfer_id) => {
                            if self.transfer_available(*transfer_id).await {
                                Outcome::Success
                            } else {
                                Outcome::Pending
                            }
                        }
                        None => Outcome::Pending,
                    },
                    None => Outcome::Pending,
                };
                outcomes.insert(key, outcome);
            }
        }
    }

    async fn job_status(&self, job_id: JobId) -> Result<JobStatus> {
        let mut state = self.state.lock().await;
        self.advance(&mut state).await;
        state.jobs.get(&job_id).map(|record| record.status).ok_or_else(|| job_not_found(job_id))
    }

    async fn exit_information(&self, job_id: JobId) -> Result<Option<ExitInfo>> {
        let mut state = self.state.lock().await;
        self.advance(&mut state).await;
        state.jobs.get(&job_id).map(|record| record.exit_info.clone()).ok_or_else(|| job_not_found(job_id))
    }

    async fn wait(&self, job_ids: &[JobId], timeout_secs: i64) -> Result<()> {
        let started = Instant::now();
        loop {
            let finished = {
                let mut state = self.state.lock().await;
                if let Some(unknown) = job_ids.iter().find(|id| !state.jobs.contains_key(*id)) {
                    return Err(job_not_found(*unknown));
                }
                self.advance(&mut state).await;
                job_ids.iter().all(|id| state.jobs.get(id).is_none_or(|record| record.status.is_terminal()))
            };

            if finished || timeout_secs == 0 {
                return Ok(());
            }
            if timeout_secs > 0 && started.elapsed() >= Duration::from_secs(timeout_secs.unsigned_abs()) {
                return Ok(());
            }
            tokio::time::sleep(self.wait_poll).await;
        }
    }

    async fn stop_job(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state.jobs.get_mut(&job_id).ok_or_else(|| job_not_found(job_id))?;
        match record.drm_id {
            Some(drm_id) => self.scheduler.stop(drm_id).await?,
            None if record.status == JobStatus::NotSubmitted => record.status = JobStatus::UserOnHold,
            None => {}
        }
        self.advance(&mut state).await;
        Ok(())
    }

    async fn restart_job(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state.jobs.get_mut(&job_id).ok_or_else(|| job_not_found(job_id))?;
        match record.drm_id {
            Some(drm_id) => self.scheduler.restart(drm_id).await?,
            None if record.status == JobStatus::UserOnHold => record.status = JobStatus::NotSubmitted,
            None => {}
        }
        self.advance(&mut state).await;
        Ok(())
    }

    async fn kill_job(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state.jobs.get_mut(&job_id).ok_or_else(|| job_not_found(job_id))?;
        match record.drm_id {
            Some(drm_id) => self.scheduler.kill(drm_id).await?,
            None if !record.status.is_terminal() => record.end(ExitInfo { exit_status: ExitStatus::UserKilled, ..ExitInfo::not_run() }),
            None => {}
        }
        Ok(())
    }

    /// Disposes a job, or defers it while one of its std streams is still
    /// being retrieved. Returns `true` when the job was removed now.
    async fn dispose_job(&self, state: &mut EngineState, job_id: JobId) -> Result<bool> {
        let record = state.jobs.get_mut(&job_id).ok_or_else(|| job_not_found(job_id))?;

        for stream in record.owned_transfers().collect::<Vec<_>>() {
            if self.transfers.retrieval_pending(stream).await {
                if !record.disposal_requested {
                    log::info!("Disposal of job {} deferred: transfer {} is being retrieved", job_id, stream);
                }
                record.disposal_requested = true;
                return Ok(false);
            }
        }

        let Some(record) = state.jobs.remove(&job_id) else {
            return Ok(false);
        };
        if let Some(drm_id) = record.drm_id {
            if let Err(e) = self.scheduler.dispose(drm_id).await {
                log::warn!("Scheduler could not dispose job {} ({}): {}", job_id, drm_id, e);
            }
        }
        for transfer_id in &record.referenced {
            if let Err(e) = self.transfers.release_reference(*transfer_id).await {
                log::warn!("Releasing transfer {} held by job {} failed: {}", transfer_id, job_id, e);
            }
        }
        for stream in record.owned_transfers() {
            match self.transfers.cancel(stream).await {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => log::warn!("Std stream transfer {} of job {} not disposed: {}", stream, job_id, e),
            }
        }

        log::info!("Job {} disposed", job_id);
        Ok(true)
    }

    async fn std_transfer(&self, job_id: JobId, stderr: bool) -> Result<Option<TransferId>> {
        let state = self.state.lock().await;
        let record = state.jobs.get(&job_id).ok_or_else(|| job_not_found(job_id))?;
        Ok(if stderr { record.stderr_transfer } else { Some(record.stdout_transfer) })
    }

    // ---------------------------------------------------------------------
    // Workflows
    // ---------------------------------------------------------------------

    /// Validates the workflow, registers its transfers and creates its jobs.
    /// On any failure everything created for it is disposed again.
    async fn submit_workflow(&self, mut workflow: Workflow, expiration_date: Option<DateTime<Utc>>, name: Option<String>) -> Result<Workflow> {
        workflow.compute_closure()?;
        let order = workflow.execution_order()?;

        let workflow_id = WorkflowId::new(self.next_workflow_id.fetch_add(1, Ordering::SeqCst));
        let expiration = expiration_date
            .or(workflow.expiration_date)
            .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(i64::from(DEFAULT_DISPOSAL_TIMEOUT_HOURS)));
        if name.is_some() {
            workflow.name = name;
        }
        workflow.id = Some(workflow_id);
        workflow.expiration_date = Some(expiration);

        let mut state = self.state.lock().await;
        let mut created = Created::default();

        let nodes = match self.create_workflow_nodes(&mut state, &mut workflow, workflow_id, expiration, &order, &mut created).await {
            Ok(nodes) => nodes,
            Err(e) => {
                log::error!("Workflow submission failed, rolling back: {}", e);
                for job_id in created.jobs {
                    let _ = self.dispose_job(&mut state, job_id).await;
                }
                for transfer_id in created.transfers {
                    let _ = self.transfers.cancel(transfer_id).await;
                }
                return Err(e);
            }
        };

        let (jobs, transfers) = nodes;
        log::info!("Workflow {} submitted: {} job(s), {} transfer(s)", workflow_id, jobs.len(), transfers.len());

        let submitted = workflow.clone();
        state.workflows.insert(workflow_id, WorkflowRecord { workflow, expiration, jobs, transfers });
        self.advance(&mut state).await;

        Ok(submitted)
    }

    async fn create_workflow_nodes(
        &self,
        state: &mut EngineState,
        workflow: &mut Workflow,
        workflow_id: WorkflowId,
        expiration: DateTime<Utc>,
        order: &[NodeKey],
        created: &mut Created,
    ) -> Result<(BTreeMap<NodeKey, JobId>, BTreeMap<NodeKey, TransferId>)> {
        // Phase 1: transfers
        let mut transfers = BTreeMap::new();
        for key in order {
            let Some(transfer) = workflow.transfer_mut(*key) else {
                continue;
            };
            let transfer_id = match transfer.transfer_id {
                Some(transfer_id) => {
                    self.transfers.set_workflow(transfer_id, workflow_id).await?;
                    transfer_id
                }
                None => {
                    let info = match &transfer.temporary {
                        Some(temporary) => self.transfers.register_temporary(temporary, transfer.disposal_timeout, Some(workflow_id)).await?,
                        None => {
                            self.transfers
                                .register(transfer.remote_path.clone(), transfer.disposal_timeout, transfer.remote_paths.clone(), Some(workflow_id))
                                .await?
                        }
                    };
                    created.transfers.push(info.id);
                    transfer.transfer_id = Some(info.id);
                    info.id
                }
            };
            self.transfers.set_expiration(transfer_id, expiration).await?;
            transfers.insert(*key, transfer_id);
        }

        // Phase 2: jobs
        let mut jobs = BTreeMap::new();
        for key in order {
            let Some(job) = workflow.job(*key).cloned() else {
                continue;
            };
            let job_id = self.create_job(state, job, Some((workflow_id, *key)), &transfers).await?;
            created.jobs.push(job_id);
            if let Some(record) = state.jobs.get_mut(&job_id) {
                record.expiration = expiration;
            }
            if let Some(job) = workflow.job_mut(*key) {
                job.job_id = Some(job_id);
            }
            jobs.insert(*key, job_id);
        }

        Ok((jobs, transfers))
    }

    async fn workflow_status(&self, workflow_id: WorkflowId) -> Result<WorkflowStatusReport> {
        let mut state = self.state.lock().await;
        self.advance(&mut state).await;

        let record = state.workflows.get(&workflow_id).ok_or_else(|| workflow_not_found(workflow_id))?;

        let jobs: Vec<JobStatusEntry> =
            record.jobs.values().filter_map(|job_id| state.jobs.get(job_id).map(|job| job.entry(*job_id))).collect();

        let mut transfers = Vec::with_capacity(record.transfers.len());
        for transfer_id in record.transfers.values() {
            let Ok(info) = self.transfers.information(*transfer_id).await else {
                continue;
            };
            transfers.push(TransferStatusEntry {
                info,
                status: self.transfers.status(*transfer_id).await?,
                action: self.transfers.action_info(*transfer_id).await?,
                progress: self.transfers.progress(*transfer_id).await.ok(),
            });
        }

        let status = if jobs.iter().all(|job| job.status.is_terminal()) {
            WorkflowStatus::Done
        } else if jobs.iter().all(|job| matches!(job.status, JobStatus::NotSubmitted | JobStatus::UserOnHold)) {
            WorkflowStatus::NotStarted
        } else {
            WorkflowStatus::InProgress
        };

        Ok(WorkflowStatusReport { workflow_id, jobs, transfers, status })
    }

    /// Resubmits every job that did not end with success. Only allowed once
    /// every job of the workflow reached a terminal state.
    async fn restart_workflow(&self, workflow_id: WorkflowId) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.advance(&mut state).await;

        let EngineState { jobs, workflows } = &mut *state;
        let record = workflows.get(&workflow_id).ok_or_else(|| workflow_not_found(workflow_id))?;
        let job_ids: Vec<JobId> = record.jobs.values().copied().collect();

        if job_ids.iter().filter_map(|id| jobs.get(id)).any(|job| !job.status.is_terminal()) {
            return Err(Error::ValidationError(format!("workflow {} is still running", workflow_id)));
        }

        let mut restarted = 0;
        for job_id in job_ids {
            let Some(job) = jobs.get_mut(&job_id) else {
                continue;
            };
            if job.ended_with_success() {
                continue;
            }
            if let Some(drm_id) = job.drm_id.take() {
                if let Err(e) = self.scheduler.dispose(drm_id).await {
                    log::warn!("Scheduler could not dispose job {} ({}): {}", job_id, drm_id, e);
                }
            }
            job.status = JobStatus::NotSubmitted;
            job.exit_info = None;
            job.times = JobTimes { submission: Some(Utc::now()), ..JobTimes::default() };
            restarted += 1;
        }

        log::info!("Workflow {} restarted: {} job(s) resubmitted", workflow_id, restarted);
        self.advance(&mut state).await;
        Ok(restarted)
    }

    async fn stop_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        let mut state = self.state.lock().await;
        let EngineState { jobs, workflows } = &mut *state;
        let record = workflows.get(&workflow_id).ok_or_else(|| workflow_not_found(workflow_id))?;

        for job_id in record.jobs.values() {
            let Some(job) = jobs.get_mut(job_id) else {
                continue;
            };
            match job.drm_id {
                Some(drm_id) if !job.status.is_terminal() => {
                    if let Err(e) = self.scheduler.kill(drm_id).await {
                        log::warn!("Could not kill job {}: {}", job_id, e);
                    }
                }
                None if !job.status.is_terminal() => job.end(ExitInfo::not_run()),
                _ => {}
            }
        }

        log::info!("Workflow {} stopped", workflow_id);
        self.advance(&mut state).await;
        Ok(())
    }

    async fn change_workflow_expiration(&self, workflow_id: WorkflowId, expiration: DateTime<Utc>) -> Result<()> {
        if expiration < Utc::now() {
            return Err(Error::ValidationError(format!("expiration date {} of workflow {} is in the past", expiration, workflow_id)));
        }

        let mut state = self.state.lock().await;
        let EngineState { jobs, workflows } = &mut *state;
        let record = workflows.get_mut(&workflow_id).ok_or_else(|| workflow_not_found(workflow_id))?;

        record.expiration = expiration;
        record.workflow.expiration_date = Some(expiration);
        for job_id in record.jobs.values() {
            if let Some(job) = jobs.get_mut(job_id) {
                job.expiration = expiration;
            }
        }
        for transfer_id in record.transfers.values() {
            if let Err(e) = self.transfers.set_expiration(*transfer_id, expiration).await {
                log::warn!("Expiration of transfer {} not changed: {}", transfer_id, e);
            }
        }
        Ok(())
    }

    /// Disposes every job of the workflow first, then its transfers; each
    /// disposal may be deferred by the usual rules.
    async fn dispose_workflow(&self, state: &mut EngineState, workflow_id: WorkflowId) -> Result<()> {
        let record = state.workflows.remove(&workflow_id).ok_or_else(|| workflow_not_found(workflow_id))?;

        for job_id in record.jobs.values() {
            match self.dispose_job(state, *job_id).await {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => log::warn!("Job {} of workflow {} not disposed: {}", job_id, workflow_id, e),
            }
        }
        for transfer_id in record.transfers.values() {
            match self.transfers.cancel(*transfer_id).await {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => log::warn!("Transfer {} of workflow {} not disposed: {}", transfer_id, workflow_id, e),
            }
        }

        log::info!("Workflow {} disposed", workflow_id);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Housekeeping
    // ---------------------------------------------------------------------

    /// Advances every job, completes deferred disposals and disposes expired
    /// workflows, jobs and transfers.
    pub async fn housekeeping(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        self.advance(&mut state).await;

        let expired_workflows: Vec<WorkflowId> =
            state.workflows.iter().filter(|(_, record)| record.expiration < now).map(|(id, _)| *id).collect();
        for workflow_id in expired_workflows {
            if let Err(e) = self.dispose_workflow(&mut state, workflow_id).await {
                log::warn!("Expired workflow {} not disposed: {}", workflow_id, e);
            }
        }

        let due_jobs: Vec<JobId> = state
            .jobs
            .iter()
            .filter(|(_, record)| record.disposal_requested || (record.workflow.is_none() && record.expiration < now))
            .map(|(id, _)| *id)
            .collect();
        for job_id in due_jobs {
            if let Err(e) = self.dispose_job(&mut state, job_id).await {
                log::warn!("Job {} not disposed: {}", job_id, e);
            }
        }
        drop(state);

        let expired = self.transfers.expire(now).await;
        if !expired.is_empty() {
            log::info!("Housekeeping removed {} expired transfer(s)", expired.len());
        }
    }

    pub fn spawn_housekeeping(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                engine.housekeeping(Utc::now()).await;
            }
        })
    }
}

fn transfer_for(reference: &TransferRef, node_transfers: &BTreeMap<NodeKey, TransferId>) -> Result<TransferId> {
    match reference {
        TransferRef::Registered(transfer_id) => Ok(*transfer_id),
        TransferRef::Node(key) => node_transfers
            .get(key)
            .copied()
            .ok_or_else(|| Error::ValidationError(format!("node {:?} is not a transfer of this workflow", key))),
    }
}

fn job_not_found(job_id: JobId) -> Error {
    Error::NotFound(format!("job {}", job_id))
}

fn workflow_not_found(workflow_id: WorkflowId) -> Error {
    Error::NotFound(format!("workflow {}", workflow_id))
}

#[async_trait]
impl RemoteObject for WorkflowEngine {
    const TYPE_NAME: &'static str = "WorkflowEngine";

    type Call = EngineCall;
    type Reply = EngineReply;

    async fn handle(&self, call: EngineCall) -> Result<EngineReply> {
        let reply = match call {
            EngineCall::RegisterTransfer { remote_path, disposal_timeout, remote_paths } => {
                EngineReply::TransferInformation(self.transfers.register(remote_path, disposal_timeout, remote_paths, None).await?)
            }
            EngineCall::TransferInformation { transfer_id } => EngineReply::TransferInformation(self.transfers.information(transfer_id).await?),
            EngineCall::TransferStatus { transfer_id } => EngineReply::TransferStatus(self.transfers.status(transfer_id).await?),
            EngineCall::TransferActionInfo { transfer_id } => EngineReply::TransferAction(self.transfers.action_info(transfer_id).await?),
            EngineCall::InitializeSending { transfer_id, manifest } => {
                EngineReply::SendingAction(self.transfers.initialize_sending(transfer_id, manifest).await?)
            }
            EngineCall::SendPiece { transfer_id, relative_path, offset, data } => {
                EngineReply::PieceAck(self.transfers.send_piece(transfer_id, relative_path, offset, data).await?)
            }
            EngineCall::InitializeRetrieving { transfer_id } => EngineReply::RetrievalPlan(self.transfers.initialize_retrieving(transfer_id).await?),
            EngineCall::RetrievePiece { transfer_id, relative_path, offset, length } => {
                EngineReply::Piece(self.transfers.retrieve_piece(transfer_id, relative_path, offset, length).await?)
            }
            EngineCall::TransferProgress { transfer_id } => EngineReply::TransferProgress(self.transfers.progress(transfer_id).await?),
            EngineCall::CancelTransfer { transfer_id } => EngineReply::Disposed(self.transfers.cancel(transfer_id).await?),
            EngineCall::Transfers => EngineReply::TransferList(self.transfers.all_information().await),

            EngineCall::SubmitJob { job } => {
                let mut state = self.state.lock().await;
                let job_id = self.create_job(&mut state, job, None, &BTreeMap::new()).await?;
                self.advance(&mut state).await;
                EngineReply::JobId(job_id)
            }
            EngineCall::JobStatus { job_id } => EngineReply::JobStatus(self.job_status(job_id).await?),
            EngineCall::ExitInformation { job_id } => EngineReply::ExitInformation(self.exit_information(job_id).await?),
            EngineCall::Wait { job_ids, timeout_secs } => {
                self.wait(&job_ids, timeout_secs).await?;
                EngineReply::Done
            }
            EngineCall::StopJob { job_id } => {
                self.stop_job(job_id).await?;
                EngineReply::Done
            }
            EngineCall::RestartJob { job_id } => {
                self.restart_job(job_id).await?;
                EngineReply::Done
            }
            EngineCall::KillJob { job_id } => {
                self.kill_job(job_id).await?;
                EngineReply::Done
            }
            EngineCall::DisposeJob { job_id } => {
                let mut state = self.state.lock().await;
                EngineReply::Disposed(self.dispose_job(&mut state, job_id).await?)
            }
            EngineCall::Jobs => EngineReply::JobList(self.state.lock().await.jobs.keys().copied().collect()),
            EngineCall::StdoutTransfer { job_id } => EngineReply::TransferId(self.std_transfer(job_id, false).await?),
            EngineCall::StderrTransfer { job_id } => EngineReply::TransferId(self.std_transfer(job_id, true).await?),

            EngineCall::SubmitWorkflow { workflow, expiration_date, name } => {
                EngineReply::Workflow(Box::new(self.submit_workflow(workflow, expiration_date, name).await?))
            }
            EngineCall::SubmittedWorkflow { workflow_id } => {
                let state = self.state.lock().await;
                let record = state.workflows.get(&workflow_id).ok_or_else(|| workflow_not_found(workflow_id))?;
                EngineReply::Workflow(Box::new(record.workflow.clone()))
            }
            EngineCall::WorkflowStatus { workflow_id } => EngineReply::WorkflowStatus(self.workflow_status(workflow_id).await?),
            EngineCall::RestartWorkflow { workflow_id } => EngineReply::Count(self.restart_workflow(workflow_id).await?),
            EngineCall::StopWorkflow { workflow_id } => {
                self.stop_workflow(workflow_id).await?;
                EngineReply::Done
            }
            EngineCall::ChangeWorkflowExpiration { workflow_id, expiration_date } => {
                self.change_workflow_expiration(workflow_id, expiration_date).await?;
                EngineReply::Done
            }
            EngineCall::DisposeWorkflow { workflow_id } => {
                let mut state = self.state.lock().await;
                self.dispose_workflow(&mut state, workflow_id).await?;
                EngineReply::Done
            }
            EngineCall::Workflows => {
                let state = self.state.lock().await;
                let summaries = state
                    .workflows
                    .iter()
                    .map(|(id, record)| WorkflowSummary { id: *id, name: record.workflow.name.clone(), expiration_date: record.expiration })
                    .collect();
                EngineReply::WorkflowList(summaries)
            }
        };
        Ok(reply)
    }
}
