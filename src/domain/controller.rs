use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::domain::engine::calls::{EngineCall, EngineReply, WorkflowSummary, expect_reply};
use crate::domain::engine::workflow_engine::WorkflowEngine;
use crate::domain::remote_object::proxy::Proxy;
use crate::domain::transfer::transfer_action::TransferInformation;
use crate::domain::transfer::transfer_manager::{TransferManager, retrieval_progress};
use crate::domain::utils::id::{JobId, TransferId, WorkflowId};
use crate::domain::workflow::status::{ExitInfo, JobStatus, WorkflowStatusReport};
use crate::domain::workflow::workflow::Workflow;
use crate::domain::workflow::workflow_node::Job;
use crate::error::{Error, Result};

/// Submitting-side facade over one engine.
///
/// Every operation is one call through the shared [`Proxy`]; transfers go
/// through the embedded [`TransferManager`].
pub struct WorkflowController {
    proxy: Arc<Proxy<WorkflowEngine>>,
    transfers: TransferManager,
}

impl WorkflowController {
    /// Builds a controller for the engine behind `handle`
    /// (`WorkflowEngine:<instance>:<port>`). Nothing is sent until the first call.
    pub fn connect(handle: &str, config: &ClientConfig) -> Result<Self> {
        let proxy = Arc::new(Proxy::from_handle_str(handle, config)?);
        let transfers = TransferManager::new(Arc::clone(&proxy), config.chunk_size);
        Ok(WorkflowController { proxy, transfers })
    }

    pub fn proxy(&self) -> &Proxy<WorkflowEngine> {
        &self.proxy
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    async fn call_done(&self, call: EngineCall) -> Result<()> {
        match self.proxy.call(call).await? {
            EngineReply::Done => Ok(()),
            other => Err(Error::ProtocolError(format!("expected Done reply, got {:?}", other))),
        }
    }

    // Jobs

    pub async fn submit_job(&self, job: Job) -> Result<JobId> {
        expect_reply!(self.proxy.call(EngineCall::SubmitJob { job }).await?, JobId)
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatus> {
        expect_reply!(self.proxy.call(EngineCall::JobStatus { job_id }).await?, JobStatus)
    }

    pub async fn exit_information(&self, job_id: JobId) -> Result<Option<ExitInfo>> {
        expect_reply!(self.proxy.call(EngineCall::ExitInformation { job_id }).await?, ExitInformation)
    }

    /// `timeout_secs < 0` waits until every job ended, `0` checks once.
    pub async fn wait(&self, job_ids: &[JobId], timeout_secs: i64) -> Result<()> {
        self.call_done(EngineCall::Wait { job_ids: job_ids.to_vec(), timeout_secs }).await
    }

    pub async fn stop_job(&self, job_id: JobId) -> Result<()> {
        self.call_done(EngineCall::StopJob { job_id }).await
    }

    pub async fn restart_job(&self, job_id: JobId) -> Result<()> {
        self.call_done(EngineCall::RestartJob { job_id }).await
    }

    pub async fn kill_job(&self, job_id: JobId) -> Result<()> {
        self.call_done(EngineCall::KillJob { job_id }).await
    }

    /// `false` when the job still has a std stream being retrieved; the
    /// engine disposes it once that retrieval ends.
    pub async fn dispose_job(&self, job_id: JobId) -> Result<bool> {
        expect_reply!(self.proxy.call(EngineCall::DisposeJob { job_id }).await?, Disposed)
    }

    pub async fn jobs(&self) -> Result<Vec<JobId>> {
        expect_reply!(self.proxy.call(EngineCall::Jobs).await?, JobList)
    }

    pub async fn stdout_transfer(&self, job_id: JobId) -> Result<TransferId> {
        expect_reply!(self.proxy.call(EngineCall::StdoutTransfer { job_id }).await?, TransferId)?
            .ok_or_else(|| Error::NotFound(format!("stdout of job {}", job_id)))
    }

    /// `None` when the job joins stderr into stdout.
    pub async fn stderr_transfer(&self, job_id: JobId) -> Result<Option<TransferId>> {
        expect_reply!(self.proxy.call(EngineCall::StderrTransfer { job_id }).await?, TransferId)
    }

    pub async fn retrieve_stdout(&self, job_id: JobId, target: impl Into<PathBuf>) -> Result<()> {
        let transfer_id = self.stdout_transfer(job_id).await?;
        self.transfers.retrieve_as(transfer_id, target).await
    }

    pub async fn retrieve_stderr(&self, job_id: JobId, target: impl Into<PathBuf>) -> Result<()> {
        let transfer_id =
            self.stderr_transfer(job_id).await?.ok_or_else(|| Error::NotFound(format!("stderr of job {} (joined into stdout)", job_id)))?;
        self.transfers.retrieve_as(transfer_id, target).await
    }

    pub async fn registered_transfers(&self) -> Result<Vec<TransferInformation>> {
        expect_reply!(self.proxy.call(EngineCall::Transfers).await?, TransferList)
    }

    // Workflows

    /// Returns the workflow as accepted by the engine, with every job and
    /// transfer node carrying its assigned id.
    pub async fn submit_workflow(&self, workflow: Workflow, expiration_date: Option<DateTime<Utc>>, name: Option<String>) -> Result<Workflow> {
        let reply = self.proxy.call(EngineCall::SubmitWorkflow { workflow, expiration_date, name }).await?;
        expect_reply!(reply, Workflow).map(|workflow| *workflow)
    }

    pub async fn submitted_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        expect_reply!(self.proxy.call(EngineCall::SubmittedWorkflow { workflow_id }).await?, Workflow).map(|workflow| *workflow)
    }

    /// Status of every node in one round trip. Progress of transfers being
    /// retrieved to this host is taken from the local files instead.
    pub async fn workflow_status(&self, workflow_id: WorkflowId) -> Result<WorkflowStatusReport> {
        let mut report = expect_reply!(self.proxy.call(EngineCall::WorkflowStatus { workflow_id }).await?, WorkflowStatus)?;

        for entry in &mut report.transfers {
            let Some(action) = entry.action.as_ref().filter(|action| !action.is_sending()) else {
                continue;
            };
            if let Some(progress) = self.transfers.local_progress(entry.info.id).or_else(|| retrieval_progress(&entry.info.remote_path, action)) {
                entry.progress = Some(progress);
            }
        }
        Ok(report)
    }

    /// Resubmits the jobs that did not succeed; returns how many.
    pub async fn restart_workflow(&self, workflow_id: WorkflowId) -> Result<usize> {
        expect_reply!(self.proxy.call(EngineCall::RestartWorkflow { workflow_id }).await?, Count)
    }

    pub async fn stop_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        self.call_done(EngineCall::StopWorkflow { workflow_id }).await
    }

    pub async fn change_workflow_expiration(&self, workflow_id: WorkflowId, expiration_date: DateTime<Utc>) -> Result<()> {
        self.call_done(EngineCall::ChangeWorkflowExpiration { workflow_id, expiration_date }).await
    }

    pub async fn dispose_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        self.call_done(EngineCall::DisposeWorkflow { workflow_id }).await
    }

    pub async fn workflows(&self) -> Result<Vec<WorkflowSummary>> {
        expect_reply!(self.proxy.call(EngineCall::Workflows).await?, WorkflowList)
    }
}
