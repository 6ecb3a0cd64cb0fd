use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::remote_object::object_server::RemoteCall;
use crate::domain::transfer::transfer_action::{
    PieceAck, RetrievalPlan, SendingManifest, TransferAction, TransferInformation, TransferProgress, TransferStatus,
};
use crate::domain::utils::id::{JobId, TransferId, WorkflowId};
use crate::domain::workflow::status::{ExitInfo, JobStatus, WorkflowStatusReport};
use crate::domain::workflow::workflow::Workflow;
use crate::domain::workflow::workflow_node::Job;

/// Every operation a [`WorkflowEngine`](super::workflow_engine::WorkflowEngine) accepts.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum EngineCall {
    // Transfers
    RegisterTransfer { remote_path: PathBuf, disposal_timeout: u32, remote_paths: Option<Vec<PathBuf>> },
    TransferInformation { transfer_id: TransferId },
    TransferStatus { transfer_id: TransferId },
    TransferActionInfo { transfer_id: TransferId },
    InitializeSending { transfer_id: TransferId, manifest: SendingManifest },
    SendPiece { transfer_id: TransferId, relative_path: Option<String>, offset: u64, data: Vec<u8> },
    InitializeRetrieving { transfer_id: TransferId },
    RetrievePiece { transfer_id: TransferId, relative_path: Option<String>, offset: u64, length: usize },
    TransferProgress { transfer_id: TransferId },
    CancelTransfer { transfer_id: TransferId },
    Transfers,

    // Jobs
    SubmitJob { job: Job },
    JobStatus { job_id: JobId },
    ExitInformation { job_id: JobId },
    /// `timeout_secs < 0` waits indefinitely, `0` checks once.
    Wait { job_ids: Vec<JobId>, timeout_secs: i64 },
    StopJob { job_id: JobId },
    RestartJob { job_id: JobId },
    KillJob { job_id: JobId },
    DisposeJob { job_id: JobId },
    Jobs,
    StdoutTransfer { job_id: JobId },
    StderrTransfer { job_id: JobId },

    // Workflows
    SubmitWorkflow { workflow: Workflow, expiration_date: Option<DateTime<Utc>>, name: Option<String> },
    SubmittedWorkflow { workflow_id: WorkflowId },
    WorkflowStatus { workflow_id: WorkflowId },
    RestartWorkflow { workflow_id: WorkflowId },
    StopWorkflow { workflow_id: WorkflowId },
    ChangeWorkflowExpiration { workflow_id: WorkflowId, expiration_date: DateTime<Utc> },
    DisposeWorkflow { workflow_id: WorkflowId },
    Workflows,
}

impl RemoteCall for EngineCall {
    fn method_name(&self) -> &'static str {
        match self {
            EngineCall::RegisterTransfer { .. } => "register_transfer",
            EngineCall::TransferInformation { .. } => "transfer_information",
            EngineCall::TransferStatus { .. } => "transfer_status",
            EngineCall::TransferActionInfo { .. } => "transfer_action_info",
            EngineCall::InitializeSending { .. } => "initialize_sending",
            EngineCall::SendPiece { .. } => "send_piece",
            EngineCall::InitializeRetrieving { .. } => "initialize_retrieving",
            EngineCall::RetrievePiece { .. } => "retrieve_piece",
            EngineCall::TransferProgress { .. } => "transfer_progress",
            EngineCall::CancelTransfer { .. } => "cancel_transfer",
            EngineCall::Transfers => "transfers",
            EngineCall::SubmitJob { .. } => "submit_job",
            EngineCall::JobStatus { .. } => "job_status",
            EngineCall::ExitInformation { .. } => "exit_information",
            EngineCall::Wait { .. } => "wait",
            EngineCall::StopJob { .. } => "stop_job",
            EngineCall::RestartJob { .. } => "restart_job",
            EngineCall::KillJob { .. } => "kill_job",
            EngineCall::DisposeJob { .. } => "dispose_job",
            EngineCall::Jobs => "jobs",
            EngineCall::StdoutTransfer { .. } => "stdout_transfer",
            EngineCall::StderrTransfer { .. } => "stderr_transfer",
            EngineCall::SubmitWorkflow { .. } => "submit_workflow",
            EngineCall::SubmittedWorkflow { .. } => "submitted_workflow",
            EngineCall::WorkflowStatus { .. } => "workflow_status",
            EngineCall::RestartWorkflow { .. } => "restart_workflow",
            EngineCall::StopWorkflow { .. } => "stop_workflow",
            EngineCall::ChangeWorkflowExpiration { .. } => "change_workflow_expiration",
            EngineCall::DisposeWorkflow { .. } => "dispose_workflow",
            EngineCall::Workflows => "workflows",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: Option<String>,
    pub expiration_date: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum EngineReply {
    Done,
    Disposed(bool),
    Count(usize),
    TransferInformation(TransferInformation),
    TransferList(Vec<TransferInformation>),
    TransferStatus(TransferStatus),
    TransferAction(Option<TransferAction>),
    SendingAction(TransferAction),
    PieceAck(PieceAck),
    RetrievalPlan(RetrievalPlan),
    Piece(Vec<u8>),
    TransferProgress(TransferProgress),
    TransferId(Option<TransferId>),
    JobId(JobId),
    JobList(Vec<JobId>),
    JobStatus(JobStatus),
    ExitInformation(Option<ExitInfo>),
    Workflow(Box<Workflow>),
    WorkflowStatus(WorkflowStatusReport),
    WorkflowList(Vec<WorkflowSummary>),
}

/// Unwraps the expected [`EngineReply`] variant, turning any other variant
/// into a protocol error.
macro_rules! expect_reply {
    ($reply:expr, $variant:ident) => {
        match $reply {
            $crate::domain::engine::calls::EngineReply::$variant(value) => Ok(value),
            other => Err($crate::error::Error::ProtocolError(format!("expected {} reply, got {:?}", stringify!($variant), other))),
        }
    };
}

pub(crate) use expect_reply;
