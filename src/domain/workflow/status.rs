use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::transfer::transfer_action::{TransferAction, TransferInformation, TransferProgress, TransferStatus};
use crate::domain::utils::id::{JobId, WorkflowId};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    NotSubmitted,
    Undetermined,
    QueuedActive,
    UserOnHold,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::NotSubmitted => "not_submitted",
            JobStatus::Undetermined => "undetermined",
            JobStatus::QueuedActive => "queued_active",
            JobStatus::UserOnHold => "user_on_hold",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    FinishedRegularly,
    ExitAborted,
    FinishedTermSig,
    FinishedUnclearConditions,
    UserKilled,
    ExitNotRun,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_status: ExitStatus,
    pub exit_value: Option<i32>,
    pub term_signal: Option<i32>,
    pub resource_usage: Option<String>,
}

impl ExitInfo {
    pub fn not_run() -> Self {
        ExitInfo { exit_status: ExitStatus::ExitNotRun, exit_value: None, term_signal: None, resource_usage: None }
    }

    pub fn finished(exit_value: i32) -> Self {
        ExitInfo { exit_status: ExitStatus::FinishedRegularly, exit_value: Some(exit_value), term_signal: None, resource_usage: None }
    }
}

/// `Done`, finished regularly, exit value 0.
pub fn ended_with_success(status: JobStatus, exit_info: Option<&ExitInfo>) -> bool {
    status == JobStatus::Done
        && exit_info.is_some_and(|info| info.exit_status == ExitStatus::FinishedRegularly && info.exit_value == Some(0))
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowStatus {
    NotStarted,
    InProgress,
    Done,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTimes {
    pub submission: Option<DateTime<Utc>>,
    pub execution: Option<DateTime<Utc>>,
    pub ending: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobStatusEntry {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub exit_info: Option<ExitInfo>,
    pub times: JobTimes,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferStatusEntry {
    pub info: TransferInformation,
    pub status: TransferStatus,
    pub action: Option<TransferAction>,
    /// Engine-held counters. For a retrieval the submitting side replaces
    /// them with what it finds on its own filesystem.
    pub progress: Option<TransferProgress>,
}

/// Everything about a workflow's nodes, answered in one round trip.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStatusReport {
    pub workflow_id: WorkflowId,
    pub jobs: Vec<JobStatusEntry>,
    pub transfers: Vec<TransferStatusEntry>,
    pub status: WorkflowStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_requires_zero_exit_value() {
        assert!(ended_with_success(JobStatus::Done, Some(&ExitInfo::finished(0))));
        assert!(!ended_with_success(JobStatus::Done, Some(&ExitInfo::finished(1))));
        assert!(!ended_with_success(JobStatus::Failed, Some(&ExitInfo::finished(0))));
        assert!(!ended_with_success(JobStatus::Done, None));
        assert!(!ended_with_success(JobStatus::Done, Some(&ExitInfo::not_run())));
    }
}
