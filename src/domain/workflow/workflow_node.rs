use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::config::DEFAULT_DISPOSAL_TIMEOUT_HOURS;
use crate::domain::utils::id::{JobId, TransferId};

new_key_type! {
    /// Key of a node inside one workflow's arena.
    pub struct NodeKey;
}

/// A file identified independently of the host it lives on. Resolved to an
/// absolute path on the resource when the referencing job is submitted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SharedResourcePath {
    pub namespace: String,
    pub uuid: String,
    pub relative_path: String,
}

impl SharedResourcePath {
    pub fn new(namespace: impl Into<String>, uuid: impl Into<String>, relative_path: impl Into<String>) -> Self {
        SharedResourcePath { namespace: namespace.into(), uuid: uuid.into(), relative_path: relative_path.into() }
    }
}

impl fmt::Display for SharedResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.namespace, self.uuid, self.relative_path)
    }
}

/// Reference from a job to a transfer: a node of the same workflow, or a
/// transfer registered on its own beforehand.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferRef {
    Node(NodeKey),
    Registered(TransferId),
}

/// One element of a job command line (or of its stdin/stdout/stderr targets).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum JobArg {
    Literal(String),
    /// Replaced by the engine-side path of the transfer.
    Transfer(TransferRef),
    Shared(SharedResourcePath),
}

impl From<&str> for JobArg {
    fn from(value: &str) -> Self {
        JobArg::Literal(value.to_string())
    }
}

impl From<String> for JobArg {
    fn from(value: String) -> Self {
        JobArg::Literal(value)
    }
}

impl From<TransferRef> for JobArg {
    fn from(value: TransferRef) -> Self {
        JobArg::Transfer(value)
    }
}

impl From<SharedResourcePath> for JobArg {
    fn from(value: SharedResourcePath) -> Self {
        JobArg::Shared(value)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParallelJobInfo {
    pub configuration_name: String,
    pub max_node_count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub command: Vec<JobArg>,
    /// Transfers that must be complete before the job may start.
    pub referenced_input_files: BTreeSet<TransferRef>,
    /// Transfers the job produces.
    pub referenced_output_files: BTreeSet<TransferRef>,
    pub stdin: Option<JobArg>,
    pub join_stderrout: bool,
    pub stdout_file: Option<JobArg>,
    pub stderr_file: Option<JobArg>,
    pub working_directory: Option<JobArg>,
    pub parallel_job_info: Option<ParallelJobInfo>,
    /// Hours.
    pub disposal_timeout: u32,
    /// Assigned by the engine at submission.
    pub job_id: Option<JobId>,
}

impl Job {
    pub fn new<I, A>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<JobArg>,
    {
        Job {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            referenced_input_files: BTreeSet::new(),
            referenced_output_files: BTreeSet::new(),
            stdin: None,
            join_stderrout: false,
            stdout_file: None,
            stderr_file: None,
            working_directory: None,
            parallel_job_info: None,
            disposal_timeout: DEFAULT_DISPOSAL_TIMEOUT_HOURS,
            job_id: None,
        }
    }

    pub fn with_input(mut self, transfer: TransferRef) -> Self {
        self.referenced_input_files.insert(transfer);
        self
    }

    pub fn with_output(mut self, transfer: TransferRef) -> Self {
        self.referenced_output_files.insert(transfer);
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<JobArg>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_stdout_file(mut self, path: impl Into<JobArg>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    pub fn with_stderr_file(mut self, path: impl Into<JobArg>) -> Self {
        self.stderr_file = Some(path.into());
        self
    }

    pub fn joining_stderrout(mut self) -> Self {
        self.join_stderrout = true;
        self
    }

    pub fn with_working_directory(mut self, path: impl Into<JobArg>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn with_parallel_job_info(mut self, configuration_name: impl Into<String>, max_node_count: u32) -> Self {
        self.parallel_job_info = Some(ParallelJobInfo { configuration_name: configuration_name.into(), max_node_count });
        self
    }

    pub fn with_disposal_timeout(mut self, hours: u32) -> Self {
        self.disposal_timeout = hours;
        self
    }

    /// Every transfer the job refers to, in its reference sets or its arguments.
    pub fn transfer_refs(&self) -> BTreeSet<TransferRef> {
        let mut refs: BTreeSet<TransferRef> = self.referenced_input_files.union(&self.referenced_output_files).copied().collect();
        let args = self.command.iter().chain(&self.stdin).chain(&self.stdout_file).chain(&self.stderr_file).chain(&self.working_directory);
        for arg in args {
            if let JobArg::Transfer(transfer) = arg {
                refs.insert(*transfer);
            }
        }
        refs
    }
}

/// Scratch file or directory the engine creates in its staging area.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TemporaryPath {
    pub is_directory: bool,
    /// Appended to the generated name, e.g. `.nii`.
    pub suffix: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub name: String,
    /// Path on the submitting side. For a file set, one of its members.
    pub remote_path: PathBuf,
    /// Every member of a file set (series, or formats spanning several files).
    pub remote_paths: Option<Vec<PathBuf>>,
    pub disposal_timeout: u32,
    /// Assigned by the engine at submission.
    pub transfer_id: Option<TransferId>,
    /// Set for a temporary path: created by the engine, never sent or retrieved.
    pub temporary: Option<TemporaryPath>,
}

impl FileTransfer {
    pub fn new(remote_path: impl Into<PathBuf>) -> Self {
        let remote_path = remote_path.into();
        FileTransfer {
            name: format!("{} transfer", remote_path.display()),
            remote_path,
            remote_paths: None,
            disposal_timeout: DEFAULT_DISPOSAL_TIMEOUT_HOURS,
            transfer_id: None,
            temporary: None,
        }
    }

    /// A temporary path, created empty on the resource when the workflow is
    /// submitted and removed with it. Jobs refer to it like any transfer node.
    pub fn temporary(name: impl Into<String>, is_directory: bool, suffix: impl Into<String>) -> Self {
        FileTransfer {
            name: name.into(),
            remote_path: PathBuf::new(),
            remote_paths: None,
            disposal_timeout: DEFAULT_DISPOSAL_TIMEOUT_HOURS,
            transfer_id: None,
            temporary: Some(TemporaryPath { is_directory, suffix: suffix.into() }),
        }
    }

    pub fn file_set(remote_path: impl Into<PathBuf>, remote_paths: Vec<PathBuf>) -> Self {
        FileTransfer { remote_paths: Some(remote_paths), ..Self::new(remote_path) }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowNode {
    Job(Job),
    FileTransfer(FileTransfer),
}

impl WorkflowNode {
    pub fn name(&self) -> &str {
        match self {
            WorkflowNode::Job(job) => &job.name,
            WorkflowNode::FileTransfer(transfer) => &transfer.name,
        }
    }
}

/// Purely presentational tree of nodes. Has no effect on execution order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodesGroup {
    pub name: String,
    pub elements: Vec<GroupElement>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum GroupElement {
    Node(NodeKey),
    Group(Box<NodesGroup>),
}

impl NodesGroup {
    pub fn new(name: impl Into<String>, elements: Vec<GroupElement>) -> Self {
        NodesGroup { name: name.into(), elements }
    }

    /// Every node below this group, depth first.
    pub fn node_keys(&self) -> Vec<NodeKey> {
        let mut keys = Vec::new();
        for element in &self.elements {
            match element {
                GroupElement::Node(key) => keys.push(*key),
                GroupElement::Group(group) => keys.extend(group.node_keys()),
            }
        }
        keys
    }
}
