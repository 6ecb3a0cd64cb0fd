use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::domain::transfer::manifest::Manifest;
use crate::domain::utils::id::{TransferId, WorkflowId};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Registered,
    Transferring,
    Complete,
    Cancelled,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStatus::Registered => "registered",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Complete => "complete",
            TransferStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub hash: String,
}

/// Receiving side state of one file of a sending transfer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub digest: FileDigest,
    pub transmitted: u64,
    pub complete: bool,
}

impl FileState {
    pub fn new(digest: FileDigest) -> Self {
        FileState { digest, transmitted: 0, complete: false }
    }

    pub fn reset(&mut self) {
        self.transmitted = 0;
        self.complete = false;
    }
}

/// What a transfer is currently doing, as tracked by the engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum TransferAction {
    FileSending { file: FileState },
    DirSending { cumulated_size: u64, files: BTreeMap<String, FileState> },
    FileRetrieving { digest: FileDigest },
    DirRetrieving { cumulated_size: u64, files: BTreeMap<String, FileDigest> },
}

impl TransferAction {
    pub fn is_sending(&self) -> bool {
        matches!(self, TransferAction::FileSending { .. } | TransferAction::DirSending { .. })
    }

    /// Expected size of the whole transfer.
    pub fn total_size(&self) -> u64 {
        match self {
            TransferAction::FileSending { file } => file.digest.size,
            TransferAction::FileRetrieving { digest } => digest.size,
            TransferAction::DirSending { cumulated_size, .. } | TransferAction::DirRetrieving { cumulated_size, .. } => *cumulated_size,
        }
    }

    /// Byte offset the engine holds for `relative_path` of a sending transfer.
    pub fn transmitted(&self, relative_path: Option<&str>) -> Option<u64> {
        match (self, relative_path) {
            (TransferAction::FileSending { file }, None) => Some(file.transmitted),
            (TransferAction::DirSending { files, .. }, Some(path)) => files.get(path).map(|state| state.transmitted),
            _ => None,
        }
    }
}

/// What the submitting side computed before the first byte of a send.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum SendingManifest {
    File(FileDigest),
    Directory(Manifest),
}

/// Answer to one pushed piece. `transfer_complete` is the explicit terminal
/// signal of the whole transfer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceAck {
    pub transmitted: u64,
    pub file_complete: bool,
    pub transfer_complete: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferInformation {
    pub id: TransferId,
    /// Engine-side staging path. Opaque to the submitting side.
    pub local_path: PathBuf,
    /// Path on the submitting side.
    pub remote_path: PathBuf,
    pub expiration: DateTime<Utc>,
    pub workflow_id: Option<WorkflowId>,
    pub remote_paths: Option<Vec<PathBuf>>,
    /// Engine-side scratch path with no counterpart on the submitting side.
    pub temporary: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    pub relative_path: Option<String>,
    pub size: u64,
    pub transmitted: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub total: u64,
    pub transmitted: u64,
    pub files: Vec<FileProgress>,
}

impl TransferProgress {
    pub fn from_files(files: Vec<FileProgress>) -> Self {
        let total = files.iter().map(|f| f.size).sum();
        let transmitted = files.iter().map(|f| f.transmitted.min(f.size)).sum();
        TransferProgress { total, transmitted, files }
    }

    pub fn is_complete(&self) -> bool {
        self.transmitted == self.total
    }
}

/// Everything the receiving side needs before requesting any retrieval piece.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RetrievalPlan {
    pub action: TransferAction,
    /// Directory layout to recreate first; `None` for a single file.
    pub manifest: Option<Manifest>,
}
