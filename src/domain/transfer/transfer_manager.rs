use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::domain::engine::calls::{EngineCall, expect_reply};
use crate::domain::engine::workflow_engine::WorkflowEngine;
use crate::domain::remote_object::proxy::Proxy;
use crate::domain::transfer::hash::compute_sha256;
use crate::domain::transfer::manifest::{Manifest, join_relative};
use crate::domain::transfer::transfer_action::{
    FileDigest, FileProgress, FileState, SendingManifest, TransferAction, TransferInformation, TransferProgress, TransferStatus,
};
use crate::domain::utils::id::TransferId;
use crate::error::{Error, Result};

/// Where a retrieval started by this manager writes to.
#[derive(Debug, Clone)]
struct Retrieval {
    target: PathBuf,
    action: TransferAction,
}

/// Moves files between the submitting host and an engine's staging area in
/// chunks of `chunk_size` bytes.
///
/// The engine is authoritative for what it received: a send resumes at the
/// offset the engine holds. The local filesystem is authoritative for what was
/// retrieved: a retrieval resumes at the length of the local file.
pub struct TransferManager {
    proxy: Arc<Proxy<WorkflowEngine>>,
    chunk_size: usize,
    retrievals: Mutex<HashMap<TransferId, Retrieval>>,
}

impl TransferManager {
    pub fn new(proxy: Arc<Proxy<WorkflowEngine>>, chunk_size: usize) -> Self {
        TransferManager { proxy, chunk_size: chunk_size.max(1), retrievals: Mutex::new(HashMap::new()) }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn retrievals(&self) -> MutexGuard<'_, HashMap<TransferId, Retrieval>> {
        self.retrievals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn register(
        &self,
        remote_path: impl Into<PathBuf>,
        disposal_timeout: u32,
        remote_paths: Option<Vec<PathBuf>>,
    ) -> Result<TransferInformation> {
        let call = EngineCall::RegisterTransfer { remote_path: remote_path.into(), disposal_timeout, remote_paths };
        expect_reply!(self.proxy.call(call).await?, TransferInformation)
    }

    pub async fn information(&self, transfer_id: TransferId) -> Result<TransferInformation> {
        expect_reply!(self.proxy.call(EngineCall::TransferInformation { transfer_id }).await?, TransferInformation)
    }

    pub async fn status(&self, transfer_id: TransferId) -> Result<TransferStatus> {
        expect_reply!(self.proxy.call(EngineCall::TransferStatus { transfer_id }).await?, TransferStatus)
    }

    /// Describes the local content to the engine: size and hash of a single
    /// file, or a manifest of a directory or file set. Reads every byte once.
    pub async fn initialize_send(&self, transfer_id: TransferId) -> Result<(TransferInformation, TransferAction)> {
        let info = self.information(transfer_id).await?;
        if info.temporary {
            return Err(Error::ValidationError(format!("transfer {} is a temporary path of the engine", transfer_id)));
        }

        let manifest = match &info.remote_paths {
            Some(paths) => SendingManifest::Directory(Manifest::build(paths.clone()).await?),
            None if fs::metadata(&info.remote_path).await?.is_dir() => {
                SendingManifest::Directory(Manifest::build(vec![info.remote_path.clone()]).await?)
            }
            None => {
                let size = fs::metadata(&info.remote_path).await?.len();
                let hash = compute_sha256(&info.remote_path).await?;
                SendingManifest::File(FileDigest { size, hash })
            }
        };

        let action = expect_reply!(self.proxy.call(EngineCall::InitializeSending { transfer_id, manifest }).await?, SendingAction)?;
        Ok((info, action))
    }

    /// Pushes every file of the transfer, each from the offset the engine
    /// already holds.
    pub async fn send(&self, transfer_id: TransferId) -> Result<()> {
        let (info, action) = self.initialize_send(transfer_id).await?;

        match action {
            TransferAction::FileSending { file } => self.send_file(transfer_id, None, &info.remote_path, &file).await?,
            TransferAction::DirSending { files, .. } => {
                let base = parent_of(&info.remote_path);
                for (relative_path, state) in &files {
                    let source = join_relative(&base, relative_path)?;
                    self.send_file(transfer_id, Some(relative_path.clone()), &source, state).await?;
                }
            }
            other => return Err(Error::ProtocolError(format!("transfer {} answered a send with {:?}", transfer_id, other))),
        }

        log::info!("Transfer {} sent from '{}'", transfer_id, info.remote_path.display());
        Ok(())
    }

    async fn send_file(&self, transfer_id: TransferId, relative_path: Option<String>, source: &Path, state: &FileState) -> Result<()> {
        if state.complete {
            return Ok(());
        }

        let mut file = File::open(source).await?;
        let mut offset = state.transmitted;
        loop {
            file.seek(SeekFrom::Start(offset)).await?;
            let mut data = Vec::with_capacity(self.chunk_size);
            (&mut file).take(self.chunk_size as u64).read_to_end(&mut data).await?;

            if data.is_empty() && offset < state.digest.size {
                return Err(Error::ProtocolError(format!(
                    "'{}' ended at {} bytes before the engine received {} bytes",
                    source.display(),
                    offset,
                    state.digest.size
                )));
            }

            let call = EngineCall::SendPiece { transfer_id, relative_path: relative_path.clone(), offset, data };
            let ack = expect_reply!(self.proxy.call(call).await?, PieceAck)?;
            if ack.file_complete {
                log::debug!("Transfer {}: '{}' sent", transfer_id, source.display());
                return Ok(());
            }
            offset = ack.transmitted;
        }
    }

    /// Retrieves the transfer to its path on this host.
    pub async fn retrieve(&self, transfer_id: TransferId) -> Result<()> {
        let info = self.information(transfer_id).await?;
        self.retrieve_into(transfer_id, info.remote_path, true).await
    }

    /// Retrieves a single-file transfer to `target` instead of its own path.
    pub async fn retrieve_as(&self, transfer_id: TransferId, target: impl Into<PathBuf>) -> Result<()> {
        self.retrieve_into(transfer_id, target.into(), false).await
    }

    async fn retrieve_into(&self, transfer_id: TransferId, target: PathBuf, allow_directory: bool) -> Result<()> {
        let plan = expect_reply!(self.proxy.call(EngineCall::InitializeRetrieving { transfer_id }).await?, RetrievalPlan)?;
        self.retrievals().insert(transfer_id, Retrieval { target: target.clone(), action: plan.action.clone() });

        match (&plan.action, plan.manifest) {
            (TransferAction::FileRetrieving { digest }, _) => self.retrieve_file(transfer_id, None, &target, digest).await?,
            (TransferAction::DirRetrieving { files, .. }, manifest) => {
                if !allow_directory {
                    return Err(Error::ValidationError(format!("transfer {} is not a single file", transfer_id)));
                }
                let base = parent_of(&target);
                if let Some(manifest) = manifest {
                    let root = base.clone();
                    tokio::task::spawn_blocking(move || manifest.create_directories(&root))
                        .await
                        .map_err(|e| Error::IoError(std::io::Error::other(format!("directory task failed: {e}"))))??;
                }
                for (relative_path, digest) in files {
                    let destination = join_relative(&base, relative_path)?;
                    self.retrieve_file(transfer_id, Some(relative_path.clone()), &destination, digest).await?;
                }
            }
            (other, _) => return Err(Error::ProtocolError(format!("transfer {} answered a retrieval with {:?}", transfer_id, other))),
        }

        log::info!("Transfer {} retrieved to '{}'", transfer_id, target.display());
        Ok(())
    }

    /// Appends pieces to `target` until it holds `digest.size` bytes, then
    /// checks the whole-file hash. Any size overrun or hash mismatch leaves
    /// `target` empty.
    async fn retrieve_file(&self, transfer_id: TransferId, relative_path: Option<String>, target: &Path, digest: &FileDigest) -> Result<()> {
        if let Some(parent) = target.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let label = relative_path.clone().unwrap_or_else(|| target.display().to_string());

        let mut file = OpenOptions::new().create(true).append(true).open(target).await?;
        let mut received = file.metadata().await?.len();
        let mut fetched = false;

        loop {
            if received > digest.size {
                truncate(target).await?;
                return Err(Error::TransferExceededSize { path: label, expected: digest.size, actual: received });
            }
            if received == digest.size {
                if compute_sha256(target).await? != digest.hash {
                    truncate(target).await?;
                    return Err(Error::TransferCorrupted { path: label });
                }
                // Nothing was fetched this time: an empty piece at the end lets
                // the engine count the file as served.
                if !fetched {
                    self.retrieve_piece(transfer_id, relative_path, received, 0).await?;
                }
                return Ok(());
            }

            let data = self.retrieve_piece(transfer_id, relative_path.clone(), received, self.chunk_size).await?;
            if data.is_empty() {
                return Err(Error::ProtocolError(format!("no data for '{}' at {} of {} bytes", label, received, digest.size)));
            }
            file.write_all(&data).await?;
            file.flush().await?;
            received += data.len() as u64;
            fetched = true;
        }
    }

    async fn retrieve_piece(&self, transfer_id: TransferId, relative_path: Option<String>, offset: u64, length: usize) -> Result<Vec<u8>> {
        let call = EngineCall::RetrievePiece { transfer_id, relative_path, offset, length };
        expect_reply!(self.proxy.call(call).await?, Piece)
    }

    /// Progress of a retrieval started here is read from the local files;
    /// anything else asks the engine.
    pub async fn progress(&self, transfer_id: TransferId) -> Result<TransferProgress> {
        if let Some(progress) = self.local_progress(transfer_id) {
            return Ok(progress);
        }
        expect_reply!(self.proxy.call(EngineCall::TransferProgress { transfer_id }).await?, TransferProgress)
    }

    pub fn local_progress(&self, transfer_id: TransferId) -> Option<TransferProgress> {
        let retrieval = self.retrievals().get(&transfer_id).cloned()?;
        retrieval_progress(&retrieval.target, &retrieval.action)
    }

    /// Returns `true` when the engine removed the transfer now, `false` when
    /// jobs still reference it and removal was deferred.
    pub async fn dispose(&self, transfer_id: TransferId) -> Result<bool> {
        let disposed = expect_reply!(self.proxy.call(EngineCall::CancelTransfer { transfer_id }).await?, Disposed)?;
        self.retrievals().remove(&transfer_id);
        Ok(disposed)
    }
}

/// Retrieval progress as seen on this host: the length of every target file.
/// `None` unless `action` is a retrieval.
pub fn retrieval_progress(target: &Path, action: &TransferAction) -> Option<TransferProgress> {
    let files = match action {
        TransferAction::FileRetrieving { digest } => {
            vec![FileProgress { relative_path: None, size: digest.size, transmitted: local_len(target) }]
        }
        TransferAction::DirRetrieving { files, .. } => {
            let base = parent_of(target);
            files
                .iter()
                .map(|(relative_path, digest)| FileProgress {
                    relative_path: Some(relative_path.clone()),
                    size: digest.size,
                    transmitted: join_relative(&base, relative_path).map(|path| local_len(&path)).unwrap_or(0),
                })
                .collect()
        }
        TransferAction::FileSending { .. } | TransferAction::DirSending { .. } => return None,
    };
    Some(TransferProgress::from_files(files))
}

fn local_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|metadata| metadata.len()).unwrap_or(0)
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

async fn truncate(path: &Path) -> Result<()> {
    File::create(path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_retrieval_progress_reads_local_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"abc").unwrap();

        let digest = |size| FileDigest { size, hash: String::new() };
        let files = BTreeMap::from([("data/a.txt".to_string(), digest(5)), ("data/sub/b.txt".to_string(), digest(4))]);
        let action = TransferAction::DirRetrieving { cumulated_size: 9, files };

        let progress = retrieval_progress(&root, &action).unwrap();
        assert_eq!(progress.total, 9);
        assert_eq!(progress.transmitted, 3);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_sending_has_no_local_progress() {
        let action = TransferAction::FileSending { file: FileState::new(FileDigest { size: 1, hash: String::new() }) };
        assert!(retrieval_progress(Path::new("x"), &action).is_none());
    }
}
