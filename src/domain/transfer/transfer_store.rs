//! Engine-side bookkeeping of registered transfers.
//!
//! The store is authoritative for how many bytes of each file were durably
//! received; the submitting side only appends pieces and reads the counters.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use crate::domain::transfer::hash::compute_sha256;
use crate::domain::transfer::manifest::{Manifest, join_relative};
use crate::domain::transfer::transfer_action::{
    FileDigest, FileProgress, FileState, PieceAck, RetrievalPlan, SendingManifest, TransferAction, TransferInformation, TransferProgress,
    TransferStatus,
};
use crate::domain::utils::id::{TransferId, WorkflowId};
use crate::domain::workflow::workflow_node::TemporaryPath;
use crate::error::{Error, Result};

#[derive(Debug)]
struct TransferRecord {
    info: TransferInformation,
    status: TransferStatus,
    action: Option<TransferAction>,
    /// Highest offset served per file of a retrieval.
    served: BTreeMap<String, u64>,
    references: usize,
    disposal_requested: bool,
}

impl TransferRecord {
    fn check_live(&self) -> Result<()> {
        if self.status == TransferStatus::Cancelled {
            return Err(Error::ValidationError(format!("transfer {} was cancelled", self.info.id)));
        }
        Ok(())
    }

    fn check_movable(&self) -> Result<()> {
        self.check_live()?;
        if self.info.temporary {
            return Err(Error::ValidationError(format!("transfer {} is a temporary path of the engine", self.info.id)));
        }
        Ok(())
    }
}

const SINGLE_FILE_KEY: &str = "";

/// Where the two sides of a new transfer live.
struct Location {
    local_path: PathBuf,
    remote_path: PathBuf,
    remote_paths: Option<Vec<PathBuf>>,
    temporary: bool,
}

pub struct TransferStore {
    staging_root: PathBuf,
    next_id: AtomicI64,
    records: RwLock<HashMap<TransferId, Arc<Mutex<TransferRecord>>>>,
}

impl TransferStore {
    pub fn new(staging_root: impl Into<PathBuf>) -> Result<Self> {
        let staging_root = staging_root.into();
        std::fs::create_dir_all(&staging_root)?;
        Ok(TransferStore { staging_root, next_id: AtomicI64::new(1), records: RwLock::new(HashMap::new()) })
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    fn staging_dir(&self, id: TransferId) -> PathBuf {
        self.staging_root.join(id.to_string())
    }

    async fn record(&self, id: TransferId) -> Result<Arc<Mutex<TransferRecord>>> {
        self.records.read().await.get(&id).cloned().ok_or_else(|| Error::NotFound(format!("transfer {}", id)))
    }

    /// Allocates a fresh handle for `remote_path`. The engine-side copy lives
    /// under `<staging_root>/<id>/` and keeps the base name of `remote_path`.
    pub async fn register(
        &self,
        remote_path: PathBuf,
        disposal_timeout_hours: u32,
        remote_paths: Option<Vec<PathBuf>>,
        workflow_id: Option<WorkflowId>,
    ) -> Result<TransferInformation> {
        let file_name = remote_path
            .file_name()
            .ok_or_else(|| Error::ValidationError(format!("transfer path '{}' has no file name", remote_path.display())))?
            .to_owned();
        if let Some(remote_paths) = &remote_paths {
            check_file_set(&remote_path, remote_paths)?;
        }

        let id = TransferId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let staging_dir = self.staging_dir(id);
        fs::create_dir_all(&staging_dir).await?;

        let location = Location { local_path: staging_dir.join(file_name), remote_path, remote_paths, temporary: false };
        self.insert(id, location, disposal_timeout_hours, workflow_id).await
    }

    /// Creates an empty scratch file, or directory, under the staging area.
    /// It exists on the resource from the start, so it is `Complete` at once.
    pub async fn register_temporary(
        &self,
        temporary: &TemporaryPath,
        disposal_timeout_hours: u32,
        workflow_id: Option<WorkflowId>,
    ) -> Result<TransferInformation> {
        if temporary.suffix.contains(std::path::is_separator) {
            return Err(Error::ValidationError(format!("temporary path suffix '{}' contains a separator", temporary.suffix)));
        }

        let id = TransferId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let staging_dir = self.staging_dir(id);
        let local_path = staging_dir.join(format!("tmp{}", temporary.suffix));
        if temporary.is_directory {
            fs::create_dir_all(&local_path).await?;
        } else {
            create_empty(&local_path).await?;
        }

        let location = Location { local_path: local_path.clone(), remote_path: local_path, remote_paths: None, temporary: true };
        self.insert(id, location, disposal_timeout_hours, workflow_id).await
    }

    /// Registers a transfer whose engine-side file is produced by the engine
    /// itself, such as a job's captured standard output.
    pub async fn register_output(
        &self,
        file_name: &str,
        remote_path: PathBuf,
        disposal_timeout_hours: u32,
        workflow_id: Option<WorkflowId>,
    ) -> Result<TransferInformation> {
        let id = TransferId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let staging_dir = self.staging_dir(id);
        fs::create_dir_all(&staging_dir).await?;

        let location = Location { local_path: staging_dir.join(file_name), remote_path, remote_paths: None, temporary: false };
        self.insert(id, location, disposal_timeout_hours, workflow_id).await
    }

    /// Registers an engine-produced file that lives outside the staging area.
    pub async fn register_existing(
        &self,
        local_path: PathBuf,
        remote_path: PathBuf,
        disposal_timeout_hours: u32,
        workflow_id: Option<WorkflowId>,
    ) -> Result<TransferInformation> {
        let id = TransferId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let location = Location { local_path, remote_path, remote_paths: None, temporary: false };
        self.insert(id, location, disposal_timeout_hours, workflow_id).await
    }

    async fn insert(
        &self,
        id: TransferId,
        location: Location,
        disposal_timeout_hours: u32,
        workflow_id: Option<WorkflowId>,
    ) -> Result<TransferInformation> {
        let info = TransferInformation {
            id,
            local_path: location.local_path,
            remote_path: location.remote_path,
            expiration: Utc::now() + ChronoDuration::hours(i64::from(disposal_timeout_hours)),
            workflow_id,
            remote_paths: location.remote_paths.filter(|paths| !paths.is_empty()),
            temporary: location.temporary,
        };
        let record = TransferRecord {
            info: info.clone(),
            status: if location.temporary { TransferStatus::Complete } else { TransferStatus::Registered },
            action: None,
            served: BTreeMap::new(),
            references: 0,
            disposal_requested: false,
        };

        self.records.write().await.insert(id, Arc::new(Mutex::new(record)));
        log::debug!("Registered transfer {} for '{}' at '{}'", id, info.remote_path.display(), info.local_path.display());

        Ok(info)
    }

    pub async fn contains(&self, id: TransferId) -> bool {
        self.records.read().await.contains_key(&id)
    }

    pub async fn information(&self, id: TransferId) -> Result<TransferInformation> {
        Ok(self.record(id).await?.lock().await.info.clone())
    }

    pub async fn status(&self, id: TransferId) -> Result<TransferStatus> {
        Ok(self.record(id).await?.lock().await.status)
    }

    pub async fn action_info(&self, id: TransferId) -> Result<Option<TransferAction>> {
        Ok(self.record(id).await?.lock().await.action.clone())
    }

    pub async fn all_information(&self) -> Vec<TransferInformation> {
        let records: Vec<_> = self.records.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(records.len());
        for record in records {
            infos.push(record.lock().await.info.clone());
        }
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Starts, or resumes, receiving the content described by `manifest`.
    ///
    /// An unchanged manifest keeps the byte counters already held, so a send
    /// interrupted earlier continues where it stopped. A different manifest
    /// starts over from empty files.
    pub async fn initialize_sending(&self, id: TransferId, manifest: SendingManifest) -> Result<TransferAction> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        record.check_movable()?;

        let fresh = match &manifest {
            SendingManifest::File(digest) => TransferAction::FileSending { file: FileState::new(digest.clone()) },
            SendingManifest::Directory(manifest) => TransferAction::DirSending {
                cumulated_size: manifest.cumulated_size(),
                files: manifest
                    .files()
                    .map(|(path, size, hash)| (path.to_string(), FileState::new(FileDigest { size, hash: hash.to_string() })))
                    .collect(),
            },
        };

        if let Some(existing) = &record.action {
            if same_content(existing, &fresh) {
                log::debug!("Resuming sending transfer {}", id);
                return Ok(existing.clone());
            }
        }

        match &manifest {
            SendingManifest::File(_) => {
                create_empty(&record.info.local_path).await?;
            }
            SendingManifest::Directory(manifest) => {
                let staging_dir = self.staging_dir(id);
                manifest.create_directories(&staging_dir)?;
                for (path, _, _) in manifest.files() {
                    create_empty(&join_relative(&staging_dir, path)?).await?;
                }
            }
        }

        record.action = Some(fresh.clone());
        if all_sent(&record.action) {
            record.status = TransferStatus::Complete;
            log::info!("Transfer {} holds no file content, complete on initialization", id);
        } else {
            record.status = TransferStatus::Transferring;
            log::info!("Transfer {} receiving {} bytes", id, fresh.total_size());
        }
        Ok(fresh)
    }

    /// Appends one piece at `offset` of a file of a sending transfer.
    ///
    /// `offset` must equal the byte count already held for that file. Once the
    /// expected size is reached the file is hashed; a file that grows past its
    /// size or ends with a different hash is truncated to empty and its counter
    /// reset.
    pub async fn send_piece(&self, id: TransferId, relative_path: Option<String>, offset: u64, data: Vec<u8>) -> Result<PieceAck> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        record.check_live()?;

        let target = self.file_path(&record.info, relative_path.as_deref())?;
        let path_label = relative_path.clone().unwrap_or_else(|| record.info.remote_path.display().to_string());

        let state = match (&mut record.action, relative_path.as_deref()) {
            (Some(TransferAction::FileSending { file }), None) => file,
            (Some(TransferAction::DirSending { files, .. }), Some(path)) => {
                files.get_mut(path).ok_or_else(|| Error::NotFound(format!("file '{}' in transfer {}", path, id)))?
            }
            (Some(_), _) => return Err(Error::ProtocolError(format!("piece for '{}' does not match transfer {} action", path_label, id))),
            (None, _) => return Err(Error::ProtocolError(format!("transfer {} was not initialized for sending", id))),
        };

        if state.complete {
            let transmitted = state.transmitted;
            let transfer_complete = all_sent(&record.action);
            return Ok(PieceAck { transmitted, file_complete: true, transfer_complete });
        }
        if offset != state.transmitted {
            return Err(Error::ProtocolError(format!(
                "piece for '{}' starts at {} but {} bytes are held",
                path_label, offset, state.transmitted
            )));
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&target).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        state.transmitted += data.len() as u64;

        let expected = state.digest.size;
        if state.transmitted > expected {
            let actual = state.transmitted;
            state.reset();
            create_empty(&target).await?;
            return Err(Error::TransferExceededSize { path: path_label, expected, actual });
        }
        if state.transmitted == expected {
            if compute_sha256(&target).await? != state.digest.hash {
                state.reset();
                create_empty(&target).await?;
                return Err(Error::TransferCorrupted { path: path_label });
            }
            state.complete = true;
        }

        let ack = PieceAck { transmitted: state.transmitted, file_complete: state.complete, transfer_complete: false };
        let transfer_complete = all_sent(&record.action);
        if transfer_complete {
            record.status = TransferStatus::Complete;
            log::info!("Transfer {} received completely", id);
        }

        Ok(PieceAck { transfer_complete, ..ack })
    }

    /// Describes what a retrieval of `id` will move, hashing every file once.
    pub async fn initialize_retrieving(&self, id: TransferId) -> Result<RetrievalPlan> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        record.check_movable()?;

        let staging_dir = self.staging_dir(id);
        let local_path = record.info.local_path.clone();
        let is_dir = record.info.remote_paths.is_none() && fs::metadata(&local_path).await?.is_dir();

        let plan = match &record.info.remote_paths {
            Some(remote_paths) => {
                let paths = remote_paths
                    .iter()
                    .map(|path| {
                        path.file_name()
                            .map(|name| staging_dir.join(name))
                            .ok_or_else(|| Error::ValidationError(format!("transfer path '{}' has no file name", path.display())))
                    })
                    .collect::<Result<Vec<_>>>()?;
                dir_plan(Manifest::build(paths).await?)
            }
            None if is_dir => dir_plan(Manifest::build(vec![local_path]).await?),
            None => {
                let size = fs::metadata(&local_path).await?.len();
                let hash = compute_sha256(&local_path).await?;
                RetrievalPlan { action: TransferAction::FileRetrieving { digest: FileDigest { size, hash } }, manifest: None }
            }
        };

        record.served = match &plan.action {
            TransferAction::DirRetrieving { files, .. } => {
                files.iter().filter(|(_, digest)| digest.size == 0).map(|(path, _)| (path.clone(), 0)).collect()
            }
            TransferAction::FileRetrieving { digest } if digest.size == 0 => BTreeMap::from([(SINGLE_FILE_KEY.to_string(), 0)]),
            _ => BTreeMap::new(),
        };
        record.action = Some(plan.action.clone());
        record.status = if retrieval_served(&record) { TransferStatus::Complete } else { TransferStatus::Transferring };

        log::info!("Transfer {} ready for retrieval of {} bytes", id, plan.action.total_size());
        Ok(plan)
    }

    /// Reads up to `length` bytes at `offset` of one file of a retrieval.
    pub async fn retrieve_piece(&self, id: TransferId, relative_path: Option<String>, offset: u64, length: usize) -> Result<Vec<u8>> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        record.check_live()?;

        let size = match (&record.action, relative_path.as_deref()) {
            (Some(TransferAction::FileRetrieving { digest }), None) => digest.size,
            (Some(TransferAction::DirRetrieving { files, .. }), Some(path)) => {
                files.get(path).map(|digest| digest.size).ok_or_else(|| Error::NotFound(format!("file '{}' in transfer {}", path, id)))?
            }
            (Some(_), _) => return Err(Error::ProtocolError(format!("retrieval piece does not match transfer {} action", id))),
            (None, _) => return Err(Error::ProtocolError(format!("transfer {} was not initialized for retrieving", id))),
        };

        let source = self.file_path(&record.info, relative_path.as_deref())?;
        let mut file = fs::File::open(&source).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut data = Vec::with_capacity(length.min(size.saturating_sub(offset) as usize));
        file.take(length as u64).read_to_end(&mut data).await?;

        let reached = offset + data.len() as u64;
        let key = relative_path.unwrap_or_else(|| SINGLE_FILE_KEY.to_string());
        let served = record.served.entry(key).or_insert(0);
        *served = (*served).max(reached);

        if record.status == TransferStatus::Transferring && retrieval_served(&record) {
            record.status = TransferStatus::Complete;
            log::info!("Transfer {} served completely", id);
        }

        Ok(data)
    }

    /// Byte counters as held by the engine. For a send this is what was durably
    /// received, for a retrieval what was served so far.
    pub async fn progress(&self, id: TransferId) -> Result<TransferProgress> {
        let record = self.record(id).await?;
        let record = record.lock().await;
        Ok(engine_progress(&record))
    }

    /// Disposes `id`, or defers it while jobs still reference it.
    /// Returns `true` when the transfer was removed now.
    pub async fn cancel(&self, id: TransferId) -> Result<bool> {
        {
            let mut records = self.records.write().await;
            let record = records.get(&id).cloned().ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
            let mut record = record.lock().await;
            record.status = TransferStatus::Cancelled;
            if record.references > 0 {
                record.disposal_requested = true;
                log::info!("Disposal of transfer {} deferred: {} job(s) still reference it", id, record.references);
                return Ok(false);
            }
            records.remove(&id);
        }
        self.remove_staging(id).await?;
        Ok(true)
    }

    async fn remove(&self, id: TransferId) -> Result<()> {
        let removed = self.records.write().await.remove(&id);
        if let Some(record) = removed {
            record.lock().await.status = TransferStatus::Cancelled;
        }
        self.remove_staging(id).await
    }

    async fn remove_staging(&self, id: TransferId) -> Result<()> {
        match fs::remove_dir_all(self.staging_dir(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        log::info!("Transfer {} disposed", id);
        Ok(())
    }

    /// Fails once disposal of `id` was requested. The map stays read-locked
    /// so a concurrent [`cancel`](Self::cancel) sees the new reference.
    pub async fn add_reference(&self, id: TransferId) -> Result<()> {
        let records = self.records.read().await;
        let record = records.get(&id).ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
        let mut record = record.lock().await;
        record.check_live()?;
        record.references += 1;
        Ok(())
    }

    /// Drops one job reference; completes a deferred disposal once the last
    /// reference is gone.
    pub async fn release_reference(&self, id: TransferId) -> Result<()> {
        let record = match self.record(id).await {
            Ok(record) => record,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let dispose_now = {
            let mut record = record.lock().await;
            record.references = record.references.saturating_sub(1);
            record.references == 0 && record.disposal_requested
        };
        if dispose_now {
            self.remove(id).await?;
        }
        Ok(())
    }

    pub async fn references(&self, id: TransferId) -> Result<usize> {
        Ok(self.record(id).await?.lock().await.references)
    }

    /// `true` while a retrieval of `id` has not been served to the end.
    pub async fn retrieval_pending(&self, id: TransferId) -> bool {
        let Ok(record) = self.record(id).await else {
            return false;
        };
        let record = record.lock().await;
        is_retrieving(&record.action) && record.status == TransferStatus::Transferring
    }

    /// Marks an engine-produced output as available for retrieval. A
    /// retrieval already under way keeps its own status.
    pub async fn mark_complete(&self, id: TransferId) -> Result<()> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        record.check_live()?;
        if record.status == TransferStatus::Transferring && is_retrieving(&record.action) {
            log::debug!("Transfer {} is being retrieved, completion left to the retrieval", id);
            return Ok(());
        }
        record.status = TransferStatus::Complete;
        Ok(())
    }

    pub async fn set_workflow(&self, id: TransferId, workflow_id: WorkflowId) -> Result<()> {
        self.record(id).await?.lock().await.info.workflow_id = Some(workflow_id);
        Ok(())
    }

    pub async fn set_expiration(&self, id: TransferId, expiration: DateTime<Utc>) -> Result<()> {
        self.record(id).await?.lock().await.info.expiration = expiration;
        Ok(())
    }

    /// Removes every unreferenced transfer whose expiration date is past.
    pub async fn expire(&self, now: DateTime<Utc>) -> Vec<TransferId> {
        let expired = {
            let mut records = self.records.write().await;
            let mut expired = Vec::new();
            for (id, record) in records.iter() {
                let mut record = record.lock().await;
                if record.references == 0 && record.info.expiration < now {
                    record.status = TransferStatus::Cancelled;
                    expired.push(*id);
                }
            }
            for id in &expired {
                records.remove(id);
            }
            expired
        };

        for id in &expired {
            if let Err(e) = self.remove_staging(*id).await {
                log::warn!("Could not remove expired transfer {}: {}", id, e);
            }
        }
        expired
    }

    fn file_path(&self, info: &TransferInformation, relative_path: Option<&str>) -> Result<PathBuf> {
        match relative_path {
            None => Ok(info.local_path.clone()),
            Some(path) => join_relative(&self.staging_dir(info.id), path),
        }
    }
}

fn dir_plan(manifest: Manifest) -> RetrievalPlan {
    let files = manifest.files().map(|(path, size, hash)| (path.to_string(), FileDigest { size, hash: hash.to_string() })).collect();
    let action = TransferAction::DirRetrieving { cumulated_size: manifest.cumulated_size(), files };
    RetrievalPlan { action, manifest: Some(manifest) }
}

fn is_retrieving(action: &Option<TransferAction>) -> bool {
    matches!(action, Some(TransferAction::FileRetrieving { .. } | TransferAction::DirRetrieving { .. }))
}

/// Members of a file set share the directory of the main path and have
/// distinct names, since they are staged side by side.
fn check_file_set(remote_path: &Path, remote_paths: &[PathBuf]) -> Result<()> {
    let parent = remote_path.parent();
    let mut names = std::collections::BTreeSet::new();
    for path in remote_paths {
        if path.parent() != parent {
            return Err(Error::ValidationError(format!(
                "file set member '{}' is not in the directory of '{}'",
                path.display(),
                remote_path.display()
            )));
        }
        let name = path.file_name().ok_or_else(|| Error::ValidationError(format!("transfer path '{}' has no file name", path.display())))?;
        if !names.insert(name.to_owned()) {
            return Err(Error::ValidationError(format!("file set lists '{}' twice", path.display())));
        }
    }
    Ok(())
}

fn same_content(existing: &TransferAction, fresh: &TransferAction) -> bool {
    match (existing, fresh) {
        (TransferAction::FileSending { file: a }, TransferAction::FileSending { file: b }) => a.digest == b.digest,
        (TransferAction::DirSending { files: a, .. }, TransferAction::DirSending { files: b, .. }) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|((pa, sa), (pb, sb))| pa == pb && sa.digest == sb.digest)
        }
        _ => false,
    }
}

fn all_sent(action: &Option<TransferAction>) -> bool {
    match action {
        Some(TransferAction::FileSending { file }) => file.complete,
        Some(TransferAction::DirSending { files, .. }) => files.values().all(|state| state.complete),
        _ => false,
    }
}

fn retrieval_served(record: &TransferRecord) -> bool {
    let served = |key: &str, size: u64| record.served.get(key).is_some_and(|reached| *reached >= size);
    match &record.action {
        Some(TransferAction::FileRetrieving { digest }) => served(SINGLE_FILE_KEY, digest.size),
        Some(TransferAction::DirRetrieving { files, .. }) => files.iter().all(|(path, digest)| served(path, digest.size)),
        _ => false,
    }
}

fn engine_progress(record: &TransferRecord) -> TransferProgress {
    let files = match &record.action {
        Some(TransferAction::FileSending { file }) => {
            vec![FileProgress { relative_path: None, size: file.digest.size, transmitted: file.transmitted }]
        }
        Some(TransferAction::DirSending { files, .. }) => files
            .iter()
            .map(|(path, state)| FileProgress { relative_path: Some(path.clone()), size: state.digest.size, transmitted: state.transmitted })
            .collect(),
        Some(TransferAction::FileRetrieving { digest }) => vec![FileProgress {
            relative_path: None,
            size: digest.size,
            transmitted: record.served.get(SINGLE_FILE_KEY).copied().unwrap_or(0),
        }],
        Some(TransferAction::DirRetrieving { files, .. }) => files
            .iter()
            .map(|(path, digest)| FileProgress {
                relative_path: Some(path.clone()),
                size: digest.size,
                transmitted: record.served.get(path).copied().unwrap_or(0),
            })
            .collect(),
        None => Vec::new(),
    };
    TransferProgress::from_files(files)
}

async fn create_empty(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::File::create(path).await?;
    Ok(())
}
