#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use soma_flow::config::{ClientConfig, ResourceConfig};
use soma_flow::domain::engine::scheduler::{JobDescription, LocalScheduler, Scheduler};
use soma_flow::domain::remote_object::{ObjectHandle, ObjectServer};
use soma_flow::domain::utils::id::DrmJobId;
use soma_flow::domain::workflow::status::{ExitInfo, JobStatus};
use soma_flow::{Result, WorkflowController, WorkflowEngine};

/// Local scheduler that remembers the name of every job handed to it.
pub struct RecordingScheduler {
    inner: LocalScheduler,
    submitted: Mutex<Vec<String>>,
}

impl RecordingScheduler {
    pub fn new(max_running: usize) -> Self {
        RecordingScheduler { inner: LocalScheduler::new(max_running), submitted: Mutex::new(Vec::new()) }
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn submit(&self, job: JobDescription) -> Result<DrmJobId> {
        self.submitted.lock().unwrap().push(job.name.clone());
        self.inner.submit(job).await
    }

    async fn status(&self, id: DrmJobId) -> Option<JobStatus> {
        self.inner.status(id).await
    }

    async fn exit_information(&self, id: DrmJobId) -> Option<ExitInfo> {
        self.inner.exit_information(id).await
    }

    async fn stop(&self, id: DrmJobId) -> Result<()> {
        self.inner.stop(id).await
    }

    async fn restart(&self, id: DrmJobId) -> Result<()> {
        self.inner.restart(id).await
    }

    async fn kill(&self, id: DrmJobId) -> Result<()> {
        self.inner.kill(id).await
    }

    async fn dispose(&self, id: DrmJobId) -> Result<()> {
        self.inner.dispose(id).await
    }
}

/// An engine served over a real TCP object server, with its staging area and
/// a scratch directory for the submitting side in temporary directories.
pub struct TestEngine {
    pub staging: TempDir,
    pub client_dir: TempDir,
    pub engine: Arc<WorkflowEngine>,
    pub scheduler: Arc<RecordingScheduler>,
    pub handle: ObjectHandle,
    server: JoinHandle<Result<()>>,
}

impl TestEngine {
    pub async fn start() -> TestEngine {
        let staging = tempfile::tempdir().unwrap();
        let client_dir = tempfile::tempdir().unwrap();

        let mut resource = ResourceConfig::new(staging.path());
        resource.wait_poll_ms = 20;

        let scheduler = Arc::new(RecordingScheduler::new(4));
        let engine = Arc::new(WorkflowEngine::new(&resource, scheduler.clone()).unwrap());

        let server = ObjectServer::bind(None, resource.max_frame_length).await.unwrap();
        let handle = server.register(Arc::clone(&engine)).await;
        let server = server.spawn();

        TestEngine { staging, client_dir, engine, scheduler, handle, server }
    }

    pub fn controller(&self) -> WorkflowController {
        self.controller_with_chunk_size(client_config().chunk_size)
    }

    pub fn controller_with_chunk_size(&self, chunk_size: usize) -> WorkflowController {
        let config = ClientConfig { chunk_size, ..client_config() };
        WorkflowController::connect(&self.handle.to_string(), &config).unwrap()
    }
}

impl Drop for TestEngine {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Short poll tick so interrupts and timeouts are observed quickly.
pub fn client_config() -> ClientConfig {
    ClientConfig { poll_tick_ms: 20, call_timeout_secs: None, chunk_size: 64 * 1024 }
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
