//! The bulk download orchestrator.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::BulkError;
use super::job::{
    BatchConfig, BatchStrategy, BulkJob, BulkStatistics, BulkStatus, FileOutcome, JobOptions, JobProgress, JobReport,
    TaskReport,
};
use super::model::{FileDescriptor, ModelSearchResult, extract_files};
use crate::fault::{Fault, OperationContext};
use crate::retry::{ErrorHandler, RetryOptions};
use crate::scan::SecurityScanner;
use crate::transfer::{TaskHandle, TransferClient, TransferRequest};

/// Called with `(job_id, progress)` on every state change of a job.
pub type ProgressCallback = Arc<dyn Fn(&str, &JobProgress) + Send + Sync>;

/// Called with the job once it reaches a terminal status.
pub type CompletionCallback = Arc<dyn Fn(&BulkJob) + Send + Sync>;

const DEFAULT_OUTPUT_DIR: &str = "downloads";

/// Control signal shared by the orchestrator and the file workers of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobSignal {
    Run,
    Pause,
    Cancel,
}

/// A transfer handle reported by a worker once `start` returned.
#[derive(Debug)]
struct TaskStarted {
    index: usize,
    handle: TaskHandle,
}

/// Groups a job's files into batches and drives them through the transfer
/// collaborator under retry.
///
/// Job state is owned here. Workers report back over a channel and only the
/// orchestrating task mutates counters.
pub struct BulkDownloadManager {
    handler: Arc<ErrorHandler>,
    transfer: Arc<dyn TransferClient>,
    scanner: Arc<dyn SecurityScanner>,
    config: BatchConfig,
    output_dir: PathBuf,
    jobs: Mutex<HashMap<String, BulkJob>>,
    signals: DashMap<String, watch::Sender<JobSignal>>,
    progress_callbacks: RwLock<Vec<ProgressCallback>>,
    completion_callbacks: RwLock<Vec<CompletionCallback>>,
}

impl std::fmt::Debug for BulkDownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkDownloadManager")
            .field("config", &self.config)
            .field("output_dir", &self.output_dir)
            .field("active_jobs", &self.signals.len())
            .finish_non_exhaustive()
    }
}

impl BulkDownloadManager {
    #[must_use]
    pub fn new(
        handler: Arc<ErrorHandler>,
        transfer: Arc<dyn TransferClient>,
        scanner: Arc<dyn SecurityScanner>,
        config: BatchConfig,
    ) -> Self {
        Self {
            handler,
            transfer,
            scanner,
            config,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            jobs: Mutex::new(HashMap::new()),
            signals: DashMap::new(),
            progress_callbacks: RwLock::new(Vec::new()),
            completion_callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Download root for jobs that do not set their own.
    #[must_use]
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<ErrorHandler> {
        &self.handler
    }

    /// Registers a new pending job and returns its id.
    pub fn create_job(&self, results: Vec<ModelSearchResult>, name: impl Into<String>, options: JobOptions) -> String {
        let id = Uuid::new_v4().to_string();
        let files = extract_files(&results, &options);
        let job = BulkJob::new(id.clone(), name.into(), results, files, options);
        info!(
            job_id = %id,
            name = %job.name,
            files = job.total_files,
            total_bytes = job.total_size_bytes,
            "bulk job created"
        );
        self.lock_jobs().insert(id.clone(), job);
        id
    }

    /// Downloads every file of a pending job and returns its final state.
    ///
    /// Per-file faults never abort siblings; they are recorded on the job and
    /// make it end as [`BulkStatus::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::UnknownJob`] or, when the job is not pending,
    /// [`BulkError::InvalidState`].
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn process_job(&self, job_id: &str) -> Result<BulkJob, BulkError> {
        let (files, output_dir, mut signal) = self.begin(job_id)?;
        self.notify_progress_for(job_id);

        let indexed: Vec<(usize, FileDescriptor)> = files.into_iter().enumerate().collect();
        for (batch_number, batch) in indexed.chunks(self.config.batch_size.max(1)).enumerate() {
            if !wait_until_running(&mut signal).await {
                break;
            }
            let concurrency = self.batch_concurrency();
            debug!(batch = batch_number, files = batch.len(), concurrency, "dispatching batch");
            self.run_batch(job_id, batch, concurrency, &signal, &output_dir).await;
            if *signal.borrow() == JobSignal::Cancel {
                break;
            }
        }

        self.finish(job_id)
    }

    /// Pauses a processing job and forwards the pause to its in-flight transfers.
    ///
    /// Returns false when the job is unknown or not processing.
    pub async fn pause_job(&self, job_id: &str) -> bool {
        let outstanding = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(job_id) else {
                return false;
            };
            if job.status != BulkStatus::Processing {
                return false;
            }
            self.send_signal(job_id, JobSignal::Pause);
            job.status = BulkStatus::Paused;
            job.outstanding_tasks()
        };

        for handle in &outstanding {
            if !self.transfer.pause(handle).await {
                debug!(job_id, task = %handle, "transfer could not be paused");
            }
        }
        info!(job_id, tasks = outstanding.len(), "bulk job paused");
        self.notify_progress_for(job_id);
        true
    }

    /// Resumes a paused job.
    ///
    /// Returns false when the job is unknown or not paused.
    pub async fn resume_job(&self, job_id: &str) -> bool {
        let outstanding = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(job_id) else {
                return false;
            };
            if job.status != BulkStatus::Paused {
                return false;
            }
            self.send_signal(job_id, JobSignal::Run);
            job.status = BulkStatus::Processing;
            job.outstanding_tasks()
        };

        for handle in &outstanding {
            if !self.transfer.resume(handle).await {
                debug!(job_id, task = %handle, "transfer could not be resumed");
            }
        }
        info!(job_id, tasks = outstanding.len(), "bulk job resumed");
        self.notify_progress_for(job_id);
        true
    }

    /// Cancels a job that has not finished yet.
    ///
    /// The job is marked cancelled immediately; transfers already moving bytes
    /// may take a moment to stop but their results are no longer counted.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let (outstanding, snapshot) = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(job_id) else {
                return false;
            };
            if job.status.is_terminal() {
                return false;
            }
            if let Some((_, signal)) = self.signals.remove(job_id) {
                signal.send_replace(JobSignal::Cancel);
            }
            job.status = BulkStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            (job.outstanding_tasks(), job.clone())
        };

        for handle in &outstanding {
            if !self.transfer.cancel(handle).await {
                debug!(job_id, task = %handle, "transfer already finished");
            }
        }
        info!(job_id, tasks = outstanding.len(), "bulk job cancelled");
        self.notify_progress(job_id, &snapshot.snapshot_progress());
        self.notify_completion(&snapshot);
        true
    }

    /// Job fields plus per-task transfer status queried now.
    pub async fn export_job_report(&self, job_id: &str) -> Option<JobReport> {
        let job = self.job(job_id)?;

        let mut tasks = Vec::with_capacity(job.files.len());
        for (index, file) in job.files.iter().enumerate() {
            let task = job.download_tasks.get(&index).cloned();
            let transfer = match &task {
                Some(handle) => self.transfer.status(handle).await,
                None => None,
            };
            tasks.push(TaskReport {
                index,
                file: file.label(),
                url: file.url.clone(),
                task,
                transfer,
                outcome: job.file_outcomes.get(&index).cloned(),
            });
        }

        Some(JobReport {
            progress: job.progress(),
            duration_secs: job.duration_secs(),
            id: job.id,
            name: job.name,
            status: job.status,
            total_files: job.total_files,
            downloaded_files: job.downloaded_files,
            failed_files: job.failed_files,
            total_size_bytes: job.total_size_bytes,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            options: job.options,
            errors: job.errors,
            tasks,
        })
    }

    #[must_use]
    pub fn get_statistics(&self) -> BulkStatistics {
        self.lock_jobs()
            .values()
            .fold(BulkStatistics::default(), |mut stats, job| {
                stats.total += 1;
                match job.status {
                    BulkStatus::Completed => stats.completed += 1,
                    BulkStatus::Processing | BulkStatus::Paused => stats.active += 1,
                    BulkStatus::Pending => stats.queued += 1,
                    BulkStatus::Failed | BulkStatus::Cancelled => {}
                }
                stats
            })
    }

    #[must_use]
    pub fn job(&self, job_id: &str) -> Option<BulkJob> {
        self.lock_jobs().get(job_id).cloned()
    }

    /// All jobs, oldest first.
    #[must_use]
    pub fn list_jobs(&self) -> Vec<BulkJob> {
        let mut jobs: Vec<BulkJob> = self.lock_jobs().values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Subscribing the same callback twice is a no-op.
    pub fn subscribe_progress(&self, callback: ProgressCallback) {
        let mut callbacks = self.progress_callbacks.write().unwrap_or_else(PoisonError::into_inner);
        if !callbacks.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
            callbacks.push(callback);
        }
    }

    pub fn unsubscribe_progress(&self, callback: &ProgressCallback) {
        self.progress_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| !Arc::ptr_eq(existing, callback));
    }

    /// Subscribing the same callback twice is a no-op.
    pub fn subscribe_completion(&self, callback: CompletionCallback) {
        let mut callbacks = self.completion_callbacks.write().unwrap_or_else(PoisonError::into_inner);
        if !callbacks.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
            callbacks.push(callback);
        }
    }

    pub fn unsubscribe_completion(&self, callback: &CompletionCallback) {
        self.completion_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| !Arc::ptr_eq(existing, callback));
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, BulkJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_signal(&self, job_id: &str, value: JobSignal) {
        if let Some(signal) = self.signals.get(job_id) {
            signal.send_replace(value);
        }
    }

    /// Moves a pending job to processing and opens its control channel.
    fn begin(
        &self,
        job_id: &str,
    ) -> Result<(Vec<FileDescriptor>, PathBuf, watch::Receiver<JobSignal>), BulkError> {
        let mut jobs = self.lock_jobs();
        let job = jobs.get_mut(job_id).ok_or_else(|| BulkError::UnknownJob {
            job_id: job_id.to_string(),
        })?;
        if job.status != BulkStatus::Pending {
            return Err(BulkError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }

        let (sender, receiver) = watch::channel(JobSignal::Run);
        self.signals.insert(job_id.to_string(), sender);
        job.status = BulkStatus::Processing;
        job.started_at = Some(Utc::now());

        let output_dir = job.options.output_dir.clone().unwrap_or_else(|| self.output_dir.clone());
        info!(files = job.total_files, output_dir = %output_dir.display(), "bulk job started");
        Ok((job.files.clone(), output_dir, receiver))
    }

    fn batch_concurrency(&self) -> usize {
        let concurrency = match self.config.strategy {
            BatchStrategy::Sequential => 1,
            BatchStrategy::Parallel => self.config.max_concurrent,
            BatchStrategy::Adaptive => self
                .handler
                .optimizer()
                .map_or(self.config.max_concurrent, |optimizer| optimizer.optimal_connections()),
        };
        concurrency.max(1)
    }

    async fn run_batch(
        &self,
        job_id: &str,
        batch: &[(usize, FileDescriptor)],
        concurrency: usize,
        signal: &watch::Receiver<JobSignal>,
        output_dir: &Path,
    ) {
        let permits = Arc::new(Semaphore::new(concurrency));
        let (events, mut started) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for (index, file) in batch {
            let worker = FileWorker {
                job_id: job_id.to_string(),
                index: *index,
                file: file.clone(),
                destination: file.destination(output_dir),
                handler: Arc::clone(&self.handler),
                transfer: Arc::clone(&self.transfer),
                scanner: Arc::clone(&self.scanner),
                signal: signal.clone(),
                events: events.clone(),
                options: RetryOptions {
                    max_retries: self.config.file_retries,
                    strategy: None,
                    network_delay: self.config.network_aware_retries,
                },
            };
            let permits = Arc::clone(&permits);
            let index = *index;
            workers.spawn(async move {
                let outcome = AssertUnwindSafe(worker.run(permits)).catch_unwind().await;
                (index, outcome)
            });
        }
        drop(events);

        loop {
            tokio::select! {
                biased;
                Some(event) = started.recv() => self.on_task_started(job_id, event).await,
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok((index, Ok(outcome)))) => self.settle(job_id, index, outcome),
                    Some(Ok((index, Err(panic)))) => {
                        let message = panic_message(panic.as_ref());
                        warn!(job_id, index, %message, "file worker panicked");
                        self.settle(
                            job_id,
                            index,
                            Some(FileOutcome::Failed {
                                fault_name: "Panic".to_string(),
                                category: "unknown".to_string(),
                                message,
                            }),
                        );
                    }
                    Some(Err(error)) => warn!(job_id, %error, "file worker did not finish"),
                },
            }
        }
    }

    /// Records a started transfer and applies any pause or cancel it missed.
    async fn on_task_started(&self, job_id: &str, event: TaskStarted) {
        let status = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            job.download_tasks.insert(event.index, event.handle.clone());
            job.status
        };
        debug!(job_id, index = event.index, task = %event.handle, "transfer started");

        match status {
            BulkStatus::Paused => {
                self.transfer.pause(&event.handle).await;
            }
            BulkStatus::Cancelled => {
                self.transfer.cancel(&event.handle).await;
            }
            _ => {}
        }
    }

    /// Applies one file outcome. `None` means the worker stopped on cancel.
    fn settle(&self, job_id: &str, index: usize, outcome: Option<FileOutcome>) {
        let progress = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            let Some(outcome) = outcome else {
                return;
            };
            if job.status == BulkStatus::Cancelled || job.file_outcomes.contains_key(&index) {
                return;
            }

            let label = job.files.get(index).map_or_else(|| format!("file #{index}"), FileDescriptor::label);
            match &outcome {
                FileOutcome::Downloaded { path, bytes, .. } => {
                    job.downloaded_files += 1;
                    debug!(job_id, file = %label, path = %path.display(), bytes, "file downloaded");
                }
                FileOutcome::Rejected { verdict, findings, .. } => {
                    job.failed_files += 1;
                    let description = format!("{label}: security scan verdict {verdict:?}: {}", findings.join("; "));
                    warn!(job_id, "{description}");
                    job.errors.push(description);
                }
                FileOutcome::Failed {
                    fault_name,
                    category,
                    message,
                } => {
                    job.failed_files += 1;
                    let description = format!("{label}: {fault_name} ({category}): {message}");
                    warn!(job_id, "file failed: {description}");
                    job.errors.push(description);
                }
            }
            job.file_outcomes.insert(index, outcome);
            job.snapshot_progress()
        };
        self.notify_progress(job_id, &progress);
    }

    fn finish(&self, job_id: &str) -> Result<BulkJob, BulkError> {
        self.signals.remove(job_id);
        let (job, newly_terminal) = {
            let mut jobs = self.lock_jobs();
            let job = jobs.get_mut(job_id).ok_or_else(|| BulkError::UnknownJob {
                job_id: job_id.to_string(),
            })?;
            if job.status.is_terminal() {
                (job.clone(), false)
            } else {
                job.status = if job.failed_files == 0 {
                    BulkStatus::Completed
                } else {
                    BulkStatus::Failed
                };
                job.completed_at = Some(Utc::now());
                (job.clone(), true)
            }
        };

        if newly_terminal {
            info!(
                status = %job.status,
                downloaded = job.downloaded_files,
                failed = job.failed_files,
                total = job.total_files,
                duration_secs = job.duration_secs(),
                "bulk job finished"
            );
            self.notify_progress(job_id, &job.snapshot_progress());
            self.notify_completion(&job);
        }
        Ok(job)
    }

    fn notify_progress_for(&self, job_id: &str) {
        let progress = self.lock_jobs().get(job_id).map(BulkJob::snapshot_progress);
        if let Some(progress) = progress {
            self.notify_progress(job_id, &progress);
        }
    }

    fn notify_progress(&self, job_id: &str, progress: &JobProgress) {
        let callbacks = self
            .progress_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(job_id, progress))).is_err() {
                warn!(job_id, "progress callback panicked");
            }
        }
    }

    fn notify_completion(&self, job: &BulkJob) {
        let callbacks = self
            .completion_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(job))).is_err() {
                warn!(job_id = %job.id, "completion callback panicked");
            }
        }
    }
}

/// Everything one file needs once spawned.
struct FileWorker {
    job_id: String,
    index: usize,
    file: FileDescriptor,
    destination: PathBuf,
    handler: Arc<ErrorHandler>,
    transfer: Arc<dyn TransferClient>,
    scanner: Arc<dyn SecurityScanner>,
    signal: watch::Receiver<JobSignal>,
    events: mpsc::UnboundedSender<TaskStarted>,
    options: RetryOptions,
}

impl FileWorker {
    /// Downloads and scans one file. `None` when the job was cancelled first.
    async fn run(mut self, permits: Arc<Semaphore>) -> Option<FileOutcome> {
        let _permit = permits.acquire_owned().await.ok()?;
        if !wait_until_running(&mut self.signal).await {
            return None;
        }

        let mut request = TransferRequest::new(self.file.url.clone(), self.destination.clone());
        if let Some(sha256) = &self.file.sha256 {
            request = request.with_sha256(sha256.clone());
        }
        if let Some(size) = self.file.size_bytes {
            request = request.with_size(size);
        }

        let context = OperationContext::new("download_file", "bulk_manager")
            .with_endpoint(self.file.url.clone())
            .with_correlation_id(self.job_id.clone())
            .with_request_id(format!("{}:{}", self.job_id, self.index))
            .with_param("model_id", self.file.model_id)
            .with_param("file", self.file.file_name.clone());

        let transfer = &self.transfer;
        let events = &self.events;
        let index = self.index;
        let operation = || {
            let request = request.clone();
            async move {
                let handle = transfer.start(request).await?;
                // The orchestrator may already be gone after a cancel.
                let _ = events.send(TaskStarted {
                    index,
                    handle: handle.clone(),
                });
                transfer.wait(&handle).await
            }
        };

        let mut cancel = self.signal.clone();
        let result = tokio::select! {
            result = self.handler.execute_with_options(operation, &context, self.options) => result,
            () = cancelled(&mut cancel) => return None,
        };

        let done = match result {
            Ok(done) => done,
            Err(error) => {
                if *self.signal.borrow() == JobSignal::Cancel {
                    return None;
                }
                return Some(self.failure(&error));
            }
        };

        let scan = self.scanner.scan(&done.path).await;
        match scan {
            Ok(report) if report.verdict.is_safe() => Some(FileOutcome::Downloaded {
                path: done.path,
                bytes: done.bytes,
                resumed: done.resumed,
            }),
            Ok(report) => Some(FileOutcome::Rejected {
                path: done.path,
                verdict: report.verdict,
                findings: report.findings,
            }),
            Err(error) => Some(self.failure(&error)),
        }
    }

    fn failure(&self, error: &dyn Fault) -> FileOutcome {
        FileOutcome::Failed {
            fault_name: error.fault_name().to_string(),
            category: self.handler.classifier().classify(error).as_str().to_string(),
            message: error.to_string(),
        }
    }
}

/// Waits out a pause. Returns false once the job is cancelled.
async fn wait_until_running(signal: &mut watch::Receiver<JobSignal>) -> bool {
    match signal.wait_for(|value| *value != JobSignal::Pause).await {
        Ok(value) => *value == JobSignal::Run,
        Err(_) => false,
    }
}

/// Resolves when the job is cancelled; never resolves otherwise.
async fn cancelled(signal: &mut watch::Receiver<JobSignal>) {
    if signal.wait_for(|value| *value == JobSignal::Cancel).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::scan::BasicScanner;
    use crate::transfer::{TransferError, TransferOutcome, TransferStatus};

    /// Writes the requested file instantly; fails URLs containing `broken`.
    struct InstantTransfer;

    #[async_trait::async_trait]
    impl TransferClient for InstantTransfer {
        async fn start(&self, request: TransferRequest) -> Result<TaskHandle, TransferError> {
            if request.url.contains("broken") {
                return Err(TransferError::invalid_url(request.url));
            }
            if let Some(parent) = request.destination.parent() {
                tokio::fs::create_dir_all(parent).await.unwrap();
            }
            tokio::fs::write(&request.destination, b"data").await.unwrap();
            Ok(TaskHandle::from(request.destination.to_string_lossy().as_ref()))
        }

        async fn wait(&self, handle: &TaskHandle) -> Result<TransferOutcome, TransferError> {
            Ok(TransferOutcome {
                path: PathBuf::from(handle.as_str()),
                bytes: 4,
                elapsed: std::time::Duration::from_millis(1),
                resumed: false,
            })
        }

        async fn status(&self, _handle: &TaskHandle) -> Option<TransferStatus> {
            None
        }

        async fn pause(&self, _handle: &TaskHandle) -> bool {
            false
        }

        async fn resume(&self, _handle: &TaskHandle) -> bool {
            false
        }

        async fn cancel(&self, _handle: &TaskHandle) -> bool {
            false
        }
    }

    fn results(urls: &[&str]) -> Vec<ModelSearchResult> {
        let files: Vec<serde_json::Value> = urls
            .iter()
            .enumerate()
            .map(|(i, url)| serde_json::json!({"name": format!("f{i}.safetensors"), "downloadUrl": url}))
            .collect();
        serde_json::from_value(serde_json::json!([{
            "id": 7,
            "name": "model",
            "modelVersions": [{"id": 70, "name": "v1", "files": files}]
        }]))
        .unwrap()
    }

    fn manager(dir: &Path) -> BulkDownloadManager {
        BulkDownloadManager::new(
            Arc::new(ErrorHandler::default()),
            Arc::new(InstantTransfer),
            Arc::new(BasicScanner::default()),
            BatchConfig {
                batch_size: 2,
                ..BatchConfig::default()
            },
        )
        .with_output_dir(dir)
    }

    #[tokio::test]
    async fn test_all_files_downloaded_completes_job() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let id = manager.create_job(results(&["https://a/1", "https://a/2", "https://a/3"]), "ok", JobOptions::default());

        let job = manager.process_job(&id).await.unwrap();
        assert_eq!(job.status, BulkStatus::Completed);
        assert_eq!(job.downloaded_files, 3);
        assert_eq!(job.failed_files, 0);
        assert_eq!(job.download_tasks.len(), 3);
        assert!(dir.path().join("model").join("70-v1").join("f2.safetensors").exists());
    }

    #[tokio::test]
    async fn test_validation_fault_fails_only_that_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let id = manager.create_job(results(&["https://a/1", "broken", "https://a/3"]), "mixed", JobOptions::default());

        let job = manager.process_job(&id).await.unwrap();
        assert_eq!(job.status, BulkStatus::Failed);
        assert_eq!(job.downloaded_files, 2);
        assert_eq!(job.failed_files, 1);
        assert!(job.errors[0].contains("InvalidUrlError"), "{:?}", job.errors);
        assert!(job.errors[0].contains("validation"));
    }

    #[tokio::test]
    async fn test_process_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let id = manager.create_job(results(&[]), "empty", JobOptions::default());

        let job = manager.process_job(&id).await.unwrap();
        assert_eq!(job.status, BulkStatus::Completed);
        assert!(matches!(
            manager.process_job(&id).await,
            Err(BulkError::InvalidState { .. })
        ));
        assert!(matches!(
            manager.process_job("missing").await,
            Err(BulkError::UnknownJob { .. })
        ));
    }

    #[tokio::test]
    async fn test_callbacks_are_set_like() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);
        let callback: CompletionCallback = Arc::new(move |_job: &BulkJob| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        manager.subscribe_completion(Arc::clone(&callback));
        manager.subscribe_completion(Arc::clone(&callback));

        let panicking: ProgressCallback = Arc::new(|_id: &str, _progress: &JobProgress| panic!("boom"));
        manager.subscribe_progress(Arc::clone(&panicking));

        let id = manager.create_job(results(&["https://a/1"]), "cb", JobOptions::default());
        manager.process_job(&id).await.unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        manager.unsubscribe_completion(&callback);
        let id = manager.create_job(results(&["https://a/2"]), "cb2", JobOptions::default());
        manager.process_job(&id).await.unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_statistics_and_cancel_pending() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let first = manager.create_job(results(&["https://a/1"]), "one", JobOptions::default());
        let second = manager.create_job(results(&["https://a/2"]), "two", JobOptions::default());
        manager.process_job(&first).await.unwrap();

        assert_eq!(
            manager.get_statistics(),
            BulkStatistics {
                total: 2,
                completed: 1,
                active: 0,
                queued: 1,
            }
        );
        assert!(!manager.pause_job(&second).await);
        assert!(manager.cancel_job(&second).await);
        assert!(!manager.cancel_job(&second).await);
        assert_eq!(manager.job(&second).unwrap().status, BulkStatus::Cancelled);
        assert_eq!(manager.list_jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_export_report_includes_duration_and_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let id = manager.create_job(results(&["https://a/1", "broken"]), "report", JobOptions::default());
        manager.process_job(&id).await.unwrap();

        let report = manager.export_job_report(&id).await.unwrap();
        assert_eq!(report.tasks.len(), 2);
        assert!(report.duration_secs.is_some());
        assert!(report.tasks[0].outcome.as_ref().unwrap().is_downloaded());
        assert!(report.tasks[1].task.is_none());
        assert!(manager.export_job_report("missing").await.is_none());
    }
}
