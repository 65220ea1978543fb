//! reqwest-backed [`TransferClient`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::retry_after::parse_retry_after;
use super::{
    TaskHandle, TransferClient, TransferConfig, TransferError, TransferOutcome, TransferRequest, TransferState,
    TransferStatus,
};
use crate::fault::{Fault, FaultKind};
use crate::optimizer::PerformanceOptimizer;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

type SharedStatus = Arc<Mutex<TransferStatus>>;

/// How a body stream ended.
enum StreamEnd {
    Complete,
    /// The connection went idle across a pause and must be reopened.
    StalledAfterPause,
}

struct TaskEntry {
    status: SharedStatus,
    control: watch::Sender<Control>,
    join: Option<JoinHandle<Result<TransferOutcome, TransferError>>>,
}

/// Streams downloads over HTTP with resume, pause and hash verification.
///
/// Create once and share; the inner reqwest client pools connections.
pub struct HttpTransfer {
    client: Client,
    config: TransferConfig,
    optimizer: Option<Arc<PerformanceOptimizer>>,
    tasks: DashMap<TaskHandle, TaskEntry>,
    /// Waited-on handles, oldest first, kept for status queries.
    finished: Mutex<VecDeque<TaskHandle>>,
}

impl std::fmt::Debug for HttpTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransfer")
            .field("config", &self.config.to_string())
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl HttpTransfer {
    /// Builds the HTTP client from `config`.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error when TLS or proxy setup fails.
    ///
    /// `read_timeout_secs` bounds the idle time between reads, never the
    /// whole transfer, so large files on slow links are not cut off.
    pub fn new(config: TransferConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .gzip(true)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            config,
            optimizer: None,
            tasks: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
        })
    }

    /// Sizes write buffers from the optimizer and feeds it throughput samples.
    #[must_use]
    pub fn with_optimizer(mut self, optimizer: Arc<PerformanceOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    fn buffer_size(&self) -> usize {
        self.optimizer
            .as_ref()
            .map_or(self.config.buffer_size, |optimizer| optimizer.optimal_chunk_size())
            .max(8 * 1024)
    }

    /// Keeps the status of the last `retain_finished_tasks` waited-on
    /// transfers and forgets older ones.
    fn retire(&self, handle: &TaskHandle) {
        let evicted: Vec<TaskHandle> = {
            let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
            finished.push_back(handle.clone());
            let excess = finished.len().saturating_sub(self.config.retain_finished_tasks);
            finished.drain(..excess).collect()
        };
        for old in evicted {
            self.tasks.remove(&old);
            debug!(task = %old, "forgot finished transfer");
        }
    }

    fn signal(&self, handle: &TaskHandle, control: Control, state: TransferState) -> bool {
        let Some(entry) = self.tasks.get(handle) else {
            return false;
        };
        let mut status = entry.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.state.is_terminal() {
            return false;
        }
        if entry.control.send(control).is_err() {
            return false;
        }
        status.state = state;
        true
    }
}

#[async_trait]
impl TransferClient for HttpTransfer {
    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn start(&self, request: TransferRequest) -> Result<TaskHandle, TransferError> {
        Url::parse(&request.url).map_err(|_| TransferError::invalid_url(&request.url))?;

        let handle = TaskHandle::new();
        let status = Arc::new(Mutex::new(TransferStatus {
            state: TransferState::Queued,
            url: request.url.clone(),
            destination: request.destination.clone(),
            bytes_downloaded: 0,
            total_bytes: request.expected_size,
            resumed: false,
            error: None,
        }));
        let (control_tx, control_rx) = watch::channel(Control::Run);

        let job = TransferJob {
            client: self.client.clone(),
            api_token: self.config.api_token.clone(),
            buffer_size: self.buffer_size(),
            optimizer: self.optimizer.clone(),
            handle: handle.clone(),
            request,
            status: Arc::clone(&status),
            control: control_rx,
        };
        let join = tokio::spawn(job.run());

        self.tasks.insert(
            handle.clone(),
            TaskEntry {
                status,
                control: control_tx,
                join: Some(join),
            },
        );
        debug!(task = %handle, "transfer started");
        Ok(handle)
    }

    async fn wait(&self, handle: &TaskHandle) -> Result<TransferOutcome, TransferError> {
        let join = self
            .tasks
            .get_mut(handle)
            .and_then(|mut entry| entry.join.take())
            .ok_or_else(|| TransferError::UnknownTask { task: handle.clone() })?;

        let result = match join.await {
            Ok(result) => result,
            Err(error) => Err(TransferError::Aborted {
                task: handle.clone(),
                message: error.to_string(),
            }),
        };
        self.retire(handle);
        result
    }

    async fn status(&self, handle: &TaskHandle) -> Option<TransferStatus> {
        self.tasks
            .get(handle)
            .map(|entry| entry.status.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn pause(&self, handle: &TaskHandle) -> bool {
        self.signal(handle, Control::Pause, TransferState::Paused)
    }

    async fn resume(&self, handle: &TaskHandle) -> bool {
        self.signal(handle, Control::Run, TransferState::Running)
    }

    async fn cancel(&self, handle: &TaskHandle) -> bool {
        self.signal(handle, Control::Cancel, TransferState::Cancelled)
    }
}

/// State moved into the spawned transfer task.
struct TransferJob {
    client: Client,
    api_token: Option<String>,
    buffer_size: usize,
    optimizer: Option<Arc<PerformanceOptimizer>>,
    handle: TaskHandle,
    request: TransferRequest,
    status: SharedStatus,
    control: watch::Receiver<Control>,
}

impl TransferJob {
    async fn run(mut self) -> Result<TransferOutcome, TransferError> {
        self.update(|status| {
            if status.state == TransferState::Queued {
                status.state = TransferState::Running;
            }
        });
        if let Some(optimizer) = &self.optimizer {
            optimizer.register_connection(self.handle.as_str());
        }

        let started = Instant::now();
        let result = self.execute(started).await;

        match &result {
            Ok(outcome) => {
                self.update(|status| {
                    status.state = TransferState::Completed;
                    status.bytes_downloaded = outcome.bytes;
                });
                info!(
                    path = %outcome.path.display(),
                    bytes = outcome.bytes,
                    resumed = outcome.resumed,
                    "download complete"
                );
            }
            Err(TransferError::Cancelled { .. }) => {
                let part = part_path(&self.request.destination);
                if let Err(error) = tokio::fs::remove_file(&part).await {
                    debug!(%error, path = %part.display(), "no partial file to remove");
                }
                self.update(|status| status.state = TransferState::Cancelled);
                info!(task = %self.handle, "download cancelled");
            }
            Err(error) => {
                if let Some(optimizer) = &self.optimizer
                    && matches!(error.kind(), FaultKind::Connection | FaultKind::Timeout)
                {
                    optimizer.record_connection_error(self.handle.as_str());
                }
                let message = error.to_string();
                self.update(|status| {
                    status.state = TransferState::Failed;
                    status.error = Some(message);
                });
                warn!(task = %self.handle, %error, "download failed");
            }
        }

        if let Some(optimizer) = &self.optimizer {
            optimizer.unregister_connection(self.handle.as_str());
        }
        result
    }

    async fn execute(&mut self, started: Instant) -> Result<TransferOutcome, TransferError> {
        let url = self.request.url.clone();
        let destination = self.request.destination.clone();
        let part = part_path(&destination);

        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }

        let existing_bytes = tokio::fs::metadata(&part).await.map(|meta| meta.len()).unwrap_or(0);
        let supports_ranges = existing_bytes > 0 && self.probe_ranges(&url).await;
        let range = supports_ranges.then(|| format!("bytes={existing_bytes}-"));

        let response = self.send(&url, range.as_deref()).await?;
        let resumed = supports_ranges && response.status() == StatusCode::PARTIAL_CONTENT;
        let offset = if resumed { existing_bytes } else { 0 };
        let content_length = derive_total_content_length(&response, offset);

        self.update(|status| {
            status.resumed = resumed;
            status.bytes_downloaded = offset;
            if content_length.is_some() {
                status.total_bytes = content_length;
            }
        });
        debug!(path = %part.display(), resumed, offset, "streaming to partial file");

        let file = if resumed {
            OpenOptions::new()
                .append(true)
                .open(&part)
                .await
                .map_err(|e| TransferError::io(&part, e))?
        } else {
            File::create(&part).await.map_err(|e| TransferError::io(&part, e))?
        };

        let mut writer = BufWriter::with_capacity(self.buffer_size, file);
        let mut written: u64 = 0;
        let mut reconnected = false;
        let mut response = response;
        loop {
            match self
                .stream_to_file(&mut writer, response, &url, &part, offset, &mut written)
                .await?
            {
                StreamEnd::Complete => break,
                StreamEnd::StalledAfterPause => {
                    writer.flush().await.map_err(|e| TransferError::io(&part, e))?;
                    let position = offset.saturating_add(written);
                    info!(task = %self.handle, position, "reconnecting after pause");
                    response = self.reopen_at(&url, position).await?;
                    reconnected = true;
                }
            }
        }
        writer.flush().await.map_err(|e| TransferError::io(&part, e))?;
        drop(writer);
        let final_size = offset.saturating_add(written);

        if (resumed || reconnected) && let Some(expected) = content_length.filter(|expected| *expected != final_size) {
            remove_quietly(&part).await;
            return Err(TransferError::integrity(&part, expected, final_size));
        }

        if let Some(expected) = &self.request.expected_sha256 {
            let actual = sha256_file(&part).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                remove_quietly(&part).await;
                return Err(TransferError::HashMismatch {
                    path: destination,
                    expected: expected.clone(),
                    actual,
                });
            }
            debug!(path = %part.display(), "sha256 verified");
        }

        tokio::fs::rename(&part, &destination)
            .await
            .map_err(|e| TransferError::io(&destination, e))?;

        let elapsed = started.elapsed();
        if let Some(optimizer) = &self.optimizer {
            optimizer.record_transfer(written, elapsed);
        }

        Ok(TransferOutcome {
            path: destination,
            bytes: final_size,
            elapsed,
            resumed,
        })
    }

    async fn send(&self, url: &str, range: Option<&str>) -> Result<reqwest::Response, TransferError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(url, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = status.as_u16();
        if matches!(code, 401 | 403 | 407) {
            return Err(TransferError::auth_required(url, code));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        Err(TransferError::http_status(url, code, retry_after))
    }

    /// Requests the rest of the body from `position`. Fails with a timeout
    /// when the server cannot serve ranges, so the retry layer restarts it.
    async fn reopen_at(&self, url: &str, position: u64) -> Result<reqwest::Response, TransferError> {
        if !self.probe_ranges(url).await {
            return Err(TransferError::timeout(url));
        }
        let response = self.send(url, Some(&format!("bytes={position}-"))).await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::timeout(url));
        }
        Ok(response)
    }

    async fn probe_ranges(&self, url: &str) -> bool {
        let mut request = self.client.head(url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) => response
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.eq_ignore_ascii_case("bytes")),
            Err(error) => {
                debug!(%error, "range probe failed; downloading from scratch");
                false
            }
        }
    }

    /// Copies the body into `writer`, adding to `written`.
    ///
    /// The idle read timer keeps running while paused, so a read that fails
    /// right after a pause ends as [`StreamEnd::StalledAfterPause`].
    async fn stream_to_file(
        &mut self,
        writer: &mut BufWriter<File>,
        response: reqwest::Response,
        url: &str,
        part: &Path,
        offset: u64,
        written: &mut u64,
    ) -> Result<StreamEnd, TransferError> {
        let mut stream = response.bytes_stream();
        let mut control_open = true;
        let mut paused_since_read = false;

        loop {
            paused_since_read |= self.wait_while_paused().await?;

            let next = tokio::select! {
                chunk = stream.next() => chunk,
                changed = self.control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                    }
                    continue;
                }
            };
            let Some(chunk) = next else {
                return Ok(StreamEnd::Complete);
            };

            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) if paused_since_read => {
                    debug!(%error, task = %self.handle, "stream stalled across a pause");
                    return Ok(StreamEnd::StalledAfterPause);
                }
                Err(error) => return Err(TransferError::from_reqwest(url, &error)),
            };
            paused_since_read = false;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(part, e))?;
            *written += chunk.len() as u64;
            let total = offset + *written;
            self.update(|status| status.bytes_downloaded = total);
        }
    }

    /// Parks while paused and reports whether it parked. Returns `Cancelled`
    /// once a cancel is signalled.
    async fn wait_while_paused(&mut self) -> Result<bool, TransferError> {
        let mut parked = false;
        loop {
            let current = *self.control.borrow_and_update();
            match current {
                Control::Run => return Ok(parked),
                Control::Cancel => {
                    return Err(TransferError::Cancelled {
                        task: self.handle.clone(),
                    });
                }
                Control::Pause => {
                    parked = true;
                    if self.control.changed().await.is_err() {
                        return Ok(parked);
                    }
                }
            }
        }
    }

    fn update(&self, apply: impl FnOnce(&mut TransferStatus)) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut status);
    }
}

/// `model.safetensors` -> `model.safetensors.part`
fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    destination.with_file_name(name)
}

fn derive_total_content_length(response: &reqwest::Response, existing_bytes: u64) -> Option<u64> {
    let current = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if response.status() == StatusCode::PARTIAL_CONTENT {
        current.map(|remaining| existing_bytes.saturating_add(remaining))
    } else {
        current
    }
}

async fn sha256_file(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path).await.map_err(|e| TransferError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await.map_err(|e| TransferError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        debug!(%error, path = %path.display(), "could not remove partial file");
    }
}
