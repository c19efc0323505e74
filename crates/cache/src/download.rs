// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Orchestration of a ranged read: plan, fetch, reassemble.
//!
//! For each request the driver acquires a shared cache handle, plans the
//! range, dispatches remote sub-ranges through a bounded worker pool, and
//! drains every task's output queue in plan order into one back-pressured
//! response channel. Byte order on the response channel is strictly
//! ascending regardless of how fetches interleave; block persistence is a
//! side effect that the next request observes, never this one.

use std::{path::PathBuf, sync::Arc, time::Duration};

use bon::Builder;
use bytes::Bytes;
use snafu::ResultExt;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    block_file::BlockFile,
    config::{DownloadConfig, RetryConfig},
    error::{JoinSnafu, Result},
    fetcher::RemoteFetcher,
    planner::{self, PlannedRange, RangeKind},
    registry::{CacheHandle, CacheRegistry},
};

/// A ranged read of one artifact.
#[derive(Debug, Clone, Builder)]
pub struct RangeRequest {
    /// Cache location of the artifact on disk.
    pub path: PathBuf,
    /// Origin URL the artifact is fetched from.
    pub url: String,
    /// Authorization header value forwarded to origin, if any.
    pub authorization: Option<String>,
    /// Authoritative total size of the artifact.
    pub file_size: u64,
    /// Inclusive start offset.
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
}

/// The cache engine front door: owns the HTTP client, the registry of
/// open block files, and the download configuration.
pub struct Downloader {
    config:   DownloadConfig,
    retry:    RetryConfig,
    client:   reqwest::Client,
    registry: Arc<CacheRegistry>,
}

impl Downloader {
    /// Build a downloader after validating the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` when a field is out of range, `Network` when the
    /// HTTP client cannot be constructed.
    pub fn new(config: DownloadConfig, retry: RetryConfig) -> Result<Self> {
        config.validate()?;
        retry.validate()?;

        let client = reqwest::Client::builder()
            .build()
            .context(crate::error::NetworkSnafu)?;
        let registry = CacheRegistry::new(config.block_size.as_bytes());

        Ok(Self {
            config,
            retry,
            client,
            registry,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CacheRegistry> { &self.registry }

    #[must_use]
    pub fn config(&self) -> &DownloadConfig { &self.config }

    /// Start streaming `[start, end)` of the requested artifact.
    ///
    /// Planning happens up front so precondition violations surface here;
    /// the returned receiver then yields the body frames in offset order,
    /// beginning with an empty keepalive frame. The channel closes when
    /// the range is exhausted, the request is cancelled, or a task dies
    /// (in which case the client sees a short body).
    ///
    /// # Errors
    /// `InvalidRange` for bad preconditions, `CorruptMetadata`/`DataIo`
    /// when the cached file cannot be opened.
    pub async fn stream_range(
        &self,
        request: RangeRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Bytes>> {
        let handle = self.registry.acquire(&request.path, request.file_size)?;
        let plan = planner::plan(
            &handle,
            request.start,
            request.end,
            self.config.remote_range_size.as_bytes(),
        )?;

        let (response_tx, response_rx) = mpsc::channel(self.config.resp_chan_size);
        let driver = Driver {
            config: self.config.clone(),
            retry: self.retry,
            client: self.client.clone(),
            request,
            handle,
            plan,
            cancel,
            response_tx,
        };
        tokio::spawn(driver.run());

        Ok(response_rx)
    }
}

/// One planned task at runtime. The assembler treats both variants as
/// opaque frame producers.
enum Task {
    Cached(PlannedRange),
    Remote {
        range: PlannedRange,
        queue: mpsc::Receiver<Bytes>,
    },
}

struct Driver {
    config:      DownloadConfig,
    retry:       RetryConfig,
    client:      reqwest::Client,
    request:     RangeRequest,
    handle:      CacheHandle,
    plan:        Vec<PlannedRange>,
    cancel:      CancellationToken,
    response_tx: mpsc::Sender<Bytes>,
}

impl Driver {
    async fn run(self) {
        let file = self.handle.block_file();

        let mut remote = Vec::new();
        let mut tasks = Vec::with_capacity(self.plan.len());
        for range in &self.plan {
            match range.kind {
                RangeKind::Cached => tasks.push(Task::Cached(*range)),
                RangeKind::Remote => {
                    let (tx, rx) = mpsc::channel(self.config.queue_size(range.len()));
                    remote.push((*range, tx));
                    tasks.push(Task::Remote {
                        range: *range,
                        queue: rx,
                    });
                }
            }
        }

        let submitter = if remote.is_empty() {
            None
        } else {
            Some(tokio::spawn(submit_remote_tasks(
                self.client.clone(),
                self.config.clone(),
                self.retry,
                self.request.url.clone(),
                self.request.authorization.clone(),
                Arc::clone(&file),
                remote,
                self.cancel.clone(),
            )))
        };

        self.assemble(&file, tasks).await;

        if let Some(submitter) = submitter {
            if let Err(e) = submitter.await {
                error!(error = %e, "remote submitter panicked");
            }
        }
        // The handle drops here, releasing the registry reference.
    }

    /// Walk the plan in order, draining each task into the response
    /// channel. Guarantees ascending byte order.
    async fn assemble(&self, file: &Arc<BlockFile>, tasks: Vec<Task>) {
        let mut tasks = tasks;
        for (index, task) in tasks.iter_mut().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            if index == 0 {
                // Zero-length frame opens the long connection before the
                // first origin byte arrives.
                if self.response_tx.send(Bytes::new()).await.is_err() {
                    return;
                }
            }
            match task {
                Task::Cached(range) => {
                    if let Err(e) = self.stream_cached(file, *range).await {
                        error!(
                            task_no = range.task_no,
                            error = %e,
                            "cache task failed, response will be short",
                        );
                        return;
                    }
                }
                Task::Remote { range, queue } => {
                    let mut drained: u64 = 0;
                    loop {
                        let frame = tokio::select! {
                            frame = queue.recv() => frame,
                            () = self.cancel.cancelled() => return,
                        };
                        let Some(frame) = frame else { break };
                        drained += frame.len() as u64;
                        if self.response_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    if drained < range.len() {
                        // The fetcher died mid-stream. Ending the response
                        // here keeps the delivered prefix contiguous
                        // instead of splicing later tasks after a gap.
                        error!(
                            task_no = range.task_no,
                            expected = range.len(),
                            drained,
                            "remote task ended early, response will be short",
                        );
                        return;
                    }
                    debug!(task_no = range.task_no, "remote task drained");
                }
            }
        }
    }

    /// Produce a cached range by reading whole blocks and clipping the
    /// first and last one to the task interval.
    async fn stream_cached(&self, file: &Arc<BlockFile>, range: PlannedRange) -> Result<()> {
        let mut pos = range.start;
        while pos < range.end {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let (block, block_start, block_end) = file.block_bounds(pos);
            let reader = Arc::clone(file);
            let bytes = tokio::task::spawn_blocking(move || reader.read_block(block))
                .await
                .context(JoinSnafu)??;

            let from = usize::try_from(pos - block_start).expect("offset fits in usize");
            let to = usize::try_from(range.end.min(block_end) - block_start)
                .expect("offset fits in usize");
            if self.response_tx.send(bytes.slice(from..to)).await.is_err() {
                return Ok(());
            }
            pos = block_end;
        }
        Ok(())
    }
}

/// Submit remote tasks in plan order through a bounded pool of
/// `min(task_count, max_workers_per_file)` concurrent fetches, pacing
/// submissions by the configured delay.
#[allow(clippy::too_many_arguments)]
async fn submit_remote_tasks(
    client: reqwest::Client,
    config: DownloadConfig,
    retry: RetryConfig,
    url: String,
    authorization: Option<String>,
    file: Arc<BlockFile>,
    remote: Vec<(PlannedRange, mpsc::Sender<Bytes>)>,
    cancel: CancellationToken,
) {
    let task_count = remote.len();
    let pool = Arc::new(Semaphore::new(config.max_workers_per_file.min(task_count)));
    let mut joins = JoinSet::new();

    for (index, (range, queue)) in remote.into_iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let permit = tokio::select! {
            permit = Arc::clone(&pool).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            () = cancel.cancelled() => break,
        };

        let fetcher = RemoteFetcher {
            client: client.clone(),
            url: url.clone(),
            authorization: authorization.clone(),
            config: config.clone(),
            retry,
            file: Arc::clone(&file),
            task_no: range.task_no,
            start: range.start,
            end: range.end,
            queue,
            cancel: cancel.clone(),
        };
        joins.spawn(async move {
            let task_no = fetcher.task_no;
            let result = fetcher.run().await;
            drop(permit);
            (task_no, result)
        });

        if config.submit_delay() > Duration::ZERO && index + 1 < task_count {
            tokio::select! {
                () = tokio::time::sleep(config.submit_delay()) => {}
                () = cancel.cancelled() => break,
            }
        }
    }

    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok((task_no, Err(e))) => {
                warn!(task_no, error = %e, "remote task failed");
            }
            Ok((task_no, Ok(()))) => {
                debug!(task_no, "remote task finished");
            }
            Err(e) => {
                error!(error = %e, "remote task panicked");
            }
        }
    }
}
