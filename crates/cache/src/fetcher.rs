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

//! Execution of a single remote fetch task.
//!
//! The fetcher streams `[start, end)` from origin into the task's output
//! queue in order and, as a side effect, persists every block the range
//! fully covered. Two cooperating halves run per task: a body reader
//! feeding an internal chunk channel, and a consumer that forwards frames
//! downstream while doing block accounting. Block writes never reorder or
//! gate the output stream.
//!
//! Retries wrap only the initial request. Once the body has started
//! flowing, a failure is terminal for the task: the queue closes early and
//! the client observes a short response, while blocks completed before the
//! failure stay persisted.

use std::{io::Read, sync::Arc};

use backon::{ConstantBuilder, Retryable};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{StatusCode, header};
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    block_file::BlockFile,
    config::{DownloadConfig, RetryConfig},
    error::{
        CacheError, DecodeSnafu, JoinSnafu, NetworkSnafu, OriginSnafu, Result,
        StreamTruncatedSnafu, UnsupportedEncodingSnafu,
    },
    slicer::{BlockSlicer, CompleteBlock},
};

pub(crate) struct RemoteFetcher {
    pub client:        reqwest::Client,
    pub url:           String,
    pub authorization: Option<String>,
    pub config:        DownloadConfig,
    pub retry:         RetryConfig,
    pub file:          Arc<BlockFile>,
    pub task_no:       usize,
    pub start:         u64,
    pub end:           u64,
    pub queue:         mpsc::Sender<Bytes>,
    pub cancel:        CancellationToken,
}

impl RemoteFetcher {
    /// Stream the task's range from origin into the output queue.
    ///
    /// The queue sender is dropped on return, which is how the assembler
    /// learns the task is finished (or has died).
    pub(crate) async fn run(self) -> Result<()> {
        info!(
            url = %self.url,
            task_no = self.task_no,
            start = self.start,
            end = self.end,
            "remote range fetch",
        );

        let response = self.open_stream().await?;
        let content_encoding = response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let content_length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let expected = self.end - self.start;
        let chunk_size =
            usize::try_from(self.config.resp_chunk_size.as_bytes()).expect("chunk fits in usize");
        let (content_tx, mut content_rx) = mpsc::channel::<Bytes>(self.config.resp_chan_size);

        let reader = tokio::spawn(read_body(
            response,
            content_encoding,
            content_length,
            expected,
            chunk_size,
            content_tx,
            self.cancel.clone(),
        ));

        let mut slicer = BlockSlicer::new(self.file.file_size(), self.file.block_size(), self.start);
        let mut stream_done = false;
        loop {
            let frame = tokio::select! {
                frame = content_rx.recv() => frame,
                () = self.cancel.cancelled() => {
                    debug!(task_no = self.task_no, "remote task cancelled");
                    break;
                }
            };
            let Some(frame) = frame else {
                stream_done = true;
                break;
            };
            if self.queue.send(frame.clone()).await.is_err() {
                // The assembler is gone; stop pulling from origin.
                break;
            }
            for completed in slicer.push(&frame) {
                self.persist_block(completed).await;
            }
        }
        drop(content_rx);

        let received = slicer.bytes_seen();
        let tail = if stream_done { slicer.finish() } else { None };

        let read_result = reader.await.context(JoinSnafu)?;
        read_result?;

        if stream_done {
            if let Some(completed) = tail {
                self.persist_block(completed).await;
            }
            if received != expected {
                warn!(
                    task_no = self.task_no,
                    expected, received, "remote range shorter than requested",
                );
            }
        }
        Ok(())
    }

    /// Issue the ranged GET, retrying transient failures until the body
    /// starts flowing.
    async fn open_stream(&self) -> Result<reqwest::Response> {
        let backoff = ConstantBuilder::default()
            .with_delay(self.retry.delay())
            .with_max_times(self.retry.attempts.saturating_sub(1));

        (|| self.try_open_stream())
            .retry(backoff)
            .when(CacheError::is_retryable)
            .await
    }

    async fn try_open_stream(&self) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .get(&self.url)
            .timeout(self.config.req_timeout())
            .header(
                header::RANGE,
                format!("bytes={}-{}", self.start, self.end - 1),
            );
        if let Some(auth) = &self.authorization {
            request = request.header(header::AUTHORIZATION, auth);
        }

        let response = request.send().await.context(NetworkSnafu)?;
        let status = response.status();
        if status == StatusCode::OK {
            // A full-body answer only matches when the range is the file.
            ensure!(
                self.start == 0 && self.end == self.file.file_size(),
                OriginSnafu {
                    status: status.as_u16(),
                    url:    self.url.clone(),
                }
            );
        } else {
            ensure!(
                status == StatusCode::PARTIAL_CONTENT,
                OriginSnafu {
                    status: status.as_u16(),
                    url:    self.url.clone(),
                }
            );
        }
        Ok(response)
    }

    /// Persist a fully covered block. Failures degrade the hit rate of
    /// future requests, never the current response, so they are logged
    /// and swallowed.
    async fn persist_block(&self, completed: CompleteBlock) {
        let file = Arc::clone(&self.file);
        let block = completed.block;
        let result =
            tokio::task::spawn_blocking(move || file.write_block(completed.block, &completed.bytes))
                .await;
        match result {
            Ok(Ok(())) => {
                debug!(task_no = self.task_no, block, "block persisted");
            }
            Ok(Err(e)) => {
                warn!(task_no = self.task_no, block, error = %e, "block persistence failed");
            }
            Err(e) => {
                warn!(task_no = self.task_no, block, error = %e, "block persistence task failed");
            }
        }
    }
}

/// Read the response body, forwarding frames of at most `chunk_size`
/// bytes into `tx`.
///
/// An encoded body cannot be sliced on block boundaries incrementally, so
/// it is buffered whole, decoded at end-of-stream, and emitted as one
/// frame. Length validation runs after decoding.
async fn read_body(
    response: reqwest::Response,
    content_encoding: Option<String>,
    content_length: Option<u64>,
    expected: u64,
    chunk_size: usize,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stream = response.bytes_stream();
    let mut raw = BytesMut::new();
    let mut received: u64 = 0;

    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            () = cancel.cancelled() => return Ok(()),
        };
        let Some(chunk) = next else { break };
        let mut chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "origin stream failed mid-transfer");
                return StreamTruncatedSnafu {
                    expected,
                    actual: received,
                }
                .fail();
            }
        };

        received += chunk.len() as u64;
        if content_encoding.is_some() {
            raw.extend_from_slice(&chunk);
        } else {
            while !chunk.is_empty() {
                let take = chunk.len().min(chunk_size);
                let piece = chunk.split_to(take);
                if tx.send(piece).await.is_err() {
                    // Consumer is gone; nothing left to do.
                    return Ok(());
                }
            }
        }
    }

    if let Some(encoding) = content_encoding {
        let decoded = decompress(&raw, &encoding)?;
        received = decoded.len() as u64;
        ensure!(
            received == expected,
            StreamTruncatedSnafu {
                expected,
                actual: received,
            }
        );
        if tx.send(decoded.into()).await.is_err() {
            return Ok(());
        }
        return Ok(());
    }

    if let Some(length) = content_length {
        ensure!(
            length == expected,
            StreamTruncatedSnafu {
                expected,
                actual: length,
            }
        );
    }
    ensure!(
        received == expected,
        StreamTruncatedSnafu {
            expected,
            actual: received,
        }
    );
    Ok(())
}

fn decompress(raw: &[u8], encoding: &str) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    match encoding.to_ascii_lowercase().as_str() {
        "gzip" | "x-gzip" => {
            flate2::read::GzDecoder::new(raw)
                .read_to_end(&mut decoded)
                .context(DecodeSnafu { encoding })?;
        }
        "deflate" => {
            flate2::read::ZlibDecoder::new(raw)
                .read_to_end(&mut decoded)
                .context(DecodeSnafu { encoding })?;
        }
        "identity" => decoded.extend_from_slice(raw),
        _ => {
            return UnsupportedEncodingSnafu { encoding }.fail();
        }
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_decompress_gzip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello blocks").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decompress(&compressed, "gzip").unwrap();
        assert_eq!(decoded, b"hello blocks");
    }

    #[test]
    fn test_decompress_identity_passthrough() {
        assert_eq!(decompress(b"as-is", "identity").unwrap(), b"as-is");
    }

    #[test]
    fn test_decompress_unknown_encoding() {
        assert!(matches!(
            decompress(b"", "br"),
            Err(CacheError::UnsupportedEncoding { .. })
        ));
    }
}
