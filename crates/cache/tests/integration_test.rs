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

use std::{
    io::Write,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_test::TestServer;
use bytes::Bytes;
use hubstream_base::readable_size::ReadableSize;
use hubstream_cache::{
    CacheError, DownloadConfig, Downloader, RangeKind, RangeRequest, RetryConfig, plan,
};
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const MIB: usize = 1024 * 1024;

#[derive(Clone)]
enum OriginMode {
    /// Serve the requested range as-is.
    Plain,
    /// Serve the requested range gzip-compressed with a Content-Encoding
    /// header.
    Gzip,
    /// Serve only the first N bytes of every requested range.
    TruncateTo(usize),
    /// Stream a small prefix, then hold the body until released.
    Gated(Gate),
}

#[derive(Clone)]
struct Gate {
    release: Arc<Notify>,
}

#[derive(Clone)]
struct OriginState {
    content: Arc<Vec<u8>>,
    hits:    Arc<AtomicUsize>,
    ranges:  Arc<Mutex<Vec<String>>>,
    mode:    OriginMode,
}

async fn handle_get(headers: HeaderMap, State(state): State<OriginState>) -> Response {
    let total = state.content.len();
    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let Some((start, end)) = range_header
        .as_deref()
        .and_then(|value| parse_range(value, total))
    else {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    };

    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .ranges
        .lock()
        .unwrap()
        .push(range_header.unwrap_or_default());

    let slice = state.content[start..=end].to_vec();
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")).unwrap(),
    );

    match &state.mode {
        OriginMode::Plain => {
            response_headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&slice.len().to_string()).unwrap(),
            );
            (
                StatusCode::PARTIAL_CONTENT,
                response_headers,
                Bytes::from(slice),
            )
                .into_response()
        }
        OriginMode::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
            encoder.write_all(&slice).unwrap();
            let compressed = encoder.finish().unwrap();
            response_headers.insert(
                header::CONTENT_ENCODING,
                HeaderValue::from_static("gzip"),
            );
            response_headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&compressed.len().to_string()).unwrap(),
            );
            (
                StatusCode::PARTIAL_CONTENT,
                response_headers,
                Bytes::from(compressed),
            )
                .into_response()
        }
        OriginMode::TruncateTo(keep) => {
            let truncated = slice[..(*keep).min(slice.len())].to_vec();
            response_headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&truncated.len().to_string()).unwrap(),
            );
            (
                StatusCode::PARTIAL_CONTENT,
                response_headers,
                Bytes::from(truncated),
            )
                .into_response()
        }
        OriginMode::Gated(gate) => {
            let gate = gate.clone();
            let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(4);
            tokio::spawn(async move {
                let prefix = slice.len().min(64 * 1024);
                let _ = tx.send(Ok(Bytes::from(slice[..prefix].to_vec()))).await;
                gate.release.notified().await;
                let _ = tx.send(Ok(Bytes::from(slice[prefix..].to_vec()))).await;
            });
            (
                StatusCode::PARTIAL_CONTENT,
                response_headers,
                Body::from_stream(ReceiverStream::new(rx)),
            )
                .into_response()
        }
    }
}

fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let value = value.strip_prefix("bytes=")?;
    let (start_str, end_str) = value.split_once('-')?;
    let start: usize = start_str.parse().ok()?;
    let end: usize = end_str.parse().ok()?;
    if start <= end && end < total {
        Some((start, end))
    } else {
        None
    }
}

fn create_origin(state: OriginState) -> TestServer {
    let app = Router::new()
        .route("/file", get(handle_get))
        .with_state(state);

    TestServer::builder()
        .http_transport()
        .build(app)
        .expect("failed to create test server")
}

fn origin_url(server: &TestServer) -> String {
    let base = server
        .server_address()
        .expect("server should have HTTP address")
        .to_string();
    if base.ends_with('/') {
        format!("{base}file")
    } else {
        format!("{base}/file")
    }
}

fn origin_state(content: Vec<u8>, mode: OriginMode) -> OriginState {
    OriginState {
        content: Arc::new(content),
        hits: Arc::new(AtomicUsize::new(0)),
        ranges: Arc::new(Mutex::new(Vec::new())),
        mode,
    }
}

fn test_config() -> DownloadConfig {
    DownloadConfig {
        block_size: ReadableSize::mb(1),
        resp_chunk_size: ReadableSize::kb(64),
        range_submit_delay: 0,
        max_workers_per_file: 4,
        req_timeout: 10,
        ..Default::default()
    }
}

fn test_retry() -> RetryConfig {
    RetryConfig {
        attempts: 2,
        delay:    0,
    }
}

fn make_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

fn request_for(dir: &TempDir, server: &TestServer, file_size: usize, start: u64, end: u64) -> RangeRequest {
    RangeRequest {
        path:          dir.path().join("artifact.bin"),
        url:           origin_url(server),
        authorization: None,
        file_size:     file_size as u64,
        start,
        end,
    }
}

async fn collect(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(frame) = rx.recv().await {
        out.extend_from_slice(&frame);
    }
    out
}

#[tokio::test]
async fn cold_fetch_populates_cache_then_serves_warm_hits() {
    let content = make_content(2 * MIB + 512 * 1024);
    let state = origin_state(content.clone(), OriginMode::Plain);
    let server = create_origin(state.clone());
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(test_config(), test_retry()).unwrap();
    let request = request_for(&dir, &server, content.len(), 0, content.len() as u64);

    let rx = downloader
        .stream_range(request.clone(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(collect(rx).await, content);
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    assert_eq!(downloader.registry().open_files(), 0);

    // Every block converged; a fresh plan over the full range is all
    // cache hits.
    {
        let handle = downloader
            .registry()
            .acquire(&request.path, request.file_size)
            .unwrap();
        assert_eq!(handle.cached_blocks(), 3);
        let tasks = plan(&handle, 0, request.file_size, 0).unwrap();
        assert!(tasks.iter().all(|t| t.kind == RangeKind::Cached));
    }

    // The warm hit never touches origin.
    let rx = downloader
        .stream_range(request, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(collect(rx).await, content);
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    assert_eq!(downloader.registry().open_files(), 0);
}

#[tokio::test]
async fn warm_subrange_is_served_from_disk() {
    let content = make_content(2 * MIB);
    let state = origin_state(content.clone(), OriginMode::Plain);
    let server = create_origin(state.clone());
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(test_config(), test_retry()).unwrap();
    let full = request_for(&dir, &server, content.len(), 0, content.len() as u64);
    let rx = downloader
        .stream_range(full.clone(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(collect(rx).await, content);

    // A sub-range crossing both blocks, clipped mid-block at both ends.
    let (start, end) = (512 * 1024 + 7, MIB + 1234);
    let sub = RangeRequest {
        start: start as u64,
        end: end as u64,
        ..full
    };
    let rx = downloader
        .stream_range(sub, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(collect(rx).await, &content[start..end]);
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mixed_plan_interleaves_cache_and_remote_in_order() {
    let content = make_content(2 * MIB + 512 * 1024);
    let state = origin_state(content.clone(), OriginMode::Plain);
    let server = create_origin(state.clone());
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(test_config(), test_retry()).unwrap();

    // Warm exactly the middle block.
    let middle = request_for(&dir, &server, content.len(), MIB as u64, 2 * MIB as u64);
    let rx = downloader
        .stream_range(middle.clone(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(collect(rx).await, &content[MIB..2 * MIB]);
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    // Full read: remote head, cached middle, remote tail, byte-exact.
    let full = RangeRequest {
        start: 0,
        end: content.len() as u64,
        ..middle
    };
    let rx = downloader
        .stream_range(full, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(collect(rx).await, content);
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn remote_runs_are_split_by_range_size() {
    let content = make_content(2 * MIB);
    let state = origin_state(content.clone(), OriginMode::Plain);
    let server = create_origin(state.clone());
    let dir = TempDir::new().unwrap();

    let config = DownloadConfig {
        remote_range_size: ReadableSize::mb(1),
        ..test_config()
    };
    let downloader = Downloader::new(config, test_retry()).unwrap();
    let request = request_for(&dir, &server, content.len(), 0, content.len() as u64);

    let rx = downloader
        .stream_range(request, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(collect(rx).await, content);
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);

    let mut ranges = state.ranges.lock().unwrap().clone();
    ranges.sort();
    assert_eq!(
        ranges,
        vec!["bytes=0-1048575".to_string(), "bytes=1048576-2097151".to_string()]
    );
}

#[tokio::test]
async fn encoded_origin_is_buffered_and_decoded_before_emitting() {
    let content = make_content(MIB + 512 * 1024);
    let state = origin_state(content.clone(), OriginMode::Gzip);
    let server = create_origin(state.clone());
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(test_config(), test_retry()).unwrap();
    let request = request_for(&dir, &server, content.len(), 0, content.len() as u64);

    let rx = downloader
        .stream_range(request.clone(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(collect(rx).await, content);
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    // The decoded length matched, so both blocks persisted (the second
    // one zero-padded).
    let handle = downloader
        .registry()
        .acquire(&request.path, request.file_size)
        .unwrap();
    assert_eq!(handle.cached_blocks(), 2);
}

#[tokio::test]
async fn truncated_origin_stream_yields_short_response_and_keeps_full_blocks() {
    let content = make_content(MIB + 512 * 1024);
    let state = origin_state(content.clone(), OriginMode::TruncateTo(MIB));
    let server = create_origin(state.clone());
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(test_config(), test_retry()).unwrap();
    let request = request_for(&dir, &server, content.len(), 0, content.len() as u64);

    let rx = downloader
        .stream_range(request.clone(), CancellationToken::new())
        .await
        .unwrap();
    let received = collect(rx).await;

    // The client observes exactly the contiguous prefix that arrived.
    assert_eq!(received, &content[..MIB]);

    // The block completed before the truncation point stays cached.
    let handle = downloader
        .registry()
        .acquire(&request.path, request.file_size)
        .unwrap();
    assert!(handle.has_block(0).unwrap());
    assert!(!handle.has_block(1).unwrap());
}

#[tokio::test]
async fn cancellation_stops_workers_and_releases_handles() {
    let content = make_content(4 * MIB);
    let gate = Gate {
        release: Arc::new(Notify::new()),
    };
    let state = origin_state(content.clone(), OriginMode::Gated(gate.clone()));
    let server = create_origin(state.clone());
    let dir = TempDir::new().unwrap();

    let config = DownloadConfig {
        remote_range_size: ReadableSize::mb(1),
        ..test_config()
    };
    let downloader = Downloader::new(config, test_retry()).unwrap();
    let request = request_for(&dir, &server, content.len(), 0, content.len() as u64);

    let cancel = CancellationToken::new();
    let mut rx = downloader
        .stream_range(request, cancel.clone())
        .await
        .unwrap();

    // Wait until real payload bytes are flowing, then cancel mid-stream.
    let mut received = 0usize;
    while received == 0 {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("stream should produce a frame")
            .expect("stream should not close before cancellation");
        received += frame.len();
    }
    cancel.cancel();

    // The response channel must close within a bounded time.
    tokio::time::timeout(Duration::from_secs(5), async {
        while rx.recv().await.is_some() {}
    })
    .await
    .expect("response channel should close after cancellation");

    // All workers exit and the refcount returns to zero.
    tokio::time::timeout(Duration::from_secs(5), async {
        while downloader.registry().open_files() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("cache handle should be released after cancellation");

    // Unblock any origin handler still parked on the gate.
    gate.release.notify_waiters();
}

#[tokio::test]
async fn concurrent_requests_share_one_block_file() {
    let content = make_content(2 * MIB);
    let state = origin_state(content.clone(), OriginMode::Plain);
    let server = create_origin(state.clone());
    let dir = TempDir::new().unwrap();

    let downloader = Arc::new(Downloader::new(test_config(), test_retry()).unwrap());
    let request = request_for(&dir, &server, content.len(), 0, content.len() as u64);

    let mut streams = Vec::new();
    for _ in 0..2 {
        let rx = downloader
            .stream_range(request.clone(), CancellationToken::new())
            .await
            .unwrap();
        streams.push(tokio::spawn(collect(rx)));
    }
    for stream in streams {
        assert_eq!(stream.await.unwrap(), content);
    }

    // Duplicate block writes were no-ops; the cache converged and every
    // handle was released.
    let handle = downloader
        .registry()
        .acquire(&request.path, request.file_size)
        .unwrap();
    assert_eq!(handle.cached_blocks(), 2);
    drop(handle);
    assert_eq!(downloader.registry().open_files(), 0);
}

#[tokio::test]
async fn invalid_ranges_are_rejected_before_streaming() {
    let content = make_content(MIB);
    let state = origin_state(content.clone(), OriginMode::Plain);
    let server = create_origin(state.clone());
    let dir = TempDir::new().unwrap();

    let downloader = Downloader::new(test_config(), test_retry()).unwrap();

    for (start, end) in [(10, 10), (MIB as u64, 10), (0, MIB as u64 + 1)] {
        let request = request_for(&dir, &server, content.len(), start, end);
        let result = downloader
            .stream_range(request, CancellationToken::new())
            .await;
        assert!(
            matches!(result, Err(CacheError::InvalidRange { .. })),
            "range [{start}, {end}) should be rejected"
        );
    }
    assert_eq!(state.hits.load(Ordering::SeqCst), 0);
    assert_eq!(downloader.registry().open_files(), 0);

    // The zero range is "no content requested": an immediately closed,
    // empty stream.
    let request = request_for(&dir, &server, content.len(), 0, 0);
    let rx = downloader
        .stream_range(request, CancellationToken::new())
        .await
        .unwrap();
    assert!(collect(rx).await.is_empty());
    assert_eq!(state.hits.load(Ordering::SeqCst), 0);
}
