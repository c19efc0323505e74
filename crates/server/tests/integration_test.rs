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

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::head,
};
use axum_test::TestServer;
use bytes::Bytes;
use hubstream_base::readable_size::ReadableSize;
use hubstream_cache::DownloadConfig;
use hubstream_server::{
    routes::{AppState, router},
    settings::{ServerOptions, Settings},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const MIB: usize = 1024 * 1024;
const META_BODY: &str = r#"{"sha":"abcdef","siblings":[{"rfilename":"weights.bin"}]}"#;

#[derive(Clone)]
struct OriginState {
    content: Arc<Vec<u8>>,
    heads:   Arc<AtomicUsize>,
    gets:    Arc<AtomicUsize>,
    metas:   Arc<AtomicUsize>,
}

async fn origin_file_head(
    Path(file): Path<String>,
    State(state): State<OriginState>,
) -> Response {
    state.heads.fetch_add(1, Ordering::SeqCst);
    if file == "missing.bin" {
        return StatusCode::NOT_FOUND.into_response();
    }
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(state.content.len()),
    );
    headers.insert(header::ETAG, HeaderValue::from_static("\"origin-etag\""));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    (StatusCode::OK, headers).into_response()
}

async fn origin_file_get(
    Path(file): Path<String>,
    headers: HeaderMap,
    State(state): State<OriginState>,
) -> Response {
    if file == "missing.bin" {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.gets.fetch_add(1, Ordering::SeqCst);

    let total = state.content.len();
    let Some((start, end)) = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_range(value, total))
    else {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    };

    let slice = state.content[start..=end].to_vec();
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")).unwrap(),
    );
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(slice.len()));
    (
        StatusCode::PARTIAL_CONTENT,
        response_headers,
        Bytes::from(slice),
    )
        .into_response()
}

async fn origin_meta_get(State(state): State<OriginState>) -> Response {
    state.metas.fetch_add(1, Ordering::SeqCst);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    (StatusCode::OK, headers, META_BODY).into_response()
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
        .route(
            "/models/test-org/test-repo/resolve/main/{*file}",
            head(origin_file_head).get(origin_file_get),
        )
        .route(
            "/api/models/test-org/test-repo/revision/main",
            axum::routing::get(origin_meta_get),
        )
        .with_state(state);

    TestServer::builder()
        .http_transport()
        .build(app)
        .expect("failed to create origin server")
}

fn origin_base(server: &TestServer) -> String {
    server
        .server_address()
        .expect("origin should have an address")
        .to_string()
        .trim_end_matches('/')
        .to_string()
}

fn make_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(37) % 241) as u8).collect()
}

fn mirror_settings(origin: &TestServer, data_dir: &TempDir, online: bool) -> Settings {
    Settings {
        server: ServerOptions {
            origin: origin_base(origin),
            data_dir: data_dir.path().to_path_buf(),
            online,
            ..Default::default()
        },
        download: DownloadConfig {
            block_size: ReadableSize::mb(1),
            resp_chunk_size: ReadableSize::kb(64),
            range_submit_delay: 0,
            req_timeout: 10,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn mirror_server(settings: Settings) -> TestServer {
    let state = AppState::new(Arc::new(settings), CancellationToken::new())
        .expect("failed to build app state");
    TestServer::new(router(state)).expect("failed to create mirror server")
}

fn origin_state(content: Vec<u8>) -> OriginState {
    OriginState {
        content: Arc::new(content),
        heads:   Arc::new(AtomicUsize::new(0)),
        gets:    Arc::new(AtomicUsize::new(0)),
        metas:   Arc::new(AtomicUsize::new(0)),
    }
}

#[tokio::test]
async fn resolve_get_streams_full_file_and_caches_it() {
    let content = make_content(MIB + 4096);
    let state = origin_state(content.clone());
    let origin = create_origin(state.clone());
    let data_dir = TempDir::new().unwrap();
    let settings = mirror_settings(&origin, &data_dir, true);
    let cache_path = settings.file_cache_path("models", "test-org", "test-repo", "main", "weights.bin");
    let mirror = mirror_server(settings);

    let response = mirror
        .get("/models/test-org/test-repo/resolve/main/weights.bin")
        .await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().as_ref(), &content[..]);
    assert_eq!(
        response.header(header::ETAG),
        HeaderValue::from_static("\"origin-etag\"")
    );
    assert!(response.maybe_header(header::CONNECTION).is_none());
    assert!(cache_path.exists());

    // A second full read is served from disk: origin sees another HEAD
    // but no further ranged GETs.
    let gets_after_first = state.gets.load(Ordering::SeqCst);
    let response = mirror
        .get("/models/test-org/test-repo/resolve/main/weights.bin")
        .await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().as_ref(), &content[..]);
    assert_eq!(state.gets.load(Ordering::SeqCst), gets_after_first);
}

#[tokio::test]
async fn resolve_get_honors_range_requests() {
    let content = make_content(MIB + 4096);
    let state = origin_state(content.clone());
    let origin = create_origin(state.clone());
    let data_dir = TempDir::new().unwrap();
    let mirror = mirror_server(mirror_settings(&origin, &data_dir, true));

    let response = mirror
        .get("/models/test-org/test-repo/resolve/main/weights.bin")
        .add_header(header::RANGE, HeaderValue::from_static("bytes=100-4095"))
        .await;
    response.assert_status(StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.as_bytes().as_ref(), &content[100..4096]);
    assert_eq!(
        response.header(header::CONTENT_RANGE),
        HeaderValue::from_str(&format!("bytes 100-4095/{}", content.len())).unwrap()
    );

    let response = mirror
        .get("/models/test-org/test-repo/resolve/main/weights.bin")
        .add_header(
            header::RANGE,
            HeaderValue::from_str(&format!("bytes={}-", 2 * MIB)).unwrap(),
        )
        .await;
    response.assert_status(StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn resolve_head_passes_origin_headers_through() {
    let content = make_content(64 * 1024);
    let state = origin_state(content.clone());
    let origin = create_origin(state.clone());
    let data_dir = TempDir::new().unwrap();
    let mirror = mirror_server(mirror_settings(&origin, &data_dir, true));

    let response = mirror
        .method(
            axum::http::Method::HEAD,
            "/models/test-org/test-repo/resolve/main/weights.bin",
        )
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.header(header::CONTENT_LENGTH),
        HeaderValue::from(content.len())
    );
    assert_eq!(
        response.header(header::ETAG),
        HeaderValue::from_static("\"origin-etag\"")
    );
    // HEAD never triggers a ranged download.
    assert_eq!(state.gets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_repo_type_and_missing_files_are_rejected() {
    let content = make_content(1024);
    let state = origin_state(content);
    let origin = create_origin(state.clone());
    let data_dir = TempDir::new().unwrap();
    let mirror = mirror_server(mirror_settings(&origin, &data_dir, true));

    let response = mirror
        .get("/gists/test-org/test-repo/resolve/main/weights.bin")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let response = mirror
        .get("/models/test-org/test-repo/resolve/main/missing.bin")
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn meta_passthrough_caches_document_for_offline_serving() {
    let content = make_content(1024);
    let state = origin_state(content);
    let origin = create_origin(state.clone());
    let data_dir = TempDir::new().unwrap();
    let settings = mirror_settings(&origin, &data_dir, true);
    let meta_path = settings.meta_cache_path("models", "test-org", "test-repo", "main");

    // Online: the document is proxied and persisted.
    let mirror = mirror_server(settings);
    let response = mirror
        .get("/api/models/test-org/test-repo/revision/main")
        .await;
    response.assert_status_ok();
    assert_eq!(response.text(), META_BODY);
    assert_eq!(
        response.header(header::CONTENT_TYPE),
        HeaderValue::from_static("application/json")
    );
    assert!(meta_path.exists());
    assert_eq!(state.metas.load(Ordering::SeqCst), 1);

    // Offline: the cached document answers without touching origin.
    let offline = mirror_server(mirror_settings(&origin, &data_dir, false));
    let response = offline
        .get("/api/models/test-org/test-repo/revision/main")
        .await;
    response.assert_status_ok();
    assert_eq!(response.text(), META_BODY);
    assert_eq!(state.metas.load(Ordering::SeqCst), 1);

    // Offline without a cached document is a miss.
    let response = offline
        .get("/api/models/test-org/other-repo/revision/main")
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}
