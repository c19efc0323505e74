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

//! Artifact resolve routes: the request path that feeds the cache engine.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::head,
};
use backon::{ConstantBuilder, Retryable};
use futures::StreamExt;
use hubstream_cache::{CacheError, Downloader, RangeRequest};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    headers::{extract_headers, parse_range},
    meta,
    settings::Settings,
};

const REPO_TYPES: [&str; 3] = ["models", "datasets", "spaces"];

/// Shared state of every request handler.
#[derive(Clone)]
pub struct AppState {
    pub settings:   Arc<Settings>,
    pub downloader: Arc<Downloader>,
    pub client:     reqwest::Client,
    /// Root token; each streaming response runs under a child of it so
    /// server shutdown cancels in-flight downloads.
    pub cancel:     CancellationToken,
}

impl AppState {
    /// Build the state, including the cache engine and the origin HTTP
    /// client.
    ///
    /// # Errors
    /// Propagates configuration validation and client construction
    /// failures.
    pub fn new(settings: Arc<Settings>, cancel: CancellationToken) -> Result<Self, CacheError> {
        let downloader = Downloader::new(settings.download.clone(), settings.retry)?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|source| CacheError::Network { source })?;
        Ok(Self {
            settings,
            downloader: Arc::new(downloader),
            client,
            cancel,
        })
    }
}

/// Assemble the mirror's routes on top of the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/{repo_type}/{org}/{repo}/resolve/{commit}/{*file_path}",
            head(resolve_head).get(resolve_get),
        )
        .route(
            "/api/{repo_type}/{org}/{repo}/revision/{commit}",
            head(meta::meta_head).get(meta::meta_get),
        )
        .with_state(state)
}

async fn resolve_head(
    State(state): State<AppState>,
    Path((repo_type, org, repo, commit, file_path)): Path<(String, String, String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_repo_type(&repo_type)?;
    let url = state
        .settings
        .origin_file_url(&repo_type, &org, &repo, &commit, &file_path);
    let authorization = forwarded_authorization(&headers);

    let origin = head_origin(&state, &url, authorization.as_deref()).await?;
    let status = origin.status();
    let mut response_headers = extract_headers(origin.headers());
    if let Some(length) = origin.headers().get(header::CONTENT_LENGTH) {
        response_headers.insert(header::CONTENT_LENGTH, length.clone());
    }
    Ok((status, response_headers).into_response())
}

async fn resolve_get(
    State(state): State<AppState>,
    Path((repo_type, org, repo, commit, file_path)): Path<(String, String, String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_repo_type(&repo_type)?;
    let url = state
        .settings
        .origin_file_url(&repo_type, &org, &repo, &commit, &file_path);
    let authorization = forwarded_authorization(&headers);

    // An origin HEAD establishes the authoritative size and the response
    // headers to copy.
    let origin = head_origin(&state, &url, authorization.as_deref()).await?;
    let file_size = origin
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or(ApiError::MissingLength)?;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let (start, end) = match range_header {
        Some(value) => parse_range(value, file_size)?,
        None => (0, file_size),
    };

    info!(
        repo_type,
        org, repo, commit, file_path, start, end, "resolve request"
    );

    let request = RangeRequest {
        path: state
            .settings
            .file_cache_path(&repo_type, &org, &repo, &commit, &file_path),
        url,
        authorization,
        file_size,
        start,
        end,
    };
    let body_rx = state
        .downloader
        .stream_range(request, state.cancel.child_token())
        .await?;
    let body = Body::from_stream(
        ReceiverStream::new(body_rx).map(Ok::<_, std::convert::Infallible>),
    );

    let mut response_headers = extract_headers(origin.headers());
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(end - start));
    let status = if range_header.is_some() {
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!(
                "bytes {start}-{}/{file_size}",
                end.saturating_sub(1)
            ))
            .expect("numeric header value"),
        );
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    Ok((status, response_headers, body).into_response())
}

pub(crate) fn ensure_repo_type(repo_type: &str) -> ApiResult<()> {
    if REPO_TYPES.contains(&repo_type) {
        Ok(())
    } else {
        Err(ApiError::InvalidRequest {
            reason: format!("unknown repo type {repo_type:?}"),
        })
    }
}

pub(crate) fn forwarded_authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// Origin HEAD with the pre-stream retry policy. A 404 maps to the
/// mirror's own not-found answer; other failures surface as gateway
/// errors.
pub(crate) async fn head_origin(
    state: &AppState,
    url: &str,
    authorization: Option<&str>,
) -> ApiResult<reqwest::Response> {
    let retry = state.settings.retry;
    let backoff = ConstantBuilder::default()
        .with_delay(retry.delay())
        .with_max_times(retry.attempts.saturating_sub(1));

    let attempt = || async {
        let mut request = state
            .client
            .head(url)
            .timeout(state.settings.download.req_timeout());
        if let Some(auth) = authorization {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let response = request
            .send()
            .await
            .map_err(|source| ApiError::OriginRequest { source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::OriginStatus {
                status: status.as_u16(),
            });
        }
        Ok(response)
    };

    attempt
        .retry(backoff)
        .when(retryable_origin_error)
        .await
        .map_err(not_found_for_404)
}

pub(crate) fn retryable_origin_error(error: &ApiError) -> bool {
    match error {
        ApiError::OriginRequest { .. } => true,
        ApiError::OriginStatus { status } => *status >= 500,
        _ => false,
    }
}

pub(crate) fn not_found_for_404(error: ApiError) -> ApiError {
    match error {
        ApiError::OriginStatus { status: 404 } => ApiError::EntryNotFound,
        other => other,
    }
}
