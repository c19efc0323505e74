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

//! Revision-metadata passthrough.
//!
//! `/api/{repo_type}/{org}/{repo}/revision/{commit}` is proxied verbatim;
//! GET bodies are additionally persisted as a JSON document so an offline
//! mirror can keep answering metadata queries for revisions it has seen.
//! This path is orthogonal to the block engine.

use std::path::Path as FsPath;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use backon::{ConstantBuilder, Retryable};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{ApiError, ApiResult},
    headers::extract_headers,
    routes::{
        AppState, ensure_repo_type, forwarded_authorization, head_origin, not_found_for_404,
        retryable_origin_error,
    },
};

/// A proxied metadata response persisted for offline serving.
#[derive(Debug, Serialize, Deserialize)]
struct CachedMeta {
    status:    u16,
    headers:   Vec<(String, String)>,
    body:      String,
    cached_at: i64,
}

pub(crate) async fn meta_head(
    State(state): State<AppState>,
    Path((repo_type, org, repo, commit)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_repo_type(&repo_type)?;
    let url = state.settings.origin_meta_url(&repo_type, &org, &repo, &commit);
    let authorization = forwarded_authorization(&headers);

    let origin = head_origin(&state, &url, authorization.as_deref()).await?;
    let status = origin.status();
    let mut response_headers = extract_headers(origin.headers());
    if let Some(length) = origin.headers().get(header::CONTENT_LENGTH) {
        response_headers.insert(header::CONTENT_LENGTH, length.clone());
    }
    Ok((status, response_headers).into_response())
}

pub(crate) async fn meta_get(
    State(state): State<AppState>,
    Path((repo_type, org, repo, commit)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_repo_type(&repo_type)?;
    let cache_path = state
        .settings
        .meta_cache_path(&repo_type, &org, &repo, &commit);

    if !state.settings.server.online {
        if let Some(cached) = load_cached(&cache_path).await {
            info!(repo_type, org, repo, commit, "serving metadata from cache");
            return Ok(cached_response(cached));
        }
        return Err(ApiError::EntryNotFound);
    }

    let url = state.settings.origin_meta_url(&repo_type, &org, &repo, &commit);
    let authorization = forwarded_authorization(&headers);
    let origin = get_origin(&state, &url, authorization.as_deref()).await?;

    let status = origin.status();
    let origin_headers = extract_headers(origin.headers());
    let body = origin
        .bytes()
        .await
        .map_err(|source| ApiError::OriginRequest { source })?;

    let document = CachedMeta {
        status:    status.as_u16(),
        headers:   origin_headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body:      String::from_utf8_lossy(&body).into_owned(),
        cached_at: Timestamp::now().as_second(),
    };
    if let Err(e) = store_cached(&cache_path, &document).await {
        warn!(path = %cache_path.display(), error = %e, "failed to persist metadata document");
    }

    let mut response_headers = origin_headers;
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    Ok((status, response_headers, Body::from(body)).into_response())
}

async fn get_origin(
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
            .get(url)
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

async fn load_cached(path: &FsPath) -> Option<CachedMeta> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&raw) {
        Ok(document) => Some(document),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding unreadable metadata document");
            None
        }
    }
}

async fn store_cached(path: &FsPath, document: &CachedMeta) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let rendered = serde_json::to_string_pretty(document).map_err(std::io::Error::other)?;
    tokio::fs::write(path, rendered).await
}

fn cached_response(cached: CachedMeta) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    let mut response_headers = HeaderMap::new();
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            response_headers.insert(name, value);
        }
    }
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(cached.body.len()));
    (status, response_headers, Body::from(cached.body)).into_response()
}
