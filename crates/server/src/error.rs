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

use axum::{Json, http::StatusCode, response::IntoResponse};
use hubstream_cache::CacheError;
use serde::Serialize;
use snafu::Snafu;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ApiError {
    #[snafu(display("invalid request: {reason}"))]
    InvalidRequest { reason: String },

    #[snafu(display("entry not found"))]
    EntryNotFound,

    #[snafu(display("range not satisfiable: {reason}"))]
    RangeNotSatisfiable { reason: String },

    #[snafu(display("origin request failed: {source}"))]
    OriginRequest { source: reqwest::Error },

    #[snafu(display("origin returned HTTP {status}"))]
    OriginStatus { status: u16 },

    #[snafu(display("origin response is missing Content-Length"))]
    MissingLength,

    #[snafu(display("cache engine error: {source}"))]
    Cache { source: CacheError },
}

impl ApiError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::EntryNotFound => StatusCode::NOT_FOUND,
            ApiError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::OriginRequest { .. }
            | ApiError::OriginStatus { .. }
            | ApiError::MissingLength => StatusCode::BAD_GATEWAY,
            ApiError::Cache { source } => match source {
                CacheError::InvalidRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ErrorBody {
            message: self.to_string(),
        });
        (self.status_code(), body).into_response()
    }
}

impl From<CacheError> for ApiError {
    fn from(source: CacheError) -> Self { ApiError::Cache { source } }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
