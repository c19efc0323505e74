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

//! Header plumbing between origin and client.

use axum::http::{HeaderMap, header};

use crate::error::{ApiError, ApiResult};

/// Hop-by-hop headers (RFC 9110 §7.6.1) that must not be forwarded, plus
/// `Content-Length`, which the proxy always recomputes for the response it
/// actually sends.
const STRIPPED_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Copy the origin's response headers, dropping hop-by-hop headers.
#[must_use]
pub fn extract_headers(origin: &HeaderMap) -> HeaderMap {
    let mut extracted = HeaderMap::new();
    for (name, value) in origin {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        extracted.insert(name.clone(), value.clone());
    }
    extracted
}

/// Parse a single-range `Range` header against a file of `file_size`
/// bytes, returning the half-open interval `[start, end)`.
///
/// Supported forms: `bytes=a-b`, `bytes=a-`, and the suffix form
/// `bytes=-n`.
///
/// # Errors
/// `RangeNotSatisfiable` for malformed values, multi-range requests, and
/// ranges outside the file.
pub fn parse_range(value: &str, file_size: u64) -> ApiResult<(u64, u64)> {
    let unsatisfiable = |reason: &str| ApiError::RangeNotSatisfiable {
        reason: reason.to_string(),
    };

    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| unsatisfiable("only byte ranges are supported"))?
        .trim();
    if spec.contains(',') {
        return Err(unsatisfiable("multiple ranges are not supported"));
    }

    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or_else(|| unsatisfiable("malformed range"))?;

    if start_str.is_empty() {
        // Suffix form: the final n bytes.
        let suffix: u64 = end_str
            .parse()
            .map_err(|_| unsatisfiable("malformed suffix length"))?;
        if suffix == 0 {
            return Err(unsatisfiable("zero-length suffix"));
        }
        let start = file_size.saturating_sub(suffix);
        return Ok((start, file_size));
    }

    let start: u64 = start_str
        .parse()
        .map_err(|_| unsatisfiable("malformed range start"))?;
    if start >= file_size {
        return Err(unsatisfiable("range starts past end of file"));
    }

    let end = if end_str.is_empty() {
        file_size
    } else {
        let inclusive: u64 = end_str
            .parse()
            .map_err(|_| unsatisfiable("malformed range end"))?;
        if inclusive < start {
            return Err(unsatisfiable("range end precedes start"));
        }
        (inclusive + 1).min(file_size)
    };

    Ok((start, end))
}
