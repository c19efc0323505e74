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

//! YAML configuration of the mirror service.

use std::path::{Path, PathBuf};

use hubstream_cache::{DownloadConfig, RetryConfig};
use hubstream_telemetry::LoggingOptions;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{ResultExt, Snafu};
use validator::Validate;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SettingsError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadConfig {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config file: {source}"))]
    ParseConfig { source: serde_yaml::Error },

    #[snafu(display("invalid configuration: {reason}"))]
    InvalidSettings { reason: String },
}

/// Network identity of the mirror and of the origin it fronts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Validate)]
#[serde(default)]
pub struct ServerOptions {
    #[default = "0.0.0.0"]
    #[validate(length(min = 1))]
    pub host: String,

    #[default = 8090]
    pub port: u16,

    /// Base URL of the mirrored repository service.
    #[default = "https://huggingface.co"]
    #[validate(url)]
    pub origin: String,

    /// Root directory for cached artifacts and metadata documents.
    #[default(PathBuf::from("./data"))]
    pub data_dir: PathBuf,

    /// When false, metadata requests with a cached document never reach
    /// origin.
    #[default = true]
    pub online: bool,

    #[default = true]
    pub enable_cors: bool,
}

/// Full service configuration, loaded from one YAML document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, SmartDefault)]
#[serde(default)]
pub struct Settings {
    pub server:   ServerOptions,
    pub download: DownloadConfig,
    pub retry:    RetryConfig,
    pub log:      LoggingOptions,
}

impl Settings {
    /// Load and validate settings from a YAML file.
    ///
    /// # Errors
    /// I/O and parse failures, plus any field outside its allowed range.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).context(ReadConfigSnafu {
            path: path.to_path_buf(),
        })?;
        let settings: Settings = serde_yaml::from_str(&raw).context(ParseConfigSnafu)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate every section, including the cross-field constraints of
    /// the download engine.
    ///
    /// # Errors
    /// `InvalidSettings` naming the offending field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        Validate::validate(&self.server).map_err(|e| SettingsError::InvalidSettings {
            reason: e.to_string(),
        })?;
        self.download
            .validate()
            .map_err(|e| SettingsError::InvalidSettings {
                reason: e.to_string(),
            })?;
        self.retry
            .validate()
            .map_err(|e| SettingsError::InvalidSettings {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Origin URL of an artifact.
    #[must_use]
    pub fn origin_file_url(
        &self,
        repo_type: &str,
        org: &str,
        repo: &str,
        commit: &str,
        file_path: &str,
    ) -> String {
        format!(
            "{}/{repo_type}/{org}/{repo}/resolve/{commit}/{file_path}",
            self.server.origin.trim_end_matches('/'),
        )
    }

    /// Origin URL of a revision metadata document.
    #[must_use]
    pub fn origin_meta_url(&self, repo_type: &str, org: &str, repo: &str, commit: &str) -> String {
        format!(
            "{}/api/{repo_type}/{org}/{repo}/revision/{commit}",
            self.server.origin.trim_end_matches('/'),
        )
    }

    /// On-disk location of an artifact's block cache.
    #[must_use]
    pub fn file_cache_path(
        &self,
        repo_type: &str,
        org: &str,
        repo: &str,
        commit: &str,
        file_path: &str,
    ) -> PathBuf {
        self.server
            .data_dir
            .join("files")
            .join(repo_type)
            .join(org)
            .join(repo)
            .join(commit)
            .join(file_path)
    }

    /// On-disk location of a cached metadata document.
    #[must_use]
    pub fn meta_cache_path(&self, repo_type: &str, org: &str, repo: &str, commit: &str) -> PathBuf {
        self.server
            .data_dir
            .join("api")
            .join(repo_type)
            .join(org)
            .join(repo)
            .join("revision")
            .join(commit)
            .join("meta_get.json")
    }
}
