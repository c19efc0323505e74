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

//! A byte size that renders and parses as `4KiB` / `8MiB` / `1GiB` strings.
//!
//! Configuration files express block sizes and buffer budgets in
//! human-readable units; internally everything is a plain `u64` byte count.

use std::{fmt, ops::Div, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;

/// A number of bytes, displayed in binary units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    #[must_use]
    pub const fn kb(count: u64) -> ReadableSize { ReadableSize(count * KIB) }

    #[must_use]
    pub const fn mb(count: u64) -> ReadableSize { ReadableSize(count * MIB) }

    #[must_use]
    pub const fn gb(count: u64) -> ReadableSize { ReadableSize(count * GIB) }

    #[must_use]
    pub const fn as_bytes(self) -> u64 { self.0 }

    #[must_use]
    pub const fn is_zero(self) -> bool { self.0 == 0 }
}

impl Div<u64> for ReadableSize {
    type Output = ReadableSize;

    fn div(self, rhs: u64) -> ReadableSize { ReadableSize(self.0 / rhs) }
}

impl From<ReadableSize> for u64 {
    fn from(size: ReadableSize) -> u64 { size.0 }
}

impl fmt::Display for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes == 0 {
            write!(f, "0B")
        } else if bytes % GIB == 0 {
            write!(f, "{}GiB", bytes / GIB)
        } else if bytes % MIB == 0 {
            write!(f, "{}MiB", bytes / MIB)
        } else if bytes % KIB == 0 {
            write!(f, "{}KiB", bytes / KIB)
        } else {
            write!(f, "{bytes}B")
        }
    }
}

impl FromStr for ReadableSize {
    type Err = String;

    fn from_str(s: &str) -> Result<ReadableSize, String> {
        let size_str = s.trim();
        if size_str.is_empty() {
            return Err(format!("{s:?} is not a valid size"));
        }

        let (number, unit) =
            match size_str.find(|c: char| !c.is_ascii_digit() && c != '.' && c != ' ') {
                Some(pos) => size_str.split_at(pos),
                None => (size_str, ""),
            };

        let unit = match unit.trim() {
            "KiB" | "KB" | "K" | "k" => KIB,
            "MiB" | "MB" | "M" | "m" => MIB,
            "GiB" | "GB" | "G" | "g" => GIB,
            "B" | "" => 1,
            other => return Err(format!("{s:?} has unknown unit {other:?}")),
        };

        let number = number
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("{s:?} is not a valid size"))?;
        if number < 0.0 {
            return Err(format!("{s:?} is negative"));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(ReadableSize((number * unit as f64) as u64))
    }
}

impl Serialize for ReadableSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D>(deserializer: D) -> Result<ReadableSize, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SizeVisitor;

        impl de::Visitor<'_> for SizeVisitor {
            type Value = ReadableSize;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a size in bytes or a string like \"8MiB\"")
            }

            fn visit_u64<E>(self, value: u64) -> Result<ReadableSize, E>
            where
                E: de::Error,
            {
                Ok(ReadableSize(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<ReadableSize, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map(ReadableSize)
                    .map_err(|_| E::custom(format!("negative size: {value}")))
            }

            fn visit_str<E>(self, value: &str) -> Result<ReadableSize, E>
            where
                E: de::Error,
            {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}
