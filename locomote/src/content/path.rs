// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A canonical content path.
///
/// Forward-slash separated and case-sensitive, with no leading slash.
/// Empty segments and `.`/`..` traversal are invalid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentPath {
    segments: Vec<String>,
}

impl ContentPath {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Strip a mount prefix, returning the remainder of the path
    pub fn strip_prefix(&self, prefix: &ContentPath) -> Option<ContentPath> {
        let rest = self.segments.strip_prefix(prefix.segments())?;

        Some(ContentPath {
            segments: rest.to_vec(),
        })
    }

    /// The file extension of the final segment, if any
    pub fn extension(&self) -> Option<&str> {
        self.segments
            .last()
            .and_then(|segment| segment.rsplit_once('.'))
            .map(|(_, ext)| ext)
    }
}

impl FromStr for ContentPath {
    type Err = InvalidPath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(ContentPath::default());
        }
        if s.starts_with('/') {
            return Err(InvalidPath(s.to_string()));
        }

        let segments = s
            .split('/')
            .map(|segment| {
                if segment.is_empty() || segment == "." || segment == ".." {
                    Err(InvalidPath(s.to_string()))
                } else {
                    Ok(segment.to_string())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ContentPath { segments })
    }
}

impl fmt::Display for ContentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.segments.join("/").fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid content path: {0}")]
pub struct InvalidPath(pub String);
