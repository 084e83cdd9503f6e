// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;

use serde::Deserialize;

use crate::db::files::Status;

/// The updates feed manifest returned by the server.
///
/// `commit` names the server's current head for the repository; the
/// client advances its sync cursor to it once the delta commits.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub commit: String,
    #[serde(default)]
    pub db: Delta,
    #[serde(default)]
    pub filesets: HashMap<String, FilesetUpdate>,
    #[serde(default)]
    pub resets: Vec<ResetRequest>,
}

/// File record rows changed since the client's cursor
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    #[serde(default)]
    pub inserts: Vec<Record>,
    #[serde(default)]
    pub updates: Vec<Record>,
    #[serde(default)]
    pub deletes: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// One file record row in the feed. Related table rows ride inline,
/// keyed by the mapping name declared on the record's fileset.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub path: String,
    pub category: String,
    pub commit: String,
    #[serde(default = "default_status")]
    pub status: Status,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub digest: Option<String>,
    #[serde(flatten)]
    pub related: HashMap<String, serde_json::Value>,
}

fn default_status() -> Status {
    Status::Published
}

/// Per-category fileset change summary
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesetUpdate {
    pub cvs: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub count: u64,
}

/// A server-requested fileset reset
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub category: String,
    pub cvs: String,
}

/// The authoritative file list returned by the reset endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetList {
    #[serde(default)]
    pub files: Vec<Record>,
}
