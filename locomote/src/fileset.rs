// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::paths::CachePaths;

/// Where a fileset's content is cached locally.
///
/// * `none`: content is always fetched from the server, never cached.
/// * `content`: content is stored in the content cache, which the host
///   OS may evict at any time to free up space.
/// * `app`: content is stored in the app cache, which persists until the
///   app is uninstalled.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CachePolicy {
    #[default]
    None,
    Content,
    App,
}

/// Configuration of a single fileset category.
///
/// A fileset is a named partition of a repository's files which share a
/// cache policy and a set of related table mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fileset {
    pub category: String,
    /// Related table names populated from rows inline in the updates feed
    #[serde(default)]
    pub mappings: Vec<String>,
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default = "default_cachable")]
    pub cachable: bool,
}

fn default_cachable() -> bool {
    true
}

impl Fileset {
    pub fn new(category: impl ToString, cache: CachePolicy) -> Self {
        Self {
            category: category.to_string(),
            mappings: vec![],
            cache,
            cachable: !matches!(cache, CachePolicy::None),
        }
    }

    pub fn with_mappings(self, mappings: impl IntoIterator<Item = impl ToString>) -> Self {
        Self {
            mappings: mappings.into_iter().map(|m| m.to_string()).collect(),
            ..self
        }
    }

    /// The directory this fileset's bytes are cached under, or `None` if
    /// the fileset isn't locally cachable.
    ///
    /// The packaged tier is never returned here; packaged files are
    /// resolved per-record.
    pub fn cache_location(&self, paths: &CachePaths) -> Option<std::path::PathBuf> {
        if !self.cachable {
            return None;
        }

        match self.cache {
            CachePolicy::None => None,
            CachePolicy::Content => Some(paths.content_cache_dir.join(&self.category)),
            CachePolicy::App => Some(paths.app_cache_dir.join(&self.category)),
        }
    }
}

/// The standard fileset categories defined for a repository when its
/// configuration doesn't declare its own.
pub fn standard() -> HashMap<String, Fileset> {
    [
        Fileset::new("pages", CachePolicy::App).with_mappings(["pages"]),
        Fileset::new("assets", CachePolicy::Content),
        Fileset::new("app", CachePolicy::App),
    ]
    .into_iter()
    .map(|fileset| (fileset.category.clone(), fileset))
    .collect()
}
