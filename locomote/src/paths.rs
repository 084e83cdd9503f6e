// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::path::{Path, PathBuf};

use crate::settings::Settings;

/// Root directories for the local content tiers, shared by every
/// authority hosted in the process.
#[derive(Debug, Clone)]
pub struct BasePaths {
    /// Device-persistent cache, removed on uninstall
    pub app_cache: PathBuf,
    /// OS-evictable cache
    pub content_cache: PathBuf,
    /// Read-only content shipped with the app
    pub packaged: PathBuf,
    /// In-flight downloads
    pub staging: PathBuf,
}

impl BasePaths {
    /// Lay all four tiers out under a single root directory.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();

        Self {
            app_cache: root.join("cache"),
            content_cache: root.join("content"),
            packaged: root.join("packaged"),
            staging: root.join("staging"),
        }
    }

    /// Resolve tier roots from the platform's standard directories.
    pub fn discover() -> Option<Self> {
        let data = dirs::data_local_dir()?.join("locomote");
        let content = dirs::cache_dir()?.join("locomote");

        Some(Self {
            app_cache: data.join("cache"),
            content_cache: content,
            packaged: data.join("packaged"),
            staging: data.join("staging"),
        })
    }
}

/// Per-repository cache locations, resolved from the base tiers and the
/// repository's settings.
///
/// Layout under each tier root is
/// `<authority>/<account>/<repo>/<branch>/...`.
#[derive(Debug, Clone)]
pub struct CachePaths {
    /// The repository's metadata database
    pub db_path: PathBuf,
    /// App-tier cache directory; categories nest beneath
    pub app_cache_dir: PathBuf,
    /// Content-tier cache directory
    pub content_cache_dir: PathBuf,
    /// Packaged-tier directory (read-only)
    pub packaged_dir: PathBuf,
    /// Staging root for this repository's in-flight downloads
    pub staging_dir: PathBuf,
}

impl CachePaths {
    pub fn for_repository(base: &BasePaths, settings: &Settings) -> Self {
        // Authority names are host-derived and may carry characters that
        // aren't valid in a directory name (e.g. the port separator).
        let authority = settings
            .authority_name()
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();

        let rel = Path::new(&authority)
            .join(&settings.account)
            .join(&settings.repo)
            .join(&settings.branch);

        Self {
            db_path: base.app_cache.join(&rel).join("files.db"),
            app_cache_dir: base.app_cache.join(&rel).join("cache"),
            content_cache_dir: base.content_cache.join(&rel).join("cache"),
            packaged_dir: base.packaged.join(&rel),
            staging_dir: base.staging.join(&rel),
        }
    }

    /// The staging directory for a single operation.
    pub fn staging_for(&self, op_id: &str) -> PathBuf {
        let sanitized = op_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect::<String>();

        self.staging_dir.join(sanitized)
    }

    /// Ensure the writable directories exist.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            self.db_path.parent().unwrap_or(&self.app_cache_dir),
            &self.app_cache_dir,
            &self.content_cache_dir,
            &self.staging_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(())
    }
}
