// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fileset::Fileset;

const EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// Configured content sources.
///
/// Loaded by merging every YAML fragment in the configuration directory,
/// so each repository can live in its own file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

impl Config {
    pub fn merge(mut self, other: Self) -> Self {
        self.repositories.extend(other.repositories);
        self
    }
}

/// One configured repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Settings reference string:
    /// `(protocol:)?(username:password@)?(host(:port)?/)?account/repo(/branch)?`
    pub reference: String,
    /// Fileset categories for the repository; the standard set when
    /// omitted
    #[serde(default)]
    pub filesets: Option<Vec<Fileset>>,
    /// Fetch file bytes from the server when the local cache misses
    #[serde(default = "default_on_demand")]
    pub on_demand: bool,
}

fn default_on_demand() -> bool {
    true
}

/// The platform's configuration directory for locomote
pub fn default_dir() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join("locomote"))
}

/// Load and merge every config fragment beneath `dir`. A missing
/// directory reads as an empty configuration.
pub fn load(dir: impl AsRef<Path>) -> Config {
    let Ok(entries) = fs::read_dir(dir.as_ref()) else {
        return Config::default();
    };

    let mut paths = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| EXTENSIONS.contains(&ext))
                .unwrap_or_default()
        })
        .collect::<Vec<_>>();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| match read_config(&path) {
            Ok(config) => Some(config),
            Err(error) => {
                warn!("skipping config {path:?}: {error}");
                None
            }
        })
        .fold(Config::default(), Config::merge)
}

fn read_config(path: &Path) -> Result<Config, SaveError> {
    let contents = fs::read_to_string(path).map_err(|io| SaveError::Read(path.into(), io))?;

    Ok(serde_yaml::from_str(&contents)?)
}

/// Save a config fragment as `{name}.yaml` beneath `dir`
pub fn save(
    dir: impl AsRef<Path>,
    name: impl fmt::Display,
    config: &Config,
) -> Result<(), SaveError> {
    let dir = dir.as_ref();

    fs::create_dir_all(dir).map_err(|io| SaveError::CreateDir(dir.into(), io))?;

    let path = dir.join(format!("{name}.yaml"));
    let serialized = serde_yaml::to_string(config)?;

    fs::write(&path, serialized).map_err(|io| SaveError::Write(path, io))?;

    Ok(())
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("could not create config dir {0:?}: {1}")]
    CreateDir(PathBuf, io::Error),
    #[error("could not read config {0:?}: {1}")]
    Read(PathBuf, io::Error),
    #[error("could not write config {0:?}: {1}")]
    Write(PathBuf, io::Error),
    #[error("yaml")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn save_load_merge() {
        let tmp = TempDir::new().unwrap();

        save(
            tmp.path(),
            "a",
            &Config {
                repositories: vec![RepositoryConfig {
                    reference: "acme/docs".to_string(),
                    filesets: None,
                    on_demand: true,
                }],
            },
        )
        .unwrap();
        save(
            tmp.path(),
            "b",
            &Config {
                repositories: vec![RepositoryConfig {
                    reference: "acme/blog/beta".to_string(),
                    filesets: None,
                    on_demand: false,
                }],
            },
        )
        .unwrap();

        let config = load(tmp.path());
        assert_eq!(config.repositories.len(), 2);
        assert_eq!(config.repositories[0].reference, "acme/docs");
        assert!(!config.repositories[1].on_demand);
    }

    #[test]
    fn missing_dir_is_empty() {
        let config = load("/nonexistent/locomote-config");
        assert!(config.repositories.is_empty());
    }
}
