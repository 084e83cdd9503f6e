// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use futures::future;
use log::info;
use thiserror::Error;

use crate::content::path::InvalidPath;
use crate::content::{ContentPath, ContentResponse, Request, Response, ResponseError};
use crate::repository::{self, Repository};
use crate::sync::Refresh;

/// A named content endpoint hosting one or more repositories.
///
/// Repositories are keyed by mount path (`account/repo` or
/// `account/repo/~branch`); request paths resolve to the repository with
/// the longest matching mount prefix, and the remainder dispatches
/// through that repository's handlers.
pub struct Authority {
    name: String,
    /// Copy-on-write: readers take a snapshot, `add_repository` swaps in
    /// a replacement list
    repositories: RwLock<Arc<Vec<Mount>>>,
}

struct Mount {
    path: ContentPath,
    repository: Arc<Repository>,
}

impl Authority {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            repositories: RwLock::new(Arc::new(vec![])),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mount a repository. Permitted at runtime; the repository list is
    /// replaced wholesale so in-flight readers keep their snapshot.
    pub fn add_repository(&self, repository: Arc<Repository>) -> Result<(), Error> {
        let mount = repository.mount_path();
        let path = mount.parse::<ContentPath>()?;

        let mut guard = self.repositories.write().expect("rwlock write");

        let mut mounts = guard
            .iter()
            .filter(|existing| existing.path != path)
            .map(|existing| Mount {
                path: existing.path.clone(),
                repository: existing.repository.clone(),
            })
            .collect::<Vec<_>>();
        mounts.push(Mount { path, repository });
        // Longest mount prefix must win
        mounts.sort_by_key(|mount| std::cmp::Reverse(mount.path.segments().len()));

        *guard = Arc::new(mounts);

        info!("authority {}: mounted {mount}", self.name);

        Ok(())
    }

    pub fn repositories(&self) -> Vec<Arc<Repository>> {
        self.snapshot()
            .iter()
            .map(|mount| mount.repository.clone())
            .collect()
    }

    /// Resolve a request path to a repository and the remainder of the
    /// path beneath its mount
    pub fn resolve(&self, path: &ContentPath) -> Option<(Arc<Repository>, ContentPath)> {
        self.snapshot().iter().find_map(|mount| {
            path.strip_prefix(&mount.path)
                .map(|rest| (mount.repository.clone(), rest))
        })
    }

    /// Handle a content request addressed to this authority
    pub async fn handle_request(
        &self,
        path: &str,
        parameters: HashMap<String, String>,
    ) -> Response {
        let mut response = Response::new();

        let path = match path.parse::<ContentPath>() {
            Ok(path) => path,
            Err(InvalidPath(path)) => {
                response.respond_with_error(ResponseError::InvalidPath(path));
                return response;
            }
        };

        match self.resolve(&path) {
            Some((repository, rest)) => {
                let mut request = Request::new(&self.name, rest).with_parameters(parameters);
                repository.handle_request(&mut request, &mut response).await;
            }
            None => {
                response.respond_with_error(ResponseError::NotFound(path.to_string()));
            }
        }

        response
    }

    /// Synchronize every mounted repository, returning per-mount results
    pub async fn sync_content(&self) -> Vec<(String, Result<Refresh, repository::Error>)> {
        let repositories = self.repositories();

        future::join_all(repositories.iter().map(|repository| async {
            (
                repository.mount_path(),
                repository.refresh().await,
            )
        }))
        .await
    }

    /// Whether any mounted repository holds content for the path
    pub async fn has_content(&self, path: &str) -> bool {
        let Ok(path) = path.parse::<ContentPath>() else {
            return false;
        };

        match self.resolve(&path) {
            Some((repository, rest)) => repository.has_content(&rest.to_string()).await,
            None => false,
        }
    }

    /// The local cache location of the file at the path, if it resolves
    /// to a cachable record
    pub async fn local_cache_location(&self, path: &str) -> Option<PathBuf> {
        let path = path.parse::<ContentPath>().ok()?;
        let (repository, rest) = self.resolve(&path)?;

        repository.local_cache_location(&rest.to_string()).await
    }

    fn snapshot(&self) -> Arc<Vec<Mount>> {
        self.repositories.read().expect("rwlock read").clone()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid mount path")]
    Mount(#[from] InvalidPath),
}
