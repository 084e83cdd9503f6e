// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future;
use thiserror::Error;

use crate::authority::{self, Authority};
use crate::content::{ContentResponse, Response, ResponseError};
use crate::fileset::{self, Fileset};
use crate::paths::BasePaths;
use crate::repository::{self, Repository};
use crate::settings::{self, Settings};
use crate::sync::Refresh;

/// The provider of content to `content://` URLs.
///
/// A registry of authorities, each hosting a set of repositories. Built
/// and injected by the host application; tests construct their own.
pub struct ContentProvider {
    base_paths: BasePaths,
    authorities: RwLock<Arc<HashMap<String, Arc<Authority>>>>,
}

/// The result of synchronizing one mounted repository
#[derive(Debug)]
pub struct SyncReport {
    pub authority: String,
    pub mount: String,
    pub result: Result<Refresh, repository::Error>,
}

impl ContentProvider {
    pub fn new(base_paths: BasePaths) -> Self {
        Self {
            base_paths,
            authorities: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn base_paths(&self) -> &BasePaths {
        &self.base_paths
    }

    /// Find a content authority by name
    pub fn authority(&self, name: &str) -> Option<Arc<Authority>> {
        self.snapshot().get(name).cloned()
    }

    pub fn authorities(&self) -> Vec<Arc<Authority>> {
        self.snapshot().values().cloned().collect()
    }

    /// Open a repository from its settings and mount it under the
    /// authority its settings derive. The authority is created on first
    /// use.
    pub async fn add_repository(
        &self,
        settings: Settings,
        filesets: Option<HashMap<String, Fileset>>,
        on_demand: bool,
    ) -> Result<Arc<Repository>, Error> {
        let filesets = filesets.unwrap_or_else(fileset::standard);

        let repository = Arc::new(
            Repository::new(settings.clone(), filesets, &self.base_paths, on_demand).await?,
        );

        let authority = self.ensure_authority(&settings.authority_name());
        authority.add_repository(repository.clone())?;

        Ok(repository)
    }

    /// Convenience form taking a settings reference string
    pub async fn add_repository_ref(&self, reference: &str) -> Result<Arc<Repository>, Error> {
        self.add_repository(reference.parse()?, None, true).await
    }

    /// Resolve a `content://{authority}/{path}` URL to a response
    pub async fn serve(&self, url: &str) -> Response {
        let mut response = Response::new();

        let url = match url::Url::parse(url) {
            Ok(url) => url,
            Err(_) => {
                response.respond_with_error(ResponseError::InvalidPath(url.to_string()));
                return response;
            }
        };
        if url.scheme() != "content" {
            response.respond_with_error(ResponseError::UnsupportedType(url.scheme().to_string()));
            return response;
        }

        let authority_name = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                response.respond_with_error(ResponseError::InvalidPath(url.to_string()));
                return response;
            }
        };

        let Some(authority) = self.authority(&authority_name) else {
            response.respond_with_error(ResponseError::NotFound(authority_name));
            return response;
        };

        let path = url.path().trim_start_matches('/').to_string();
        let parameters = url.query_pairs().into_owned().collect();

        authority.handle_request(&path, parameters).await
    }

    /// Synchronize every authority's repositories with their sources
    pub async fn sync_all(&self) -> Vec<SyncReport> {
        let authorities = self.authorities();

        let reports = future::join_all(authorities.iter().map(|authority| async {
            authority
                .sync_content()
                .await
                .into_iter()
                .map(|(mount, result)| SyncReport {
                    authority: authority.name().to_string(),
                    mount,
                    result,
                })
                .collect::<Vec<_>>()
        }))
        .await;

        reports.into_iter().flatten().collect()
    }

    /// Synchronize everything, giving up at the deadline. `None` means
    /// the deadline passed; syncs keep running on their queues in the
    /// background.
    pub async fn sync_all_with_timeout(&self, timeout: Duration) -> Option<Vec<SyncReport>> {
        tokio::time::timeout(timeout, self.sync_all()).await.ok()
    }

    /// Whether the provider has content for `authority/path`
    pub async fn has_content_for_path(&self, path: &str) -> bool {
        let Some((authority, rest)) = self.split_authority(path) else {
            return false;
        };

        authority.has_content(rest).await
    }

    /// The local cache location of `authority/path`: packaged, app tier,
    /// content tier, or `None` when not cached
    pub async fn local_cache_location(&self, path: &str) -> Option<PathBuf> {
        let (authority, rest) = self.split_authority(path)?;

        authority.local_cache_location(rest).await
    }

    fn split_authority<'a>(&self, path: &'a str) -> Option<(Arc<Authority>, &'a str)> {
        let (name, rest) = path.split_once('/')?;

        Some((self.authority(name)?, rest))
    }

    fn ensure_authority(&self, name: &str) -> Arc<Authority> {
        if let Some(authority) = self.authority(name) {
            return authority;
        }

        let mut guard = self.authorities.write().expect("rwlock write");

        if let Some(authority) = guard.get(name) {
            return authority.clone();
        }

        let authority = Arc::new(Authority::new(name));
        let mut map = guard.as_ref().clone();
        map.insert(name.to_string(), authority.clone());
        *guard = Arc::new(map);

        authority
    }

    fn snapshot(&self) -> Arc<HashMap<String, Arc<Authority>>> {
        self.authorities.read().expect("rwlock read").clone()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid settings reference")]
    Settings(#[from] settings::ParseError),
    #[error("repository")]
    Repository(#[from] repository::Error),
    #[error("authority")]
    Authority(#[from] authority::Error),
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::content::Payload;
    use crate::db::files::{Change, File, Id, Status};

    async fn seeded_provider(tmp: &TempDir) -> ContentProvider {
        let provider = ContentProvider::new(BasePaths::under(tmp.path()));

        let repository = provider
            .add_repository(Settings::new("acme", "docs"), None, false)
            .await
            .unwrap();

        // Seed the metadata store and packaged tier directly; sync
        // behavior has its own coverage.
        repository
            .db()
            .merge_updates(
                &[Change {
                    file: File {
                        id: Id::from("f1"),
                        path: "a/b.txt".to_string(),
                        category: "pages".to_string(),
                        status: Status::Packaged,
                        commit: "c1".to_string(),
                        content_type: None,
                        size: Some(5),
                        digest: None,
                    },
                    page: None,
                }],
                &[],
                "c1",
            )
            .await
            .unwrap();

        let packaged = repository.paths().packaged_dir.join("pages").join("a/b.txt");
        std::fs::create_dir_all(packaged.parent().unwrap()).unwrap();
        std::fs::write(&packaged, b"hello").unwrap();

        provider
    }

    #[tokio::test]
    async fn serves_content_urls() {
        let tmp = TempDir::new().unwrap();
        let provider = seeded_provider(&tmp).await;

        let response = provider
            .serve("content://locomote.sh/acme/docs/a/b.txt")
            .await;
        match response.payload().unwrap() {
            Payload::File { path, .. } => assert_eq!(std::fs::read(path).unwrap(), b"hello"),
            other => panic!("unexpected payload: {other:?}"),
        }

        let response = provider
            .serve("content://locomote.sh/acme/docs/files.api/f1")
            .await;
        assert_eq!(response.json().unwrap()["status"], "packaged");
    }

    #[tokio::test]
    async fn unknown_authority_and_mount() {
        let tmp = TempDir::new().unwrap();
        let provider = seeded_provider(&tmp).await;

        let response = provider.serve("content://elsewhere.io/acme/docs/a.txt").await;
        assert!(matches!(response.error(), Some(ResponseError::NotFound(_))));

        let response = provider
            .serve("content://locomote.sh/other/repo/a.txt")
            .await;
        assert!(matches!(response.error(), Some(ResponseError::NotFound(_))));
    }

    #[tokio::test]
    async fn longest_mount_prefix_wins() {
        let tmp = TempDir::new().unwrap();
        let provider = seeded_provider(&tmp).await;

        // A branch-qualified mount shadows the unqualified one for its
        // own subtree
        let mut settings = Settings::new("acme", "docs");
        settings.branch = "beta".to_string();
        let branch_repo = provider.add_repository(settings, None, false).await.unwrap();

        let authority = provider.authority("locomote.sh").unwrap();
        let path = "acme/docs/~beta/x.txt".parse().unwrap();
        let (resolved, rest) = authority.resolve(&path).unwrap();

        assert_eq!(resolved.mount_path(), branch_repo.mount_path());
        assert_eq!(rest.to_string(), "x.txt");
    }

    #[tokio::test]
    async fn invalid_paths_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let provider = seeded_provider(&tmp).await;

        let response = provider
            .serve("content://locomote.sh/acme/docs/../escape.txt")
            .await;
        assert!(matches!(
            response.error(),
            Some(ResponseError::InvalidPath(_) | ResponseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cache_location_and_content_probes() {
        let tmp = TempDir::new().unwrap();
        let provider = seeded_provider(&tmp).await;

        assert!(provider.has_content_for_path("locomote.sh/acme/docs/a/b.txt").await);
        assert!(!provider.has_content_for_path("locomote.sh/acme/docs/nope.txt").await);

        let location = provider
            .local_cache_location("locomote.sh/acme/docs/a/b.txt")
            .await
            .unwrap();
        assert!(location.ends_with("pages/a/b.txt"));
    }
}
