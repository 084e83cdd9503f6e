// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use thiserror::Error;

use crate::auth::AccountManager;
use crate::content::dispatcher::PatternError;
use crate::content::{ContentResponse, Dispatcher, Request};
use crate::db::files::{self, Database};
use crate::environment;
use crate::fileset::Fileset;
use crate::handlers::{self, HandlerContext};
use crate::paths::{BasePaths, CachePaths};
use crate::queue::{self, command, CommandQueue};
use crate::settings::Settings;
use crate::sync::{self, Refresh};

/// A single synchronized content repository.
///
/// Owns its file database, cache locations, credential handle, operation
/// queue and request dispatcher. Mounted into an authority under
/// `account/repo` or `account/repo/~branch`.
pub struct Repository {
    settings: Settings,
    db: Database,
    paths: CachePaths,
    accounts: Arc<AccountManager>,
    queue: CommandQueue,
    context: Arc<sync::Context>,
    dispatcher: Dispatcher,
}

impl Repository {
    /// Open (or create) a repository under the provided tier roots and
    /// start its operation queue.
    pub async fn new(
        settings: Settings,
        filesets: HashMap<String, Fileset>,
        base: &BasePaths,
        on_demand: bool,
    ) -> Result<Self, Error> {
        let paths = CachePaths::for_repository(base, &settings);
        paths.ensure_dirs()?;

        let db = Database::new(paths.clone(), filesets, false).await?;

        let accounts = Arc::new(match (&settings.username, &settings.password) {
            (Some(username), Some(password)) => AccountManager::with_credentials(username, password),
            _ => AccountManager::new(),
        });

        let context = Arc::new(sync::Context::new(
            settings.clone(),
            db.clone(),
            paths.clone(),
            accounts.clone(),
        ));

        let queue = CommandQueue::new();
        sync::register(&queue, context.clone());
        queue.start();

        let mut dispatcher = Dispatcher::new();
        handlers::register(
            &mut dispatcher,
            Arc::new(HandlerContext {
                db: db.clone(),
                settings: settings.clone(),
                accounts: accounts.clone(),
                on_demand,
            }),
            environment::SEARCH_RESULT_LIMIT,
        )?;

        info!("repository {} opened", settings.mount_path());

        Ok(Self {
            settings,
            db,
            paths,
            accounts,
            queue,
            context,
            dispatcher,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn accounts(&self) -> &Arc<AccountManager> {
        &self.accounts
    }

    /// The path this repository mounts under within its authority
    pub fn mount_path(&self) -> String {
        self.settings.mount_path()
    }

    /// Synchronize content with the server.
    ///
    /// Deduplicated on the queue: calling while a refresh is pending or
    /// executing joins the in-flight cycle.
    pub async fn refresh(&self) -> Result<Refresh, Error> {
        let promise = self.queue.enqueue(sync::REFRESH, vec![])?;

        match promise.await {
            Ok(()) => Ok(Refresh {
                warnings: self.context.warnings(),
                incomplete: false,
            }),
            Err(error) => Err(Error::Refresh(error)),
        }
    }

    /// Synchronize content, resolving `incomplete` if the deadline passes
    /// first. The cycle itself carries on in the background.
    pub async fn refresh_with_timeout(&self, timeout: Duration) -> Result<Refresh, Error> {
        let promise = self.queue.enqueue(sync::REFRESH, vec![])?;

        match tokio::time::timeout(timeout, promise).await {
            Ok(Ok(())) => Ok(Refresh {
                warnings: self.context.warnings(),
                incomplete: false,
            }),
            Ok(Err(error)) => Err(Error::Refresh(error)),
            Err(_) => Ok(Refresh {
                warnings: self.context.warnings(),
                incomplete: true,
            }),
        }
    }

    /// Dispatch a content request against this repository
    pub async fn handle_request(&self, request: &mut Request, response: &mut dyn ContentResponse) {
        self.dispatcher.dispatch(request, response).await;
    }

    /// Whether the repository holds a readable record for `path`
    pub async fn has_content(&self, path: &str) -> bool {
        matches!(self.db.file_by_path(path).await, Ok(Some(_)))
    }

    /// The local cache location of the file at `path`, whether or not the
    /// bytes have landed yet
    pub async fn local_cache_location(&self, path: &str) -> Option<PathBuf> {
        let file = self.db.file_by_path(path).await.ok()??;

        self.db.cache_location_for_file(&file)
    }

    /// Drop queued work; the in-flight operation completes
    pub fn clear_pending(&self) {
        self.queue.clear_pending();
    }

    pub fn stop(&self) {
        self.queue.stop();
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("file database")]
    Database(#[from] files::Error),
    #[error("io")]
    Io(#[from] io::Error),
    #[error("handler pattern")]
    Pattern(#[from] PatternError),
    #[error("command")]
    Command(#[from] command::Error),
    #[error("refresh")]
    Refresh(#[source] queue::Error),
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::content::{ContentPath, Payload, Response};
    use crate::fileset;

    // End to end: sync from a file:// "server", then serve bytes and
    // queries through the repository dispatcher.
    #[tokio::test]
    async fn sync_then_serve() {
        let tmp = TempDir::new().unwrap();
        let server = tmp.path().join("server");

        let updates = server.join("updates/acme/docs");
        std::fs::create_dir_all(&updates).unwrap();
        std::fs::write(
            updates.join("master"),
            r#"{
                "commit": "c1",
                "db": {"inserts": [{
                    "id": "f1", "path": "a/b.txt", "category": "pages",
                    "commit": "c1", "size": 5,
                    "pages": {"title": "B", "content": "hello page"}
                }]},
                "filesets": {"pages": {"count": 1}}
            }"#,
        )
        .unwrap();

        let bundles = server.join("filesets/acme/docs/master");
        std::fs::create_dir_all(&bundles).unwrap();
        let out = std::fs::File::create(bundles.join("pages.zip")).unwrap();
        let mut bundle = zip::ZipWriter::new(out);
        bundle
            .start_file(
                "a/b.txt",
                zip::write::SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Stored),
            )
            .unwrap();
        std::io::Write::write_all(&mut bundle, b"hello").unwrap();
        bundle.finish().unwrap();

        let mut settings = Settings::new("acme", "docs");
        settings.protocol = "file".to_string();
        settings.host = server.display().to_string();

        let base = BasePaths::under(tmp.path().join("local"));
        let repository = Repository::new(settings, fileset::standard(), &base, false)
            .await
            .unwrap();

        let outcome = repository.refresh().await.unwrap();
        assert!(outcome.warnings.is_empty());
        assert!(!outcome.incomplete);

        // Raw bytes through the catch-all pattern
        let mut request = Request::new("locomote.sh", "a/b.txt".parse::<ContentPath>().unwrap());
        let mut response = Response::new();
        repository.handle_request(&mut request, &mut response).await;

        match response.payload().unwrap() {
            Payload::File { path, .. } => assert_eq!(std::fs::read(path).unwrap(), b"hello"),
            other => panic!("unexpected payload: {other:?}"),
        }

        // Search over the synced page content
        let mut request = Request::new("locomote.sh", "search.api".parse::<ContentPath>().unwrap())
            .with_parameters([("q".to_string(), "hello".to_string())].into());
        let mut response = Response::new();
        repository.handle_request(&mut request, &mut response).await;
        assert_eq!(response.json().unwrap().as_array().unwrap().len(), 1);

        assert!(repository.has_content("a/b.txt").await);
        assert!(repository.local_cache_location("a/b.txt").await.is_some());
    }
}
