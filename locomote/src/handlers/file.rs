// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::content::response::{CachePolicy, ContentResponse, ResponseError};
use crate::content::{Request, RequestHandler};
use crate::db::files::{File, Filter, Id};
use crate::request;

use super::{mime_for_path, HandlerContext};

/// Serves the filtered file record listing at `files.api`
pub struct FileListHandler {
    context: Arc<HandlerContext>,
}

impl FileListHandler {
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }
}

impl RequestHandler for FileListHandler {
    fn handle<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut dyn ContentResponse,
    ) -> BoxFuture<'a, ()> {
        async move {
            let mut filter = Filter {
                category: request.parameter("category").map(str::to_string),
                path: request.parameter("path").map(str::to_string),
                commit: request.parameter("commit").map(str::to_string),
                path_prefix: request.parameter("path.prefix").map(str::to_string),
                status: None,
            };

            if let Some(category) = &filter.category {
                if !self.context.db.filesets().contains_key(category) {
                    response.respond_with_error(ResponseError::InvalidCategory(category.clone()));
                    return;
                }
            }
            if let Some(status) = request.parameter("status") {
                match status.parse() {
                    Ok(status) => filter.status = Some(status),
                    Err(_) => {
                        response.respond_with_error(ResponseError::UnsupportedType(format!(
                            "status: {status}"
                        )));
                        return;
                    }
                }
            }

            match self.context.db.query(&filter).await {
                Ok(files) => respond_json(response, &files),
                Err(error) => {
                    response.respond_with_error(ResponseError::Transport(error.to_string()));
                }
            }
        }
        .boxed()
    }
}

/// Serves one file record's metadata at `files.api/{id}`
pub struct FileRecordHandler {
    context: Arc<HandlerContext>,
}

impl FileRecordHandler {
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }
}

impl RequestHandler for FileRecordHandler {
    fn handle<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut dyn ContentResponse,
    ) -> BoxFuture<'a, ()> {
        async move {
            if let Some(file) = record_for_request(&self.context, request, response).await {
                respond_json(response, &file);
            }
        }
        .boxed()
    }
}

/// Serves file bytes by record id at `files.api/{id}/content`
pub struct FileContentHandler {
    context: Arc<HandlerContext>,
}

impl FileContentHandler {
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }
}

impl RequestHandler for FileContentHandler {
    fn handle<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut dyn ContentResponse,
    ) -> BoxFuture<'a, ()> {
        async move {
            if let Some(file) = record_for_request(&self.context, request, response).await {
                serve_record(&self.context, &file, response).await;
            }
        }
        .boxed()
    }
}

/// Serves hierarchy queries at `files.api/{id}/{relation}` for the
/// relations `siblings`, `children` and `descendants`
pub struct FileRelationHandler {
    context: Arc<HandlerContext>,
}

impl FileRelationHandler {
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }
}

impl RequestHandler for FileRelationHandler {
    fn handle<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut dyn ContentResponse,
    ) -> BoxFuture<'a, ()> {
        async move {
            let Some(file) = record_for_request(&self.context, request, response).await else {
                return;
            };

            let db = &self.context.db;
            let related = match request.path_parameter("relation") {
                Some("siblings") => db.siblings(&file).await,
                Some("children") => db.children(&file).await,
                Some("descendants") => db.descendants(&file).await,
                _ => {
                    response
                        .respond_with_error(ResponseError::InvalidPath(request.path.to_string()));
                    return;
                }
            };

            match related {
                Ok(files) => respond_json(response, &files),
                Err(error) => {
                    response.respond_with_error(ResponseError::Transport(error.to_string()));
                }
            }
        }
        .boxed()
    }
}

/// Serves raw file bytes by repository path; the trailing catch-all of
/// the repository dispatcher
pub struct FileBytesHandler {
    context: Arc<HandlerContext>,
}

impl FileBytesHandler {
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }
}

impl RequestHandler for FileBytesHandler {
    fn handle<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut dyn ContentResponse,
    ) -> BoxFuture<'a, ()> {
        async move {
            let Some(path) = request.path_parameter("path") else {
                response.respond_with_error(ResponseError::InvalidPath(request.path.to_string()));
                return;
            };

            match self.context.db.file_by_path(path).await {
                Ok(Some(file)) => serve_record(&self.context, &file, response).await,
                Ok(None) => {
                    response.respond_with_error(ResponseError::NotFound(path.to_string()));
                }
                Err(error) => {
                    response.respond_with_error(ResponseError::Transport(error.to_string()));
                }
            }
        }
        .boxed()
    }
}

/// Resolve the `{id}` path parameter to a readable record, resolving the
/// response with an error when it can't be found
pub(super) async fn record_for_request(
    context: &HandlerContext,
    request: &Request,
    response: &mut dyn ContentResponse,
) -> Option<File> {
    let Some(id) = request.path_parameter("id") else {
        response.respond_with_error(ResponseError::InvalidPath(request.path.to_string()));
        return None;
    };

    match context.db.file_by_id(&Id::from(id)).await {
        Ok(Some(file)) => Some(file),
        Ok(None) => {
            response.respond_with_error(ResponseError::NotFound(id.to_string()));
            None
        }
        Err(error) => {
            response.respond_with_error(ResponseError::Transport(error.to_string()));
            None
        }
    }
}

/// Serve a record's bytes from the local cache, falling back to an
/// on-demand server fetch when configured.
///
/// A cache file whose size disagrees with the record is treated as
/// absent; a partially-promoted file must never reach a reader.
pub(super) async fn serve_record(
    context: &HandlerContext,
    file: &File,
    response: &mut dyn ContentResponse,
) {
    let mime_type = file
        .content_type
        .clone()
        .unwrap_or_else(|| mime_for_path(&file.path).to_string());

    if let Some(location) = context.db.cache_location_for_file(file) {
        if let Ok(metadata) = tokio::fs::metadata(&location).await {
            let size_ok = file.size.map(|size| size == metadata.len()).unwrap_or(true);
            if size_ok {
                response.respond_with_file(location, &mime_type, CachePolicy::Allowed);
                return;
            }
        }
    }

    if !context.on_demand {
        response.respond_with_error(ResponseError::NotFound(file.path.clone()));
        return;
    }

    let url = match context.settings.url_for_file(&file.path) {
        Ok(url) => url,
        Err(error) => {
            response.respond_with_error(ResponseError::Transport(error.to_string()));
            return;
        }
    };

    let credentials = context.accounts.credentials();
    match request::get_body(url, credentials.as_ref()).await {
        Ok(body) => response.respond_with_data(body.into(), &mime_type, CachePolicy::Allowed),
        Err(request::Error::Auth(status)) => {
            context.accounts.mark_stale();
            response.respond_with_error(ResponseError::Auth(status.to_string()));
        }
        Err(error) => {
            response.respond_with_error(ResponseError::Transport(error.to_string()));
        }
    }
}

fn respond_json<T: serde::Serialize>(response: &mut dyn ContentResponse, value: &T) {
    match serde_json::to_value(value) {
        Ok(value) => response.respond_with_json(value, CachePolicy::NotAllowed),
        Err(error) => response.respond_with_error(ResponseError::UnsupportedType(error.to_string())),
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;
    use crate::auth::AccountManager;
    use crate::content::{ContentPath, Dispatcher, Response};
    use crate::db::files::{Change, Database, Status};
    use crate::fileset;
    use crate::paths::{BasePaths, CachePaths};
    use crate::settings::Settings;

    struct Fixture {
        _tmp: TempDir,
        db: Database,
        dispatcher: Dispatcher,
    }

    fn file(id: &str, path: &str, category: &str, status: Status, size: Option<u64>) -> Change {
        Change {
            file: File {
                id: Id::from(id),
                path: path.to_string(),
                category: category.to_string(),
                status,
                commit: "c1".to_string(),
                content_type: None,
                size,
                digest: None,
            },
            page: None,
        }
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::new("acme", "docs");
        let paths = CachePaths::for_repository(&BasePaths::under(tmp.path()), &settings);
        paths.ensure_dirs().unwrap();

        let db = Database::new(paths, fileset::standard(), false).await.unwrap();

        db.merge_updates(
            &[
                file("f1", "a/b.txt", "pages", Status::Published, Some(5)),
                file("f2", "a/c.txt", "pages", Status::Published, None),
                file("f3", "a/b.txt/nested.txt", "pages", Status::Published, None),
                file("f4", "top.txt", "assets", Status::Published, None),
            ],
            &[],
            "c1",
        )
        .await
        .unwrap();

        // Give f1 real cache bytes
        let cached = db.cache_location_for_fileset("pages").unwrap().join("a/b.txt");
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, b"hello").unwrap();

        let context = Arc::new(HandlerContext {
            db: db.clone(),
            settings: Settings::new("acme", "docs"),
            accounts: Arc::new(AccountManager::new()),
            on_demand: false,
        });

        let mut dispatcher = Dispatcher::new();
        super::super::register(&mut dispatcher, context, 50).unwrap();

        Fixture {
            _tmp: tmp,
            db,
            dispatcher,
        }
    }

    async fn get(fixture: &Fixture, path: &str, parameters: &[(&str, &str)]) -> Response {
        let parameters = parameters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();

        let mut request = Request::new("locomote.sh", path.parse::<ContentPath>().unwrap())
            .with_parameters(parameters);
        let mut response = Response::new();
        fixture.dispatcher.dispatch(&mut request, &mut response).await;
        response
    }

    fn paths_of(value: serde_json::Value) -> Vec<String> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|record| record["path"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn list_with_filters() {
        let fixture = fixture().await;

        let response = get(&fixture, "files.api", &[("category", "pages")]).await;
        assert_eq!(
            paths_of(response.json().unwrap()),
            vec!["a/b.txt", "a/b.txt/nested.txt", "a/c.txt"]
        );

        let response = get(&fixture, "files.api", &[("path.prefix", "a/b")]).await;
        assert_eq!(
            paths_of(response.json().unwrap()),
            vec!["a/b.txt", "a/b.txt/nested.txt"]
        );

        let response = get(&fixture, "files.api", &[("category", "bogus")]).await;
        assert!(matches!(
            response.error(),
            Some(ResponseError::InvalidCategory(_))
        ));
    }

    #[tokio::test]
    async fn record_by_id() {
        let fixture = fixture().await;

        let response = get(&fixture, "files.api/f1", &[]).await;
        let record = response.json().unwrap();
        assert_eq!(record["path"], "a/b.txt");
        assert_eq!(record["status"], "published");

        let response = get(&fixture, "files.api/nope", &[]).await;
        assert!(matches!(response.error(), Some(ResponseError::NotFound(_))));
    }

    #[tokio::test]
    async fn content_from_cache() {
        let fixture = fixture().await;

        let response = get(&fixture, "files.api/f1/content", &[]).await;
        match response.payload().unwrap() {
            crate::content::Payload::File { path, mime_type, .. } => {
                assert_eq!(std::fs::read(path).unwrap(), b"hello");
                assert_eq!(mime_type, "text/plain");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        // f2 has no cache bytes and on-demand fetch is off
        let response = get(&fixture, "files.api/f2/content", &[]).await;
        assert!(matches!(response.error(), Some(ResponseError::NotFound(_))));
    }

    #[tokio::test]
    async fn size_mismatch_reads_as_absent() {
        let fixture = fixture().await;

        let cached = fixture
            .db
            .cache_location_for_fileset("pages")
            .unwrap()
            .join("a/b.txt");
        std::fs::write(&cached, b"partial write!").unwrap();

        let response = get(&fixture, "files.api/f1/content", &[]).await;
        assert!(matches!(response.error(), Some(ResponseError::NotFound(_))));
    }

    #[tokio::test]
    async fn relations() {
        let fixture = fixture().await;

        let response = get(&fixture, "files.api/f1/siblings", &[]).await;
        assert_eq!(paths_of(response.json().unwrap()), vec!["a/c.txt"]);

        let response = get(&fixture, "files.api/f1/children", &[]).await;
        assert_eq!(paths_of(response.json().unwrap()), vec!["a/b.txt/nested.txt"]);

        let response = get(&fixture, "files.api/f1/descendants", &[]).await;
        assert_eq!(paths_of(response.json().unwrap()), vec!["a/b.txt/nested.txt"]);

        let response = get(&fixture, "files.api/f1/cousins", &[]).await;
        assert!(matches!(
            response.error(),
            Some(ResponseError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn bytes_by_path() {
        let fixture = fixture().await;

        let response = get(&fixture, "a/b.txt", &[]).await;
        assert!(matches!(
            response.payload(),
            Some(crate::content::Payload::File { .. })
        ));

        let response = get(&fixture, "missing/file.txt", &[]).await;
        assert!(matches!(response.error(), Some(ResponseError::NotFound(_))));
    }
}
