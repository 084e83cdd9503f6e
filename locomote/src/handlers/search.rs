// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::content::response::{CachePolicy, ContentResponse, ResponseError};
use crate::content::{Request, RequestHandler};

use super::HandlerContext;

/// Full-text search over page content at `search.api`.
///
/// Searches run against the `pages` related table joined to `files`, so
/// only filesets mapped onto `pages` are searchable. Results are local;
/// no server round-trip is involved.
pub struct SearchHandler {
    context: Arc<HandlerContext>,
    /// The maximum number of search results to return
    result_limit: usize,
}

impl SearchHandler {
    pub fn new(context: Arc<HandlerContext>, result_limit: usize) -> Self {
        Self {
            context,
            result_limit,
        }
    }
}

impl RequestHandler for SearchHandler {
    fn handle<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut dyn ContentResponse,
    ) -> BoxFuture<'a, ()> {
        async move {
            let q = request.parameter("q").unwrap_or_default();
            let limit = request
                .parameter("limit")
                .and_then(|limit| limit.parse().ok())
                .unwrap_or(self.result_limit);

            match self.context.db.search(q, limit).await {
                Ok(results) => match serde_json::to_value(&results) {
                    Ok(value) => response.respond_with_json(value, CachePolicy::NotAllowed),
                    Err(error) => response
                        .respond_with_error(ResponseError::UnsupportedType(error.to_string())),
                },
                Err(error) => {
                    response.respond_with_error(ResponseError::Transport(error.to_string()));
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;
    use crate::auth::AccountManager;
    use crate::content::{ContentPath, Dispatcher, Response};
    use crate::db::files::{Change, Database, File, Id, PageRow, Status};
    use crate::fileset;
    use crate::paths::{BasePaths, CachePaths};
    use crate::settings::Settings;

    async fn fixture() -> (TempDir, Dispatcher) {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::new("acme", "docs");
        let paths = CachePaths::for_repository(&BasePaths::under(tmp.path()), &settings);
        paths.ensure_dirs().unwrap();

        let db = Database::new(paths, fileset::standard(), false).await.unwrap();

        let page = |id: &str, path: &str, title: &str, content: &str| Change {
            file: File {
                id: Id::from(id),
                path: path.to_string(),
                category: "pages".to_string(),
                status: Status::Published,
                commit: "c1".to_string(),
                content_type: None,
                size: None,
                digest: None,
            },
            page: Some(PageRow {
                title: Some(title.to_string()),
                content: Some(content.to_string()),
            }),
        };

        db.merge_updates(
            &[
                page("f1", "guide.md", "Travel guide", "getting around by trains"),
                page("f2", "trains.md", "Trains", "schedules and trains"),
                page("f3", "food.md", "Eating out", "restaurants"),
            ],
            &[],
            "c1",
        )
        .await
        .unwrap();

        let context = Arc::new(HandlerContext {
            db,
            settings: Settings::new("acme", "docs"),
            accounts: Arc::new(AccountManager::new()),
            on_demand: false,
        });

        let mut dispatcher = Dispatcher::new();
        super::super::register(&mut dispatcher, context, 50).unwrap();

        (tmp, dispatcher)
    }

    async fn search(dispatcher: &Dispatcher, parameters: &[(&str, &str)]) -> Response {
        let parameters = parameters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();

        let mut request = Request::new(
            "locomote.sh",
            "search.api".parse::<ContentPath>().unwrap(),
        )
        .with_parameters(parameters);
        let mut response = Response::new();
        dispatcher.dispatch(&mut request, &mut response).await;
        response
    }

    #[tokio::test]
    async fn title_matches_rank_first() {
        let (_tmp, dispatcher) = fixture().await;

        let response = search(&dispatcher, &[("q", "trains")]).await;
        let results = response.json().unwrap();
        let paths = results
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["path"].as_str().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(paths, vec!["trains.md", "guide.md"]);
    }

    #[tokio::test]
    async fn limit_parameter() {
        let (_tmp, dispatcher) = fixture().await;

        let response = search(&dispatcher, &[("q", "trains"), ("limit", "1")]).await;
        assert_eq!(response.json().unwrap().as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_query_returns_nothing() {
        let (_tmp, dispatcher) = fixture().await;

        let response = search(&dispatcher, &[]).await;
        assert_eq!(response.json().unwrap().as_array().unwrap().len(), 0);
    }
}
