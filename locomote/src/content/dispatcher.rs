// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use super::response::{ContentResponse, ResponseError};
use super::Request;

/// A content URL request handler.
///
/// Generates response content for a content request. Handlers recover
/// nothing; failures resolve the response with an error.
pub trait RequestHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut dyn ContentResponse,
    ) -> BoxFuture<'a, ()>;
}

/// A compiled request path pattern.
///
/// Patterns are made of literal segments, `{name}` captures and an
/// optional trailing `{name...}` rest-capture.
#[derive(Debug, Clone)]
pub struct Pattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Capture(String),
    Rest(String),
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let raw = pattern.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();

        let mut segments = vec![];
        for (index, segment) in raw.iter().enumerate() {
            let compiled = match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => match name.strip_suffix("...") {
                    Some(name) if index == raw.len() - 1 => Segment::Rest(name.to_string()),
                    Some(_) => return Err(PatternError::RestNotLast(pattern.to_string())),
                    None => Segment::Capture(name.to_string()),
                },
                None => Segment::Literal(segment.to_string()),
            };
            segments.push(compiled);
        }

        Ok(Self { segments })
    }

    /// Match a request path, extracting captures. The first pattern in a
    /// dispatcher to return `Some` wins.
    pub fn matches(&self, path: &[String]) -> Option<HashMap<String, String>> {
        let mut parameters = HashMap::new();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(literal) => {
                    if path.get(index)? != literal {
                        return None;
                    }
                }
                Segment::Capture(name) => {
                    parameters.insert(name.clone(), path.get(index)?.clone());
                }
                Segment::Rest(name) => {
                    let rest = path.get(index..)?;
                    if rest.is_empty() {
                        return None;
                    }
                    parameters.insert(name.clone(), rest.join("/"));
                    return Some(parameters);
                }
            }
        }

        (path.len() == self.segments.len()).then_some(parameters)
    }
}

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("rest capture must be the final segment: {0}")]
    RestNotLast(String),
}

/// Dispatches content requests to the first handler whose path pattern
/// matches. Mappings are registered once, at construction.
#[derive(Default)]
pub struct Dispatcher {
    mappings: Vec<(Pattern, Arc<dyn RequestHandler>)>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        pattern: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), PatternError> {
        self.mappings.push((Pattern::parse(pattern)?, handler));
        Ok(())
    }

    /// Dispatch a request, writing the outcome to `response`. Unmatched
    /// paths resolve with a not-found error.
    pub async fn dispatch(&self, request: &mut Request, response: &mut dyn ContentResponse) {
        for (pattern, handler) in &self.mappings {
            if let Some(parameters) = pattern.matches(request.path.segments()) {
                request.path_parameters = parameters;
                handler.handle(request, response).await;
                return;
            }
        }

        response.respond_with_error(ResponseError::NotFound(request.path.to_string()));
    }
}

#[cfg(test)]
mod test {
    use futures::FutureExt;

    use super::*;
    use crate::content::response::{CachePolicy, Response};
    use crate::content::ContentPath;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle<'a>(
            &'a self,
            request: &'a Request,
            response: &'a mut dyn ContentResponse,
        ) -> BoxFuture<'a, ()> {
            async move {
                let mut keys = request
                    .path_parameters
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>();
                keys.sort();
                response.respond_with_string(&keys.join("&"), "text/plain", CachePolicy::Allowed);
            }
            .boxed()
        }
    }

    async fn dispatch(dispatcher: &Dispatcher, path: &str) -> Response {
        let mut request = Request::new("locomote.sh", path.parse::<ContentPath>().unwrap());
        let mut response = Response::new();
        dispatcher.dispatch(&mut request, &mut response).await;
        response
    }

    #[test]
    fn pattern_matching() {
        let pattern = Pattern::parse("files.api/{id}/content").unwrap();

        assert!(pattern.matches(&["files.api".into()]).is_none());

        let params = pattern
            .matches(&["files.api".into(), "f1".into(), "content".into()])
            .unwrap();
        assert_eq!(params["id"], "f1");

        let rest = Pattern::parse("{path...}").unwrap();
        let params = rest.matches(&["a".into(), "b".into(), "c.txt".into()]).unwrap();
        assert_eq!(params["path"], "a/b/c.txt");
        assert!(rest.matches(&[]).is_none());

        assert!(Pattern::parse("{path...}/tail").is_err());
    }

    #[tokio::test]
    async fn first_match_wins() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add("files.api/{id}", Arc::new(Echo)).unwrap();
        dispatcher.add("{path...}", Arc::new(Echo)).unwrap();

        let response = dispatch(&dispatcher, "files.api/f1").await;
        assert_eq!(response.data().unwrap().as_ref(), b"id=f1");

        let response = dispatch(&dispatcher, "some/file.txt").await;
        assert_eq!(response.data().unwrap().as_ref(), b"path=some/file.txt");
    }

    #[tokio::test]
    async fn unmatched_paths_are_not_found() {
        let dispatcher = Dispatcher::new();

        let response = dispatch(&dispatcher, "anything").await;
        assert!(matches!(
            response.error(),
            Some(ResponseError::NotFound(_))
        ));
    }
}
