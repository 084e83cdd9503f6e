// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;

pub use self::dispatcher::{Dispatcher, RequestHandler};
pub use self::path::ContentPath;
pub use self::response::{CachePolicy, ContentResponse, Payload, Response, ResponseError};

pub mod dispatcher;
pub mod path;
pub mod response;

/// A content URL request being dispatched to a handler
#[derive(Debug, Clone)]
pub struct Request {
    /// The authority the request was made to
    pub authority: String,
    /// The request path, relative to the handler's mount
    pub path: ContentPath,
    /// Query parameters
    pub parameters: HashMap<String, String>,
    /// Parameters extracted from the request path by the matched pattern
    pub path_parameters: HashMap<String, String>,
}

impl Request {
    pub fn new(authority: impl ToString, path: ContentPath) -> Self {
        Self {
            authority: authority.to_string(),
            path,
            parameters: HashMap::new(),
            path_parameters: HashMap::new(),
        }
    }

    pub fn with_parameters(self, parameters: HashMap<String, String>) -> Self {
        Self { parameters, ..self }
    }

    /// A path parameter captured by the matched pattern
    pub fn path_parameter(&self, name: &str) -> Option<&str> {
        self.path_parameters.get(name).map(String::as_str)
    }

    /// A query parameter
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}
