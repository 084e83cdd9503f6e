// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use bytes::Bytes;
use thiserror::Error;

/// Whether the URL loading system may cache the response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    #[default]
    Allowed,
    NotAllowed,
}

/// Error kinds a handler can resolve a request with. Request-side errors
/// are returned to the caller and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("invalid request path: {0}")]
    InvalidPath(String),
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),
    #[error("invalid fileset category: {0}")]
    InvalidCategory(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("authentication required: {0}")]
    Auth(String),
}

/// The write side of a content request.
///
/// A handler either replies in one shot (data / string / JSON / file
/// path), streams with [`start`](ContentResponse::start) +
/// [`send_data`](ContentResponse::send_data) + [`done`](ContentResponse::done),
/// or resolves the request with an error. A handler that starts a
/// streaming response must finish it one way or the other.
pub trait ContentResponse: Send {
    /// Respond with data in full and end the response
    fn respond_with_data(&mut self, data: Bytes, mime_type: &str, policy: CachePolicy);

    /// Start a streaming response; [`Self::done`] must be called on
    /// completion
    fn start(&mut self, mime_type: &str, policy: CachePolicy);

    /// Append data to a started response
    fn send_data(&mut self, data: Bytes);

    /// End a streaming response
    fn done(&mut self);

    /// Respond with the path of a local file; the caller memory-maps or
    /// streams the bytes
    fn respond_with_file(&mut self, path: PathBuf, mime_type: &str, policy: CachePolicy);

    /// Resolve the request with an error instead of content
    fn respond_with_error(&mut self, error: ResponseError);

    fn respond_with_string(&mut self, data: &str, mime_type: &str, policy: CachePolicy) {
        self.respond_with_data(Bytes::copy_from_slice(data.as_bytes()), mime_type, policy);
    }

    fn respond_with_json(&mut self, value: serde_json::Value, policy: CachePolicy) {
        match serde_json::to_vec(&value) {
            Ok(data) => self.respond_with_data(data.into(), "application/json", policy),
            Err(error) => self.respond_with_error(ResponseError::UnsupportedType(error.to_string())),
        }
    }
}

/// Completed response content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data {
        data: Bytes,
        mime_type: String,
        policy: CachePolicy,
    },
    File {
        path: PathBuf,
        mime_type: String,
        policy: CachePolicy,
    },
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Pending,
    Streaming {
        mime_type: String,
        policy: CachePolicy,
        data: Vec<u8>,
    },
    Complete(Payload),
    Failed(ResponseError),
}

/// A buffered [`ContentResponse`] collecting the reply in memory
#[derive(Debug, Default)]
pub struct Response {
    state: State,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// The completed payload, if the handler resolved with content
    pub fn payload(&self) -> Option<&Payload> {
        match &self.state {
            State::Complete(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ResponseError> {
        match &self.state {
            State::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, State::Complete(_) | State::Failed(_))
    }

    /// Response bytes for data payloads
    pub fn data(&self) -> Option<&Bytes> {
        match self.payload()? {
            Payload::Data { data, .. } => Some(data),
            Payload::File { .. } => None,
        }
    }

    /// Parse a data payload as JSON
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(self.data()?).ok()
    }
}

impl ContentResponse for Response {
    fn respond_with_data(&mut self, data: Bytes, mime_type: &str, policy: CachePolicy) {
        self.state = State::Complete(Payload::Data {
            data,
            mime_type: mime_type.to_string(),
            policy,
        });
    }

    fn start(&mut self, mime_type: &str, policy: CachePolicy) {
        self.state = State::Streaming {
            mime_type: mime_type.to_string(),
            policy,
            data: vec![],
        };
    }

    fn send_data(&mut self, data: Bytes) {
        if let State::Streaming { data: buffer, .. } = &mut self.state {
            buffer.extend_from_slice(&data);
        }
    }

    fn done(&mut self) {
        if let State::Streaming {
            mime_type,
            policy,
            data,
        } = std::mem::take(&mut self.state)
        {
            self.state = State::Complete(Payload::Data {
                data: data.into(),
                mime_type,
                policy,
            });
        }
    }

    fn respond_with_file(&mut self, path: PathBuf, mime_type: &str, policy: CachePolicy) {
        self.state = State::Complete(Payload::File {
            path,
            mime_type: mime_type.to_string(),
            policy,
        });
    }

    fn respond_with_error(&mut self, error: ResponseError) {
        self.state = State::Failed(error);
    }
}
