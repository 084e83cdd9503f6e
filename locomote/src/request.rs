// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, path::PathBuf};

use bytes::Bytes;
use futures::{
    stream::{self, BoxStream},
    Stream, StreamExt, TryStreamExt,
};
use once_cell::sync::Lazy;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::{fs::File, io::AsyncReadExt};
use tokio_util::io::ReaderStream;
use url::Url;

use crate::auth::Credentials;
use crate::environment;

/// Shared client for tcp socket reuse and connection limit
static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::ClientBuilder::new()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("build reqwest client")
});

pub(crate) fn client() -> &'static reqwest::Client {
    &CLIENT
}

/// Fetch a resource at the provided [`Url`] and stream its response bytes
pub async fn get(
    url: Url,
    credentials: Option<&Credentials>,
) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
    match url_file(&url) {
        Some(path) => read(path).await,
        _ => Ok(fetch(url, credentials).await?.boxed()),
    }
}

/// Fetch a resource and collect the response body in full
pub async fn get_body(url: Url, credentials: Option<&Credentials>) -> Result<Vec<u8>, Error> {
    let mut stream = get(url, credentials).await?;

    let mut body = vec![];
    while let Some(chunk) = stream.try_next().await? {
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}

async fn fetch(
    url: Url,
    credentials: Option<&Credentials>,
) -> Result<impl Stream<Item = Result<Bytes, Error>>, Error> {
    let mut request = CLIENT.get(url);
    if let Some(credentials) = credentials {
        request = request.basic_auth(&credentials.username, Some(&credentials.password));
    }

    let response = request.send().await?;

    if matches!(
        response.status(),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    ) {
        return Err(Error::Auth(response.status()));
    }

    response
        .error_for_status()
        .map(reqwest::Response::bytes_stream)
        .map(|stream| stream.map(|result| result.map_err(Error::Fetch)))
        .map_err(Error::Fetch)
}

async fn read(path: PathBuf) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len() as usize;

    if size > environment::FILE_READ_CHUNK_THRESHOLD {
        let stream = ReaderStream::with_capacity(file, environment::FILE_READ_BUFFER_SIZE);

        Ok(stream.map(|result| result.map_err(Error::Read)).boxed())
    } else {
        let mut bytes = Vec::with_capacity(size);
        file.read_to_end(&mut bytes).await?;

        Ok(stream::once(async move { Ok(bytes.into()) }).boxed())
    }
}

fn url_file(url: &Url) -> Option<PathBuf> {
    if url.scheme() == "file" {
        url.to_file_path().ok()
    } else {
        None
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The server rejected our credentials; never retried
    #[error("authentication rejected ({0})")]
    Auth(StatusCode),
    #[error("fetch")]
    Fetch(#[from] reqwest::Error),
    #[error("io")]
    Read(#[from] io::Error),
}

impl Error {
    /// Whether retrying the request can reasonably succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Auth(_) => false,
            Error::Fetch(error) => {
                error.is_timeout()
                    || error.is_connect()
                    || error.is_request()
                    || error
                        .status()
                        .map(|status| status.is_server_error())
                        .unwrap_or_default()
            }
            Error::Read(_) => false,
        }
    }
}
