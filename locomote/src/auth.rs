// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::RwLock;

use log::info;
use reqwest::StatusCode;
use thiserror::Error;

use crate::request;
use crate::settings::Settings;

/// A username and password for accessing a content repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// In-memory credential handle for a repository.
///
/// Network I/O reads the handle; mutation (login / logout) happens
/// through queue operations or explicit calls. A handle goes stale when
/// the server rejects its credentials, signalling that the caller should
/// re-authenticate before the next sync.
#[derive(Debug, Default)]
pub struct AccountManager {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    credentials: Option<Credentials>,
    stale: bool,
}

impl AccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(username: impl ToString, password: impl ToString) -> Self {
        Self {
            state: RwLock::new(State {
                credentials: Some(Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                }),
                stale: false,
            }),
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.state.read().expect("rwlock read").credentials.clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.read().expect("rwlock read").credentials.is_some()
    }

    /// Whether the server has rejected the held credentials
    pub fn is_stale(&self) -> bool {
        self.state.read().expect("rwlock read").stale
    }

    pub fn mark_stale(&self) {
        self.state.write().expect("rwlock write").stale = true;
    }

    /// Store new credentials, clearing any stale marker
    pub fn login(&self, username: impl ToString, password: impl ToString) {
        let mut state = self.state.write().expect("rwlock write");
        state.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        state.stale = false;
    }

    pub fn logout(&self) {
        let mut state = self.state.write().expect("rwlock write");
        state.credentials = None;
        state.stale = false;
    }

    /// Verify the held credentials against the repository's login
    /// endpoint
    pub async fn authenticate(&self, settings: &Settings) -> Result<(), Error> {
        let credentials = self.credentials().ok_or(Error::NoCredentials)?;
        let url = settings.url_for_authentication()?;

        let response = request::client()
            .post(url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            self.mark_stale();
            return Err(Error::InvalidCredentials);
        }

        response.error_for_status()?;
        info!("authenticated {} against {}", credentials.username, settings.host);

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no credentials held")]
    NoCredentials,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid url")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request")]
    Request(#[from] reqwest::Error),
}
