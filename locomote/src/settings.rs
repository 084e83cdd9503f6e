// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::str::FromStr;

use thiserror::Error;
use url::Url;

/// Default server host
pub const DEFAULT_HOST: &str = "locomote.sh";
/// Default server protocol
pub const DEFAULT_PROTOCOL: &str = "https";
/// Default repository branch
pub const DEFAULT_BRANCH: &str = "master";

/// Identity of a single content repository and how to reach it.
///
/// Settings can be parsed from a reference string of the form:
///
/// ```text
/// (protocol:)?(username:password@)?(host(:port)?/)?account/repo(/branch)?
/// ```
///
/// Omitted fields take their defaults (`https`, `locomote.sh`, the
/// protocol's standard port, `master`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub account: String,
    pub repo: String,
    pub branch: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_realm: Option<String>,
}

impl Settings {
    pub fn new(account: impl ToString, repo: impl ToString) -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: default_port(DEFAULT_PROTOCOL),
            account: account.to_string(),
            repo: repo.to_string(),
            branch: DEFAULT_BRANCH.to_string(),
            username: None,
            password: None,
            auth_realm: None,
        }
    }

    /// The authority name derived from these settings.
    ///
    /// This is the lowercased host name, with `:port` appended when the
    /// port isn't the protocol's standard port.
    pub fn authority_name(&self) -> String {
        let host = self.host.to_lowercase();

        if self.port == default_port(&self.protocol) {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// The path this repository is mounted under within its authority,
    /// i.e. `account/repo` or `account/repo/~branch`.
    pub fn mount_path(&self) -> String {
        if self.branch == DEFAULT_BRANCH {
            format!("{}/{}", self.account, self.repo)
        } else {
            format!("{}/{}/~{}", self.account, self.repo, self.branch)
        }
    }

    fn base(&self) -> String {
        if self.port == default_port(&self.protocol) {
            format!("{}://{}", self.protocol, self.host)
        } else {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        }
    }

    fn repo_url(&self, section: &str, rest: &str) -> Result<Url, url::ParseError> {
        format!(
            "{}/{section}/{}/{}/{}{rest}",
            self.base(),
            self.account,
            self.repo,
            self.branch
        )
        .parse()
    }

    /// The base URL of the server API. Used as the HTTP authentication
    /// protection space.
    pub fn api_base_url(&self) -> Result<Url, url::ParseError> {
        format!("{}/{}/{}", self.base(), self.account, self.repo).parse()
    }

    /// URL for login authentication
    pub fn url_for_authentication(&self) -> Result<Url, url::ParseError> {
        self.repo_url("auth", "/login")
    }

    /// URL of the updates feed, optionally from a commit cursor
    pub fn url_for_updates(&self, since: Option<&str>) -> Result<Url, url::ParseError> {
        let mut url = self.repo_url("updates", "")?;
        if let Some(since) = since {
            url.query_pairs_mut().append_pair("since", since);
        }
        Ok(url)
    }

    /// URL of the fileset bundle for a category
    pub fn url_for_fileset(&self, category: &str) -> Result<Url, url::ParseError> {
        self.repo_url("filesets", &format!("/{category}.zip"))
    }

    /// URL of an individual file's bytes
    pub fn url_for_file(&self, path: &str) -> Result<Url, url::ParseError> {
        self.repo_url("files", &format!("/{path}"))
    }

    /// URL of the fileset reset endpoint for a category
    pub fn url_for_reset(&self, category: &str, cvs: &str) -> Result<Url, url::ParseError> {
        let mut url = self.repo_url("reset", &format!("/{category}"))?;
        url.query_pairs_mut().append_pair("cvs", cvs);
        Ok(url)
    }
}

impl FromStr for Settings {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s.trim();

        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        // Leading protocol, with or without the `//`
        let mut protocol = None;
        for scheme in ["https", "http"] {
            if let Some(tail) = rest.strip_prefix(scheme).and_then(|t| t.strip_prefix(':')) {
                protocol = Some(scheme);
                rest = tail.strip_prefix("//").unwrap_or(tail);
                break;
            }
        }
        let protocol = protocol.unwrap_or(DEFAULT_PROTOCOL).to_string();

        // Credentials terminated by the first `@`
        let (username, password) = match rest.split_once('@') {
            Some((creds, tail)) => {
                rest = tail;
                match creds.split_once(':') {
                    Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
                    None => (Some(creds.to_string()), None),
                }
            }
            None => (None, None),
        };

        let segments = rest
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        // A leading segment is only a host if it looks like one; otherwise
        // three segments read as account/repo/branch.
        let has_host = segments
            .first()
            .map(|s| s.contains('.') || s.contains(':'))
            .unwrap_or_default();

        let (host_segment, path) = if has_host {
            (segments.first().copied(), &segments[1..])
        } else {
            (None, segments.as_slice())
        };

        let (host, port) = match host_segment {
            Some(host) => match host.split_once(':') {
                Some((name, port)) => (
                    name.to_string(),
                    Some(
                        port.parse::<u16>()
                            .map_err(|_| ParseError::InvalidPort(port.to_string()))?,
                    ),
                ),
                None => (host.to_string(), None),
            },
            None => (DEFAULT_HOST.to_string(), None),
        };

        let mut path = path.iter();

        let account = path.next().ok_or(ParseError::MissingAccount)?.to_string();
        let repo = path.next().ok_or(ParseError::MissingRepo)?.to_string();
        let branch = path
            .next()
            .map(|b| b.trim_start_matches('~').to_string())
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string());

        if path.next().is_some() {
            return Err(ParseError::TrailingSegments(s.to_string()));
        }

        Ok(Self {
            port: port.unwrap_or_else(|| default_port(&protocol)),
            protocol,
            host,
            account,
            repo,
            branch,
            username,
            password,
            auth_realm: None,
        })
    }
}

fn default_port(protocol: &str) -> u16 {
    match protocol {
        "http" => 80,
        _ => 443,
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty settings reference")]
    Empty,
    #[error("settings reference is missing an account name")]
    MissingAccount,
    #[error("settings reference is missing a repo name")]
    MissingRepo,
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("too many path segments in settings reference: {0}")]
    TrailingSegments(String),
}
