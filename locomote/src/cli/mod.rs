// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command};
use thiserror::Error;

use locomote::config;
use locomote::environment;
use locomote::paths::BasePaths;
use locomote::provider::ContentProvider;
use locomote::Settings;

mod get;
mod repo;
mod search;
mod sync;

/// Generate the CLI command structure
fn command() -> Command {
    Command::new("locomote")
        .about("Client-side content distribution for Locomote repositories")
        .arg(
            Arg::new("version")
                .short('v')
                .long("version")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("directory")
                .short('D')
                .long("directory")
                .global(true)
                .help("Base directory for databases, caches and staging")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .help("Configuration directory")
                .action(ArgAction::Set),
        )
        .arg_required_else_help(true)
        .subcommand(sync::command())
        .subcommand(get::command())
        .subcommand(search::command())
        .subcommand(repo::command())
}

/// Process all CLI arguments
pub async fn process() -> Result<(), Error> {
    let matches = command().get_matches();

    if matches.get_flag("version") {
        println!("{}", environment::version());
        return Ok(());
    }

    match matches.subcommand() {
        Some(("sync", args)) => sync::handle(args).await,
        Some(("get", args)) => get::handle(args).await,
        Some(("search", args)) => search::handle(args).await,
        Some(("repo", args)) => repo::handle(args).await,
        _ => unreachable!(),
    }
}

/// Map an error onto the service exit codes: 1 timeout/incomplete or
/// request failure, 2 configuration, 3 fatal DB/cache.
pub fn exit_code(error: &Error) -> u8 {
    match error {
        Error::Incomplete | Error::Request(_) => 1,
        Error::Config(_) => 2,
        Error::Provider(_) | Error::Save(_) | Error::Sync(_) => 3,
    }
}

pub(crate) fn base_paths(args: &ArgMatches) -> Result<BasePaths, Error> {
    if let Some(directory) = args.get_one::<String>("directory") {
        return Ok(BasePaths::under(directory));
    }
    if let Ok(directory) = std::env::var(environment::ENV_DATA_DIR) {
        return Ok(BasePaths::under(directory));
    }

    BasePaths::discover().ok_or_else(|| {
        Error::Config("no base directory; pass --directory or set LOCOMOTE_DATA_DIR".to_string())
    })
}

pub(crate) fn config_dir(args: &ArgMatches) -> Result<PathBuf, Error> {
    if let Some(dir) = args.get_one::<String>("config") {
        return Ok(PathBuf::from(dir));
    }

    config::default_dir().ok_or_else(|| Error::Config("no configuration directory".to_string()))
}

/// Build a provider hosting every configured repository
pub(crate) async fn build_provider(args: &ArgMatches) -> Result<ContentProvider, Error> {
    let base = base_paths(args)?;
    let config = config::load(config_dir(args)?);

    if config.repositories.is_empty() {
        return Err(Error::Config("no repositories configured".to_string()));
    }

    let provider = ContentProvider::new(base);

    for repository in config.repositories {
        let settings = repository
            .reference
            .parse::<Settings>()
            .map_err(|error| Error::Config(format!("{}: {error}", repository.reference)))?;

        let filesets = repository.filesets.map(|filesets| {
            filesets
                .into_iter()
                .map(|fileset| (fileset.category.clone(), fileset))
                .collect::<HashMap<_, _>>()
        });

        provider
            .add_repository(settings, filesets, repository.on_demand)
            .await?;
    }

    Ok(provider)
}

pub(crate) fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),
    #[error("synchronization incomplete at timeout")]
    Incomplete,
    #[error("synchronization failed: {0}")]
    Sync(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error(transparent)]
    Provider(#[from] locomote::provider::Error),
    #[error(transparent)]
    Save(#[from] config::SaveError),
}
