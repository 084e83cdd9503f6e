// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Arg, ArgAction, ArgMatches, Command};

use locomote::config::{self, Config, RepositoryConfig};
use locomote::Settings;

use super::Error;

pub fn command() -> Command {
    Command::new("repo")
        .about("Manage configured repositories")
        .arg_required_else_help(true)
        .subcommand(Command::new("list").about("List configured repositories"))
        .subcommand(
            Command::new("add")
                .about("Add a repository by settings reference")
                .arg(
                    Arg::new("reference")
                        .help("(protocol:)?(user:pass@)?(host(:port)?/)?account/repo(/branch)?")
                        .required(true)
                        .action(ArgAction::Set),
                ),
        )
}

pub async fn handle(args: &ArgMatches) -> Result<(), Error> {
    match args.subcommand() {
        Some(("list", args)) => list(args),
        Some(("add", args)) => add(args),
        _ => unreachable!(),
    }
}

fn list(args: &ArgMatches) -> Result<(), Error> {
    let config = config::load(super::config_dir(args)?);

    if config.repositories.is_empty() {
        println!("no repositories configured");
        return Ok(());
    }

    for repository in &config.repositories {
        let settings = repository.reference.parse::<Settings>();
        match settings {
            Ok(settings) => println!(
                "{} ({} via {})",
                settings.mount_path(),
                settings.authority_name(),
                repository.reference
            ),
            Err(error) => println!("{} (invalid: {error})", repository.reference),
        }
    }

    Ok(())
}

fn add(args: &ArgMatches) -> Result<(), Error> {
    let reference = args.get_one::<String>("reference").expect("required arg");

    let settings = reference
        .parse::<Settings>()
        .map_err(|error| Error::Config(format!("{reference}: {error}")))?;

    let name = format!("{}-{}", settings.account, settings.repo);
    let config = Config {
        repositories: vec![RepositoryConfig {
            reference: reference.clone(),
            filesets: None,
            on_demand: true,
        }],
    };

    config::save(super::config_dir(args)?, &name, &config)?;

    println!("added {}", settings.mount_path());

    Ok(())
}
