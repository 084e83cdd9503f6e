// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Arg, ArgAction, ArgMatches, Command};

use super::Error;

pub fn command() -> Command {
    Command::new("search")
        .about("Full-text search over cached page content")
        .arg(
            Arg::new("mount")
                .help("Authority and mount path, e.g. locomote.sh/acme/docs")
                .required(true)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("query")
                .help("Search terms")
                .required(true)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("limit")
                .short('n')
                .long("limit")
                .help("Maximum number of results")
                .action(ArgAction::Set),
        )
}

pub async fn handle(args: &ArgMatches) -> Result<(), Error> {
    let mount = args.get_one::<String>("mount").expect("required arg");
    let query = args.get_one::<String>("query").expect("required arg");

    let mut url = format!("content://{mount}/search.api?q={query}");
    if let Some(limit) = args.get_one::<String>("limit") {
        url.push_str(&format!("&limit={limit}"));
    }

    let provider = super::build_provider(args).await?;
    let response = provider.serve(&url).await;

    if let Some(error) = response.error() {
        return Err(Error::Request(error.to_string()));
    }

    let results = response
        .json()
        .and_then(|value| value.as_array().cloned())
        .unwrap_or_default();

    for result in &results {
        let path = result["path"].as_str().unwrap_or_default();
        match result["title"].as_str() {
            Some(title) => println!("{path}: {title}"),
            None => println!("{path}"),
        }
    }

    if results.is_empty() {
        println!("no results for '{query}'");
    }

    Ok(())
}
