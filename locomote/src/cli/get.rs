// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io::Write;

use clap::{Arg, ArgAction, ArgMatches, Command};

use locomote::content::Payload;

use super::Error;

pub fn command() -> Command {
    Command::new("get")
        .about("Fetch content by content:// URL and write it to stdout")
        .arg(
            Arg::new("url")
                .help("A content://{authority}/{path} URL")
                .required(true)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .help("Write to a file instead of stdout")
                .action(ArgAction::Set),
        )
}

pub async fn handle(args: &ArgMatches) -> Result<(), Error> {
    let url = args.get_one::<String>("url").expect("required arg");

    let provider = super::build_provider(args).await?;
    let response = provider.serve(url).await;

    if let Some(error) = response.error() {
        return Err(Error::Request(error.to_string()));
    }

    let bytes = match response.payload() {
        Some(Payload::Data { data, .. }) => data.to_vec(),
        Some(Payload::File { path, .. }) => {
            std::fs::read(path).map_err(|error| Error::Request(error.to_string()))?
        }
        None => return Err(Error::Request(format!("no content for {url}"))),
    };

    match args.get_one::<String>("output") {
        Some(output) => {
            std::fs::write(output, bytes).map_err(|error| Error::Request(error.to_string()))?;
        }
        None => {
            std::io::stdout()
                .write_all(&bytes)
                .map_err(|error| Error::Request(error.to_string()))?;
        }
    }

    Ok(())
}
