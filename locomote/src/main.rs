// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::process::ExitCode;

mod cli;

/// Main entry point
#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match cli::process().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("locomote: {error}");
            ExitCode::from(cli::exit_code(&error))
        }
    }
}
