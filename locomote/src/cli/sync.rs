// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, warn};

use locomote::environment;

use super::Error;

pub fn command() -> Command {
    Command::new("sync")
        .about("Synchronize all configured repositories")
        .arg(
            Arg::new("watch")
                .short('w')
                .long("watch")
                .help("Keep running, refreshing on an interval")
                .action(ArgAction::SetTrue),
        )
}

pub async fn handle(args: &ArgMatches) -> Result<(), Error> {
    let provider = super::build_provider(args).await?;

    let timeout = Duration::from_secs(super::env_u64(
        environment::ENV_STARTUP_TIMEOUT,
        environment::DEFAULT_STARTUP_TIMEOUT_SECONDS,
    ));

    sync_once(&provider, Some(timeout)).await?;

    if args.get_flag("watch") {
        let minutes = super::env_u64(
            environment::ENV_REFRESH_INTERVAL,
            environment::DEFAULT_REFRESH_INTERVAL_MINUTES,
        );
        let mut interval = tokio::time::interval(Duration::from_secs(minutes * 60));
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(error) = sync_once(&provider, None).await {
                warn!("{error}");
            }
        }
    }

    Ok(())
}

async fn sync_once(
    provider: &locomote::ContentProvider,
    timeout: Option<Duration>,
) -> Result<(), Error> {
    let reports = match timeout {
        Some(timeout) => provider
            .sync_all_with_timeout(timeout)
            .await
            .ok_or(Error::Incomplete)?,
        None => provider.sync_all().await,
    };

    let mut failures = vec![];

    for report in reports {
        match report.result {
            Ok(refresh) => {
                info!("{}/{} synced", report.authority, report.mount);
                for warning in &refresh.warnings {
                    warn!("{}/{}: {warning}", report.authority, report.mount);
                }
                if refresh.incomplete {
                    return Err(Error::Incomplete);
                }
            }
            Err(error) => {
                failures.push(format!("{}/{}: {error}", report.authority, report.mount));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Sync(failures.join("; ")))
    }
}
