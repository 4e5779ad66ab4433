//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::path::Path;

use tracing::error;
use tracing_subscriber::EnvFilter;

use gantry::cli::cli;
use gantry::commands;
use gantry::config::Configuration;
use gantry::error::{Error, Result};
use gantry::ui;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();

    let config = match Configuration::load(
        matches.get_one::<String>("config").map(Path::new),
    ) {
        Ok(config) => config,
        Err(err) => {
            ui::print_error(&err);
            std::process::exit(1);
        }
    };

    let result: Result<()> = match matches.subcommand() {
        Some(("make", matches)) => commands::make(matches, &config).await,
        Some(("go", matches)) => commands::go(matches, &config).await,
        Some(("workflow", matches)) => commands::workflow(matches, &config).await,
        Some(("internal", matches)) => commands::internal(matches, &config).await,
        Some((other, _)) => Err(Error::Runtime(format!("Unknown subcommand: {}", other))),
        None => Err(Error::Runtime(String::from("No subcommand"))),
    };

    if let Err(err) = result {
        error!("{}", err);
        ui::print_error(&err);
        std::process::exit(ui::error_exit_code(&err));
    }
}
