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

use clap::ArgMatches;

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::store::StoreMode;
use crate::submission::jobscript::SubmissionRecord;
use crate::submission::shells::get_shell;
use crate::submission::submission_path;
use crate::workflow::Workflow;

pub async fn workflow(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let path = matches
        .get_one::<String>("workflow_path")
        .expect("required by clap");
    let path = Path::new(path);

    match matches.subcommand() {
        Some(("submit", matches)) => {
            let mut wk = Workflow::open(config.clone(), path, StoreMode::ReadWrite)?;
            let js_parallelism = matches.get_one::<bool>("js_parallelism").copied();
            let wait = matches.get_flag("wait");
            match wk.submit(js_parallelism, wait).await? {
                Some(sub_idx) => println!("{}", sub_idx),
                None => println!("nothing to submit"),
            }
            Ok(())
        }
        Some(("get-param", matches)) => {
            let wk = Workflow::open(config.clone(), path, StoreMode::ReadOnly)?;
            let index = *matches.get_one::<usize>("index").expect("required by clap");
            match wk.get_parameter_data(index)? {
                Some(value) => println!("{}", value),
                None => println!("null"),
            }
            Ok(())
        }
        Some(("get-param-source", matches)) => {
            let wk = Workflow::open(config.clone(), path, StoreMode::ReadOnly)?;
            let index = *matches.get_one::<usize>("index").expect("required by clap");
            let source = wk.get_parameter_source(index)?;
            println!("{}", serde_json::to_string(&source).unwrap_or_default());
            Ok(())
        }
        Some(("get-all-params", _)) => {
            let wk = Workflow::open(config.clone(), path, StoreMode::ReadOnly)?;
            for (index, value) in wk.get_all_parameter_data()? {
                let text = value
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| String::from("null"));
                println!("{}: {}", index, text);
            }
            Ok(())
        }
        Some(("is-param-set", matches)) => {
            let wk = Workflow::open(config.clone(), path, StoreMode::ReadOnly)?;
            let index = *matches.get_one::<usize>("index").expect("required by clap");
            println!("{}", wk.is_parameter_set(index)?);
            Ok(())
        }
        Some(("sub", matches)) => submission(matches, config, path).await,
        Some((other, _)) => Err(Error::Runtime(format!("Unknown subcommand: {}", other))),
        None => Err(Error::Runtime(String::from("No subcommand"))),
    }
}

fn get_submission(wk: &Workflow, sub_idx: usize) -> Result<SubmissionRecord> {
    wk.get_submissions()?
        .into_iter()
        .find(|s| s.index == sub_idx)
        .ok_or_else(|| Error::Runtime(format!("No submission at index {}", sub_idx)))
}

async fn submission(matches: &ArgMatches, config: &Configuration, path: &Path) -> Result<()> {
    let wk = Workflow::open(config.clone(), path, StoreMode::ReadOnly)?;
    let sub_idx = *matches.get_one::<usize>("sub_idx").expect("required by clap");
    let sub = get_submission(&wk, sub_idx)?;

    match matches.subcommand() {
        Some(("status", _)) => {
            let status = if sub.submitted_jobscripts.is_empty() {
                "pending"
            } else if sub.needs_submit() {
                "partially submitted"
            } else {
                "submitted"
            };
            println!("{}", status);
            Ok(())
        }
        Some(("submitted-js", _)) => {
            println!("{:?}", sub.submitted_jobscripts);
            Ok(())
        }
        Some(("outstanding-js", _)) => {
            println!("{:?}", sub.outstanding_jobscripts());
            Ok(())
        }
        Some(("needs-submit", _)) => {
            println!("{}", sub.needs_submit());
            Ok(())
        }
        Some(("js", matches)) => {
            let js_idx = *matches.get_one::<usize>("js_idx").expect("required by clap");
            let js = sub
                .jobscripts
                .get(js_idx)
                .ok_or_else(|| Error::Runtime(format!("No jobscript at index {}", js_idx)))?;
            let shell = get_shell(js.shell_name(), js.os_name())?;
            let js_path =
                submission_path(path, sub_idx).join(js.jobscript_file_name(shell.js_ext()));

            match matches.subcommand() {
                Some(("res", _)) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&js.resources).unwrap_or_default()
                    );
                    Ok(())
                }
                Some(("deps", _)) => {
                    println!("{:?}", js.external_dependencies());
                    Ok(())
                }
                Some(("path", _)) => {
                    println!("{}", js_path.display());
                    Ok(())
                }
                Some(("show", _)) => {
                    let text = std::fs::read_to_string(&js_path).map_err(|e| {
                        Error::Runtime(format!("Cannot read {}: {}", js_path.display(), e))
                    })?;
                    println!("{}", text);
                    Ok(())
                }
                Some((other, _)) => Err(Error::Runtime(format!("Unknown subcommand: {}", other))),
                None => Err(Error::Runtime(String::from("No subcommand"))),
            }
        }
        Some((other, _)) => Err(Error::Runtime(format!("Unknown subcommand: {}", other))),
        None => Err(Error::Runtime(String::from("No subcommand"))),
    }
}
