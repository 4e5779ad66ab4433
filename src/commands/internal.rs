//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Internal CLI invoked by generated jobscripts around each command run.

use std::path::Path;

use clap::ArgMatches;

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::store::StoreMode;
use crate::workflow::Workflow;

fn run_location(matches: &ArgMatches) -> (usize, usize, usize, usize) {
    let get = |name: &str| *matches.get_one::<usize>(name).expect("required by clap");
    (
        get("submission_idx"),
        get("jobscript_idx"),
        get("js_element_idx"),
        get("js_action_idx"),
    )
}

pub async fn internal(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    match matches.subcommand() {
        Some(("workflow", matches)) => {
            let path = matches.get_one::<String>("path").expect("required by clap");
            let mut wk =
                Workflow::open(config.clone(), Path::new(path), StoreMode::ReadWrite)?;

            match matches.subcommand() {
                Some(("write-commands", matches)) => {
                    let (sub_idx, js_idx, elem_idx, act_idx) = run_location(matches);
                    wk.write_commands(sub_idx, js_idx, elem_idx, act_idx)
                }
                Some(("save-parameter", matches)) => {
                    let name = matches.get_one::<String>("name").expect("required by clap");
                    let value = matches.get_one::<String>("value").expect("required by clap");
                    let (sub_idx, js_idx, elem_idx, act_idx) = run_location(matches);
                    wk.save_parameter(name, value, sub_idx, js_idx, elem_idx, act_idx)
                }
                Some(("set-ear-start", matches)) => {
                    let (sub_idx, js_idx, elem_idx, act_idx) = run_location(matches);
                    wk.set_ear_start(sub_idx, js_idx, elem_idx, act_idx)
                }
                Some(("set-ear-end", matches)) => {
                    let (sub_idx, js_idx, elem_idx, act_idx) = run_location(matches);
                    let exit_code = *matches
                        .get_one::<i32>("exit_code")
                        .expect("required by clap");
                    wk.set_ear_end(sub_idx, js_idx, elem_idx, act_idx, exit_code)
                }
                Some((other, _)) => {
                    Err(Error::Runtime(format!("Unknown subcommand: {}", other)))
                }
                None => Err(Error::Runtime(String::from("No subcommand"))),
            }
        }
        Some((other, _)) => Err(Error::Runtime(format!("Unknown subcommand: {}", other))),
        None => Err(Error::Runtime(String::from("No subcommand"))),
    }
}
