//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use clap::crate_version;
use clap::{Arg, ArgAction, Command};

pub fn cli() -> Command {
    Command::new("gantry")
        .version(crate_version!())
        .about("Workflow orchestration for HPC batch schedulers and direct execution")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .required(false)
                .long("config")
                .value_name("PATH")
                .help("Path to a configuration file"),
        )
        .subcommand(make_command(Command::new("make").about("Generate a new workflow")))
        .subcommand(
            make_command(Command::new("go").about("Generate and submit a new workflow"))
                .arg(js_parallelism_arg())
                .arg(wait_arg()),
        )
        .subcommand(
            Command::new("workflow")
                .about("Interact with an existing workflow")
                .subcommand_required(true)
                .arg(
                    Arg::new("workflow_path")
                        .required(true)
                        .index(1)
                        .help("Path to an existing workflow"),
                )
                .subcommand(
                    Command::new("submit")
                        .about("Submit the workflow")
                        .arg(js_parallelism_arg())
                        .arg(wait_arg()),
                )
                .subcommand(
                    Command::new("get-param")
                        .about("Get a parameter value by data index")
                        .arg(index_arg()),
                )
                .subcommand(
                    Command::new("get-param-source")
                        .about("Get a parameter source by data index")
                        .arg(index_arg()),
                )
                .subcommand(
                    Command::new("get-all-params").about("Get all parameter values"),
                )
                .subcommand(
                    Command::new("is-param-set")
                        .about("Check if a parameter specified by data index is set")
                        .arg(index_arg()),
                )
                .subcommand(
                    Command::new("sub")
                        .about("Interact with an existing submission")
                        .subcommand_required(true)
                        .arg(
                            Arg::new("sub_idx")
                                .required(true)
                                .index(1)
                                .value_parser(clap::value_parser!(usize))
                                .help("The submission index"),
                        )
                        .subcommand(Command::new("status").about("Get the submission status"))
                        .subcommand(
                            Command::new("submitted-js")
                                .about("List jobscript indices that have been submitted"),
                        )
                        .subcommand(
                            Command::new("outstanding-js")
                                .about("List jobscript indices not yet submitted"),
                        )
                        .subcommand(
                            Command::new("needs-submit")
                                .about("Check if this submission needs submitting"),
                        )
                        .subcommand(
                            Command::new("js")
                                .about("Interact with a jobscript of this submission")
                                .subcommand_required(true)
                                .arg(
                                    Arg::new("js_idx")
                                        .required(true)
                                        .index(1)
                                        .value_parser(clap::value_parser!(usize))
                                        .help("The jobscript index within the submission"),
                                )
                                .subcommand(
                                    Command::new("res")
                                        .about("Get resources associated with this jobscript"),
                                )
                                .subcommand(
                                    Command::new("deps").about("Get jobscript dependencies"),
                                )
                                .subcommand(
                                    Command::new("path")
                                        .about("Get the file path to the jobscript"),
                                )
                                .subcommand(
                                    Command::new("show").about("Show the jobscript file"),
                                ),
                        ),
                ),
        )
        .subcommand(
            Command::new("internal")
                .hide(true)
                .about("Internal interface invoked by generated jobscripts")
                .subcommand_required(true)
                .subcommand(
                    Command::new("workflow")
                        .subcommand_required(true)
                        .arg(
                            Arg::new("path")
                                .required(true)
                                .index(1)
                                .help("Path to the workflow"),
                        )
                        .subcommand(
                            Command::new("write-commands")
                                .arg(run_location_arg("submission_idx", 1))
                                .arg(run_location_arg("jobscript_idx", 2))
                                .arg(run_location_arg("js_element_idx", 3))
                                .arg(run_location_arg("js_action_idx", 4)),
                        )
                        .subcommand(
                            Command::new("save-parameter")
                                .arg(Arg::new("name").required(true).index(1))
                                .arg(Arg::new("value").required(true).index(2))
                                .arg(run_location_arg("submission_idx", 3))
                                .arg(run_location_arg("jobscript_idx", 4))
                                .arg(run_location_arg("js_element_idx", 5))
                                .arg(run_location_arg("js_action_idx", 6)),
                        )
                        .subcommand(
                            Command::new("set-ear-start")
                                .arg(run_location_arg("submission_idx", 1))
                                .arg(run_location_arg("jobscript_idx", 2))
                                .arg(run_location_arg("js_element_idx", 3))
                                .arg(run_location_arg("js_action_idx", 4)),
                        )
                        .subcommand(
                            Command::new("set-ear-end")
                                .arg(run_location_arg("submission_idx", 1))
                                .arg(run_location_arg("jobscript_idx", 2))
                                .arg(run_location_arg("js_element_idx", 3))
                                .arg(run_location_arg("js_action_idx", 4))
                                .arg(
                                    Arg::new("exit_code")
                                        .required(true)
                                        .index(5)
                                        .allow_hyphen_values(true)
                                        .value_parser(clap::value_parser!(i32)),
                                ),
                        ),
                ),
        )
}

fn make_command(command: Command) -> Command {
    command
        .arg(
            Arg::new("template")
                .required(true)
                .index(1)
                .help("Path to a template file in YAML or JSON format, or a template string"),
        )
        .arg(
            Arg::new("string")
                .required(false)
                .long("string")
                .action(ArgAction::SetTrue)
                .help("Pass a template string instead of a file path"),
        )
        .arg(
            Arg::new("format")
                .required(false)
                .long("format")
                .value_parser(["yaml", "json"])
                .help("Force parsing from a particular format"),
        )
        .arg(
            Arg::new("path")
                .required(false)
                .long("path")
                .help("The directory into which the new workflow is generated"),
        )
        .arg(
            Arg::new("name")
                .required(false)
                .long("name")
                .help("The workflow name; defaults to the template name plus a timestamp"),
        )
        .arg(
            Arg::new("overwrite")
                .required(false)
                .long("overwrite")
                .action(ArgAction::SetTrue)
                .help("Replace an existing workflow directory of the same name"),
        )
}

fn js_parallelism_arg() -> Arg {
    Arg::new("js_parallelism")
        .required(false)
        .long("js-parallelism")
        .value_parser(clap::value_parser!(bool))
        .help("Allow multiple jobscripts to execute simultaneously")
}

fn wait_arg() -> Arg {
    Arg::new("wait")
        .required(false)
        .long("wait")
        .action(ArgAction::SetTrue)
        .help("Supervise direct jobscripts until they finish")
}

fn index_arg() -> Arg {
    Arg::new("index")
        .required(true)
        .index(1)
        .value_parser(clap::value_parser!(usize))
        .help("The parameter data index")
}

fn run_location_arg(name: &'static str, index: usize) -> Arg {
    Arg::new(name)
        .required(true)
        .index(index)
        .value_parser(clap::value_parser!(usize))
}
