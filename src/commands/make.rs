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
use crate::error::Result;
use crate::model::template::WorkflowTemplate;
use crate::workflow::Workflow;

fn load_template(matches: &ArgMatches) -> Result<WorkflowTemplate> {
    let template = matches
        .get_one::<String>("template")
        .expect("required by clap");
    let format = matches.get_one::<String>("format").map(String::as_str);
    if matches.get_flag("string") {
        WorkflowTemplate::from_str(template, format.unwrap_or("yaml"))
    } else {
        WorkflowTemplate::from_file(Path::new(template), format)
    }
}

fn make_workflow(matches: &ArgMatches, config: &Configuration) -> Result<Workflow> {
    let template = load_template(matches)?;
    Workflow::from_template(
        config.clone(),
        template,
        matches.get_one::<String>("path").map(Path::new),
        matches.get_one::<String>("name").map(String::as_str),
        matches.get_flag("overwrite"),
    )
}

pub async fn make(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let workflow = make_workflow(matches, config)?;
    println!("{}", workflow.path().display());
    Ok(())
}

pub async fn go(matches: &ArgMatches, config: &Configuration) -> Result<()> {
    let mut workflow = make_workflow(matches, config)?;
    let js_parallelism = matches.get_one::<bool>("js_parallelism").copied();
    let wait = matches.get_flag("wait");
    workflow.submit(js_parallelism, wait).await?;
    println!("{}", workflow.path().display());
    Ok(())
}
