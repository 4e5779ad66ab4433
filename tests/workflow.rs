//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::path::{Path, PathBuf};

use gantry::config::Configuration;
use gantry::model::element::EarStatus;
use gantry::model::template::WorkflowTemplate;
use gantry::store::StoreMode;
use gantry::workflow::Workflow;

const TEMPLATE: &str = r#"
name: wk1
tasks:
  - schema:
      objective: t1
      inputs:
        - parameter: p1
          default_value: null
      outputs:
        - parameter: p2
      actions:
        - commands:
            - command: "echo <<parameter:p1>>"
              stdout: p2
              stderr: null
    inputs: {}
    sequences:
      - path: inputs.p1
        values: [10, 20, 30]
        nesting_order: 0
  - schema:
      objective: t2
      inputs:
        - parameter: p2
          default_value: null
      outputs: []
      actions:
        - commands:
            - command: "echo <<parameter:p2>>"
              stdout: null
              stderr: null
    inputs: {}
"#;

fn config(dir: &Path) -> Configuration {
    // the functions-file app alias resolves to a no-op so generated
    // jobscripts can run without the binary on PATH
    let path = dir.join("config.toml");
    std::fs::write(&path, "app_invocation = \"true\"\n").unwrap();
    Configuration::load(Some(&path)).unwrap()
}

fn make_workflow(dir: &Path) -> Workflow {
    let template = WorkflowTemplate::from_yaml_str(TEMPLATE).unwrap();
    Workflow::from_template(config(dir), template, Some(dir), Some("wk1"), false).unwrap()
}

#[test]
fn test_template_expansion_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let wk = make_workflow(dir.path());

    // three elements from the sequence, matched one-to-one by t2
    assert_eq!(wk.num_tasks().unwrap(), 2);
    let ears = wk.get_ears_from_ids(&[0, 1, 2, 3, 4, 5]).unwrap();
    assert!(ears.iter().all(|e| e.status == EarStatus::Pending));
    assert_eq!(ears[3].task_insert_id, 1);
    assert_eq!(ears[3].dependencies, vec![0]);
    assert_eq!(ears[5].dependencies, vec![2]);

    // a second open with another reader sees the committed image
    let path = wk.path().to_path_buf();
    let reader = Workflow::open(config(dir.path()), &path, StoreMode::ReadOnly).unwrap();
    assert_eq!(reader.num_tasks().unwrap(), 2);
    assert_eq!(
        reader.get_parameter_data(1).unwrap(),
        Some(serde_json::json!(20))
    );
}

#[tokio::test]
async fn test_direct_submission_materialises_jobscripts() {
    let dir = tempfile::tempdir().unwrap();
    let mut wk = make_workflow(dir.path());

    let sub_idx = wk.submit(None, true).await.unwrap().unwrap();
    assert_eq!(sub_idx, 0);

    let sub_path: PathBuf = wk.path().join("submissions").join("0");
    assert!(sub_path.join("abort_EARs.txt").is_file());
    for name in ["tmp", "log", "std", "scripts"] {
        assert!(sub_path.join(name).is_dir());
    }

    let subs = wk.get_submissions().unwrap();
    assert_eq!(subs.len(), 1);
    let submission = &subs[0];
    assert!(!submission.needs_submit());

    for js in &submission.jobscripts {
        assert!(sub_path.join(js.ear_id_file_name()).is_file());
        assert!(sub_path.join(js.jobscript_file_name(".sh")).is_file());
        assert!(sub_path.join(js.functions_file_name(".sh")).is_file());
        assert!(js.process_id.is_some());
        assert_eq!(js.scheduler_name.as_deref(), Some("direct"));
        assert!(js.submit_time.is_some());
        assert!(js.submit_machine.is_some());
    }

    // the EAR-ID file has one line per element with ':'-delimited ids
    let js0 = &submission.jobscripts[0];
    let ear_ids = std::fs::read_to_string(sub_path.join(js0.ear_id_file_name())).unwrap();
    let lines: Vec<&str> = ear_ids.lines().collect();
    let total_elements: usize = js0.blocks.iter().map(|b| b.num_elements()).sum();
    assert_eq!(lines.len(), total_elements);

    // every EAR of the submission left the pending state
    let all_ids: Vec<u64> = submission
        .jobscripts
        .iter()
        .flat_map(|js| js.all_ear_ids())
        .collect();
    let ears = wk.get_ears_from_ids(&all_ids).unwrap();
    assert!(ears.iter().all(|e| e.status != EarStatus::Pending));
}

#[test]
fn test_abort_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let sub_path = dir.path().join("submissions").join("0");
    std::fs::create_dir_all(&sub_path).unwrap();
    std::fs::write(sub_path.join("abort_EARs.txt"), "0\n0\n0\n").unwrap();

    gantry::submission::request_ear_abort(&sub_path, 1).unwrap();
    let text = std::fs::read_to_string(sub_path.join("abort_EARs.txt")).unwrap();
    assert_eq!(text, "0\n1\n0\n");
}
