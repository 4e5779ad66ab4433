//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The jobscript planner: three successive transforms take the per-task EAR
//! universe to a minimal set of submittable jobscripts.

pub mod deps;
pub mod group;
pub mod resource_map;

use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::debug;

use crate::error::Result;
use crate::model::element::{Ear, Element};
use crate::plan::deps::{
    is_jobscript_array, merge_jobscripts_across_tasks, resolve_jobscript_blocks,
    resolve_jobscript_dependencies, PlannedJobscript, ResolvedJobscript,
};
use crate::plan::group::group_resource_map_into_jobscripts;
use crate::plan::resource_map::{generate_ear_resource_map, NONE_VAL};

/// Everything the planner needs to know about one task.
#[derive(Clone, Debug)]
pub struct TaskPlanInput {
    pub insert_id: u64,
    pub num_actions: usize,
    pub elements: Vec<Element>,
}

/// Plan all pending EARs of the given tasks into jobscripts.
pub fn plan_jobscripts(
    tasks: &[TaskPlanInput],
    ears: &BTreeMap<u64, Ear>,
) -> Result<Vec<ResolvedJobscript>> {
    let mut jobscripts: BTreeMap<usize, PlannedJobscript> = BTreeMap::new();
    let loop_idx = BTreeMap::new(); // iteration 0 only for now

    for task in tasks {
        let map = generate_ear_resource_map(task.num_actions, &task.elements, &loop_idx, ears)?;
        let (grouped, _js_map) = group_resource_map_into_jobscripts(&map.resource_map);

        for group in grouped {
            let res_idx = group.resources as usize;
            let resources = map.resources[res_idx].clone();
            let resource_hash = map.resource_hashes[res_idx].clone();

            let actions: Vec<usize> = group
                .elements
                .values()
                .flatten()
                .copied()
                .sorted()
                .dedup()
                .collect();
            let task_element_idx: Vec<usize> = group.elements.keys().copied().collect();

            let ear_ids: Vec<Vec<i64>> = actions
                .iter()
                .map(|&act| {
                    task_element_idx
                        .iter()
                        .map(|&elem| {
                            if group.elements[&elem].contains(&act) {
                                map.ear_id_map[act][elem]
                            } else {
                                NONE_VAL
                            }
                        })
                        .collect()
                })
                .collect();

            let is_array = is_jobscript_array(&resources, task_element_idx.len())?;

            let planned = PlannedJobscript {
                task_insert_ids: vec![task.insert_id],
                task_actions: actions
                    .iter()
                    .map(|&act| (task.insert_id, act, 0))
                    .collect(),
                task_elements: task_element_idx
                    .iter()
                    .enumerate()
                    .map(|(js_elem, &task_elem)| (js_elem, vec![task_elem]))
                    .collect(),
                task_loop_idx: vec![loop_idx.clone()],
                ear_ids,
                resources,
                resource_hash,
                is_array,
                dependencies: BTreeMap::new(),
            };
            jobscripts.insert(jobscripts.len(), planned);
        }
    }

    let element_deps = collect_element_deps(&jobscripts, ears);
    resolve_jobscript_dependencies(&mut jobscripts, &element_deps);
    let jobscripts = merge_jobscripts_across_tasks(jobscripts);
    let resolved = resolve_jobscript_blocks(jobscripts);

    debug!(num_jobscripts = resolved.len(), "planned jobscripts");
    Ok(resolved)
}

/// Per-jobscript, per-element EAR dependency edges, read off the runs
/// themselves.
fn collect_element_deps(
    jobscripts: &BTreeMap<usize, PlannedJobscript>,
    ears: &BTreeMap<u64, Ear>,
) -> BTreeMap<usize, BTreeMap<usize, Vec<u64>>> {
    let mut out: BTreeMap<usize, BTreeMap<usize, Vec<u64>>> = BTreeMap::new();
    for (&js_idx, js) in jobscripts {
        let mut elem_deps: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
        for row in &js.ear_ids {
            for (js_elem_idx, &cell) in row.iter().enumerate() {
                if cell == NONE_VAL {
                    continue;
                }
                if let Some(ear) = ears.get(&(cell as u64)) {
                    for &dep in &ear.dependencies {
                        let deps = elem_deps.entry(js_elem_idx).or_default();
                        if !deps.contains(&dep) {
                            deps.push(dep);
                        }
                    }
                }
            }
        }
        if !elem_deps.is_empty() {
            out.insert(js_idx, elem_deps);
        }
    }
    out
}

// re-exports used across the submission layer
pub use deps::ResolvedBlock;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::element::{EarStatus, ElementIteration};
    use crate::model::resources::ElementResources;

    fn mk_ear(
        id: u64,
        task_insert_id: u64,
        element_idx: usize,
        action_idx: usize,
        scheduler: &str,
        deps: &[u64],
    ) -> Ear {
        Ear {
            id,
            task_insert_id,
            element_idx,
            iteration_idx: 0,
            action_idx,
            run_idx: 0,
            resources: ElementResources {
                scheduler: Some(scheduler.to_string()),
                ..Default::default()
            },
            status: EarStatus::Pending,
            exit_code: None,
            start_time: None,
            end_time: None,
            skip: false,
            data_in: BTreeMap::new(),
            data_out: BTreeMap::new(),
            dependencies: deps.to_vec(),
        }
    }

    fn mk_element(element_idx: usize, actions: &[(usize, u64)]) -> Element {
        let mut act_map: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
        for (act, id) in actions {
            act_map.entry(*act).or_default().push(*id);
        }
        Element {
            element_idx,
            data_index: BTreeMap::new(),
            iterations: vec![ElementIteration {
                iteration_idx: 0,
                loop_idx: BTreeMap::new(),
                actions: act_map,
            }],
        }
    }

    #[test]
    fn test_single_element_single_action_one_block() {
        let mut ears = BTreeMap::new();
        ears.insert(0, mk_ear(0, 0, 0, 0, "direct", &[]));
        let tasks = vec![TaskPlanInput {
            insert_id: 0,
            num_actions: 1,
            elements: vec![mk_element(0, &[(0, 0)])],
        }];

        let resolved = plan_jobscripts(&tasks, &ears).unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(!resolved[0].is_array);
        assert_eq!(resolved[0].blocks.len(), 1);
        assert_eq!(resolved[0].blocks[0].ear_ids, vec![vec![0]]);
        assert!(resolved[0].blocks[0].dependencies.is_empty());
    }

    #[test]
    fn test_linear_two_task_one_jobscript_two_blocks() {
        // t1 -> t2, one element each, same (direct) resources: one jobscript
        // with two blocks and no external dependencies
        let mut ears = BTreeMap::new();
        ears.insert(0, mk_ear(0, 0, 0, 0, "direct", &[]));
        ears.insert(1, mk_ear(1, 1, 0, 0, "direct", &[0]));
        let tasks = vec![
            TaskPlanInput {
                insert_id: 0,
                num_actions: 1,
                elements: vec![mk_element(0, &[(0, 0)])],
            },
            TaskPlanInput {
                insert_id: 1,
                num_actions: 1,
                elements: vec![mk_element(0, &[(0, 1)])],
            },
        ];

        let resolved = plan_jobscripts(&tasks, &ears).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].blocks.len(), 2);
        assert_eq!(resolved[0].blocks[0].task_insert_ids, vec![0]);
        assert_eq!(resolved[0].blocks[1].task_insert_ids, vec![1]);
        // the only dependency is internal to the jobscript
        assert_eq!(
            resolved[0].blocks[1]
                .dependencies
                .keys()
                .copied()
                .collect::<Vec<_>>(),
            vec![(0, 0)]
        );
    }

    #[test]
    fn test_sequenced_elements_array_on_slurm() {
        let mut ears = BTreeMap::new();
        for elem in 0..3 {
            ears.insert(
                elem as u64,
                mk_ear(elem as u64, 0, elem, 0, "slurm", &[]),
            );
        }
        let tasks = vec![TaskPlanInput {
            insert_id: 0,
            num_actions: 1,
            elements: (0..3)
                .map(|e| mk_element(e, &[(0, e as u64)]))
                .collect(),
        }];

        let resolved = plan_jobscripts(&tasks, &ears).unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].is_array);
        assert_eq!(resolved[0].blocks.len(), 1);
        assert_eq!(resolved[0].blocks[0].ear_ids, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_array_dependency_merge_across_tasks() {
        // t1 (2 elements) -> t2 (2 elements), one-to-one, same resources,
        // slurm arrays: merged into one multi-task jobscript with the
        // loop-idx column offset on the appended task's actions
        let mut ears = BTreeMap::new();
        ears.insert(0, mk_ear(0, 0, 0, 0, "slurm", &[]));
        ears.insert(1, mk_ear(1, 0, 1, 0, "slurm", &[]));
        ears.insert(2, mk_ear(2, 1, 0, 0, "slurm", &[0]));
        ears.insert(3, mk_ear(3, 1, 1, 0, "slurm", &[1]));
        let tasks = vec![
            TaskPlanInput {
                insert_id: 0,
                num_actions: 1,
                elements: vec![mk_element(0, &[(0, 0)]), mk_element(1, &[(0, 1)])],
            },
            TaskPlanInput {
                insert_id: 1,
                num_actions: 1,
                elements: vec![mk_element(0, &[(0, 2)]), mk_element(1, &[(0, 3)])],
            },
        ];

        let resolved = plan_jobscripts(&tasks, &ears).unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].is_array);
        assert_eq!(resolved[0].blocks.len(), 1);
        let block = &resolved[0].blocks[0];
        assert_eq!(block.task_insert_ids, vec![0, 1]);
        assert_eq!(block.task_actions, vec![(0, 0, 0), (1, 0, 1)]);
        assert_eq!(block.ear_ids, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_different_resources_split_jobscripts() {
        let mut ears = BTreeMap::new();
        ears.insert(0, mk_ear(0, 0, 0, 0, "slurm", &[]));
        let mut heavy = mk_ear(1, 0, 0, 1, "slurm", &[0]);
        heavy.resources.num_cores = Some(16);
        ears.insert(1, heavy);
        let tasks = vec![TaskPlanInput {
            insert_id: 0,
            num_actions: 2,
            elements: vec![mk_element(0, &[(0, 0), (1, 1)])],
        }];

        let resolved = plan_jobscripts(&tasks, &ears).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[1].resources.num_cores, Some(16));
    }
}
