//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::element::{Ear, EarStatus, Element};
use crate::model::resources::ElementResources;

/// Sentinel for unpopulated cells (conditional actions, absent runs).
pub const NONE_VAL: i64 = -1;

/// Per-task grids indexed `[action_idx][element_idx]`: cell values index the
/// deduplicated `resources` list, or `NONE_VAL`.
#[derive(Clone, Debug)]
pub struct EarResourceMap {
    pub resources: Vec<ElementResources>,
    pub resource_hashes: Vec<String>,
    pub resource_map: Vec<Vec<i64>>,
    pub ear_id_map: Vec<Vec<i64>>,
}

/// Build the resource and EAR-id grids for one task at the given loop
/// indices. Only `pending` runs contribute.
pub fn generate_ear_resource_map(
    num_actions: usize,
    elements: &[Element],
    loop_idx: &BTreeMap<String, usize>,
    ears: &BTreeMap<u64, Ear>,
) -> Result<EarResourceMap> {
    let num_elements = elements.len();
    let mut resources: Vec<ElementResources> = Vec::new();
    let mut resource_hashes: Vec<String> = Vec::new();
    let mut resource_map = vec![vec![NONE_VAL; num_elements]; num_actions];
    let mut ear_id_map = vec![vec![NONE_VAL; num_elements]; num_actions];

    for element in elements {
        for iteration in &element.iterations {
            if &iteration.loop_idx != loop_idx {
                continue;
            }
            for (act_idx, run_ids) in &iteration.actions {
                for run_id in run_ids {
                    let run = match ears.get(run_id) {
                        Some(run) => run,
                        None => continue,
                    };
                    if run.status != EarStatus::Pending {
                        continue;
                    }
                    let hash = run.resources.jobscript_hash();
                    let res_idx = match resource_hashes.iter().position(|h| *h == hash) {
                        Some(idx) => idx,
                        None => {
                            resource_hashes.push(hash);
                            resources.push(run.resources.clone());
                            resources.len() - 1
                        }
                    };
                    resource_map[*act_idx][element.element_idx] = res_idx as i64;
                    ear_id_map[*act_idx][element.element_idx] = run.id as i64;
                }
            }
        }
    }

    for res in &mut resources {
        res.set_defaults();
        res.validate_against_machine()?;
    }

    Ok(EarResourceMap {
        resources,
        resource_hashes,
        resource_map,
        ear_id_map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::element::ElementIteration;

    fn ear(id: u64, element_idx: usize, action_idx: usize, num_cores: u32) -> Ear {
        Ear {
            id,
            task_insert_id: 0,
            element_idx,
            iteration_idx: 0,
            action_idx,
            run_idx: 0,
            resources: ElementResources {
                num_cores: Some(num_cores),
                ..Default::default()
            },
            status: EarStatus::Pending,
            exit_code: None,
            start_time: None,
            end_time: None,
            skip: false,
            data_in: BTreeMap::new(),
            data_out: BTreeMap::new(),
            dependencies: vec![],
        }
    }

    fn element(element_idx: usize, actions: &[(usize, u64)]) -> Element {
        let mut act_map: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
        for (act_idx, ear_id) in actions {
            act_map.entry(*act_idx).or_default().push(*ear_id);
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
    fn test_dedup_by_resource_hash() {
        let mut ears = BTreeMap::new();
        ears.insert(0, ear(0, 0, 0, 1));
        ears.insert(1, ear(1, 1, 0, 1));
        ears.insert(2, ear(2, 0, 1, 8));
        ears.insert(3, ear(3, 1, 1, 8));

        let elements = vec![
            element(0, &[(0, 0), (1, 2)]),
            element(1, &[(0, 1), (1, 3)]),
        ];
        let map =
            generate_ear_resource_map(2, &elements, &BTreeMap::new(), &ears).unwrap();

        assert_eq!(map.resources.len(), 2);
        assert_eq!(map.resource_map, vec![vec![0, 0], vec![1, 1]]);
        assert_eq!(map.ear_id_map, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_non_pending_runs_excluded() {
        let mut e = ear(0, 0, 0, 1);
        e.status = EarStatus::Success;
        let mut ears = BTreeMap::new();
        ears.insert(0, e);

        let elements = vec![element(0, &[(0, 0)])];
        let map =
            generate_ear_resource_map(1, &elements, &BTreeMap::new(), &ears).unwrap();
        assert_eq!(map.resource_map, vec![vec![NONE_VAL]]);
    }
}
