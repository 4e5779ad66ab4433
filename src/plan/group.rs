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

use itertools::Itertools;

use crate::plan::resource_map::NONE_VAL;

/// One grouped jobscript: a resource index plus, per task-element, the action
/// indices it will run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupedJobscript {
    pub resources: i64,
    pub elements: BTreeMap<usize, Vec<usize>>,
}

/// Greedy row-sweep over the `(actions x elements)` resource grid.
///
/// For each action row and each resource index present in it, the candidate
/// element set is extended downstream: cells in later action rows are
/// absorbed into the same jobscript while the cumulative absolute difference
/// along the action axis stays zero (sentinel cells are treated as matching).
/// The sweep stops once every non-sentinel cell is allocated; the result is
/// the minimal set of rectangular groups honouring both the resource
/// partition and the natural downstream flow of identical-resource actions.
pub fn group_resource_map_into_jobscripts(
    resource_map: &[Vec<i64>],
) -> (Vec<GroupedJobscript>, Vec<Vec<i64>>) {
    let num_actions = resource_map.len();
    let num_elements = resource_map.first().map(|r| r.len()).unwrap_or(0);

    let resource_idx: Vec<i64> = resource_map
        .iter()
        .flatten()
        .copied()
        .filter(|v| *v != NONE_VAL)
        .sorted()
        .dedup()
        .collect();

    let nones: Vec<Vec<bool>> = resource_map
        .iter()
        .map(|row| row.iter().map(|v| *v == NONE_VAL).collect())
        .collect();

    let mut work: Vec<Vec<i64>> = resource_map.to_vec();
    let mut allocated = vec![vec![false; num_elements]; num_actions];
    let mut js_map = vec![vec![NONE_VAL; num_elements]; num_actions];
    let mut jobscripts = Vec::new();

    'sweep: for act_idx in 0..num_actions {
        for &res_i in &resource_idx {
            if !work[act_idx].contains(&res_i) {
                continue;
            }

            // sentinel cells take the current resource so they do not break
            // the downstream difference accumulation
            for (row, none_row) in work.iter_mut().zip(&nones) {
                for (cell, is_none) in row.iter_mut().zip(none_row) {
                    if *is_none {
                        *cell = res_i;
                    }
                }
            }

            // cumulative |difference| along the action axis, from this row on
            let mut diff: Vec<Vec<i64>> = Vec::with_capacity(num_actions - act_idx - 1);
            let mut acc = vec![0i64; num_elements];
            for next_act in (act_idx + 1)..num_actions {
                for elem in 0..num_elements {
                    acc[elem] += (work[next_act][elem] - work[next_act - 1][elem]).abs();
                }
                diff.push(acc.clone());
            }

            let elem_idx: Vec<usize> = (0..num_elements)
                .filter(|&e| work[act_idx][e] == res_i && !allocated[act_idx][e])
                .collect();

            let mut elements: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            let mut cells: Vec<(usize, usize)> = Vec::new();

            for &e in &elem_idx {
                if !nones[act_idx][e] {
                    elements.entry(e).or_default().push(act_idx);
                    cells.push((act_idx, e));
                }
            }

            // absorb equal-valued downstream cells
            for (offset, diff_row) in diff.iter().enumerate() {
                let ds_act = act_idx + 1 + offset;
                for &e in &elem_idx {
                    if diff_row[e] == 0 && !nones[ds_act][e] {
                        elements.entry(e).or_default().push(ds_act);
                        cells.push((ds_act, e));
                    }
                }
            }

            if cells.is_empty() {
                continue;
            }

            for &(a, e) in &cells {
                allocated[a][e] = true;
                js_map[a][e] = jobscripts.len() as i64;
            }
            jobscripts.push(GroupedJobscript {
                resources: res_i,
                elements,
            });

            let all_allocated = (0..num_actions).all(|a| {
                (0..num_elements).all(|e| nones[a][e] || allocated[a][e])
            });
            if all_allocated {
                break 'sweep;
            }
        }
    }

    (jobscripts, js_map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elements(pairs: &[(usize, &[usize])]) -> BTreeMap<usize, Vec<usize>> {
        pairs
            .iter()
            .map(|(e, acts)| (*e, acts.to_vec()))
            .collect()
    }

    #[test]
    fn test_uniform_map_single_jobscript() {
        let map = vec![vec![0, 0, 0], vec![0, 0, 0]];
        let (js, js_map) = group_resource_map_into_jobscripts(&map);
        assert_eq!(
            js,
            vec![GroupedJobscript {
                resources: 0,
                elements: elements(&[(0, &[0, 1]), (1, &[0, 1]), (2, &[0, 1])]),
            }]
        );
        assert_eq!(js_map, vec![vec![0, 0, 0], vec![0, 0, 0]]);
    }

    #[test]
    fn test_resource_change_splits_rows() {
        let map = vec![vec![0, 0], vec![1, 1]];
        let (js, _) = group_resource_map_into_jobscripts(&map);
        assert_eq!(
            js,
            vec![
                GroupedJobscript {
                    resources: 0,
                    elements: elements(&[(0, &[0]), (1, &[0])]),
                },
                GroupedJobscript {
                    resources: 1,
                    elements: elements(&[(0, &[1]), (1, &[1])]),
                },
            ]
        );
    }

    #[test]
    fn test_partial_downstream_absorption() {
        // element 0 keeps resource 0 downstream and is absorbed; element 1
        // switches resource at action 1 and splits off
        let map = vec![vec![0, 0], vec![0, 1]];
        let (js, _) = group_resource_map_into_jobscripts(&map);
        assert_eq!(
            js,
            vec![
                GroupedJobscript {
                    resources: 0,
                    elements: elements(&[(0, &[0, 1]), (1, &[0])]),
                },
                GroupedJobscript {
                    resources: 1,
                    elements: elements(&[(1, &[1])]),
                },
            ]
        );
    }

    #[test]
    fn test_sentinel_cells_absorbed_without_allocation() {
        // element 1 has no run for action 0; its action-1 run still joins
        // the resource-0 jobscript via downstream absorption
        let map = vec![vec![0, NONE_VAL], vec![0, 0]];
        let (js, js_map) = group_resource_map_into_jobscripts(&map);
        assert_eq!(
            js,
            vec![GroupedJobscript {
                resources: 0,
                elements: elements(&[(0, &[0, 1]), (1, &[1])]),
            }]
        );
        assert_eq!(js_map[0][1], NONE_VAL);
    }

    #[test]
    fn test_interleaved_resources() {
        let map = vec![vec![0, 1], vec![0, 1]];
        let (js, _) = group_resource_map_into_jobscripts(&map);
        assert_eq!(js.len(), 2);
        assert_eq!(js[0].elements, elements(&[(0, &[0, 1])]));
        assert_eq!(js[1].elements, elements(&[(1, &[0, 1])]));
    }
}
