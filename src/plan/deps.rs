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

use crate::error::{Error, Result};
use crate::model::resources::{scheduler_supports_run_parallelism, ElementResources};

/// Dependency of one planned jobscript on an earlier one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobscriptDependency {
    /// {dependent js-element -> js-elements of the upstream jobscript}.
    pub js_element_mapping: BTreeMap<usize, Vec<usize>>,
    pub is_array: bool,
}

/// Jobscript descriptor during planning, before block packing.
#[derive(Clone, Debug)]
pub struct PlannedJobscript {
    pub task_insert_ids: Vec<u64>,
    /// (task insert ID, action_idx, index into `task_loop_idx`) per row of
    /// `ear_ids`.
    pub task_actions: Vec<(u64, usize, usize)>,
    /// {js-element idx -> task-element idx per task}.
    pub task_elements: BTreeMap<usize, Vec<usize>>,
    pub task_loop_idx: Vec<BTreeMap<String, usize>>,
    /// `(actions x elements)` EAR ids; `-1` marks "skip this action".
    pub ear_ids: Vec<Vec<i64>>,
    pub resources: ElementResources,
    pub resource_hash: String,
    pub is_array: bool,
    pub dependencies: BTreeMap<usize, JobscriptDependency>,
}

impl PlannedJobscript {
    pub fn num_elements(&self) -> usize {
        self.ear_ids.first().map(|r| r.len()).unwrap_or(0)
    }

    fn contains_ear(&self, ear_id: u64) -> bool {
        self.ear_ids
            .iter()
            .flatten()
            .any(|v| *v == ear_id as i64)
    }

    /// Column holding the given EAR id, i.e. its js-element index.
    fn ear_column(&self, ear_id: u64) -> Option<usize> {
        for row in &self.ear_ids {
            if let Some(col) = row.iter().position(|v| *v == ear_id as i64) {
                return Some(col);
            }
        }
        None
    }
}

/// A jobscript after block packing: one resource record, one or more blocks.
#[derive(Clone, Debug)]
pub struct ResolvedJobscript {
    pub resources: ElementResources,
    pub is_array: bool,
    pub blocks: Vec<ResolvedBlock>,
}

/// One block of a resolved jobscript; dependencies are re-keyed to
/// `(jobscript_idx, block_idx)` pairs, which always point strictly upstream.
#[derive(Clone, Debug)]
pub struct ResolvedBlock {
    pub task_insert_ids: Vec<u64>,
    pub task_actions: Vec<(u64, usize, usize)>,
    pub task_elements: BTreeMap<usize, Vec<usize>>,
    pub task_loop_idx: Vec<BTreeMap<String, usize>>,
    pub ear_ids: Vec<Vec<i64>>,
    pub dependencies: BTreeMap<(usize, usize), JobscriptDependency>,
}

/// Decide whether a jobscript should be submitted as a scheduler array job.
///
/// Requesting an array on a direct scheduler is an error; a single-element
/// jobscript never becomes an array regardless of the request.
pub fn is_jobscript_array(resources: &ElementResources, num_elements: usize) -> Result<bool> {
    let scheduler = resources.scheduler_name();
    if resources.is_direct() {
        if resources.use_job_array == Some(true) {
            return Err(Error::JobArrayUnsupported(scheduler.to_string()));
        }
        return Ok(false);
    }

    let run_parallelism = scheduler_supports_run_parallelism(scheduler);
    if num_elements == 1 {
        return Ok(false);
    }
    match resources.use_job_array {
        None => Ok(run_parallelism),
        Some(true) => {
            if !run_parallelism {
                return Err(Error::JobArrayUnsupported(scheduler.to_string()));
            }
            Ok(true)
        }
        Some(false) => Ok(false),
    }
}

/// From per-EAR dependency edges, derive the element mapping between each
/// jobscript and the earlier jobscripts it depends on, then classify each
/// edge as an array dependency when the mapping is a one-to-one covering of
/// the upstream element range.
pub fn resolve_jobscript_dependencies(
    jobscripts: &mut BTreeMap<usize, PlannedJobscript>,
    element_deps: &BTreeMap<usize, BTreeMap<usize, Vec<u64>>>,
) {
    let indices: Vec<usize> = jobscripts.keys().copied().collect();

    for (&js_idx, elem_deps) in element_deps {
        let mut deps: BTreeMap<usize, JobscriptDependency> = BTreeMap::new();

        for (&js_elem_idx, ear_deps) in elem_deps {
            for &ear_dep in ear_deps {
                for &js_k_idx in &indices {
                    if js_k_idx == js_idx {
                        break;
                    }
                    let js_k = &jobscripts[&js_k_idx];
                    if !js_k.contains_ear(ear_dep) {
                        continue;
                    }
                    let js_elem_idx_k = js_k
                        .ear_column(ear_dep)
                        .expect("EAR column exists when contained");
                    let mapping = deps
                        .entry(js_k_idx)
                        .or_insert_with(|| JobscriptDependency {
                            js_element_mapping: BTreeMap::new(),
                            is_array: false,
                        });
                    let targets = mapping
                        .js_element_mapping
                        .entry(js_elem_idx)
                        .or_default();
                    if !targets.contains(&js_elem_idx_k) {
                        targets.push(js_elem_idx_k);
                    }
                }
            }
        }

        for (js_k_idx, dep) in &mut deps {
            let num_i = jobscripts[&js_idx].num_elements();
            let num_k = jobscripts[js_k_idx].num_elements();

            let sources: Vec<usize> = dep.js_element_mapping.keys().copied().collect();
            let is_all_i_elems = sources == (0..num_i).collect::<Vec<_>>();

            let is_all_k_single = dep
                .js_element_mapping
                .values()
                .all(|targets| targets.len() == 1);

            let mut targets: Vec<usize> = dep
                .js_element_mapping
                .values()
                .filter_map(|t| t.first().copied())
                .collect();
            targets.sort_unstable();
            let is_all_k_elems = targets == (0..num_k).collect::<Vec<_>>();

            dep.is_array = is_all_i_elems && is_all_k_single && is_all_k_elems;
        }

        if let Some(js) = jobscripts.get_mut(&js_idx) {
            js.dependencies = deps;
        }
    }
}

/// Merge each jobscript into its closest dependency where possible.
///
/// A merge requires equal resource hashes, an array dependency between the
/// two, and that every other dependency of the merged jobscript is already a
/// dependency of the target with identical edge metadata. Downstream
/// references to the merged jobscript are rewritten to the target.
pub fn merge_jobscripts_across_tasks(
    mut jobscripts: BTreeMap<usize, PlannedJobscript>,
) -> BTreeMap<usize, PlannedJobscript> {
    let indices: Vec<usize> = jobscripts.keys().copied().collect();
    let mut merged: Vec<usize> = Vec::new();

    for &js_idx in &indices {
        if merged.contains(&js_idx) {
            continue;
        }
        let js = &jobscripts[&js_idx];
        if js.dependencies.is_empty() {
            continue;
        }

        let closest_idx = *js.dependencies.keys().max().expect("non-empty deps");
        let other_deps: Vec<(usize, JobscriptDependency)> = js
            .dependencies
            .iter()
            .filter(|(k, _)| **k != closest_idx)
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        let closest = &jobscripts[&closest_idx];
        let mergeable = other_deps.iter().all(|(dep_idx, dep)| {
            closest
                .dependencies
                .get(dep_idx)
                .map(|d| d == dep)
                .unwrap_or(false)
        });
        if !mergeable {
            continue;
        }

        let dep_info = js.dependencies[&closest_idx].clone();
        if js.resource_hash != closest.resource_hash || !dep_info.is_array {
            continue;
        }
        // non-array jobscripts are handled by block packing instead
        if !js.is_array || !closest.is_array {
            continue;
        }

        let js = jobscripts[&js_idx].clone();
        {
            let target = jobscripts.get_mut(&closest_idx).expect("target exists");
            let num_loop_idx = target.task_loop_idx.len();

            target.task_insert_ids.push(js.task_insert_ids[0]);
            target.task_loop_idx.push(js.task_loop_idx[0].clone());

            for &(iid, act_idx, loop_col) in &js.task_actions {
                target.task_actions.push((iid, act_idx, loop_col + num_loop_idx));
            }
            for (k, v) in &js.task_elements {
                target
                    .task_elements
                    .entry(*k)
                    .or_default()
                    .extend(v.iter().copied());
            }
            target.ear_ids.extend(js.ear_ids.iter().cloned());
        }
        merged.push(js_idx);

        // rewrite downstream references to the merged jobscript
        for &ds_idx in &indices {
            if ds_idx <= js_idx {
                continue;
            }
            if let Some(ds) = jobscripts.get_mut(&ds_idx) {
                if let Some(dep) = ds.dependencies.remove(&js_idx) {
                    ds.dependencies.insert(closest_idx, dep);
                }
            }
        }
    }

    for idx in merged {
        jobscripts.remove(&idx);
    }
    jobscripts
}

/// Pack contiguous, same-resource, non-array jobscripts that depend only on
/// the jobscript currently being packed into multi-block jobscripts, and
/// re-key every block dependency to `(jobscript_idx, block_idx)`.
pub fn resolve_jobscript_blocks(
    jobscripts: BTreeMap<usize, PlannedJobscript>,
) -> Vec<ResolvedJobscript> {
    // grouping pass: position in `groups` is the new jobscript index
    let mut groups: Vec<Vec<PlannedJobscript>> = Vec::new();
    let mut new_idx: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    let mut blocks: Vec<PlannedJobscript> = Vec::new();
    let mut prev_hash: Option<String> = None;
    let mut first = true;

    for (js_idx, js) in jobscripts {
        let new_deps: std::collections::BTreeSet<usize> = js
            .dependencies
            .keys()
            .map(|k| new_idx[k].0)
            .collect();

        if js.is_array {
            // array jobs never share a script
            if !blocks.is_empty() {
                groups.push(std::mem::take(&mut blocks));
                prev_hash = None;
            }
            new_idx.insert(js_idx, (groups.len(), 0));
            groups.push(vec![js]);
            first = false;
            continue;
        }

        if first || prev_hash.is_none() {
            prev_hash = Some(js.resource_hash.clone());
            new_idx.insert(js_idx, (groups.len(), blocks.len()));
            blocks.push(js);
        } else if prev_hash.as_deref() == Some(js.resource_hash.as_str())
            && new_deps.len() == 1
            && new_deps.contains(&groups.len())
        {
            // all dependencies land in the jobscript being packed
            new_idx.insert(js_idx, (groups.len(), blocks.len()));
            blocks.push(js);
        } else {
            groups.push(std::mem::take(&mut blocks));
            prev_hash = Some(js.resource_hash.clone());
            new_idx.insert(js_idx, (groups.len(), 0));
            blocks.push(js);
        }
        first = false;
    }
    if !blocks.is_empty() {
        groups.push(blocks);
    }

    // re-index dependencies and strip per-block resource data
    groups
        .into_iter()
        .map(|group| {
            let resources = group[0].resources.clone();
            let is_array = group[0].is_array;
            let blocks = group
                .into_iter()
                .map(|js| {
                    let dependencies = js
                        .dependencies
                        .into_iter()
                        .map(|(k, v)| (new_idx[&k], v))
                        .collect();
                    ResolvedBlock {
                        task_insert_ids: js.task_insert_ids,
                        task_actions: js.task_actions,
                        task_elements: js.task_elements,
                        task_loop_idx: js.task_loop_idx,
                        ear_ids: js.ear_ids,
                        dependencies,
                    }
                })
                .collect();
            ResolvedJobscript {
                resources,
                is_array,
                blocks,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep_data() -> JobscriptDependency {
        JobscriptDependency {
            js_element_mapping: [(0, vec![0])].into_iter().collect(),
            is_array: false,
        }
    }

    fn js(
        is_array: bool,
        resource_hash: &str,
        deps: &[usize],
    ) -> PlannedJobscript {
        PlannedJobscript {
            task_insert_ids: vec![0],
            task_actions: vec![(0, 0, 0)],
            task_elements: [(0, vec![0])].into_iter().collect(),
            task_loop_idx: vec![BTreeMap::new()],
            ear_ids: vec![vec![0]],
            resources: ElementResources::default(),
            resource_hash: resource_hash.to_string(),
            is_array,
            dependencies: deps.iter().map(|d| (*d, dep_data())).collect(),
        }
    }

    fn block_dep_keys(resolved: &[ResolvedJobscript]) -> Vec<Vec<Vec<(usize, usize)>>> {
        resolved
            .iter()
            .map(|js| {
                js.blocks
                    .iter()
                    .map(|b| b.dependencies.keys().copied().collect())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_blocks_split_on_both_array() {
        let jobscripts: BTreeMap<usize, PlannedJobscript> =
            [(0, js(true, "0", &[])), (1, js(true, "0", &[0]))]
                .into_iter()
                .collect();
        let resolved = resolve_jobscript_blocks(jobscripts);
        assert_eq!(resolved.len(), 2);
        assert!(resolved[0].is_array && resolved[1].is_array);
        assert_eq!(
            block_dep_keys(&resolved),
            vec![vec![vec![]], vec![vec![(0, 0)]]]
        );
    }

    #[test]
    fn test_blocks_split_on_resource_hash() {
        let jobscripts: BTreeMap<usize, PlannedJobscript> =
            [(0, js(false, "0", &[])), (1, js(false, "1", &[0]))]
                .into_iter()
                .collect();
        let resolved = resolve_jobscript_blocks(jobscripts);
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            block_dep_keys(&resolved),
            vec![vec![vec![]], vec![vec![(0, 0)]]]
        );
    }

    #[test]
    fn test_blocks_split_on_downstream_array() {
        let jobscripts: BTreeMap<usize, PlannedJobscript> =
            [(0, js(false, "0", &[])), (1, js(true, "0", &[0]))]
                .into_iter()
                .collect();
        let resolved = resolve_jobscript_blocks(jobscripts);
        assert_eq!(resolved.len(), 2);
        assert!(!resolved[0].is_array);
        assert!(resolved[1].is_array);
    }

    #[test]
    fn test_blocks_split_on_upstream_array() {
        let jobscripts: BTreeMap<usize, PlannedJobscript> =
            [(0, js(true, "0", &[])), (1, js(false, "0", &[0]))]
                .into_iter()
                .collect();
        let resolved = resolve_jobscript_blocks(jobscripts);
        assert_eq!(resolved.len(), 2);
        assert!(resolved[0].is_array);
        assert!(!resolved[1].is_array);
    }

    #[test]
    fn test_blocks_packed_on_chain() {
        let jobscripts: BTreeMap<usize, PlannedJobscript> = [
            (0, js(false, "0", &[])),
            (1, js(false, "0", &[0])),
            (2, js(false, "0", &[1])),
        ]
        .into_iter()
        .collect();
        let resolved = resolve_jobscript_blocks(jobscripts);
        assert_eq!(resolved.len(), 1);
        assert_eq!(
            block_dep_keys(&resolved),
            vec![vec![vec![], vec![(0, 0)], vec![(0, 1)]]]
        );
    }

    #[test]
    fn test_blocks_packed_with_nonconsecutive_index() {
        // a gap in upstream indices is inconsequential
        let jobscripts: BTreeMap<usize, PlannedJobscript> = [
            (0, js(false, "0", &[])),
            (1, js(false, "0", &[0])),
            (3, js(false, "0", &[1])),
        ]
        .into_iter()
        .collect();
        let resolved = resolve_jobscript_blocks(jobscripts);
        assert_eq!(resolved.len(), 1);
        assert_eq!(
            block_dep_keys(&resolved),
            vec![vec![vec![], vec![(0, 0)], vec![(0, 1)]]]
        );
    }

    #[test]
    fn test_independent_jobscript_not_packed() {
        let jobscripts: BTreeMap<usize, PlannedJobscript> = [
            (0, js(false, "0", &[])),
            (1, js(false, "0", &[0])),
            (2, js(false, "0", &[])),
        ]
        .into_iter()
        .collect();
        let resolved = resolve_jobscript_blocks(jobscripts);
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            block_dep_keys(&resolved),
            vec![vec![vec![], vec![(0, 0)]], vec![vec![]]]
        );
    }

    #[test]
    fn test_multi_upstream_dependence_not_packed() {
        let jobscripts: BTreeMap<usize, PlannedJobscript> = [
            (0, js(false, "0", &[])),
            (1, js(false, "0", &[])),
            (2, js(false, "0", &[0, 1])),
        ]
        .into_iter()
        .collect();
        let resolved = resolve_jobscript_blocks(jobscripts);
        assert_eq!(resolved.len(), 3);
        assert_eq!(
            block_dep_keys(&resolved),
            vec![vec![vec![]], vec![vec![]], vec![vec![(0, 0), (1, 0)]]]
        );
    }

    #[test]
    fn test_multi_dependence_within_packed_jobscript() {
        let jobscripts: BTreeMap<usize, PlannedJobscript> = [
            (0, js(false, "0", &[])),
            (1, js(false, "0", &[0])),
            (2, js(false, "0", &[0, 1])),
        ]
        .into_iter()
        .collect();
        let resolved = resolve_jobscript_blocks(jobscripts);
        assert_eq!(resolved.len(), 1);
        assert_eq!(
            block_dep_keys(&resolved),
            vec![vec![vec![], vec![(0, 0)], vec![(0, 0), (0, 1)]]]
        );
    }

    #[test]
    fn test_is_jobscript_array_direct_raises() {
        let mut res = ElementResources {
            use_job_array: Some(true),
            ..Default::default()
        };
        res.set_defaults();
        assert!(matches!(
            is_jobscript_array(&res, 2),
            Err(Error::JobArrayUnsupported(_))
        ));
    }

    #[test]
    fn test_is_jobscript_array_single_element_override() {
        let mut res = ElementResources {
            scheduler: Some(String::from("slurm")),
            use_job_array: Some(true),
            ..Default::default()
        };
        res.set_defaults();
        assert!(!is_jobscript_array(&res, 1).unwrap());
        assert!(is_jobscript_array(&res, 2).unwrap());
    }

    #[test]
    fn test_is_jobscript_array_defaults_to_parallelism() {
        let mut res = ElementResources {
            scheduler: Some(String::from("sge")),
            ..Default::default()
        };
        res.set_defaults();
        assert!(is_jobscript_array(&res, 3).unwrap());

        res.use_job_array = Some(false);
        assert!(!is_jobscript_array(&res, 3).unwrap());
    }

    #[test]
    fn test_array_dependency_classification() {
        // js 0: 2 elements (EARs 0, 1); js 1: 2 elements (EARs 2, 3), each
        // depending on the matching element of js 0 -> array dependency
        let mut jobscripts: BTreeMap<usize, PlannedJobscript> = BTreeMap::new();
        let mut js0 = js(false, "0", &[]);
        js0.ear_ids = vec![vec![0, 1]];
        js0.task_elements = [(0, vec![0]), (1, vec![1])].into_iter().collect();
        let mut js1 = js0.clone();
        js1.ear_ids = vec![vec![2, 3]];
        jobscripts.insert(0, js0);
        jobscripts.insert(1, js1);

        let element_deps: BTreeMap<usize, BTreeMap<usize, Vec<u64>>> = [(
            1,
            [(0, vec![0u64]), (1, vec![1u64])].into_iter().collect(),
        )]
        .into_iter()
        .collect();

        resolve_jobscript_dependencies(&mut jobscripts, &element_deps);
        let dep = &jobscripts[&1].dependencies[&0];
        assert!(dep.is_array);
        assert_eq!(dep.js_element_mapping[&0], vec![0]);
        assert_eq!(dep.js_element_mapping[&1], vec![1]);
    }

    #[test]
    fn test_fan_in_dependency_not_array() {
        // both elements of js 1 depend on element 0 of js 0: not a bijection
        let mut jobscripts: BTreeMap<usize, PlannedJobscript> = BTreeMap::new();
        let mut js0 = js(false, "0", &[]);
        js0.ear_ids = vec![vec![0, 1]];
        let mut js1 = js0.clone();
        js1.ear_ids = vec![vec![2, 3]];
        jobscripts.insert(0, js0);
        jobscripts.insert(1, js1);

        let element_deps: BTreeMap<usize, BTreeMap<usize, Vec<u64>>> = [(
            1,
            [(0, vec![0u64]), (1, vec![0u64])].into_iter().collect(),
        )]
        .into_iter()
        .collect();

        resolve_jobscript_dependencies(&mut jobscripts, &element_deps);
        assert!(!jobscripts[&1].dependencies[&0].is_array);
    }

    #[test]
    fn test_merge_one_to_one_same_resources() {
        let mut jobscripts: BTreeMap<usize, PlannedJobscript> = BTreeMap::new();
        let mut js0 = js(true, "h", &[]);
        js0.task_insert_ids = vec![0];
        js0.ear_ids = vec![vec![0, 1]];
        js0.task_elements = [(0, vec![0]), (1, vec![1])].into_iter().collect();

        let mut js1 = js0.clone();
        js1.task_insert_ids = vec![1];
        js1.ear_ids = vec![vec![2, 3]];
        js1.dependencies.insert(
            0,
            JobscriptDependency {
                js_element_mapping: [(0, vec![0]), (1, vec![1])].into_iter().collect(),
                is_array: true,
            },
        );
        jobscripts.insert(0, js0);
        jobscripts.insert(1, js1);

        let merged = merge_jobscripts_across_tasks(jobscripts);
        assert_eq!(merged.len(), 1);
        let target = &merged[&0];
        assert_eq!(target.task_insert_ids, vec![0, 1]);
        assert_eq!(target.ear_ids, vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(target.task_actions, vec![(0, 0, 0), (1, 0, 1)]);
        assert_eq!(target.task_elements[&0], vec![0, 0]);
        assert_eq!(target.task_loop_idx.len(), 2);
    }

    #[test]
    fn test_merge_rewrites_downstream_references() {
        let mut jobscripts: BTreeMap<usize, PlannedJobscript> = BTreeMap::new();
        let js0 = js(true, "h", &[]);
        let mut js1 = js(true, "h", &[]);
        js1.ear_ids = vec![vec![1]];
        js1.dependencies.insert(
            0,
            JobscriptDependency {
                js_element_mapping: [(0, vec![0])].into_iter().collect(),
                is_array: true,
            },
        );
        let mut js2 = js(false, "other", &[1]);
        js2.ear_ids = vec![vec![2]];
        jobscripts.insert(0, js0);
        jobscripts.insert(1, js1);
        jobscripts.insert(2, js2);

        let merged = merge_jobscripts_across_tasks(jobscripts);
        assert_eq!(merged.len(), 2);
        assert!(merged[&2].dependencies.contains_key(&0));
        assert!(!merged[&2].dependencies.contains_key(&1));
    }

    #[test]
    fn test_no_merge_on_different_resources() {
        let mut jobscripts: BTreeMap<usize, PlannedJobscript> = BTreeMap::new();
        let js0 = js(true, "a", &[]);
        let mut js1 = js(true, "b", &[]);
        js1.dependencies.insert(
            0,
            JobscriptDependency {
                js_element_mapping: [(0, vec![0])].into_iter().collect(),
                is_array: true,
            },
        );
        jobscripts.insert(0, js0);
        jobscripts.insert(1, js1);

        let merged = merge_jobscripts_across_tasks(jobscripts);
        assert_eq!(merged.len(), 2);
    }
}
