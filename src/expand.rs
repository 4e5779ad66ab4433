//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Element expansion: resolve parameter sequences and their nesting orders
//! into one data-index row per element.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::error::{Error, Result};

/// One sequence to expand: `multiplicity` values at `nesting_order`.
#[derive(Clone, Debug)]
pub struct SequenceSpec {
    /// Input path, e.g. `inputs.p1`. The pseudo-path `repeats` replicates
    /// elements without binding data.
    pub path: String,
    pub multiplicity: usize,
    pub nesting_order: i64,
}

/// Resolve sequences into per-element rows mapping each sequence path to a
/// per-sequence value index.
///
/// Sequences sharing a nesting order vary in lock-step and must agree on
/// multiplicity. Lower nesting orders vary fastest. With no sequences there
/// is exactly one element.
pub fn resolve_element_data_indices(
    specs: &[SequenceSpec],
) -> Result<Vec<BTreeMap<String, usize>>> {
    let sorted: Vec<&SequenceSpec> = specs
        .iter()
        .sorted_by_key(|s| s.nesting_order)
        .collect();

    let mut rows: Vec<BTreeMap<String, usize>> = vec![BTreeMap::new()];

    for (nesting_order, group) in &sorted.into_iter().group_by(|s| s.nesting_order) {
        let group: Vec<&SequenceSpec> = group.collect();

        let multiplicities: Vec<usize> =
            group.iter().map(|s| s.multiplicity).unique().collect();
        if multiplicities.len() > 1 {
            return Err(Error::SequenceMultiplicityMismatch {
                nesting_order,
                multiplicities,
            });
        }

        let multiplicity = group[0].multiplicity;
        let mut new_rows = Vec::with_capacity(rows.len() * multiplicity);
        for val_idx in 0..multiplicity {
            for row in &rows {
                let mut row = row.clone();
                for spec in &group {
                    row.insert(spec.path.clone(), val_idx);
                }
                new_rows.push(row);
            }
        }
        rows = new_rows;
    }

    Ok(rows)
}

/// Combine expansion rows with persisted data indices into final element
/// data-index maps.
///
/// `input_data` maps each input path to its per-value store indices;
/// `output_data` maps each output name to one pre-allocated store index per
/// element. Pseudo-paths (e.g. `repeats`) carry no data and are dropped.
pub fn generate_new_elements(
    input_data: &BTreeMap<String, Vec<usize>>,
    output_data: &BTreeMap<String, Vec<usize>>,
    element_rows: &[BTreeMap<String, usize>],
) -> Vec<BTreeMap<String, usize>> {
    element_rows
        .iter()
        .enumerate()
        .map(|(elem_idx, row)| {
            let mut data_index = BTreeMap::new();
            for (path, indices) in input_data {
                let data_idx = match row.get(path) {
                    Some(val_idx) => indices[*val_idx],
                    // non-sequenced input: one shared value
                    None => indices[0],
                };
                data_index.insert(path.clone(), data_idx);
            }
            for (name, indices) in output_data {
                data_index.insert(format!("outputs.{}", name), indices[elem_idx]);
            }
            data_index
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(path: &str, multiplicity: usize, nesting_order: i64) -> SequenceSpec {
        SequenceSpec {
            path: path.to_string(),
            multiplicity,
            nesting_order,
        }
    }

    #[test]
    fn test_no_sequences_single_element() {
        let rows = resolve_element_data_indices(&[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_empty());
    }

    #[test]
    fn test_single_sequence() {
        let rows = resolve_element_data_indices(&[spec("inputs.p1", 3, 0)]).unwrap();
        assert_eq!(rows.len(), 3);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row["inputs.p1"], i);
        }
    }

    #[test]
    fn test_element_count_is_product_of_group_multiplicities() {
        let rows = resolve_element_data_indices(&[
            spec("inputs.p1", 2, 0),
            spec("inputs.p2", 3, 1),
            spec("inputs.p3", 3, 1),
        ])
        .unwrap();
        assert_eq!(rows.len(), 6);
    }

    #[test]
    fn test_lower_nesting_order_varies_fastest() {
        let rows = resolve_element_data_indices(&[
            spec("inputs.fast", 2, 0),
            spec("inputs.slow", 2, 1),
        ])
        .unwrap();
        let fast: Vec<usize> = rows.iter().map(|r| r["inputs.fast"]).collect();
        let slow: Vec<usize> = rows.iter().map(|r| r["inputs.slow"]).collect();
        assert_eq!(fast, vec![0, 1, 0, 1]);
        assert_eq!(slow, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_equal_order_sequences_covary() {
        let rows = resolve_element_data_indices(&[
            spec("inputs.a", 3, 0),
            spec("inputs.b", 3, 0),
        ])
        .unwrap();
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row["inputs.a"], row["inputs.b"]);
        }
    }

    #[test]
    fn test_mismatched_multiplicity_in_group_rejected() {
        let err = resolve_element_data_indices(&[
            spec("inputs.a", 2, 1),
            spec("inputs.b", 3, 1),
        ])
        .unwrap_err();
        match err {
            Error::SequenceMultiplicityMismatch {
                nesting_order,
                multiplicities,
            } => {
                assert_eq!(nesting_order, 1);
                assert_eq!(multiplicities, vec![2, 3]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_generate_new_elements_maps_store_indices() {
        let rows = resolve_element_data_indices(&[spec("inputs.p1", 2, 0)]).unwrap();

        let mut input_data = BTreeMap::new();
        input_data.insert("inputs.p1".to_string(), vec![10, 11]);
        let mut output_data = BTreeMap::new();
        output_data.insert("p2".to_string(), vec![12, 13]);

        let elements = generate_new_elements(&input_data, &output_data, &rows);
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0]["inputs.p1"], 10);
        assert_eq!(elements[0]["outputs.p2"], 12);
        assert_eq!(elements[1]["inputs.p1"], 11);
        assert_eq!(elements[1]["outputs.p2"], 13);
    }

    #[test]
    fn test_repeats_pseudo_path_dropped() {
        let rows =
            resolve_element_data_indices(&[spec("repeats", 2, 0), spec("inputs.p1", 3, 1)])
                .unwrap();
        assert_eq!(rows.len(), 6);

        let mut input_data = BTreeMap::new();
        input_data.insert("inputs.p1".to_string(), vec![0, 1, 2]);
        let elements = generate_new_elements(&input_data, &BTreeMap::new(), &rows);
        assert!(elements.iter().all(|e| !e.contains_key("repeats")));
    }
}
