//! Merges streaming per-leaf results into per-leaf and per-group views.

use serde::Serialize;
use std::collections::HashMap;

use sr_types::{ResultsMap, TreeError};

use crate::tree::NodeId;

/// One sample leaf's row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub leaf: NodeId,
    pub name: String,
    pub variable_names: Vec<String>,
    pub variable_values: Vec<f64>,
    pub results: ResultsMap,
}

impl ResultRow {
    pub fn new(leaf: NodeId, name: impl Into<String>) -> Self {
        Self {
            leaf,
            name: name.into(),
            variable_names: Vec::new(),
            variable_values: Vec::new(),
            results: ResultsMap::new(),
        }
    }

    pub fn with_variables(mut self, names: Vec<String>, values: Vec<f64>) -> Self {
        self.variable_names = names;
        self.variable_values = values;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeafView {
    pub group: usize,
    pub update_index: u64,
    pub row: ResultRow,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupView {
    pub group: usize,
    pub update_index: u64,
    /// Variable columns are only meaningful for variation groups.
    pub show_variables: bool,
    pub rows: Vec<ResultRow>,
}

#[derive(Debug, Clone)]
struct GroupState {
    rows: Vec<ResultRow>,
    show_variables: bool,
    update_index: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ResultsAggregator {
    groups: Vec<GroupState>,
    index: HashMap<NodeId, (usize, usize)>,
}

impl ResultsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a group and return its index.
    pub fn add_group(&mut self, rows: Vec<ResultRow>, show_variables: bool) -> usize {
        let group = self.groups.len();
        for (position, row) in rows.iter().enumerate() {
            self.index.insert(row.leaf, (group, position));
        }
        self.groups.push(GroupState {
            rows,
            show_variables,
            update_index: 0,
        });
        group
    }

    /// Merge `partial` into the leaf's row, last write wins.
    pub fn update(
        &mut self,
        leaf: NodeId,
        variable_values: Option<&[(String, f64)]>,
        partial: &ResultsMap,
    ) -> Result<(LeafView, GroupView), TreeError> {
        let (group, position) = *self.index.get(&leaf).ok_or(TreeError::UnknownNode { id: leaf })?;
        let state = &mut self.groups[group];
        let row = &mut state.rows[position];

        if let Some(values) = variable_values {
            if !values.is_empty() {
                row.variable_names = values.iter().map(|(name, _)| name.clone()).collect();
                row.variable_values = values.iter().map(|(_, value)| *value).collect();
            }
        }
        for (name, value) in partial {
            row.results.insert(name.clone(), *value);
        }
        state.update_index += 1;

        let leaf_view = LeafView {
            group,
            update_index: state.update_index,
            row: row.clone(),
        };
        Ok((leaf_view, Self::view(group, state)))
    }

    fn view(group: usize, state: &GroupState) -> GroupView {
        GroupView {
            group,
            update_index: state.update_index,
            show_variables: state.show_variables,
            rows: state.rows.clone(),
        }
    }

    pub fn group(&self, group: usize) -> Option<GroupView> {
        self.groups.get(group).map(|state| Self::view(group, state))
    }

    pub fn row(&self, leaf: NodeId) -> Option<&ResultRow> {
        self.index
            .get(&leaf)
            .map(|(group, position)| &self.groups[*group].rows[*position])
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> ResultsAggregator {
        let mut aggregator = ResultsAggregator::new();
        aggregator.add_group(
            vec![
                ResultRow::new(2, "variable_set_0").with_variables(vec!["A".into()], vec![0.0]),
                ResultRow::new(3, "variable_set_1").with_variables(vec!["A".into()], vec![1.0]),
            ],
            true,
        );
        aggregator.add_group(vec![ResultRow::new(5, "s2")], false);
        aggregator
    }

    #[test]
    fn update_touches_only_its_row() {
        let mut aggregator = aggregator();
        let before = aggregator.group(0).unwrap();

        let (leaf, group) = aggregator
            .update(3, None, &ResultsMap::from([("chi2".to_string(), 0.5)]))
            .unwrap();

        assert_eq!(leaf.row.results["chi2"], 0.5);
        assert_eq!(group.rows[0], before.rows[0]);
        assert_eq!(group.rows[1].results["chi2"], 0.5);
        assert_eq!(group.update_index, 1);
        assert!(group.show_variables);
        assert_eq!(aggregator.group(1).unwrap().update_index, 0);
    }

    #[test]
    fn later_writes_win_and_keep_other_columns() {
        let mut aggregator = aggregator();
        aggregator
            .update(
                5,
                Some(&[("B".to_string(), 2.0)]),
                &ResultsMap::from([("a".to_string(), 1.0), ("b".to_string(), 1.0)]),
            )
            .unwrap();
        let (leaf, _) = aggregator
            .update(5, None, &ResultsMap::from([("a".to_string(), 3.0)]))
            .unwrap();

        assert_eq!(leaf.row.results["a"], 3.0);
        assert_eq!(leaf.row.results["b"], 1.0);
        assert_eq!(leaf.row.variable_values, vec![2.0]);
        assert_eq!(leaf.update_index, 2);
    }

    #[test]
    fn unknown_leaf_is_an_error() {
        let mut aggregator = aggregator();
        assert_eq!(
            aggregator.update(42, None, &ResultsMap::new()),
            Err(TreeError::UnknownNode { id: 42 })
        );
    }
}
