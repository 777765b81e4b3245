//! Work decomposition: root, optional sample fork, optional evaluation-set
//! fork, leaves.

use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use sr_optimizer::SampleVariation;
use sr_types::{ExecutionMode, ModuleDescriptor, ModuleKind, SrResult, TreeError};

pub type NodeId = usize;

/// What a sample leaf executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeafSpec {
    /// Index into the resolved sample list.
    pub sample: usize,
    pub evaluation_set: Option<usize>,
    pub variation_row: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    Root,
    SampleFork { sample: usize },
    EvaluationSetFork { index: usize },
    SampleLeaf(LeafSpec),
    /// Aggregate view of its siblings; never runs a worker.
    GlobalLeaf,
}

impl NodeKind {
    pub fn is_fork(&self) -> bool {
        matches!(
            self,
            Self::Root | Self::SampleFork { .. } | Self::EvaluationSetFork { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub name: String,
    pub kind: NodeKind,
    /// Number of nodes on the path from the root, root included.
    pub level: usize,
}

/// Ordered sibling leaves under one fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaveGroup {
    pub fork: NodeId,
    pub global: Option<NodeId>,
    pub leaves: Vec<NodeId>,
}

impl LeaveGroup {
    /// GlobalLeaf first, then the sample leaves.
    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.global.iter().copied().chain(self.leaves.iter().copied())
    }
}

/// Arena-backed execution tree. Node ids are indices and parents always
/// precede their children.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTree {
    nodes: Vec<ExecutionNode>,
    leaf_level: usize,
}

impl ExecutionTree {
    fn with_root(name: &str, leaf_level: usize) -> Self {
        Self {
            nodes: vec![ExecutionNode {
                id: 0,
                parent: None,
                children: Vec::new(),
                name: name.to_string(),
                kind: NodeKind::Root,
                level: 1,
            }],
            leaf_level,
        }
    }

    fn add_child(&mut self, parent: NodeId, name: impl Into<String>, kind: NodeKind) -> NodeId {
        let id = self.nodes.len();
        let level = self.nodes[parent].level + 1;
        self.nodes.push(ExecutionNode {
            id,
            parent: Some(parent),
            children: Vec::new(),
            name: name.into(),
            kind,
            level,
        });
        self.nodes[parent].children.push(id);
        id
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn leaf_level(&self) -> usize {
        self.leaf_level
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&ExecutionNode, TreeError> {
        self.nodes.get(id).ok_or(TreeError::UnknownNode { id })
    }

    pub fn nodes(&self) -> &[ExecutionNode] {
        &self.nodes
    }

    pub fn leaf_spec(&self, id: NodeId) -> Result<LeafSpec, TreeError> {
        match self.node(id)?.kind {
            NodeKind::SampleLeaf(spec) => Ok(spec),
            _ => Err(TreeError::NotASampleLeaf { id }),
        }
    }

    /// Sample leaves in depth-first order.
    pub fn sample_leaves(&self) -> Vec<NodeId> {
        self.depth_first()
            .into_iter()
            .filter(|id| matches!(self.nodes[*id].kind, NodeKind::SampleLeaf(_)))
            .collect()
    }

    pub fn global_leaves(&self) -> Vec<NodeId> {
        self.depth_first()
            .into_iter()
            .filter(|id| self.nodes[*id].kind == NodeKind::GlobalLeaf)
            .collect()
    }

    /// Ancestor names below the root joined with `/`.
    pub fn path(&self, id: NodeId) -> Result<String, TreeError> {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.node(current)?;
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            cursor = node.parent;
        }
        names.reverse();
        Ok(names.join("/"))
    }

    fn depth_first(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter().rev());
        }
        order
    }

    /// Drop every fork without a sample leaf at the leaf level below it,
    /// together with the global leaves it holds. Ids are reassigned.
    fn pruned(self) -> Self {
        let mut has_leaf = vec![false; self.nodes.len()];
        for node in self.nodes.iter().rev() {
            let own = match node.kind {
                NodeKind::SampleLeaf(_) => node.level == self.leaf_level,
                _ => false,
            };
            has_leaf[node.id] |= own;
            if let (Some(parent), true) = (node.parent, has_leaf[node.id]) {
                has_leaf[parent] = true;
            }
        }

        let mut tree = Self::with_root(&self.nodes[0].name, self.leaf_level);
        if !has_leaf[0] {
            return tree;
        }
        let mut stack: Vec<(NodeId, NodeId)> = self.nodes[0]
            .children
            .iter()
            .rev()
            .map(|child| (*child, 0))
            .collect();
        while let Some((old, new_parent)) = stack.pop() {
            let node = &self.nodes[old];
            let keep = match node.kind {
                NodeKind::GlobalLeaf => true,
                _ => has_leaf[old],
            };
            if !keep {
                continue;
            }
            let id = tree.add_child(new_parent, node.name.clone(), node.kind.clone());
            stack.extend(node.children.iter().rev().map(|child| (*child, id)));
        }
        tree
    }

    /// Children of every node one level above the leaves.
    pub fn leave_groups(&self) -> Vec<LeaveGroup> {
        self.depth_first()
            .into_iter()
            .filter(|id| {
                let node = &self.nodes[*id];
                node.kind.is_fork() && node.level + 1 == self.leaf_level
            })
            .filter_map(|fork| {
                let mut group = LeaveGroup {
                    fork,
                    global: None,
                    leaves: Vec::new(),
                };
                for child in &self.nodes[fork].children {
                    match self.nodes[*child].kind {
                        NodeKind::GlobalLeaf => group.global = Some(*child),
                        NodeKind::SampleLeaf(_) => group.leaves.push(*child),
                        _ => {}
                    }
                }
                (!group.leaves.is_empty()).then_some(group)
            })
            .collect()
    }

    /// Plain-text outline of the tree.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.nodes[0].name);
        self.outline_children(0, "", &mut out);
        out
    }

    fn outline_children(&self, id: NodeId, prefix: &str, out: &mut String) {
        let children = &self.nodes[id].children;
        for (position, child) in children.iter().enumerate() {
            let last = position + 1 == children.len();
            let node = &self.nodes[*child];
            let marker = match node.kind {
                NodeKind::GlobalLeaf => " [global]",
                _ => "",
            };
            let _ = writeln!(
                out,
                "{prefix}{}{}{marker}",
                if last { "`-- " } else { "|-- " },
                node.name
            );
            let nested = format!("{prefix}{}", if last { "    " } else { "|   " });
            self.outline_children(*child, &nested, out);
        }
    }

    /// Graphviz rendering of the tree.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph execution_tree {\n    node [fontname=\"Helvetica\"];\n");
        for node in &self.nodes {
            let shape = match node.kind {
                NodeKind::SampleLeaf(_) => "box",
                NodeKind::GlobalLeaf => "box, style=dashed",
                _ => "ellipse",
            };
            let _ = writeln!(
                out,
                "    n{} [label=\"{}\", shape={shape}];",
                node.id,
                node.name.replace('"', "\\\"")
            );
        }
        for node in &self.nodes {
            for child in &node.children {
                let _ = writeln!(out, "    n{} -> n{child};", node.id);
            }
        }
        out.push_str("}\n");
        out
    }

    /// Write `<module>_tree.txt` and `<module>_tree.dot` into `dir`.
    pub fn save(&self, dir: &Path, module: &str) -> SrResult<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let text = dir.join(format!("{module}_tree.txt"));
        let dot = dir.join(format!("{module}_tree.dot"));
        fs::write(&text, self.outline())?;
        fs::write(&dot, self.to_dot())?;
        debug!(module, dir = %dir.display(), "saved execution tree");
        Ok(vec![text, dot])
    }
}

/// Pruned tree, its leave groups and the samples that produced no leaves.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub tree: ExecutionTree,
    pub groups: Vec<LeaveGroup>,
    pub empty_samples: Vec<String>,
}

impl ExecutionPlan {
    pub fn group_of(&self, leaf: NodeId) -> Option<usize> {
        self.groups.iter().position(|g| g.members().any(|m| m == leaf))
    }

    pub fn largest_group(&self) -> usize {
        self.groups.iter().map(|g| g.leaves.len()).max().unwrap_or(0)
    }
}

/// Build the execution tree for `samples` under `mode`.
pub fn build_plan(
    module: &ModuleDescriptor,
    mode: ExecutionMode,
    samples: &[SampleVariation],
) -> ExecutionPlan {
    let evaluation_sets = module.has_evaluation_set_parameters;
    let variation = mode == ExecutionMode::Variation;
    let leaf_level = 2 + usize::from(evaluation_sets) + usize::from(variation);
    let mut tree = ExecutionTree::with_root(&module.name, leaf_level);
    let root = tree.root();

    if mode == ExecutionMode::CoupledOptimization {
        if evaluation_sets {
            let common = samples
                .iter()
                .map(SampleVariation::evaluation_set_count)
                .min()
                .unwrap_or(0);
            for index in 0..common {
                let fork = tree.add_child(
                    root,
                    format!("evaluation_set_{index}"),
                    NodeKind::EvaluationSetFork { index },
                );
                add_coupled_group(&mut tree, fork, samples, Some(index));
            }
        } else {
            add_coupled_group(&mut tree, root, samples, None);
        }
    } else if variation || evaluation_sets {
        for (sample_index, sample) in samples.iter().enumerate() {
            let fork = tree.add_child(
                root,
                sample.name(),
                NodeKind::SampleFork {
                    sample: sample_index,
                },
            );
            if evaluation_sets {
                for index in 0..sample.evaluation_set_count() {
                    if variation {
                        let set_fork = tree.add_child(
                            fork,
                            format!("evaluation_set_{index}"),
                            NodeKind::EvaluationSetFork { index },
                        );
                        add_variation_group(&mut tree, set_fork, sample, sample_index, Some(index));
                    } else {
                        tree.add_child(
                            fork,
                            format!("evaluation_set_{index}"),
                            NodeKind::SampleLeaf(LeafSpec {
                                sample: sample_index,
                                evaluation_set: Some(index),
                                variation_row: None,
                            }),
                        );
                    }
                }
            } else {
                add_variation_group(&mut tree, fork, sample, sample_index, None);
            }
        }
    } else {
        if module.kind == ModuleKind::Calculator {
            tree.add_child(root, "global", NodeKind::GlobalLeaf);
        }
        for (sample_index, sample) in samples.iter().enumerate() {
            tree.add_child(
                root,
                sample.name(),
                NodeKind::SampleLeaf(LeafSpec {
                    sample: sample_index,
                    evaluation_set: None,
                    variation_row: None,
                }),
            );
        }
    }

    let tree = tree.pruned();

    let mut contributing = vec![false; samples.len()];
    for id in tree.sample_leaves() {
        if let NodeKind::SampleLeaf(spec) = tree.nodes[id].kind {
            contributing[spec.sample] = true;
        }
    }
    let empty_samples: Vec<String> = samples
        .iter()
        .zip(&contributing)
        .filter(|(_, contributes)| !**contributes)
        .map(|(sample, _)| sample.name().to_string())
        .collect();
    if !empty_samples.is_empty() {
        warn!(samples = ?empty_samples, "samples without executable leaves were skipped");
    }

    let groups = tree.leave_groups();
    debug!(
        mode = ?mode,
        nodes = tree.len(),
        leaves = tree.sample_leaves().len(),
        groups = groups.len(),
        "built execution tree"
    );

    ExecutionPlan {
        tree,
        groups,
        empty_samples,
    }
}

fn add_coupled_group(
    tree: &mut ExecutionTree,
    fork: NodeId,
    samples: &[SampleVariation],
    evaluation_set: Option<usize>,
) {
    tree.add_child(fork, "global", NodeKind::GlobalLeaf);
    for (sample_index, sample) in samples.iter().enumerate() {
        tree.add_child(
            fork,
            sample.name(),
            NodeKind::SampleLeaf(LeafSpec {
                sample: sample_index,
                evaluation_set,
                variation_row: None,
            }),
        );
    }
}

fn add_variation_group(
    tree: &mut ExecutionTree,
    fork: NodeId,
    sample: &SampleVariation,
    sample_index: usize,
    evaluation_set: Option<usize>,
) {
    tree.add_child(fork, "global", NodeKind::GlobalLeaf);
    let rows = sample
        .resolver(evaluation_set)
        .map(|resolver| resolver.grid().len())
        .unwrap_or(0);
    for row in 0..rows {
        tree.add_child(
            fork,
            format!("variable_set_{row}"),
            NodeKind::SampleLeaf(LeafSpec {
                sample: sample_index,
                evaluation_set,
                variation_row: Some(row),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_types::{GlobalSettings, ParameterSet, ParameterValue, Sample, Variable};

    fn varied_sample(name: &str) -> Sample {
        Sample::new(name)
            .with_generic("a", ParameterValue::bound("A"))
            .with_generic("b", ParameterValue::bound("B"))
            .with_variable(Variable::new("A", 0.0).with_range(0.0, 2.0, 1.0).varying(true))
            .with_variable(Variable::new("B", 0.0).with_range(0.0, 3.0, 1.0).varying(true))
    }

    fn resolve(
        descriptor: &ModuleDescriptor,
        samples: &[Sample],
        globals: &GlobalSettings,
    ) -> Vec<SampleVariation> {
        sr_optimizer::resolve_samples(samples, globals, descriptor).unwrap()
    }

    #[test]
    fn variation_produces_global_and_one_leaf_per_row() {
        let descriptor = ModuleDescriptor::new("sim", ModuleKind::Simulator);
        let globals = GlobalSettings::new(ExecutionMode::Variation);
        let samples = resolve(&descriptor, &[varied_sample("s1")], &globals);

        let plan = build_plan(&descriptor, ExecutionMode::Variation, &samples);

        assert_eq!(plan.groups.len(), 1);
        let group = &plan.groups[0];
        assert!(group.global.is_some());
        assert_eq!(group.leaves.len(), 12);
        assert_eq!(plan.tree.path(group.leaves[11]).unwrap(), "s1/variable_set_11");
        assert_eq!(plan.tree.path(group.global.unwrap()).unwrap(), "s1/global");
        assert_eq!(plan.tree.leaf_spec(group.leaves[3]).unwrap().variation_row, Some(3));
        assert!(plan.empty_samples.is_empty());
    }

    #[test]
    fn single_mode_puts_one_leaf_per_sample_under_root() {
        let descriptor = ModuleDescriptor::new("sim", ModuleKind::Simulator);
        let globals = GlobalSettings::new(ExecutionMode::Single);
        let samples = resolve(
            &descriptor,
            &[Sample::new("a"), Sample::new("b"), Sample::new("c").disabled()],
            &globals,
        );

        let plan = build_plan(&descriptor, ExecutionMode::Single, &samples);

        assert_eq!(plan.tree.leaf_level(), 2);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].global, None);
        let names: Vec<_> = plan.groups[0]
            .leaves
            .iter()
            .map(|id| plan.tree.path(*id).unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn calculator_gets_a_global_leaf_first() {
        let descriptor = ModuleDescriptor::new("calc", ModuleKind::Calculator);
        let globals = GlobalSettings::new(ExecutionMode::Single);
        let samples = resolve(&descriptor, &[Sample::new("a")], &globals);

        let plan = build_plan(&descriptor, ExecutionMode::Single, &samples);

        let members: Vec<_> = plan.groups[0].members().collect();
        assert_eq!(plan.tree.node(members[0]).unwrap().kind, NodeKind::GlobalLeaf);
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn samples_without_evaluation_sets_are_pruned() {
        let descriptor = ModuleDescriptor::new("fit", ModuleKind::Fitter).with_evaluation_sets();
        let globals = GlobalSettings::new(ExecutionMode::Single);
        let with_sets = Sample::new("measured")
            .with_evaluation_set(ParameterSet::new().with("target", 1.0))
            .with_evaluation_set(ParameterSet::new().with("target", 2.0));
        let samples = resolve(&descriptor, &[with_sets, Sample::new("bare")], &globals);

        let plan = build_plan(&descriptor, ExecutionMode::Single, &samples);

        assert_eq!(plan.empty_samples, vec!["bare".to_string()]);
        assert_eq!(plan.tree.sample_leaves().len(), 2);
        assert!(plan.tree.nodes().iter().all(|n| n.name != "bare"));
        assert_eq!(
            plan.tree.path(plan.groups[0].leaves[1]).unwrap(),
            "measured/evaluation_set_1"
        );
    }

    #[test]
    fn variation_without_varied_variables_drops_global_only_group() {
        let descriptor = ModuleDescriptor::new("sim", ModuleKind::Simulator);
        let globals = GlobalSettings::new(ExecutionMode::Variation);
        let samples = resolve(&descriptor, &[varied_sample("s1"), Sample::new("flat")], &globals);

        let plan = build_plan(&descriptor, ExecutionMode::Variation, &samples);

        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.empty_samples, vec!["flat".to_string()]);
        assert_eq!(plan.tree.global_leaves().len(), 1);
    }

    #[test]
    fn coupled_with_evaluation_sets_uses_common_count() {
        let descriptor = ModuleDescriptor::new("fit", ModuleKind::Fitter).with_evaluation_sets();
        let globals = GlobalSettings::new(ExecutionMode::CoupledOptimization);
        let two = Sample::new("two")
            .with_evaluation_set(ParameterSet::new())
            .with_evaluation_set(ParameterSet::new());
        let one = Sample::new("one").with_evaluation_set(ParameterSet::new());
        let samples = resolve(&descriptor, &[two, one], &globals);

        let plan = build_plan(&descriptor, ExecutionMode::CoupledOptimization, &samples);

        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.largest_group(), 2);
        let group = &plan.groups[0];
        assert_eq!(plan.tree.path(group.global.unwrap()).unwrap(), "evaluation_set_0/global");
        assert_eq!(plan.tree.path(group.leaves[1]).unwrap(), "evaluation_set_0/one");
    }

    #[test]
    fn exports_outline_and_dot() {
        let descriptor = ModuleDescriptor::new("sim", ModuleKind::Simulator);
        let globals = GlobalSettings::new(ExecutionMode::CoupledOptimization);
        let samples = resolve(&descriptor, &[Sample::new("a"), Sample::new("b")], &globals);
        let plan = build_plan(&descriptor, ExecutionMode::CoupledOptimization, &samples);

        assert_eq!(plan.tree.outline(), "sim\n|-- global [global]\n|-- a\n`-- b\n");
        let dot = plan.tree.to_dot();
        assert!(dot.starts_with("digraph execution_tree {"));
        assert!(dot.contains("n0 -> n3;"));

        let dir = tempfile::tempdir().unwrap();
        let written = plan.tree.save(dir.path(), "sim").unwrap();
        assert_eq!(written.len(), 2);
        assert!(dir.path().join("sim_tree.dot").exists());
        assert!(std::fs::read_to_string(dir.path().join("sim_tree.txt"))
            .unwrap()
            .contains("`-- b"));
    }
}
