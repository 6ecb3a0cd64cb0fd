use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::domain::utils::id::WorkflowId;
use crate::domain::workflow::workflow_node::{FileTransfer, GroupElement, Job, NodeKey, NodesGroup, TransferRef, WorkflowNode};
use crate::error::{Error, Result};

pub type Dependency = (NodeKey, NodeKey);

/// Derived node and dependency sets of a workflow, including the implicit
/// edges between jobs and the transfers they consume or produce.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    pub nodes: BTreeSet<NodeKey>,
    pub dependencies: BTreeSet<Dependency>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Workflow {
    /// Assigned by the engine at submission.
    pub id: Option<WorkflowId>,
    pub name: Option<String>,
    pub expiration_date: Option<DateTime<Utc>>,

    /// Owns every node, including transfers only referenced by jobs.
    pub arena: SlotMap<NodeKey, WorkflowNode>,

    /// Keys to Workflow.arena, the nodes the workflow was built from.
    pub nodes: Vec<NodeKey>,

    /// `(predecessor, successor)`: the predecessor must be done before the successor starts.
    pub dependencies: BTreeSet<Dependency>,

    pub groups: Vec<NodesGroup>,
    pub main_group: Option<NodesGroup>,

    /// Set by [`Workflow::compute_closure`].
    pub full_nodes: Option<BTreeSet<NodeKey>>,
    pub full_dependencies: Option<BTreeSet<Dependency>>,
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new(None::<String>)
    }
}

impl Workflow {
    pub fn new(name: Option<impl Into<String>>) -> Self {
        Workflow {
            id: None,
            name: name.map(Into::into),
            expiration_date: None,
            arena: SlotMap::with_key(),
            nodes: Vec::new(),
            dependencies: BTreeSet::new(),
            groups: Vec::new(),
            main_group: None,
            full_nodes: None,
            full_dependencies: None,
        }
    }

    pub fn add_job(&mut self, job: Job) -> NodeKey {
        let key = self.arena.insert(WorkflowNode::Job(job));
        self.nodes.push(key);
        key
    }

    pub fn add_transfer(&mut self, transfer: FileTransfer) -> NodeKey {
        let key = self.arena.insert(WorkflowNode::FileTransfer(transfer));
        self.nodes.push(key);
        key
    }

    /// Adds a transfer that is not listed among the workflow nodes. It only
    /// becomes part of the workflow through the closure, once a job references it.
    pub fn declare_transfer(&mut self, transfer: FileTransfer) -> NodeKey {
        self.arena.insert(WorkflowNode::FileTransfer(transfer))
    }

    pub fn add_dependency(&mut self, predecessor: NodeKey, successor: NodeKey) {
        self.dependencies.insert((predecessor, successor));
    }

    pub fn node(&self, key: NodeKey) -> Option<&WorkflowNode> {
        self.arena.get(key)
    }

    pub fn job(&self, key: NodeKey) -> Option<&Job> {
        match self.arena.get(key) {
            Some(WorkflowNode::Job(job)) => Some(job),
            _ => None,
        }
    }

    pub fn job_mut(&mut self, key: NodeKey) -> Option<&mut Job> {
        match self.arena.get_mut(key) {
            Some(WorkflowNode::Job(job)) => Some(job),
            _ => None,
        }
    }

    pub fn transfer(&self, key: NodeKey) -> Option<&FileTransfer> {
        match self.arena.get(key) {
            Some(WorkflowNode::FileTransfer(transfer)) => Some(transfer),
            _ => None,
        }
    }

    pub fn transfer_mut(&mut self, key: NodeKey) -> Option<&mut FileTransfer> {
        match self.arena.get_mut(key) {
            Some(WorkflowNode::FileTransfer(transfer)) => Some(transfer),
            _ => None,
        }
    }

    /// The explicit main group, or a group named `main_group` holding every job node.
    pub fn main_group(&self) -> NodesGroup {
        self.main_group.clone().unwrap_or_else(|| {
            let elements = self.nodes.iter().filter(|key| self.job(**key).is_some()).map(|key| GroupElement::Node(*key)).collect();
            NodesGroup::new("main_group", elements)
        })
    }

    /// Computes the closure without touching the workflow. Computing it twice
    /// from the same workflow yields the same sets.
    ///
    /// 1. Every node and dependency endpoint must exist; self edges are rejected.
    /// 2. Transfer references of jobs must point to transfer nodes.
    /// 3. `full_nodes` = nodes plus every referenced transfer node;
    ///    `full_dependencies` = dependencies plus `(job, output)` and `(input, job)`.
    /// 4. The resulting graph must be acyclic.
    pub fn closure(&self) -> Result<Closure> {
        // Phase 1: explicit nodes and edges
        for key in &self.nodes {
            if !self.arena.contains_key(*key) {
                return Err(Error::ValidationError(format!("node {:?} is not part of the workflow", key)));
            }
        }
        for (predecessor, successor) in &self.dependencies {
            if predecessor == successor {
                return Err(Error::ValidationError(format!("node '{}' depends on itself", self.display_name(*predecessor))));
            }
            for key in [predecessor, successor] {
                if !self.arena.contains_key(*key) {
                    return Err(Error::ValidationError(format!("dependency refers to unknown node {:?}", key)));
                }
            }
        }
        for group in self.groups.iter().chain(&self.main_group) {
            if let Some(key) = group.node_keys().into_iter().find(|key| !self.arena.contains_key(*key)) {
                return Err(Error::ValidationError(format!("group '{}' refers to unknown node {:?}", group.name, key)));
            }
        }

        let mut nodes: BTreeSet<NodeKey> = self.nodes.iter().copied().collect();
        let mut dependencies = self.dependencies.clone();

        // Phase 2 + 3: implicit job <-> transfer edges
        for key in &self.nodes {
            let Some(job) = self.job(*key) else {
                continue;
            };
            for transfer in job.transfer_refs() {
                if let TransferRef::Node(transfer_key) = transfer {
                    if self.transfer(transfer_key).is_none() {
                        return Err(Error::ValidationError(format!(
                            "job '{}' references node {:?} which is not a file transfer",
                            job.name, transfer_key
                        )));
                    }
                    nodes.insert(transfer_key);
                }
            }
            for input in &job.referenced_input_files {
                if let TransferRef::Node(transfer_key) = input {
                    dependencies.insert((*transfer_key, *key));
                }
            }
            for output in &job.referenced_output_files {
                if let TransferRef::Node(transfer_key) = output {
                    dependencies.insert((*key, *transfer_key));
                }
            }
        }

        // Explicit edges may also name declared-only transfers.
        for (predecessor, successor) in &dependencies {
            nodes.insert(*predecessor);
            nodes.insert(*successor);
        }

        // Phase 4: cycles
        let closure = Closure { nodes, dependencies };
        topological_order(&closure).map_err(|remaining| {
            let names: Vec<&str> = remaining.iter().map(|key| self.display_name(*key)).collect();
            Error::ValidationError(format!("dependency cycle through {}", names.join(", ")))
        })?;

        Ok(closure)
    }

    /// Validates the workflow and stores its closure in `full_nodes` / `full_dependencies`.
    pub fn compute_closure(&mut self) -> Result<()> {
        let closure = self.closure()?;
        self.full_nodes = Some(closure.nodes);
        self.full_dependencies = Some(closure.dependencies);
        Ok(())
    }

    /// The closure as stored, or freshly computed when it was never stored.
    pub fn full_closure(&self) -> Result<Closure> {
        match (&self.full_nodes, &self.full_dependencies) {
            (Some(nodes), Some(dependencies)) => Ok(Closure { nodes: nodes.clone(), dependencies: dependencies.clone() }),
            _ => self.closure(),
        }
    }

    /// Every node of the closure, each after all of its predecessors.
    pub fn execution_order(&self) -> Result<Vec<NodeKey>> {
        let closure = self.full_closure()?;
        topological_order(&closure).map_err(|_| Error::ValidationError("dependency cycle".into()))
    }

    pub fn predecessors(&self, key: NodeKey) -> Vec<NodeKey> {
        match &self.full_dependencies {
            Some(dependencies) => dependencies.iter().filter(|(_, successor)| *successor == key).map(|(predecessor, _)| *predecessor).collect(),
            None => Vec::new(),
        }
    }

    fn display_name(&self, key: NodeKey) -> &str {
        self.arena.get(key).map_or("<unknown>", WorkflowNode::name)
    }
}

/// Kahn's algorithm over the closure. On a cycle, returns the nodes that could
/// not be ordered.
fn topological_order(closure: &Closure) -> std::result::Result<Vec<NodeKey>, Vec<NodeKey>> {
    let mut in_degree: BTreeMap<NodeKey, usize> = closure.nodes.iter().map(|key| (*key, 0)).collect();
    let mut successors: BTreeMap<NodeKey, Vec<NodeKey>> = BTreeMap::new();

    for (predecessor, successor) in &closure.dependencies {
        *in_degree.entry(*successor).or_insert(0) += 1;
        in_degree.entry(*predecessor).or_insert(0);
        successors.entry(*predecessor).or_default().push(*successor);
    }

    let mut ready: VecDeque<NodeKey> = in_degree.iter().filter(|(_, degree)| **degree == 0).map(|(key, _)| *key).collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(key) = ready.pop_front() {
        order.push(key);
        for successor in successors.get(&key).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*successor);
                }
            }
        }
    }

    if order.len() == in_degree.len() {
        Ok(order)
    } else {
        Err(in_degree.into_iter().filter(|(_, degree)| *degree > 0).map(|(key, _)| key).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::utils::id::TransferId;
    use crate::error::ErrorKind;

    fn echo_workflow() -> (Workflow, NodeKey, NodeKey, NodeKey) {
        let mut workflow = Workflow::new(Some("echo"));
        let tout = workflow.declare_transfer(FileTransfer::new("/client/out.txt"));
        let a = workflow.add_job(Job::new("A", ["echo", "hi"]).with_output(TransferRef::Node(tout)));
        let b = workflow.add_job(Job::new("B", ["true"]));
        workflow.add_dependency(a, b);
        (workflow, a, b, tout)
    }

    #[test]
    fn test_closure_adds_transfer_edges() {
        let (workflow, a, b, tout) = echo_workflow();

        let closure = workflow.closure().unwrap();

        assert!(closure.dependencies.contains(&(a, b)));
        assert!(closure.dependencies.contains(&(a, tout)));
        assert_eq!(closure.nodes, BTreeSet::from([a, b, tout]));
    }

    #[test]
    fn test_closure_is_idempotent() {
        let (mut workflow, _, _, _) = echo_workflow();

        let first = workflow.closure().unwrap();
        workflow.compute_closure().unwrap();
        let second = workflow.closure().unwrap();

        assert_eq!(first, second);
        assert_eq!(workflow.full_nodes.as_ref(), Some(&first.nodes));
        assert_eq!(workflow.full_dependencies.as_ref(), Some(&first.dependencies));
    }

    #[test]
    fn test_producer_and_consumer_edges() {
        let mut workflow = Workflow::new(Some("chain"));
        let shared = workflow.add_transfer(FileTransfer::new("/client/mid.dat"));
        let producer = workflow.add_job(Job::new("produce", ["gen"]).with_output(TransferRef::Node(shared)));
        let consumer = workflow.add_job(Job::new("consume", ["use"]).with_input(TransferRef::Node(shared)));

        let closure = workflow.closure().unwrap();

        assert!(closure.dependencies.contains(&(producer, shared)));
        assert!(closure.dependencies.contains(&(shared, consumer)));
        let order = topological_order(&closure).unwrap();
        let position = |key| order.iter().position(|k| *k == key).unwrap();
        assert!(position(producer) < position(shared) && position(shared) < position(consumer));
    }

    #[test]
    fn test_explicit_cycle_is_rejected() {
        let mut workflow = Workflow::new(Some("cycle"));
        let a = workflow.add_job(Job::new("A", ["a"]));
        let b = workflow.add_job(Job::new("B", ["b"]));
        workflow.add_dependency(a, b);
        workflow.add_dependency(b, a);

        let err = workflow.compute_closure().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(workflow.full_nodes.is_none());
    }

    #[test]
    fn test_transfer_both_input_and_output_is_a_cycle() {
        let mut workflow = Workflow::new(Some("loop"));
        let t = workflow.add_transfer(FileTransfer::new("/client/x"));
        workflow.add_job(Job::new("rewrite", ["sed"]).with_input(TransferRef::Node(t)).with_output(TransferRef::Node(t)));

        assert_eq!(workflow.closure().unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_job_reference_to_job_is_rejected() {
        let mut workflow = Workflow::new(Some("bad"));
        let a = workflow.add_job(Job::new("A", ["a"]));
        workflow.add_job(Job::new("B", ["b"]).with_input(TransferRef::Node(a)));

        assert_eq!(workflow.closure().unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_self_dependency_is_rejected() {
        let mut workflow = Workflow::new(Some("self"));
        let a = workflow.add_job(Job::new("A", ["a"]));
        workflow.add_dependency(a, a);

        assert_eq!(workflow.closure().unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_registered_transfers_add_no_nodes() {
        let mut workflow = Workflow::new(Some("registered"));
        let a = workflow.add_job(Job::new("A", ["cat"]).with_input(TransferRef::Registered(TransferId::new(9))));

        let closure = workflow.closure().unwrap();
        assert_eq!(closure.nodes, BTreeSet::from([a]));
        assert!(closure.dependencies.is_empty());
    }

    #[test]
    fn test_groups_do_not_change_closure() {
        let (mut workflow, a, b, _) = echo_workflow();
        let before = workflow.closure().unwrap();

        workflow.groups.push(NodesGroup::new("display", vec![GroupElement::Node(b), GroupElement::Node(a)]));
        assert_eq!(workflow.closure().unwrap(), before);
        assert_eq!(workflow.main_group().node_keys(), vec![a, b]);
    }
}
