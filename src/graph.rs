use std::collections::VecDeque;
use std::error::Error;
use std::fmt;

// The std HashMap/HashSet provide DOS resistance. In this module hash keys are
// mostly `NodeId`s which we allocate ourselves, so this is not a concern.
// Instead we want faster hashing.
use rustc_hash::{FxHashMap, FxHashSet};

pub mod attr;
mod clone;
mod node;
mod node_id;

#[cfg(test)]
pub mod builder;

#[cfg(test)]
mod tests;

pub use attr::{AttrError, AttrMap, AttrValue, TensorData, TensorValue};
pub use clone::ClonedGraph;
pub use node::{
    op_types, DataType, InAnchor, Node, OpDesc, OutAnchor, TensorDesc, UNKNOWN_DIM, UNKNOWN_RANK,
};
pub use node_id::{GraphId, NodeId};

/// Errors from graph mutation and query primitives.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphError {
    /// A node ID does not refer to a live node.
    InvalidNodeId(NodeId),

    /// A graph ID does not refer to a live graph.
    InvalidGraphId(GraphId),

    /// A node with the same name already exists in the graph.
    DuplicateNodeName { graph: String, name: String },

    /// A graph with the same name already exists.
    DuplicateGraphName(String),

    /// An anchor index is out of range for a node.
    InvalidAnchor {
        node: String,
        index: usize,
        kind: &'static str,
    },

    /// A data input anchor already has a producer.
    AnchorOccupied { node: String, index: usize },

    /// An edge which was expected to exist was not found.
    EdgeNotFound { src: String, dst: String },

    /// The nodes of a graph do not form a DAG.
    Cycle(String),

    /// Back-references or edges are inconsistent.
    Inconsistent(String),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::InvalidNodeId(id) => write!(f, "node ID {} is invalid", id),
            GraphError::InvalidGraphId(id) => write!(f, "graph ID {} is invalid", id),
            GraphError::DuplicateNodeName { graph, name } => {
                write!(f, "graph \"{}\" already has a node named \"{}\"", graph, name)
            }
            GraphError::DuplicateGraphName(name) => {
                write!(f, "a graph named \"{}\" already exists", name)
            }
            GraphError::InvalidAnchor { node, index, kind } => {
                write!(f, "node \"{}\" has no {} anchor {}", node, kind, index)
            }
            GraphError::AnchorOccupied { node, index } => {
                write!(f, "input {} of node \"{}\" already has a producer", index, node)
            }
            GraphError::EdgeNotFound { src, dst } => {
                write!(f, "no edge from \"{}\" to \"{}\"", src, dst)
            }
            GraphError::Cycle(graph) => write!(f, "graph \"{}\" contains a cycle", graph),
            GraphError::Inconsistent(msg) => write!(f, "graph is inconsistent: {}", msg),
        }
    }
}

impl Error for GraphError {}

/// A graph within a [`ComputeGraph`]: either the root graph or a subgraph
/// embedded in a node.
///
/// The graph does not own its nodes. Nodes live in the arena of the
/// `ComputeGraph` and the graph holds their IDs in insertion order.
#[derive(Clone, Debug)]
pub struct GraphBody {
    name: String,
    nodes: Vec<NodeId>,
    inputs: Vec<NodeId>,
    parent_node: Option<NodeId>,
    parent_graph: Option<GraphId>,
    attrs: AttrMap,
}

impl GraphBody {
    fn new(name: &str) -> GraphBody {
        GraphBody {
            name: name.to_string(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            parent_node: None,
            parent_graph: None,
            attrs: AttrMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes registered as graph inputs, in registration order.
    pub fn input_nodes(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Node which embeds this graph. `None` for the root graph and for
    /// graphs which are not yet attached.
    pub fn parent_node(&self) -> Option<NodeId> {
        self.parent_node
    }

    /// Graph which owns the parent node.
    pub fn parent_graph(&self) -> Option<GraphId> {
        self.parent_graph
    }

    pub fn attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut AttrMap {
        &mut self.attrs
    }
}

/// A computational graph together with all of its subgraphs.
///
/// Nodes and graphs live in arenas addressed by [`NodeId`] and [`GraphId`].
/// Ownership forms a tree: the root graph owns its direct nodes, a node owns
/// the subgraphs named in its [`OpDesc::subgraph_names`] and each subgraph
/// owns its direct nodes. The back-references from a subgraph to its parent
/// node and parent graph are plain IDs.
///
/// Node names are unique within each graph. Graph names are unique across
/// the whole `ComputeGraph`.
#[derive(Clone, Debug)]
pub struct ComputeGraph {
    nodes: Vec<Option<Node>>,
    graphs: Vec<Option<GraphBody>>,
    root: GraphId,
}

impl ComputeGraph {
    /// Create a compute graph with an empty root graph.
    pub fn new(name: &str) -> ComputeGraph {
        ComputeGraph {
            nodes: Vec::new(),
            graphs: vec![Some(GraphBody::new(name))],
            root: GraphId::from_u32(0),
        }
    }

    pub fn root(&self) -> GraphId {
        self.root
    }

    pub fn graph(&self, id: GraphId) -> Option<&GraphBody> {
        self.graphs.get(id.as_usize()).and_then(|g| g.as_ref())
    }

    pub fn graph_mut(&mut self, id: GraphId) -> Option<&mut GraphBody> {
        self.graphs.get_mut(id.as_usize()).and_then(|g| g.as_mut())
    }

    pub fn try_graph(&self, id: GraphId) -> Result<&GraphBody, GraphError> {
        self.graph(id).ok_or(GraphError::InvalidGraphId(id))
    }

    fn try_graph_mut(&mut self, id: GraphId) -> Result<&mut GraphBody, GraphError> {
        self.graph_mut(id).ok_or(GraphError::InvalidGraphId(id))
    }

    /// Return the name of a graph, or an empty string if the ID is invalid.
    pub fn graph_name(&self, id: GraphId) -> &str {
        self.graph(id).map(|g| g.name()).unwrap_or_default()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.as_usize()).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.as_usize()).and_then(|n| n.as_mut())
    }

    pub fn try_node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.node(id).ok_or(GraphError::InvalidNodeId(id))
    }

    pub fn try_node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.node_mut(id).ok_or(GraphError::InvalidNodeId(id))
    }

    /// Return the debug name for a node.
    pub fn node_name(&self, id: NodeId) -> String {
        self.node(id)
            .map(|node| node.name().to_string())
            .unwrap_or_else(|| format!("[ID: {}]", id))
    }

    /// Return a snapshot of the direct nodes of a graph, in node order.
    ///
    /// The result is an owned list so that callers can mutate the graph
    /// while walking it.
    pub fn direct_nodes(&self, graph: GraphId) -> Vec<NodeId> {
        self.graph(graph)
            .map(|g| g.nodes.clone())
            .unwrap_or_default()
    }

    /// Position of a node in its owning graph's node order.
    pub fn node_position(&self, id: NodeId) -> Option<usize> {
        let owner = self.node(id)?.owner;
        self.graph(owner)?.nodes.iter().position(|n| *n == id)
    }

    /// Find a direct node of `graph` by name.
    pub fn find_node(&self, graph: GraphId, name: &str) -> Option<NodeId> {
        self.graph(graph)?
            .nodes
            .iter()
            .copied()
            .find(|&id| self.node(id).is_some_and(|n| n.name() == name))
    }

    /// Return the direct nodes of `graph` with a given operator type, in
    /// node order.
    pub fn find_nodes_of_type(&self, graph: GraphId, op_type: &str) -> Vec<NodeId> {
        self.direct_nodes(graph)
            .into_iter()
            .filter(|&id| self.node(id).is_some_and(|n| n.is_type(op_type)))
            .collect()
    }

    /// Find a graph by name.
    pub fn find_graph(&self, name: &str) -> Option<GraphId> {
        self.graphs.iter().enumerate().find_map(|(i, g)| match g {
            Some(g) if g.name == name => Some(GraphId::from_usize(i)),
            _ => None,
        })
    }

    /// Return all live graphs other than the root, in creation order.
    pub fn subgraphs(&self) -> Vec<GraphId> {
        self.graphs
            .iter()
            .enumerate()
            .filter_map(|(i, g)| g.as_ref().map(|_| GraphId::from_usize(i)))
            .filter(|&id| id != self.root)
            .collect()
    }

    /// Return the subgraphs embedded in a node, in instance order.
    pub fn node_subgraphs(&self, node: NodeId) -> Vec<GraphId> {
        let Some(node) = self.node(node) else {
            return Vec::new();
        };
        node.desc
            .subgraph_names
            .iter()
            .filter_map(|name| self.find_graph(name))
            .collect()
    }

    fn check_unique_node_name(&self, graph: GraphId, name: &str) -> Result<(), GraphError> {
        if self.find_node(graph, name).is_some() {
            return Err(GraphError::DuplicateNodeName {
                graph: self.graph_name(graph).to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn alloc_node(&mut self, graph: GraphId, desc: OpDesc) -> Result<NodeId, GraphError> {
        self.try_graph(graph)?;
        self.check_unique_node_name(graph, &desc.name)?;
        let id = NodeId::from_usize(self.nodes.len());
        self.nodes.push(Some(Node::new(desc, graph)));
        Ok(id)
    }

    /// Add a node to the end of a graph's node order.
    pub fn add_node(&mut self, graph: GraphId, desc: OpDesc) -> Result<NodeId, GraphError> {
        let id = self.alloc_node(graph, desc)?;
        self.try_graph_mut(graph)?.nodes.push(id);
        Ok(id)
    }

    /// Add a node to a graph immediately before `before` in node order.
    pub fn insert_node_before(
        &mut self,
        graph: GraphId,
        desc: OpDesc,
        before: NodeId,
    ) -> Result<NodeId, GraphError> {
        let pos = self
            .try_graph(graph)?
            .nodes
            .iter()
            .position(|n| *n == before)
            .ok_or(GraphError::InvalidNodeId(before))?;
        let id = self.alloc_node(graph, desc)?;
        self.try_graph_mut(graph)?.nodes.insert(pos, id);
        Ok(id)
    }

    /// Add an input anchor to a node and return its index.
    pub fn add_input_anchor(&mut self, node: NodeId, desc: TensorDesc) -> Result<usize, GraphError> {
        let node = self.try_node_mut(node)?;
        node.desc.inputs.push(desc);
        node.in_data.push(None);
        Ok(node.in_data.len() - 1)
    }

    /// Add an output anchor to a node and return its index.
    pub fn add_output_anchor(
        &mut self,
        node: NodeId,
        desc: TensorDesc,
    ) -> Result<usize, GraphError> {
        let node = self.try_node_mut(node)?;
        node.desc.outputs.push(desc);
        node.out_data.push(Default::default());
        Ok(node.out_data.len() - 1)
    }

    fn check_out_anchor(&self, anchor: OutAnchor) -> Result<(), GraphError> {
        let node = self.try_node(anchor.node)?;
        if anchor.index >= node.num_outputs() {
            return Err(GraphError::InvalidAnchor {
                node: node.name().to_string(),
                index: anchor.index,
                kind: "output",
            });
        }
        Ok(())
    }

    fn check_in_anchor(&self, anchor: InAnchor) -> Result<(), GraphError> {
        let node = self.try_node(anchor.node)?;
        if anchor.index >= node.num_inputs() {
            return Err(GraphError::InvalidAnchor {
                node: node.name().to_string(),
                index: anchor.index,
                kind: "input",
            });
        }
        Ok(())
    }

    /// Connect an output anchor to an input anchor.
    ///
    /// Fails if the input already has a producer.
    pub fn add_data_edge(&mut self, src: OutAnchor, dst: InAnchor) -> Result<(), GraphError> {
        self.check_out_anchor(src)?;
        self.check_in_anchor(dst)?;

        let dst_node = self.try_node_mut(dst.node)?;
        if dst_node.in_data[dst.index].is_some() {
            return Err(GraphError::AnchorOccupied {
                node: dst_node.name().to_string(),
                index: dst.index,
            });
        }
        dst_node.in_data[dst.index] = Some(src);
        self.try_node_mut(src.node)?.out_data[src.index].push(dst);
        Ok(())
    }

    /// Remove the edge between an output anchor and an input anchor.
    pub fn remove_data_edge(&mut self, src: OutAnchor, dst: InAnchor) -> Result<(), GraphError> {
        self.check_out_anchor(src)?;
        self.check_in_anchor(dst)?;

        let linked = self.try_node(dst.node)?.in_data[dst.index] == Some(src);
        if !linked {
            return Err(GraphError::EdgeNotFound {
                src: self.node_name(src.node),
                dst: self.node_name(dst.node),
            });
        }
        self.try_node_mut(dst.node)?.in_data[dst.index] = None;
        self.try_node_mut(src.node)?.out_data[src.index].retain(|c| *c != dst);
        Ok(())
    }

    /// Replace the producer of `dst` with `src`.
    ///
    /// If `dst` currently has a producer, that edge is removed first.
    pub fn relink_input(&mut self, dst: InAnchor, src: OutAnchor) -> Result<(), GraphError> {
        self.check_in_anchor(dst)?;
        if let Some(old_src) = self.try_node(dst.node)?.peer_out(dst.index) {
            self.remove_data_edge(old_src, dst)?;
        }
        self.add_data_edge(src, dst)
    }

    /// Add a control edge. Adding an edge which already exists is a no-op.
    pub fn add_control_edge(&mut self, src: NodeId, dst: NodeId) -> Result<(), GraphError> {
        self.try_node(dst)?;
        let src_node = self.try_node_mut(src)?;
        if src_node.out_ctrl.contains(&dst) {
            return Ok(());
        }
        src_node.out_ctrl.push(dst);
        self.try_node_mut(dst)?.in_ctrl.push(src);
        Ok(())
    }

    pub fn remove_control_edge(&mut self, src: NodeId, dst: NodeId) -> Result<(), GraphError> {
        self.try_node(dst)?;
        if !self.try_node(src)?.out_ctrl.contains(&dst) {
            return Err(GraphError::EdgeNotFound {
                src: self.node_name(src),
                dst: self.node_name(dst),
            });
        }
        self.try_node_mut(src)?.out_ctrl.retain(|n| *n != dst);
        self.try_node_mut(dst)?.in_ctrl.retain(|n| *n != src);
        Ok(())
    }

    /// Remove all data and control edges of a node.
    pub fn isolate_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.try_node(id)?;
        let inputs: Vec<(usize, OutAnchor)> = node.connected_inputs().collect();
        let outputs: Vec<(usize, InAnchor)> = node
            .out_data
            .iter()
            .enumerate()
            .flat_map(|(i, consumers)| consumers.iter().map(move |c| (i, *c)))
            .collect();
        let in_ctrl = node.in_ctrl.to_vec();
        let out_ctrl = node.out_ctrl.to_vec();

        for (index, src) in inputs {
            self.remove_data_edge(src, InAnchor::new(id, index))?;
        }
        for (index, dst) in outputs {
            self.remove_data_edge(OutAnchor::new(id, index), dst)?;
        }
        for src in in_ctrl {
            self.remove_control_edge(src, id)?;
        }
        for dst in out_ctrl {
            self.remove_control_edge(id, dst)?;
        }
        Ok(())
    }

    /// Remove a node and all of its edges from the graph.
    ///
    /// Subgraphs embedded in the node are removed too.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.isolate_node(id)?;
        for subgraph in self.node_subgraphs(id) {
            self.remove_graph(subgraph)?;
        }

        let owner = self.try_node(id)?.owner;
        let body = self.try_graph_mut(owner)?;
        body.nodes.retain(|n| *n != id);
        body.inputs.retain(|n| *n != id);
        self.nodes[id.as_usize()] = None;
        Ok(())
    }

    /// Move a node from its current graph to the end of `to`.
    ///
    /// Edges are left untouched, so the caller is responsible for rewiring
    /// any edges which now cross a graph boundary.
    pub fn move_node(&mut self, id: NodeId, to: GraphId) -> Result<(), GraphError> {
        let (owner, name) = {
            let node = self.try_node(id)?;
            (node.owner, node.name().to_string())
        };
        if owner == to {
            return Ok(());
        }
        self.try_graph(to)?;
        self.check_unique_node_name(to, &name)?;

        let old = self.try_graph_mut(owner)?;
        old.nodes.retain(|n| *n != id);
        old.inputs.retain(|n| *n != id);
        self.try_graph_mut(to)?.nodes.push(id);
        self.try_node_mut(id)?.owner = to;

        for subgraph in self.node_subgraphs(id) {
            self.try_graph_mut(subgraph)?.parent_graph = Some(to);
        }
        Ok(())
    }

    /// Register a node as an input of its owning graph.
    pub fn add_graph_input(&mut self, id: NodeId) -> Result<(), GraphError> {
        let owner = self.try_node(id)?.owner;
        let body = self.try_graph_mut(owner)?;
        if !body.inputs.contains(&id) {
            body.inputs.push(id);
        }
        Ok(())
    }

    /// Create a graph which is not yet attached to any parent node.
    pub fn new_detached_graph(&mut self, name: &str) -> Result<GraphId, GraphError> {
        if self.find_graph(name).is_some() {
            return Err(GraphError::DuplicateGraphName(name.to_string()));
        }
        let id = GraphId::from_usize(self.graphs.len());
        self.graphs.push(Some(GraphBody::new(name)));
        Ok(id)
    }

    /// Create an empty subgraph and attach it to `parent` as its last
    /// subgraph instance.
    pub fn create_subgraph(&mut self, parent: NodeId, name: &str) -> Result<GraphId, GraphError> {
        self.try_node(parent)?;
        let id = self.new_detached_graph(name)?;
        self.attach_subgraph(parent, id)?;
        Ok(id)
    }

    /// Attach a detached graph to `parent` as its last subgraph instance.
    pub fn attach_subgraph(&mut self, parent: NodeId, graph: GraphId) -> Result<(), GraphError> {
        let parent_graph = self.try_node(parent)?.owner;
        let body = self.try_graph(graph)?;
        if graph == self.root || body.parent_node.is_some() {
            return Err(GraphError::Inconsistent(format!(
                "graph \"{}\" is already attached",
                body.name
            )));
        }
        let name = body.name.clone();

        let body = self.try_graph_mut(graph)?;
        body.parent_node = Some(parent);
        body.parent_graph = Some(parent_graph);
        self.try_node_mut(parent)?.desc.subgraph_names.push(name);
        Ok(())
    }

    /// Detach a subgraph from its parent node, leaving it in the arena.
    pub fn detach_subgraph(&mut self, graph: GraphId) -> Result<(), GraphError> {
        let body = self.try_graph_mut(graph)?;
        let name = body.name.clone();
        let parent = body.parent_node.take();
        body.parent_graph = None;
        if let Some(parent) = parent {
            self.try_node_mut(parent)?
                .desc
                .subgraph_names
                .retain(|n| *n != name);
        }
        Ok(())
    }

    /// Move a subgraph to another parent node, keeping its contents.
    pub fn reparent_subgraph(&mut self, graph: GraphId, parent: NodeId) -> Result<(), GraphError> {
        self.detach_subgraph(graph)?;
        self.attach_subgraph(parent, graph)
    }

    /// Replace subgraph `old` with the detached graph `new` in the same
    /// instance slot of the parent node. `old` is left detached.
    pub fn replace_subgraph(&mut self, old: GraphId, new: GraphId) -> Result<(), GraphError> {
        let old_body = self.try_graph(old)?;
        let old_name = old_body.name.clone();
        let parent = old_body.parent_node.ok_or_else(|| {
            GraphError::Inconsistent(format!("graph \"{}\" has no parent", old_name))
        })?;
        let new_name = self.try_graph(new)?.name.clone();

        self.attach_subgraph(parent, new)?;
        let names = &mut self.try_node_mut(parent)?.desc.subgraph_names;
        names.retain(|n| *n != new_name);
        let slot = names.iter().position(|n| *n == old_name).ok_or_else(|| {
            GraphError::Inconsistent(format!("graph \"{}\" not registered on parent", old_name))
        })?;
        names[slot] = new_name;

        let old_body = self.try_graph_mut(old)?;
        old_body.parent_node = None;
        old_body.parent_graph = None;
        Ok(())
    }

    /// Remove a graph, its nodes and all nested subgraphs.
    pub fn remove_graph(&mut self, graph: GraphId) -> Result<(), GraphError> {
        if graph == self.root {
            return Err(GraphError::Inconsistent("cannot remove the root graph".into()));
        }
        self.detach_subgraph(graph)?;
        for id in self.direct_nodes(graph) {
            self.remove_node(id)?;
        }
        self.graphs[graph.as_usize()] = None;
        Ok(())
    }

    /// Return the direct nodes of a graph in topological order.
    ///
    /// Both data and control edges between direct nodes are considered.
    /// Nodes which are ready at the same time are emitted in node order.
    pub fn topological_order(&self, graph: GraphId) -> Result<Vec<NodeId>, GraphError> {
        let nodes = self.direct_nodes(graph);
        let members: FxHashSet<NodeId> = nodes.iter().copied().collect();

        let mut in_degree: FxHashMap<NodeId, usize> = FxHashMap::default();
        for &id in &nodes {
            let node = self.try_node(id)?;
            let data_preds = node
                .connected_inputs()
                .filter(|(_, src)| members.contains(&src.node))
                .count();
            let ctrl_preds = node.in_ctrl.iter().filter(|n| members.contains(n)).count();
            in_degree.insert(id, data_preds + ctrl_preds);
        }

        let mut ready: VecDeque<NodeId> = nodes
            .iter()
            .copied()
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            let node = self.try_node(id)?;
            let successors = node
                .out_data
                .iter()
                .flat_map(|c| c.iter().map(|c| c.node))
                .chain(node.out_ctrl.iter().copied());
            for succ in successors {
                if let Some(degree) = in_degree.get_mut(&succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(succ);
                    }
                }
            }
        }

        if order.len() != nodes.len() {
            return Err(GraphError::Cycle(self.graph_name(graph).to_string()));
        }
        Ok(order)
    }

    /// Check the structural invariants of the graph and all subgraphs.
    ///
    /// - Each node is listed by exactly the graph which owns it, and names
    ///   are unique within a graph.
    /// - Both ends of every edge agree and connect nodes in the same graph.
    /// - Each subgraph's parent node lists it, and its parent graph is the
    ///   parent node's owner.
    /// - Each graph is acyclic.
    pub fn verify(&self) -> Result<(), GraphError> {
        let inconsistent = |msg: String| Err(GraphError::Inconsistent(msg));

        for (gi, body) in self.graphs.iter().enumerate() {
            let Some(body) = body else {
                continue;
            };
            let graph = GraphId::from_usize(gi);

            let mut names = FxHashSet::default();
            for &id in &body.nodes {
                let node = self.try_node(id)?;
                if node.owner != graph {
                    return inconsistent(format!(
                        "node \"{}\" is listed by graph \"{}\" but owned by another graph",
                        node.name(),
                        body.name
                    ));
                }
                if !names.insert(node.name()) {
                    return Err(GraphError::DuplicateNodeName {
                        graph: body.name.clone(),
                        name: node.name().to_string(),
                    });
                }
                self.verify_edges(id, node)?;
                for sub in &node.desc.subgraph_names {
                    let sub_id = self.find_graph(sub).ok_or_else(|| {
                        GraphError::Inconsistent(format!("subgraph \"{}\" not found", sub))
                    })?;
                    if self.try_graph(sub_id)?.parent_node != Some(id) {
                        return inconsistent(format!(
                            "subgraph \"{}\" does not refer back to \"{}\"",
                            sub,
                            node.name()
                        ));
                    }
                }
            }

            if graph != self.root {
                let Some(parent) = body.parent_node else {
                    return inconsistent(format!("subgraph \"{}\" is detached", body.name));
                };
                let parent_node = self.try_node(parent)?;
                if body.parent_graph != Some(parent_node.owner)
                    || !parent_node.desc.subgraph_names.contains(&body.name)
                {
                    return inconsistent(format!(
                        "subgraph \"{}\" has stale parent references",
                        body.name
                    ));
                }
            }

            self.topological_order(graph)?;
        }
        Ok(())
    }

    fn verify_edges(&self, id: NodeId, node: &Node) -> Result<(), GraphError> {
        let cross_graph = |peer: NodeId| -> Result<(), GraphError> {
            let peer_node = self.try_node(peer)?;
            if peer_node.owner != node.owner {
                return Err(GraphError::Inconsistent(format!(
                    "edge between \"{}\" and \"{}\" crosses a graph boundary",
                    node.name(),
                    peer_node.name()
                )));
            }
            Ok(())
        };

        for (index, src) in node.connected_inputs() {
            cross_graph(src.node)?;
            if !self
                .try_node(src.node)?
                .peer_ins(src.index)
                .contains(&InAnchor::new(id, index))
            {
                return Err(GraphError::Inconsistent(format!(
                    "input {} of \"{}\" is not listed by its producer",
                    index,
                    node.name()
                )));
            }
        }
        for (index, consumers) in node.out_data.iter().enumerate() {
            for dst in consumers {
                cross_graph(dst.node)?;
                if self.try_node(dst.node)?.peer_out(dst.index) != Some(OutAnchor::new(id, index)) {
                    return Err(GraphError::Inconsistent(format!(
                        "output {} of \"{}\" is not listed by its consumer",
                        index,
                        node.name()
                    )));
                }
            }
        }
        for &peer in node.in_ctrl.iter().chain(node.out_ctrl.iter()) {
            cross_graph(peer)?;
        }
        Ok(())
    }
}
