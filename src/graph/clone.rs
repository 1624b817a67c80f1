use rustc_hash::FxHashMap;

use super::{ComputeGraph, GraphError, GraphId, InAnchor, NodeId, OutAnchor};

/// Result of [`ComputeGraph::clone_graph`].
#[derive(Debug)]
pub struct ClonedGraph {
    /// ID of the new, detached graph.
    pub graph: GraphId,

    /// Map from direct nodes of the source graph to their clones.
    pub node_map: FxHashMap<NodeId, NodeId>,
}

impl ComputeGraph {
    /// Deep-clone a graph.
    ///
    /// The clone is named `<source name><postfix>`, as is every cloned node.
    /// Node descriptions (including all tensor and node attributes), graph
    /// inputs, graph attributes and the data and control edges between
    /// direct nodes are copied. Subgraphs embedded in cloned nodes are cloned
    /// recursively with the same postfix.
    ///
    /// The new graph is detached; use
    /// [`attach_subgraph`](ComputeGraph::attach_subgraph) to give it a parent.
    pub fn clone_graph(&mut self, src: GraphId, postfix: &str) -> Result<ClonedGraph, GraphError> {
        let src_body = self.try_graph(src)?;
        let clone_name = format!("{}{}", src_body.name(), postfix);
        let src_inputs = src_body.input_nodes().to_vec();
        let src_attrs = src_body.attrs().clone();
        let src_nodes = self.direct_nodes(src);

        let graph = self.new_detached_graph(&clone_name)?;
        self.try_graph_mut(graph)?.attrs = src_attrs;

        let mut node_map = FxHashMap::default();
        for &id in &src_nodes {
            let mut desc = self.try_node(id)?.desc.clone();
            desc.name = format!("{}{}", desc.name, postfix);
            desc.subgraph_names.clear();
            let new_id = self.add_node(graph, desc)?;
            node_map.insert(id, new_id);
        }

        for id in src_inputs {
            if let Some(&new_id) = node_map.get(&id) {
                self.add_graph_input(new_id)?;
            }
        }

        for &id in &src_nodes {
            let node = self.try_node(id)?;
            let inputs: Vec<_> = node.connected_inputs().collect();
            let out_ctrl = node.out_ctrl.to_vec();
            let new_id = node_map[&id];

            for (index, src) in inputs {
                let Some(&new_src) = node_map.get(&src.node) else {
                    continue;
                };
                self.add_data_edge(
                    OutAnchor::new(new_src, src.index),
                    InAnchor::new(new_id, index),
                )?;
            }
            for dst in out_ctrl {
                if let Some(&new_dst) = node_map.get(&dst) {
                    self.add_control_edge(new_id, new_dst)?;
                }
            }
        }

        for &id in &src_nodes {
            for subgraph in self.node_subgraphs(id) {
                let nested = self.clone_graph(subgraph, postfix)?;
                self.attach_subgraph(node_map[&id], nested.graph)?;
            }
        }

        Ok(ClonedGraph { graph, node_map })
    }
}
