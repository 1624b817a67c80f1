//! Tools to simplify building graphs in tests.

use super::attr::{
    set_parent_index, TensorValue, ATTR_NAME_SUBGRAPH_MULTI_DIMS_INDEX, ATTR_NAME_WEIGHTS,
};
use super::{
    op_types, ComputeGraph, DataType, GraphId, InAnchor, NodeId, OpDesc, OutAnchor, TensorDesc,
};

/// Return output `index` of `node`.
pub fn out(node: NodeId, index: usize) -> OutAnchor {
    OutAnchor::new(node, index)
}

/// Builds a [`ComputeGraph`] node by node.
///
/// All methods panic on failure, which is what tests want.
pub struct GraphBuilder {
    graph: ComputeGraph,
}

impl GraphBuilder {
    pub fn new(name: &str) -> GraphBuilder {
        GraphBuilder {
            graph: ComputeGraph::new(name),
        }
    }

    pub fn root(&self) -> GraphId {
        self.graph.root()
    }

    pub fn graph(&mut self) -> &mut ComputeGraph {
        &mut self.graph
    }

    /// Add a graph input with a float tensor of the given shape.
    pub fn data(&mut self, graph: GraphId, name: &str, shape: &[i64]) -> NodeId {
        let desc = TensorDesc::new(DataType::Float, shape);
        let op = OpDesc::new(name, op_types::DATA)
            .with_input(desc.clone())
            .with_output(desc);
        let id = self.graph.add_node(graph, op).unwrap();
        self.graph.add_graph_input(id).unwrap();
        id
    }

    /// Add a `Data` node of a subgraph which maps to input `parent_index`
    /// of the dispatch node.
    pub fn subgraph_data(
        &mut self,
        graph: GraphId,
        name: &str,
        shape: &[i64],
        parent_index: usize,
    ) -> NodeId {
        let id = self.data(graph, name, shape);
        set_parent_index(&mut self.graph.try_node_mut(id).unwrap().desc_mut().attrs, parent_index);
        id
    }

    /// Add a `Const` node holding `value`.
    pub fn constant(&mut self, graph: GraphId, name: &str, value: TensorValue) -> NodeId {
        let shape: Vec<i64> = value.shape().iter().map(|&d| d as i64).collect();
        let op = OpDesc::new(name, op_types::CONSTANT)
            .with_output(TensorDesc::new(value.dtype(), &shape))
            .with_attr(ATTR_NAME_WEIGHTS, value);
        self.graph.add_node(graph, op).unwrap()
    }

    /// Add an operator with one output, consuming `inputs`.
    ///
    /// Input descriptors are copied from the producers and the output has
    /// the shape of the first input.
    pub fn op(&mut self, graph: GraphId, name: &str, op_type: &str, inputs: &[OutAnchor]) -> NodeId {
        self.op_with_outputs(graph, name, op_type, inputs, 1)
    }

    pub fn op_with_outputs(
        &mut self,
        graph: GraphId,
        name: &str,
        op_type: &str,
        inputs: &[OutAnchor],
        num_outputs: usize,
    ) -> NodeId {
        let input_descs: Vec<TensorDesc> = inputs
            .iter()
            .map(|src| {
                self.graph
                    .try_node(src.node)
                    .unwrap()
                    .output_desc(src.index)
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        let output_desc = input_descs
            .first()
            .map(|d| TensorDesc::new(d.dtype, &d.shape))
            .unwrap_or_else(|| TensorDesc::new(DataType::Float, &[1]));

        let mut op = OpDesc::new(name, op_type);
        op.inputs = input_descs;
        op.outputs = vec![output_desc; num_outputs];
        let id = self.graph.add_node(graph, op).unwrap();

        for (index, &src) in inputs.iter().enumerate() {
            self.graph.add_data_edge(src, InAnchor::new(id, index)).unwrap();
        }
        id
    }

    pub fn net_output(&mut self, graph: GraphId, name: &str, inputs: &[OutAnchor]) -> NodeId {
        self.op_with_outputs(graph, name, op_types::NETOUTPUT, inputs, 0)
    }

    /// Add a subgraph `NetOutput` whose input `i` maps to output `i` of the
    /// dispatch node.
    pub fn subgraph_net_output(&mut self, graph: GraphId, name: &str, inputs: &[OutAnchor]) -> NodeId {
        let id = self.net_output(graph, name, inputs);
        let node = self.graph.try_node_mut(id).unwrap();
        for (index, desc) in node.desc_mut().inputs.iter_mut().enumerate() {
            set_parent_index(&mut desc.attrs, index);
        }
        id
    }

    /// Add a `PartitionedCall` with an empty subgraph named `subgraph`.
    pub fn partitioned_call(
        &mut self,
        graph: GraphId,
        name: &str,
        subgraph: &str,
        inputs: &[OutAnchor],
        num_outputs: usize,
    ) -> (NodeId, GraphId) {
        let id = self.op_with_outputs(graph, name, op_types::PARTITIONED_CALL, inputs, num_outputs);
        let sub = self.graph.create_subgraph(id, subgraph).unwrap();
        (id, sub)
    }

    /// Assign a node to a scope.
    pub fn set_scope(&mut self, node: NodeId, scope: i64) {
        self.graph
            .try_node_mut(node)
            .unwrap()
            .desc_mut()
            .attrs
            .set(ATTR_NAME_SUBGRAPH_MULTI_DIMS_INDEX, scope);
    }

    pub fn ctrl(&mut self, src: NodeId, dst: NodeId) {
        self.graph.add_control_edge(src, dst).unwrap();
    }

    pub fn finish(self) -> ComputeGraph {
        self.graph
    }
}
