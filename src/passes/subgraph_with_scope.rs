use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use super::scope::{collect_scope_nodes_by_index, is_graph_multi_batch_condition, ScopeBoundary};
use super::{
    unique_graph_name, unique_node_name, Diagnostics, GraphPass, PassError, PassStatus,
};
use crate::context::CompileContext;
use crate::graph::attr::{
    copy_tensor_attrs, parent_index, set_parent_index, AttrMap, ATTR_NAME_OP_MAX_SHAPE,
    ATTR_NAME_SUBGRAPH_MULTI_DIMS_INDEX, ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_DIMS,
    ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_SHAPE, ATTR_NAME_SUBGRAPH_MULTI_DIMS_PROCESSED,
};
use crate::graph::{
    op_types, ComputeGraph, GraphError, GraphId, InAnchor, NodeId, OpDesc, OutAnchor, TensorDesc,
    UNKNOWN_DIM,
};
use crate::multi_batch_options::{
    dims_to_string, parse_dims_list, parse_dynamic_shapes_and_dims, DynamicShapeOptions,
};

/// Extracts each scope of the root graph into a subgraph behind a
/// `PartitionedCall` node.
///
/// Nodes are assigned to scopes by their scope index attribute. If a scope
/// contains an existing `PartitionedCall`, its subgraph absorbs the other
/// members of the scope. The resulting dispatch nodes are marked as
/// processed, for [`SubgraphMultiDimsClonePass`](super::SubgraphMultiDimsClonePass).
pub struct CreateSubgraphWithScopePass {
    diagnostics: Diagnostics,
}

impl CreateSubgraphWithScopePass {
    pub fn new() -> Self {
        Self::with_diagnostics(Diagnostics::from_env())
    }

    pub fn with_diagnostics(diagnostics: Diagnostics) -> Self {
        CreateSubgraphWithScopePass { diagnostics }
    }
}

impl Default for CreateSubgraphWithScopePass {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphPass for CreateSubgraphWithScopePass {
    fn name(&self) -> &str {
        "CreateSubgraphWithScopePass"
    }

    fn run(&self, graph: &mut ComputeGraph, ctx: &CompileContext) -> Result<PassStatus, PassError> {
        if !is_graph_multi_batch_condition(graph, ctx) {
            return Ok(PassStatus::Unchanged);
        }

        // Options and scopes are validated before the graph is modified.
        let options = parse_dynamic_shapes_and_dims(ctx)?;
        let root = graph.root();
        let scopes = collect_scope_nodes_by_index(graph, root)?;
        if scopes.is_empty() {
            log::info!("Graph \"{}\" has no scopes", graph.graph_name(root));
            return Ok(PassStatus::Unchanged);
        }

        annotate_user_inputs(graph, &options)?;

        for (scope, members) in scopes {
            let extractor = ScopeExtractor {
                graph: &mut *graph,
                ctx,
                diagnostics: &self.diagnostics,
                scope,
            };
            let call = extractor.extract(&members)?;
            log::info!(
                "Extracted scope {} with {} nodes into \"{}\"",
                scope,
                members.len(),
                graph.node_name(call)
            );
        }

        update_tensor_max_shape(graph)?;
        Ok(PassStatus::Changed)
    }
}

/// Record the parsed shape and gears on each dynamic user input.
fn annotate_user_inputs(
    graph: &mut ComputeGraph,
    options: &DynamicShapeOptions,
) -> Result<(), PassError> {
    let root = graph.root();
    for (index, (shape, input)) in options.shapes.iter().zip(&options.inputs).enumerate() {
        if input.is_empty() {
            continue;
        }
        let Some(id) = graph
            .find_node(root, &shape.name)
            .filter(|&id| graph.node(id).is_some_and(|n| n.is_type(op_types::DATA)))
        else {
            return Err(PassError::invalid_graph(
                graph,
                root,
                format!("input shape names \"{}\" which is not a Data node", shape.name),
            ));
        };

        let dims = parse_dims_list(&input.dims_string)?;
        let max_shape = dims_to_string(&options.max_shapes[index].dims);

        let desc = graph.try_node_mut(id)?.desc_mut();
        for tensor in desc.inputs.iter_mut().chain(desc.outputs.iter_mut()) {
            tensor.set_shape(&shape.dims);
            tensor.attrs.set(
                ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_SHAPE,
                input.shape_strings.clone(),
            );
            tensor
                .attrs
                .set(ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_DIMS, dims.clone());
        }
        desc.attrs.set(ATTR_NAME_OP_MAX_SHAPE, max_shape);
        log::debug!("Annotated input \"{}\" with {} gears", shape.name, input.shape_strings.len());
    }
    Ok(())
}

/// Return the max shape of output `index` of a node.
fn max_shape_segment(attrs: &AttrMap, index: usize) -> Option<String> {
    attrs
        .get_str(ATTR_NAME_OP_MAX_SHAPE)?
        .split(';')
        .nth(index)
        .map(|s| s.to_string())
}

/// Set shape ranges on the outputs of every node, in every graph, which
/// has a max shape.
fn update_tensor_max_shape(graph: &mut ComputeGraph) -> Result<(), PassError> {
    let graphs: Vec<GraphId> = std::iter::once(graph.root())
        .chain(graph.subgraphs())
        .collect();
    for graph_id in graphs {
        for id in graph.direct_nodes(graph_id) {
            let Some(max_shape) = graph
                .try_node(id)?
                .desc()
                .attrs
                .get_str(ATTR_NAME_OP_MAX_SHAPE)
                .map(|s| s.to_string())
            else {
                continue;
            };
            set_tensor_shape_range(graph, id, &max_shape)?;
        }
    }
    Ok(())
}

/// Set the shape range of each output of `id` from its max shape.
///
/// Unknown dims range from 1 to the max, known dims are fixed. The tensor
/// size is reset since it no longer follows from a static shape.
fn set_tensor_shape_range(
    graph: &mut ComputeGraph,
    id: NodeId,
    max_shape: &str,
) -> Result<(), PassError> {
    let invalid = |graph: &ComputeGraph, msg: String| PassError::invalid_param(graph, id, msg);

    let per_output = max_shape
        .split(';')
        .map(parse_dims_list)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| invalid(graph, format!("invalid max shape: {}", err)))?;

    let node = graph.try_node(id)?;
    if per_output.len() != node.num_outputs() {
        return Err(invalid(
            graph,
            format!(
                "max shape \"{}\" has {} entries for {} outputs",
                max_shape,
                per_output.len(),
                node.num_outputs()
            ),
        ));
    }

    let mut ranges = Vec::with_capacity(per_output.len());
    for (index, max) in per_output.iter().enumerate() {
        let shape = node.output_desc(index).map(|d| d.shape.as_slice()).unwrap_or(&[]);
        if shape.len() != max.len() {
            return Err(invalid(
                graph,
                format!(
                    "max shape {:?} of output {} does not match shape {:?}",
                    max, index, shape
                ),
            ));
        }
        let range: Vec<(i64, i64)> = shape
            .iter()
            .zip(max)
            .map(|(&dim, &max)| match dim {
                UNKNOWN_DIM => (1, max),
                dim => (dim, dim),
            })
            .collect();
        ranges.push(range);
    }

    let node = graph.try_node_mut(id)?;
    for (tensor, range) in node.desc_mut().outputs.iter_mut().zip(ranges) {
        tensor.origin_shape_range = range.clone();
        tensor.shape_range = range;
        tensor.size = 0;
    }
    Ok(())
}

/// Boundary nodes of an existing subgraph, keyed by parent index.
#[derive(Default)]
struct IoNodes {
    data: BTreeMap<usize, NodeId>,

    /// Producer in the subgraph of each output of the dispatch node.
    outputs: BTreeMap<usize, OutAnchor>,

    net_output: Option<NodeId>,
}

/// Bookkeeping while scope members are merged into a subgraph.
struct MergeState {
    /// Dispatch node which replaces the scope in the root graph.
    call: NodeId,
    subgraph: GraphId,

    /// Dispatch node which was part of the scope, if any.
    old_call: Option<NodeId>,
    io: IoNodes,

    /// Map from inputs of `old_call` to inputs of `call`.
    input_map: FxHashMap<usize, usize>,

    /// Map from outputs of `old_call` to outputs of `call`.
    output_map: FxHashMap<usize, usize>,

    /// Data nodes created for external producers, and their input on `call`.
    new_data: FxHashMap<NodeId, usize>,
    data_for_producer: FxHashMap<OutAnchor, NodeId>,

    net_output: Option<NodeId>,

    /// Map from inputs of `net_output` added during the merge to outputs of
    /// `call`.
    net_output_slots: FxHashMap<usize, usize>,
    output_for_anchor: FxHashMap<OutAnchor, usize>,
}

impl MergeState {
    fn new(call: NodeId, subgraph: GraphId, old_call: Option<NodeId>, io: IoNodes) -> Self {
        let net_output = io.net_output;
        MergeState {
            call,
            subgraph,
            old_call,
            io,
            input_map: FxHashMap::default(),
            output_map: FxHashMap::default(),
            new_data: FxHashMap::default(),
            data_for_producer: FxHashMap::default(),
            net_output,
            net_output_slots: FxHashMap::default(),
            output_for_anchor: FxHashMap::default(),
        }
    }
}

/// Extracts one scope of the root graph.
struct ScopeExtractor<'a> {
    graph: &'a mut ComputeGraph,
    ctx: &'a CompileContext,
    diagnostics: &'a Diagnostics,
    scope: i64,
}

impl ScopeExtractor<'_> {
    /// Extract `members` and return the dispatch node which now represents
    /// them in the root graph.
    fn extract(mut self, members: &[NodeId]) -> Result<NodeId, PassError> {
        let calls: Vec<NodeId> = members
            .iter()
            .copied()
            .filter(|&id| {
                self.graph
                    .node(id)
                    .is_some_and(|n| n.is_type(op_types::PARTITIONED_CALL))
            })
            .collect();
        if calls.len() > 1 {
            return Err(PassError::invalid_param(
                self.graph,
                calls[1],
                format!("scope {} contains more than one PartitionedCall", self.scope),
            ));
        }
        let old_call = calls.first().copied();

        if let (Some(call), [_]) = (old_call, members) {
            self.copy_partitioned_call_attr_to_data(call)?;
            self.mark_processed(call)?;
            return Ok(call);
        }

        let payload: Vec<NodeId> = members
            .iter()
            .copied()
            .filter(|&id| Some(id) != old_call)
            .collect();
        let boundary = ScopeBoundary::collect(self.graph, &payload)?;
        self.check_control_edges(&boundary, &payload, old_call)?;

        let mut state = match old_call {
            Some(call) => self.create_new_partitioned_call(call, &payload)?,
            None => self.create_partitioned_call(&payload)?,
        };
        self.merge_nodes_to_subgraph(&mut state, &payload, &boundary)?;
        if let Some(call) = old_call {
            self.graph.remove_node(call)?;
        }
        self.set_parent_index_to_data(&state)?;
        self.set_parent_index_to_net_output(&mut state)?;
        self.mark_processed(state.call)?;

        let root = self.graph.root();
        match self.graph.topological_order(root) {
            Ok(_) => {}
            Err(GraphError::Cycle(_)) => {
                return Err(PassError::invalid_param(
                    self.graph,
                    state.call,
                    format!("scope {} is not convex", self.scope),
                ));
            }
            Err(err) => return Err(err.into()),
        }

        let call = self.graph.try_node(state.call)?;
        let (num_inputs, num_outputs) = (call.num_inputs(), call.num_outputs());
        self.diagnostics.info(
            self.graph,
            state.call,
            format_args!("has {} inputs and {} outputs", num_inputs, num_outputs),
        );
        Ok(state.call)
    }

    fn mark_processed(&mut self, call: NodeId) -> Result<(), PassError> {
        self.graph
            .try_node_mut(call)?
            .desc_mut()
            .attrs
            .set(ATTR_NAME_SUBGRAPH_MULTI_DIMS_PROCESSED, true);
        Ok(())
    }

    fn single_subgraph(&self, call: NodeId) -> Result<GraphId, PassError> {
        match self.graph.node_subgraphs(call).as_slice() {
            [subgraph] => Ok(*subgraph),
            subgraphs => Err(PassError::invalid_param(
                self.graph,
                call,
                format!("expected 1 subgraph but found {}", subgraphs.len()),
            )),
        }
    }

    /// Check control edges which cross the scope boundary.
    ///
    /// Edges between a member and the root `NetOutput` are dropped when
    /// dynamic gears are configured. Any other crossing edge is an error.
    /// Edges with the scope's own dispatch node go away with that node.
    fn check_control_edges(
        &mut self,
        boundary: &ScopeBoundary,
        payload: &[NodeId],
        old_call: Option<NodeId>,
    ) -> Result<(), PassError> {
        let root = self.graph.root();
        let dynamic_config = self.ctx.is_dynamic_config();
        let members: FxHashSet<NodeId> = payload.iter().copied().collect();

        for &(src, dst) in &boundary.control {
            if Some(src) == old_call || Some(dst) == old_call {
                continue;
            }
            let (member, peer) = if members.contains(&src) {
                (src, dst)
            } else {
                (dst, src)
            };
            let peer_node = self.graph.try_node(peer)?;
            let droppable = dynamic_config
                && peer_node.is_type(op_types::NETOUTPUT)
                && peer_node.owner() == root;
            if !droppable {
                return Err(PassError::invalid_param(
                    self.graph,
                    member,
                    format!(
                        "control edge with \"{}\" crosses the boundary of scope {}",
                        peer_node.name(),
                        self.scope
                    ),
                ));
            }
            self.graph.remove_control_edge(src, dst)?;
            self.diagnostics.warn(
                self.graph,
                member,
                format_args!("dropped control edge with output node"),
            );
        }
        Ok(())
    }

    /// Create a dispatch node with an empty subgraph for a scope which has
    /// none.
    fn create_partitioned_call(&mut self, payload: &[NodeId]) -> Result<MergeState, PassError> {
        let root = self.graph.root();
        let name = unique_node_name(
            self.graph,
            root,
            &format!("scope_{}_partitioned_call", self.scope),
        );
        let call = self.graph.insert_node_before(
            root,
            OpDesc::new(&name, op_types::PARTITIONED_CALL),
            payload[0],
        )?;
        let subgraph_name = unique_graph_name(self.graph, &format!("{}_subgraph", name));
        let subgraph = self.graph.create_subgraph(call, &subgraph_name)?;
        Ok(MergeState::new(call, subgraph, None, IoNodes::default()))
    }

    /// Map the boundary nodes of an existing subgraph to anchors of its
    /// dispatch node.
    fn collect_io_nodes(&self, subgraph: GraphId) -> Result<IoNodes, PassError> {
        let mut io = IoNodes::default();
        for id in self.graph.direct_nodes(subgraph) {
            let node = self.graph.try_node(id)?;
            if node.is_type(op_types::DATA) {
                let Some(index) = parent_index(&node.desc().attrs) else {
                    return Err(PassError::invalid_param(
                        self.graph,
                        id,
                        "Data node has no parent index",
                    ));
                };
                if io.data.insert(index, id).is_some() {
                    return Err(PassError::invalid_param(
                        self.graph,
                        id,
                        format!("parent index {} is used by more than one Data node", index),
                    ));
                }
            } else if node.is_type(op_types::NETOUTPUT) {
                if io.net_output.replace(id).is_some() {
                    return Err(PassError::invalid_param(
                        self.graph,
                        id,
                        "subgraph has more than one NetOutput node",
                    ));
                }
                for (input, src) in node.connected_inputs() {
                    let index = node
                        .input_desc(input)
                        .and_then(|desc| parent_index(&desc.attrs))
                        .ok_or_else(|| {
                            PassError::invalid_param(
                                self.graph,
                                id,
                                format!("input {} has no parent index", input),
                            )
                        })?;
                    if io.outputs.insert(index, src).is_some() {
                        return Err(PassError::invalid_param(
                            self.graph,
                            id,
                            format!("parent index {} is used by more than one input", index),
                        ));
                    }
                }
            }
        }
        Ok(io)
    }

    /// Create the dispatch node which replaces `old_call`, move the
    /// subgraph to it and copy the connections of `old_call` with nodes
    /// outside the scope.
    fn create_new_partitioned_call(
        &mut self,
        old_call: NodeId,
        payload: &[NodeId],
    ) -> Result<MergeState, PassError> {
        let root = self.graph.root();
        let subgraph = self.single_subgraph(old_call)?;
        let io = self.collect_io_nodes(subgraph)?;
        let members: FxHashSet<NodeId> = payload.iter().copied().collect();

        let old = self.graph.try_node(old_call)?;
        let base = format!("{}_scope_{}", old.name(), self.scope);
        let mut desc = OpDesc::new(&base, op_types::PARTITIONED_CALL);
        desc.attrs = old.desc().attrs.clone();
        desc.attrs.remove(ATTR_NAME_SUBGRAPH_MULTI_DIMS_INDEX);
        let inputs: Vec<(usize, OutAnchor)> = old.connected_inputs().collect();
        let in_ctrl = old.in_control().to_vec();
        let out_ctrl = old.out_control().to_vec();
        let num_outputs = old.num_outputs();

        desc.name = unique_node_name(self.graph, root, &base);
        let call = self.graph.insert_node_before(root, desc, old_call)?;
        self.graph.reparent_subgraph(subgraph, call)?;
        let mut state = MergeState::new(call, subgraph, Some(old_call), io);

        for (index, src) in inputs {
            if members.contains(&src.node) {
                continue;
            }
            let Some(&data) = state.io.data.get(&index) else {
                continue;
            };
            let tensor = self
                .graph
                .try_node(old_call)?
                .input_desc(index)
                .cloned()
                .unwrap_or_default();
            apply_parent_tensor(self.graph, data, &tensor, Some(src))?;
            let new_index = self.graph.add_input_anchor(call, tensor)?;
            self.graph
                .add_data_edge(src, InAnchor::new(call, new_index))?;
            state.input_map.insert(index, new_index);

            // Members which read the same producer share this input.
            state.data_for_producer.entry(src).or_insert(data);
        }

        for index in 0..num_outputs {
            let old = self.graph.try_node(old_call)?;
            let external: Vec<InAnchor> = old
                .peer_ins(index)
                .iter()
                .copied()
                .filter(|dst| !members.contains(&dst.node))
                .collect();
            if external.is_empty() {
                continue;
            }
            if !state.io.outputs.contains_key(&index) {
                return Err(PassError::invalid_param(
                    self.graph,
                    old_call,
                    format!("output {} is used but not produced by the subgraph", index),
                ));
            }
            let tensor = old.output_desc(index).cloned().unwrap_or_default();
            let new_index = self.graph.add_output_anchor(call, tensor)?;
            for dst in external {
                self.graph
                    .remove_data_edge(OutAnchor::new(old_call, index), dst)?;
                self.graph
                    .add_data_edge(OutAnchor::new(call, new_index), dst)?;
            }
            state.output_map.insert(index, new_index);
        }

        for src in in_ctrl.into_iter().filter(|n| !members.contains(n)) {
            self.graph.add_control_edge(src, call)?;
        }
        for dst in out_ctrl.into_iter().filter(|n| !members.contains(n)) {
            self.graph.add_control_edge(call, dst)?;
        }

        Ok(state)
    }

    /// Move the payload of a scope into the subgraph and rewire the edges
    /// which cross the scope boundary through boundary nodes.
    fn merge_nodes_to_subgraph(
        &mut self,
        state: &mut MergeState,
        payload: &[NodeId],
        boundary: &ScopeBoundary,
    ) -> Result<(), PassError> {
        for &id in payload {
            self.graph.move_node(id, state.subgraph)?;
        }

        for &(dst, src) in &boundary.inputs {
            let new_src = if Some(src.node) == state.old_call {
                state.io.outputs.get(&src.index).copied().ok_or_else(|| {
                    PassError::invalid_param(
                        self.graph,
                        src.node,
                        format!("output {} is not produced by the subgraph", src.index),
                    )
                })?
            } else {
                self.data_for_external_producer(state, src)?
            };
            log::debug!(
                "Rewiring input {} of \"{}\" from \"{}\"",
                dst.index,
                self.graph.node_name(dst.node),
                self.graph.node_name(new_src.node)
            );
            self.graph.relink_input(dst, new_src)?;
        }

        for (src, consumers) in &boundary.outputs {
            for &dst in consumers {
                if Some(dst.node) == state.old_call {
                    self.route_to_subgraph_input(state, *src, dst)?;
                    continue;
                }
                let index = self.output_for_external_consumer(state, *src)?;
                self.graph.remove_data_edge(*src, dst)?;
                self.graph
                    .add_data_edge(OutAnchor::new(state.call, index), dst)?;
            }
        }
        Ok(())
    }

    /// Return the `Data` node which stands in for `src` in the subgraph,
    /// creating it and a matching dispatch input on first use.
    fn data_for_external_producer(
        &mut self,
        state: &mut MergeState,
        src: OutAnchor,
    ) -> Result<OutAnchor, PassError> {
        if let Some(&data) = state.data_for_producer.get(&src) {
            return Ok(OutAnchor::new(data, 0));
        }

        let producer = self.graph.try_node(src.node)?;
        let tensor = producer.output_desc(src.index).cloned().unwrap_or_default();
        let max_shape = max_shape_segment(&producer.desc().attrs, src.index);
        let base = format!("{}_{}_scope_data", producer.name(), src.index);
        let name = unique_node_name(self.graph, state.subgraph, &base);

        let mut desc = OpDesc::new(&name, op_types::DATA)
            .with_input(tensor.clone())
            .with_output(tensor.clone());
        if let Some(max_shape) = max_shape {
            desc.attrs.set(ATTR_NAME_OP_MAX_SHAPE, max_shape);
        }
        let data = self.graph.add_node(state.subgraph, desc)?;
        self.graph.add_graph_input(data)?;

        let index = self.graph.add_input_anchor(state.call, tensor)?;
        self.graph
            .add_data_edge(src, InAnchor::new(state.call, index))?;
        state.data_for_producer.insert(src, data);
        state.new_data.insert(data, index);
        Ok(OutAnchor::new(data, 0))
    }

    /// Replace an edge from a member into the old dispatch node with edges
    /// from the member to the consumers of the matching `Data` node.
    fn route_to_subgraph_input(
        &mut self,
        state: &MergeState,
        src: OutAnchor,
        dst: InAnchor,
    ) -> Result<(), PassError> {
        self.graph.remove_data_edge(src, dst)?;
        if let Some(&data) = state.io.data.get(&dst.index) {
            let consumers = self.graph.try_node(data)?.peer_ins(0).to_vec();
            for consumer in consumers {
                self.graph.relink_input(consumer, src)?;
            }
        }
        Ok(())
    }

    /// Return the dispatch output which exposes `src` outside the subgraph,
    /// creating it on first use.
    fn output_for_external_consumer(
        &mut self,
        state: &mut MergeState,
        src: OutAnchor,
    ) -> Result<usize, PassError> {
        if let Some(&index) = state.output_for_anchor.get(&src) {
            return Ok(index);
        }

        let net_output = match state.net_output {
            Some(id) => id,
            None => {
                let base = format!("{}_net_output", self.graph.graph_name(state.subgraph));
                let name = unique_node_name(self.graph, state.subgraph, &base);
                let id = self
                    .graph
                    .add_node(state.subgraph, OpDesc::new(&name, op_types::NETOUTPUT))?;
                state.net_output = Some(id);
                id
            }
        };

        let tensor = self
            .graph
            .try_node(src.node)?
            .output_desc(src.index)
            .cloned()
            .unwrap_or_default();
        let input = self.graph.add_input_anchor(net_output, tensor.clone())?;
        self.graph
            .add_data_edge(src, InAnchor::new(net_output, input))?;
        let index = self.graph.add_output_anchor(state.call, tensor)?;

        state.net_output_slots.insert(input, index);
        state.output_for_anchor.insert(src, index);
        Ok(index)
    }

    /// Point each `Data` node of the subgraph at its input of the new
    /// dispatch node. `Data` nodes with no such input are removed.
    fn set_parent_index_to_data(&mut self, state: &MergeState) -> Result<(), PassError> {
        for id in self.graph.find_nodes_of_type(state.subgraph, op_types::DATA) {
            let node = self.graph.try_node(id)?;
            let index = match state.new_data.get(&id) {
                Some(&index) => Some(index),
                None => parent_index(&node.desc().attrs)
                    .and_then(|old| state.input_map.get(&old).copied()),
            };

            match index {
                Some(index) => {
                    set_parent_index(&mut self.graph.try_node_mut(id)?.desc_mut().attrs, index);
                }
                None => {
                    if !node.peer_ins(0).is_empty() {
                        self.diagnostics.warn(
                            self.graph,
                            id,
                            format_args!("removing input with no producer outside the subgraph"),
                        );
                    }
                    log::debug!("Removing orphaned input \"{}\"", node.name());
                    self.graph.remove_node(id)?;
                }
            }
        }
        Ok(())
    }

    /// Rebuild the subgraph's `NetOutput` node so that input `i` feeds output
    /// `i` of the dispatch node.
    fn set_parent_index_to_net_output(&mut self, state: &mut MergeState) -> Result<(), PassError> {
        let Some(net_output) = state.net_output else {
            return Ok(());
        };

        let node = self.graph.try_node(net_output)?;
        let mut slots: Vec<(usize, OutAnchor, TensorDesc)> = Vec::new();
        for (input, src) in node.connected_inputs() {
            let tensor = node.input_desc(input).cloned().unwrap_or_default();
            let slot = match state.net_output_slots.get(&input) {
                Some(&slot) => Some(slot),
                None => parent_index(&tensor.attrs)
                    .and_then(|old| state.output_map.get(&old).copied()),
            };
            if let Some(slot) = slot {
                slots.push((slot, src, tensor));
            }
        }
        slots.sort_by_key(|(slot, ..)| *slot);

        let num_outputs = self.graph.try_node(state.call)?.num_outputs();
        let contiguous = slots.len() == num_outputs
            && slots.iter().enumerate().all(|(i, (slot, ..))| i == *slot);
        if !contiguous {
            return Err(PassError::invalid_param(
                self.graph,
                net_output,
                format!(
                    "subgraph outputs {:?} do not match the {} outputs of the dispatch node",
                    slots.iter().map(|(slot, ..)| *slot).collect::<Vec<_>>(),
                    num_outputs
                ),
            ));
        }

        let mut desc = OpDesc::new(node.name(), op_types::NETOUTPUT);
        desc.attrs = node.desc().attrs.clone();
        let in_ctrl = node.in_control().to_vec();
        for (slot, _, tensor) in &slots {
            let mut tensor = tensor.clone();
            set_parent_index(&mut tensor.attrs, *slot);
            desc.inputs.push(tensor);
        }

        self.graph.remove_node(net_output)?;
        let id = self.graph.add_node(state.subgraph, desc)?;
        for (input, (_, src, _)) in slots.into_iter().enumerate() {
            self.graph.add_data_edge(src, InAnchor::new(id, input))?;
        }
        for src in in_ctrl {
            self.graph.add_control_edge(src, id)?;
        }
        state.net_output = Some(id);
        Ok(())
    }

    /// Copy the input descriptors of a dispatch node onto the `Data` nodes of
    /// its subgraph.
    fn copy_partitioned_call_attr_to_data(&mut self, call: NodeId) -> Result<(), PassError> {
        let subgraph = self.single_subgraph(call)?;
        for data in self.graph.find_nodes_of_type(subgraph, op_types::DATA) {
            let Some(index) = parent_index(&self.graph.try_node(data)?.desc().attrs) else {
                return Err(PassError::invalid_param(
                    self.graph,
                    data,
                    "Data node has no parent index",
                ));
            };
            let call_node = self.graph.try_node(call)?;
            let Some(tensor) = call_node.input_desc(index).cloned() else {
                return Err(PassError::invalid_param(
                    self.graph,
                    data,
                    format!("parent index {} is out of range", index),
                ));
            };
            let producer = call_node.peer_out(index);
            apply_parent_tensor(self.graph, data, &tensor, producer)?;
        }
        Ok(())
    }
}

/// Give a subgraph `Data` node the shape and attributes of the dispatch
/// input it maps to.
///
/// Tensor attributes and max shape of the input's producer are copied too,
/// so that gears recorded on a user input reach the subgraph.
fn apply_parent_tensor(
    graph: &mut ComputeGraph,
    data: NodeId,
    tensor: &TensorDesc,
    producer: Option<OutAnchor>,
) -> Result<(), PassError> {
    let (producer_tensor, max_shape) = match producer {
        Some(src) => {
            let node = graph.try_node(src.node)?;
            (
                node.output_desc(src.index).cloned(),
                max_shape_segment(&node.desc().attrs, src.index),
            )
        }
        None => (None, None),
    };

    let desc = graph.try_node_mut(data)?.desc_mut();
    for dst in desc.inputs.iter_mut().chain(desc.outputs.iter_mut()) {
        dst.dtype = tensor.dtype;
        dst.set_shape(&tensor.shape);
        copy_tensor_attrs(tensor, dst);
        if let Some(producer_tensor) = &producer_tensor {
            copy_tensor_attrs(producer_tensor, dst);
        }
    }
    if let Some(max_shape) = max_shape {
        desc.attrs.set(ATTR_NAME_OP_MAX_SHAPE, max_shape);
    }
    Ok(())
}
