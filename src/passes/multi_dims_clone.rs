use rustc_hash::FxHashMap;

use super::{unique_graph_name, unique_node_name, AttrResultExt, Diagnostics};
use super::{GraphPass, PassError, PassStatus};
use crate::context::CompileContext;
use crate::graph::attr::{
    parent_index, pred_value_attr_name, set_parent_index, TensorData, TensorValue,
    ATTR_NAME_BATCH_NUM, ATTR_NAME_MBATCH_ORIGIN_INPUT_DIMS, ATTR_NAME_N,
    ATTR_NAME_SUBGRAPH_MULTI_DIMS_CLONED, ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_DIMS,
    ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_SHAPE, ATTR_NAME_SUBGRAPH_MULTI_DIMS_PROCESSED,
    ATTR_NAME_SUBGRAPH_REAL_DIMS, ATTR_NAME_WEIGHTS,
};
use crate::graph::{
    op_types, ComputeGraph, DataType, GraphError, GraphId, InAnchor, NodeId, OpDesc, OutAnchor,
    TensorDesc, UNKNOWN_DIM, UNKNOWN_RANK,
};
use crate::multi_batch_options::parse_indexed_dims;

/// Postfix of the node and graph names of gear `index`.
fn gear_postfix(index: usize) -> String {
    format!("_ascend_mbatch_batch_{}", index)
}

/// Expands each processed `PartitionedCall` subgraph into one clone per
/// gear, behind a `Case` node which selects a gear from the runtime shapes
/// of the subgraph inputs.
pub struct SubgraphMultiDimsClonePass {
    diagnostics: Diagnostics,
}

impl SubgraphMultiDimsClonePass {
    pub fn new() -> Self {
        Self::with_diagnostics(Diagnostics::from_env())
    }

    pub fn with_diagnostics(diagnostics: Diagnostics) -> Self {
        SubgraphMultiDimsClonePass { diagnostics }
    }
}

impl Default for SubgraphMultiDimsClonePass {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphPass for SubgraphMultiDimsClonePass {
    fn name(&self) -> &str {
        "SubgraphMultiDimsClonePass"
    }

    fn run(&self, graph: &mut ComputeGraph, _ctx: &CompileContext) -> Result<PassStatus, PassError> {
        let calls: Vec<NodeId> = graph
            .direct_nodes(graph.root())
            .into_iter()
            .filter(|&id| {
                graph.node(id).is_some_and(|n| {
                    let attrs = &n.desc().attrs;
                    attrs.get_bool(ATTR_NAME_SUBGRAPH_MULTI_DIMS_PROCESSED) == Some(true)
                        && attrs.get_bool(ATTR_NAME_SUBGRAPH_MULTI_DIMS_CLONED) != Some(true)
                })
            })
            .collect();

        let mut status = PassStatus::Unchanged;
        for call in calls {
            let subgraph = match graph.node_subgraphs(call).as_slice() {
                [subgraph] => *subgraph,
                subgraphs => {
                    return Err(PassError::invalid_param(
                        graph,
                        call,
                        format!("expected 1 subgraph but found {}", subgraphs.len()),
                    ));
                }
            };
            let cloner = GearCloner::new(graph, &self.diagnostics, call, subgraph);
            status = status.merge(cloner.run()?);
        }
        Ok(status)
    }
}

/// Expands the subgraph of one dispatch node into gears.
struct GearCloner<'a> {
    graph: &'a mut ComputeGraph,
    diagnostics: &'a Diagnostics,

    /// `PartitionedCall` which owns `subgraph`.
    call: NodeId,
    subgraph: GraphId,

    /// `Data` nodes of the subgraph, ordered by parent index.
    data_nodes: Vec<NodeId>,

    /// `Const` and `QueueData` nodes of the subgraph.
    const_nodes: Vec<NodeId>,
    net_output: Option<NodeId>,

    /// Flattened per-gear dims table of each dynamic `Data` node.
    node_to_multi_dims: FxHashMap<NodeId, Vec<i64>>,

    /// Full dims of all dynamic `Data` nodes, one row per gear.
    merged_multi_dims: Vec<Vec<i64>>,

    /// Values of the unknown dims only, one row per gear.
    changed_dims: Vec<Vec<i64>>,
}

impl<'a> GearCloner<'a> {
    fn new(
        graph: &'a mut ComputeGraph,
        diagnostics: &'a Diagnostics,
        call: NodeId,
        subgraph: GraphId,
    ) -> Self {
        GearCloner {
            graph,
            diagnostics,
            call,
            subgraph,
            data_nodes: Vec::new(),
            const_nodes: Vec::new(),
            net_output: None,
            node_to_multi_dims: FxHashMap::default(),
            merged_multi_dims: Vec::new(),
            changed_dims: Vec::new(),
        }
    }

    fn gear_count(&self) -> usize {
        self.merged_multi_dims.len()
    }

    fn run(mut self) -> Result<PassStatus, PassError> {
        self.collect()?;
        if !self.merge_data_dyn_dims()? {
            log::info!(
                "Subgraph \"{}\" has no dynamic dims",
                self.graph.graph_name(self.subgraph)
            );
            return Ok(PassStatus::Unchanged);
        }

        let (body, case) = self.create_ori_graph()?;
        self.create_subgraphs(case)?;

        self.graph.replace_subgraph(self.subgraph, body)?;
        self.graph.remove_graph(self.subgraph)?;
        self.graph
            .try_node_mut(self.call)?
            .desc_mut()
            .attrs
            .set(ATTR_NAME_SUBGRAPH_MULTI_DIMS_CLONED, true);

        self.diagnostics.info(
            self.graph,
            self.call,
            format_args!("expanded into {} gears", self.gear_count()),
        );
        Ok(PassStatus::Changed)
    }

    /// Gather the boundary and constant nodes of the subgraph.
    fn collect(&mut self) -> Result<(), PassError> {
        let mut data = Vec::new();
        for id in self.graph.direct_nodes(self.subgraph) {
            let node = self.graph.try_node(id)?;
            match node.op_type() {
                op_types::DATA => {
                    let Some(index) = parent_index(&node.desc().attrs) else {
                        return Err(PassError::invalid_param(
                            self.graph,
                            id,
                            "Data node has no parent index",
                        ));
                    };
                    data.push((index, id));
                }
                op_types::CONSTANT | op_types::QUEUE_DATA => self.const_nodes.push(id),
                op_types::NETOUTPUT => {
                    if self.net_output.replace(id).is_some() {
                        return Err(PassError::invalid_param(
                            self.graph,
                            id,
                            "subgraph has more than one NetOutput node",
                        ));
                    }
                }
                _ => {}
            }
        }

        if data.is_empty() {
            return Err(PassError::invalid_graph(
                self.graph,
                self.subgraph,
                "subgraph has no Data nodes",
            ));
        }
        data.sort_by_key(|(index, _)| *index);
        if let Some((pos, &(index, id))) = data
            .iter()
            .enumerate()
            .find(|(pos, (index, _))| pos != index)
        {
            return Err(PassError::invalid_param(
                self.graph,
                id,
                format!("parent index {} does not match input position {}", index, pos),
            ));
        }
        self.data_nodes = data.into_iter().map(|(_, id)| id).collect();
        Ok(())
    }

    /// Build the per-gear dims tables from the dims recorded on each dynamic
    /// `Data` node.
    ///
    /// Returns false if no `Data` node has dynamic dims.
    fn merge_data_dyn_dims(&mut self) -> Result<bool, PassError> {
        let mut gear_count: Option<usize> = None;

        for &id in &self.data_nodes {
            let node = self.graph.try_node(id)?;
            let Some(tensor) = node.input_desc(0) else {
                continue;
            };
            if !tensor.is_unknown_shape() {
                continue;
            }
            if tensor.shape.contains(&UNKNOWN_RANK) {
                return Err(PassError::invalid_param(
                    self.graph,
                    id,
                    "input with unknown rank cannot be split into gears",
                ));
            }
            if !tensor
                .attrs
                .contains(ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_DIMS)
            {
                self.diagnostics.warn(
                    self.graph,
                    id,
                    format_args!("input has an unknown shape but no gears"),
                );
                continue;
            }
            let dims = tensor
                .attrs
                .try_get_list_int(ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_DIMS)
                .for_node(self.graph, id)?;

            let rank = tensor.shape.len();
            if rank == 0 || dims.len() % rank != 0 {
                return Err(PassError::invalid_param(
                    self.graph,
                    id,
                    format!(
                        "dims table of length {} does not match input rank {}",
                        dims.len(),
                        rank
                    ),
                ));
            }
            let count = dims.len() / rank;
            match gear_count {
                Some(expected) if expected != count => {
                    return Err(PassError::invalid_param(
                        self.graph,
                        id,
                        format!(
                            "input has {} gears but other inputs have {}",
                            count, expected
                        ),
                    ));
                }
                _ => gear_count = Some(count),
            }

            if let Some(shapes) = tensor
                .attrs
                .get_list_str(ATTR_NAME_SUBGRAPH_MULTI_DIMS_INPUT_SHAPE)
            {
                if shapes.len() != count {
                    return Err(PassError::invalid_param(
                        self.graph,
                        id,
                        format!(
                            "input has {} gear shapes but a dims table for {} gears",
                            shapes.len(),
                            count
                        ),
                    ));
                }
                for (gear, shape) in shapes.iter().enumerate() {
                    let (_, gear_dims) = parse_indexed_dims(shape)?;
                    if gear_dims != dims[rank * gear..rank * (gear + 1)] {
                        return Err(PassError::invalid_param(
                            self.graph,
                            id,
                            format!(
                                "gear {} shape \"{}\" does not match the dims table",
                                gear, shape
                            ),
                        ));
                    }
                }
            }
            self.node_to_multi_dims.insert(id, dims.to_vec());
        }

        let Some(gear_count) = gear_count else {
            return Ok(false);
        };
        if gear_count == 0 {
            return Ok(false);
        }

        let mut merged = vec![Vec::new(); gear_count];
        let mut changed = vec![Vec::new(); gear_count];
        for &id in &self.data_nodes {
            let Some(dims) = self.node_to_multi_dims.get(&id) else {
                continue;
            };
            let shape = self
                .graph
                .try_node(id)?
                .input_desc(0)
                .map(|t| t.shape.as_slice())
                .unwrap_or(&[]);
            let rank = shape.len();
            for gear in 0..gear_count {
                let row = &dims[rank * gear..rank * (gear + 1)];
                merged[gear].extend_from_slice(row);
                changed[gear].extend(
                    row.iter()
                        .zip(shape)
                        .filter(|(_, &dim)| dim == UNKNOWN_DIM)
                        .map(|(&value, _)| value),
                );
            }
        }
        self.merged_multi_dims = merged;
        self.changed_dims = changed;
        Ok(true)
    }

    /// Build the body which replaces the subgraph: copies of the inputs, the
    /// gear selection nodes and the `Case` node. Constants of the subgraph
    /// become inputs of the `Case` node.
    ///
    /// Returns the detached body and its `Case` node.
    fn create_ori_graph(&mut self) -> Result<(GraphId, NodeId), PassError> {
        let base = format!("{}_multi_dims", self.graph.graph_name(self.subgraph));
        let body_name = unique_graph_name(self.graph, &base);
        let body = self.graph.new_detached_graph(&body_name)?;

        let data_copies = self.create_input_nodes(body)?;
        let const_copies = self.create_const_nodes(body)?;
        let shapes = self.create_get_shape_nodes(body, &data_copies)?;
        let concat = self.create_concat_node(body, &shapes)?;
        let index_const = self.create_index_const_node(body)?;
        let map_index = self.create_map_index_node(body, concat, index_const)?;
        let case = self.create_case_node(body, map_index, &data_copies, &const_copies)?;
        self.retype_const_nodes()?;
        self.create_output_node(body, case)?;
        Ok((body, case))
    }

    fn copy_node(&mut self, body: GraphId, id: NodeId) -> Result<NodeId, PassError> {
        let mut desc = self.graph.try_node(id)?.desc().clone();
        desc.subgraph_names.clear();
        desc.name = unique_node_name(self.graph, body, &desc.name);
        Ok(self.graph.add_node(body, desc)?)
    }

    fn create_input_nodes(&mut self, body: GraphId) -> Result<Vec<NodeId>, PassError> {
        let mut copies = Vec::with_capacity(self.data_nodes.len());
        for id in self.data_nodes.clone() {
            let copy = self.copy_node(body, id)?;
            self.graph.add_graph_input(copy)?;
            copies.push(copy);
        }
        Ok(copies)
    }

    fn create_const_nodes(&mut self, body: GraphId) -> Result<Vec<NodeId>, PassError> {
        let mut copies = Vec::with_capacity(self.const_nodes.len());
        for id in self.const_nodes.clone() {
            if self.graph.try_node(id)?.num_outputs() == 0 {
                return Err(PassError::invalid_param(self.graph, id, "constant has no output"));
            }
            copies.push(self.copy_node(body, id)?);
        }
        Ok(copies)
    }

    /// Add a `GetShape` node for each dynamic input. Returns each node's
    /// output and rank, in input order.
    fn create_get_shape_nodes(
        &mut self,
        body: GraphId,
        data_copies: &[NodeId],
    ) -> Result<Vec<(OutAnchor, usize)>, PassError> {
        let mut shapes = Vec::new();
        for (&id, &copy) in self.data_nodes.iter().zip(data_copies) {
            if !self.node_to_multi_dims.contains_key(&id) {
                continue;
            }
            let node = self.graph.try_node(copy)?;
            let tensor = node.output_desc(0).cloned().unwrap_or_default();
            let rank = tensor.shape.len();
            let name = unique_node_name(
                self.graph,
                body,
                &format!("ascend_mbatch_get_shape_{}", node.name()),
            );
            let desc = OpDesc::new(&name, op_types::GET_SHAPE)
                .with_input(tensor)
                .with_output(TensorDesc::int32_vector(rank));
            let get_shape = self.graph.add_node(body, desc)?;
            self.graph
                .add_data_edge(OutAnchor::new(copy, 0), InAnchor::new(get_shape, 0))?;
            shapes.push((OutAnchor::new(get_shape, 0), rank));
        }
        Ok(shapes)
    }

    /// Concatenate the runtime shapes of the dynamic inputs.
    fn create_concat_node(
        &mut self,
        body: GraphId,
        shapes: &[(OutAnchor, usize)],
    ) -> Result<NodeId, PassError> {
        let axis_name = unique_node_name(self.graph, body, "ascend_mbatch_shape_concat_dim");
        let axis = self.graph.add_node(
            body,
            OpDesc::new(&axis_name, op_types::CONSTANT)
                .with_output(TensorDesc::new(DataType::Int32, &[]))
                .with_attr(ATTR_NAME_WEIGHTS, TensorValue::scalar_i32(0)),
        )?;

        let total: usize = shapes.iter().map(|(_, rank)| rank).sum();
        let name = unique_node_name(self.graph, body, "ascend_mbatch_shape_concat");
        let mut desc = OpDesc::new(&name, op_types::CONCAT)
            .with_input(TensorDesc::new(DataType::Int32, &[]))
            .with_output(TensorDesc::int32_vector(total))
            .with_attr(ATTR_NAME_N, shapes.len() as i64);
        for &(_, rank) in shapes {
            desc = desc.with_input(TensorDesc::int32_vector(rank));
        }
        let concat = self.graph.add_node(body, desc)?;

        self.graph
            .add_data_edge(OutAnchor::new(axis, 0), InAnchor::new(concat, 0))?;
        for (index, &(src, _)) in shapes.iter().enumerate() {
            self.graph
                .add_data_edge(src, InAnchor::new(concat, index + 1))?;
        }
        Ok(concat)
    }

    /// Add the lookup table of gear dims, one row per gear.
    fn create_index_const_node(&mut self, body: GraphId) -> Result<NodeId, PassError> {
        let rows = self.gear_count();
        let cols = self.merged_multi_dims.first().map(|r| r.len()).unwrap_or(0);
        let table = self
            .merged_multi_dims
            .iter()
            .flatten()
            .map(|&dim| i32::try_from(dim))
            .collect::<Result<Vec<i32>, _>>()
            .map_err(|_| PassError::invalid_param(self.graph, self.call, "gear dim exceeds int32"))?;

        let name = unique_node_name(self.graph, body, "ascend_mbatch_shape_data_index");
        let desc = OpDesc::new(&name, op_types::CONSTANT)
            .with_output(TensorDesc::new(DataType::Int32, &[rows as i64, cols as i64]))
            .with_attr(
                ATTR_NAME_WEIGHTS,
                TensorValue::new(&[rows, cols], TensorData::Int32(table)),
            );
        Ok(self.graph.add_node(body, desc)?)
    }

    /// Add the node which maps the observed shape to a gear index.
    fn create_map_index_node(
        &mut self,
        body: GraphId,
        concat: NodeId,
        index_const: NodeId,
    ) -> Result<NodeId, PassError> {
        let shape_tensor = self
            .graph
            .try_node(concat)?
            .output_desc(0)
            .cloned()
            .unwrap_or_default();
        let table_tensor = self
            .graph
            .try_node(index_const)?
            .output_desc(0)
            .cloned()
            .unwrap_or_default();

        let name = unique_node_name(self.graph, body, "ascend_mbatch_shape_mapindex");
        let desc = OpDesc::new(&name, op_types::MAP_INDEX)
            .with_input(shape_tensor)
            .with_input(table_tensor)
            .with_output(TensorDesc::new(DataType::Int32, &[]));
        let map_index = self.graph.add_node(body, desc)?;
        self.graph
            .add_data_edge(OutAnchor::new(concat, 0), InAnchor::new(map_index, 0))?;
        self.graph
            .add_data_edge(OutAnchor::new(index_const, 0), InAnchor::new(map_index, 1))?;
        Ok(map_index)
    }

    /// Add the `Case` node. Input 0 is the gear index, followed by the
    /// inputs and then the constants of the subgraph.
    fn create_case_node(
        &mut self,
        body: GraphId,
        map_index: NodeId,
        data_copies: &[NodeId],
        const_copies: &[NodeId],
    ) -> Result<NodeId, PassError> {
        let name = unique_node_name(self.graph, body, "ascend_mbatch_shape_case");
        let mut desc = OpDesc::new(&name, op_types::CASE)
            .with_input(TensorDesc::new(DataType::Int32, &[]))
            .with_attr(ATTR_NAME_BATCH_NUM, self.gear_count() as i64);
        for (gear, dims) in self.merged_multi_dims.iter().enumerate() {
            desc.attrs.set(&pred_value_attr_name(gear), dims.clone());
        }

        let sources: Vec<NodeId> = data_copies.iter().chain(const_copies).copied().collect();
        for &src in &sources {
            let tensor = self
                .graph
                .try_node(src)?
                .output_desc(0)
                .cloned()
                .unwrap_or_default();
            desc.inputs.push(tensor);
        }
        if let Some(net_output) = self.net_output {
            desc.outputs = self.graph.try_node(net_output)?.desc().inputs.clone();
        }

        let case = self.graph.add_node(body, desc)?;
        self.graph
            .add_data_edge(OutAnchor::new(map_index, 0), InAnchor::new(case, 0))?;
        for (index, &src) in sources.iter().enumerate() {
            self.graph
                .add_data_edge(OutAnchor::new(src, 0), InAnchor::new(case, index + 1))?;
        }
        Ok(case)
    }

    /// Turn the constants of the subgraph into inputs which receive their
    /// values from the `Case` node.
    fn retype_const_nodes(&mut self) -> Result<(), PassError> {
        let data_count = self.data_nodes.len();
        for (index, id) in self.const_nodes.clone().into_iter().enumerate() {
            let node = self.graph.try_node_mut(id)?;
            let tensor = node.output_desc(0).cloned().unwrap_or_default();
            let desc = node.desc_mut();
            desc.op_type = op_types::DATA.to_string();
            desc.attrs.remove(ATTR_NAME_WEIGHTS);
            set_parent_index(&mut desc.attrs, data_count + index);

            self.graph.add_input_anchor(id, tensor)?;
            self.graph.add_graph_input(id)?;
        }
        Ok(())
    }

    /// Add the body's `NetOutput`, fed by the outputs of the `Case` node.
    fn create_output_node(&mut self, body: GraphId, case: NodeId) -> Result<(), PassError> {
        let Some(net_output) = self.net_output else {
            return Ok(());
        };
        let node = self.graph.try_node(net_output)?;
        let name = unique_node_name(self.graph, body, node.name());
        let mut desc = OpDesc::new(&name, op_types::NETOUTPUT);
        desc.attrs = node.desc().attrs.clone();
        for (slot, tensor) in node.desc().inputs.iter().enumerate() {
            let mut tensor = tensor.clone();
            set_parent_index(&mut tensor.attrs, slot);
            desc.inputs.push(tensor);
        }

        let num_outputs = desc.inputs.len();
        let output = self.graph.add_node(body, desc)?;
        for slot in 0..num_outputs {
            self.graph
                .add_data_edge(OutAnchor::new(case, slot), InAnchor::new(output, slot))?;
        }
        Ok(())
    }

    /// Clone the subgraph once per gear and attach the clones to `case`.
    fn create_subgraphs(&mut self, case: NodeId) -> Result<(), PassError> {
        let inputs = self.graph.find_nodes_of_type(self.subgraph, op_types::DATA);
        for gear in 0..self.gear_count() {
            let cloned = self.graph.clone_graph(self.subgraph, &gear_postfix(gear))?;
            self.graph
                .graph_mut(cloned.graph)
                .ok_or(GraphError::InvalidGraphId(cloned.graph))?
                .attrs_mut()
                .set(ATTR_NAME_SUBGRAPH_REAL_DIMS, self.changed_dims[gear].clone());
            self.graph.attach_subgraph(case, cloned.graph)?;

            for &id in &inputs {
                let copy = cloned
                    .node_map
                    .get(&id)
                    .copied()
                    .ok_or(GraphError::InvalidNodeId(id))?;
                self.update_subgraph_data(id, copy, gear)?;
            }
            log::debug!(
                "Created gear {} subgraph \"{}\"",
                gear,
                self.graph.graph_name(cloned.graph)
            );
        }
        Ok(())
    }

    /// Apply the shape of `gear` to the clone of an input.
    ///
    /// The parent index moves up by one since input 0 of the `Case` node is
    /// the gear index.
    fn update_subgraph_data(
        &mut self,
        original: NodeId,
        copy: NodeId,
        gear: usize,
    ) -> Result<(), PassError> {
        let node = self.graph.try_node(copy)?;
        let Some(index) = parent_index(&node.desc().attrs) else {
            return Err(PassError::invalid_param(
                self.graph,
                copy,
                "Data node has no parent index",
            ));
        };
        let tensor = node.input_desc(0).cloned().unwrap_or_default();

        let gear_shape = match self.node_to_multi_dims.get(&original) {
            Some(dims) if tensor.is_unknown_shape() => {
                let rank = tensor.shape.len();
                let shape = dims.get(rank * gear..rank * (gear + 1)).ok_or_else(|| {
                    PassError::invalid_param(
                        self.graph,
                        copy,
                        format!("dims table has no entry for gear {}", gear),
                    )
                })?;
                Some(shape.to_vec())
            }
            _ => None,
        };

        let desc = self.graph.try_node_mut(copy)?.desc_mut();
        set_parent_index(&mut desc.attrs, index + 1);
        desc.attrs
            .set(ATTR_NAME_MBATCH_ORIGIN_INPUT_DIMS, tensor.shape.clone());
        if let Some(shape) = gear_shape {
            for tensor in desc.inputs.iter_mut().chain(desc.outputs.iter_mut()) {
                tensor.set_shape(&shape);
                tensor.shape_range.clear();
                tensor.origin_shape_range.clear();
            }
        }
        Ok(())
    }
}
