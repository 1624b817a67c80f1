use smallvec::SmallVec;

use super::attr::{AttrMap, AttrValue};
use super::{GraphId, NodeId};

/// Operator type names with special meaning to the graph passes.
pub mod op_types {
    pub const DATA: &str = "Data";
    pub const NETOUTPUT: &str = "NetOutput";
    pub const CONSTANT: &str = "Const";
    pub const QUEUE_DATA: &str = "QueueData";
    pub const PARTITIONED_CALL: &str = "PartitionedCall";
    pub const CASE: &str = "Case";
    pub const GET_SHAPE: &str = "GetShape";
    pub const CONCAT: &str = "Concat";
    pub const MAP_INDEX: &str = "MapIndex";
}

/// Sentinel for a dimension whose size is unknown at compile time.
pub const UNKNOWN_DIM: i64 = -1;

/// Sentinel shape entry for a tensor whose rank is unknown.
pub const UNKNOWN_RANK: i64 = -2;

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DataType {
    Float,
    Float16,
    Int32,
    Int64,
    Bool,
    #[default]
    Undefined,
}

/// Describes a tensor flowing through an input or output anchor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TensorDesc {
    pub dtype: DataType,
    pub shape: Vec<i64>,
    pub origin_shape: Vec<i64>,

    /// `(min, max)` bounds for each dimension of `shape`. Empty if the
    /// shape is static or no bounds are known.
    pub shape_range: Vec<(i64, i64)>,
    pub origin_shape_range: Vec<(i64, i64)>,

    /// Size of the tensor in bytes, computed for static shapes. Zero means
    /// the size must be recomputed.
    pub size: i64,

    pub attrs: AttrMap,
}

impl TensorDesc {
    /// Create a descriptor whose shape and origin shape are `shape`.
    pub fn new(dtype: DataType, shape: &[i64]) -> TensorDesc {
        TensorDesc {
            dtype,
            shape: shape.to_vec(),
            origin_shape: shape.to_vec(),
            ..Default::default()
        }
    }

    /// Create a 1D int32 descriptor, as used for shape tensors.
    pub fn int32_vector(len: usize) -> TensorDesc {
        TensorDesc::new(DataType::Int32, &[len as i64])
    }

    /// Return true if any dimension, or the rank, is unknown.
    pub fn is_unknown_shape(&self) -> bool {
        self.shape.iter().any(|&d| d < 0)
    }

    /// Set the shape and origin shape.
    pub fn set_shape(&mut self, shape: &[i64]) {
        self.shape = shape.to_vec();
        self.origin_shape = shape.to_vec();
    }
}

/// Operator description: everything about a node except its connectivity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OpDesc {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    pub attrs: AttrMap,

    /// Names of subgraphs embedded in this node, in instance order.
    pub subgraph_names: Vec<String>,
}

impl OpDesc {
    pub fn new(name: &str, op_type: &str) -> OpDesc {
        OpDesc {
            name: name.to_string(),
            op_type: op_type.to_string(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, desc: TensorDesc) -> OpDesc {
        self.inputs.push(desc);
        self
    }

    pub fn with_output(mut self, desc: TensorDesc) -> OpDesc {
        self.outputs.push(desc);
        self
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<AttrValue>) -> OpDesc {
        self.attrs.set(name, value);
        self
    }
}

/// Output data anchor: output `index` of `node`.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OutAnchor {
    pub node: NodeId,
    pub index: usize,
}

/// Input data anchor: input `index` of `node`.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InAnchor {
    pub node: NodeId,
    pub index: usize,
}

impl OutAnchor {
    pub fn new(node: NodeId, index: usize) -> OutAnchor {
        OutAnchor { node, index }
    }
}

impl InAnchor {
    pub fn new(node: NodeId, index: usize) -> InAnchor {
        InAnchor { node, index }
    }
}

/// A node in a [`ComputeGraph`](super::ComputeGraph).
///
/// Connectivity is stored on both ends of each edge. All updates go through
/// graph-level methods, which keep the two ends consistent.
#[derive(Clone, Debug)]
pub struct Node {
    pub(super) desc: OpDesc,
    pub(super) owner: GraphId,

    /// Producer of each input anchor. A data input has at most one producer.
    pub(super) in_data: Vec<Option<OutAnchor>>,

    /// Consumers of each output anchor.
    pub(super) out_data: Vec<SmallVec<[InAnchor; 2]>>,

    pub(super) in_ctrl: SmallVec<[NodeId; 2]>,
    pub(super) out_ctrl: SmallVec<[NodeId; 2]>,
}

impl Node {
    pub(super) fn new(desc: OpDesc, owner: GraphId) -> Node {
        let in_data = vec![None; desc.inputs.len()];
        let out_data = vec![SmallVec::new(); desc.outputs.len()];
        Node {
            desc,
            owner,
            in_data,
            out_data,
            in_ctrl: SmallVec::new(),
            out_ctrl: SmallVec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn op_type(&self) -> &str {
        &self.desc.op_type
    }

    pub fn is_type(&self, op_type: &str) -> bool {
        self.desc.op_type == op_type
    }

    /// Return true if this is a `Data` or `NetOutput` node.
    pub fn is_boundary(&self) -> bool {
        self.is_type(op_types::DATA) || self.is_type(op_types::NETOUTPUT)
    }

    pub fn desc(&self) -> &OpDesc {
        &self.desc
    }

    /// Return a mutable reference to the operator description.
    ///
    /// Adding or removing tensor descriptors through this reference would
    /// desynchronize anchors, so anchor counts are changed only through
    /// graph methods such as
    /// [`add_input_anchor`](super::ComputeGraph::add_input_anchor).
    pub fn desc_mut(&mut self) -> &mut OpDesc {
        &mut self.desc
    }

    /// Graph which currently owns this node.
    pub fn owner(&self) -> GraphId {
        self.owner
    }

    pub fn num_inputs(&self) -> usize {
        self.in_data.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.out_data.len()
    }

    pub fn input_desc(&self, index: usize) -> Option<&TensorDesc> {
        self.desc.inputs.get(index)
    }

    pub fn output_desc(&self, index: usize) -> Option<&TensorDesc> {
        self.desc.outputs.get(index)
    }

    /// Producer of input `index`, if connected.
    pub fn peer_out(&self, index: usize) -> Option<OutAnchor> {
        self.in_data.get(index).copied().flatten()
    }

    /// Consumers of output `index`.
    pub fn peer_ins(&self, index: usize) -> &[InAnchor] {
        self.out_data.get(index).map(|c| c.as_slice()).unwrap_or(&[])
    }

    pub fn in_control(&self) -> &[NodeId] {
        &self.in_ctrl
    }

    pub fn out_control(&self) -> &[NodeId] {
        &self.out_ctrl
    }

    /// Iterate over `(input_index, producer)` for connected inputs.
    pub fn connected_inputs(&self) -> impl Iterator<Item = (usize, OutAnchor)> + '_ {
        self.in_data
            .iter()
            .enumerate()
            .filter_map(|(i, src)| src.map(|src| (i, src)))
    }

    /// Return true if the node has no data or control edges.
    pub fn is_isolated(&self) -> bool {
        self.in_data.iter().all(|p| p.is_none())
            && self.out_data.iter().all(|c| c.is_empty())
            && self.in_ctrl.is_empty()
            && self.out_ctrl.is_empty()
    }
}
