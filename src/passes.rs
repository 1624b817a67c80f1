//! Graph passes which rewrite a dynamic-shape graph into gear dispatch form.
//!
//! [`CreateSubgraphWithScopePass`] extracts each scope of nodes into a
//! subgraph behind a `PartitionedCall` node. [`SubgraphMultiDimsClonePass`]
//! then expands each extracted subgraph into one statically-shaped clone per
//! gear, selected at runtime by a `Case` node.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::context::CompileContext;
use crate::graph::{AttrError, ComputeGraph, GraphError, GraphId, NodeId};
use crate::multi_batch_options::ParseError;

mod diagnostics;
mod multi_dims_clone;
mod scope;
mod subgraph_with_scope;


pub use diagnostics::{DiagnosticLevel, Diagnostics};
pub use multi_dims_clone::SubgraphMultiDimsClonePass;
pub use scope::{
    collect_scope_nodes_by_index, is_graph_multi_batch_condition, scope_index, ScopeBoundary,
    ScopeMap,
};
pub use subgraph_with_scope::CreateSubgraphWithScopePass;

/// Errors that occur while running a graph pass.
///
/// A pass which fails may leave the graph partially rewritten. Callers are
/// expected to abandon the graph.
#[derive(Clone, Debug, PartialEq)]
pub enum PassError {
    /// A compile option could not be parsed. Reported before the graph is
    /// modified.
    InvalidArgument(ParseError),

    /// The graph violates a structural requirement of the pass.
    InvalidParam {
        graph: String,
        node: String,
        message: String,
    },

    /// A graph primitive failed.
    Graph(GraphError),
}

impl PassError {
    /// Create an [`InvalidParam`](PassError::InvalidParam) error for `node`.
    pub fn invalid_param(graph: &ComputeGraph, node: NodeId, message: impl Into<String>) -> Self {
        let graph_name = graph
            .node(node)
            .map(|n| graph.graph_name(n.owner()).to_string())
            .unwrap_or_default();
        PassError::InvalidParam {
            graph: graph_name,
            node: graph.node_name(node),
            message: message.into(),
        }
    }

    /// Create an [`InvalidParam`](PassError::InvalidParam) error for a graph
    /// as a whole.
    pub fn invalid_graph(graph: &ComputeGraph, id: GraphId, message: impl Into<String>) -> Self {
        PassError::InvalidParam {
            graph: graph.graph_name(id).to_string(),
            node: String::new(),
            message: message.into(),
        }
    }
}

impl Display for PassError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::InvalidArgument(err) => write!(f, "invalid option: {}", err),
            Self::InvalidParam {
                graph,
                node,
                message,
            } if node.is_empty() => write!(f, "graph \"{}\": {}", graph, message),
            Self::InvalidParam {
                graph,
                node,
                message,
            } => write!(f, "node \"{}\" in graph \"{}\": {}", node, graph, message),
            Self::Graph(err) => write!(f, "graph update failed: {}", err),
        }
    }
}

impl Error for PassError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidArgument(err) => Some(err),
            Self::InvalidParam { .. } => None,
            Self::Graph(err) => Some(err),
        }
    }
}

impl From<ParseError> for PassError {
    fn from(val: ParseError) -> PassError {
        PassError::InvalidArgument(val)
    }
}

impl From<GraphError> for PassError {
    fn from(val: GraphError) -> PassError {
        PassError::Graph(val)
    }
}

/// Attach node context to an attribute lookup failure.
pub(crate) trait AttrResultExt<T> {
    fn for_node(self, graph: &ComputeGraph, node: NodeId) -> Result<T, PassError>;
}

impl<T> AttrResultExt<T> for Result<T, AttrError> {
    fn for_node(self, graph: &ComputeGraph, node: NodeId) -> Result<T, PassError> {
        self.map_err(|err| PassError::invalid_param(graph, node, err.to_string()))
    }
}

/// Return `base`, or `base` with the smallest numeric suffix which makes it
/// unique among the direct nodes of `graph_id`.
pub(crate) fn unique_node_name(graph: &ComputeGraph, graph_id: GraphId, base: &str) -> String {
    let taken = |name: &str| graph.find_node(graph_id, name).is_some();
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{}_{}", base, i))
        .find(|name| !taken(name.as_str()))
        .unwrap_or_default()
}

/// Return `base`, or `base` with the smallest numeric suffix which makes it
/// unique among all graphs.
pub(crate) fn unique_graph_name(graph: &ComputeGraph, base: &str) -> String {
    let taken = |name: &str| graph.find_graph(name).is_some();
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{}_{}", base, i))
        .find(|name| !taken(name.as_str()))
        .unwrap_or_default()
}

/// Outcome of a pass which did not fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PassStatus {
    /// The graph was rewritten.
    Changed,

    /// The pass had nothing to do.
    Unchanged,
}

impl PassStatus {
    pub fn changed(self) -> bool {
        self == PassStatus::Changed
    }

    /// Combine the statuses of two steps.
    pub fn merge(self, other: PassStatus) -> PassStatus {
        if self.changed() || other.changed() {
            PassStatus::Changed
        } else {
            PassStatus::Unchanged
        }
    }
}

/// A transformation applied to a whole [`ComputeGraph`].
pub trait GraphPass {
    /// Name of the pass, for logging.
    fn name(&self) -> &str;

    /// Apply the pass to `graph`, reading options from `ctx`.
    fn run(&self, graph: &mut ComputeGraph, ctx: &CompileContext) -> Result<PassStatus, PassError>;
}

/// Applies the multi-dims passes to a graph.
pub struct GraphOptimizer {
    passes: Vec<Box<dyn GraphPass>>,
}

impl GraphOptimizer {
    /// Create an optimizer which runs scope extraction followed by gear
    /// cloning.
    pub fn new() -> Self {
        GraphOptimizer {
            passes: vec![
                Box::new(CreateSubgraphWithScopePass::new()),
                Box::new(SubgraphMultiDimsClonePass::new()),
            ],
        }
    }

    /// Apply each pass in turn, then check the graph's structural
    /// invariants.
    ///
    /// The first failing pass aborts the pipeline.
    pub fn optimize(&self, graph: &mut ComputeGraph, ctx: &CompileContext) -> Result<(), PassError> {
        for pass in &self.passes {
            let status = pass.run(graph, ctx)?;
            log::debug!("Pass {} finished: {:?}", pass.name(), status);
        }
        graph.verify()?;
        Ok(())
    }
}

impl Default for GraphOptimizer {
    fn default() -> Self {
        Self::new()
    }
}
