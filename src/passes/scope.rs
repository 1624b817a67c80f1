//! Grouping of nodes into scopes by their scope index attribute.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use super::PassError;
use crate::context::CompileContext;
use crate::graph::attr::{
    ATTR_NAME_SUBGRAPH_MULTI_DIMS_INDEX, ATTR_NAME_SUBGRAPH_MULTI_DIMS_PROCESSED,
};
use crate::graph::{ComputeGraph, GraphId, InAnchor, NodeId, OutAnchor};

/// Map from scope index to member nodes, in node order.
pub type ScopeMap = BTreeMap<i64, Vec<NodeId>>;

/// Return the scope index of a node, if it has a non-negative one.
pub fn scope_index(graph: &ComputeGraph, node: NodeId) -> Option<i64> {
    graph
        .node(node)?
        .desc()
        .attrs
        .get_int(ATTR_NAME_SUBGRAPH_MULTI_DIMS_INDEX)
        .filter(|&idx| idx >= 0)
}

/// Group the direct nodes of `graph_id` by scope index.
///
/// Fails if a `Data` or `NetOutput` node is assigned to a scope.
pub fn collect_scope_nodes_by_index(
    graph: &ComputeGraph,
    graph_id: GraphId,
) -> Result<ScopeMap, PassError> {
    let mut scopes = ScopeMap::new();
    for id in graph.direct_nodes(graph_id) {
        let Some(index) = scope_index(graph, id) else {
            continue;
        };
        let node = graph.try_node(id)?;
        if node.is_boundary() {
            return Err(PassError::invalid_param(
                graph,
                id,
                format!("{} node must not belong to scope {}", node.op_type(), index),
            ));
        }
        scopes.entry(index).or_default().push(id);
    }
    Ok(scopes)
}

/// Decide whether scope extraction applies to a graph.
///
/// The input shape and dynamic node type options must be set, along with one
/// of the dynamic dims, batch size or image size options, and the target
/// must be heterogeneous. Graphs which have already been
/// processed, or which contain only `Data` and `NetOutput` nodes, are not
/// eligible.
pub fn is_graph_multi_batch_condition(graph: &ComputeGraph, ctx: &CompileContext) -> bool {
    if ctx.input_shape().is_empty()
        || !ctx.is_dynamic_config()
        || ctx.dynamic_node_type().is_empty()
    {
        log::debug!("Multi-dims options are not set, skipping graph");
        return false;
    }
    if !ctx.is_heterogeneous() {
        log::debug!("Target is not heterogeneous, skipping graph");
        return false;
    }

    let root = graph.root();
    let nodes = graph.direct_nodes(root);
    let processed = nodes.iter().any(|&id| {
        graph.node(id).is_some_and(|n| {
            n.desc()
                .attrs
                .get_bool(ATTR_NAME_SUBGRAPH_MULTI_DIMS_PROCESSED)
                .unwrap_or(false)
        })
    });
    if processed {
        log::info!("Graph \"{}\" was already processed", graph.graph_name(root));
        return false;
    }

    let has_payload = nodes
        .iter()
        .any(|&id| graph.node(id).is_some_and(|n| !n.is_boundary()));
    if !has_payload {
        log::info!(
            "Graph \"{}\" has only input and output nodes",
            graph.graph_name(root)
        );
        return false;
    }
    true
}

/// Data edges which cross the boundary of a scope.
#[derive(Debug, Default, PartialEq)]
pub struct ScopeBoundary {
    /// Inputs of scope members whose producer is outside the scope.
    pub inputs: Vec<(InAnchor, OutAnchor)>,

    /// Outputs of scope members with at least one consumer outside the
    /// scope, paired with those consumers.
    pub outputs: Vec<(OutAnchor, Vec<InAnchor>)>,

    /// Control edges `(src, dst)` with exactly one end inside the scope.
    pub control: Vec<(NodeId, NodeId)>,
}

impl ScopeBoundary {
    /// Classify the edges of `members` which cross the scope boundary.
    ///
    /// Anchors are listed in member order, then anchor order.
    pub fn collect(graph: &ComputeGraph, members: &[NodeId]) -> Result<ScopeBoundary, PassError> {
        let member_set: FxHashSet<NodeId> = members.iter().copied().collect();
        let mut boundary = ScopeBoundary::default();

        for &id in members {
            let node = graph.try_node(id)?;
            for (index, src) in node.connected_inputs() {
                if !member_set.contains(&src.node) {
                    boundary.inputs.push((InAnchor::new(id, index), src));
                }
            }
            for index in 0..node.num_outputs() {
                let external: Vec<InAnchor> = node
                    .peer_ins(index)
                    .iter()
                    .copied()
                    .filter(|dst| !member_set.contains(&dst.node))
                    .collect();
                if !external.is_empty() {
                    boundary.outputs.push((OutAnchor::new(id, index), external));
                }
            }
            for &src in node.in_control() {
                if !member_set.contains(&src) {
                    boundary.control.push((src, id));
                }
            }
            for &dst in node.out_control() {
                if !member_set.contains(&dst) {
                    boundary.control.push((id, dst));
                }
            }
        }
        Ok(boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::{collect_scope_nodes_by_index, is_graph_multi_batch_condition, ScopeBoundary};
    use crate::context::{
        CompileContext, OPTION_DYNAMIC_BATCH_SIZE, OPTION_DYNAMIC_DIMS, OPTION_DYNAMIC_NODE_TYPE,
        OPTION_HETEROGENEOUS, OPTION_INPUT_SHAPE,
    };
    use crate::graph::attr::ATTR_NAME_SUBGRAPH_MULTI_DIMS_PROCESSED;
    use crate::graph::builder::{out, GraphBuilder};
    use crate::graph::{InAnchor, OutAnchor};
    use crate::passes::PassError;

    fn multi_dims_ctx() -> CompileContext {
        CompileContext::new()
            .with_option(OPTION_INPUT_SHAPE, "x:-1,3")
            .with_option(OPTION_DYNAMIC_DIMS, "1;2")
            .with_option(OPTION_DYNAMIC_NODE_TYPE, "0")
            .with_option(OPTION_HETEROGENEOUS, "1")
    }

    #[test]
    fn test_collect_scope_nodes_by_index() {
        let mut b = GraphBuilder::new("main");
        let g = b.root();
        let x = b.data(g, "x", &[-1, 3]);
        let a = b.op(g, "a", "Relu", &[out(x, 0)]);
        let c = b.op(g, "c", "Relu", &[out(a, 0)]);
        let d = b.op(g, "d", "Relu", &[out(c, 0)]);
        let e = b.op(g, "e", "Relu", &[out(d, 0)]);
        b.net_output(g, "output", &[out(e, 0)]);
        b.set_scope(a, 1);
        b.set_scope(c, 0);
        b.set_scope(d, 1);
        b.set_scope(e, -1);
        let graph = b.finish();

        let scopes = collect_scope_nodes_by_index(&graph, g).unwrap();
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[&0], [c]);
        assert_eq!(scopes[&1], [a, d]);
    }

    #[test]
    fn test_boundary_node_in_scope() {
        let mut b = GraphBuilder::new("main");
        let g = b.root();
        let x = b.data(g, "x", &[-1, 3]);
        b.set_scope(x, 0);
        let graph = b.finish();

        let err = collect_scope_nodes_by_index(&graph, g).unwrap_err();
        assert!(matches!(
            err,
            PassError::InvalidParam { node, .. } if node == "x"
        ));
    }

    #[test]
    fn test_is_graph_multi_batch_condition() {
        let mut b = GraphBuilder::new("main");
        let g = b.root();
        let x = b.data(g, "x", &[-1, 3]);
        let relu = b.op(g, "relu", "Relu", &[out(x, 0)]);
        b.net_output(g, "output", &[out(relu, 0)]);
        let mut graph = b.finish();

        let ctx = multi_dims_ctx();
        assert!(is_graph_multi_batch_condition(&graph, &ctx));

        let homogeneous = ctx.clone().with_option(OPTION_HETEROGENEOUS, "0");
        assert!(!is_graph_multi_batch_condition(&graph, &homogeneous));

        let no_node_type = ctx.clone().with_option(OPTION_DYNAMIC_NODE_TYPE, "");
        assert!(!is_graph_multi_batch_condition(&graph, &no_node_type));

        let no_gears = ctx.clone().with_option(OPTION_DYNAMIC_DIMS, "");
        assert!(!is_graph_multi_batch_condition(&graph, &no_gears));

        let batch_size = no_gears.with_option(OPTION_DYNAMIC_BATCH_SIZE, "1,2,4");
        assert!(is_graph_multi_batch_condition(&graph, &batch_size));

        graph
            .try_node_mut(relu)
            .unwrap()
            .desc_mut()
            .attrs
            .set(ATTR_NAME_SUBGRAPH_MULTI_DIMS_PROCESSED, true);
        assert!(!is_graph_multi_batch_condition(&graph, &ctx));
    }

    #[test]
    fn test_boundary_only_graph_is_not_eligible() {
        let mut b = GraphBuilder::new("main");
        let g = b.root();
        let x = b.data(g, "x", &[-1, 3]);
        b.net_output(g, "output", &[out(x, 0)]);
        let graph = b.finish();

        assert!(!is_graph_multi_batch_condition(&graph, &multi_dims_ctx()));
    }

    #[test]
    fn test_scope_boundary() {
        let mut b = GraphBuilder::new("main");
        let g = b.root();
        let x = b.data(g, "x", &[2]);
        let a = b.op(g, "a", "Relu", &[out(x, 0)]);
        let c = b.op(g, "c", "Add", &[out(a, 0), out(x, 0)]);
        let d = b.op(g, "d", "Neg", &[out(a, 0)]);
        let output = b.net_output(g, "output", &[out(c, 0), out(d, 0)]);
        b.ctrl(c, output);
        let graph = b.finish();

        let boundary = ScopeBoundary::collect(&graph, &[a, c]).unwrap();
        assert_eq!(
            boundary.inputs,
            [
                (InAnchor::new(a, 0), OutAnchor::new(x, 0)),
                (InAnchor::new(c, 1), OutAnchor::new(x, 0))
            ]
        );
        assert_eq!(
            boundary.outputs,
            [
                (OutAnchor::new(a, 0), vec![InAnchor::new(d, 0)]),
                (OutAnchor::new(c, 0), vec![InAnchor::new(output, 0)])
            ]
        );
        assert_eq!(boundary.control, [(c, output)]);
    }
}
