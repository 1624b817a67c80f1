use super::builder::{out, GraphBuilder};
use super::{op_types, ComputeGraph, DataType, GraphError, InAnchor, OpDesc, TensorDesc};

/// Build `x -> relu -> output` in the root graph.
fn linear_graph() -> (ComputeGraph, [super::NodeId; 3]) {
    let mut b = GraphBuilder::new("main");
    let g = b.root();
    let x = b.data(g, "x", &[1, 3]);
    let relu = b.op(g, "relu", "Relu", &[out(x, 0)]);
    let output = b.net_output(g, "output", &[out(relu, 0)]);
    (b.finish(), [x, relu, output])
}

#[test]
fn test_add_and_remove_data_edge() {
    let (mut graph, [x, relu, _]) = linear_graph();

    assert_eq!(graph.node(relu).unwrap().peer_out(0), Some(out(x, 0)));
    assert_eq!(graph.node(x).unwrap().peer_ins(0), &[InAnchor::new(relu, 0)]);

    // Input 0 of relu is already connected.
    let err = graph.add_data_edge(out(x, 0), InAnchor::new(relu, 0));
    assert_eq!(
        err,
        Err(GraphError::AnchorOccupied {
            node: "relu".into(),
            index: 0
        })
    );

    graph.remove_data_edge(out(x, 0), InAnchor::new(relu, 0)).unwrap();
    assert_eq!(graph.node(relu).unwrap().peer_out(0), None);
    assert!(graph.node(x).unwrap().peer_ins(0).is_empty());

    let err = graph.remove_data_edge(out(x, 0), InAnchor::new(relu, 0));
    assert!(matches!(err, Err(GraphError::EdgeNotFound { .. })));
}

#[test]
fn test_invalid_anchor() {
    let (mut graph, [x, relu, _]) = linear_graph();
    let err = graph.add_data_edge(out(x, 3), InAnchor::new(relu, 0));
    assert_eq!(
        err,
        Err(GraphError::InvalidAnchor {
            node: "x".into(),
            index: 3,
            kind: "output"
        })
    );
}

#[test]
fn test_duplicate_node_name() {
    let (mut graph, _) = linear_graph();
    let root = graph.root();
    let err = graph.add_node(root, OpDesc::new("relu", "Relu"));
    assert_eq!(
        err,
        Err(GraphError::DuplicateNodeName {
            graph: "main".into(),
            name: "relu".into()
        })
    );
}

#[test]
fn test_insert_node_before() {
    let (mut graph, [x, relu, output]) = linear_graph();
    let root = graph.root();
    let id = graph
        .insert_node_before(root, OpDesc::new("new", "Identity"), relu)
        .unwrap();
    assert_eq!(graph.direct_nodes(root), [x, id, relu, output]);
    assert_eq!(graph.node_position(relu), Some(2));
}

#[test]
fn test_control_edges() {
    let (mut graph, [x, _, output]) = linear_graph();
    graph.add_control_edge(x, output).unwrap();
    graph.add_control_edge(x, output).unwrap();
    assert_eq!(graph.node(x).unwrap().out_control(), &[output]);
    assert_eq!(graph.node(output).unwrap().in_control(), &[x]);

    graph.remove_control_edge(x, output).unwrap();
    assert!(graph.node(output).unwrap().in_control().is_empty());
    assert!(graph.remove_control_edge(x, output).is_err());
}

#[test]
fn test_relink_input() {
    let mut b = GraphBuilder::new("main");
    let g = b.root();
    let x = b.data(g, "x", &[2]);
    let y = b.data(g, "y", &[2]);
    let neg = b.op(g, "neg", "Neg", &[out(x, 0)]);
    let mut graph = b.finish();

    graph.relink_input(InAnchor::new(neg, 0), out(y, 0)).unwrap();
    assert_eq!(graph.node(neg).unwrap().peer_out(0), Some(out(y, 0)));
    assert!(graph.node(x).unwrap().peer_ins(0).is_empty());
}

#[test]
fn test_remove_node() {
    let (mut graph, [x, relu, output]) = linear_graph();
    let root = graph.root();
    graph.add_control_edge(relu, output).unwrap();

    graph.remove_node(relu).unwrap();

    assert!(graph.node(relu).is_none());
    assert_eq!(graph.direct_nodes(root), [x, output]);
    assert!(graph.node(x).unwrap().is_isolated());
    assert!(graph.node(output).unwrap().is_isolated());
    graph.verify().unwrap();
}

#[test]
fn test_remove_node_removes_subgraphs() {
    let mut b = GraphBuilder::new("main");
    let g = b.root();
    let x = b.data(g, "x", &[2]);
    let (call, sub) = b.partitioned_call(g, "call", "sub", &[out(x, 0)], 1);
    let sub_x = b.subgraph_data(sub, "sub_x", &[2], 0);
    b.subgraph_net_output(sub, "sub_out", &[out(sub_x, 0)]);
    let mut graph = b.finish();

    graph.remove_node(call).unwrap();
    assert!(graph.graph(sub).is_none());
    assert!(graph.node(sub_x).is_none());
    assert!(graph.subgraphs().is_empty());
}

#[test]
fn test_move_node() {
    let mut b = GraphBuilder::new("main");
    let g = b.root();
    let x = b.data(g, "x", &[2]);
    let (call, sub) = b.partitioned_call(g, "call", "sub", &[out(x, 0)], 1);
    let mut graph = b.finish();

    let (inner, inner_sub) = {
        let id = graph.add_node(g, OpDesc::new("inner", "If")).unwrap();
        let inner_sub = graph.create_subgraph(id, "then").unwrap();
        (id, inner_sub)
    };

    graph.move_node(inner, sub).unwrap();

    assert_eq!(graph.node(inner).unwrap().owner(), sub);
    assert_eq!(graph.direct_nodes(sub), [inner]);
    assert!(!graph.direct_nodes(g).contains(&inner));
    assert_eq!(graph.graph(inner_sub).unwrap().parent_graph(), Some(sub));
    assert_eq!(graph.graph(sub).unwrap().parent_node(), Some(call));
    graph.verify().unwrap();
}

#[test]
fn test_verify_rejects_cross_graph_edge() {
    let mut b = GraphBuilder::new("main");
    let g = b.root();
    let x = b.data(g, "x", &[2]);
    let relu = b.op(g, "relu", "Relu", &[out(x, 0)]);
    let (_, sub) = b.partitioned_call(g, "call", "sub", &[], 0);
    let mut graph = b.finish();

    graph.move_node(relu, sub).unwrap();

    let err = graph.verify().unwrap_err();
    assert!(matches!(err, GraphError::Inconsistent(msg) if msg.contains("crosses a graph boundary")));
}

#[test]
fn test_verify_rejects_detached_subgraph() {
    let (mut graph, _) = linear_graph();
    graph.new_detached_graph("orphan").unwrap();
    assert!(matches!(graph.verify(), Err(GraphError::Inconsistent(_))));
}

#[test]
fn test_topological_order() {
    let mut b = GraphBuilder::new("main");
    let g = b.root();
    let x = b.data(g, "x", &[2]);
    let y = b.data(g, "y", &[2]);
    let add = b.op(g, "add", "Add", &[out(x, 0), out(y, 0)]);
    let neg = b.op(g, "neg", "Neg", &[out(y, 0)]);
    let output = b.net_output(g, "output", &[out(add, 0), out(neg, 0)]);

    // Force `neg` to run before `add`.
    b.ctrl(neg, add);
    let mut graph = b.finish();

    assert_eq!(graph.topological_order(g).unwrap(), [x, y, neg, add, output]);

    graph.add_control_edge(add, neg).unwrap();
    assert_eq!(
        graph.topological_order(g),
        Err(GraphError::Cycle("main".into()))
    );
}

#[test]
fn test_replace_subgraph() {
    let mut b = GraphBuilder::new("main");
    let g = b.root();
    let (call, first) = b.partitioned_call(g, "call", "first", &[], 0);
    let mut graph = b.finish();
    let second = graph.create_subgraph(call, "second").unwrap();

    let new = graph.new_detached_graph("replacement").unwrap();
    graph.replace_subgraph(first, new).unwrap();

    assert_eq!(
        graph.node(call).unwrap().desc().subgraph_names,
        ["replacement", "second"]
    );
    assert_eq!(graph.node_subgraphs(call), [new, second]);
    assert_eq!(graph.graph(first).unwrap().parent_node(), None);

    graph.remove_graph(first).unwrap();
    graph.verify().unwrap();
}

#[test]
fn test_reparent_subgraph() {
    let mut b = GraphBuilder::new("main");
    let g = b.root();
    let (old, sub) = b.partitioned_call(g, "old", "sub", &[], 0);
    let (new, _) = b.partitioned_call(g, "new", "other", &[], 0);
    let mut graph = b.finish();

    graph.reparent_subgraph(sub, new).unwrap();

    assert!(graph.node_subgraphs(old).is_empty());
    assert_eq!(graph.node(new).unwrap().desc().subgraph_names, ["other", "sub"]);
    assert_eq!(graph.graph(sub).unwrap().parent_node(), Some(new));
}

#[test]
fn test_remove_root_graph_fails() {
    let (mut graph, _) = linear_graph();
    let root = graph.root();
    assert!(graph.remove_graph(root).is_err());
}

#[test]
fn test_clone_graph() {
    let mut b = GraphBuilder::new("main");
    let g = b.root();
    let x = b.data(g, "x", &[-1, 3]);
    let (call, sub) = b.partitioned_call(g, "call", "sub", &[out(x, 0)], 1);
    let sub_x = b.subgraph_data(sub, "sub_x", &[-1, 3], 0);
    let relu = b.op(sub, "relu", "Relu", &[out(sub_x, 0)]);
    let (_, nested) = b.partitioned_call(sub, "nested_call", "nested", &[out(relu, 0)], 1);
    let nested_x = b.subgraph_data(nested, "nested_x", &[-1, 3], 0);
    b.subgraph_net_output(nested, "nested_out", &[out(nested_x, 0)]);
    let sub_out = b.subgraph_net_output(sub, "sub_out", &[out(relu, 0)]);
    b.ctrl(sub_x, sub_out);
    let mut graph = b.finish();

    graph
        .graph_mut(sub)
        .unwrap()
        .attrs_mut()
        .set("gear", vec![2i64]);
    graph
        .try_node_mut(relu)
        .unwrap()
        .desc_mut()
        .outputs[0]
        .attrs
        .set("tag", "a");

    let cloned = graph.clone_graph(sub, "_1").unwrap();
    graph.attach_subgraph(call, cloned.graph).unwrap();

    let body = graph.graph(cloned.graph).unwrap();
    assert_eq!(body.name(), "sub_1");
    assert_eq!(body.attrs().get_list_int("gear"), Some([2].as_slice()));
    assert_eq!(body.node_count(), 4);
    assert_eq!(body.input_nodes(), [cloned.node_map[&sub_x]]);

    let relu_clone = graph.node(cloned.node_map[&relu]).unwrap();
    assert_eq!(relu_clone.name(), "relu_1");
    assert_eq!(relu_clone.peer_out(0), Some(out(cloned.node_map[&sub_x], 0)));
    assert_eq!(relu_clone.output_desc(0).unwrap().attrs.get_str("tag"), Some("a"));

    let out_clone = graph.node(cloned.node_map[&sub_out]).unwrap();
    assert_eq!(out_clone.in_control(), [cloned.node_map[&sub_x]]);

    // Nested subgraphs are cloned too and the originals are untouched.
    let nested_clone = graph.find_graph("nested_1").unwrap();
    assert_eq!(
        graph.graph(nested_clone).unwrap().parent_node(),
        Some(cloned.node_map[&graph.find_node(sub, "nested_call").unwrap()])
    );
    assert!(graph.find_node(nested_clone, "nested_x_1").is_some());
    assert_eq!(graph.graph(nested).unwrap().node_count(), 2);

    graph.verify().unwrap();
}

#[test]
fn test_anchor_growth() {
    let mut graph = ComputeGraph::new("main");
    let root = graph.root();
    let id = graph
        .add_node(root, OpDesc::new("call", op_types::PARTITIONED_CALL))
        .unwrap();
    let idx = graph
        .add_input_anchor(id, TensorDesc::new(DataType::Float, &[2]))
        .unwrap();
    assert_eq!(idx, 0);
    let idx = graph.add_output_anchor(id, TensorDesc::int32_vector(2)).unwrap();
    assert_eq!(idx, 0);

    let node = graph.node(id).unwrap();
    assert_eq!(node.num_inputs(), 1);
    assert_eq!(node.num_outputs(), 1);
    assert_eq!(node.output_desc(0).unwrap().dtype, DataType::Int32);
}
