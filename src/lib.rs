//! gearshift rewrites dynamic-shape compute graphs so that they can run on
//! backends which only accept static shapes.
//!
//! The user describes a finite set of *gears*: concrete values for the
//! unknown dims of the graph inputs. Rewriting happens in two passes:
//!
//! 1. [`CreateSubgraphWithScopePass`] groups nodes by their scope index
//!    attribute and extracts each scope into a subgraph behind a
//!    `PartitionedCall` node.
//! 2. [`SubgraphMultiDimsClonePass`] replaces each extracted subgraph with a
//!    body which computes the runtime shape of the inputs, maps it to a gear
//!    and dispatches through a `Case` node to one statically-shaped clone of
//!    the subgraph per gear.
//!
//! # Running the passes
//!
//! Options are passed through a [`CompileContext`]. The passes do nothing
//! unless the input shape, dynamic node type and one of the dynamic dims,
//! batch size or image size options are set and the target is heterogeneous.
//!
//! ```
//! use gearshift::context::{
//!     OPTION_DYNAMIC_DIMS, OPTION_DYNAMIC_NODE_TYPE, OPTION_HETEROGENEOUS, OPTION_INPUT_SHAPE,
//! };
//! use gearshift::{CompileContext, ComputeGraph, GraphOptimizer};
//!
//! let ctx = CompileContext::new()
//!     .with_option(OPTION_INPUT_SHAPE, "x:-1,3")
//!     .with_option(OPTION_DYNAMIC_DIMS, "1;2;4")
//!     .with_option(OPTION_DYNAMIC_NODE_TYPE, "0")
//!     .with_option(OPTION_HETEROGENEOUS, "1");
//!
//! let mut graph = ComputeGraph::new("main");
//! GraphOptimizer::new().optimize(&mut graph, &ctx).unwrap();
//! ```
//!
//! # Logging
//!
//! Passes trace their work through the [`log`](https://docs.rs/log) crate.
//! Set the `GEARSHIFT_PASS_DIAGNOSTICS` environment variable to also report
//! each rewritten node at the info level.

pub mod context;
pub mod env;
pub mod graph;
pub mod multi_batch_options;
pub mod passes;

pub use context::CompileContext;
pub use graph::{ComputeGraph, GraphError, GraphId, NodeId};
pub use multi_batch_options::{ParseError, ParseErrorKind};
pub use passes::{
    CreateSubgraphWithScopePass, GraphOptimizer, GraphPass, PassError, PassStatus,
    SubgraphMultiDimsClonePass,
};
