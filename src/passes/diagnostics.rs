use std::cell::RefCell;

use rustc_hash::FxHashSet;

use crate::env::env_flag;
use crate::graph::{ComputeGraph, NodeId};

/// Environment variable which enables informational pass diagnostics.
pub const DIAGNOSTICS_ENV_VAR: &str = "GEARSHIFT_PASS_DIAGNOSTICS";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    /// Don't show any diagnostics.
    Off,
    /// Report only rewrites which were skipped or degraded.
    Warn,
    /// Report all rewrites.
    Info,
}

/// Diagnostic reporter for graph passes.
///
/// Messages go through the `log` facade, tagged with the node they concern.
pub struct Diagnostics {
    /// Nodes against which diagnostics have been reported at the `Warn` level
    /// or higher.
    warned_nodes: RefCell<FxHashSet<NodeId>>,
    level: DiagnosticLevel,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            warned_nodes: RefCell::new(FxHashSet::default()),
            level: DiagnosticLevel::Warn,
        }
    }

    /// Create a reporter whose level is `Info` if [`DIAGNOSTICS_ENV_VAR`] is
    /// set and `Warn` otherwise.
    pub fn from_env() -> Self {
        let mut diag = Self::new();
        if env_flag(DIAGNOSTICS_ENV_VAR, false) {
            diag.set_level(DiagnosticLevel::Info);
        }
        diag
    }

    /// Enable reporting of all messages at or above a given level.
    pub fn set_level(&mut self, level: DiagnosticLevel) {
        self.level = level;
    }

    /// Return true if diagnostic messages are enabled at a given level.
    pub fn enabled(&self, level: DiagnosticLevel) -> bool {
        self.level >= level
    }

    /// Log a diagnostic message for a given node at the [`Info`](DiagnosticLevel::Info) level.
    pub fn info(&self, graph: &ComputeGraph, node: NodeId, message: std::fmt::Arguments<'_>) {
        if self.level < DiagnosticLevel::Info {
            return;
        }
        self.log(DiagnosticLevel::Info, graph, node, message);
    }

    /// Log a diagnostic message for a given node at the [`Warn`](DiagnosticLevel::Warn) level.
    ///
    /// Only the first warning for each node is reported.
    pub fn warn(&self, graph: &ComputeGraph, node: NodeId, message: std::fmt::Arguments<'_>) {
        if self.level < DiagnosticLevel::Warn || self.warned_nodes.borrow().contains(&node) {
            return;
        }
        self.warned_nodes.borrow_mut().insert(node);
        self.log(DiagnosticLevel::Warn, graph, node, message);
    }

    /// Return true if a warning has been reported for `node`.
    pub fn was_warned(&self, node: NodeId) -> bool {
        self.warned_nodes.borrow().contains(&node)
    }

    fn log(
        &self,
        level: DiagnosticLevel,
        graph: &ComputeGraph,
        node: NodeId,
        message: std::fmt::Arguments<'_>,
    ) {
        let level = match level {
            DiagnosticLevel::Warn => log::Level::Warn,
            DiagnosticLevel::Info => log::Level::Info,
            DiagnosticLevel::Off => return,
        };
        log::log!(level, "{}: {}", graph.node_name(node), message);
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{DiagnosticLevel, Diagnostics};
    use crate::graph::builder::GraphBuilder;

    #[test]
    fn test_warns_once_per_node() {
        let mut b = GraphBuilder::new("main");
        let g = b.root();
        let x = b.data(g, "x", &[1]);
        let y = b.data(g, "y", &[1]);
        let graph = b.finish();

        let diag = Diagnostics::new();
        assert!(!diag.was_warned(x));
        diag.warn(&graph, x, format_args!("first"));
        diag.warn(&graph, x, format_args!("second"));
        assert!(diag.was_warned(x));
        assert!(!diag.was_warned(y));
    }

    #[test]
    fn test_levels() {
        let mut b = GraphBuilder::new("main");
        let g = b.root();
        let x = b.data(g, "x", &[1]);
        let graph = b.finish();

        let mut diag = Diagnostics::new();
        assert!(diag.enabled(DiagnosticLevel::Warn));
        assert!(!diag.enabled(DiagnosticLevel::Info));

        diag.set_level(DiagnosticLevel::Off);
        diag.warn(&graph, x, format_args!("ignored"));
        assert!(!diag.was_warned(x));

        diag.set_level(DiagnosticLevel::Info);
        assert!(diag.enabled(DiagnosticLevel::Warn));
    }
}
