//! Graphviz export of a dependence graph.

use super::{DependenceGraph, Graph, Node, ProgramPoint};
use cranelift_codegen::ir::Function;
use std::collections::BTreeSet;
use std::fmt::{self, Write};

/// Renders a `DependenceGraph` in DOT format.
///
/// Control edges are solid and labelled with their weight, def-use edges
/// are dashed. Sources are filled red, sinks blue, and cut edges are drawn
/// bold in red.
pub struct DependenceGraphPrinter<'a> {
    func: &'a Function,
    graph: &'a DependenceGraph,
    sources: BTreeSet<Node>,
    sinks: BTreeSet<Node>,
    cut: BTreeSet<(Node, Node)>,
}

impl<'a> DependenceGraphPrinter<'a> {
    /// A printer with no highlighting.
    pub fn new(func: &'a Function, graph: &'a DependenceGraph) -> Self {
        Self {
            func,
            graph,
            sources: BTreeSet::new(),
            sinks: BTreeSet::new(),
            cut: BTreeSet::new(),
        }
    }

    /// Highlight `sources`.
    pub fn with_sources(mut self, sources: impl IntoIterator<Item = Node>) -> Self {
        self.sources.extend(sources);
        self
    }

    /// Highlight `sinks`.
    pub fn with_sinks(mut self, sinks: impl IntoIterator<Item = Node>) -> Self {
        self.sinks.extend(sinks);
        self
    }

    /// Highlight the cut edges.
    pub fn with_cut(mut self, cut: impl IntoIterator<Item = (Node, Node)>) -> Self {
        self.cut.extend(cut);
        self
    }

    fn label(&self, node: Node) -> Result<String, fmt::Error> {
        let mut s = String::new();
        match self.graph.point(node) {
            ProgramPoint::Inst(inst) => write!(s, "{}", self.func.dfg.display_inst(inst))?,
            ProgramPoint::Param(v) => write!(s, "{}: {}", v, self.func.dfg.value_type(v))?,
        }
        Ok(s.replace('"', "\\\""))
    }
}

impl<'a> fmt::Display for DependenceGraphPrinter<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "digraph \"{}\" {{", self.func.name)?;
        writeln!(f, "    node [shape=box, fontname=monospace, fontsize=10];")?;
        for node in self.graph.nodes() {
            let style = if self.sources.contains(&node) {
                ", style=filled, fillcolor=\"#ffaaaa\""
            } else if self.sinks.contains(&node) {
                ", style=filled, fillcolor=\"#aaccff\""
            } else {
                ""
            };
            writeln!(f, "    {} [label=\"{}\"{}];", node, self.label(node)?, style)?;
        }
        for (src, dst, weight) in self.graph.control().edges() {
            if self.cut.contains(&(src, dst)) {
                writeln!(
                    f,
                    "    {} -> {} [label=\"{}\", color=red, penwidth=2];",
                    src, dst, weight
                )?;
            } else {
                writeln!(f, "    {} -> {} [label=\"{}\"];", src, dst, weight)?;
            }
        }
        for (src, dst, _) in self.graph.data().edges() {
            writeln!(f, "    {} -> {} [style=dashed, color=gray];", src, dst)?;
        }
        writeln!(f, "}}")
    }
}
