// dot.rs — Graphviz DOT output for computation graphs
//
// Transforms a graph (optionally with its format selection) into DOT
// format suitable for rendering with `dot`, `neato`, or other Graphviz
// layout engines. Reorder nodes are drawn dashed so inserted conversions
// stand out.
//
// Preconditions: `graph` is fully constructed.
// Postconditions: returns a valid DOT string representing the graph.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::graph::{Graph, OpTag};
use crate::layout::Format;
use crate::reorder::FormatMap;

/// Emit the graph as a Graphviz DOT string. When `formats` is given,
/// each node label carries its selected format alongside the layout.
pub fn emit_dot(graph: &Graph, formats: Option<&FormatMap>) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph tlc {{").unwrap();
    writeln!(buf, "    rankdir=LR;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10, shape=box];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();
    writeln!(buf).unwrap();

    // Processing order keeps the output deterministic.
    for &id in graph.processing_order() {
        let node = graph.node(id);
        let san = sanitize(&node.name);
        let selected = formats
            .and_then(|f| f.get(id))
            .map(|fmt| format!("\\nsel: {}", fmt))
            .unwrap_or_default();
        let label = format!(
            "{}\\n[{}] {}{}",
            node.name,
            node.kind.tag(),
            node.layout.format,
            selected
        );
        match node.kind.tag() {
            OpTag::Reorder => {
                writeln!(buf, "    {} [label=\"{}\", style=dashed];", san, label).unwrap();
            }
            OpTag::Constant => {
                writeln!(buf, "    {} [label=\"{}\", shape=note];", san, label).unwrap();
            }
            _ => {
                writeln!(buf, "    {} [label=\"{}\"];", san, label).unwrap();
            }
        }
    }
    writeln!(buf).unwrap();

    for &id in graph.processing_order() {
        let node = graph.node(id);
        for &dep in &node.dependencies {
            writeln!(
                buf,
                "    {} -> {};",
                sanitize(&graph.node(dep).name),
                sanitize(&node.name)
            )
            .unwrap();
        }
    }

    writeln!(buf, "}}").unwrap();
    buf
}

/// True when the emitted label would mention the given format. Helper for
/// report tooling.
pub fn mentions_format(dot: &str, format: Format) -> bool {
    dot.contains(&format.to_string())
}

/// Sanitize a name to valid DOT identifier characters.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

// ── Tests ───────────────────────────────────────────────────────────────────
