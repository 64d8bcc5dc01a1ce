// factory.rs — Reorder node factory
//
// Builds reorder nodes for layout conversions and caches them per
// (source, in-layout, out-layout) so the same conversion requested twice
// yields one shared node. The second element of the returned pair tells
// the caller whether it got a cached node, which changes how the splice
// rewires users (see `Graph::add_intermediate`).

use std::collections::HashMap;

use crate::graph::{Graph, NodeId, NodeKind};
use crate::layout::Layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ReorderKey {
    source: NodeId,
    in_layout: Layout,
    out_layout: Layout,
}

/// Factory and cache for reorder nodes. One instance lives for the
/// duration of a single pass run.
#[derive(Debug, Default)]
pub struct ReorderFactory {
    cache: HashMap<ReorderKey, NodeId>,
    next_seq: u32,
}

impl ReorderFactory {
    pub fn new() -> Self {
        ReorderFactory::default()
    }

    /// Obtain a reorder converting `in_layout` to `out_layout` on an edge
    /// out of `source`. Returns `None` when no conversion is needed
    /// (identical layouts). Otherwise returns the node id and an
    /// `existing` flag: `false` for a freshly created detached node,
    /// `true` for a cached one already spliced into the graph.
    pub fn get_reorder(
        &mut self,
        graph: &mut Graph,
        source: NodeId,
        in_layout: Layout,
        out_layout: Layout,
    ) -> Option<(NodeId, bool)> {
        if in_layout == out_layout {
            return None;
        }

        let key = ReorderKey {
            source,
            in_layout,
            out_layout,
        };
        if let Some(&cached) = self.cache.get(&key) {
            return Some((cached, true));
        }

        let name = format!("reorder_{}_{}", self.next_seq, graph.node(source).name);
        self.next_seq += 1;
        let id = graph.create_detached(name, NodeKind::Reorder(out_layout), out_layout);
        self.cache.insert(key, id);
        Some((id, false))
    }

    /// Number of distinct reorders created so far.
    pub fn created(&self) -> usize {
        self.cache.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
