// reorder.rs — Format assignment and reorder materialization
//
// The core of the layout pass. Collects advisor-preferred formats, grows
// them into adjacent unconstrained regions (breadth-first extents with
// deferred roots), minimizes the local conversion count at nodes the
// advisor left unconstrained, and finally splices explicit reorder nodes
// onto every remaining mismatched edge the consumer cannot absorb.
//
// Preconditions: `graph` is topologically ordered; advisor and factory
//                outlive the call.
// Postconditions: every mismatched non-fusible data-flow edge carries a
//                 reorder; chosen formats are written into node layouts.
// Failure modes: none — every decision is "apply" or "skip"; missing
//                format-map entries mean the node is skipped.
// Side effects: mutates the graph (reorder insertion, layout updates).

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::advisor::LayoutAdvisor;
use crate::direction::Direction;
use crate::factory::ReorderFactory;
use crate::graph::{Graph, NodeId};
use crate::layout::Format;
use crate::pass::StageCert;

// ── Format map ──────────────────────────────────────────────────────────────

/// The pass-local mapping from data-flow nodes to their chosen format.
/// Created by `collect_preferred_formats`, mutated only by this pass,
/// dropped when the run ends.
#[derive(Debug, Clone, Default)]
pub struct FormatMap {
    map: HashMap<NodeId, Format>,
}

impl FormatMap {
    pub fn new() -> Self {
        FormatMap::default()
    }

    pub fn get(&self, node: NodeId) -> Option<Format> {
        self.map.get(&node).copied()
    }

    pub fn set(&mut self, node: NodeId, format: Format) {
        self.map.insert(node, format);
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.map.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Entries in processing order, for deterministic emission.
    pub fn entries<'g>(&self, graph: &'g Graph) -> Vec<(&'g str, Format)> {
        graph
            .processing_order()
            .iter()
            .filter_map(|&id| {
                self.get(id)
                    .map(|fmt| (graph.node(id).name.as_str(), fmt))
            })
            .collect()
    }
}

// ── Collect ─────────────────────────────────────────────────────────────────

/// Query the advisor for every data-flow node in processing order.
pub fn collect_preferred_formats(graph: &Graph, advisor: &dyn LayoutAdvisor) -> FormatMap {
    let mut formats = FormatMap::new();
    for &node in graph.processing_order() {
        if !graph.is_in_data_flow(node) {
            continue;
        }
        formats.set(node, advisor.preferred_format(graph, node));
    }
    formats
}

// ── Recursive admissibility check ───────────────────────────────────────────

/// Whether `fmt` could spread from `prev` into `node` and onward through
/// the whole region reachable in `dir`, without forcing a conversion to
/// migrate elsewhere. Used by the fully-connected override with
/// `allow_fusing = false`; the breadth-first extent walk below supersedes
/// it for actual propagation.
pub(crate) fn can_propagate(
    graph: &Graph,
    formats: &FormatMap,
    advisor: &dyn LayoutAdvisor,
    prev: NodeId,
    node: NodeId,
    fmt: Format,
    dir: Direction,
    allow_fusing: bool,
) -> bool {
    let sel = match formats.get(node) {
        Some(f) => f,
        None => return false,
    };
    if fmt == sel {
        return true;
    }

    let (first_node, second_node) = dir.order(prev, node);
    let (first_fmt, second_fmt) = dir.order(fmt, sel);

    if allow_fusing
        && advisor.can_fuse_reorder(graph, first_node, second_node, first_fmt, second_fmt)
    {
        return true;
    }

    if sel != Format::Any {
        return false;
    }

    if !advisor.is_format_supported(graph, node, fmt) {
        return false;
    }

    // A neighbor on the reverse side with a different format would need a
    // conversion of its own once `node` switches; reject rather than move
    // the reorder elsewhere.
    let reverse_conflicts = dir
        .reverse()
        .next_nodes(graph, node)
        .iter()
        .filter(|&&rev| {
            graph.is_in_data_flow(rev) && rev != prev && formats.get(rev) != Some(fmt)
        })
        .count();
    if reverse_conflicts > 0 {
        return false;
    }

    for &next in dir.next_nodes(graph, node) {
        if !graph.is_in_data_flow(next) {
            continue;
        }
        if !can_propagate(graph, formats, advisor, node, next, fmt, dir, allow_fusing) {
            return false;
        }
    }

    true
}

// ── Propagate ───────────────────────────────────────────────────────────────

struct ExtentCandidate {
    prev: NodeId,
    node: NodeId,
    dir: Direction,
}

/// Grow the propagation extent for `root` breadth-first through both
/// directions. Returns false when the extent would be inadmissible; in
/// that case `extent` must be discarded by the caller.
///
/// A fusible boundary stops the extent but enqueues the boundary node as
/// a deferred root: once the primary extent is complete, each deferred
/// root attempts an independent secondary extent (with rollback). A
/// deferred root that fails is retried at most one full sweep later,
/// tracked by a single rejected checkpoint; this bounds the loop on
/// mutually blocking candidates.
fn analyse_propagation_extent(
    graph: &Graph,
    formats: &FormatMap,
    advisor: &dyn LayoutAdvisor,
    root: NodeId,
    fmt: Format,
    allow_fusing: bool,
    extent: &mut HashSet<NodeId>,
) -> bool {
    extent.insert(root);
    let mut candidate_roots: VecDeque<NodeId> = VecDeque::new();
    let mut candidates: VecDeque<ExtentCandidate> = VecDeque::new();
    for dir in Direction::BOTH {
        for &next in dir.next_nodes(graph, root) {
            if graph.is_in_data_flow(next) {
                candidates.push_back(ExtentCandidate {
                    prev: root,
                    node: next,
                    dir,
                });
            }
        }
    }

    while let Some(ExtentCandidate { prev, node, dir }) = candidates.pop_front() {
        if extent.contains(&node) {
            continue;
        }

        let sel = match formats.get(node) {
            Some(f) => f,
            None => continue,
        };
        if fmt == sel {
            continue;
        }

        let (first_node, second_node) = dir.order(prev, node);
        let (first_fmt, second_fmt) = dir.order(fmt, sel);

        let supported = advisor.is_format_supported(graph, node, fmt);

        if allow_fusing
            && advisor.can_fuse_reorder(graph, first_node, second_node, first_fmt, second_fmt)
        {
            if supported {
                candidate_roots.push_back(node);
            }
            continue;
        }

        if sel != Format::Any {
            return false;
        }

        // Fusing with the node's fallback (output layout) format.
        let fallback = graph.output_layout(node).format;
        let (first_fb, second_fb) = dir.order(fmt, fallback);
        if allow_fusing
            && advisor.can_fuse_reorder(graph, first_node, second_node, first_fb, second_fb)
        {
            if supported {
                candidate_roots.push_back(node);
            }
            continue;
        }

        if !supported {
            return false;
        }

        for d in Direction::BOTH {
            for &next in d.next_nodes(graph, node) {
                if graph.is_in_data_flow(next) && !extent.contains(&next) {
                    candidates.push_back(ExtentCandidate {
                        prev: node,
                        node: next,
                        dir: d,
                    });
                }
            }
        }
        extent.insert(node);
    }

    let mut rejected_checkpoint: Option<NodeId> = None;
    while let Some(next_root) = candidate_roots.pop_front() {
        if extent.contains(&next_root) {
            continue;
        }
        // Only still-unconstrained nodes may join a foreign extent; a
        // concrete boundary keeps what the advisor asked for.
        if formats.get(next_root) != Some(Format::Any) {
            continue;
        }

        let snapshot = extent.clone();
        let success =
            analyse_propagation_extent(graph, formats, advisor, next_root, fmt, allow_fusing, extent);
        if success {
            rejected_checkpoint = None;
            continue;
        }

        *extent = snapshot;
        if rejected_checkpoint == Some(next_root) {
            break;
        }
        if rejected_checkpoint.is_none() {
            rejected_checkpoint = Some(next_root);
        }
        candidate_roots.push_back(next_root);
    }

    true
}

/// Spread each concrete assignment into adjacent unconstrained regions.
/// Seeds are visited in processing order; an extent is committed only
/// when the whole admissibility analysis for its seed succeeds.
pub fn propagate_formats(graph: &Graph, formats: &mut FormatMap, advisor: &dyn LayoutAdvisor) {
    let mut extent: HashSet<NodeId> = HashSet::new();
    let order: Vec<NodeId> = graph.processing_order().to_vec();
    for node in order {
        let fmt = match formats.get(node) {
            Some(f) if f.is_concrete() => f,
            _ => continue,
        };

        extent.clear();
        if !analyse_propagation_extent(graph, formats, advisor, node, fmt, true, &mut extent) {
            continue;
        }
        for &member in &extent {
            formats.set(member, fmt);
        }
    }
}

// ── Local reorder counting ──────────────────────────────────────────────────

/// Local conversion cost at a node: how many adjacent edges need a
/// reorder, and the summed element count of their source sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ReorderCount {
    pub number: usize,
    pub total_volume: u64,
}

fn count_reorders_in_dir(
    graph: &Graph,
    formats: &FormatMap,
    advisor: &dyn LayoutAdvisor,
    node: NodeId,
    dir: Direction,
) -> ReorderCount {
    let sel = match formats.get(node) {
        Some(f) => f,
        None => return ReorderCount::default(),
    };

    let mut count = ReorderCount::default();
    for &next in dir.next_nodes(graph, node) {
        if !graph.is_in_data_flow(next) {
            continue;
        }
        // An undecided neighbor counts as a conversion: it keeps pressure
        // on the metric until the neighborhood settles.
        let next_fmt = formats.get(next).unwrap_or(Format::Any);

        let (first_node, second_node) = dir.order(node, next);
        let (first_fmt, second_fmt) = dir.order(sel, next_fmt);

        if next_fmt == Format::Any
            || (sel != next_fmt
                && !advisor.can_fuse_reorder(graph, first_node, second_node, first_fmt, second_fmt))
        {
            count.number += 1;
            count.total_volume += graph.output_layout(first_node).count();
        }
    }
    count
}

pub(crate) fn count_reorders(
    graph: &Graph,
    formats: &FormatMap,
    advisor: &dyn LayoutAdvisor,
    node: NodeId,
) -> ReorderCount {
    let fwd = count_reorders_in_dir(graph, formats, advisor, node, Direction::Forward);
    let bwd = count_reorders_in_dir(graph, formats, advisor, node, Direction::Backward);
    ReorderCount {
        number: fwd.number + bwd.number,
        total_volume: fwd.total_volume + bwd.total_volume,
    }
}

// ── Minimize ────────────────────────────────────────────────────────────────

/// For every node the advisor left unconstrained, pick the neighborhood
/// format minimizing the lexicographic (count, volume) metric. Greedy
/// per-node decisions suffice: neighbor assignments are already fixed and
/// the graph is acyclic, so one pass in processing order is enough.
pub fn minimize_local_reorders(
    graph: &Graph,
    formats: &mut FormatMap,
    advisor: &dyn LayoutAdvisor,
) {
    let order: Vec<NodeId> = graph.processing_order().to_vec();
    for node in order {
        if !graph.is_in_data_flow(node) {
            continue;
        }
        if advisor.preferred_format(graph, node) != Format::Any {
            continue;
        }

        if formats.get(node) == Some(Format::Any) {
            let out_fmt = graph.output_layout(node).format;
            if advisor.is_format_supported(graph, node, out_fmt) {
                formats.set(node, out_fmt);
            }
        }

        let sel = match formats.get(node) {
            Some(f) => f,
            None => continue,
        };
        let mut best_count = count_reorders(graph, formats, advisor, node);
        let mut best_format = sel;

        if best_count.number == 0 {
            continue;
        }

        let mut local_formats: BTreeSet<Format> = BTreeSet::new();
        for &user in graph.users(node) {
            if let Some(user_fmt) = formats.get(user) {
                if user_fmt.is_concrete() && advisor.is_format_supported(graph, node, user_fmt) {
                    local_formats.insert(user_fmt);
                }
            }
        }
        for &dep in graph.dependencies(node) {
            if !graph.is_in_data_flow(dep) {
                continue;
            }
            if let Some(dep_fmt) = formats.get(dep) {
                if dep_fmt.is_concrete() && advisor.is_format_supported(graph, node, dep_fmt) {
                    local_formats.insert(dep_fmt);
                }
            }
        }

        if local_formats.is_empty() {
            continue;
        }

        for &candidate in &local_formats {
            formats.set(node, candidate);
            let count = count_reorders(graph, formats, advisor, node);
            if count.number < best_count.number
                || (count.number == best_count.number
                    && count.total_volume < best_count.total_volume)
            {
                best_count = count;
                best_format = candidate;
            }
        }

        formats.set(node, best_format);
    }
}

// ── Statistics ──────────────────────────────────────────────────────────────

/// Diagnostic counters for `--emit report` and verbose runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Conversions still required after format selection.
    pub reorders: usize,
    /// Summed element count of their source sides.
    pub total_elements: u64,
    /// Nodes with at least one fusible incoming conversion.
    pub nodes_with_fused_inputs: usize,
}

/// Count remaining conversions over the whole graph. Every conversion is
/// observed from both of its endpoints, so totals are halved.
pub fn collect_stats(
    graph: &Graph,
    formats: &FormatMap,
    advisor: &dyn LayoutAdvisor,
) -> ReorderStats {
    let mut number = 0usize;
    let mut volume = 0u64;
    for &node in graph.processing_order() {
        match formats.get(node) {
            Some(f) if f.is_concrete() => {}
            _ => continue,
        }
        let count = count_reorders(graph, formats, advisor, node);
        number += count.number;
        volume += count.total_volume;
    }

    let mut fused_nodes = 0usize;
    for &node in graph.processing_order() {
        let fmt = match formats.get(node) {
            Some(f) if f.is_concrete() => f,
            _ => continue,
        };
        let has_fused_input = graph.dependencies(node).iter().any(|&prev| {
            graph.is_in_data_flow(prev)
                && formats.get(prev).is_some_and(|prev_fmt| {
                    prev_fmt != fmt
                        && advisor.can_fuse_reorder(graph, prev, node, prev_fmt, fmt)
                })
        });
        if has_fused_input {
            fused_nodes += 1;
        }
    }

    ReorderStats {
        reorders: number / 2,
        total_elements: volume / 2,
        nodes_with_fused_inputs: fused_nodes,
    }
}

// ── Materialize ─────────────────────────────────────────────────────────────

fn insert_reorders_in_dir(
    graph: &mut Graph,
    formats: &FormatMap,
    factory: &mut ReorderFactory,
    advisor: &dyn LayoutAdvisor,
    node: NodeId,
    dir: Direction,
) {
    let fmt = match formats.get(node) {
        Some(f) => f,
        None => return,
    };

    let next_list: Vec<NodeId> = dir.next_nodes(graph, node).to_vec();
    for next in next_list {
        if !graph.is_in_data_flow(next) {
            continue;
        }

        let next_fmt = formats.get(next);
        if next_fmt == Some(fmt) {
            continue;
        }
        // Conversions the sink can absorb into its kernel are skipped.
        if let Some(next_fmt) = next_fmt {
            if next_fmt.is_concrete() {
                let (first_node, second_node) = dir.order(node, next);
                let (first_fmt, second_fmt) = dir.order(fmt, next_fmt);
                if advisor.can_fuse_reorder(graph, first_node, second_node, first_fmt, second_fmt)
                {
                    continue;
                }
            }
        }

        let current_layout = graph.output_layout(node);
        let next_layout = graph.output_layout(next);
        // Both layouts derive from the source side; the iterated node's
        // side of the conversion gets its chosen format.
        let (first_layout, _) = dir.order(current_layout, next_layout);
        let mut in_layout = first_layout;
        let mut out_layout = first_layout;
        match dir {
            Direction::Forward => in_layout.format = fmt,
            Direction::Backward => out_layout.format = fmt,
        }

        let (source, sink) = dir.order(node, next);
        if let Some((reorder, existing)) = factory.get_reorder(graph, source, in_layout, out_layout)
        {
            graph.add_intermediate(reorder, sink, source, !existing);
        }
    }
}

/// Walk once forward in processing order and once backward in reverse
/// order, splicing reorders onto every remaining mismatched edge. Image
/// formats are handled by the runtime and skipped entirely.
pub fn insert_reorders(
    graph: &mut Graph,
    formats: &FormatMap,
    factory: &mut ReorderFactory,
    advisor: &dyn LayoutAdvisor,
) {
    let forward: Vec<NodeId> = graph.processing_order().to_vec();
    for &node in &forward {
        match formats.get(node) {
            Some(f) if f.is_concrete() && !f.is_image() => {}
            _ => continue,
        }
        insert_reorders_in_dir(graph, formats, factory, advisor, node, Direction::Forward);
    }

    let backward: Vec<NodeId> = graph.processing_order().iter().rev().copied().collect();
    for &node in &backward {
        match formats.get(node) {
            Some(f) if f.is_concrete() && !f.is_image() => {}
            _ => continue,
        }
        insert_reorders_in_dir(graph, formats, factory, advisor, node, Direction::Backward);
    }
}

/// Insert reorders, then make the chosen formats effective: each concrete
/// non-image assignment becomes the node's implementation format, and
/// output layouts are recomputed in processing order.
pub fn materialize(
    graph: &mut Graph,
    formats: &FormatMap,
    factory: &mut ReorderFactory,
    advisor: &dyn LayoutAdvisor,
) {
    insert_reorders(graph, formats, factory, advisor);

    let order: Vec<NodeId> = graph.processing_order().to_vec();
    for node in order {
        if let Some(fmt) = formats.get(node) {
            if fmt.is_concrete() && !fmt.is_image() {
                graph.node_mut(node).layout.format = fmt;
            }
        }
    }
    graph.recalc_output_layouts(true);
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// Result of a full pass run.
#[derive(Debug)]
pub struct ReorderResult {
    /// Final format selection (inspection and reporting).
    pub formats: FormatMap,
    /// Conversion statistics gathered before materialization.
    pub stats: ReorderStats,
}

/// Run the complete pass: collect, override, propagate, minimize,
/// materialize, and the per-kind input adjustments.
pub fn reorder_inputs(
    graph: &mut Graph,
    advisor: &dyn LayoutAdvisor,
    factory: &mut ReorderFactory,
) -> ReorderResult {
    let mut formats = collect_preferred_formats(graph, advisor);
    crate::overrides::apply_fc_overrides(graph, &mut formats, advisor);
    propagate_formats(graph, &mut formats, advisor);
    minimize_local_reorders(graph, &mut formats, advisor);
    crate::overrides::apply_int8_mvn_workaround(graph, &mut formats, advisor);
    let stats = collect_stats(graph, &formats, advisor);
    materialize(graph, &formats, factory, advisor);
    crate::overrides::apply_input_reorders(graph, factory, advisor);
    ReorderResult { formats, stats }
}

// ── Verification ────────────────────────────────────────────────────────────

/// Postcondition certificate for the whole pass.
#[derive(Debug, Clone, Copy)]
pub struct ReorderCert {
    /// Every remaining data-flow edge whose endpoints chose different
    /// concrete non-image formats is fusible.
    pub r1_mismatched_edges_resolved: bool,
    /// Every concrete assignment is supported on its node.
    pub r2_formats_supported: bool,
    /// The processing order is still topological after splicing.
    pub r3_processing_order_topological: bool,
}

impl StageCert for ReorderCert {
    fn all_pass(&self) -> bool {
        self.r1_mismatched_edges_resolved
            && self.r2_formats_supported
            && self.r3_processing_order_topological
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            (
                "R1_mismatched_edges_resolved",
                self.r1_mismatched_edges_resolved,
            ),
            ("R2_formats_supported", self.r2_formats_supported),
            (
                "R3_processing_order_topological",
                self.r3_processing_order_topological,
            ),
        ]
    }
}

/// Verify pass postconditions. Pure; the pipeline runner synthesizes
/// error diagnostics from failed obligations.
pub fn verify_reorder(
    graph: &Graph,
    formats: &FormatMap,
    advisor: &dyn LayoutAdvisor,
) -> ReorderCert {
    let mut r1 = true;
    let mut r2 = true;

    for &node in graph.processing_order() {
        let fmt = match formats.get(node) {
            Some(f) if f.is_concrete() => f,
            _ => continue,
        };
        if !advisor.is_format_supported(graph, node, fmt) {
            r2 = false;
        }
        if fmt.is_image() {
            continue;
        }
        for &user in graph.users(node) {
            if !graph.is_in_data_flow(user) {
                continue;
            }
            let user_fmt = match formats.get(user) {
                Some(f) if f.is_concrete() && !f.is_image() => f,
                _ => continue,
            };
            if user_fmt != fmt
                && !advisor.can_fuse_reorder(graph, node, user, fmt, user_fmt)
            {
                r1 = false;
            }
        }
    }

    let mut position: HashMap<NodeId, usize> = HashMap::new();
    for (i, &node) in graph.processing_order().iter().enumerate() {
        position.insert(node, i);
    }
    let r3 = graph.processing_order().iter().all(|&node| {
        graph.dependencies(node).iter().all(|dep| {
            match (position.get(dep), position.get(&node)) {
                (Some(&d), Some(&n)) => d < n,
                _ => false,
            }
        })
    });

    ReorderCert {
        r1_mismatched_edges_resolved: r1,
        r2_formats_supported: r2,
        r3_processing_order_topological: r3,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
