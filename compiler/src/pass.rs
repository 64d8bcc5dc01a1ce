// pass.rs — Stage descriptor module: metadata, dependency resolution
//
// Declares the five stages of format assignment, their dependency edges,
// and the invariants each stage establishes. Used by the pipeline runner
// to compute the minimal stage prefix for each --emit target.

use std::collections::HashSet;

// ── Stage identifiers ──────────────────────────────────────────────────────

/// Identifies each stage of the reorder pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    Collect,
    Override,
    Propagate,
    Minimize,
    Materialize,
}

// ── Stage descriptor ───────────────────────────────────────────────────────

/// Static metadata about a stage.
pub struct StageDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Stage dependencies (stages whose output this stage consumes).
    pub inputs: &'static [StageId],
    /// Invariants established by the stage (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given stage.
pub fn descriptor(id: StageId) -> StageDescriptor {
    match id {
        StageId::Collect => StageDescriptor {
            name: "collect",
            inputs: &[],
            invariants: "every data-flow node mapped to its advisor preference or ANY",
        },
        StageId::Override => StageDescriptor {
            name: "override",
            inputs: &[StageId::Collect],
            invariants: "fully-connected boundary demotions applied",
        },
        StageId::Propagate => StageDescriptor {
            name: "propagate",
            inputs: &[StageId::Override],
            invariants: "admissible extents committed, no concrete assignment overwritten",
        },
        StageId::Minimize => StageDescriptor {
            name: "minimize",
            inputs: &[StageId::Propagate],
            invariants: "local (count, volume) metric minimal at advisor-ANY nodes",
        },
        StageId::Materialize => StageDescriptor {
            name: "materialize",
            inputs: &[StageId::Minimize],
            invariants: "mismatched non-fusible edges carry a reorder, layouts recomputed",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All stage IDs in execution order.
pub const ALL_STAGES: [StageId; 5] = [
    StageId::Collect,
    StageId::Override,
    StageId::Propagate,
    StageId::Minimize,
    StageId::Materialize,
];

/// Compute the minimal ordered set of stages needed to produce `terminal`.
/// Returns stages in execution order.
pub fn required_stages(terminal: StageId) -> Vec<StageId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: StageId, visited: &mut HashSet<StageId>, order: &mut Vec<StageId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Verification certificates ──────────────────────────────────────────────

/// A stage's postcondition certificate: named obligations with outcomes.
/// The pipeline runner synthesizes error diagnostics from failures.
pub trait StageCert {
    fn all_pass(&self) -> bool;
    fn obligations(&self) -> Vec<(&'static str, bool)>;
}

// ── Tests ──────────────────────────────────────────────────────────────────
