// pipeline.rs — Stage orchestration and provenance
//
// Runs the minimal stage prefix for a given terminal StageId with
// per-stage timing, verifies the pass certificate after materialization,
// and synthesizes diagnostics from failed obligations.
//
// Preconditions: graph, advisor, and factory are set up by the caller.
// Postconditions: all stages in required_stages(terminal) have run, or
//                 has_error is set.
// Failure modes: certificate obligations failing after materialization.
// Side effects: calls on_stage_complete after each stage for immediate
//               display; verbose timing lines on stderr.

use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::advisor::{LayoutAdvisor, RuleSet};
use crate::diag::{DiagLevel, Diagnostic};
use crate::factory::ReorderFactory;
use crate::graph::Graph;
use crate::overrides;
use crate::pass::{descriptor, required_stages, StageCert, StageId};
use crate::reorder::{
    collect_preferred_formats, collect_stats, materialize, minimize_local_reorders,
    propagate_formats, verify_reorder, FormatMap, ReorderStats,
};

// ── Result ─────────────────────────────────────────────────────────────────

/// Outcome of a pipeline run: the final format selection, conversion
/// statistics (materialize runs only), and accumulated diagnostics.
pub struct PipelineResult {
    pub formats: FormatMap,
    pub stats: Option<ReorderStats>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for hermetic builds and cache-key use.
///
/// `graph_hash`: SHA-256 of the graph's canonical compact JSON.
/// `rules_fingerprint`: SHA-256 of the rule set's canonical compact JSON.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub graph_hash: [u8; 32],
    pub rules_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    /// Hex string of the graph hash (64 characters).
    pub fn graph_hash_hex(&self) -> String {
        bytes_to_hex(&self.graph_hash)
    }

    /// Hex string of the rules fingerprint (64 characters).
    pub fn rules_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.rules_fingerprint)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"graph_hash\": \"{}\",\n  \"rules_fingerprint\": \"{}\",\n  \"manifest_schema_version\": 1,\n  \"compiler_version\": \"{}\"\n}}\n",
            self.graph_hash_hex(),
            self.rules_fingerprint_hex(),
            self.compiler_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(text: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance from the graph and rule set canonical JSON forms,
/// so the hashes are independent of display formatting.
pub fn compute_provenance(graph: &Graph, rules: &RuleSet) -> Provenance {
    Provenance {
        graph_hash: sha256(&graph.canonical_json()),
        rules_fingerprint: sha256(&rules.canonical_json()),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal stage prefix to produce `terminal`.
///
/// Per-stage sequence: execute → on_stage_complete(callback) → verbose →
/// error check. The certificate is verified after Materialize; failed
/// obligations become error diagnostics.
pub fn run_pipeline(
    graph: &mut Graph,
    advisor: &dyn LayoutAdvisor,
    factory: &mut ReorderFactory,
    terminal: StageId,
    verbose: bool,
    mut on_stage_complete: impl FnMut(StageId, &[Diagnostic]),
) -> PipelineResult {
    let stages = required_stages(terminal);

    let mut formats = FormatMap::new();
    let mut stats = None;
    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let mut has_error = false;

    for &stage in &stages {
        let t = Instant::now();
        match stage {
            StageId::Collect => {
                formats = collect_preferred_formats(graph, advisor);
            }
            StageId::Override => {
                overrides::apply_fc_overrides(graph, &mut formats, advisor);
            }
            StageId::Propagate => {
                propagate_formats(graph, &mut formats, advisor);
            }
            StageId::Minimize => {
                minimize_local_reorders(graph, &mut formats, advisor);
                // Needs settled assignments, so it runs here rather than
                // with the pre-propagation overrides.
                overrides::apply_int8_mvn_workaround(graph, &mut formats, advisor);
            }
            StageId::Materialize => {
                // Statistics count conversions before they are spliced in.
                stats = Some(collect_stats(graph, &formats, advisor));
                materialize(graph, &formats, factory, advisor);
                overrides::apply_input_reorders(graph, factory, advisor);
            }
        }
        let elapsed = t.elapsed();

        let mut diags: Vec<Diagnostic> = Vec::new();
        if stage == StageId::Materialize {
            let cert = verify_reorder(graph, &formats, advisor);
            if !cert.all_pass() {
                let failed: Vec<_> = cert
                    .obligations()
                    .iter()
                    .filter(|(_, ok)| !ok)
                    .map(|(name, _)| *name)
                    .collect();
                diags.push(Diagnostic::new(
                    DiagLevel::Error,
                    format!("reorder verification failed: {}", failed.join(", ")),
                ));
            }
        }

        on_stage_complete(stage, &diags);
        let is_err = diags.iter().any(|d| d.level == DiagLevel::Error);
        diagnostics.extend(diags);
        if verbose {
            eprintln!(
                "tlc: {} complete, {:.1}ms",
                descriptor(stage).name,
                elapsed.as_secs_f64() * 1000.0
            );
        }
        if is_err {
            has_error = true;
            break;
        }
    }

    PipelineResult {
        formats,
        stats,
        diagnostics,
        has_error,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::RuleAdvisor;
    use crate::graph::{NodeKind, OpTag};
    use crate::layout::{DataType, Format, Layout, TensorShape};

    fn lay(fmt: Format) -> Layout {
        Layout::new(DataType::F32, fmt, TensorShape::new(1, 8, 4, 4))
    }

    fn chain(rules: &mut RuleSet) -> Graph {
        let mut graph = Graph::new();
        let a = graph.add("a", NodeKind::Input, lay(Format::Bfyx), &[]);
        let b = graph.add("b", NodeKind::Pooling, lay(Format::Bfyx), &[a]);
        graph.add("c", NodeKind::Eltwise, lay(Format::Bfyx), &[b]);
        rules
            .prefer_node("a", Format::BFsYxFsv16)
            .prefer_node("c", Format::Yxfb);
        graph
    }

    #[test]
    fn full_run_visits_all_stages_in_order() {
        let mut rules = RuleSet::new();
        let mut graph = chain(&mut rules);
        let advisor = RuleAdvisor::new(rules);
        let mut factory = ReorderFactory::new();

        let mut seen = Vec::new();
        let result = run_pipeline(
            &mut graph,
            &advisor,
            &mut factory,
            StageId::Materialize,
            false,
            |stage, _| seen.push(stage),
        );

        assert_eq!(
            seen,
            vec![
                StageId::Collect,
                StageId::Override,
                StageId::Propagate,
                StageId::Minimize,
                StageId::Materialize,
            ]
        );
        assert!(!result.has_error, "diags: {:?}", result.diagnostics);
        assert!(result.stats.is_some());
    }

    #[test]
    fn minimize_terminal_leaves_graph_unspliced() {
        let mut rules = RuleSet::new();
        let mut graph = chain(&mut rules);
        let advisor = RuleAdvisor::new(rules);
        let mut factory = ReorderFactory::new();
        let before = graph.len();

        let result = run_pipeline(
            &mut graph,
            &advisor,
            &mut factory,
            StageId::Minimize,
            false,
            |_, _| {},
        );

        assert_eq!(graph.len(), before);
        assert!(result.stats.is_none());
        assert!(!result.formats.is_empty());
        let reorders = graph
            .processing_order()
            .iter()
            .filter(|&&n| graph.node(n).kind.tag() == OpTag::Reorder)
            .count();
        assert_eq!(reorders, 0);
    }

    #[test]
    fn inconsistent_advisor_surfaces_cert_failure() {
        // The advisor prefers a format it does not support: R2 fails and
        // the runner reports it as an error diagnostic.
        let mut rules = RuleSet::new();
        let mut graph = chain(&mut rules);
        rules.forbid_node("a", Format::BFsYxFsv16);
        let advisor = RuleAdvisor::new(rules);
        let mut factory = ReorderFactory::new();

        let result = run_pipeline(
            &mut graph,
            &advisor,
            &mut factory,
            StageId::Materialize,
            false,
            |_, _| {},
        );

        assert!(result.has_error);
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("R2_formats_supported")));
    }

    #[test]
    fn provenance_is_stable_and_input_sensitive() {
        let mut rules1 = RuleSet::new();
        let graph1 = chain(&mut rules1);
        let mut rules2 = RuleSet::new();
        let graph2 = chain(&mut rules2);

        let p1 = compute_provenance(&graph1, &rules1);
        let p2 = compute_provenance(&graph2, &rules2);
        assert_eq!(p1.graph_hash_hex(), p2.graph_hash_hex());
        assert_eq!(p1.rules_fingerprint_hex(), p2.rules_fingerprint_hex());

        rules2.prefer_node("b", Format::Byxf);
        let p3 = compute_provenance(&graph2, &rules2);
        assert_ne!(p1.rules_fingerprint_hex(), p3.rules_fingerprint_hex());
        assert_eq!(p1.graph_hash_hex(), p3.graph_hash_hex());
    }

    #[test]
    fn provenance_json_shape() {
        let mut rules = RuleSet::new();
        let graph = chain(&mut rules);
        let p = compute_provenance(&graph, &rules);
        let json = p.to_json();
        assert!(json.contains("\"graph_hash\""));
        assert!(json.contains("\"rules_fingerprint\""));
        assert!(json.contains("\"manifest_schema_version\": 1"));
        assert_eq!(p.graph_hash_hex().len(), 64);
    }
}
