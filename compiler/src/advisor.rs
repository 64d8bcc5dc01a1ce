// advisor.rs — Layout advisor interface and table-driven rules
//
// The reorder pass consumes format decisions from an external advisor: a
// per-node preferred format, a format support predicate, a reorder fusion
// predicate, and a bag of network-level attribute flags. `LayoutAdvisor`
// is that contract; `RuleAdvisor` is a table-driven implementation over a
// `RuleSet` loaded from a JSON manifest (schema v1) or built in code.
//
// Preconditions: rule manifests are schema v1.
// Postconditions: advisor queries are pure and deterministic.
// Failure modes: manifest loading returns `RuleError`.
// Side effects: none.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::graph::{Graph, NodeId, OpTag};
use crate::layout::Format;

// ── Advisor contract ────────────────────────────────────────────────────────

/// Network-level flags read by override rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationAttributes {
    pub b_fs_yx_fsv16_network: bool,
    pub b_fs_zyx_fsv16_network: bool,
    pub fs_b_yx_fsv32_network: bool,
}

/// External oracle ranking formats per node. Trusted for correctness;
/// the pass only asks, never validates.
pub trait LayoutAdvisor {
    /// Preferred format for a node. `Format::Any` means no preference.
    fn preferred_format(&self, graph: &Graph, node: NodeId) -> Format;

    /// Whether the node can be implemented with the given format.
    fn is_format_supported(&self, graph: &Graph, node: NodeId, format: Format) -> bool;

    /// Whether a conversion on the edge `producer → consumer`, turning
    /// `producer_fmt` into `consumer_fmt`, can be absorbed into the
    /// consumer's implementation at no cost.
    fn can_fuse_reorder(
        &self,
        graph: &Graph,
        producer: NodeId,
        consumer: NodeId,
        producer_fmt: Format,
        consumer_fmt: Format,
    ) -> bool;

    fn optimization_attributes(&self) -> OptimizationAttributes;
}

// ── Rules ───────────────────────────────────────────────────────────────────

/// Preferred-format rule. First matching rule wins; `node` matches by
/// graph node name, `kind` by operator tag, unset fields match anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<OpTag>,
    pub format: Format,
}

/// Marks a (node-or-kind, format) combination as unsupported. Anything
/// not matched by an entry is supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<OpTag>,
    pub format: Format,
}

/// Declares a fusible conversion. Unset fields are wildcards; a rule fires
/// when the consumer kind, producer kind, and both formats all match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_kind: Option<OpTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_kind: Option<OpTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Format>,
}

/// The full rule table backing `RuleAdvisor`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub attributes: OptimizationAttributes,
    pub preferences: Vec<PreferenceRule>,
    pub unsupported: Vec<SupportRule>,
    pub fusions: Vec<FusionRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet::default()
    }

    /// Prefer `format` for the named node.
    pub fn prefer_node(&mut self, node: impl Into<String>, format: Format) -> &mut Self {
        self.preferences.push(PreferenceRule {
            node: Some(node.into()),
            kind: None,
            format,
        });
        self
    }

    /// Prefer `format` for every node of the given kind.
    pub fn prefer_kind(&mut self, kind: OpTag, format: Format) -> &mut Self {
        self.preferences.push(PreferenceRule {
            node: None,
            kind: Some(kind),
            format,
        });
        self
    }

    /// Mark `format` unsupported on the named node.
    pub fn forbid_node(&mut self, node: impl Into<String>, format: Format) -> &mut Self {
        self.unsupported.push(SupportRule {
            node: Some(node.into()),
            kind: None,
            format,
        });
        self
    }

    /// Mark `format` unsupported on every node of the given kind.
    pub fn forbid_kind(&mut self, kind: OpTag, format: Format) -> &mut Self {
        self.unsupported.push(SupportRule {
            node: None,
            kind: Some(kind),
            format,
        });
        self
    }

    /// Declare a fusible conversion into consumers of the given kind.
    pub fn fuse_into(&mut self, consumer_kind: OpTag, from: Format, to: Format) -> &mut Self {
        self.fusions.push(FusionRule {
            producer_kind: None,
            consumer_kind: Some(consumer_kind),
            from: Some(from),
            to: Some(to),
        });
        self
    }

    pub fn push_fusion(&mut self, rule: FusionRule) -> &mut Self {
        self.fusions.push(rule);
        self
    }

    /// Load rules from a JSON manifest file (schema v1).
    pub fn load_manifest(path: &Path) -> Result<RuleSet, RuleError> {
        let source = std::fs::read_to_string(path).map_err(|e| RuleError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        RuleSet::from_manifest(&source)
    }

    pub fn from_manifest(source: &str) -> Result<RuleSet, RuleError> {
        let manifest: RuleManifest =
            serde_json::from_str(source).map_err(|e| RuleError::ParseError {
                message: e.to_string(),
            })?;
        if manifest.schema != 1 {
            return Err(RuleError::BadSchema {
                found: manifest.schema,
            });
        }
        Ok(manifest.rules)
    }

    /// Pretty-printed manifest for display.
    pub fn generate_manifest(&self) -> String {
        let manifest = RuleManifest {
            schema: 1,
            rules: self.clone(),
        };
        serde_json::to_string_pretty(&manifest).expect("rule serialization should not fail")
    }

    /// Compact canonical JSON for fingerprint computation.
    pub fn canonical_json(&self) -> String {
        let manifest = RuleManifest {
            schema: 1,
            rules: self.clone(),
        };
        serde_json::to_string(&manifest).expect("rule serialization should not fail")
    }
}

/// Top-level structure of a rule manifest (schema v1).
#[derive(Debug, Serialize, Deserialize)]
struct RuleManifest {
    schema: u32,
    #[serde(flatten)]
    rules: RuleSet,
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum RuleError {
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        message: String,
    },
    BadSchema {
        found: u32,
    },
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::IoError { path, source } => write!(f, "{}: {}", path.display(), source),
            RuleError::ParseError { message } => {
                write!(f, "invalid rule manifest: {}", message)
            }
            RuleError::BadSchema { found } => write!(
                f,
                "invalid rule manifest schema (expected: 1, found: {})",
                found
            ),
        }
    }
}

impl std::error::Error for RuleError {}

// ── RuleAdvisor ─────────────────────────────────────────────────────────────

/// Table-driven `LayoutAdvisor` over a `RuleSet`.
///
/// One behavior is built in rather than table-driven: a conversion whose
/// consumer is itself a reorder node is always fusible, since consecutive
/// reorders compose into one. Without it, re-running the pass on its own
/// output would keep stacking conversions in front of existing reorders.
#[derive(Debug, Clone, Default)]
pub struct RuleAdvisor {
    rules: RuleSet,
}

impl RuleAdvisor {
    pub fn new(rules: RuleSet) -> Self {
        RuleAdvisor { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

fn matches_target(node_rule: &Option<String>, kind_rule: &Option<OpTag>, graph: &Graph, node: NodeId) -> bool {
    if let Some(name) = node_rule {
        if graph.node(node).name != *name {
            return false;
        }
    }
    if let Some(kind) = kind_rule {
        if graph.node(node).kind.tag() != *kind {
            return false;
        }
    }
    true
}

impl LayoutAdvisor for RuleAdvisor {
    fn preferred_format(&self, graph: &Graph, node: NodeId) -> Format {
        for rule in &self.rules.preferences {
            if matches_target(&rule.node, &rule.kind, graph, node) {
                return rule.format;
            }
        }
        Format::Any
    }

    fn is_format_supported(&self, graph: &Graph, node: NodeId, format: Format) -> bool {
        !self.rules.unsupported.iter().any(|rule| {
            rule.format == format && matches_target(&rule.node, &rule.kind, graph, node)
        })
    }

    fn can_fuse_reorder(
        &self,
        graph: &Graph,
        producer: NodeId,
        consumer: NodeId,
        producer_fmt: Format,
        consumer_fmt: Format,
    ) -> bool {
        if graph.node(consumer).kind.tag() == OpTag::Reorder {
            return true;
        }
        self.rules.fusions.iter().any(|rule| {
            rule.producer_kind
                .map_or(true, |k| graph.node(producer).kind.tag() == k)
                && rule
                    .consumer_kind
                    .map_or(true, |k| graph.node(consumer).kind.tag() == k)
                && rule.from.map_or(true, |f| producer_fmt == f)
                && rule.to.map_or(true, |f| consumer_fmt == f)
        })
    }

    fn optimization_attributes(&self) -> OptimizationAttributes {
        self.rules.attributes
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use crate::layout::{DataType, Layout, TensorShape};

    fn lay() -> Layout {
        Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 8, 4, 4))
    }

    fn two_node_graph() -> (Graph, NodeId, NodeId) {
        let mut graph = Graph::new();
        let a = graph.add("a", NodeKind::Input, lay(), &[]);
        let conv = graph.add(
            "conv",
            NodeKind::Convolution(Default::default()),
            lay(),
            &[a],
        );
        (graph, a, conv)
    }

    #[test]
    fn preference_defaults_to_any() {
        let (graph, a, _) = two_node_graph();
        let advisor = RuleAdvisor::default();
        assert_eq!(advisor.preferred_format(&graph, a), Format::Any);
    }

    #[test]
    fn first_matching_preference_wins() {
        let (graph, _, conv) = two_node_graph();
        let mut rules = RuleSet::new();
        rules
            .prefer_node("conv", Format::BFsYxFsv16)
            .prefer_kind(OpTag::Convolution, Format::Byxf);
        let advisor = RuleAdvisor::new(rules);
        assert_eq!(advisor.preferred_format(&graph, conv), Format::BFsYxFsv16);
    }

    #[test]
    fn kind_preference_applies_to_all_nodes_of_kind() {
        let (graph, a, conv) = two_node_graph();
        let mut rules = RuleSet::new();
        rules.prefer_kind(OpTag::Convolution, Format::Byxf);
        let advisor = RuleAdvisor::new(rules);
        assert_eq!(advisor.preferred_format(&graph, conv), Format::Byxf);
        assert_eq!(advisor.preferred_format(&graph, a), Format::Any);
    }

    #[test]
    fn support_defaults_to_true_until_forbidden() {
        let (graph, _, conv) = two_node_graph();
        let mut rules = RuleSet::new();
        rules.forbid_node("conv", Format::Yxfb);
        let advisor = RuleAdvisor::new(rules);
        assert!(!advisor.is_format_supported(&graph, conv, Format::Yxfb));
        assert!(advisor.is_format_supported(&graph, conv, Format::Bfyx));
    }

    #[test]
    fn fusion_rule_matches_formats_and_kind() {
        let (graph, a, conv) = two_node_graph();
        let mut rules = RuleSet::new();
        rules.fuse_into(OpTag::Convolution, Format::Bfyx, Format::BFsYxFsv16);
        let advisor = RuleAdvisor::new(rules);
        assert!(advisor.can_fuse_reorder(&graph, a, conv, Format::Bfyx, Format::BFsYxFsv16));
        assert!(!advisor.can_fuse_reorder(&graph, a, conv, Format::Bfyx, Format::Byxf));
        // Direction matters: producer format must match `from`.
        assert!(!advisor.can_fuse_reorder(&graph, a, conv, Format::BFsYxFsv16, Format::Bfyx));
    }

    #[test]
    fn conversions_into_reorders_always_fuse() {
        let mut graph = Graph::new();
        let a = graph.add("a", NodeKind::Input, lay(), &[]);
        let r = graph.add("r", NodeKind::Reorder(lay()), lay(), &[a]);
        let advisor = RuleAdvisor::default();
        assert!(advisor.can_fuse_reorder(&graph, a, r, Format::Byxf, Format::Bfyx));
    }

    #[test]
    fn manifest_roundtrip_preserves_rules() {
        let mut rules = RuleSet::new();
        rules
            .prefer_kind(OpTag::Convolution, Format::BFsYxFsv16)
            .forbid_kind(OpTag::DetectionOutput, Format::BFsYxFsv16)
            .fuse_into(OpTag::Convolution, Format::Bfyx, Format::BFsYxFsv16);
        rules.attributes.b_fs_yx_fsv16_network = true;

        let json = rules.generate_manifest();
        let back = RuleSet::from_manifest(&json).expect("roundtrip should parse");
        assert_eq!(back.preferences.len(), 1);
        assert_eq!(back.unsupported.len(), 1);
        assert_eq!(back.fusions.len(), 1);
        assert!(back.attributes.b_fs_yx_fsv16_network);
        assert_eq!(back.canonical_json(), rules.canonical_json());
    }

    #[test]
    fn manifest_bad_schema_rejected() {
        match RuleSet::from_manifest(r#"{"schema":3}"#) {
            Err(RuleError::BadSchema { found }) => assert_eq!(found, 3),
            other => panic!("expected BadSchema, got {:?}", other),
        }
    }

    #[test]
    fn empty_manifest_is_permissive() {
        let rules = RuleSet::from_manifest(r#"{"schema":1}"#).unwrap();
        let advisor = RuleAdvisor::new(rules);
        let (graph, a, conv) = two_node_graph();
        assert_eq!(advisor.preferred_format(&graph, conv), Format::Any);
        assert!(advisor.is_format_supported(&graph, conv, Format::Byxf));
        assert!(!advisor.can_fuse_reorder(&graph, a, conv, Format::Bfyx, Format::Byxf));
    }
}
