// graph.rs — Computation graph model
//
// Arena-backed directed acyclic graph of operator nodes. The node list
// doubles as the processing order: nodes are appended in topological order
// (a node's inputs must already exist), and reorder nodes spliced onto an
// edge are inserted into the order right before their sink.
//
// Preconditions: manifest inputs reference previously declared nodes.
// Postconditions: `processing_order()` is a valid topological order.
// Failure modes: manifest loading returns `GraphError`; programmatic
//                construction with unknown ids panics (caller bug).
// Side effects: none.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::layout::{DataType, Format, Layout, TensorShape};

// ── Node identity ───────────────────────────────────────────────────────────

/// Stable identifier for a node. Index into the graph arena; allocation
/// order is deterministic, so ids are stable across identical runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

// ── Operator kinds ──────────────────────────────────────────────────────────

/// Convolution attributes. The defaults correspond to a plain dense
/// convolution; pattern-match rules only fire when every field is default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvParams {
    pub groups: u32,
    pub split: u32,
    pub deformable_groups: u32,
    pub depthwise_sep_opt: bool,
    pub transposed: bool,
    pub activations_zero_points: bool,
    pub weights_zero_points: bool,
    pub compensation: bool,
    pub dilation: [u32; 2],
}

impl Default for ConvParams {
    fn default() -> Self {
        ConvParams {
            groups: 1,
            split: 1,
            deformable_groups: 1,
            depthwise_sep_opt: false,
            transposed: false,
            activations_zero_points: false,
            weights_zero_points: false,
            compensation: false,
            dilation: [1, 1],
        }
    }
}

impl ConvParams {
    /// True when every attribute is at its default value.
    pub fn is_default(&self) -> bool {
        *self == ConvParams::default()
    }
}

/// Mean-variance normalization attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MvnParams {
    pub across_channels: bool,
}

/// The kind of a graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Network input (in data flow).
    Input,
    /// Constant side data: weights, biases. Not in data flow.
    Constant,
    Convolution(ConvParams),
    BinaryConvolution,
    Deconvolution,
    FullyConnected,
    Mvn(MvnParams),
    DetectionOutput,
    Pooling,
    Eltwise,
    Concat,
    /// Format/type conversion. Carries the target layout it produces.
    Reorder(Layout),
}

/// Serializable kind tag, shared between graph manifests and layout rule
/// manifests (rules match on tags, not on full kinds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpTag {
    Input,
    Constant,
    Convolution,
    BinaryConvolution,
    Deconvolution,
    FullyConnected,
    Mvn,
    DetectionOutput,
    Pooling,
    Eltwise,
    Concat,
    Reorder,
}

impl NodeKind {
    pub fn tag(&self) -> OpTag {
        match self {
            NodeKind::Input => OpTag::Input,
            NodeKind::Constant => OpTag::Constant,
            NodeKind::Convolution(_) => OpTag::Convolution,
            NodeKind::BinaryConvolution => OpTag::BinaryConvolution,
            NodeKind::Deconvolution => OpTag::Deconvolution,
            NodeKind::FullyConnected => OpTag::FullyConnected,
            NodeKind::Mvn(_) => OpTag::Mvn,
            NodeKind::DetectionOutput => OpTag::DetectionOutput,
            NodeKind::Pooling => OpTag::Pooling,
            NodeKind::Eltwise => OpTag::Eltwise,
            NodeKind::Concat => OpTag::Concat,
            NodeKind::Reorder(_) => OpTag::Reorder,
        }
    }

    /// Nodes carrying tensor values between operators. Constants (weights,
    /// side data) are excluded from format assignment entirely.
    pub fn is_in_data_flow(&self) -> bool {
        !matches!(self, NodeKind::Constant)
    }

    pub fn as_conv(&self) -> Option<&ConvParams> {
        match self {
            NodeKind::Convolution(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_mvn(&self) -> Option<&MvnParams> {
        match self {
            NodeKind::Mvn(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for OpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpTag::Input => "input",
            OpTag::Constant => "constant",
            OpTag::Convolution => "convolution",
            OpTag::BinaryConvolution => "binary_convolution",
            OpTag::Deconvolution => "deconvolution",
            OpTag::FullyConnected => "fully_connected",
            OpTag::Mvn => "mvn",
            OpTag::DetectionOutput => "detection_output",
            OpTag::Pooling => "pooling",
            OpTag::Eltwise => "eltwise",
            OpTag::Concat => "concat",
            OpTag::Reorder => "reorder",
        };
        write!(f, "{}", s)
    }
}

// ── Node ────────────────────────────────────────────────────────────────────

/// A graph node: operator kind, current output layout, and adjacency.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub layout: Layout,
    /// Upstream inputs, ordered (input 0 is the primary data input).
    pub dependencies: Vec<NodeId>,
    /// Downstream consumers, in connection order.
    pub users: Vec<NodeId>,
}

impl Node {
    pub fn is_in_data_flow(&self) -> bool {
        self.kind.is_in_data_flow()
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

/// The computation graph. Owns all nodes; the reorder pass only splices
/// intermediates onto existing edges and never removes nodes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    order: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    /// Append a node. Inputs must already be in the graph, which keeps the
    /// insertion order topological.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        layout: Layout,
        inputs: &[NodeId],
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for &dep in inputs {
            assert!(
                (dep.0 as usize) < self.nodes.len(),
                "input {:?} does not exist yet",
                dep
            );
        }
        self.nodes.push(Node {
            name: name.into(),
            kind,
            layout,
            dependencies: inputs.to_vec(),
            users: Vec::new(),
        });
        for &dep in inputs {
            self.nodes[dep.0 as usize].users.push(id);
        }
        self.order.push(id);
        id
    }

    /// Create a node without placing it in the processing order. Used by
    /// the reorder factory; `add_intermediate` inserts it when spliced.
    pub fn create_detached(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        layout: Layout,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            name: name.into(),
            kind,
            layout,
            dependencies: Vec::new(),
            users: Vec::new(),
        });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fixed topological processing order.
    pub fn processing_order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn dependencies(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).dependencies
    }

    pub fn users(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).users
    }

    pub fn output_layout(&self, id: NodeId) -> Layout {
        self.node(id).layout
    }

    pub fn is_in_data_flow(&self, id: NodeId) -> bool {
        self.node(id).is_in_data_flow()
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(|i| NodeId(i as u32))
    }

    /// Splice `op` onto the edge `source → sink`.
    ///
    /// With `fresh = true`, `op` is a newly created node: it is wired to
    /// `source`, inserted into the processing order right before `sink`,
    /// and replaces `source` in the sink's dependency list. With
    /// `fresh = false`, `op` is an existing shared intermediate already
    /// connected to `source`; only the sink is re-pointed at it.
    pub fn add_intermediate(&mut self, op: NodeId, sink: NodeId, source: NodeId, fresh: bool) {
        let index = self
            .node(sink)
            .dependencies
            .iter()
            .position(|&d| d == source)
            .expect("sink does not depend on source");
        self.add_intermediate_at(op, sink, index, fresh);
    }

    /// Splice `op` in front of the sink's dependency at `dep_index`.
    pub fn add_intermediate_at(&mut self, op: NodeId, sink: NodeId, dep_index: usize, fresh: bool) {
        let source = self.node(sink).dependencies[dep_index];

        self.node_mut(sink).dependencies[dep_index] = op;
        // The source keeps its user entry only while the sink still depends
        // on it through another input.
        if !self.node(sink).dependencies.contains(&source) {
            self.node_mut(source).users.retain(|&u| u != sink);
        }
        self.node_mut(op).users.push(sink);

        if fresh {
            self.node_mut(op).dependencies = vec![source];
            if !self.node(source).users.contains(&op) {
                self.node_mut(source).users.push(op);
            }
            let pos = self
                .order
                .iter()
                .position(|&n| n == sink)
                .expect("sink not in processing order");
            self.order.insert(pos, op);
        }
    }

    /// Recompute output layouts in processing order. Reorder nodes take
    /// their target layout; other nodes keep their stored layout (format
    /// assignment writes chosen formats into them directly). With
    /// `force = false`, nodes whose layout already matches are skipped.
    pub fn recalc_output_layouts(&mut self, force: bool) {
        for i in 0..self.order.len() {
            let id = self.order[i];
            if let NodeKind::Reorder(target) = self.node(id).kind {
                if force || self.node(id).layout != target {
                    self.node_mut(id).layout = target;
                }
            }
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let edges: usize = self.nodes.iter().map(|n| n.dependencies.len()).sum();
        writeln!(f, "Graph ({} nodes, {} edges)", self.nodes.len(), edges)?;
        for &id in &self.order {
            let n = self.node(id);
            writeln!(f, "  {} [{}] {}", n.name, n.kind.tag(), n.layout)?;
        }
        Ok(())
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum GraphError {
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
    DuplicateNode {
        name: String,
    },
    UnknownInput {
        node: String,
        input: String,
    },
    BadShape {
        node: String,
        rank: usize,
    },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::IoError { path, source } => {
                write!(f, "{}: {}", path.display(), source)
            }
            GraphError::ParseError { message } => {
                write!(f, "invalid graph manifest: {}", message)
            }
            GraphError::BadSchema { found } => {
                write!(
                    f,
                    "invalid graph manifest schema (expected: 1, found: {})",
                    found
                )
            }
            GraphError::DuplicateNode { name } => {
                write!(f, "duplicate node name '{}'", name)
            }
            GraphError::UnknownInput { node, input } => {
                write!(
                    f,
                    "node '{}' references unknown input '{}' (inputs must be declared first)",
                    node, input
                )
            }
            GraphError::BadShape { node, rank } => {
                write!(
                    f,
                    "node '{}' has shape of rank {} (expected 4 [b,f,x,y] or 5 [b,f,x,y,z])",
                    node, rank
                )
            }
        }
    }
}

impl std::error::Error for GraphError {}

// ── Manifest (graph.meta.json) ──────────────────────────────────────────────

/// Top-level structure of a graph manifest (schema v1).
#[derive(Debug, Serialize, Deserialize)]
pub struct GraphManifest {
    pub schema: u32,
    pub nodes: Vec<NodeManifest>,
}

/// One node entry. `shape` is `[b, f, x, y]` or `[b, f, x, y, z]`.
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeManifest {
    pub name: String,
    pub kind: OpTag,
    pub data_type: DataType,
    pub format: Format,
    pub shape: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conv: Option<ConvParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mvn: Option<MvnParams>,
}

impl Graph {
    /// Load a graph from a JSON manifest file (schema v1).
    pub fn load_manifest(path: &Path) -> Result<Graph, GraphError> {
        let source = std::fs::read_to_string(path).map_err(|e| GraphError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Graph::from_manifest(&source)
    }

    /// Build a graph from JSON manifest text.
    pub fn from_manifest(source: &str) -> Result<Graph, GraphError> {
        let manifest: GraphManifest =
            serde_json::from_str(source).map_err(|e| GraphError::ParseError {
                message: e.to_string(),
            })?;

        if manifest.schema != 1 {
            return Err(GraphError::BadSchema {
                found: manifest.schema,
            });
        }

        let mut graph = Graph::new();
        let mut by_name: HashMap<String, NodeId> = HashMap::new();

        for entry in &manifest.nodes {
            if by_name.contains_key(&entry.name) {
                return Err(GraphError::DuplicateNode {
                    name: entry.name.clone(),
                });
            }

            let size = match entry.shape.as_slice() {
                [b, f, x, y] => TensorShape::new(*b, *f, *x, *y),
                [b, f, x, y, z] => TensorShape::with_z(*b, *f, *x, *y, *z),
                other => {
                    return Err(GraphError::BadShape {
                        node: entry.name.clone(),
                        rank: other.len(),
                    })
                }
            };
            let layout = Layout::new(entry.data_type, entry.format, size);

            let mut inputs = Vec::with_capacity(entry.inputs.len());
            for input in &entry.inputs {
                match by_name.get(input) {
                    Some(&id) => inputs.push(id),
                    None => {
                        return Err(GraphError::UnknownInput {
                            node: entry.name.clone(),
                            input: input.clone(),
                        })
                    }
                }
            }

            let kind = match entry.kind {
                OpTag::Input => NodeKind::Input,
                OpTag::Constant => NodeKind::Constant,
                OpTag::Convolution => NodeKind::Convolution(entry.conv.unwrap_or_default()),
                OpTag::BinaryConvolution => NodeKind::BinaryConvolution,
                OpTag::Deconvolution => NodeKind::Deconvolution,
                OpTag::FullyConnected => NodeKind::FullyConnected,
                OpTag::Mvn => NodeKind::Mvn(entry.mvn.unwrap_or_default()),
                OpTag::DetectionOutput => NodeKind::DetectionOutput,
                OpTag::Pooling => NodeKind::Pooling,
                OpTag::Eltwise => NodeKind::Eltwise,
                OpTag::Concat => NodeKind::Concat,
                OpTag::Reorder => NodeKind::Reorder(layout),
            };

            let id = graph.add(entry.name.clone(), kind, layout, &inputs);
            by_name.insert(entry.name.clone(), id);
        }

        Ok(graph)
    }

    /// Pretty-printed JSON manifest for display and `--emit graph`.
    pub fn generate_manifest(&self) -> String {
        let manifest = self.build_manifest();
        serde_json::to_string_pretty(&manifest).expect("manifest serialization should not fail")
    }

    /// Compact canonical JSON for fingerprint computation. Node order is
    /// the processing order, so the hash is independent of display
    /// formatting but sensitive to topology.
    pub fn canonical_json(&self) -> String {
        let manifest = self.build_manifest();
        serde_json::to_string(&manifest).expect("manifest serialization should not fail")
    }

    fn build_manifest(&self) -> GraphManifest {
        let nodes = self
            .order
            .iter()
            .map(|&id| {
                let n = self.node(id);
                let mut shape = vec![
                    n.layout.size.batch,
                    n.layout.size.feature,
                    n.layout.size.spatial[0],
                    n.layout.size.spatial[1],
                ];
                if n.layout.size.spatial[2] != 1 {
                    shape.push(n.layout.size.spatial[2]);
                }
                NodeManifest {
                    name: n.name.clone(),
                    kind: n.kind.tag(),
                    data_type: n.layout.data_type,
                    format: n.layout.format,
                    shape,
                    inputs: n
                        .dependencies
                        .iter()
                        .map(|&d| self.node(d).name.clone())
                        .collect(),
                    conv: n.kind.as_conv().copied(),
                    mvn: n.kind.as_mvn().copied(),
                }
            })
            .collect();
        GraphManifest { schema: 1, nodes }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
