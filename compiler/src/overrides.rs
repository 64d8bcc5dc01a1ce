// overrides.rs — Domain-specific format adjustments
//
// Three rule groups the core assignment must honor, isolated here so they
// can be retired independently of the algorithm:
//   1. fully-connected output demotion to bfyx at blocked-format
//      boundaries (runs before propagation);
//   2. the int8 mvn→conv→mvn rewrite for b_fs_yx_fsv16 networks (runs
//      after minimization; its coordinates are known-network fixtures);
//   3. per-kind input reorders for detection-output, binary-convolution
//      and deconvolution (runs after materialization).
//
// Preconditions: the format map covers every data-flow node.
// Postconditions: only the listed node kinds are touched.
// Failure modes: none — rules that do not match are skipped.
// Side effects: groups 1 and 2 mutate the format map; group 3 mutates
//               the graph.

use crate::advisor::LayoutAdvisor;
use crate::direction::Direction;
use crate::factory::ReorderFactory;
use crate::graph::{Graph, NodeId, OpTag};
use crate::layout::{DataType, Format, Layout};
use crate::reorder::{can_propagate, FormatMap};

// ── Fully-connected demotion ────────────────────────────────────────────────

/// Blocked formats whose boundary at a fully-connected input justifies the
/// specialized bfyx output implementation.
const FC_OVERRIDE_FORMATS: [Format; 6] = [
    Format::FsBYxFsv32,
    Format::BFsYxFsv4,
    Format::BFsYxFsv16,
    Format::BFsYxFsv32,
    Format::BFsZyxFsv32,
    Format::ByxfAf32,
];

/// Demote fully-connected outputs to bfyx where the input-side conversion
/// from one of the blocked formats fuses and a backward propagation of
/// that format would be admissible without fusing.
pub fn apply_fc_overrides(graph: &Graph, formats: &mut FormatMap, advisor: &dyn LayoutAdvisor) {
    let order: Vec<NodeId> = graph.processing_order().to_vec();
    for node in order {
        if !graph.is_in_data_flow(node) || graph.node(node).kind.tag() != OpTag::FullyConnected {
            continue;
        }
        match formats.get(node) {
            None | Some(Format::Bfyx) => continue,
            Some(_) => {}
        }
        let input = match graph.dependencies(node).first() {
            Some(&input) => input,
            None => continue,
        };

        let override_to_bfyx = FC_OVERRIDE_FORMATS.iter().any(|&fmt| {
            advisor.can_fuse_reorder(graph, input, node, fmt, Format::Bfyx)
                && can_propagate(
                    graph,
                    formats,
                    advisor,
                    node,
                    input,
                    fmt,
                    Direction::Backward,
                    false,
                )
        });

        if override_to_bfyx {
            formats.set(node, Format::Bfyx);
        }
    }
}

// ── int8 mvn→conv→mvn rewrite ───────────────────────────────────────────────

/// Rewrite the known-bad byxf_af32 selection in the pattern
/// `mvn(i8, b_fs_yx_fsv16, 16×1280×720) → conv(3×3, out 3) →
/// mvn(bfyx, within-channel)` to b_fs_yx_fsv16 on both the convolution
/// and the consuming mvn. Active only on b_fs_yx_fsv16 networks. The
/// conversion out of af32 costs several times the convolution itself,
/// which this selection would otherwise force.
pub fn apply_int8_mvn_workaround(
    graph: &Graph,
    formats: &mut FormatMap,
    advisor: &dyn LayoutAdvisor,
) {
    if !advisor.optimization_attributes().b_fs_yx_fsv16_network {
        return;
    }

    let order: Vec<NodeId> = graph.processing_order().to_vec();
    for node in order {
        if !graph.is_in_data_flow(node) {
            continue;
        }
        let conv = match graph.node(node).kind.as_conv() {
            Some(conv) => *conv,
            None => continue,
        };
        if formats.get(node) != Some(Format::ByxfAf32) {
            continue;
        }

        let input = match graph.dependencies(node).first() {
            Some(&input) => input,
            None => continue,
        };
        let input_path = graph.output_layout(input).data_type == DataType::I8
            && graph.node(input).kind.tag() == OpTag::Mvn
            && formats.get(input) == Some(Format::BFsYxFsv16);
        if !input_path {
            continue;
        }

        let users = graph.users(node);
        if users.len() != 1 {
            continue;
        }
        let user = users[0];
        let user_mvn = match graph.node(user).kind.as_mvn() {
            Some(mvn) => *mvn,
            None => continue,
        };
        let output_path = formats.get(user) == Some(Format::Bfyx)
            && graph.users(user).len() == 1
            && !user_mvn.across_channels;
        if !output_path {
            continue;
        }

        let weights = match graph.dependencies(node).get(1) {
            Some(&weights) => weights,
            None => continue,
        };
        let in_lay = graph.output_layout(input);
        let out_lay = graph.output_layout(node);
        let wei_lay = graph.output_layout(weights);
        let correct_layouts = wei_lay.data_type == DataType::I8
            && wei_lay.size.spatial[0] == 3
            && wei_lay.size.spatial[1] == 3
            && in_lay.data_type == DataType::I8
            && out_lay.data_type == DataType::I8
            && in_lay.size.feature == 16
            && out_lay.size.feature == 3
            && in_lay.size.spatial[0] == 1280
            && out_lay.size.spatial[0] == 1280
            && in_lay.size.spatial[1] == 720
            && out_lay.size.spatial[1] == 720;
        if !correct_layouts {
            continue;
        }

        if !conv.is_default() {
            continue;
        }

        formats.set(node, Format::BFsYxFsv16);
        formats.set(user, Format::BFsYxFsv16);
    }
}

// ── Per-kind input reorders ─────────────────────────────────────────────────

/// After reorder insertion and layout recomputation, adjust inputs of the
/// kinds with fixed runtime expectations: detection-output wants every
/// input as (f32, bfyx), binary-convolution wants packed bin elements on
/// its first input, deconvolution wants its first input in the preferred
/// zyx-blocked format when the advisor picked one.
pub fn apply_input_reorders(
    graph: &mut Graph,
    factory: &mut ReorderFactory,
    advisor: &dyn LayoutAdvisor,
) {
    let order: Vec<NodeId> = graph.processing_order().to_vec();
    for node in order {
        match graph.node(node).kind.tag() {
            OpTag::DetectionOutput => {
                for i in 0..graph.dependencies(node).len() {
                    let input = graph.dependencies(node)[i];
                    let input_layout = graph.output_layout(input);
                    let desired =
                        Layout::new(DataType::F32, Format::Bfyx, input_layout.size);
                    if let Some((reorder, existing)) =
                        factory.get_reorder(graph, input, input_layout, desired)
                    {
                        graph.add_intermediate_at(reorder, node, i, !existing);
                    }
                }
            }
            OpTag::BinaryConvolution => {
                let input = match graph.dependencies(node).first() {
                    Some(&input) => input,
                    None => continue,
                };
                let input_layout = graph.output_layout(input);
                let desired = input_layout.with_data_type(DataType::Bin);
                if let Some((reorder, existing)) =
                    factory.get_reorder(graph, input, input_layout, desired)
                {
                    graph.add_intermediate_at(reorder, node, 0, !existing);
                }
            }
            OpTag::Deconvolution => {
                let preferred = advisor.preferred_format(graph, node);
                if preferred != Format::BFsZyxFsv16 && preferred != Format::BsFsZyxBsv16Fsv16 {
                    continue;
                }
                let input = match graph.dependencies(node).first() {
                    Some(&input) => input,
                    None => continue,
                };
                let input_layout = graph.output_layout(input);
                let desired = input_layout.with_format(preferred);
                if let Some((reorder, existing)) =
                    factory.get_reorder(graph, input, input_layout, desired)
                {
                    graph.add_intermediate_at(reorder, node, 0, !existing);
                }
            }
            _ => {}
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
