// End-to-end pipeline tests over JSON manifests: the same surface the
// `tlc` binary drives. Scenarios cover uniform chains, propagation
// through unconstrained regions, blocked propagation, the override
// rules, and local minimization.

use tlc::advisor::{RuleAdvisor, RuleSet};
use tlc::factory::ReorderFactory;
use tlc::graph::{Graph, OpTag};
use tlc::layout::Format;
use tlc::pass::StageId;
use tlc::pipeline::{compute_provenance, run_pipeline};
use tlc::reorder::FormatMap;

// ── Helpers ─────────────────────────────────────────────────────────────────

fn run_full(graph: &mut Graph, rules: RuleSet) -> (FormatMap, usize) {
    let advisor = RuleAdvisor::new(rules);
    let mut factory = ReorderFactory::new();
    let result = run_pipeline(
        graph,
        &advisor,
        &mut factory,
        StageId::Materialize,
        false,
        |_, _| {},
    );
    assert!(
        !result.has_error,
        "pipeline diagnostics: {:?}",
        result.diagnostics
    );
    let reorders = graph
        .processing_order()
        .iter()
        .filter(|&&n| graph.node(n).kind.tag() == OpTag::Reorder)
        .count();
    (result.formats, reorders)
}

fn fmt_of(graph: &Graph, formats: &FormatMap, name: &str) -> Format {
    formats
        .get(graph.find(name).unwrap_or_else(|| panic!("node {name}")))
        .unwrap_or_else(|| panic!("no format for {name}"))
}

const CHAIN4: &str = r#"{"schema":1,"nodes":[
    {"name":"a","kind":"input","data_type":"f32","format":"bfyx","shape":[1,16,32,32]},
    {"name":"b","kind":"pooling","data_type":"f32","format":"bfyx","shape":[1,16,16,16],"inputs":["a"]},
    {"name":"c","kind":"eltwise","data_type":"f32","format":"bfyx","shape":[1,16,16,16],"inputs":["b"]},
    {"name":"d","kind":"pooling","data_type":"f32","format":"bfyx","shape":[1,16,8,8],"inputs":["c"]}
]}"#;

// ── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn uniform_preference_chain_needs_no_reorders() {
    let mut graph = Graph::from_manifest(CHAIN4).unwrap();
    let rules = RuleSet::from_manifest(
        r#"{"schema":1,"preferences":[
            {"format":"bfyx"}
        ]}"#,
    )
    .unwrap();

    let (formats, reorders) = run_full(&mut graph, rules);
    for name in ["a", "b", "c", "d"] {
        assert_eq!(fmt_of(&graph, &formats, name), Format::Bfyx);
    }
    assert_eq!(reorders, 0);
}

#[test]
fn propagation_through_unconstrained_middle() {
    // fsv16 at both ends propagates through the unconstrained middle.
    let mut graph = Graph::from_manifest(CHAIN4).unwrap();
    let rules = RuleSet::from_manifest(
        r#"{"schema":1,"preferences":[
            {"node":"a","format":"b_fs_yx_fsv16"},
            {"node":"d","format":"b_fs_yx_fsv16"}
        ]}"#,
    )
    .unwrap();

    let (formats, reorders) = run_full(&mut graph, rules);
    for name in ["a", "b", "c", "d"] {
        assert_eq!(fmt_of(&graph, &formats, name), Format::BFsYxFsv16);
    }
    assert_eq!(reorders, 0);
}

#[test]
fn blocked_propagation_falls_back_and_reorders() {
    // fsv16 unsupported on c. The ends keep their preference, the middle
    // settles via the local metric, and two conversions materialize.
    let mut graph = Graph::from_manifest(CHAIN4).unwrap();
    let rules = RuleSet::from_manifest(
        r#"{"schema":1,
            "preferences":[
                {"node":"a","format":"b_fs_yx_fsv16"},
                {"node":"d","format":"b_fs_yx_fsv16"}
            ],
            "unsupported":[
                {"node":"c","format":"b_fs_yx_fsv16"}
            ]}"#,
    )
    .unwrap();

    let (formats, reorders) = run_full(&mut graph, rules);
    assert_eq!(fmt_of(&graph, &formats, "a"), Format::BFsYxFsv16);
    assert_eq!(fmt_of(&graph, &formats, "d"), Format::BFsYxFsv16);
    // b joins the fsv16 side (one conversion beats two); c cannot.
    assert_eq!(fmt_of(&graph, &formats, "b"), Format::BFsYxFsv16);
    assert_eq!(fmt_of(&graph, &formats, "c"), Format::Bfyx);
    assert_eq!(reorders, 2);

    // The conversions sit on b→c and c→d.
    let c = graph.find("c").unwrap();
    let d = graph.find("d").unwrap();
    assert_eq!(
        graph.node(graph.dependencies(c)[0]).kind.tag(),
        OpTag::Reorder
    );
    assert_eq!(
        graph.node(graph.dependencies(d)[0]).kind.tag(),
        OpTag::Reorder
    );
}

#[test]
fn fully_connected_override_demotes_to_bfyx() {
    // Blocked-format boundary at the fully-connected input.
    let mut graph = Graph::from_manifest(
        r#"{"schema":1,"nodes":[
            {"name":"input","kind":"input","data_type":"f32","format":"b_fs_yx_fsv16","shape":[1,64,7,7]},
            {"name":"fc","kind":"fully_connected","data_type":"f32","format":"bfyx","shape":[1,10,1,1],"inputs":["input"]}
        ]}"#,
    )
    .unwrap();
    let rules = RuleSet::from_manifest(
        r#"{"schema":1,
            "preferences":[
                {"node":"input","format":"b_fs_yx_fsv16"},
                {"node":"fc","format":"yxfb"}
            ],
            "fusions":[
                {"consumer_kind":"fully_connected","from":"b_fs_yx_fsv16","to":"bfyx"}
            ]}"#,
    )
    .unwrap();

    let (formats, _) = run_full(&mut graph, rules);
    assert_eq!(fmt_of(&graph, &formats, "fc"), Format::Bfyx);
}

#[test]
fn int8_mvn_conv_mvn_pattern_rewritten() {
    // The exact 16→3 feature, 1280×720 int8 fixture with the network
    // flag set rewrites both the convolution and the consuming mvn.
    let mut graph = Graph::from_manifest(
        r#"{"schema":1,"nodes":[
            {"name":"src","kind":"input","data_type":"i8","format":"bfyx","shape":[1,16,1280,720]},
            {"name":"mvn_in","kind":"mvn","data_type":"i8","format":"bfyx","shape":[1,16,1280,720],"inputs":["src"]},
            {"name":"weights","kind":"constant","data_type":"i8","format":"bfyx","shape":[3,16,3,3]},
            {"name":"conv","kind":"convolution","data_type":"i8","format":"bfyx","shape":[1,3,1280,720],"inputs":["mvn_in","weights"]},
            {"name":"mvn_out","kind":"mvn","data_type":"i8","format":"bfyx","shape":[1,3,1280,720],"inputs":["conv"],"mvn":{"across_channels":false}},
            {"name":"sink","kind":"pooling","data_type":"i8","format":"bfyx","shape":[1,3,1280,720],"inputs":["mvn_out"]}
        ]}"#,
    )
    .unwrap();
    let rules = RuleSet::from_manifest(
        r#"{"schema":1,
            "attributes":{"b_fs_yx_fsv16_network":true},
            "preferences":[
                {"node":"mvn_in","format":"b_fs_yx_fsv16"},
                {"node":"conv","format":"byxf_af32"},
                {"node":"mvn_out","format":"bfyx"}
            ]}"#,
    )
    .unwrap();

    let (formats, _) = run_full(&mut graph, rules);
    assert_eq!(fmt_of(&graph, &formats, "conv"), Format::BFsYxFsv16);
    assert_eq!(fmt_of(&graph, &formats, "mvn_out"), Format::BFsYxFsv16);
}

#[test]
fn local_minimization_prefers_majority_side() {
    // One predecessor bfyx, two users fsv16: count 1 beats count 2.
    let mut graph = Graph::from_manifest(
        r#"{"schema":1,"nodes":[
            {"name":"pred","kind":"input","data_type":"f32","format":"bfyx","shape":[1,16,8,8]},
            {"name":"x","kind":"concat","data_type":"f32","format":"bfyx","shape":[1,16,8,8],"inputs":["pred"]},
            {"name":"u1","kind":"pooling","data_type":"f32","format":"bfyx","shape":[1,16,4,4],"inputs":["x"]},
            {"name":"u2","kind":"pooling","data_type":"f32","format":"bfyx","shape":[1,16,4,4],"inputs":["x"]}
        ]}"#,
    )
    .unwrap();
    let rules = RuleSet::from_manifest(
        r#"{"schema":1,"preferences":[
            {"node":"pred","format":"bfyx"},
            {"node":"u1","format":"b_fs_yx_fsv16"},
            {"node":"u2","format":"b_fs_yx_fsv16"}
        ]}"#,
    )
    .unwrap();

    let (formats, _) = run_full(&mut graph, rules);
    assert_eq!(fmt_of(&graph, &formats, "x"), Format::BFsYxFsv16);
}

// ── Reproducibility ─────────────────────────────────────────────────────────

#[test]
fn transformed_manifest_is_reproducible() {
    let emit = || {
        let mut graph = Graph::from_manifest(CHAIN4).unwrap();
        let rules = RuleSet::from_manifest(
            r#"{"schema":1,
                "preferences":[
                    {"node":"a","format":"b_fs_yx_fsv16"},
                    {"node":"d","format":"yxfb"}
                ],
                "unsupported":[{"node":"c","format":"b_fs_yx_fsv16"}]}"#,
        )
        .unwrap();
        run_full(&mut graph, rules);
        graph.generate_manifest()
    };
    assert_eq!(emit(), emit());
}

#[test]
fn provenance_matches_across_reloads() {
    let graph1 = Graph::from_manifest(CHAIN4).unwrap();
    let graph2 = Graph::from_manifest(&graph1.generate_manifest()).unwrap();
    let rules = RuleSet::new();
    assert_eq!(
        compute_provenance(&graph1, &rules).graph_hash_hex(),
        compute_provenance(&graph2, &rules).graph_hash_hex()
    );
}

#[test]
fn second_pass_over_transformed_graph_is_stable() {
    let mut graph = Graph::from_manifest(CHAIN4).unwrap();
    let rules_json = r#"{"schema":1,
        "preferences":[
            {"node":"a","format":"b_fs_yx_fsv16"},
            {"node":"d","format":"yxfb"}
        ],
        "unsupported":[
            {"node":"b","format":"yxfb"},
            {"node":"c","format":"b_fs_yx_fsv16"}
        ]}"#;

    let (_, first_reorders) = run_full(&mut graph, RuleSet::from_manifest(rules_json).unwrap());
    assert!(first_reorders > 0);
    let len_after_first = graph.len();

    let (_, second_reorders) = run_full(&mut graph, RuleSet::from_manifest(rules_json).unwrap());
    assert_eq!(graph.len(), len_after_first);
    assert_eq!(second_reorders, first_reorders);
}

#[test]
fn formats_only_run_reports_selection_without_splicing() {
    let mut graph = Graph::from_manifest(CHAIN4).unwrap();
    let rules = RuleSet::from_manifest(
        r#"{"schema":1,"preferences":[{"node":"a","format":"b_fs_yx_fsv16"}]}"#,
    )
    .unwrap();
    let advisor = RuleAdvisor::new(rules);
    let mut factory = ReorderFactory::new();

    let result = run_pipeline(
        &mut graph,
        &advisor,
        &mut factory,
        StageId::Minimize,
        false,
        |_, _| {},
    );

    assert_eq!(graph.len(), 4);
    let entries = result.formats.entries(&graph);
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0], ("a", Format::BFsYxFsv16));
}
